//! SOCKS sessions backed by tokio tasks.
//!
//! Each relay gets one task. The task connects, reports
//! [`SocksEvent::Up`], then serves read and write requests from the relay
//! independently so the two directions never wait on each other. Results
//! flow back to the reactor over one shared channel tagged with the
//! relay's id.

use super::dial::SocksDialer;
use crate::error::{RelayError, TunsocksResult};
use crate::relay::{RelayId, SocksConnector, SocksEvent, SocksRequest, SocksSession};
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Channel carrying session completions to the reactor.
pub type SessionEvents = mpsc::UnboundedSender<(RelayId, SocksEvent)>;

enum WriteCommand {
    Data(Bytes),
    Shutdown,
}

/// The relay's end of a running session task. Dropping it ends the task.
#[derive(Debug)]
pub struct SessionHandle {
    writes: mpsc::UnboundedSender<WriteCommand>,
    reads: mpsc::UnboundedSender<usize>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Spawn a session task that first awaits `connect`
    pub fn spawn<F, S>(relay: RelayId, connect: F, events: SessionEvents) -> Self
    where
        F: Future<Output = TunsocksResult<S>> + Send + 'static,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (writes, write_rx) = mpsc::unbounded_channel();
        let (reads, read_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(relay, connect, write_rx, read_rx, events));
        SessionHandle {
            writes,
            reads,
            task,
        }
    }
}

impl SocksSession for SessionHandle {
    fn send(&mut self, data: Bytes) -> Result<(), RelayError> {
        self.writes
            .send(WriteCommand::Data(data))
            .map_err(|_| RelayError::SessionGone)
    }

    fn recv(&mut self, max: usize) -> Result<(), RelayError> {
        self.reads.send(max).map_err(|_| RelayError::SessionGone)
    }

    fn shutdown_write(&mut self) -> Result<(), RelayError> {
        self.writes
            .send(WriteCommand::Shutdown)
            .map_err(|_| RelayError::SessionGone)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_session<F, S>(
    relay: RelayId,
    connect: F,
    writes: mpsc::UnboundedReceiver<WriteCommand>,
    reads: mpsc::UnboundedReceiver<usize>,
    events: SessionEvents,
) where
    F: Future<Output = TunsocksResult<S>>,
    S: AsyncRead + AsyncWrite,
{
    let stream = match connect.await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("relay {}: SOCKS connect failed: {}", relay, e);
            let _ = events.send((relay, SocksEvent::Error(e.to_string())));
            return;
        }
    };

    if events.send((relay, SocksEvent::Up)).is_err() {
        return;
    }

    let (reader, writer) = tokio::io::split(stream);
    tokio::join!(
        read_side(relay, reader, reads, events.clone()),
        write_side(relay, writer, writes, events),
    );
    trace!("relay {}: session task finished", relay);
}

async fn read_side<S: AsyncRead>(
    relay: RelayId,
    mut reader: ReadHalf<S>,
    mut requests: mpsc::UnboundedReceiver<usize>,
    events: SessionEvents,
) {
    while let Some(max) = requests.recv().await {
        let mut buf = vec![0u8; max];
        let event = match reader.read(&mut buf).await {
            Ok(0) => SocksEvent::Closed,
            Ok(n) => {
                buf.truncate(n);
                SocksEvent::RecvDone(Bytes::from(buf))
            }
            Err(e) => SocksEvent::Error(e.to_string()),
        };
        let last = !matches!(event, SocksEvent::RecvDone(_));
        if events.send((relay, event)).is_err() || last {
            return;
        }
    }
}

async fn write_side<S: AsyncWrite>(
    relay: RelayId,
    mut writer: WriteHalf<S>,
    mut commands: mpsc::UnboundedReceiver<WriteCommand>,
    events: SessionEvents,
) {
    while let Some(command) = commands.recv().await {
        let result = match command {
            WriteCommand::Data(data) => writer
                .write_all(&data)
                .await
                .map(|_| Some(SocksEvent::SendDone(data.len()))),
            WriteCommand::Shutdown => writer.shutdown().await.map(|_| None),
        };
        match result {
            Ok(Some(event)) => {
                if events.send((relay, event)).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                let _ = events.send((relay, SocksEvent::Error(e.to_string())));
                return;
            }
        }
    }
}

/// Starts one [`SessionHandle`] per relay through a [`SocksDialer`].
#[derive(Debug, Clone)]
pub struct TokioConnector {
    dialer: Arc<SocksDialer>,
    events: SessionEvents,
}

impl TokioConnector {
    /// Create a connector reporting to `events`
    pub fn new(dialer: SocksDialer, events: SessionEvents) -> Self {
        TokioConnector {
            dialer: Arc::new(dialer),
            events,
        }
    }
}

impl SocksConnector for TokioConnector {
    type Session = SessionHandle;

    fn connect(&mut self, relay: RelayId, request: SocksRequest) -> SessionHandle {
        let dialer = Arc::clone(&self.dialer);
        SessionHandle::spawn(
            relay,
            async move {
                dialer
                    .connect(&request.target, request.credentials.as_ref())
                    .await
            },
            self.events.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TunsocksError;
    use crate::relay::Arena;
    use tokio::io::{duplex, DuplexStream};

    fn relay_id() -> RelayId {
        Arena::new().insert(())
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (client, mut server) = duplex(1024);
        let relay = relay_id();

        let mut session = SessionHandle::spawn(relay, async move { Ok(client) }, events_tx);
        assert_eq!(events_rx.recv().await, Some((relay, SocksEvent::Up)));

        session.send(Bytes::from_static(b"GET /")).unwrap();
        assert_eq!(events_rx.recv().await, Some((relay, SocksEvent::SendDone(5))));
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET /");

        server.write_all(b"200").await.unwrap();
        session.recv(8192).unwrap();
        assert_eq!(
            events_rx.recv().await,
            Some((relay, SocksEvent::RecvDone(Bytes::from_static(b"200"))))
        );
    }

    #[tokio::test]
    async fn test_session_half_close() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (client, mut server) = duplex(1024);
        let relay = relay_id();

        let mut session = SessionHandle::spawn(relay, async move { Ok(client) }, events_tx);
        assert_eq!(events_rx.recv().await, Some((relay, SocksEvent::Up)));

        session.shutdown_write().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);

        // The read direction still works after our write side is shut.
        server.write_all(b"tail").await.unwrap();
        session.recv(8192).unwrap();
        assert_eq!(
            events_rx.recv().await,
            Some((relay, SocksEvent::RecvDone(Bytes::from_static(b"tail"))))
        );

        drop(server);
        session.recv(8192).unwrap();
        assert_eq!(events_rx.recv().await, Some((relay, SocksEvent::Closed)));
    }

    #[tokio::test]
    async fn test_session_connect_failure() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let relay = relay_id();

        let _session = SessionHandle::spawn(
            relay,
            async { Err::<DuplexStream, _>(TunsocksError::Timeout("connect".to_string())) },
            events_tx,
        );

        match events_rx.recv().await {
            Some((id, SocksEvent::Error(reason))) => {
                assert_eq!(id, relay);
                assert!(reason.contains("connect"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_handle_stops_task() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (client, _server) = duplex(1024);
        let relay = relay_id();

        let mut session = SessionHandle::spawn(relay, async move { Ok(client) }, events_tx);
        assert_eq!(events_rx.recv().await, Some((relay, SocksEvent::Up)));
        session.recv(8192).unwrap();
        drop(session);

        // The task held the only other sender; it is gone once aborted.
        assert_eq!(events_rx.recv().await, None);
    }
}
