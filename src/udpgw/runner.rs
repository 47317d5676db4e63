//! Tokio task driving [`UdpGwClient`] over a real connection

use super::client::{Datagram, SendOutcome, UdpGwClient};
use crate::config::UdpGwConfig;
use crate::error::{TunsocksError, TunsocksResult};
use crate::socks::{Credentials, SocksDialer, TargetAddr};
use async_trait::async_trait;
use bytes::Bytes;
use std::future::pending;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

const COMMAND_QUEUE: usize = 1024;

/// Opens the byte stream to the gateway.
#[async_trait]
pub trait GatewayConnector: Send + Sync + 'static {
    /// Stream type produced
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Connect to the gateway
    async fn connect(&self) -> TunsocksResult<Self::Stream>;
}

/// Reaches the gateway with a SOCKS CONNECT through the configured server.
#[derive(Debug, Clone)]
pub struct SocksGatewayConnector {
    dialer: SocksDialer,
    target: TargetAddr,
    credentials: Option<Credentials>,
}

impl SocksGatewayConnector {
    /// Create a connector for `target`
    pub fn new(dialer: SocksDialer, target: TargetAddr, credentials: Option<Credentials>) -> Self {
        SocksGatewayConnector {
            dialer,
            target,
            credentials,
        }
    }
}

#[async_trait]
impl GatewayConnector for SocksGatewayConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> TunsocksResult<TcpStream> {
        debug!("udpgw: connecting to {} via {}", self.target, self.dialer.server());
        self.dialer
            .connect(&self.target, self.credentials.as_ref())
            .await
    }
}

enum Command {
    Send(Datagram),
    Shutdown,
}

enum ConnEvent {
    Frame(u64, Bytes),
    Lost(u64, String),
}

/// One live gateway connection; dropping it stops both I/O tasks
struct Connection {
    id: u64,
    writer: mpsc::Sender<Bytes>,
    tasks: [JoinHandle<()>; 2],
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Handle to the gateway client task.
#[derive(Debug)]
pub struct UdpGwHandle {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl UdpGwHandle {
    /// Start the client task. Datagrams from the gateway are delivered on
    /// `delivered`.
    pub fn spawn<C: GatewayConnector>(
        config: &UdpGwConfig,
        connector: C,
        delivered: mpsc::Sender<Datagram>,
    ) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        let client = UdpGwClient::new(config);
        let task = tokio::spawn(run(client, Arc::new(connector), rx, delivered));
        UdpGwHandle { commands, task }
    }

    /// Hand a datagram to the client; dropped if the client is backed up
    pub fn send(&self, local: SocketAddr, remote: SocketAddr, payload: Bytes) {
        let datagram = Datagram {
            local,
            remote,
            payload,
        };
        if let Err(e) = self.commands.try_send(Command::Send(datagram)) {
            debug!("udpgw: command queue unavailable, datagram dropped: {}", e);
        }
    }

    /// Stop the client and wait for it
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!("udpgw task failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Send(d) => write!(f, "Send({} -> {}, {} bytes)", d.local, d.remote, d.payload.len()),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}

async fn run<C: GatewayConnector>(
    mut client: UdpGwClient,
    connector: Arc<C>,
    mut commands: mpsc::Receiver<Command>,
    delivered: mpsc::Sender<Datagram>,
) {
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    let mut conn: Option<Connection> = None;
    let mut connecting: Option<JoinHandle<TunsocksResult<C::Stream>>> = None;
    let mut next_id = 0u64;

    info!("udpgw client started");

    loop {
        let now = Instant::now();
        if client.poll_connect(now) {
            let connector = connector.clone();
            connecting = Some(tokio::spawn(async move { connector.connect().await }));
        }

        let deadline = client.poll_timeout();
        let can_write = conn.is_some() && client.has_transmit();

        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Send(d)) => {
                    if let SendOutcome::Dropped(reason) =
                        client.send(d.local, d.remote, d.payload, Instant::now())
                    {
                        trace!("udpgw: {} -> {} dropped: {}", d.local, d.remote, reason);
                    }
                }
                Some(Command::Shutdown) | None => break,
            },

            result = join_connect(&mut connecting) => {
                connecting = None;
                let now = Instant::now();
                match flatten(result) {
                    Ok(stream) => {
                        next_id += 1;
                        conn = Some(attach(next_id, stream, conn_tx.clone()));
                        client.on_connected(now);
                    }
                    Err(e) => {
                        warn!("udpgw: connect failed: {}", e);
                        client.on_connect_failed(now);
                    }
                }
            }

            Some(event) = conn_rx.recv() => match event {
                ConnEvent::Frame(id, body) if is_current(&conn, id) => {
                    if let Some(datagram) = client.on_frame(body, Instant::now()) {
                        if let Err(e) = delivered.try_send(datagram) {
                            debug!("udpgw: local delivery backed up, datagram dropped: {}", e);
                        }
                    }
                }
                ConnEvent::Lost(id, reason) if is_current(&conn, id) => {
                    warn!("udpgw: connection error: {}", reason);
                    conn = None;
                    client.on_connection_lost(Instant::now());
                }
                _ => trace!("udpgw: event from a previous connection ignored"),
            },

            permit = reserve(conn.as_ref().map(|c| c.writer.clone())), if can_write => {
                if let Some(permit) = permit {
                    if let Some(frame) = client.poll_transmit(Instant::now()) {
                        permit.send(frame);
                    }
                }
            }

            _ = sleep_until(deadline.unwrap_or(now)), if deadline.is_some() => {
                client.handle_timeout(Instant::now());
            }
        }
    }

    if let Some(task) = connecting {
        task.abort();
    }
    drop(conn);
    client.shutdown();
    info!("udpgw client stopped");
}

async fn join_connect<T>(task: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match task {
        Some(task) => task.await,
        None => pending().await,
    }
}

fn flatten<S>(result: Result<TunsocksResult<S>, JoinError>) -> TunsocksResult<S> {
    result.map_err(|e| TunsocksError::Gateway(e.to_string()))?
}

async fn reserve(writer: Option<mpsc::Sender<Bytes>>) -> Option<mpsc::OwnedPermit<Bytes>> {
    match writer {
        Some(writer) => writer.reserve_owned().await.ok(),
        None => pending().await,
    }
}

fn is_current(conn: &Option<Connection>, id: u64) -> bool {
    conn.as_ref().map_or(false, |conn| conn.id == id)
}

fn attach<S>(id: u64, stream: S, events: mpsc::UnboundedSender<ConnEvent>) -> Connection
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (writer_tx, writer_rx) = mpsc::channel(1);
    let read_task = tokio::spawn(read_frames(id, reader, events.clone()));
    let write_task = tokio::spawn(write_frames(id, writer, writer_rx, events));
    Connection {
        id,
        writer: writer_tx,
        tasks: [read_task, write_task],
    }
}

async fn read_frames<R: AsyncRead + Unpin>(
    id: u64,
    mut reader: R,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    loop {
        let len = match reader.read_u16_le().await {
            Ok(len) => len as usize,
            Err(e) => {
                let _ = events.send(ConnEvent::Lost(id, e.to_string()));
                return;
            }
        };
        let mut body = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut body).await {
            let _ = events.send(ConnEvent::Lost(id, e.to_string()));
            return;
        }
        if events.send(ConnEvent::Frame(id, Bytes::from(body))).is_err() {
            return;
        }
    }
}

async fn write_frames<W: AsyncWrite + Unpin>(
    id: u64,
    mut writer: W,
    mut frames: mpsc::Receiver<Bytes>,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            let _ = events.send(ConnEvent::Lost(id, e.to_string()));
            return;
        }
    }
    let _ = writer.shutdown().await;
}
