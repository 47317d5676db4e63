//! Per-flow bookkeeping of the UDP gateway client

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Identifies one UDP conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Address of the local application
    pub local: SocketAddr,
    /// Address it talks to
    pub remote: SocketAddr,
}

impl FlowKey {
    /// Create a flow key
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        FlowKey { local, remote }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// Why a datagram was not queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DropReason {
    /// Every connection id is taken
    #[error("flow limit reached")]
    FlowLimit,
    /// The flow's queue is at its depth
    #[error("flow queue full")]
    QueueFull,
    /// The datagram does not fit in a frame
    #[error("datagram too large")]
    TooLarge,
}

#[derive(Debug)]
struct Flow {
    key: FlowKey,
    created: u64,
    queue: VecDeque<Bytes>,
    last_activity: Instant,
    needs_rebind: bool,
}

/// A datagram taken off a flow queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    /// Connection id of the flow
    pub conid: u16,
    /// Flow addresses
    pub key: FlowKey,
    /// Datagram payload
    pub payload: Bytes,
    /// First frame of the flow on this connection
    pub rebind: bool,
}

/// Live flows indexed by key and by connection id.
///
/// Connection ids are slots in `flows`; a new flow takes the lowest empty
/// slot, so ids stay within `[0, max_flows)`.
///
/// Datagrams leave round-robin across flows. Right after a connect the
/// backlog captured by [`begin_flush`](Self::begin_flush) goes first, flow
/// by flow in creation order.
#[derive(Debug)]
pub struct FlowTable {
    max_flows: usize,
    depth: usize,
    flows: Vec<Option<Flow>>,
    by_key: HashMap<FlowKey, u16>,
    next_seq: u64,
    cursor: usize,
    backlog: VecDeque<(u16, usize)>,
}

impl FlowTable {
    /// Create an empty table
    pub fn new(max_flows: usize, depth: usize) -> Self {
        FlowTable {
            max_flows: max_flows.min(u16::MAX as usize + 1),
            depth,
            flows: Vec::new(),
            by_key: HashMap::new(),
            next_seq: 0,
            cursor: 0,
            backlog: VecDeque::new(),
        }
    }

    /// Number of live flows
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Whether no flow is live
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Connection id of a live flow
    pub fn conid(&self, key: &FlowKey) -> Option<u16> {
        self.by_key.get(key).copied()
    }

    /// Addresses of a live connection id
    pub fn key(&self, conid: u16) -> Option<FlowKey> {
        self.flow(conid).map(|flow| flow.key)
    }

    /// Datagrams queued on one flow
    pub fn queue_len(&self, conid: u16) -> usize {
        self.flow(conid).map_or(0, |flow| flow.queue.len())
    }

    /// Whether any flow has a datagram waiting
    pub fn has_queued(&self) -> bool {
        self.flows.iter().flatten().any(|flow| !flow.queue.is_empty())
    }

    /// Queue a datagram, creating the flow if needed
    pub fn enqueue(&mut self, key: FlowKey, payload: Bytes, now: Instant) -> Result<u16, DropReason> {
        if let Some(conid) = self.conid(&key) {
            let depth = self.depth;
            let flow = self.flow_mut(conid).ok_or(DropReason::FlowLimit)?;
            if flow.queue.len() >= depth {
                return Err(DropReason::QueueFull);
            }
            flow.queue.push_back(payload);
            flow.last_activity = now;
            return Ok(conid);
        }

        let conid = self.lowest_free().ok_or(DropReason::FlowLimit)?;
        let mut queue = VecDeque::with_capacity(self.depth);
        queue.push_back(payload);
        let flow = Flow {
            key,
            created: self.next_seq,
            queue,
            last_activity: now,
            needs_rebind: true,
        };
        self.next_seq += 1;

        let slot = conid as usize;
        if slot == self.flows.len() {
            self.flows.push(Some(flow));
        } else {
            self.flows[slot] = Some(flow);
        }
        self.by_key.insert(key, conid);
        Ok(conid)
    }

    /// Capture what is queued now so it is flushed flow by flow in
    /// creation order before round-robin service resumes
    pub fn begin_flush(&mut self) {
        let mut pending: Vec<(u64, u16, usize)> = self
            .flows
            .iter()
            .enumerate()
            .filter_map(|(slot, flow)| {
                let flow = flow.as_ref()?;
                (!flow.queue.is_empty()).then_some((flow.created, slot as u16, flow.queue.len()))
            })
            .collect();
        pending.sort_unstable();
        self.backlog = pending
            .into_iter()
            .map(|(_, conid, count)| (conid, count))
            .collect();
    }

    /// Take the next datagram to send
    pub fn pop_next(&mut self) -> Option<Outgoing> {
        let slot = match self.next_backlog_slot() {
            Some(slot) => slot,
            None => self.next_round_robin_slot()?,
        };

        let flow = self.flows[slot].as_mut()?;
        let payload = flow.queue.pop_front()?;
        let rebind = std::mem::take(&mut flow.needs_rebind);
        Some(Outgoing {
            conid: slot as u16,
            key: flow.key,
            payload,
            rebind,
        })
    }

    fn next_backlog_slot(&mut self) -> Option<usize> {
        while let Some((conid, remaining)) = self.backlog.front_mut() {
            let slot = *conid as usize;
            let queued = self
                .flows
                .get(slot)
                .and_then(Option::as_ref)
                .map_or(0, |flow| flow.queue.len());
            if *remaining == 0 || queued == 0 {
                self.backlog.pop_front();
                continue;
            }
            *remaining -= 1;
            return Some(slot);
        }
        None
    }

    fn next_round_robin_slot(&mut self) -> Option<usize> {
        let len = self.flows.len();
        let slot = (0..len)
            .map(|i| (self.cursor + i) % len)
            .find(|&slot| matches!(&self.flows[slot], Some(flow) if !flow.queue.is_empty()))?;
        self.cursor = slot + 1;
        Some(slot)
    }

    /// Record traffic on a flow
    pub fn touch(&mut self, conid: u16, now: Instant) {
        if let Some(flow) = self.flow_mut(conid) {
            flow.last_activity = now;
        }
    }

    /// Every flow announces itself again on its next frame
    pub fn mark_all_rebind(&mut self) {
        for flow in self.flows.iter_mut().flatten() {
            flow.needs_rebind = true;
        }
    }

    /// Remove a flow, freeing its connection id
    pub fn retire(&mut self, conid: u16) -> Option<FlowKey> {
        let flow = self.flows.get_mut(conid as usize)?.take()?;
        self.by_key.remove(&flow.key);
        self.backlog.retain(|(id, _)| *id != conid);
        while matches!(self.flows.last(), Some(None)) {
            self.flows.pop();
        }
        Some(flow.key)
    }

    /// Retire flows with an empty queue and no traffic for `timeout`
    pub fn retire_idle(&mut self, now: Instant, timeout: Duration) -> Vec<(u16, FlowKey)> {
        let idle: Vec<u16> = self
            .flows
            .iter()
            .enumerate()
            .filter_map(|(slot, flow)| {
                let flow = flow.as_ref()?;
                (flow.queue.is_empty() && flow.last_activity + timeout <= now)
                    .then_some(slot as u16)
            })
            .collect();

        idle.into_iter()
            .filter_map(|conid| self.retire(conid).map(|key| (conid, key)))
            .collect()
    }

    /// When the next idle flow becomes retirable
    pub fn next_idle_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.flows
            .iter()
            .flatten()
            .filter(|flow| flow.queue.is_empty())
            .map(|flow| flow.last_activity + timeout)
            .min()
    }

    /// Drop every flow
    pub fn clear(&mut self) {
        self.flows.clear();
        self.by_key.clear();
        self.backlog.clear();
        self.cursor = 0;
    }

    fn flow(&self, conid: u16) -> Option<&Flow> {
        self.flows.get(conid as usize)?.as_ref()
    }

    fn flow_mut(&mut self, conid: u16) -> Option<&mut Flow> {
        self.flows.get_mut(conid as usize)?.as_mut()
    }

    fn lowest_free(&self) -> Option<u16> {
        if self.by_key.len() >= self.max_flows {
            return None;
        }
        let slot = self
            .flows
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.flows.len());
        u16::try_from(slot).ok()
    }
}
