//! Socket layer entry points.
//!
//! A [`Socket`] is the engine's view of one transport socket. Stream
//! sockets carry at most one flow, created by [`Socket::attach`].
//! Datagram sockets grow a flow per address pair on first traffic.
//!
//! All flow state lives behind the socket's mutex; the condition variable
//! wakes threads blocked in [`Socket::close_wait`].

use crate::dispatch::{Disposition, Dispatcher};
use crate::engine::Shared;
use crate::entry::EntryState;
use crate::error::FilterError;
use crate::flow::{flow_hash, FlowFlags, FlowLink, FlowPhase, FlowState};
use crate::queue::Chunk;
use crate::registry::FilterUnit;
use crate::transport::Transport;
use crate::counters::Counters;
use flowgate_proto::{Direction, FlowId, FlowOrigin, SocketInfo};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Which halves of a connection to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Read,
    Write,
    Both,
}

impl Shutdown {
    fn read(self) -> bool {
        matches!(self, Self::Read | Self::Both)
    }

    fn write(self) -> bool {
        matches!(self, Self::Write | Self::Both)
    }
}

/// Local and remote address of a flow.
type FlowAddrs = (Option<SocketAddr>, Option<SocketAddr>);

pub(crate) struct SocketState {
    /// Keyed by the hash half of the flow id
    pub flows: HashMap<u32, FlowState>,
    /// Address pair to flow key
    addrs: HashMap<FlowAddrs, u32>,
    /// Blessed before any flow was attached
    pub skip_filter: bool,
    /// Attached while filters were active, but none matched
    unmatched: bool,
    pub closed: bool,
}

impl SocketState {
    fn flow_key(&self, addrs: FlowAddrs) -> Option<u32> {
        self.addrs.get(&addrs).copied()
    }

    /// First free key at or after the address hash.
    fn free_key(&self, addrs: FlowAddrs) -> u32 {
        let mut key = flow_hash(addrs.0, addrs.1);
        while self.flows.contains_key(&key) {
            key = match key.wrapping_add(1) {
                0 => 1,
                next => next,
            };
        }
        key
    }

    fn insert_flow(&mut self, key: u32, flow: FlowState) {
        self.addrs.insert((flow.local, flow.remote), key);
        self.flows.insert(key, flow);
    }

    pub(crate) fn remove_flow(&mut self, key: u32) -> Option<FlowState> {
        let flow = self.flows.remove(&key)?;
        self.addrs.remove(&(flow.local, flow.remote));
        Some(flow)
    }
}

/// Shared part of a socket, reachable from flow links.
pub struct SocketCore {
    pub(crate) generation: u32,
    pub(crate) info: SocketInfo,
    pub(crate) domain: Option<String>,
    pub(crate) transport: Arc<dyn Transport>,
    state: Mutex<SocketState>,
    closed: Condvar,
}

impl SocketCore {
    pub(crate) fn new(
        generation: u32,
        info: SocketInfo,
        domain: Option<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            generation,
            info,
            domain,
            transport,
            state: Mutex::new(SocketState {
                flows: HashMap::new(),
                addrs: HashMap::new(),
                skip_filter: false,
                unmatched: false,
                closed: false,
            }),
            closed: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SocketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_connectionless(&self) -> bool {
        self.info.socket_type.is_connectionless()
    }

    pub(crate) fn wake_close_waiters(&self) {
        self.closed.notify_all();
    }

    /// Locate the flow a pinned link refers to.
    pub(crate) fn flow_mut<'a>(
        state: &'a mut SocketState,
        link: &Arc<FlowLink>,
    ) -> Option<&'a mut FlowState> {
        state
            .flows
            .get_mut(&link.flow_id().flow_hash())
            .filter(|flow| Arc::ptr_eq(&flow.link, link))
    }
}

/// Sever every registry link and discard held bytes.
pub(crate) fn free_flow(d: &Dispatcher<'_>, flow: &mut FlowState) {
    for idx in 0..flow.entries.len() {
        if let Some(unit) = flow.entries[idx].unlink() {
            d.registry.unlink(unit, flow.id());
        }
    }
    d.flush(flow);
    flow.flags.freed = true;
    Counters::bump(&d.counters.flows_freed);
    debug!("{} freed", flow.id());
}

/// Offsets of one direction of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetsSnapshot {
    pub pass_offset: u64,
    pub peek_offset: u64,
    pub peeked_offset: u64,
    pub control_start: u64,
    pub control_end: u64,
    pub pending_len: u64,
    pub invariants_hold: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub unit: FilterUnit,
    pub state: EntryState,
    pub linked: bool,
    pub out: OffsetsSnapshot,
    pub inbound: OffsetsSnapshot,
}

/// Point-in-time view of a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSnapshot {
    pub flow_id: FlowId,
    pub phase: FlowPhase,
    pub flags: FlowFlags,
    pub ref_count: usize,
    pub entries: Vec<EntrySnapshot>,
    pub pending_out: u64,
    pub pending_in: u64,
    pub reinject_out: u64,
    pub reinject_in: u64,
    pub trace_len: usize,
}

impl FlowSnapshot {
    fn capture(flow: &FlowState) -> Self {
        let offsets = |state: &crate::entry::DirectionalState| OffsetsSnapshot {
            pass_offset: state.pass_offset,
            peek_offset: state.peek_offset,
            peeked_offset: state.peeked_offset,
            control_start: state.control.start_offset(),
            control_end: state.control.end_offset(),
            pending_len: state.pending.len(),
            invariants_hold: state.invariants_hold(),
        };
        Self {
            flow_id: flow.id(),
            phase: flow.phase(),
            flags: flow.flags,
            ref_count: flow.ref_count(),
            entries: flow
                .entries
                .iter()
                .map(|e| EntrySnapshot {
                    unit: e.origin_unit(),
                    state: e.state(),
                    linked: e.is_linked(),
                    out: offsets(&e.out),
                    inbound: offsets(&e.inbound),
                })
                .collect(),
            pending_out: flow.out.pending(),
            pending_in: flow.inbound.pending(),
            reinject_out: flow.out.reinject.len(),
            reinject_in: flow.inbound.reinject.len(),
            trace_len: flow.trace.len(),
        }
    }
}

/// A filtered socket. Dropping it frees every flow.
pub struct Socket {
    core: Arc<SocketCore>,
    shared: Arc<Shared>,
}

impl Socket {
    pub(crate) fn new(core: Arc<SocketCore>, shared: Arc<Shared>) -> Self {
        Self { core, shared }
    }

    /// Socket generation, the high half of every flow id on it.
    pub fn id(&self) -> u32 {
        self.core.generation
    }

    pub fn info(&self) -> &SocketInfo {
        &self.core.info
    }

    fn dispatcher(&self) -> Dispatcher<'_> {
        self.shared.dispatcher(&self.core)
    }

    /// Start filtering a connection-oriented socket.
    ///
    /// Returns `None` when policy does not route the socket to any filter,
    /// or no connected filter matches its control unit. Data on such a
    /// socket passes unfiltered.
    pub fn attach(
        &self,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        origin: FlowOrigin,
    ) -> Result<Option<FlowId>, FilterError> {
        if self.core.is_connectionless() {
            return Err(FilterError::InvalidState(
                "datagram flows attach on first traffic".into(),
            ));
        }
        let unit = self.shared.policy.control_unit(&self.core.info);
        let mut state = self.core.lock();
        if state.skip_filter || unit == 0 {
            return Ok(None);
        }
        if let Some(flow) = state.flows.values().next() {
            return Ok(Some(flow.id()));
        }
        let flow_id = self.new_flow(&mut state, origin, local, remote, unit);
        if flow_id.is_none() && self.shared.registry.active_count() > 0 {
            state.unmatched = true;
        }
        Ok(flow_id)
    }

    /// Create a flow and attach every matching filter to it.
    ///
    /// Nothing is kept when no filter matched.
    fn new_flow(
        &self,
        state: &mut SocketState,
        origin: FlowOrigin,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        unit: u32,
    ) -> Option<FlowId> {
        let key = state.free_key((local, remote));
        let flow_id = FlowId::new(self.core.generation, key);
        let link = Arc::new(FlowLink::new(flow_id, Arc::downgrade(&self.core)));
        let mut flow = FlowState::new(
            link,
            origin,
            local,
            remote,
            unit,
            self.shared.policy.generation(),
            self.shared.clock.now(),
        );

        let attached = self.dispatcher().attach(&mut flow, unit);
        if attached == 0 {
            debug!("{} no filter matches unit {:#x}", flow_id, unit);
            return None;
        }
        for direction in Direction::BOTH {
            flow.refresh_pass_offset(direction);
        }
        Counters::bump(&self.shared.counters.flows_attached);
        info!("{} created with {} filters", flow_id, attached);
        state.insert_flow(key, flow);
        Some(flow_id)
    }

    /// Outbound data from the application.
    pub fn send(&self, chunk: Chunk, to: Option<SocketAddr>) -> Result<Disposition, FilterError> {
        self.submit(Direction::Outbound, chunk, to)
    }

    /// Inbound data from the network.
    pub fn receive(&self, chunk: Chunk, from: Option<SocketAddr>) -> Result<Disposition, FilterError> {
        self.submit(Direction::Inbound, chunk, from)
    }

    fn submit(
        &self,
        direction: Direction,
        chunk: Chunk,
        peer: Option<SocketAddr>,
    ) -> Result<Disposition, FilterError> {
        let mut state = self.core.lock();
        if state.skip_filter {
            return Ok(Disposition::Pass(chunk));
        }
        if state.closed {
            return Err(FilterError::NotConnected);
        }

        let key = if self.core.is_connectionless() {
            match self.datagram_flow(&mut state, direction, peer) {
                Some(key) => key,
                None => return Ok(Disposition::Pass(chunk)),
            }
        } else {
            match state.flows.keys().next().copied() {
                Some(key) => key,
                None => {
                    if !state.unmatched {
                        self.check_unfiltered()?;
                    }
                    return Ok(Disposition::Pass(chunk));
                }
            }
        };

        let Some(flow) = state.flows.get_mut(&key) else {
            return Ok(Disposition::Pass(chunk));
        };
        self.check_policy(flow)?;
        self.dispatcher().submit(flow, direction, chunk)
    }

    /// Flow for a datagram's address pair, created on first use.
    fn datagram_flow(
        &self,
        state: &mut SocketState,
        direction: Direction,
        peer: Option<SocketAddr>,
    ) -> Option<u32> {
        let local = self.core.info.local;
        let remote = peer.or(self.core.info.remote);
        if let Some(key) = state.flow_key((local, remote)) {
            return Some(key);
        }
        let unit = self.shared.policy.control_unit(&self.core.info);
        if unit == 0 {
            return None;
        }
        let origin = match direction {
            Direction::Outbound => FlowOrigin::Outgoing,
            Direction::Inbound => FlowOrigin::Incoming,
        };
        let flow_id = self.new_flow(state, origin, local, remote, unit)?;
        self.shared.wake_reclaimer();
        Some(flow_id.flow_hash())
    }

    /// Connections opened before filtering began are cut off unless every
    /// filter preserves them.
    fn check_unfiltered(&self) -> Result<(), FilterError> {
        let registry = &self.shared.registry;
        if !registry.preserves_all()
            && registry.active_count() > 0
            && self.shared.policy.control_unit(&self.core.info) > 0
        {
            Counters::bump(&self.shared.counters.policy_drops);
            warn!("Socket {} data dropped for pre-existing unfiltered flow", self.id());
            return Err(FilterError::Dropped);
        }
        Ok(())
    }

    fn check_policy(&self, flow: &mut FlowState) -> Result<(), FilterError> {
        let unit = self.shared.policy.control_unit(&self.core.info);
        if unit == 0 || unit == flow.control_unit {
            return Ok(());
        }
        if self.shared.registry.preserves_all()
            || flow.policy_generation == self.shared.policy.generation()
        {
            debug!("{} control unit {:#x} -> {:#x}", flow.id(), flow.control_unit, unit);
            flow.control_unit = unit;
            return Ok(());
        }
        Counters::bump(&self.shared.counters.policy_drops);
        warn!(
            "{} data dropped ({:#x} -> {:#x})",
            flow.id(),
            flow.control_unit,
            unit
        );
        Err(FilterError::Dropped)
    }

    /// Shut one or both directions and tell the filters.
    ///
    /// A write shutdown with outbound data still held returns
    /// `ShutdownDeferred`; the transport's `shutdown_write` runs once the
    /// data has gone out.
    pub fn shutdown(&self, how: Shutdown) -> Result<(), FilterError> {
        let mut state = self.core.lock();
        if state.flows.is_empty() {
            return Ok(());
        }
        let d = self.dispatcher();
        let mut deferred = false;
        let mut changed = false;

        for flow in state.flows.values_mut() {
            let read = how.read() && !flow.flags.shut_read;
            let write = how.write() && !flow.flags.shut_write;
            if !read && !write {
                continue;
            }
            changed = true;
            flow.flags.shut_read |= read;
            flow.flags.shut_write |= write;
            d.notify_shutdown(flow, read, write);

            if write {
                if flow.out.outstanding() > 0 {
                    deferred = true;
                } else {
                    flow.flags.write_shutdown_done = true;
                }
            }
        }

        if !changed {
            Err(FilterError::NotConnected)
        } else if deferred {
            Err(FilterError::ShutdownDeferred)
        } else {
            Ok(())
        }
    }

    /// Notify filters of the shut directions without changing flow flags.
    pub fn notify_shutdown(&self, how: Shutdown) {
        let mut state = self.core.lock();
        let d = self.dispatcher();
        for flow in state.flows.values_mut() {
            d.notify_shutdown(flow, how.read(), how.write());
        }
    }

    /// Graceful close: ask filters to finish and wait for them to let go.
    ///
    /// Returns `false` if the wait timed out and filters were detached by
    /// force.
    pub fn close_wait(&self) -> bool {
        let mut state = self.core.lock();
        {
            let d = self.dispatcher();
            for flow in state.flows.values_mut() {
                if flow.flags.no_close_wait {
                    continue;
                }
                flow.flags.close_wait = true;
                d.notify_shutdown(flow, true, true);
            }
        }

        let deadline = Instant::now() + self.shared.config.close_wait_timeout;
        loop {
            let waiting = state
                .flows
                .values()
                .any(|f| !f.flags.no_close_wait && !f.flags.dropped && f.filters_attached());
            if !waiting {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .core
                .closed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }

        for flow in state.flows.values_mut() {
            if flow.flags.no_close_wait || !flow.filters_attached() {
                continue;
            }
            for entry in flow.entries.iter_mut() {
                entry.mark_detached();
            }
            Counters::bump(&self.shared.counters.close_wait_timeouts);
            warn!("{} close wait timed out, detached by force", flow.id());
        }
        false
    }

    /// The socket is closing: final notifications, push out approved
    /// bytes, discard the rest.
    pub fn close(&self) {
        let mut state = self.core.lock();
        if std::mem::replace(&mut state.closed, true) {
            return;
        }
        let d = self.dispatcher();
        for flow in state.flows.values_mut() {
            flow.flags.socket_closed = true;
            d.notify_closed(flow);
            for direction in Direction::BOTH {
                d.service_reinject(flow, direction);
            }
            d.flush(flow);
        }
    }

    /// The transport freed buffer space in `direction`.
    pub fn buffer_space_freed(&self, direction: Direction) {
        let mut state = self.core.lock();
        let d = self.dispatcher();
        for flow in state.flows.values_mut() {
            if flow.pending(direction).retry_reinject {
                d.service_reinject(flow, direction);
                flow.refresh_pass_offset(direction);
            }
        }
    }

    /// Bytes held back from the socket buffer in `direction`.
    pub fn data_pending(&self, direction: Direction) -> u64 {
        let state = self.core.lock();
        state.flows.values().map(|f| f.pending(direction).pending()).sum()
    }

    /// Socket buffer space charged for held bytes in `direction`.
    pub fn data_space(&self, direction: Direction) -> u64 {
        let state = self.core.lock();
        state.flows.values().map(|f| f.pending(direction).space()).sum()
    }

    pub fn flow_ids(&self) -> Vec<FlowId> {
        let state = self.core.lock();
        let mut ids: Vec<FlowId> = state.flows.values().map(FlowState::id).collect();
        ids.sort();
        ids
    }

    /// Weak handle to a flow, for observing its lifetime.
    pub fn flow_ref(&self, flow_id: FlowId) -> Option<Weak<FlowLink>> {
        let state = self.core.lock();
        state
            .flows
            .get(&flow_id.flow_hash())
            .map(|f| Arc::downgrade(&f.link))
    }

    pub fn snapshot(&self, flow_id: FlowId) -> Option<FlowSnapshot> {
        let state = self.core.lock();
        state
            .flows
            .get(&flow_id.flow_hash())
            .filter(|f| f.id() == flow_id)
            .map(FlowSnapshot::capture)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
        {
            let mut state = self.core.lock();
            let d = self.dispatcher();
            state.addrs.clear();
            for (_, mut flow) in state.flows.drain() {
                free_flow(&d, &mut flow);
            }
        }
        self.shared.forget_socket(self.core.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::FrameChannel;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::transport::{Rejected, StaticPolicy};
    use flowgate_proto::{AddressFamily, SocketType};
    use uuid::Uuid;

    struct Sink;

    impl Transport for Sink {
        fn reinject(&self, _direction: Direction, _chunk: Chunk) -> Result<(), Rejected> {
            Ok(())
        }

        fn defunct(&self) {}
    }

    fn datagram_socket(engine: &Engine) -> Socket {
        let uuid = Uuid::new_v4();
        let info = SocketInfo {
            family: AddressFamily::Inet,
            socket_type: SocketType::Datagram,
            protocol: 17,
            pid: 7,
            uuid,
            effective_pid: 7,
            effective_uuid: uuid,
            local: Some("10.0.0.1:5353".parse().unwrap()),
            remote: None,
        };
        engine.open_socket(info, None, Arc::new(Sink))
    }

    #[test]
    fn test_colliding_peers_get_separate_flows() {
        let engine = Engine::new(
            EngineConfig::default(),
            Arc::new(ManualClock::new()),
            Arc::new(StaticPolicy::new(1)),
        )
        .unwrap();
        let (channel, _rx) = FrameChannel::bounded(16);
        let handle = engine.connect_filter(1, Arc::new(channel)).unwrap();
        engine.set_policy_unit(handle, 1).unwrap();
        let socket = datagram_socket(&engine);

        let a: SocketAddr = "10.0.0.7:53".parse().unwrap();
        let b: SocketAddr = "10.0.0.8:53".parse().unwrap();
        let local = socket.info().local;
        socket.send(Chunk::new(b"to a".to_vec()).with_addr(a), Some(a)).unwrap();

        // Park a's flow on the key b hashes to.
        let b_key = flow_hash(local, Some(b));
        {
            let mut state = socket.core.lock();
            let a_key = state.flow_key((local, Some(a))).unwrap();
            let flow = state.remove_flow(a_key).unwrap();
            state.insert_flow(b_key, flow);
        }

        socket.send(Chunk::new(b"to b".to_vec()).with_addr(b), Some(b)).unwrap();
        {
            let state = socket.core.lock();
            assert_eq!(state.flows.len(), 2);
            let b_flow = state.flow_key((local, Some(b))).unwrap();
            assert_ne!(b_flow, b_key);
            assert_eq!(state.flows[&b_flow].remote, Some(b));
            assert_eq!(state.flows[&b_key].remote, Some(a));
        }

        socket.send(Chunk::new(b"to a again".to_vec()).with_addr(a), Some(a)).unwrap();
        assert_eq!(socket.flow_ids().len(), 2);
    }

    #[test]
    fn test_free_key_skips_taken_keys() {
        let engine = Engine::new(
            EngineConfig::default(),
            Arc::new(ManualClock::new()),
            Arc::new(StaticPolicy::new(0)),
        )
        .unwrap();
        let socket = datagram_socket(&engine);
        let addrs = (socket.info().local, Some("10.0.0.9:53".parse().unwrap()));
        let state = socket.core.lock();
        assert_eq!(state.free_key(addrs), flow_hash(addrs.0, addrs.1));
        assert_ne!(state.free_key(addrs), 0);
    }
}
