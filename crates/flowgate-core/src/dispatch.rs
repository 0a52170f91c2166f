//! Verdict Protocol / Dispatcher
//!
//! Moves bytes through the ordered filter pipeline of a flow:
//!
//! ```text
//!  submit ──▶ entry 1 ──────────────▶ entry 2 ──────────────▶ reinject ──▶ transport
//!             control ─pass─▶ pending  control ─pass─▶ pending  queue
//!                │                        │
//!                └─peek─▶ data event      └─peek─▶ data event
//! ```
//!
//! Each entry shows its agent bytes up to its peek offset and lets bytes
//! below its pass offset move on to the next entry. Bytes leave the last
//! entry in order into the flow's reinject queue.
//!
//! Everything here runs with the owning socket locked. The registry lock is
//! only taken briefly inside `FilterRegistry` calls.

use crate::channel::ChannelError;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::counters::Counters;
use crate::error::FilterError;
use crate::flow::FlowState;
use crate::queue::Chunk;
use crate::registry::{FilterRegistry, FilterUnit};
use crate::socket::SocketCore;
use crate::transport::{Rejected, TransportError};
use flowgate_proto::{
    AttachedEvent, ClosedEvent, DataEvent, Direction, Event, EventMessage, TraceOp, OFFSET_MAX,
};
use tracing::{debug, trace, warn};

/// What became of a submitted chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    /// No filter needs to hold it; the caller delivers it now
    Pass(Chunk),
    /// Taken into custody; it comes back through `Transport::reinject`
    Held,
    /// Refused for exceeding the flow's buffer ceilings
    TailDropped,
}

/// Borrowed engine context for one locked socket.
pub(crate) struct Dispatcher<'a> {
    pub registry: &'a FilterRegistry,
    pub counters: &'a Counters,
    pub clock: &'a dyn Clock,
    pub config: &'a EngineConfig,
    pub socket: &'a SocketCore,
}

impl Dispatcher<'_> {
    /// Create entries for every matching filter and announce the flow.
    pub fn attach(&self, flow: &mut FlowState, required_unit: u32) -> usize {
        let mut added = 0;
        for (unit, order_key) in self.registry.matching(required_unit) {
            if flow.entries.iter().any(|e| e.origin_unit() == unit) {
                continue;
            }
            flow.entries.push(crate::entry::FilterEntry::new(unit, order_key));
            self.registry.link(unit, std::sync::Arc::downgrade(&flow.link));
            added += 1;
        }
        flow.entries
            .sort_by_key(|e| (e.order_key(), e.origin_unit()));

        for idx in 0..flow.entries.len() {
            if let Err(e) = self.dispatch_attach(flow, idx) {
                debug!("{} attach to {} deferred: {}", flow.id(), flow.entries[idx].origin_unit(), e);
            }
        }
        added
    }

    /// Run a chunk from the transport through the pipeline.
    pub fn submit(
        &self,
        flow: &mut FlowState,
        direction: Direction,
        mut chunk: Chunk,
    ) -> Result<Disposition, FilterError> {
        if flow.flags.dropped {
            return Err(FilterError::Dropped);
        }
        let len = chunk.len() as u64;
        if len == 0 {
            return Ok(Disposition::Pass(chunk));
        }
        let footprint = chunk.footprint();
        let idle = flow.pending(direction).outstanding() == 0;

        let connectionless = self.socket.is_connectionless();
        let limits = &self.config.reclaim;
        let acct = flow.pending_mut(direction);
        acct.last += len;
        acct.footprint += footprint;
        acct.buffers += 1;

        if connectionless
            && (acct.buffers > limits.max_buffer_count || acct.footprint > limits.max_buffer_bytes)
        {
            acct.last -= len;
            acct.footprint -= footprint;
            acct.buffers -= 1;
            acct.tail_drops += 1;
            Counters::bump(&self.counters.tail_drops);
            trace!("{} tail drop {} bytes {}", flow.id(), len, direction);
            return Ok(Disposition::TailDropped);
        }
        flow.add_bytes(direction, len);

        let acct = flow.pending_mut(direction);
        if idle && acct.last <= acct.pass_offset {
            acct.release(len, footprint);
            self.advance_entries(flow, direction, len);
            Counters::add(&self.counters.fast_path_bytes, len);
            if !direction.is_outbound() && chunk.ip_header {
                if let Some(stripped) = chunk.without_ip_header() {
                    chunk = stripped;
                }
            }
            return Ok(Disposition::Pass(chunk));
        }

        for idx in 0..flow.entries.len() {
            match self.filter_data(flow, idx, direction, chunk) {
                Some(passed) => chunk = passed,
                None => {
                    // Already-approved bytes may have reached the end of the line.
                    self.service_reinject(flow, direction);
                    return Ok(Disposition::Held);
                }
            }
        }

        // Nobody linked any more: hand it straight back.
        flow.pending_mut(direction).release(len, footprint);
        Ok(Disposition::Pass(chunk))
    }

    /// Bytes already approved by every filter slide past their queues.
    fn advance_entries(&self, flow: &mut FlowState, direction: Direction, len: u64) {
        for entry in flow.entries.iter_mut().filter(|e| e.is_linked()) {
            let state = entry.dir_mut(direction);
            state.control.advance(len);
            state.pass_offset = state.pass_offset.max(state.control.start_offset());
            state.peeked_offset = state.control.start_offset();
            state.peek_offset = state.peek_offset.max(state.pass_offset);
            state.pending.advance(len);
        }
    }

    /// Queue a chunk on one entry. Gives the chunk back if the entry no
    /// longer filters.
    fn filter_data(
        &self,
        flow: &mut FlowState,
        idx: usize,
        direction: Direction,
        chunk: Chunk,
    ) -> Option<Chunk> {
        if !flow.entries[idx].is_linked() {
            return Some(chunk);
        }
        flow.entries[idx].dir_mut(direction).control.append(chunk);
        if let Err(e) = self.service_control_queue(flow, idx, direction) {
            trace!("{} service {} {}: {}", flow.id(), flow.entries[idx].origin_unit(), direction, e);
        }
        None
    }

    /// Release, reveal and forward what an entry's offsets allow.
    pub fn service_control_queue(
        &self,
        flow: &mut FlowState,
        idx: usize,
        direction: Direction,
    ) -> Result<(), FilterError> {
        if !flow.entries[idx].is_linked() {
            return Ok(());
        }
        if !flow.entries[idx].attach_sent() {
            match self.dispatch_attach(flow, idx) {
                Ok(()) => {}
                Err(e) if e.is_retryable() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        if !flow.entries[idx].data_started() {
            return Ok(());
        }

        // Whole chunks below the pass offset move to the pending queue.
        {
            let state = flow.entries[idx].dir_mut(direction);
            while let Some(len) = state.control.front().map(|c| c.len() as u64) {
                let start = state.control.start_offset();
                if start + len > state.pass_offset {
                    if state.peeked_offset < state.pass_offset {
                        state.peeked_offset = state.pass_offset;
                    }
                    break;
                }
                if let Some(chunk) = state.control.remove_front() {
                    state.pending.append(chunk);
                }
                if state.peeked_offset < state.control.start_offset() {
                    state.peeked_offset = state.control.start_offset();
                }
            }
        }

        // Show the agent what it asked to see.
        let mut stalled = None;
        while let Some((start, len)) = flow.entries[idx].dir(direction).next_peek_range() {
            match self.dispatch_data(flow, idx, direction, start, len) {
                Ok(()) => flow.entries[idx].dir_mut(direction).peeked_offset += len,
                Err(e) => {
                    stalled = Some(e);
                    break;
                }
            }
        }

        self.service_pending_queue(flow, idx, direction)?;

        let retry_disconnect = match direction {
            Direction::Outbound => flow.flags.shut_write && !flow.entries[idx].sent_disconnect_out,
            Direction::Inbound => flow.flags.shut_read && !flow.entries[idx].sent_disconnect_in,
        };
        if retry_disconnect {
            let _ = self.dispatch_disconnect(flow, idx, direction);
        }

        match stalled {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Hand released bytes to the next entry, or to the reinject queue.
    fn service_pending_queue(
        &self,
        flow: &mut FlowState,
        idx: usize,
        direction: Direction,
    ) -> Result<(), FilterError> {
        if flow.entries[idx].dir(direction).pending.is_empty() {
            for next in idx + 1..flow.entries.len() {
                self.service_control_queue(flow, next, direction)?;
            }
            return Ok(());
        }

        let pass_len = {
            let state = flow.entries[idx].dir(direction);
            state.pass_offset.saturating_sub(state.pending.start_offset())
        };
        let mut moved = 0u64;
        loop {
            let chunk = {
                let state = flow.entries[idx].dir_mut(direction);
                match state.pending.front().map(|c| c.len() as u64) {
                    Some(len) if moved + len <= pass_len => {
                        moved += len;
                        state.pending.remove_front()
                    }
                    _ => None,
                }
            };
            let Some(chunk) = chunk else { break };

            let mut carried = Some(chunk);
            for next in idx + 1..flow.entries.len() {
                let Some(c) = carried.take() else { break };
                carried = self.filter_data(flow, next, direction, c);
            }
            if let Some(c) = carried {
                flow.pending_mut(direction).reinject.append(c);
            }
        }
        Ok(())
    }

    /// Apply new offsets from a verdict and push released bytes out.
    pub fn apply_verdict(
        &self,
        flow: &mut FlowState,
        idx: usize,
        direction: Direction,
        pass: u64,
        peek: u64,
    ) -> Result<(), FilterError> {
        let result = self.update_offsets(flow, idx, direction, pass, peek);
        self.service_reinject(flow, direction);
        flow.refresh_pass_offset(direction);
        result
    }

    fn update_offsets(
        &self,
        flow: &mut FlowState,
        idx: usize,
        direction: Direction,
        pass: u64,
        peek: u64,
    ) -> Result<(), FilterError> {
        if flow.flags.dropped {
            return Err(FilterError::Dropped);
        }
        let mut updated = false;
        {
            let state = flow.entries[idx].dir_mut(direction);
            if pass > state.pass_offset {
                state.pass_offset = pass;
                if state.peek_offset < pass {
                    state.peek_offset = pass;
                }
                updated = true;
            }
            if peek > state.pass_offset && peek > state.peek_offset {
                state.peek_offset = peek;
                updated = true;
            }
        }
        let result = if updated {
            self.service_control_queue(flow, idx, direction)
        } else {
            trace!("{} stale verdict {} pass {} peek {}", flow.id(), direction, pass, peek);
            Ok(())
        };

        let flow_id = flow.id();
        let entry = &mut flow.entries[idx];
        let passes_all = entry.out.pass_offset == OFFSET_MAX && entry.inbound.pass_offset == OFFSET_MAX;
        let drained = flow.flags.close_wait && entry.control_queues_empty();
        if (passes_all || drained) && entry.mark_detached() {
            debug!("{} detached from {}", flow_id, entry.origin_unit());
        }
        if flow.flags.close_wait && !flow.filters_attached() {
            self.socket.wake_close_waiters();
        }
        result
    }

    /// Hand released bytes back to the transport, in order.
    pub fn service_reinject(&self, flow: &mut FlowState, direction: Direction) {
        if flow.flags.dropped {
            return;
        }
        flow.pending_mut(direction).retry_reinject = false;

        while let Some(chunk) = flow.pending_mut(direction).reinject.remove_front() {
            let len = chunk.len() as u64;
            let footprint = chunk.footprint();
            let result = if !direction.is_outbound() && chunk.ip_header {
                match chunk.without_ip_header() {
                    Some(stripped) => self
                        .socket
                        .transport
                        .reinject(direction, stripped)
                        .map_err(|r| Rejected { chunk, error: r.error }),
                    None => self.socket.transport.reinject(direction, chunk),
                }
            } else {
                self.socket.transport.reinject(direction, chunk)
            };

            match result {
                Ok(()) => {
                    flow.pending_mut(direction).release(len, footprint);
                    let counter = match direction {
                        Direction::Outbound => &self.counters.reinjected_out_bytes,
                        Direction::Inbound => &self.counters.reinjected_in_bytes,
                    };
                    Counters::add(counter, len);
                }
                Err(Rejected { chunk, error: TransportError::NoMemory }) => {
                    let acct = flow.pending_mut(direction);
                    acct.reinject.requeue_front(chunk);
                    acct.retry_reinject = true;
                    Counters::bump(&self.counters.reinject_failures);
                    debug!("{} reinject {} deferred", flow.id(), direction);
                    break;
                }
                Err(Rejected { error: TransportError::Closed, .. }) => {
                    flow.pending_mut(direction).release(len, footprint);
                    Counters::add(&self.counters.flushed_close_bytes, len);
                }
            }
        }

        if flow.flags.shut_write {
            self.notify_shutdown(flow, false, true);
            if flow.out.outstanding() == 0 && !flow.flags.write_shutdown_done {
                flow.flags.write_shutdown_done = true;
                self.socket.transport.shutdown_write();
            }
        }
        if flow.flags.close_wait && !flow.filters_attached() {
            self.socket.wake_close_waiters();
        }
    }

    /// Discard everything held for the flow.
    pub fn flush(&self, flow: &mut FlowState) {
        let mut drained = 0;
        for direction in Direction::BOTH {
            for entry in flow.entries.iter_mut() {
                let state = entry.dir_mut(direction);
                drained += state.control.drain();
                drained += state.pending.drain();
            }
            let acct = flow.pending_mut(direction);
            drained += acct.reinject.drain();
            acct.first = acct.last;
            acct.footprint = 0;
            acct.buffers = 0;
            acct.retry_reinject = false;
        }
        if drained > 0 {
            let counter = if flow.flags.dropped {
                &self.counters.flushed_drop_bytes
            } else {
                &self.counters.flushed_close_bytes
            };
            Counters::add(counter, drained);
            debug!("{} flushed {} bytes", flow.id(), drained);
        }
    }

    /// Terminal drop verdict.
    pub fn drop_flow(&self, flow: &mut FlowState) {
        if flow.flags.dropped {
            return;
        }
        flow.flags.dropped = true;
        Counters::bump(&self.counters.drops);
        warn!("{} dropped", flow.id());

        if !self.socket.is_connectionless() {
            self.socket.transport.defunct();
        }
        for entry in flow.entries.iter_mut() {
            entry.mark_detached();
        }
        self.flush(flow);
        self.socket.wake_close_waiters();
    }

    /// Send disconnect notifications for the shut directions.
    pub fn notify_shutdown(&self, flow: &mut FlowState, read: bool, write: bool) {
        for idx in 0..flow.entries.len() {
            if read {
                let _ = self.dispatch_disconnect(flow, idx, Direction::Inbound);
            }
            if write {
                let _ = self.dispatch_disconnect(flow, idx, Direction::Outbound);
            }
        }
    }

    /// Closed notification for every announced entry.
    pub fn notify_closed(&self, flow: &mut FlowState) {
        for idx in 0..flow.entries.len() {
            if let Err(e) = self.dispatch_closed(flow, idx) {
                debug!("{} closed event to {} failed: {}", flow.id(), flow.entries[idx].origin_unit(), e);
            }
        }
    }

    fn linked_unit(flow: &FlowState, idx: usize) -> Option<FilterUnit> {
        flow.entries[idx].unit()
    }

    fn note_backpressure(&self, flow: &mut FlowState, idx: usize) -> FilterError {
        flow.entries[idx].flow_controlled = true;
        Counters::bump(&self.counters.flow_control_hits);
        FilterError::BackPressure
    }

    pub fn dispatch_attach(&self, flow: &mut FlowState, idx: usize) -> Result<(), FilterError> {
        let Some(unit) = Self::linked_unit(flow, idx) else {
            return Ok(());
        };
        if flow.entries[idx].attach_sent() {
            return Ok(());
        }
        if self.registry.is_flow_controlled(unit) {
            return Err(self.note_backpressure(flow, idx));
        }

        let info = flow.socket_info(&self.socket.info);
        let signature = self
            .registry
            .signer(unit)
            .map(|s| s.sign_attached(flow.id(), &info));
        let msg = EventMessage::new(
            flow.id(),
            Event::Attached(AttachedEvent {
                info,
                origin: flow.origin,
                domain: self.socket.domain.clone(),
                signature,
            }),
        );

        match self.registry.send(unit, &msg) {
            Ok(()) => {
                let now = self.clock.now();
                let entry = &mut flow.entries[idx];
                entry.mark_attach_sent(now);
                entry.flow_controlled = false;
                flow.record(TraceOp::Attached, now);
                Counters::bump(&self.counters.attach_events);
                debug!("{} attached to {}", flow.id(), unit);
                Ok(())
            }
            Err(ChannelError::BackPressure) => Err(self.note_backpressure(flow, idx)),
            Err(e) => Err(e.into()),
        }
    }

    fn dispatch_data(
        &self,
        flow: &mut FlowState,
        idx: usize,
        direction: Direction,
        start: u64,
        len: u64,
    ) -> Result<(), FilterError> {
        let Some(unit) = Self::linked_unit(flow, idx) else {
            return Ok(());
        };
        if self.registry.is_flow_controlled(unit) {
            return Err(self.note_backpressure(flow, idx));
        }

        let state = flow.entries[idx].dir(direction);
        let payload = state.control.copy_range(start, len);
        let (ip_header, chunk_addr) = state
            .control
            .iter()
            .find(|(at, c)| *at <= start && start < at + c.len() as u64)
            .map(|(_, c)| (c.ip_header, c.addr))
            .unwrap_or((false, None));

        let mut event = DataEvent {
            direction,
            start,
            end: start + len,
            payload,
            local: flow.local.or(self.socket.info.local),
            remote: chunk_addr.or(flow.remote).or(self.socket.info.remote),
            ip_header,
            signature: None,
        };
        if let Some(signer) = self.registry.signer(unit) {
            event.signature = Some(signer.sign_data(flow.id(), &event));
        }
        let msg = EventMessage::new(flow.id(), Event::Data(event));

        match self.registry.send(unit, &msg) {
            Ok(()) => {
                let now = self.clock.now();
                let entry = &mut flow.entries[idx];
                entry.flow_controlled = false;
                entry.last_event = Some(now);
                let op = match direction {
                    Direction::Outbound => TraceOp::DataOut,
                    Direction::Inbound => TraceOp::DataIn,
                };
                flow.record(op, now);
                Counters::bump(&self.counters.data_events);
                trace!("{} data {} [{}, {}) to {}", flow.id(), direction, start, start + len, unit);
                Ok(())
            }
            Err(ChannelError::BackPressure) => Err(self.note_backpressure(flow, idx)),
            Err(e) => Err(e.into()),
        }
    }

    /// Disconnect notification, once per entry and direction.
    pub fn dispatch_disconnect(
        &self,
        flow: &mut FlowState,
        idx: usize,
        direction: Direction,
    ) -> Result<(), FilterError> {
        let Some(unit) = Self::linked_unit(flow, idx) else {
            return Ok(());
        };
        if !flow.flags.initial_verdict && flow.remote_is_loopback() {
            flow.flags.no_close_wait = true;
        }
        let entry = &flow.entries[idx];
        if !entry.attach_sent() {
            return Ok(());
        }
        let already = match direction {
            Direction::Outbound => entry.sent_disconnect_out,
            Direction::Inbound => entry.sent_disconnect_in,
        };
        if already {
            return Ok(());
        }
        // Not disconnected while outbound bytes still wait for the agent.
        if direction.is_outbound() && !entry.out.control.is_empty() {
            return Ok(());
        }
        if self.registry.is_flow_controlled(unit) {
            return Err(self.note_backpressure(flow, idx));
        }

        let msg = EventMessage::new(flow.id(), Event::Disconnect { direction });
        match self.registry.send(unit, &msg) {
            Ok(()) => {
                let now = self.clock.now();
                let entry = &mut flow.entries[idx];
                entry.last_event = Some(now);
                let op = match direction {
                    Direction::Outbound => {
                        entry.sent_disconnect_out = true;
                        TraceOp::DisconnectOut
                    }
                    Direction::Inbound => {
                        entry.sent_disconnect_in = true;
                        TraceOp::DisconnectIn
                    }
                };
                flow.record(op, now);
                Counters::bump(&self.counters.disconnect_events);
                Ok(())
            }
            Err(ChannelError::BackPressure) => Err(self.note_backpressure(flow, idx)),
            Err(e) => Err(e.into()),
        }
    }

    /// Closed notification, at most once per entry.
    pub fn dispatch_closed(&self, flow: &mut FlowState, idx: usize) -> Result<(), FilterError> {
        let entry = &flow.entries[idx];
        let Some(unit) = entry.unit() else {
            return Ok(());
        };
        if !entry.attach_sent() || entry.sent_closed {
            return Ok(());
        }

        let now = self.clock.now();
        flow.record(TraceOp::Closed, now);
        let msg = EventMessage::new(
            flow.id(),
            Event::Closed(ClosedEvent {
                trace: flow.trace.clone(),
                bytes_out: flow.bytes_out,
                bytes_in: flow.bytes_in,
            }),
        );
        self.registry.send(unit, &msg)?;

        let entry = &mut flow.entries[idx];
        entry.sent_closed = true;
        entry.last_event = Some(now);
        Counters::bump(&self.counters.closed_events);
        debug!("{} closed event to {}", flow.id(), unit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::FrameChannel;
    use crate::clock::ManualClock;
    use crate::flow::FlowLink;
    use crate::transport::Transport;
    use crossbeam_channel::Receiver;
    use flowgate_proto::{decode_event, AddressFamily, FlowId, FlowOrigin, SocketInfo, SocketType};
    use std::sync::{Arc, Mutex, Weak};
    use uuid::Uuid;

    #[derive(Default)]
    struct Recorder {
        delivered: Mutex<Vec<(Direction, Chunk)>>,
        refuse: Mutex<Option<TransportError>>,
        defuncted: Mutex<bool>,
    }

    impl Transport for Recorder {
        fn reinject(&self, direction: Direction, chunk: Chunk) -> Result<(), Rejected> {
            if let Some(error) = *self.refuse.lock().unwrap() {
                return Err(Rejected { chunk, error });
            }
            self.delivered.lock().unwrap().push((direction, chunk));
            Ok(())
        }

        fn defunct(&self) {
            *self.defuncted.lock().unwrap() = true;
        }
    }

    struct Fixture {
        registry: FilterRegistry,
        counters: Counters,
        clock: ManualClock,
        config: EngineConfig,
        socket: SocketCore,
        transport: Arc<Recorder>,
        agents: Vec<Receiver<Vec<u8>>>,
    }

    impl Fixture {
        fn new(order_keys: &[u32], socket_type: SocketType, config: EngineConfig) -> Self {
            let registry = FilterRegistry::new(4);
            let mut agents = Vec::new();
            for (i, key) in order_keys.iter().enumerate() {
                let (channel, rx) = FrameChannel::bounded(16);
                let handle = registry.connect(i as u32 + 1, Arc::new(channel)).unwrap();
                registry.set_policy_unit(handle, *key).unwrap();
                agents.push(rx);
            }
            let transport = Arc::new(Recorder::default());
            let info = SocketInfo {
                family: AddressFamily::Inet,
                socket_type,
                protocol: 6,
                pid: 10,
                uuid: Uuid::new_v4(),
                effective_pid: 10,
                effective_uuid: Uuid::nil(),
                local: Some("10.0.0.1:40000".parse().unwrap()),
                remote: Some("10.0.0.2:443".parse().unwrap()),
            };
            let socket = SocketCore::new(1, info, None, transport.clone());
            Self {
                registry,
                counters: Counters::new(),
                clock: ManualClock::new(),
                config,
                socket,
                transport,
                agents,
            }
        }

        fn dispatcher(&self) -> Dispatcher<'_> {
            Dispatcher {
                registry: &self.registry,
                counters: &self.counters,
                clock: &self.clock,
                config: &self.config,
                socket: &self.socket,
            }
        }

        fn flow(&self, required: u32) -> FlowState {
            let link = Arc::new(FlowLink::new(FlowId::new(1, 7), Weak::new()));
            let mut flow = FlowState::new(
                link,
                FlowOrigin::Outgoing,
                self.socket.info.local,
                self.socket.info.remote,
                required,
                1,
                self.clock.now(),
            );
            self.dispatcher().attach(&mut flow, required);
            for direction in Direction::BOTH {
                flow.refresh_pass_offset(direction);
            }
            flow
        }

        fn events(&self, agent: usize) -> Vec<Event> {
            self.agents[agent]
                .try_iter()
                .map(|frame| decode_event(&frame).unwrap().event)
                .collect()
        }

        fn delivered(&self) -> Vec<u8> {
            self.transport
                .delivered
                .lock()
                .unwrap()
                .iter()
                .flat_map(|(_, c)| c.data.clone())
                .collect()
        }
    }

    fn data_ranges(events: &[Event]) -> Vec<(u64, u64)> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Data(d) => Some((d.start, d.end)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_held_until_passed() {
        let fx = Fixture::new(&[1], SocketType::Stream, EngineConfig::default());
        let d = fx.dispatcher();
        let mut flow = fx.flow(1);

        let held = d.submit(&mut flow, Direction::Outbound, Chunk::new(vec![7u8; 100])).unwrap();
        assert_eq!(held, Disposition::Held);
        assert_eq!(flow.out.pending(), 100);
        assert!(fx.delivered().is_empty());

        flow.entries[0].mark_data_started(fx.clock.now());
        d.apply_verdict(&mut flow, 0, Direction::Outbound, 100, 100).unwrap();
        assert_eq!(fx.delivered(), vec![7u8; 100]);
        assert_eq!(flow.out.pending(), 0);
        assert_eq!(flow.out.pass_offset, 100);
        assert!(flow.entries[0].out.invariants_hold());
    }

    #[test]
    fn test_pass_max_takes_fast_path() {
        let fx = Fixture::new(&[1], SocketType::Stream, EngineConfig::default());
        let d = fx.dispatcher();
        let mut flow = fx.flow(1);
        flow.entries[0].mark_data_started(fx.clock.now());
        d.apply_verdict(&mut flow, 0, Direction::Outbound, OFFSET_MAX, OFFSET_MAX).unwrap();

        let chunk = Chunk::new(vec![1u8; 30]);
        assert_eq!(
            d.submit(&mut flow, Direction::Outbound, chunk.clone()).unwrap(),
            Disposition::Pass(chunk)
        );
        assert_eq!(fx.counters.fast_path_bytes.load(std::sync::atomic::Ordering::Relaxed), 30);
        assert_eq!(flow.entries[0].out.control.start_offset(), 30);
        assert!(flow.entries[0].out.invariants_hold());
    }

    #[test]
    fn test_peek_is_split_at_chunks_and_offset() {
        let fx = Fixture::new(&[1], SocketType::Stream, EngineConfig::default());
        let d = fx.dispatcher();
        let mut flow = fx.flow(1);
        d.submit(&mut flow, Direction::Outbound, Chunk::new(vec![1u8; 40])).unwrap();
        d.submit(&mut flow, Direction::Outbound, Chunk::new(vec![2u8; 40])).unwrap();

        flow.entries[0].mark_data_started(fx.clock.now());
        d.apply_verdict(&mut flow, 0, Direction::Outbound, 0, 60).unwrap();

        let events = fx.events(0);
        assert!(matches!(events[0], Event::Attached(_)));
        assert_eq!(data_ranges(&events), vec![(0, 40), (40, 60)]);
        assert_eq!(flow.entries[0].out.peeked_offset, 60);

        // Stale verdicts change nothing.
        d.apply_verdict(&mut flow, 0, Direction::Outbound, 0, 50).unwrap();
        assert!(fx.events(0).is_empty());
        assert_eq!(flow.entries[0].out.peek_offset, 60);
    }

    #[test]
    fn test_second_filter_sees_only_passed_bytes() {
        let fx = Fixture::new(&[1, 2], SocketType::Stream, EngineConfig::default());
        let d = fx.dispatcher();
        let mut flow = fx.flow(3);
        assert_eq!(flow.entries.len(), 2);

        d.submit(&mut flow, Direction::Outbound, Chunk::new(vec![1u8; 50])).unwrap();
        d.submit(&mut flow, Direction::Outbound, Chunk::new(vec![2u8; 50])).unwrap();
        let now = fx.clock.now();
        flow.entries[0].mark_data_started(now);
        flow.entries[1].mark_data_started(now);

        d.apply_verdict(&mut flow, 1, Direction::Outbound, 0, 100).unwrap();
        assert!(data_ranges(&fx.events(1)).is_empty());

        d.apply_verdict(&mut flow, 0, Direction::Outbound, 50, 50).unwrap();
        assert_eq!(data_ranges(&fx.events(1)), vec![(0, 50)]);
        assert_eq!(flow.entries[1].out.control.end_offset(), 50);
        assert!(fx.delivered().is_empty());

        d.apply_verdict(&mut flow, 0, Direction::Outbound, 100, 100).unwrap();
        assert_eq!(data_ranges(&fx.events(1)), vec![(50, 100)]);
        d.apply_verdict(&mut flow, 1, Direction::Outbound, 100, 100).unwrap();
        assert_eq!(fx.delivered().len(), 100);
    }

    #[test]
    fn test_drop_flushes_and_refuses() {
        let fx = Fixture::new(&[1], SocketType::Stream, EngineConfig::default());
        let d = fx.dispatcher();
        let mut flow = fx.flow(1);
        d.submit(&mut flow, Direction::Inbound, Chunk::new(vec![0u8; 100])).unwrap();

        d.drop_flow(&mut flow);
        assert!(flow.flags.dropped);
        assert!(flow.entries.iter().all(|e| e.is_detached()));
        assert!(*fx.transport.defuncted.lock().unwrap());
        assert_eq!(fx.counters.flushed_drop_bytes.load(std::sync::atomic::Ordering::Relaxed), 100);
        assert_eq!(flow.inbound.pending(), 0);
        assert!(matches!(
            d.submit(&mut flow, Direction::Inbound, Chunk::new(vec![0u8; 1])),
            Err(FilterError::Dropped)
        ));
    }

    #[test]
    fn test_reinject_retried_after_no_memory() {
        let fx = Fixture::new(&[1], SocketType::Stream, EngineConfig::default());
        let d = fx.dispatcher();
        let mut flow = fx.flow(1);
        d.submit(&mut flow, Direction::Inbound, Chunk::new(vec![3u8; 64])).unwrap();
        flow.entries[0].mark_data_started(fx.clock.now());

        *fx.transport.refuse.lock().unwrap() = Some(TransportError::NoMemory);
        d.apply_verdict(&mut flow, 0, Direction::Inbound, 64, 64).unwrap();
        assert!(flow.inbound.retry_reinject);
        assert_eq!(flow.inbound.reinject.len(), 64);
        assert!(fx.delivered().is_empty());

        *fx.transport.refuse.lock().unwrap() = None;
        d.service_reinject(&mut flow, Direction::Inbound);
        assert!(!flow.inbound.retry_reinject);
        assert_eq!(fx.delivered(), vec![3u8; 64]);
        assert_eq!(flow.inbound.outstanding(), 0);
    }

    #[test]
    fn test_datagram_tail_drop() {
        let mut config = EngineConfig::default();
        config.reclaim.max_buffer_count = 2;
        let fx = Fixture::new(&[1], SocketType::Datagram, config);
        let d = fx.dispatcher();
        let mut flow = fx.flow(1);

        for _ in 0..2 {
            assert_eq!(
                d.submit(&mut flow, Direction::Outbound, Chunk::new(vec![0u8; 10])).unwrap(),
                Disposition::Held
            );
        }
        assert_eq!(
            d.submit(&mut flow, Direction::Outbound, Chunk::new(vec![0u8; 10])).unwrap(),
            Disposition::TailDropped
        );
        assert_eq!(flow.out.tail_drops, 1);
        assert_eq!(flow.out.last, 20);
        assert_eq!(flow.out.buffers, 2);
    }

    #[test]
    fn test_closed_event_sent_once() {
        let fx = Fixture::new(&[1], SocketType::Stream, EngineConfig::default());
        let d = fx.dispatcher();
        let mut flow = fx.flow(1);
        fx.events(0);

        d.notify_closed(&mut flow);
        d.notify_closed(&mut flow);
        let events = fx.events(0);
        assert_eq!(events.len(), 1);
        let Event::Closed(closed) = &events[0] else {
            panic!("expected closed event, got {:?}", events[0]);
        };
        assert_eq!(closed.trace.first().map(|t| t.op), Some(TraceOp::Attached));
    }
}
