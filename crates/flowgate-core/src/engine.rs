//! The engine facade.
//!
//! Agents talk to the engine through their [`FilterHandle`]; the socket
//! layer talks to it through [`Socket`]s. Action handlers resolve a flow
//! through the registry first, then lock its socket and re-validate, so
//! the registry lock is never held while waiting on a socket.

use crate::channel::ControlChannel;
use crate::clock::Clock;
use crate::config::{ConfigError, EngineConfig};
use crate::counters::{Counters, CountersSnapshot};
use crate::dispatch::Dispatcher;
use crate::error::{FilterError, RegistryError};
use crate::flow::FlowState;
use crate::registry::{FilterHandle, FilterRegistry, SlotInfo};
use crate::reporter::ReportSet;
use crate::socket::{Socket, SocketCore};
use crate::transport::{PolicyLookup, Transport};
use crate::{reclaim, reporter};
use crossbeam_channel::{Receiver, Sender};
use flowgate_proto::{
    decode_action, Action, ActionMessage, DataUpdate, Direction, FlowId, SocketInfo, TraceOp,
    OFFSET_MAX,
};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// State shared by the engine, its sockets and its workers.
pub(crate) struct Shared {
    pub config: EngineConfig,
    pub registry: FilterRegistry,
    pub counters: Counters,
    pub clock: Arc<dyn Clock>,
    pub policy: Arc<dyn PolicyLookup>,
    pub reports: ReportSet,
    sockets: RwLock<HashMap<u32, Weak<SocketCore>>>,
    next_generation: AtomicU32,
    reclaim_wake: (Sender<()>, Receiver<()>),
    stats_wake: (Sender<()>, Receiver<()>),
}

impl Shared {
    pub fn dispatcher<'a>(&'a self, socket: &'a SocketCore) -> Dispatcher<'a> {
        Dispatcher {
            registry: &self.registry,
            counters: &self.counters,
            clock: self.clock.as_ref(),
            config: &self.config,
            socket,
        }
    }

    pub fn wake_reclaimer(&self) {
        let _ = self.reclaim_wake.0.try_send(());
    }

    pub fn wake_reporter(&self) {
        let _ = self.stats_wake.0.try_send(());
    }

    pub fn forget_socket(&self, generation: u32) {
        self.sockets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&generation);
    }

    /// Pin every live socket.
    pub fn sockets(&self) -> Vec<Arc<SocketCore>> {
        let sockets = self.sockets.read().unwrap_or_else(PoisonError::into_inner);
        let mut live: Vec<Arc<SocketCore>> = sockets.values().filter_map(Weak::upgrade).collect();
        live.sort_by_key(|s| s.generation);
        live
    }
}

/// Content filter engine.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        policy: Arc<dyn PolicyLookup>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = FilterRegistry::new(config.max_filters);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                registry,
                counters: Counters::new(),
                clock,
                policy,
                reports: ReportSet::default(),
                sockets: RwLock::new(HashMap::new()),
                next_generation: AtomicU32::new(1),
                reclaim_wake: crossbeam_channel::bounded(1),
                stats_wake: crossbeam_channel::bounded(1),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Register a socket with the engine.
    pub fn open_socket(
        &self,
        info: SocketInfo,
        domain: Option<String>,
        transport: Arc<dyn Transport>,
    ) -> Socket {
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let core = Arc::new(SocketCore::new(generation, info, domain, transport));
        self.shared
            .sockets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(generation, Arc::downgrade(&core));
        debug!("Socket {} opened", generation);
        Socket::new(core, self.shared.clone())
    }

    pub fn connect_filter(
        &self,
        unit: u32,
        channel: Arc<dyn ControlChannel>,
    ) -> Result<FilterHandle, RegistryError> {
        self.shared.registry.connect(unit, channel)
    }

    /// Detach a filter from every flow and free its slot.
    ///
    /// Held data is first passed unconditionally so it moves on instead of
    /// being lost.
    pub fn disconnect_filter(&self, handle: FilterHandle) -> Result<(), RegistryError> {
        let unit = handle.unit();
        let links = self.shared.registry.begin_disconnect(handle)?;
        let mut detached = 0;

        for link in links {
            let Some(core) = link.socket.upgrade() else {
                continue;
            };
            let mut state = core.lock();
            let Some(flow) = SocketCore::flow_mut(&mut state, &link) else {
                continue;
            };
            let Some(idx) = flow.entry_index(unit) else {
                continue;
            };
            let d = self.shared.dispatcher(&core);
            flow.entries[idx].mark_data_started(self.shared.clock.now());
            for direction in Direction::BOTH {
                let _ = d.apply_verdict(flow, idx, direction, OFFSET_MAX, OFFSET_MAX);
            }
            flow.entries[idx].unlink();
            self.shared.registry.unlink(unit, flow.id());
            for direction in Direction::BOTH {
                flow.refresh_pass_offset(direction);
                d.service_reinject(flow, direction);
            }
            core.wake_close_waiters();
            detached += 1;
        }

        self.shared.registry.finish_disconnect(handle)?;
        info!("Filter {} detached from {} flows", unit, detached);
        Ok(())
    }

    pub fn set_policy_unit(&self, handle: FilterHandle, policy_unit: u32) -> Result<(), RegistryError> {
        self.shared.registry.set_policy_unit(handle, policy_unit)
    }

    pub fn set_preserve_connections(&self, handle: FilterHandle, on: bool) -> Result<(), RegistryError> {
        self.shared.registry.set_preserve_connections(handle, on)?;
        info!(
            "Preserve connections {}",
            if self.shared.registry.preserves_all() { "on" } else { "off" }
        );
        Ok(())
    }

    pub fn preserve_connections(&self, handle: FilterHandle) -> Result<bool, RegistryError> {
        self.shared.registry.preserve_connections(handle)
    }

    pub fn filter_info(&self, handle: FilterHandle) -> Option<SlotInfo> {
        self.shared.registry.lookup(handle.unit())
    }

    fn invalid(&self, reason: String) -> FilterError {
        Counters::bump(&self.shared.counters.invalid_actions);
        warn!("Invalid action: {}", reason);
        FilterError::InvalidState(reason)
    }

    /// Resolve `flow_id` for the filter on `handle` and run `f` with the
    /// socket locked.
    fn with_flow<R>(
        &self,
        handle: FilterHandle,
        flow_id: FlowId,
        f: impl FnOnce(&Dispatcher<'_>, &mut FlowState, usize) -> Result<R, FilterError>,
    ) -> Result<R, FilterError> {
        let unit = handle.unit();
        let link = self
            .shared
            .registry
            .flows(unit)
            .into_iter()
            .find(|l| l.flow_id() == flow_id)
            .ok_or_else(|| self.invalid(format!("{} not attached to {}", flow_id, unit)))?;
        let core = link
            .socket
            .upgrade()
            .ok_or_else(|| self.invalid(format!("{} socket gone", flow_id)))?;

        let mut state = core.lock();
        self.shared.registry.validate(handle)?;
        let flow = SocketCore::flow_mut(&mut state, &link)
            .ok_or_else(|| self.invalid(format!("{} freed", flow_id)))?;
        let idx = flow
            .entry_index(unit)
            .ok_or_else(|| self.invalid(format!("{} detached from {}", flow_id, unit)))?;
        let d = self.shared.dispatcher(&core);
        f(&d, flow, idx)
    }

    /// Handle an encoded action frame from the agent on `handle`.
    pub fn handle_action_frame(&self, handle: FilterHandle, frame: &[u8]) -> Result<(), FilterError> {
        let msg = decode_action(frame).inspect_err(|e| {
            Counters::bump(&self.shared.counters.invalid_actions);
            warn!("Bad action frame from {}: {}", handle.unit(), e);
        })?;
        self.handle_action(handle, msg)
    }

    pub fn handle_action(&self, handle: FilterHandle, msg: ActionMessage) -> Result<(), FilterError> {
        match msg.action {
            Action::DataUpdate(update) => self.data_update(handle, msg.flow_id, update),
            Action::Drop => self.drop_flow(handle, msg.flow_id),
            Action::BlessClient { client } => self.bless_client(handle, client),
            Action::SetCryptoKey { key } => {
                self.shared.registry.set_signer(handle, &key)?;
                Ok(())
            }
        }
    }

    fn data_update(
        &self,
        handle: FilterHandle,
        flow_id: FlowId,
        update: DataUpdate,
    ) -> Result<(), FilterError> {
        let min_interval = self.shared.config.stats.min_interval;
        let mut wants_stats = false;

        let result = self.with_flow(handle, flow_id, |d, flow, idx| {
            if flow.flags.dropped {
                return Err(self.invalid(format!("{} already dropped", flow_id)));
            }
            if !flow.entries[idx].attach_sent() {
                return Err(self.invalid(format!("{} attach not sent", flow_id)));
            }
            let now = d.clock.now();
            flow.entries[idx].mark_data_started(now);
            flow.flags.initial_verdict = true;
            flow.record(TraceOp::Verdict, now);
            Counters::bump(&d.counters.verdicts);

            if let Some(ms) = update.stats_interval_ms {
                let entry = &mut flow.entries[idx];
                entry.stats_interval = match ms {
                    0 => None,
                    ms => Some(Duration::from_millis(ms as u64).max(min_interval)),
                };
                wants_stats = entry.stats_interval.is_some();
            }

            if wants_stats {
                self.shared.reports.enrol(&flow.link);
            }
            // A failed outbound half leaves the inbound half unapplied.
            for (direction, pass, peek) in [
                (Direction::Outbound, update.out_pass, update.out_peek),
                (Direction::Inbound, update.in_pass, update.in_peek),
            ] {
                if pass == 0 && peek == 0 {
                    continue;
                }
                d.apply_verdict(flow, idx, direction, pass, peek)?;
            }
            Ok(())
        });

        if wants_stats {
            self.shared.wake_reporter();
        }
        result
    }

    fn drop_flow(&self, handle: FilterHandle, flow_id: FlowId) -> Result<(), FilterError> {
        self.with_flow(handle, flow_id, |d, flow, idx| {
            if flow.flags.dropped {
                return Err(self.invalid(format!("{} already dropped", flow_id)));
            }
            if !flow.entries[idx].attach_sent() {
                return Err(self.invalid(format!("{} attach not sent", flow_id)));
            }
            let now = d.clock.now();
            flow.entries[idx].mark_data_started(now);
            flow.record(TraceOp::Verdict, now);
            Counters::bump(&d.counters.verdicts);
            d.drop_flow(flow);
            Ok(())
        })
    }

    /// Let every flow of a trusted client through this filter.
    fn bless_client(&self, handle: FilterHandle, client: Uuid) -> Result<(), FilterError> {
        self.shared.registry.validate(handle)?;
        let unit = handle.unit();
        let mut blessed = 0;

        for core in self.shared.sockets() {
            if core.info.uuid != client && core.info.effective_uuid != client {
                continue;
            }
            let mut state = core.lock();
            if state.flows.is_empty() {
                state.skip_filter = true;
                blessed += 1;
                continue;
            }
            let d = self.shared.dispatcher(&core);
            for flow in state.flows.values_mut() {
                let Some(idx) = flow.entry_index(unit) else {
                    continue;
                };
                if flow.flags.dropped || !flow.entries[idx].attach_sent() {
                    continue;
                }
                flow.entries[idx].mark_data_started(d.clock.now());
                for direction in Direction::BOTH {
                    let _ = d.apply_verdict(flow, idx, direction, OFFSET_MAX, OFFSET_MAX);
                }
                blessed += 1;
            }
        }

        info!("Client {} blessed by {} ({} sockets/flows)", client, unit, blessed);
        Ok(())
    }

    /// Identity of a flow attached to the filter on `handle`.
    pub fn socket_info(&self, handle: FilterHandle, flow_id: FlowId) -> Result<SocketInfo, FilterError> {
        let info = self
            .shared
            .registry
            .flows(handle.unit())
            .into_iter()
            .find(|l| l.flow_id() == flow_id)
            .and_then(|l| l.socket.upgrade().map(|core| (l, core)));
        let Some((link, core)) = info else {
            return Err(FilterError::InvalidState(format!("{} not attached", flow_id)));
        };
        let mut state = core.lock();
        self.shared.registry.validate(handle)?;
        SocketCore::flow_mut(&mut state, &link)
            .map(|flow| flow.socket_info(&core.info))
            .ok_or_else(|| FilterError::InvalidState(format!("{} freed", flow_id)))
    }

    /// The agent on `handle` has drained its channel: retry whatever was
    /// held back by flow control.
    pub fn channel_drained(&self, handle: FilterHandle) -> Result<(), FilterError> {
        let unit = handle.unit();
        let links = self.shared.registry.channel_drained(handle)?;
        let mut retried = 0;

        for link in links {
            let Some(core) = link.socket.upgrade() else {
                continue;
            };
            let mut state = core.lock();
            let Some(flow) = SocketCore::flow_mut(&mut state, &link) else {
                continue;
            };
            let Some(idx) = flow.entry_index(unit) else {
                continue;
            };
            let entry = &mut flow.entries[idx];
            if !entry.flow_controlled && entry.attach_sent() {
                continue;
            }
            entry.flow_controlled = false;

            let d = self.shared.dispatcher(&core);
            for direction in Direction::BOTH {
                if let Err(e) = d.service_control_queue(flow, idx, direction) {
                    debug!("{} still held by {}: {}", flow.id(), unit, e);
                    break;
                }
                d.service_reinject(flow, direction);
                flow.refresh_pass_offset(direction);
            }
            retried += 1;
        }

        debug!("Filter {} drained, {} flows retried", unit, retried);
        Ok(())
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.shared.counters.snapshot()
    }

    /// One reclamation pass over connectionless flows.
    pub fn reclaim_idle_flows(&self) -> usize {
        reclaim::run_once(&self.shared)
    }

    /// One stats reporting pass.
    pub fn report_stats(&self) -> usize {
        reporter::run_once(&self.shared)
    }

    /// Number of flows waiting in the stats report set.
    pub fn reporting_flows(&self) -> usize {
        self.shared.reports.len()
    }

    /// Start the reclaimer and stats reporter threads.
    pub fn spawn_workers(&self) -> io::Result<Workers> {
        let running = Arc::new(AtomicBool::new(true));
        let reclaimer = {
            let shared = self.shared.clone();
            let running = running.clone();
            let wake = shared.reclaim_wake.1.clone();
            thread::Builder::new()
                .name("flowgate-reclaim".to_string())
                .spawn(move || reclaim::run_worker(&shared, &running, &wake))?
        };
        let reporter = {
            let shared = self.shared.clone();
            let running = running.clone();
            let wake = shared.stats_wake.1.clone();
            thread::Builder::new()
                .name("flowgate-stats".to_string())
                .spawn(move || reporter::run_worker(&shared, &running, &wake))?
        };
        Ok(Workers {
            running,
            shared: self.shared.clone(),
            handles: vec![reclaimer, reporter],
        })
    }
}

/// Background workers; stopped and joined on drop.
pub struct Workers {
    running: Arc<AtomicBool>,
    shared: Arc<Shared>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Workers {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.shared.wake_reclaimer();
        self.shared.wake_reporter();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.stop();
    }
}
