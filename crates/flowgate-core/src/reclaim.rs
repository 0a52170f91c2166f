//! Idle connectionless flow reclamation.
//!
//! Datagram flows have no close of their own. A flow is reclaimed when a
//! filter has sat on queued data past the action timeout, or when it had
//! to tail drop.

use crate::counters::Counters;
use crate::engine::Shared;
use crate::error::FilterError;
use crate::flow::FlowState;
use crate::socket::free_flow;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use flowgate_proto::Direction;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Why a flow is being reclaimed.
fn expired(flow: &FlowState, now: Instant, timeout: Duration) -> Option<String> {
    if flow.out.tail_drops > 0 || flow.inbound.tail_drops > 0 {
        return Some(format!(
            "tail dropped {} datagrams",
            flow.out.tail_drops + flow.inbound.tail_drops
        ));
    }
    for entry in flow.entries.iter().filter(|e| e.is_linked() && !e.is_detached()) {
        let stalled = Direction::BOTH
            .iter()
            .any(|&d| entry.holds_unpassed(d, flow.pending(d).last));
        if !stalled {
            continue;
        }
        let since = entry.last_action.unwrap_or(flow.created);
        if now.duration_since(since) >= timeout {
            return Some(FilterError::ActionTimeout.to_string());
        }
    }
    None
}

/// One reclamation pass. Returns the number of flows reclaimed.
pub(crate) fn run_once(shared: &Shared) -> usize {
    let now = shared.clock.now();
    let timeout = shared.config.reclaim.action_timeout;
    let mut budget = shared.config.reclaim.max_flows_per_run;
    let mut reclaimed = 0;

    for core in shared.sockets() {
        if budget == 0 {
            break;
        }
        if !core.is_connectionless() {
            continue;
        }
        let mut state = core.lock();
        let mut doomed = Vec::new();
        for (hash, flow) in state.flows.iter() {
            if let Some(reason) = expired(flow, now, timeout) {
                debug!("{} expired: {}", flow.id(), reason);
                doomed.push(*hash);
                // Only reclaimed flows count against the budget.
                budget -= 1;
                if budget == 0 {
                    break;
                }
            }
        }

        let d = shared.dispatcher(&core);
        for hash in doomed {
            let Some(mut flow) = state.remove_flow(hash) else {
                continue;
            };
            flow.flags.socket_closed = true;
            d.notify_closed(&mut flow);
            free_flow(&d, &mut flow);
            Counters::bump(&shared.counters.reclaimed_flows);
            info!("{} reclaimed", flow.id());
            reclaimed += 1;
        }
    }
    reclaimed
}

/// Reclaimer thread body.
pub(crate) fn run_worker(shared: &Shared, running: &AtomicBool, wake: &Receiver<()>) {
    debug!("Flow reclaimer started");
    while running.load(Ordering::Relaxed) {
        match wake.recv_timeout(shared.config.reclaim.interval) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if !running.load(Ordering::Relaxed) {
            break;
        }
        run_once(shared);
    }
    debug!("Flow reclaimer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::FilterEntry;
    use crate::flow::FlowLink;
    use crate::registry::FilterUnit;
    use flowgate_proto::{FlowId, FlowOrigin};
    use std::sync::{Arc, Weak};

    fn flow(created: Instant) -> FlowState {
        let link = Arc::new(FlowLink::new(FlowId::new(1, 9), Weak::new()));
        let mut flow = FlowState::new(link, FlowOrigin::Outgoing, None, None, 1, 1, created);
        flow.entries.push(FilterEntry::new(FilterUnit(1), 1));
        flow
    }

    #[test]
    fn test_expiry_needs_unpassed_data() {
        let start = Instant::now();
        let timeout = Duration::from_secs(10);
        let mut flow = flow(start);

        assert_eq!(expired(&flow, start + timeout * 2, timeout), None);

        flow.out.last = 64;
        assert_eq!(expired(&flow, start + Duration::from_secs(9), timeout), None);
        assert!(expired(&flow, start + timeout, timeout).is_some());

        flow.entries[0].out.pass_offset = 64;
        assert_eq!(expired(&flow, start + timeout, timeout), None);
    }

    #[test]
    fn test_tail_drop_expires_at_once() {
        let start = Instant::now();
        let mut flow = flow(start);
        flow.inbound.tail_drops = 1;
        assert!(expired(&flow, start, Duration::from_secs(10)).is_some());
    }
}
