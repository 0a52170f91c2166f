//! Periodic per-flow byte counter reports.
//!
//! Flows enter the report set when a filter asks for a reporting interval.
//! Each pass visits a bounded number of flows, resuming after the last one
//! visited, and sends one `Stats` batch per filter.

use crate::counters::Counters;
use crate::engine::Shared;
use crate::flow::FlowLink;
use crate::registry::FilterUnit;
use crate::socket::SocketCore;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use flowgate_proto::{Event, EventMessage, FlowId, FlowStats};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, trace};

#[derive(Default)]
struct Inner {
    flows: BTreeMap<FlowId, Weak<FlowLink>>,
    /// Last flow visited by the previous pass
    cursor: Option<FlowId>,
}

/// Flows with at least one filter that wants reports.
#[derive(Default)]
pub(crate) struct ReportSet {
    inner: Mutex<Inner>,
}

impl ReportSet {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enrol(&self, link: &Arc<FlowLink>) {
        self.lock().flows.insert(link.flow_id(), Arc::downgrade(link));
    }

    pub fn len(&self) -> usize {
        self.lock().flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().flows.is_empty()
    }

    /// Up to `limit` flows following the cursor, wrapping around.
    fn next_batch(&self, limit: usize) -> Vec<(FlowId, Weak<FlowLink>)> {
        let mut inner = self.lock();
        let after = match inner.cursor {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        let mut batch: Vec<_> = inner
            .flows
            .range((after, Bound::Unbounded))
            .take(limit)
            .map(|(id, link)| (*id, link.clone()))
            .collect();
        if batch.len() < limit {
            let wrapped: Vec<_> = inner
                .flows
                .iter()
                .take_while(|(id, _)| after_cursor(inner.cursor, **id))
                .take(limit - batch.len())
                .map(|(id, link)| (*id, link.clone()))
                .collect();
            batch.extend(wrapped);
        }
        inner.cursor = batch.last().map(|(id, _)| *id);
        batch
    }

    fn remove(&self, flow_id: FlowId) {
        self.lock().flows.remove(&flow_id);
    }
}

fn after_cursor(cursor: Option<FlowId>, id: FlowId) -> bool {
    cursor.is_some_and(|c| id <= c)
}

/// One reporting pass. Returns the number of stats messages sent.
pub(crate) fn run_once(shared: &Shared) -> usize {
    let now = shared.clock.now();
    let batch = shared.reports.next_batch(shared.config.stats.max_flows_per_run);
    let mut per_unit: HashMap<FilterUnit, Vec<FlowStats>> = HashMap::new();

    for (flow_id, weak) in batch {
        let Some((link, core)) = weak
            .upgrade()
            .and_then(|link| link.socket.upgrade().map(|core| (link, core)))
        else {
            shared.reports.remove(flow_id);
            continue;
        };
        let mut state = core.lock();
        let Some(flow) = SocketCore::flow_mut(&mut state, &link) else {
            shared.reports.remove(flow_id);
            continue;
        };

        let (bytes_out, bytes_in, local) = (flow.bytes_out, flow.bytes_in, flow.local);
        let mut reporting = false;
        for entry in flow.entries.iter_mut() {
            let (Some(unit), Some(interval)) = (entry.unit(), entry.stats_interval) else {
                continue;
            };
            if entry.is_detached() {
                continue;
            }
            reporting = true;
            let due = entry
                .stats_reported_at
                .is_none_or(|at| now.duration_since(at) >= interval);
            let changed = bytes_out != entry.reported_out || bytes_in != entry.reported_in;
            if !due || !changed {
                continue;
            }
            per_unit.entry(unit).or_default().push(FlowStats {
                flow_id,
                bytes_out,
                bytes_in,
                local: if entry.local_reported { None } else { local.or(core.info.local) },
            });
            entry.local_reported = true;
            entry.reported_out = bytes_out;
            entry.reported_in = bytes_in;
            entry.stats_reported_at = Some(now);
        }
        if !reporting {
            trace!("{} leaves the report set", flow_id);
            shared.reports.remove(flow_id);
        }
    }

    let mut sent = 0;
    let mut units: Vec<_> = per_unit.into_iter().collect();
    units.sort_by_key(|(unit, _)| *unit);
    for (unit, flows) in units {
        let count = flows.len();
        let msg = EventMessage::new(FlowId(0), Event::Stats { flows });
        match shared.registry.send(unit, &msg) {
            Ok(()) => {
                Counters::bump(&shared.counters.stats_messages);
                sent += 1;
                trace!("Stats for {} flows sent to {}", count, unit);
            }
            Err(e) => debug!("Stats to {} not sent: {}", unit, e),
        }
    }
    sent
}

/// Reporter thread body.
pub(crate) fn run_worker(shared: &Shared, running: &AtomicBool, wake: &Receiver<()>) {
    debug!("Stats reporter started");
    while running.load(Ordering::Relaxed) {
        if shared.reports.is_empty() {
            if wake.recv().is_err() {
                break;
            }
            continue;
        }
        run_once(shared);
        if let Err(RecvTimeoutError::Disconnected) = wake.recv_timeout(shared.config.stats.min_interval) {
            break;
        }
    }
    debug!("Stats reporter stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(id: u64) -> Arc<FlowLink> {
        Arc::new(FlowLink::new(FlowId(id), Weak::new()))
    }

    #[test]
    fn test_batches_resume_after_cursor() {
        let set = ReportSet::default();
        let links: Vec<_> = (1..=5).map(link).collect();
        for l in &links {
            set.enrol(l);
        }

        let ids = |batch: Vec<(FlowId, Weak<FlowLink>)>| batch.into_iter().map(|(id, _)| id.0).collect::<Vec<_>>();
        assert_eq!(ids(set.next_batch(2)), vec![1, 2]);
        assert_eq!(ids(set.next_batch(2)), vec![3, 4]);
        assert_eq!(ids(set.next_batch(2)), vec![5, 1]);

        set.remove(FlowId(2));
        assert_eq!(set.len(), 4);
        assert_eq!(ids(set.next_batch(10)), vec![3, 4, 5, 1]);
    }
}
