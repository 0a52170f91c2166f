//! Simulated user-space filter agent.
//!
//! Reads event frames off its control channel and answers with actions:
//! inbound traffic passes, outbound traffic is inspected and dropped when
//! it carries a blocked pattern.

use crate::config::AgentConfig;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use flowgate_core::{Engine, FilterError, FilterHandle, Signer};
use flowgate_proto::{
    decode_event, encode_action, Action, ActionMessage, DataUpdate, Direction, Event, FlowId,
    OFFSET_MAX,
};
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the agent saw over its lifetime.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AgentReport {
    pub attached: u64,
    pub data_events: u64,
    pub bytes_inspected: u64,
    pub drops: u64,
    pub disconnects: u64,
    pub closed: u64,
    pub stats_batches: u64,
    pub bad_signatures: u64,
    pub rejected_actions: u64,
}

struct Agent {
    engine: Engine,
    handle: FilterHandle,
    config: AgentConfig,
    signer: Option<Signer>,
    report: AgentReport,
}

impl Agent {
    fn handle_frame(&mut self, frame: &[u8]) {
        let msg = match decode_event(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Agent {}: undecodable event: {}", self.handle.unit(), e);
                return;
            }
        };
        let flow_id = msg.flow_id;

        match msg.event {
            Event::Attached(attached) => {
                self.report.attached += 1;
                if let (Some(signer), Some(sig)) = (&self.signer, &attached.signature) {
                    if signer.sign_attached(flow_id, &attached.info) != *sig {
                        self.report.bad_signatures += 1;
                        warn!("{}: attach signature mismatch", flow_id);
                    }
                }
                debug!(
                    "{} attached: pid {} -> {:?} ({})",
                    flow_id,
                    attached.info.pid,
                    attached.info.remote,
                    attached.domain.as_deref().unwrap_or("-")
                );
                self.act(
                    flow_id,
                    Action::DataUpdate(DataUpdate {
                        out_pass: 0,
                        out_peek: OFFSET_MAX,
                        in_pass: OFFSET_MAX,
                        in_peek: OFFSET_MAX,
                        stats_interval_ms: Some(self.config.stats_interval_ms),
                    }),
                );
            }
            Event::Data(data) => {
                self.report.data_events += 1;
                self.report.bytes_inspected += data.payload.len() as u64;
                if data.direction == Direction::Outbound && self.is_blocked(&data.payload) {
                    info!("{} blocked at offset {}", flow_id, data.start);
                    self.report.drops += 1;
                    self.act(flow_id, Action::Drop);
                } else {
                    let update = match data.direction {
                        Direction::Outbound => DataUpdate::outbound(data.end, OFFSET_MAX),
                        Direction::Inbound => DataUpdate::inbound(data.end, OFFSET_MAX),
                    };
                    self.act(flow_id, Action::DataUpdate(update));
                }
            }
            Event::Disconnect { direction } => {
                self.report.disconnects += 1;
                debug!("{} disconnected {}", flow_id, direction);
                // Nothing more to inspect: let everything through.
                self.act(flow_id, Action::DataUpdate(DataUpdate::both(OFFSET_MAX, OFFSET_MAX)));
            }
            Event::Closed(closed) => {
                self.report.closed += 1;
                debug!(
                    "{} closed: {} bytes out, {} bytes in, {} trace entries",
                    flow_id,
                    closed.bytes_out,
                    closed.bytes_in,
                    closed.trace.len()
                );
            }
            Event::Stats { flows } => {
                self.report.stats_batches += 1;
                for stats in flows {
                    debug!("{}: {} out / {} in", stats.flow_id, stats.bytes_out, stats.bytes_in);
                }
            }
        }
    }

    fn is_blocked(&self, payload: &[u8]) -> bool {
        self.config.blocked.iter().any(|pattern| {
            let pattern = pattern.as_bytes();
            !pattern.is_empty() && payload.windows(pattern.len()).any(|w| w == pattern)
        })
    }

    fn act(&mut self, flow_id: FlowId, action: Action) {
        let frame = match encode_action(&ActionMessage::new(flow_id, action)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Agent {}: cannot encode action: {}", self.handle.unit(), e);
                return;
            }
        };
        match self.engine.handle_action_frame(self.handle, &frame) {
            Ok(()) | Err(FilterError::BackPressure) => {}
            Err(e) => {
                self.report.rejected_actions += 1;
                debug!("{}: action rejected: {}", flow_id, e);
            }
        }
    }

    /// Let the engine retry deliveries once the channel is empty.
    fn resume(&self) {
        let controlled = self
            .engine
            .filter_info(self.handle)
            .is_some_and(|slot| slot.flow_controlled);
        if controlled {
            if let Err(e) = self.engine.channel_drained(self.handle) {
                warn!("Agent {}: drain failed: {}", self.handle.unit(), e);
            }
        }
    }
}

/// Run an agent on its own thread until `running` clears and its channel
/// is empty.
pub fn spawn(
    engine: Engine,
    handle: FilterHandle,
    rx: Receiver<Vec<u8>>,
    config: AgentConfig,
    running: Arc<AtomicBool>,
) -> io::Result<thread::JoinHandle<AgentReport>> {
    let signer = match config.crypto_key.as_deref().map(|k| Signer::new(k.as_bytes())) {
        Some(Ok(signer)) => Some(signer),
        Some(Err(e)) => return Err(io::Error::new(io::ErrorKind::InvalidInput, e)),
        None => None,
    };
    let mut agent = Agent {
        engine,
        handle,
        config,
        signer,
        report: AgentReport::default(),
    };

    thread::Builder::new()
        .name(format!("agent-{}", handle.unit().0))
        .spawn(move || {
            info!("Agent {} started", handle.unit());
            while running.load(Ordering::Relaxed) || !rx.is_empty() {
                match rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(frame) => agent.handle_frame(&frame),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                if rx.is_empty() {
                    agent.resume();
                }
            }
            info!("Agent {} stopped", handle.unit());
            agent.report
        })
}
