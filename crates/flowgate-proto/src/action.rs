//! Actions sent from filter agents to the engine.

use crate::header::{FlowId, OpCode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// New pass/peek offsets for both directions.
///
/// A direction whose pass and peek are both zero is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataUpdate {
    pub out_pass: u64,
    pub out_peek: u64,
    pub in_pass: u64,
    pub in_peek: u64,
    /// Periodic stats interval; `Some(0)` turns reporting off
    pub stats_interval_ms: Option<u32>,
}

impl DataUpdate {
    /// Update covering both directions with the same offsets.
    pub fn both(pass: u64, peek: u64) -> Self {
        Self {
            out_pass: pass,
            out_peek: peek,
            in_pass: pass,
            in_peek: peek,
            stats_interval_ms: None,
        }
    }

    /// Update for the outbound direction only.
    pub fn outbound(pass: u64, peek: u64) -> Self {
        Self {
            out_pass: pass,
            out_peek: peek,
            ..Self::default()
        }
    }

    /// Update for the inbound direction only.
    pub fn inbound(pass: u64, peek: u64) -> Self {
        Self {
            in_pass: pass,
            in_peek: peek,
            ..Self::default()
        }
    }
}

/// Action body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    DataUpdate(DataUpdate),
    Drop,
    /// Stop inspecting every flow owned by this client
    BlessClient { client: Uuid },
    SetCryptoKey { key: Vec<u8> },
}

impl Action {
    pub fn op(&self) -> OpCode {
        match self {
            Self::DataUpdate(_) => OpCode::DataUpdate,
            Self::Drop => OpCode::Drop,
            Self::BlessClient { .. } => OpCode::BlessClient,
            Self::SetCryptoKey { .. } => OpCode::SetCryptoKey,
        }
    }
}

/// An action addressed to one flow.
///
/// `BlessClient` and `SetCryptoKey` ignore the flow id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionMessage {
    pub flow_id: FlowId,
    pub action: Action,
}

impl ActionMessage {
    pub fn new(flow_id: FlowId, action: Action) -> Self {
        Self { flow_id, action }
    }
}
