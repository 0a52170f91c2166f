//! Events sent from the engine to filter agents.

use crate::header::{Direction, FlowId, OpCode};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

/// Keyed MAC over an event's identifying fields.
pub type Signature = [u8; 32];

/// Address family of the intercepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

/// Socket type of the intercepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketType {
    /// Connection oriented, one flow per socket
    Stream,
    /// Connectionless, flows demultiplexed by address
    Datagram,
    /// Raw IP, flows demultiplexed by address
    Raw,
}

impl SocketType {
    /// Whether flows are demultiplexed from a shared socket.
    pub fn is_connectionless(&self) -> bool {
        !matches!(self, Self::Stream)
    }
}

/// Who initiated the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowOrigin {
    /// Locally initiated (connect / first send)
    Outgoing,
    /// Remotely initiated (accept / first receive)
    Incoming,
}

/// Identity and addressing of a flow, as reported to agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketInfo {
    pub family: AddressFamily,
    pub socket_type: SocketType,
    /// IP protocol number
    pub protocol: u8,
    pub pid: u32,
    pub uuid: Uuid,
    /// Process the socket acts on behalf of
    pub effective_pid: u32,
    pub effective_uuid: Uuid,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
}

/// Payload of the `Attached` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedEvent {
    pub info: SocketInfo,
    pub origin: FlowOrigin,
    /// Remote host name, when known
    pub domain: Option<String>,
    pub signature: Option<Signature>,
}

/// A range of flow bytes shown to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEvent {
    pub direction: Direction,
    /// Absolute offset of the first byte
    pub start: u64,
    /// Absolute offset one past the last byte
    pub end: u64,
    pub payload: Vec<u8>,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    /// Payload begins with an IP header
    pub ip_header: bool,
    pub signature: Option<Signature>,
}

/// Operation recorded in a flow's timing trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceOp {
    Attached,
    DataOut,
    DataIn,
    DisconnectOut,
    DisconnectIn,
    Verdict,
    Closed,
}

/// One timing trace entry, relative to the flow's first event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub op: TraceOp,
    pub elapsed_ms: u64,
}

/// Payload of the `Closed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedEvent {
    pub trace: Vec<TraceEntry>,
    pub bytes_out: u64,
    pub bytes_in: u64,
}

/// Byte counters for one flow in a stats batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStats {
    pub flow_id: FlowId,
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub local: Option<SocketAddr>,
}

/// Event body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Attached(AttachedEvent),
    Data(DataEvent),
    Disconnect { direction: Direction },
    Closed(ClosedEvent),
    /// Batched counters; the enclosing message carries flow id 0
    Stats { flows: Vec<FlowStats> },
}

impl Event {
    /// Operation code for this event.
    pub fn op(&self) -> OpCode {
        match self {
            Self::Attached(_) => OpCode::Attached,
            Self::Data(data) => match data.direction {
                Direction::Outbound => OpCode::DataOut,
                Direction::Inbound => OpCode::DataIn,
            },
            Self::Disconnect { direction } => match direction {
                Direction::Outbound => OpCode::DisconnectOut,
                Direction::Inbound => OpCode::DisconnectIn,
            },
            Self::Closed(_) => OpCode::Closed,
            Self::Stats { .. } => OpCode::Stats,
        }
    }
}

/// An event addressed to one flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMessage {
    pub flow_id: FlowId,
    pub event: Event,
}

impl EventMessage {
    pub fn new(flow_id: FlowId, event: Event) -> Self {
        Self { flow_id, event }
    }

    pub fn op(&self) -> OpCode {
        self.event.op()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_op_follows_direction() {
        let data = Event::Data(DataEvent {
            direction: Direction::Inbound,
            start: 0,
            end: 3,
            payload: b"abc".to_vec(),
            local: None,
            remote: None,
            ip_header: false,
            signature: None,
        });
        assert_eq!(data.op(), OpCode::DataIn);

        let disconnect = Event::Disconnect { direction: Direction::Outbound };
        assert_eq!(disconnect.op(), OpCode::DisconnectOut);
    }

    #[test]
    fn test_connectionless_types() {
        assert!(!SocketType::Stream.is_connectionless());
        assert!(SocketType::Datagram.is_connectionless());
        assert!(SocketType::Raw.is_connectionless());
    }
}
