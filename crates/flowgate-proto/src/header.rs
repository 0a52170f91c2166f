//! Fixed message header shared by events and actions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol revision carried in every header.
pub const PROTOCOL_VERSION: u32 = 1;

/// Offset sentinel meaning "pass or peek everything from here on".
pub const OFFSET_MAX: u64 = u64::MAX;

/// Encoded header size in bytes.
pub const HEADER_LEN: usize = 20;

/// Opaque flow handle exchanged with agents.
///
/// The upper 32 bits are the owning socket's generation counter, the lower
/// 32 bits a non-zero hash of the flow's address pair, unique within the
/// socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub u64);

impl FlowId {
    /// Compose a flow id from a socket generation and a flow hash.
    pub fn new(generation: u32, flow_hash: u32) -> Self {
        Self(((generation as u64) << 32) | flow_hash as u64)
    }

    /// Socket generation bits.
    pub fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Flow hash bits.
    pub fn flow_hash(&self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flow({:#018x})", self.0)
    }
}

/// Data direction relative to the local application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Application to peer
    Outbound,
    /// Peer to application
    Inbound,
}

impl Direction {
    /// Both directions, outbound first.
    pub const BOTH: [Direction; 2] = [Direction::Outbound, Direction::Inbound];

    pub fn is_outbound(&self) -> bool {
        matches!(self, Self::Outbound)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outbound => write!(f, "out"),
            Self::Inbound => write!(f, "in"),
        }
    }
}

/// Which side a message travels from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageClass {
    /// Engine to agent
    Event,
    /// Agent to engine
    Action,
}

/// Operation code for every message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    Attached,
    DataOut,
    DataIn,
    DisconnectOut,
    DisconnectIn,
    Closed,
    Stats,
    DataUpdate,
    Drop,
    BlessClient,
    SetCryptoKey,
}

impl OpCode {
    /// Message class this operation belongs to.
    pub fn class(&self) -> MessageClass {
        match self {
            Self::Attached
            | Self::DataOut
            | Self::DataIn
            | Self::DisconnectOut
            | Self::DisconnectIn
            | Self::Closed
            | Self::Stats => MessageClass::Event,
            Self::DataUpdate | Self::Drop | Self::BlessClient | Self::SetCryptoKey => {
                MessageClass::Action
            }
        }
    }

    /// Wire value.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Attached => 1,
            Self::DataOut => 2,
            Self::DataIn => 3,
            Self::DisconnectOut => 4,
            Self::DisconnectIn => 5,
            Self::Closed => 6,
            Self::Stats => 7,
            Self::DataUpdate => 16,
            Self::Drop => 17,
            Self::BlessClient => 18,
            Self::SetCryptoKey => 19,
        }
    }

    /// Parse a wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        let op = match value {
            1 => Self::Attached,
            2 => Self::DataOut,
            3 => Self::DataIn,
            4 => Self::DisconnectOut,
            5 => Self::DisconnectIn,
            6 => Self::Closed,
            7 => Self::Stats,
            16 => Self::DataUpdate,
            17 => Self::Drop,
            18 => Self::BlessClient,
            19 => Self::SetCryptoKey,
            _ => return None,
        };
        Some(op)
    }
}

/// Header preceding every framed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u32,
    pub class: MessageClass,
    pub op: OpCode,
    pub flow_id: FlowId,
    /// Total frame length, header included
    pub length: u32,
}

impl MessageHeader {
    /// Header for a frame of `length` total bytes.
    pub fn new(op: OpCode, flow_id: FlowId, length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            class: op.class(),
            op,
            flow_id,
            length,
        }
    }

    /// Big-endian encoding: version, class, op, reserved, flow id, length.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.version.to_be_bytes());
        out[4] = match self.class {
            MessageClass::Event => 1,
            MessageClass::Action => 2,
        };
        out[5] = self.op.to_u8();
        out[8..16].copy_from_slice(&self.flow_id.0.to_be_bytes());
        out[16..20].copy_from_slice(&self.length.to_be_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_id_parts() {
        let id = FlowId::new(7, 0xdead_beef);
        assert_eq!(id.generation(), 7);
        assert_eq!(id.flow_hash(), 0xdead_beef);
        assert_eq!(id.0, 0x0000_0007_dead_beef);
    }

    #[test]
    fn test_op_class() {
        assert_eq!(OpCode::DataIn.class(), MessageClass::Event);
        assert_eq!(OpCode::Drop.class(), MessageClass::Action);
        assert_eq!(OpCode::from_u8(OpCode::SetCryptoKey.to_u8()), Some(OpCode::SetCryptoKey));
        assert_eq!(OpCode::from_u8(0), None);
    }

    #[test]
    fn test_header_layout() {
        let header = MessageHeader::new(OpCode::Closed, FlowId(0x0102), 64);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &PROTOCOL_VERSION.to_be_bytes());
        assert_eq!(bytes[4], 1);
        assert_eq!(bytes[5], OpCode::Closed.to_u8());
        assert_eq!(&bytes[16..20], &64u32.to_be_bytes());
    }
}
