//! flowgate control-channel protocol
//!
//! Messages exchanged between the interception engine and user-space
//! filter agents. Every frame is a fixed 20-byte header followed by a
//! JSON body:
//!
//! ```text
//! 0        4     5    6        8                16        20
//! +--------+-----+----+--------+----------------+---------+------
//! |version |class| op |reserved|    flow id     | length  | body
//! +--------+-----+----+--------+----------------+---------+------
//! ```
//!
//! Events flow engine → agent, actions flow agent → engine.

mod action;
mod codec;
mod event;
mod header;

pub use action::{Action, ActionMessage, DataUpdate};
pub use codec::{decode_action, decode_event, decode_header, encode_action, encode_event, ProtoError};
pub use event::{
    AddressFamily, AttachedEvent, ClosedEvent, DataEvent, Event, EventMessage, FlowOrigin,
    FlowStats, Signature, SocketInfo, SocketType, TraceEntry, TraceOp,
};
pub use header::{
    Direction, FlowId, MessageClass, MessageHeader, OpCode, HEADER_LEN, OFFSET_MAX,
    PROTOCOL_VERSION,
};
