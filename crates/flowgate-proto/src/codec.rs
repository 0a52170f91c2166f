//! Frame codec: a fixed binary header followed by a JSON body.

use crate::action::{Action, ActionMessage};
use crate::event::{Event, EventMessage};
use crate::header::{FlowId, MessageClass, MessageHeader, OpCode, HEADER_LEN, PROTOCOL_VERSION};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Frame decoding errors
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Frame too short: {0} bytes")]
    Truncated(usize),
    #[error("Unsupported protocol version {0}")]
    BadVersion(u32),
    #[error("Unexpected message class")]
    BadClass,
    #[error("Unknown op code {0}")]
    BadOp(u8),
    #[error("Header length {header} does not match frame length {actual}")]
    BadLength { header: u32, actual: usize },
    #[error("Header op {header:?} does not match body op {body:?}")]
    OpMismatch { header: OpCode, body: OpCode },
    #[error("Frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("Body error: {0}")]
    Body(#[from] serde_json::Error),
}

/// Encode an event into a frame.
pub fn encode_event(msg: &EventMessage) -> Result<Vec<u8>, ProtoError> {
    encode(msg.op(), msg.flow_id, &msg.event)
}

/// Encode an action into a frame.
pub fn encode_action(msg: &ActionMessage) -> Result<Vec<u8>, ProtoError> {
    encode(msg.action.op(), msg.flow_id, &msg.action)
}

/// Decode and validate an event frame.
pub fn decode_event(frame: &[u8]) -> Result<EventMessage, ProtoError> {
    let (header, event): (_, Event) = decode(frame, MessageClass::Event)?;
    check_op(header.op, event.op())?;
    Ok(EventMessage::new(header.flow_id, event))
}

/// Decode and validate an action frame.
pub fn decode_action(frame: &[u8]) -> Result<ActionMessage, ProtoError> {
    let (header, action): (_, Action) = decode(frame, MessageClass::Action)?;
    check_op(header.op, action.op())?;
    Ok(ActionMessage::new(header.flow_id, action))
}

/// Parse just the header of a frame.
pub fn decode_header(frame: &[u8]) -> Result<MessageHeader, ProtoError> {
    if frame.len() < HEADER_LEN {
        return Err(ProtoError::Truncated(frame.len()));
    }
    let version = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    if version != PROTOCOL_VERSION {
        return Err(ProtoError::BadVersion(version));
    }
    let class = match frame[4] {
        1 => MessageClass::Event,
        2 => MessageClass::Action,
        _ => return Err(ProtoError::BadClass),
    };
    let op = OpCode::from_u8(frame[5]).ok_or(ProtoError::BadOp(frame[5]))?;
    let mut id = [0u8; 8];
    id.copy_from_slice(&frame[8..16]);
    let length = u32::from_be_bytes([frame[16], frame[17], frame[18], frame[19]]);

    Ok(MessageHeader {
        version,
        class,
        op,
        flow_id: FlowId(u64::from_be_bytes(id)),
        length,
    })
}

fn encode<T: Serialize>(op: OpCode, flow_id: FlowId, body: &T) -> Result<Vec<u8>, ProtoError> {
    let body = serde_json::to_vec(body)?;
    let total = HEADER_LEN + body.len();
    let length = u32::try_from(total).map_err(|_| ProtoError::TooLarge(total))?;

    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&MessageHeader::new(op, flow_id, length).to_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn decode<T: DeserializeOwned>(
    frame: &[u8],
    class: MessageClass,
) -> Result<(MessageHeader, T), ProtoError> {
    let header = decode_header(frame)?;
    if header.class != class || header.op.class() != class {
        return Err(ProtoError::BadClass);
    }
    if header.length as usize != frame.len() {
        return Err(ProtoError::BadLength {
            header: header.length,
            actual: frame.len(),
        });
    }
    let body = serde_json::from_slice(&frame[HEADER_LEN..])?;
    Ok((header, body))
}

fn check_op(header: OpCode, body: OpCode) -> Result<(), ProtoError> {
    if header != body {
        return Err(ProtoError::OpMismatch { header, body });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::DataUpdate;
    use crate::event::{ClosedEvent, TraceEntry, TraceOp};

    #[test]
    fn test_action_frame() {
        let msg = ActionMessage::new(FlowId(42), Action::DataUpdate(DataUpdate::both(10, 20)));
        let frame = encode_action(&msg).unwrap();

        let header = decode_header(&frame).unwrap();
        assert_eq!(header.op, OpCode::DataUpdate);
        assert_eq!(header.length as usize, frame.len());

        assert_eq!(decode_action(&frame).unwrap(), msg);
    }

    #[test]
    fn test_event_frame_rejected_as_action() {
        let msg = EventMessage::new(
            FlowId(1),
            Event::Closed(ClosedEvent {
                trace: vec![TraceEntry { op: TraceOp::Closed, elapsed_ms: 3 }],
                bytes_out: 1,
                bytes_in: 2,
            }),
        );
        let frame = encode_event(&msg).unwrap();
        assert!(matches!(decode_action(&frame), Err(ProtoError::BadClass)));
        assert_eq!(decode_event(&frame).unwrap(), msg);
    }

    #[test]
    fn test_bad_version_and_length() {
        let msg = ActionMessage::new(FlowId(1), Action::Drop);
        let mut frame = encode_action(&msg).unwrap();

        let mut truncated = frame.clone();
        truncated.pop();
        assert!(matches!(decode_action(&truncated), Err(ProtoError::BadLength { .. })));

        frame[3] = 9;
        assert!(matches!(decode_action(&frame), Err(ProtoError::BadVersion(9))));
        assert!(matches!(decode_header(&frame[..4]), Err(ProtoError::Truncated(4))));
    }

    #[test]
    fn test_op_mismatch() {
        let msg = ActionMessage::new(FlowId(1), Action::Drop);
        let mut frame = encode_action(&msg).unwrap();
        frame[5] = OpCode::BlessClient.to_u8();
        assert!(matches!(decode_action(&frame), Err(ProtoError::OpMismatch { .. })));
    }
}
