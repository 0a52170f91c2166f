//! Control channel to a filter agent.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use flowgate_proto::{encode_event, EventMessage};
use thiserror::Error;

/// Delivery failures on a control channel
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The agent is not keeping up; retry after it drains
    #[error("Control channel is full")]
    BackPressure,
    #[error("Control channel is closed")]
    Closed,
    #[error("Failed to encode event: {0}")]
    Encoding(String),
}

/// Outbound half of an agent connection.
pub trait ControlChannel: Send + Sync {
    /// Enqueue one event without blocking.
    fn send(&self, msg: &EventMessage) -> Result<(), ChannelError>;
}

/// Bounded in-process channel carrying encoded frames.
pub struct FrameChannel {
    tx: Sender<Vec<u8>>,
}

impl FrameChannel {
    /// Create a channel holding at most `capacity` undelivered frames.
    pub fn bounded(capacity: usize) -> (Self, Receiver<Vec<u8>>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { tx }, rx)
    }
}

impl ControlChannel for FrameChannel {
    fn send(&self, msg: &EventMessage) -> Result<(), ChannelError> {
        let frame = encode_event(msg).map_err(|e| ChannelError::Encoding(e.to_string()))?;
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => ChannelError::BackPressure,
            TrySendError::Disconnected(_) => ChannelError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_proto::{decode_event, Direction, Event, FlowId};

    #[test]
    fn test_backpressure_when_full() {
        let (channel, rx) = FrameChannel::bounded(1);
        let msg = EventMessage::new(FlowId(5), Event::Disconnect { direction: Direction::Inbound });

        assert!(channel.send(&msg).is_ok());
        assert_eq!(channel.send(&msg), Err(ChannelError::BackPressure));

        let frame = rx.recv().unwrap();
        assert_eq!(decode_event(&frame).unwrap(), msg);
        assert!(channel.send(&msg).is_ok());

        drop(rx);
        assert_eq!(channel.send(&msg), Err(ChannelError::Closed));
    }
}
