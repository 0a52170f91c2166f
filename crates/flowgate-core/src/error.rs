//! Engine error types.

use crate::channel::ChannelError;
use crate::signer::SignerError;
use thiserror::Error;

/// Filter registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Filter unit {0} is out of range")]
    InvalidSlot(u32),
    #[error("Filter unit {0} is already connected")]
    SlotInUse(u32),
    #[error("Filter unit {0} is not connected")]
    NotConnected(u32),
    #[error("Policy control unit already set to {0}")]
    UnitAlreadySet(u32),
    #[error("Policy control unit must be non-zero")]
    InvalidUnit,
    #[error("Signer error: {0}")]
    Signer(#[from] SignerError),
}

/// Errors surfaced by the data path and action handling
#[derive(Debug, Error)]
pub enum FilterError {
    /// Control channel is full; the work stays queued and is retried
    #[error("Control channel back pressure")]
    BackPressure,
    /// The flow was dropped by policy or by a filter
    #[error("Flow dropped")]
    Dropped,
    #[error("Out of buffer memory")]
    NoMemory,
    /// Unknown or detached flow/filter pair
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Filter agent did not answer in time")]
    ActionTimeout,
    #[error("Direction already shut down")]
    NotConnected,
    #[error("Write shutdown deferred until held data is released")]
    ShutdownDeferred,
    #[error("Channel error: {0}")]
    Channel(ChannelError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Protocol error: {0}")]
    Proto(#[from] flowgate_proto::ProtoError),
}

impl From<ChannelError> for FilterError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::BackPressure => Self::BackPressure,
            other => Self::Channel(other),
        }
    }
}

impl FilterError {
    /// Errors that leave work queued for a later retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackPressure | Self::NoMemory)
    }
}
