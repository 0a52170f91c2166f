//! flowgate content filter engine
//!
//! Intercepts socket traffic and holds it until user-space filter agents
//! decide what may pass:
//! - Filter registry of connected agents with per-slot flow control
//! - Per-flow, per-filter buffer queues with pass/peek offsets
//! - Verdict dispatch, re-injection and drop handling
//! - Graceful close wait, idle-flow reclamation and stats reporting
//!
//! ```text
//!   application / network
//!          │ send / receive
//!          ▼
//!   ┌─────────────┐  events   ┌──────────────┐
//!   │   Socket    │ ────────▶ │ filter agent │
//!   │  FlowState  │ ◀──────── │  (per unit)  │
//!   └─────────────┘  actions  └──────────────┘
//!          │ reinject
//!          ▼
//!      Transport
//! ```

mod channel;
mod clock;
mod config;
mod counters;
mod dispatch;
mod engine;
mod entry;
mod error;
mod flow;
mod queue;
mod reclaim;
mod registry;
mod reporter;
mod signer;
mod socket;
mod transport;

pub use channel::{ChannelError, ControlChannel, FrameChannel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig, ReclaimConfig, StatsConfig, MAX_FILTER_SLOTS};
pub use counters::{Counters, CountersSnapshot};
pub use dispatch::Disposition;
pub use engine::{Engine, Workers};
pub use entry::EntryState;
pub use error::{FilterError, RegistryError};
pub use flow::{FlowFlags, FlowLink, FlowPhase, MAX_TRACE_ENTRIES};
pub use queue::Chunk;
pub use registry::{FilterHandle, FilterUnit, SlotInfo};
pub use signer::{Signer, SignerError};
pub use socket::{EntrySnapshot, FlowSnapshot, OffsetsSnapshot, Shutdown, Socket};
pub use transport::{PolicyLookup, Rejected, StaticPolicy, Transport, TransportError};
