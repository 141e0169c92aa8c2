//! Stream module - upstream transaction feed
//!
//! - `call`: subscribe-call state machine and connector traits
//! - `geyser`: Yellowstone gRPC connector
//! - `event` / `batch`: what workers buffer and flush

pub mod batch;
pub mod call;
pub mod event;
pub mod geyser;

pub use batch::Batch;
pub use call::{
    CallEvent, CallPhase, CallState, GeyserConnector, GeyserSession, SourceEndpoint,
    StreamUpdate, SubscribeCall, SubscribeSpec,
};
pub use event::{InstructionRef, SourceId, TokenBalanceEntry, TransactionEvent};
pub use geyser::{decode_stored, YellowstoneConnector};
