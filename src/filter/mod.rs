//! Transaction filtering module
//!
//! Filters classify individual transactions; the registry fans each
//! transaction out to every registered filter under a concurrency bound.

pub mod dex;
pub mod registry;
pub mod ring;
pub mod swap;
pub mod types;

pub use dex::{DexFilter, DexMatch};
pub use registry::FilterRegistry;
pub use ring::{RingBuffer, RECENT_CAPACITY};
pub use swap::{SwapDirection, SwapFilter, SwapRecord};
pub use types::{FilterCounters, FilterStats, TransactionFilter};
