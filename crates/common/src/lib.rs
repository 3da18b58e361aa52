//! Shared identifiers and the clock abstraction used across the workspace.

pub mod clock;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use types::{AccountNumber, TransactionId, UserId};
