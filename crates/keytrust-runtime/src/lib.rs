//! KeyTrust Runtime
//!
//! This crate runs the verification engine from `keytrust-core` against a
//! live transport, including:
//! - `VerificationManager`: dispatch, per-transaction workers and timers
//! - `KeyDirectoryCache`: short-lived key query cache
//! - `VerifiedStateStore`: persistence of the "already verified" record
//! - `ManagerRegistry`: one manager per connection

mod dispatch;

pub mod cache;
pub mod manager;
pub mod registry;
pub mod store;

pub use cache::KeyDirectoryCache;
pub use manager::{bootstrap_target, VerificationManager};
pub use registry::ManagerRegistry;
pub use store::{JsonFileStore, MemoryStateStore, VerifiedStateStore};

// Re-export core types for convenience
pub use keytrust_core::{
    CancelCode, DeviceId, DeviceIdentity, Notice, SessionState, TransactionId, UserId,
    VerificationConfig, VerificationTransport, VerifyError,
};
