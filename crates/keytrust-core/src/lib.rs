//! KeyTrust Core Protocol Implementation
//!
//! This crate provides the types, cryptographic primitives, wire messages and
//! the pure state machine for interactive SAS device verification between
//! two devices of the same account. It performs no I/O; the runtime crate
//! drives it through the [`transport::VerificationTransport`] seam.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod crypto;
pub mod directory;
pub mod effects;
pub mod engine;
pub mod errors;
pub mod negotiation;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::VerificationConfig;
pub use directory::{KeysQueryResponse, ResolvedKeys};
pub use effects::{Effect, Notice, NoticeLevel};
pub use engine::VerificationEngine;
pub use errors::{CancelCode, Result, VerifyError, VerifyResult};
pub use negotiation::{NegotiatedParameters, SupportedAlgorithms};
pub use protocol::{MessageType, VerificationMessage};
pub use session::{Role, SessionState};
pub use state::VerifiedStateRecord;
pub use transport::{InboundEvent, Subscription, VerificationTransport, WhoAmI};
pub use types::{
    DeviceId, DeviceIdentity, OwnDevice, SystemTimeSource, TimeSource, Timestamp, TransactionId,
    UserId,
};
