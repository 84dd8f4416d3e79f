//! Effects and notices produced by the engine
//!
//! The engine never performs I/O. Each step returns an ordered list of
//! [`Effect`]s which the runtime executes after the step has finished.

use core::fmt;

use crate::errors::CancelCode;
use crate::protocol::VerificationMessage;
use crate::state::VerifiedStateRecord;
use crate::types::{DeviceIdentity, TransactionId};

/// Something the runtime must do on behalf of the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Deliver a message to a peer device
    Send {
        to: DeviceIdentity,
        message: VerificationMessage,
    },
    /// A session was created; arm its timeout
    SessionOpened {
        transaction_id: TransactionId,
        generation: u64,
    },
    /// A session is gone; drop its timer and queue
    SessionClosed { transaction_id: TransactionId },
    /// Write the verified-state record
    PersistVerified(VerifiedStateRecord),
    /// Report progress to the host
    Notify(Notice),
}

/// Severity a notice is logged at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Debug,
    Info,
    Warn,
}

/// Progress and failure reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    RequestSent {
        transaction_id: TransactionId,
        peer: DeviceIdentity,
    },
    RequestReceived {
        transaction_id: TransactionId,
        peer: DeviceIdentity,
    },
    StartSent {
        transaction_id: TransactionId,
        peer: DeviceIdentity,
    },
    AcceptSent {
        transaction_id: TransactionId,
        peer: DeviceIdentity,
    },
    /// Codes for the humans to compare
    SasReady {
        transaction_id: TransactionId,
        peer: DeviceIdentity,
        emoji: Option<String>,
        decimal: Option<String>,
    },
    Verified {
        transaction_id: TransactionId,
        peer: DeviceIdentity,
    },
    Cancelled {
        transaction_id: TransactionId,
        peer: DeviceIdentity,
        code: CancelCode,
        reason: String,
        by_peer: bool,
    },
    /// A cancel was sent without any session existing
    Rejected {
        transaction_id: TransactionId,
        peer: DeviceIdentity,
        code: CancelCode,
        reason: String,
    },
    /// An inconsistent session was discarded and rebuilt
    SessionReset {
        transaction_id: TransactionId,
        peer: DeviceIdentity,
    },
    MissingOwnKeys { transaction_id: TransactionId },
    SessionLimit {
        transaction_id: TransactionId,
        max: usize,
    },
    Ignored {
        transaction_id: TransactionId,
        reason: String,
    },
}

impl Notice {
    pub fn level(&self) -> NoticeLevel {
        match self {
            Notice::RequestSent { .. }
            | Notice::RequestReceived { .. }
            | Notice::StartSent { .. }
            | Notice::AcceptSent { .. }
            | Notice::SasReady { .. }
            | Notice::Verified { .. } => NoticeLevel::Info,
            Notice::Cancelled { .. }
            | Notice::Rejected { .. }
            | Notice::MissingOwnKeys { .. }
            | Notice::SessionLimit { .. } => NoticeLevel::Warn,
            Notice::SessionReset { .. } | Notice::Ignored { .. } => NoticeLevel::Debug,
        }
    }

    pub fn transaction_id(&self) -> &TransactionId {
        match self {
            Notice::RequestSent { transaction_id, .. }
            | Notice::RequestReceived { transaction_id, .. }
            | Notice::StartSent { transaction_id, .. }
            | Notice::AcceptSent { transaction_id, .. }
            | Notice::SasReady { transaction_id, .. }
            | Notice::Verified { transaction_id, .. }
            | Notice::Cancelled { transaction_id, .. }
            | Notice::Rejected { transaction_id, .. }
            | Notice::SessionReset { transaction_id, .. }
            | Notice::MissingOwnKeys { transaction_id }
            | Notice::SessionLimit { transaction_id, .. }
            | Notice::Ignored { transaction_id, .. } => transaction_id,
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::RequestSent {
                transaction_id,
                peer,
            } => write!(
                f,
                "verification request sent (txn={transaction_id} device={})",
                peer.device_id
            ),
            Notice::RequestReceived {
                transaction_id,
                peer,
            } => write!(
                f,
                "verification request received (txn={transaction_id} device={}); ready sent",
                peer.device_id
            ),
            Notice::StartSent {
                transaction_id,
                peer,
            } => write!(
                f,
                "SAS verification started (txn={transaction_id} device={})",
                peer.device_id
            ),
            Notice::AcceptSent {
                transaction_id,
                peer,
            } => write!(
                f,
                "SAS accept sent (txn={transaction_id} device={}); waiting for key",
                peer.device_id
            ),
            Notice::SasReady {
                transaction_id,
                peer,
                emoji,
                decimal,
            } => {
                write!(
                    f,
                    "SAS ready (txn={transaction_id} device={})",
                    peer.device_id
                )?;
                if let Some(emoji) = emoji {
                    write!(f, "\nSAS emojis: {emoji}")?;
                }
                if let Some(decimal) = decimal {
                    write!(f, "\nSAS decimals: {decimal}")?;
                }
                Ok(())
            }
            Notice::Verified {
                transaction_id,
                peer,
            } => write!(
                f,
                "verification complete (txn={transaction_id} device={})",
                peer.device_id
            ),
            Notice::Cancelled {
                transaction_id,
                peer,
                code,
                reason,
                by_peer,
            } => write!(
                f,
                "verification cancelled by {} (txn={transaction_id} device={} code={code} reason={reason})",
                if *by_peer { "peer" } else { "us" },
                peer.device_id
            ),
            Notice::Rejected {
                transaction_id,
                peer,
                code,
                reason,
            } => write!(
                f,
                "verification rejected (txn={transaction_id} device={} code={code} reason={reason})",
                peer.device_id
            ),
            Notice::SessionReset {
                transaction_id,
                peer,
            } => write!(
                f,
                "session rebuilt (txn={transaction_id} device={})",
                peer.device_id
            ),
            Notice::MissingOwnKeys { transaction_id } => write!(
                f,
                "cannot MAC keys for verification, no device keys (txn={transaction_id})"
            ),
            Notice::SessionLimit {
                transaction_id,
                max,
            } => write!(
                f,
                "ignoring verification, {max} sessions already open (txn={transaction_id})"
            ),
            Notice::Ignored {
                transaction_id,
                reason,
            } => write!(f, "ignored message (txn={transaction_id}): {reason}"),
        }
    }
}
