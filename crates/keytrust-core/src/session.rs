//! Verification sessions and their registry
//!
//! One [`VerificationSession`] exists per transaction id. Its role is fixed
//! at creation; a conflicting creation discards the old session and builds a
//! new one rather than patching it.

use core::fmt;
use std::collections::HashMap;

use crate::crypto::{DecimalSas, EmojiSas, EphemeralKeyPair, SharedSecret};
use crate::errors::SessionError;
use crate::negotiation::NegotiatedParameters;
use crate::protocol::{AcceptContent, StartContent};
use crate::types::{DeviceIdentity, Timestamp, TransactionId};

// ----------------------------------------------------------------------------
// Role and State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sent the `request`
    Initiator,
    /// Answered it
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Requested,
    ReadySent,
    ReadyReceived,
    StartSent,
    StartReceived,
    AcceptSent,
    AcceptReceived,
    KeySent,
    KeyReceived,
    SasReady,
    MacSent,
    MacReceived,
    DoneSent,
    DoneReceived,
    Verified,
    Cancelled,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Requested => "requested",
            SessionState::ReadySent => "ready_sent",
            SessionState::ReadyReceived => "ready_received",
            SessionState::StartSent => "start_sent",
            SessionState::StartReceived => "start_received",
            SessionState::AcceptSent => "accept_sent",
            SessionState::AcceptReceived => "accept_received",
            SessionState::KeySent => "key_sent",
            SessionState::KeyReceived => "key_received",
            SessionState::SasReady => "sas_ready",
            SessionState::MacSent => "mac_sent",
            SessionState::MacReceived => "mac_received",
            SessionState::DoneSent => "done_sent",
            SessionState::DoneReceived => "done_received",
            SessionState::Verified => "verified",
            SessionState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Verified | SessionState::Cancelled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four independent completion conditions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionFlags {
    pub mac_sent: bool,
    pub mac_received: bool,
    pub done_sent: bool,
    pub done_received: bool,
}

impl CompletionFlags {
    pub fn all(&self) -> bool {
        self.mac_sent && self.mac_received && self.done_sent && self.done_received
    }
}

/// Rendered SAS, for whichever methods were negotiated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasCodes {
    pub emoji: Option<EmojiSas>,
    pub decimal: Option<DecimalSas>,
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

/// State of one verification attempt
#[derive(Debug)]
pub struct VerificationSession {
    pub transaction_id: TransactionId,
    pub peer: DeviceIdentity,
    role: Role,
    pub state: SessionState,
    pub created_at: Timestamp,
    /// Distinguishes this session from an earlier one with the same id
    pub generation: u64,
    pub negotiated: Option<NegotiatedParameters>,
    pub start: Option<StartContent>,
    pub accept: Option<AcceptContent>,
    pub our_key: Option<EphemeralKeyPair>,
    pub key_sent: bool,
    pub their_key: Option<String>,
    shared_secret: Option<SharedSecret>,
    pub sas: Option<SasCodes>,
    pub flags: CompletionFlags,
}

impl VerificationSession {
    fn new(
        transaction_id: TransactionId,
        peer: DeviceIdentity,
        role: Role,
        created_at: Timestamp,
        generation: u64,
    ) -> Self {
        let state = match role {
            Role::Initiator => SessionState::Requested,
            Role::Responder => SessionState::ReadySent,
        };
        Self {
            transaction_id,
            peer,
            role,
            state,
            created_at,
            generation,
            negotiated: None,
            start: None,
            accept: None,
            our_key: None,
            key_sent: false,
            their_key: None,
            shared_secret: None,
            sas: None,
            flags: CompletionFlags::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn shared_secret(&self) -> Option<&SharedSecret> {
        self.shared_secret.as_ref()
    }

    /// Store the shared secret; a secret that is already set is kept
    pub fn set_shared_secret(&mut self, secret: SharedSecret) -> &SharedSecret {
        self.shared_secret.get_or_insert(secret)
    }

    /// The ephemeral key pair, generated on first use
    pub fn ensure_our_key(&mut self) -> &EphemeralKeyPair {
        self.our_key.get_or_insert_with(EphemeralKeyPair::generate)
    }

    /// Whether a request for `(peer, role)` can reuse this session
    fn matches(&self, peer: &DeviceIdentity, role: Role) -> bool {
        self.role == role && &self.peer == peer
    }
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Outcome of [`SessionRegistry::create`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    /// A fresh session was inserted
    New { generation: u64 },
    /// An inconsistent session was discarded and replaced
    Replaced { generation: u64 },
    /// An equivalent session already existed
    Existing,
}

impl Created {
    pub fn generation(&self) -> Option<u64> {
        match self {
            Created::New { generation } | Created::Replaced { generation } => Some(*generation),
            Created::Existing => None,
        }
    }
}

/// All live sessions, keyed by transaction id
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<TransactionId, VerificationSession>,
    next_generation: u64,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            next_generation: 1,
            max_sessions,
        }
    }

    /// Create a session, or rebuild an existing one whose role or peer differ
    pub fn create(
        &mut self,
        transaction_id: &TransactionId,
        peer: &DeviceIdentity,
        role: Role,
        now: Timestamp,
    ) -> Result<Created, SessionError> {
        let replaced = match self.sessions.get(transaction_id) {
            Some(existing) if existing.matches(peer, role) => return Ok(Created::Existing),
            Some(_) => {
                self.sessions.remove(transaction_id);
                true
            }
            None => false,
        };
        if self.sessions.len() >= self.max_sessions {
            return Err(SessionError::MaxSessionsReached {
                current: self.sessions.len(),
                max: self.max_sessions,
            });
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.sessions.insert(
            transaction_id.clone(),
            VerificationSession::new(transaction_id.clone(), peer.clone(), role, now, generation),
        );
        Ok(if replaced {
            Created::Replaced { generation }
        } else {
            Created::New { generation }
        })
    }

    pub fn get(&self, transaction_id: &TransactionId) -> Option<&VerificationSession> {
        self.sessions.get(transaction_id)
    }

    pub fn get_mut(&mut self, transaction_id: &TransactionId) -> Option<&mut VerificationSession> {
        self.sessions.get_mut(transaction_id)
    }

    /// Remove a session; its key material is scrubbed when the value drops
    pub fn remove(&mut self, transaction_id: &TransactionId) -> Option<VerificationSession> {
        self.sessions.remove(transaction_id)
    }

    pub fn contains(&self, transaction_id: &TransactionId) -> bool {
        self.sessions.contains_key(transaction_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.sessions.len() >= self.max_sessions
    }

    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}
