//! The verification state machine
//!
//! [`VerificationEngine`] owns every live session and applies one inbound
//! message at a time. It performs no I/O: the caller resolves the key
//! directory beforehand when [`VerificationEngine::directory_for`] asks for
//! it, then executes the returned [`Effect`]s in order.

use std::collections::BTreeMap;

use crate::config::VerificationConfig;
use crate::crypto::{
    compute_commitment, derive_mac_key, derive_sas_bytes, derive_sas_info, format_decimal_sas,
    format_emoji_sas, hmac_base64, verify_commitment, SasParticipant,
};
use crate::directory::KeysQueryResponse;
use crate::effects::{Effect, Notice};
use crate::errors::{CancelCode, CryptographicError, ParseError, SessionError};
use crate::negotiation::{SasMethod, SupportedAlgorithms};
use crate::protocol::{
    AcceptContent, CancelContent, DoneContent, KeyContent, MacContent, MessageType, ReadyContent,
    RequestContent, StartContent, VerificationMessage, KEY_IDS_MAC_ID,
};
use crate::session::{Created, Role, SasCodes, SessionRegistry, SessionState, VerificationSession};
use crate::state::VerifiedStateRecord;
use crate::types::{DeviceId, DeviceIdentity, TimeSource, Timestamp, TransactionId, UserId};

// ----------------------------------------------------------------------------
// Step Outcome
// ----------------------------------------------------------------------------

/// What the engine does with a session after a handler ran
#[derive(Debug, Clone, PartialEq)]
enum Flow {
    Continue,
    Ignore(String),
    Cancel { code: CancelCode, reason: String },
    Verified,
}

impl Flow {
    fn cancel<R: Into<String>>(code: CancelCode, reason: R) -> Self {
        Flow::Cancel {
            code,
            reason: reason.into(),
        }
    }

    fn ignore<R: Into<String>>(reason: R) -> Self {
        Flow::Ignore(reason.into())
    }
}

/// Early exit from a handler
type Step<T = Flow> = Result<T, Flow>;

fn crypto_failure(err: CryptographicError) -> Flow {
    Flow::cancel(CancelCode::InvalidMessage, err.to_string())
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

/// Pure SAS verification engine for one local device
#[derive(Debug)]
pub struct VerificationEngine<T: TimeSource> {
    local: DeviceIdentity,
    algorithms: SupportedAlgorithms,
    sessions: SessionRegistry,
    time_source: T,
}

impl<T: TimeSource> VerificationEngine<T> {
    pub fn new(local: DeviceIdentity, config: &VerificationConfig, time_source: T) -> Self {
        Self {
            local,
            algorithms: config.supported_algorithms(),
            sessions: SessionRegistry::new(config.max_concurrent_sessions),
            time_source,
        }
    }

    pub fn local(&self) -> &DeviceIdentity {
        &self.local
    }

    /// Current time according to the engine's clock
    pub fn now(&self) -> Timestamp {
        self.time_source.now()
    }

    pub fn session(&self, transaction_id: &TransactionId) -> Option<&VerificationSession> {
        self.sessions.get(transaction_id)
    }

    pub fn session_state(&self, transaction_id: &TransactionId) -> Option<SessionState> {
        self.sessions.get(transaction_id).map(|s| s.state)
    }

    pub fn active_sessions(&self) -> Vec<TransactionId> {
        self.sessions.transaction_ids()
    }

    /// Drop every session without notifying peers
    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    /// Account whose key directory the next step for `message` needs
    ///
    /// A `key` may trigger our own `mac`, which needs our keys. A `mac` is
    /// checked against the peer's keys.
    pub fn directory_for(&self, message: &VerificationMessage) -> Option<UserId> {
        match message {
            VerificationMessage::Key(c) if self.sessions.contains(&c.transaction_id) => {
                Some(self.local.user_id.clone())
            }
            VerificationMessage::Mac(c) => self
                .sessions
                .get(&c.transaction_id)
                .map(|s| s.peer.user_id.clone()),
            _ => None,
        }
    }

    // ------------------------------------------------------------------------
    // Entry Points
    // ------------------------------------------------------------------------

    /// Apply one parsed inbound message
    pub fn handle(
        &mut self,
        sender: &UserId,
        message: VerificationMessage,
        directory: Option<&KeysQueryResponse>,
    ) -> Vec<Effect> {
        match message {
            VerificationMessage::Request(c) => self.on_request(sender, c),
            VerificationMessage::Start(c) => self.on_start(sender, c),
            VerificationMessage::Cancel(c) => self.on_cancel(sender, c),
            VerificationMessage::Ready(c) => {
                let txn = c.transaction_id.clone();
                self.with_session(&txn, sender, |ctx, s, out| ctx.on_ready(s, c, out))
            }
            VerificationMessage::Accept(c) => {
                let txn = c.transaction_id.clone();
                self.with_session(&txn, sender, |ctx, s, out| ctx.on_accept(s, c, out))
            }
            VerificationMessage::Key(c) => {
                let txn = c.transaction_id.clone();
                self.with_session(&txn, sender, |ctx, s, out| {
                    ctx.on_key(s, c, directory, out)
                })
            }
            VerificationMessage::Mac(c) => {
                let txn = c.transaction_id.clone();
                self.with_session(&txn, sender, |ctx, s, out| {
                    ctx.on_mac(s, c, directory, out)
                })
            }
            VerificationMessage::Done(c) => {
                let txn = c.transaction_id.clone();
                self.with_session(&txn, sender, |ctx, s, out| ctx.on_done(s, c, out))
            }
        }
    }

    /// React to a payload that failed to parse
    ///
    /// An open session is cancelled; a sender we can name gets a direct
    /// cancel. A broken `cancel` still ends its session.
    pub fn handle_malformed(
        &mut self,
        sender: &UserId,
        message_type: MessageType,
        transaction_id: TransactionId,
        from_device: Option<DeviceId>,
        error: &ParseError,
    ) -> Vec<Effect> {
        if message_type == MessageType::Cancel {
            return self.on_cancel(
                sender,
                CancelContent {
                    transaction_id,
                    code: None,
                    reason: Some(error.to_string()),
                },
            );
        }

        let reason = format!("Invalid {} message: {error}", message_type.event_type());
        let mut out = Vec::new();
        match self.sessions.get(&transaction_id) {
            Some(session) if &session.peer.user_id == sender => {
                self.cancel_session(&transaction_id, CancelCode::InvalidMessage, reason, &mut out);
            }
            Some(_) => out.push(ignored(&transaction_id, "sender does not own the session")),
            None => match from_device.filter(|device| *device != self.local.device_id) {
                Some(device) => {
                    let peer = DeviceIdentity::new(sender.clone(), device);
                    reject(&peer, &transaction_id, CancelCode::InvalidMessage, reason, &mut out);
                }
                None => out.push(ignored(&transaction_id, reason)),
            },
        }
        out
    }

    /// Cancel a session whose timeout fired
    ///
    /// Timers from an earlier session with the same id are ignored.
    pub fn handle_timeout(&mut self, transaction_id: &TransactionId, generation: u64) -> Vec<Effect> {
        let mut out = Vec::new();
        let expired = self
            .sessions
            .get(transaction_id)
            .is_some_and(|s| s.generation == generation && !s.state.is_terminal());
        if expired {
            self.cancel_session(
                transaction_id,
                CancelCode::Timeout,
                "Verification timed out",
                &mut out,
            );
        }
        out
    }

    /// Open an initiator session and send `request` to another own device
    pub fn begin_request(
        &mut self,
        peer_device: DeviceId,
        transaction_id: TransactionId,
    ) -> Result<Vec<Effect>, SessionError> {
        if self.sessions.contains(&transaction_id) {
            return Err(SessionError::SessionAlreadyExists {
                transaction_id: transaction_id.to_string(),
            });
        }
        let peer = self.local.sibling(peer_device);
        let now = self.time_source.now();
        let created = self
            .sessions
            .create(&transaction_id, &peer, Role::Initiator, now)?;

        let mut out = Vec::new();
        note_created(&transaction_id, &peer, created, &mut out);
        out.push(Effect::Send {
            to: peer.clone(),
            message: VerificationMessage::Request(RequestContent {
                from_device: self.local.device_id.clone(),
                methods: self.algorithms.methods(),
                transaction_id: transaction_id.clone(),
                timestamp: Some(now.as_millis()),
            }),
        });
        out.push(Effect::Notify(Notice::RequestSent {
            transaction_id,
            peer,
        }));
        Ok(out)
    }

    /// Cancel a session from the local side, e.g. on user request
    pub fn cancel(
        &mut self,
        transaction_id: &TransactionId,
        code: CancelCode,
        reason: &str,
    ) -> Vec<Effect> {
        let mut out = Vec::new();
        self.cancel_session(transaction_id, code, reason, &mut out);
        out
    }

    /// Drop a session without telling the peer
    pub fn discard(&mut self, transaction_id: &TransactionId) -> Vec<Effect> {
        match self.sessions.remove(transaction_id) {
            Some(_) => vec![Effect::SessionClosed {
                transaction_id: transaction_id.clone(),
            }],
            None => Vec::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Session-creating Handlers
    // ------------------------------------------------------------------------

    fn on_request(&mut self, sender: &UserId, c: RequestContent) -> Vec<Effect> {
        let txn = c.transaction_id;
        let mut out = Vec::new();
        if c.from_device == self.local.device_id {
            out.push(ignored(&txn, "request from this device"));
            return out;
        }
        let peer = DeviceIdentity::new(sender.clone(), c.from_device);
        if !self.algorithms.supports_any_method(&c.methods) {
            reject(
                &peer,
                &txn,
                CancelCode::UnknownMethod,
                "No supported verification method",
                &mut out,
            );
            return out;
        }

        let now = self.time_source.now();
        let created = match self.sessions.create(&txn, &peer, Role::Responder, now) {
            Ok(created) => created,
            Err(err) => {
                out.push(session_limit(&txn, err));
                return out;
            }
        };
        let Some(session) = self.sessions.get_mut(&txn) else {
            return out;
        };
        if created == Created::Existing && session.state != SessionState::ReadySent {
            out.push(ignored(&txn, "duplicate request for an active session"));
            return out;
        }

        note_created(&txn, &peer, created, &mut out);
        out.push(Effect::Send {
            to: peer.clone(),
            message: VerificationMessage::Ready(ReadyContent {
                from_device: self.local.device_id.clone(),
                methods: self.algorithms.methods(),
                transaction_id: txn.clone(),
            }),
        });
        session.state = SessionState::ReadySent;
        out.push(Effect::Notify(Notice::RequestReceived {
            transaction_id: txn,
            peer,
        }));
        out
    }

    fn on_start(&mut self, sender: &UserId, c: StartContent) -> Vec<Effect> {
        let txn = c.transaction_id.clone();
        let mut out = Vec::new();
        if c.from_device == self.local.device_id {
            out.push(ignored(&txn, "start from this device"));
            return out;
        }
        let peer = DeviceIdentity::new(sender.clone(), c.from_device.clone());

        if let Some(existing) = self.sessions.get(&txn) {
            if &existing.peer.user_id != sender {
                out.push(ignored(&txn, "sender does not own the session"));
                return out;
            }
            if existing.peer.device_id != c.from_device {
                out.push(ignored(&txn, "start from an unexpected device"));
                return out;
            }
            match (existing.role(), existing.state) {
                (Role::Initiator, SessionState::StartSent) => {
                    let ours = existing.start.as_ref().map(|s| s.method.as_str());
                    if ours.is_some_and(|method| method != c.method) {
                        self.cancel_session(
                            &txn,
                            CancelCode::UnexpectedMessage,
                            "Verification start collision (method mismatch)",
                            &mut out,
                        );
                        return out;
                    }
                    if self.local < peer {
                        out.push(ignored(&txn, "start collision resolved in favour of our start"));
                        return out;
                    }
                }
                (Role::Initiator, SessionState::Requested | SessionState::ReadyReceived)
                | (Role::Responder, SessionState::ReadySent) => {}
                (_, state) => {
                    self.cancel_session(
                        &txn,
                        CancelCode::UnexpectedMessage,
                        format!("Unexpected start in state {state}"),
                        &mut out,
                    );
                    return out;
                }
            }
        }

        let negotiated = match self.algorithms.negotiate(&c) {
            Ok(negotiated) => negotiated,
            Err(err) => {
                if self.sessions.contains(&txn) {
                    self.cancel_session(&txn, CancelCode::UnknownMethod, err.to_string(), &mut out);
                } else {
                    reject(&peer, &txn, CancelCode::UnknownMethod, err.to_string(), &mut out);
                }
                return out;
            }
        };

        let now = self.time_source.now();
        let created = match self.sessions.create(&txn, &peer, Role::Responder, now) {
            Ok(created) => created,
            Err(err) => {
                out.push(session_limit(&txn, err));
                return out;
            }
        };
        note_created(&txn, &peer, created, &mut out);

        let flow = match self.sessions.get_mut(&txn) {
            Some(session) => {
                session.negotiated = Some(negotiated);
                session.state = SessionState::StartReceived;
                accept_start(session, c, &mut out).unwrap_or_else(|flow| flow)
            }
            None => Flow::Continue,
        };
        self.apply(&txn, flow, &mut out);
        out
    }

    fn on_cancel(&mut self, sender: &UserId, c: CancelContent) -> Vec<Effect> {
        let txn = c.transaction_id;
        let owned = self
            .sessions
            .get(&txn)
            .is_some_and(|s| &s.peer.user_id == sender);
        if !owned {
            return vec![ignored(&txn, "cancel for unknown transaction")];
        }
        let Some(mut session) = self.sessions.remove(&txn) else {
            return Vec::new();
        };
        session.state = SessionState::Cancelled;
        vec![
            Effect::SessionClosed {
                transaction_id: txn.clone(),
            },
            Effect::Notify(Notice::Cancelled {
                transaction_id: txn,
                peer: session.peer.clone(),
                code: c.code.unwrap_or_else(|| CancelCode::Other("unknown".to_string())),
                reason: c.reason.unwrap_or_default(),
                by_peer: true,
            }),
        ]
    }

    // ------------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------------

    fn with_session<F>(&mut self, txn: &TransactionId, sender: &UserId, handler: F) -> Vec<Effect>
    where
        F: FnOnce(&StepContext<'_>, &mut VerificationSession, &mut Vec<Effect>) -> Step,
    {
        let mut out = Vec::new();
        let ctx = StepContext {
            local: &self.local,
            algorithms: &self.algorithms,
        };
        let flow = match self.sessions.get_mut(txn) {
            None => Flow::ignore("no session for transaction"),
            Some(session) if &session.peer.user_id != sender => {
                Flow::ignore("sender does not own the session")
            }
            Some(session) => handler(&ctx, session, &mut out).unwrap_or_else(|flow| flow),
        };
        self.apply(txn, flow, &mut out);
        out
    }

    fn apply(&mut self, txn: &TransactionId, flow: Flow, out: &mut Vec<Effect>) {
        match flow {
            Flow::Continue => {}
            Flow::Ignore(reason) => out.push(ignored(txn, reason)),
            Flow::Cancel { code, reason } => self.cancel_session(txn, code, reason, out),
            Flow::Verified => {
                let now = self.time_source.now();
                if let Some(session) = self.sessions.remove(txn) {
                    out.push(Effect::PersistVerified(VerifiedStateRecord::verified_with(
                        &session.peer,
                        now,
                    )));
                    out.push(Effect::SessionClosed {
                        transaction_id: txn.clone(),
                    });
                    out.push(Effect::Notify(Notice::Verified {
                        transaction_id: txn.clone(),
                        peer: session.peer.clone(),
                    }));
                }
            }
        }
    }

    /// Best-effort cancel, then delete
    fn cancel_session<R: Into<String>>(
        &mut self,
        txn: &TransactionId,
        code: CancelCode,
        reason: R,
        out: &mut Vec<Effect>,
    ) {
        let Some(mut session) = self.sessions.remove(txn) else {
            return;
        };
        let reason = reason.into();
        session.state = SessionState::Cancelled;
        out.push(Effect::Send {
            to: session.peer.clone(),
            message: VerificationMessage::cancel(txn.clone(), code.clone(), reason.clone()),
        });
        out.push(Effect::SessionClosed {
            transaction_id: txn.clone(),
        });
        out.push(Effect::Notify(Notice::Cancelled {
            transaction_id: txn.clone(),
            peer: session.peer.clone(),
            code,
            reason,
            by_peer: false,
        }));
    }
}

fn ignored<R: Into<String>>(txn: &TransactionId, reason: R) -> Effect {
    Effect::Notify(Notice::Ignored {
        transaction_id: txn.clone(),
        reason: reason.into(),
    })
}

fn session_limit(txn: &TransactionId, err: SessionError) -> Effect {
    match err {
        SessionError::MaxSessionsReached { max, .. } => Effect::Notify(Notice::SessionLimit {
            transaction_id: txn.clone(),
            max,
        }),
        other => ignored(txn, other.to_string()),
    }
}

fn note_created(txn: &TransactionId, peer: &DeviceIdentity, created: Created, out: &mut Vec<Effect>) {
    if let Created::Replaced { .. } = created {
        out.push(Effect::Notify(Notice::SessionReset {
            transaction_id: txn.clone(),
            peer: peer.clone(),
        }));
    }
    if let Some(generation) = created.generation() {
        out.push(Effect::SessionOpened {
            transaction_id: txn.clone(),
            generation,
        });
    }
}

/// Cancel sent straight to a device that has no session with us
fn reject<R: Into<String>>(
    peer: &DeviceIdentity,
    txn: &TransactionId,
    code: CancelCode,
    reason: R,
    out: &mut Vec<Effect>,
) {
    let reason = reason.into();
    out.push(Effect::Send {
        to: peer.clone(),
        message: VerificationMessage::cancel(txn.clone(), code.clone(), reason.clone()),
    });
    out.push(Effect::Notify(Notice::Rejected {
        transaction_id: txn.clone(),
        peer: peer.clone(),
        code,
        reason,
    }));
}

fn send(session: &VerificationSession, message: VerificationMessage, out: &mut Vec<Effect>) {
    out.push(Effect::Send {
        to: session.peer.clone(),
        message,
    });
}

/// Responder side of `start`: key pair, commitment, `accept`
fn accept_start(session: &mut VerificationSession, start: StartContent, out: &mut Vec<Effect>) -> Step {
    let start_value = start
        .commitment_value()
        .map_err(|err| Flow::cancel(CancelCode::InvalidMessage, err.to_string()))?;
    let Some(negotiated) = session.negotiated.clone() else {
        return Err(Flow::cancel(CancelCode::InvalidMessage, "Missing SAS negotiation state"));
    };
    let public_key = session.ensure_our_key().public_key_base64();
    let accept = AcceptContent {
        method: start.method.clone(),
        commitment: compute_commitment(&public_key, &start_value),
        key_agreement_protocol: negotiated.key_agreement.as_str().to_string(),
        hash: negotiated.hash.as_str().to_string(),
        message_authentication_code: negotiated.mac.as_str().to_string(),
        short_authentication_string: negotiated
            .sas_methods
            .iter()
            .map(|m| m.as_str().to_string())
            .collect(),
        transaction_id: session.transaction_id.clone(),
    };
    session.start = Some(start);
    session.accept = Some(accept.clone());
    send(session, VerificationMessage::Accept(accept), out);
    session.state = SessionState::AcceptSent;
    out.push(Effect::Notify(Notice::AcceptSent {
        transaction_id: session.transaction_id.clone(),
        peer: session.peer.clone(),
    }));
    Ok(Flow::Continue)
}

// ----------------------------------------------------------------------------
// Per-session Handlers
// ----------------------------------------------------------------------------

/// Read-only engine state handed to per-session handlers
struct StepContext<'a> {
    local: &'a DeviceIdentity,
    algorithms: &'a SupportedAlgorithms,
}

impl StepContext<'_> {
    fn on_ready(&self, session: &mut VerificationSession, c: ReadyContent, out: &mut Vec<Effect>) -> Step {
        if session.role() != Role::Initiator || session.state != SessionState::Requested {
            return Ok(Flow::ignore(format!("ready in state {}", session.state)));
        }
        if c.from_device != session.peer.device_id {
            return Ok(Flow::ignore("ready from an unexpected device"));
        }
        session.state = SessionState::ReadyReceived;

        let start = self
            .algorithms
            .start_content(self.local.device_id.clone(), session.transaction_id.clone());
        session.start = Some(start.clone());
        send(session, VerificationMessage::Start(start), out);
        session.state = SessionState::StartSent;
        out.push(Effect::Notify(Notice::StartSent {
            transaction_id: session.transaction_id.clone(),
            peer: session.peer.clone(),
        }));
        Ok(Flow::Continue)
    }

    fn on_accept(&self, session: &mut VerificationSession, c: AcceptContent, out: &mut Vec<Effect>) -> Step {
        let expecting = matches!(
            session.state,
            SessionState::StartSent | SessionState::ReadyReceived
        );
        if session.role() != Role::Initiator || !expecting {
            return Ok(Flow::ignore(format!("accept in state {}", session.state)));
        }
        if session.start.is_none() {
            return Err(Flow::cancel(
                CancelCode::InvalidMessage,
                "Missing start content for SAS accept",
            ));
        }
        let negotiated = self
            .algorithms
            .validate_accept(&c)
            .map_err(|err| Flow::cancel(CancelCode::UnknownMethod, err.to_string()))?;

        session.negotiated = Some(negotiated);
        session.accept = Some(c);
        session.state = SessionState::AcceptReceived;

        let key = session.ensure_our_key().public_key_base64();
        send(
            session,
            VerificationMessage::Key(KeyContent {
                transaction_id: session.transaction_id.clone(),
                key,
            }),
            out,
        );
        session.key_sent = true;
        session.state = SessionState::KeySent;
        Ok(Flow::Continue)
    }

    fn on_key(
        &self,
        session: &mut VerificationSession,
        c: KeyContent,
        directory: Option<&KeysQueryResponse>,
        out: &mut Vec<Effect>,
    ) -> Step {
        if session.their_key.is_some() {
            return Err(Flow::cancel(CancelCode::UnexpectedMessage, "Duplicate SAS key"));
        }
        match session.role() {
            Role::Initiator => {
                if !session.key_sent || session.accept.is_none() {
                    return Err(Flow::cancel(
                        CancelCode::UnexpectedMessage,
                        "SAS key received before accept",
                    ));
                }
            }
            Role::Responder => {
                if session.our_key.is_none() {
                    return Err(Flow::cancel(
                        CancelCode::InvalidMessage,
                        "Missing local ephemeral key",
                    ));
                }
                if session.start.is_none() || session.negotiated.is_none() {
                    return Err(Flow::cancel(
                        CancelCode::InvalidMessage,
                        "Missing SAS negotiation state",
                    ));
                }
            }
        }
        session.their_key = Some(c.key);
        session.state = SessionState::KeyReceived;

        if session.role() == Role::Responder && !session.key_sent {
            let key = session.ensure_our_key().public_key_base64();
            send(
                session,
                VerificationMessage::Key(KeyContent {
                    transaction_id: session.transaction_id.clone(),
                    key,
                }),
                out,
            );
            session.key_sent = true;
            session.state = SessionState::KeySent;
        }

        self.finalize_sas(session, directory, out)
    }

    /// Shared secret, commitment check, SAS rendering, then our `mac`
    fn finalize_sas(
        &self,
        session: &mut VerificationSession,
        directory: Option<&KeysQueryResponse>,
        out: &mut Vec<Effect>,
    ) -> Step {
        let (Some(our_key), Some(their_key)) = (&session.our_key, &session.their_key) else {
            return Ok(Flow::Continue);
        };
        let our_public = our_key.public_key_base64();
        let their_public = their_key.clone();
        if session.shared_secret().is_none() {
            let secret = our_key
                .compute_shared_secret(&their_public)
                .map_err(|err| Flow::cancel(CancelCode::InvalidMessage, format!("Invalid SAS key: {err}")))?;
            session.set_shared_secret(secret);
        }

        if session.role() == Role::Initiator {
            let (Some(accept), Some(start)) = (&session.accept, &session.start) else {
                return Ok(Flow::Continue);
            };
            let start_value = start
                .commitment_value()
                .map_err(|err| Flow::cancel(CancelCode::InvalidMessage, err.to_string()))?;
            if !verify_commitment(&accept.commitment, &their_public, &start_value) {
                return Err(Flow::cancel(
                    CancelCode::MismatchedCommitment,
                    "Commitment mismatch",
                ));
            }
        }

        let Some(negotiated) = session.negotiated.clone() else {
            return Ok(Flow::Continue);
        };
        let ours = SasParticipant {
            user_id: self.local.user_id.as_str(),
            device_id: self.local.device_id.as_str(),
            public_key: &our_public,
        };
        let theirs = SasParticipant {
            user_id: session.peer.user_id.as_str(),
            device_id: session.peer.device_id.as_str(),
            public_key: &their_public,
        };
        let info = match session.role() {
            Role::Initiator => derive_sas_info(ours, theirs, session.transaction_id.as_str()),
            Role::Responder => derive_sas_info(theirs, ours, session.transaction_id.as_str()),
        };

        let Some(secret) = session.shared_secret() else {
            return Ok(Flow::Continue);
        };
        let emoji = if negotiated.renders(SasMethod::Emoji) {
            let bytes = derive_sas_bytes(secret.as_bytes(), &info, 6).map_err(crypto_failure)?;
            Some(format_emoji_sas(&bytes).map_err(crypto_failure)?)
        } else {
            None
        };
        let decimal = if negotiated.renders(SasMethod::Decimal) {
            let bytes = derive_sas_bytes(secret.as_bytes(), &info, 5).map_err(crypto_failure)?;
            Some(format_decimal_sas(&bytes).map_err(crypto_failure)?)
        } else {
            None
        };

        session.state = SessionState::SasReady;
        out.push(Effect::Notify(Notice::SasReady {
            transaction_id: session.transaction_id.clone(),
            peer: session.peer.clone(),
            emoji: emoji.map(|sas| sas.to_string()),
            decimal: decimal.map(|sas| sas.to_string()),
        }));
        session.sas = Some(SasCodes { emoji, decimal });

        if !session.flags.mac_sent {
            self.send_mac(session, directory, out)?;
        }
        Ok(Flow::Continue)
    }

    /// MAC our own device key and cross-signing keys
    fn send_mac(
        &self,
        session: &mut VerificationSession,
        directory: Option<&KeysQueryResponse>,
        out: &mut Vec<Effect>,
    ) -> Step<()> {
        let entries = directory
            .map(|d| d.keys_to_mac(&self.local.user_id, &self.local.device_id))
            .unwrap_or_default();
        if entries.is_empty() {
            out.push(Effect::Notify(Notice::MissingOwnKeys {
                transaction_id: session.transaction_id.clone(),
            }));
            return Ok(());
        }
        let (Some(secret), Some(negotiated)) = (session.shared_secret(), &session.negotiated) else {
            return Ok(());
        };
        let unpadded = negotiated.mac.unpadded();
        let mac_for = |key_id: &str, value: &str| -> Result<String, CryptographicError> {
            let key = derive_mac_key(
                secret.as_bytes(),
                self.local.user_id.as_str(),
                self.local.device_id.as_str(),
                session.peer.user_id.as_str(),
                session.peer.device_id.as_str(),
                session.transaction_id.as_str(),
                key_id,
            )?;
            hmac_base64(&key, value, unpadded)
        };

        let mut mac = BTreeMap::new();
        for entry in &entries {
            let value = mac_for(&entry.key_id, &entry.value).map_err(crypto_failure)?;
            mac.insert(entry.key_id.clone(), value);
        }
        let key_ids = mac.keys().cloned().collect::<Vec<_>>().join(",");
        let keys = mac_for(KEY_IDS_MAC_ID, &key_ids).map_err(crypto_failure)?;

        send(
            session,
            VerificationMessage::Mac(MacContent {
                transaction_id: session.transaction_id.clone(),
                mac,
                keys,
            }),
            out,
        );
        session.flags.mac_sent = true;
        session.state = SessionState::MacSent;
        Ok(())
    }

    /// Check the peer's MACs with roles swapped, then send `done`
    fn on_mac(
        &self,
        session: &mut VerificationSession,
        c: MacContent,
        directory: Option<&KeysQueryResponse>,
        out: &mut Vec<Effect>,
    ) -> Step {
        if session.flags.mac_received {
            return Err(Flow::cancel(CancelCode::UnexpectedMessage, "Duplicate MAC"));
        }
        let (Some(secret), Some(negotiated)) = (session.shared_secret(), &session.negotiated) else {
            return Err(Flow::cancel(
                CancelCode::UnexpectedMessage,
                "MAC received before key exchange",
            ));
        };

        let key_ids = c.mac.keys().map(String::as_str);
        let resolved = match directory {
            Some(d) => d.resolve_key_values(&session.peer.user_id, &session.peer.device_id, key_ids),
            None => crate::directory::ResolvedKeys {
                found: BTreeMap::new(),
                missing: key_ids.map(str::to_string).collect(),
            },
        };
        if !resolved.missing.is_empty() {
            return Err(Flow::cancel(
                CancelCode::KeyMismatch,
                format!("Missing keys: {}", resolved.missing.join(", ")),
            ));
        }

        let unpadded = negotiated.mac.unpadded();
        let expected_for = |key_id: &str, value: &str| -> Result<String, CryptographicError> {
            let key = derive_mac_key(
                secret.as_bytes(),
                session.peer.user_id.as_str(),
                session.peer.device_id.as_str(),
                self.local.user_id.as_str(),
                self.local.device_id.as_str(),
                session.transaction_id.as_str(),
                key_id,
            )?;
            hmac_base64(&key, value, unpadded)
        };

        let key_id_list = c.mac.keys().cloned().collect::<Vec<_>>().join(",");
        let expected_keys = expected_for(KEY_IDS_MAC_ID, &key_id_list).map_err(crypto_failure)?;
        if expected_keys != c.keys {
            return Err(Flow::cancel(CancelCode::KeyMismatch, "KEY_IDS MAC mismatch"));
        }
        for (key_id, received) in &c.mac {
            let value = resolved.found.get(key_id).map(String::as_str).unwrap_or_default();
            let expected = expected_for(key_id, value).map_err(crypto_failure)?;
            if &expected != received {
                return Err(Flow::cancel(
                    CancelCode::KeyMismatch,
                    format!("MAC mismatch for {key_id}"),
                ));
            }
        }

        session.flags.mac_received = true;
        session.state = SessionState::MacReceived;
        if !session.flags.done_sent {
            send(
                session,
                VerificationMessage::Done(DoneContent {
                    transaction_id: session.transaction_id.clone(),
                }),
                out,
            );
            session.flags.done_sent = true;
            session.state = SessionState::DoneSent;
        }
        Ok(completion(session))
    }

    fn on_done(&self, session: &mut VerificationSession, _c: DoneContent, _out: &mut Vec<Effect>) -> Step {
        if !session.flags.mac_sent && !session.flags.mac_received {
            return Ok(Flow::ignore(format!("done in state {}", session.state)));
        }
        session.flags.done_received = true;
        session.state = SessionState::DoneReceived;
        Ok(completion(session))
    }
}

/// Verified once all four flags are set; a second call is a no-op
fn completion(session: &mut VerificationSession) -> Flow {
    if !session.flags.all() || session.state == SessionState::Verified {
        return Flow::Continue;
    }
    session.state = SessionState::Verified;
    Flow::Verified
}
