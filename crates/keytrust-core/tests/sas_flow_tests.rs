//! End-to-end SAS flows between two in-process engines
//!
//! Messages are pumped through a queue instead of a transport so each test
//! can drop, duplicate or rewrite traffic in flight.

use std::collections::{BTreeMap, VecDeque};

use keytrust_core::{
    directory::KeysQueryResponse,
    negotiation::SupportedAlgorithms,
    protocol::StartContent,
    CancelCode, DeviceIdentity, Effect, MessageType, Notice, SessionState, TimeSource, Timestamp,
    UserId, VerificationConfig, VerificationEngine, VerificationMessage,
};

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

const ALICE: &str = "@alice:example.org";
const TXN: &str = "kt_1_test";

#[derive(Debug, Clone, Copy)]
struct FixedClock;

impl TimeSource for FixedClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(1_700_000_000_000)
    }
}

type Tamper = Box<dyn FnMut(&DeviceIdentity, &mut VerificationMessage) -> bool>;

struct Device {
    engine: VerificationEngine<FixedClock>,
    log: Vec<Effect>,
}

struct Network {
    devices: BTreeMap<String, Device>,
    directory: KeysQueryResponse,
    queue: VecDeque<(DeviceIdentity, VerificationMessage)>,
    /// Returns false to drop the message
    tamper: Option<Tamper>,
    duplicate: Option<MessageType>,
}

fn full_directory() -> KeysQueryResponse {
    let user = UserId::from(ALICE);
    KeysQueryResponse::default()
        .with_device_key(&user, &"DEVA".into(), "ed25519:DEVA", "edA")
        .with_device_key(&user, &"DEVB".into(), "ed25519:DEVB", "edB")
        .with_master_key(&user, "ed25519:master", "mk")
        .with_self_signing_key(&user, "ed25519:ssk", "ssk")
}

impl Network {
    fn new() -> Self {
        let mut devices = BTreeMap::new();
        for id in ["DEVA", "DEVB"] {
            devices.insert(
                id.to_string(),
                Device {
                    engine: VerificationEngine::new(
                        DeviceIdentity::new(ALICE, id),
                        &VerificationConfig::testing(),
                        FixedClock,
                    ),
                    log: Vec::new(),
                },
            );
        }
        Self {
            devices,
            directory: full_directory(),
            queue: VecDeque::new(),
            tamper: None,
            duplicate: None,
        }
    }

    fn with_tamper<F>(mut self, tamper: F) -> Self
    where
        F: FnMut(&DeviceIdentity, &mut VerificationMessage) -> bool + 'static,
    {
        self.tamper = Some(Box::new(tamper));
        self
    }

    fn absorb(&mut self, device: &str, effects: Vec<Effect>) {
        for effect in &effects {
            if let Effect::Send { to, message } = effect {
                self.queue.push_back((to.clone(), message.clone()));
                if self.duplicate == Some(message.message_type()) {
                    self.queue.push_back((to.clone(), message.clone()));
                }
            }
        }
        if let Some(d) = self.devices.get_mut(device) {
            d.log.extend(effects);
        }
    }

    fn begin(&mut self, from: &str, to: &str) {
        let effects = self
            .devices
            .get_mut(from)
            .unwrap()
            .engine
            .begin_request(to.into(), TXN.into())
            .unwrap();
        self.absorb(from, effects);
    }

    fn run(&mut self) {
        for _ in 0..200 {
            let Some((to, mut message)) = self.queue.pop_front() else {
                return;
            };
            if let Some(tamper) = self.tamper.as_mut() {
                if !tamper(&to, &mut message) {
                    continue;
                }
            }
            let device = to.device_id.to_string();
            let Some(d) = self.devices.get_mut(&device) else {
                continue;
            };
            let directory = d.engine.directory_for(&message).map(|_| &self.directory);
            let effects = d.engine.handle(&ALICE.into(), message, directory);
            self.absorb(&device, effects);
        }
        panic!("message pump did not settle");
    }

    fn engine(&self, device: &str) -> &VerificationEngine<FixedClock> {
        &self.devices[device].engine
    }

    fn notices(&self, device: &str) -> Vec<&Notice> {
        self.devices[device]
            .log
            .iter()
            .filter_map(|e| match e {
                Effect::Notify(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    fn sent(&self, device: &str) -> Vec<&VerificationMessage> {
        self.devices[device]
            .log
            .iter()
            .filter_map(|e| match e {
                Effect::Send { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    fn first_cancel(&self, device: &str) -> Option<(CancelCode, String)> {
        self.sent(device).into_iter().find_map(|m| match m {
            VerificationMessage::Cancel(c) => Some((c.code.clone()?, c.reason.clone()?)),
            _ => None,
        })
    }

    fn sas(&self, device: &str) -> Option<(Option<String>, Option<String>)> {
        self.notices(device).into_iter().find_map(|n| match n {
            Notice::SasReady { emoji, decimal, .. } => Some((emoji.clone(), decimal.clone())),
            _ => None,
        })
    }

    fn persisted(&self, device: &str) -> bool {
        self.devices[device]
            .log
            .iter()
            .any(|e| matches!(e, Effect::PersistVerified(_)))
    }
}

// ----------------------------------------------------------------------------
// Happy Path
// ----------------------------------------------------------------------------

#[test]
fn test_two_devices_verify_each_other() {
    let mut net = Network::new();
    net.begin("DEVA", "DEVB");
    net.run();

    let sas_a = net.sas("DEVA").expect("initiator shows SAS");
    let sas_b = net.sas("DEVB").expect("responder shows SAS");
    assert_eq!(sas_a, sas_b);
    assert!(sas_a.0.is_some() && sas_a.1.is_some());

    for (device, peer) in [("DEVA", "DEVB"), ("DEVB", "DEVA")] {
        let record = net.devices[device]
            .log
            .iter()
            .find_map(|e| match e {
                Effect::PersistVerified(record) => Some(record.clone()),
                _ => None,
            })
            .expect("verified record persisted");
        assert!(record.verified);
        assert_eq!(record.verified_with.unwrap().device_id, peer);
        assert!(net
            .notices(device)
            .iter()
            .any(|n| matches!(n, Notice::Verified { .. })));
        assert!(net.engine(device).active_sessions().is_empty());
        assert!(net.first_cancel(device).is_none());
    }
}

#[test]
fn test_mac_covers_own_and_cross_signing_keys() {
    let mut net = Network::new();
    net.begin("DEVA", "DEVB");
    net.run();

    let mac = net
        .sent("DEVB")
        .into_iter()
        .find_map(|m| match m {
            VerificationMessage::Mac(c) => Some(c.clone()),
            _ => None,
        })
        .unwrap();
    let ids: Vec<&str> = mac.mac.keys().map(String::as_str).collect();
    assert_eq!(ids, ["ed25519:DEVB", "ed25519:master", "ed25519:ssk"]);
    assert!(!mac.keys.ends_with('='));
}

#[test]
fn test_every_message_type_is_exchanged() {
    let mut net = Network::new();
    net.begin("DEVA", "DEVB");
    net.run();

    let kinds = |device: &str| -> Vec<MessageType> {
        net.sent(device).iter().map(|m| m.message_type()).collect()
    };
    assert_eq!(
        kinds("DEVA"),
        [
            MessageType::Request,
            MessageType::Start,
            MessageType::Key,
            MessageType::Mac,
            MessageType::Done,
        ]
    );
    assert_eq!(
        kinds("DEVB"),
        [
            MessageType::Ready,
            MessageType::Accept,
            MessageType::Key,
            MessageType::Mac,
            MessageType::Done,
        ]
    );
}

// ----------------------------------------------------------------------------
// Tampering and Negotiation Failures
// ----------------------------------------------------------------------------

#[test]
fn test_tampered_start_fails_commitment() {
    let mut net = Network::new().with_tamper(|_, message| {
        if let VerificationMessage::Start(start) = message {
            start.extra.insert("injected".to_string(), 1.into());
        }
        true
    });
    net.begin("DEVA", "DEVB");
    net.run();

    assert_eq!(
        net.first_cancel("DEVA"),
        Some((CancelCode::MismatchedCommitment, "Commitment mismatch".to_string()))
    );
    assert!(net.sas("DEVA").is_none());
    assert!(!net.persisted("DEVA"));
    assert!(!net.persisted("DEVB"));
    assert!(net.notices("DEVB").iter().any(|n| matches!(
        n,
        Notice::Cancelled {
            by_peer: true,
            code: CancelCode::MismatchedCommitment,
            ..
        }
    )));
}

#[test]
fn test_substituted_key_is_caught_by_mac() {
    let mut net = Network::new().with_tamper(|to, message| {
        if let VerificationMessage::Key(key) = message {
            if to.device_id.as_str() == "DEVB" {
                let attacker = keytrust_core::crypto::EphemeralKeyPair::generate();
                key.key = attacker.public_key_base64();
            }
        }
        true
    });
    net.begin("DEVA", "DEVB");
    net.run();

    let (code, _) = net.first_cancel("DEVA").expect("initiator cancels");
    assert_eq!(code, CancelCode::KeyMismatch);
    assert_ne!(net.sas("DEVA"), net.sas("DEVB"));
    assert!(!net.persisted("DEVA"));
    assert!(!net.persisted("DEVB"));
}

#[test]
fn test_unsupported_key_agreement_gets_no_accept() {
    let mut net = Network::new().with_tamper(|_, message| {
        if let VerificationMessage::Start(start) = message {
            start.key_agreement_protocols = vec!["curve25519".to_string()];
        }
        true
    });
    net.begin("DEVA", "DEVB");
    net.run();

    assert_eq!(
        net.first_cancel("DEVB").map(|(code, _)| code),
        Some(CancelCode::UnknownMethod)
    );
    assert!(!net
        .sent("DEVB")
        .iter()
        .any(|m| m.message_type() == MessageType::Accept));
    assert!(net.engine("DEVA").active_sessions().is_empty());
}

#[test]
fn test_unknown_key_ids_are_named_in_cancel() {
    let mut net = Network::new().with_tamper(|to, message| {
        if let VerificationMessage::Mac(mac) = message {
            if to.device_id.as_str() == "DEVB" {
                mac.mac.insert("ed25519:GHOST".to_string(), "AAAA".to_string());
            }
        }
        true
    });
    net.begin("DEVA", "DEVB");
    net.run();

    assert_eq!(
        net.first_cancel("DEVB"),
        Some((CancelCode::KeyMismatch, "Missing keys: ed25519:GHOST".to_string()))
    );
}

#[test]
fn test_duplicate_key_is_unexpected() {
    let mut net = Network::new();
    net.duplicate = Some(MessageType::Key);
    net.begin("DEVA", "DEVB");
    net.run();

    let cancels: Vec<CancelCode> = ["DEVA", "DEVB"]
        .into_iter()
        .filter_map(|d| net.first_cancel(d).map(|(code, _)| code))
        .collect();
    assert!(cancels.contains(&CancelCode::UnexpectedMessage));
    assert!(!net.persisted("DEVA") || !net.persisted("DEVB"));
}

#[test]
fn test_missing_own_keys_skips_mac() {
    let mut net = Network::new();
    net.directory = KeysQueryResponse::default();
    net.begin("DEVA", "DEVB");
    net.run();

    for device in ["DEVA", "DEVB"] {
        assert!(net.sas(device).is_some());
        assert!(net
            .notices(device)
            .iter()
            .any(|n| matches!(n, Notice::MissingOwnKeys { .. })));
        assert!(!net
            .sent(device)
            .iter()
            .any(|m| m.message_type() == MessageType::Mac));
        assert_eq!(
            net.engine(device).session_state(&TXN.into()),
            Some(SessionState::SasReady)
        );
    }
}

#[test]
fn test_dropped_ready_leaves_request_pending() {
    let mut net = Network::new().with_tamper(|_, message| message.message_type() != MessageType::Ready);
    net.begin("DEVA", "DEVB");
    net.run();

    assert_eq!(
        net.engine("DEVA").session_state(&TXN.into()),
        Some(SessionState::Requested)
    );
    assert_eq!(
        net.engine("DEVB").session_state(&TXN.into()),
        Some(SessionState::ReadySent)
    );
}

// ----------------------------------------------------------------------------
// Start Collisions
// ----------------------------------------------------------------------------

/// Drive `local` to StartSent with `peer`, then hand it the peer's own start
fn collide(local: &str, peer: &str, method: &str) -> (VerificationEngine<FixedClock>, Vec<Effect>) {
    let mut engine = VerificationEngine::new(
        DeviceIdentity::new(ALICE, local),
        &VerificationConfig::testing(),
        FixedClock,
    );
    engine.begin_request(peer.into(), TXN.into()).unwrap();
    engine.handle(
        &ALICE.into(),
        VerificationMessage::Ready(keytrust_core::protocol::ReadyContent {
            from_device: peer.into(),
            methods: vec!["m.sas.v1".to_string()],
            transaction_id: TXN.into(),
        }),
        None,
    );
    assert_eq!(engine.session_state(&TXN.into()), Some(SessionState::StartSent));

    let mut theirs: StartContent = SupportedAlgorithms::default().start_content(peer.into(), TXN.into());
    theirs.method = method.to_string();
    let effects = engine.handle(&ALICE.into(), VerificationMessage::Start(theirs), None);
    (engine, effects)
}

#[test]
fn test_collision_lower_device_keeps_its_start() {
    let (engine, effects) = collide("DEVA", "DEVB", "m.sas.v1");
    assert!(!effects.iter().any(|e| matches!(e, Effect::Send { .. })));
    assert_eq!(engine.session_state(&TXN.into()), Some(SessionState::StartSent));
}

#[test]
fn test_collision_higher_device_yields() {
    let (engine, effects) = collide("DEVB", "DEVA", "m.sas.v1");
    assert!(effects.iter().any(|e| matches!(
        e,
        Effect::Send {
            message: VerificationMessage::Accept(_),
            ..
        }
    )));
    assert!(effects
        .iter()
        .any(|e| matches!(e, Effect::Notify(Notice::SessionReset { .. }))));
    let session = engine.session(&TXN.into()).unwrap();
    assert_eq!(session.role(), keytrust_core::Role::Responder);
    assert_eq!(session.state, SessionState::AcceptSent);
}

#[test]
fn test_full_collision_both_verify() {
    // Both devices request and both see a ready, so both send start
    let mut net =
        Network::new().with_tamper(|_, message| message.message_type() != MessageType::Request);
    net.begin("DEVA", "DEVB");
    net.begin("DEVB", "DEVA");
    for (device, peer) in [("DEVA", "DEVB"), ("DEVB", "DEVA")] {
        let ready = VerificationMessage::Ready(keytrust_core::protocol::ReadyContent {
            from_device: peer.into(),
            methods: vec!["m.sas.v1".to_string()],
            transaction_id: TXN.into(),
        });
        let effects = net
            .devices
            .get_mut(device)
            .unwrap()
            .engine
            .handle(&ALICE.into(), ready, None);
        net.absorb(device, effects);
    }
    net.run();

    let starts = |device: &str| {
        net.sent(device)
            .iter()
            .filter(|m| m.message_type() == MessageType::Start)
            .count()
    };
    assert_eq!((starts("DEVA"), starts("DEVB")), (1, 1));
    assert!(net
        .notices("DEVB")
        .iter()
        .any(|n| matches!(n, Notice::SessionReset { .. })));

    let sas = net.sas("DEVA");
    assert!(sas.is_some());
    assert_eq!(sas, net.sas("DEVB"));
    for device in ["DEVA", "DEVB"] {
        assert!(net.first_cancel(device).is_none());
        assert!(net.persisted(device));
        assert!(net.engine(device).active_sessions().is_empty());
    }
}

#[test]
fn test_collision_method_mismatch_cancels() {
    let (engine, effects) = collide("DEVA", "DEVB", "m.reciprocate.v1");
    let code = effects.iter().find_map(|e| match e {
        Effect::Send {
            message: VerificationMessage::Cancel(c),
            ..
        } => c.code.clone(),
        _ => None,
    });
    assert_eq!(code, Some(CancelCode::UnexpectedMessage));
    assert!(engine.active_sessions().is_empty());
}
