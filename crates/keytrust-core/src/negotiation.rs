//! Algorithm negotiation for the SAS method
//!
//! The responder intersects the initiator's `start` offer with what it
//! supports; the initiator validates the `accept` it gets back against the
//! same table.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::{AcceptContent, StartContent};
use crate::types::{DeviceId, TransactionId};

/// The only verification method spoken here
pub const SAS_METHOD: &str = "m.sas.v1";

// ----------------------------------------------------------------------------
// Algorithm Identifiers
// ----------------------------------------------------------------------------

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $wire)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }

            pub fn from_wire(value: &str) -> Option<Self> {
                match value {
                    $($wire => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum!(
    /// Key agreement protocol
    KeyAgreement { Curve25519HkdfSha256 => "curve25519-hkdf-sha256" }
);
wire_enum!(
    /// Commitment hash
    HashAlgorithm { Sha256 => "sha256" }
);
wire_enum!(
    /// MAC variant; the legacy form keeps base64 padding
    MacMethod {
        HkdfHmacSha256V2 => "hkdf-hmac-sha256.v2",
        HkdfHmacSha256 => "hkdf-hmac-sha256",
    }
);
wire_enum!(
    /// SAS rendering
    SasMethod {
        Emoji => "emoji",
        Decimal => "decimal",
    }
);

impl MacMethod {
    /// Whether MACs are sent without trailing `=`
    pub fn unpadded(&self) -> bool {
        matches!(self, MacMethod::HkdfHmacSha256V2)
    }
}

/// The mutually supported configuration for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedParameters {
    pub key_agreement: KeyAgreement,
    pub hash: HashAlgorithm,
    pub mac: MacMethod,
    pub sas_methods: Vec<SasMethod>,
}

impl NegotiatedParameters {
    pub fn renders(&self, method: SasMethod) -> bool {
        self.sas_methods.contains(&method)
    }
}

/// Why an offer or answer was rejected; always cancelled as `m.unknown_method`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    #[error("Unsupported verification method {0}")]
    UnsupportedMethod(String),
    #[error("No supported key agreement protocol")]
    UnsupportedKeyAgreement,
    #[error("No supported hash")]
    UnsupportedHash,
    #[error("No supported message authentication code")]
    UnsupportedMac,
    #[error("No common short authentication string method")]
    NoCommonSas,
}

// ----------------------------------------------------------------------------
// Supported Algorithms
// ----------------------------------------------------------------------------

/// Local capability table, in preference order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedAlgorithms {
    pub key_agreements: Vec<KeyAgreement>,
    pub hashes: Vec<HashAlgorithm>,
    pub macs: Vec<MacMethod>,
    pub sas_methods: Vec<SasMethod>,
}

impl Default for SupportedAlgorithms {
    fn default() -> Self {
        Self::with_legacy_mac(true)
    }
}

impl SupportedAlgorithms {
    pub fn with_legacy_mac(allow_legacy_mac: bool) -> Self {
        let mut macs = vec![MacMethod::HkdfHmacSha256V2];
        if allow_legacy_mac {
            macs.push(MacMethod::HkdfHmacSha256);
        }
        Self {
            key_agreements: vec![KeyAgreement::Curve25519HkdfSha256],
            hashes: vec![HashAlgorithm::Sha256],
            macs,
            sas_methods: vec![SasMethod::Emoji, SasMethod::Decimal],
        }
    }

    /// Method identifiers advertised in `request` and `ready`
    pub fn methods(&self) -> Vec<String> {
        vec![SAS_METHOD.to_string()]
    }

    /// Whether any method in a peer's list is one we speak
    pub fn supports_any_method<S: AsRef<str>>(&self, methods: &[S]) -> bool {
        methods.iter().any(|m| m.as_ref() == SAS_METHOD)
    }

    /// Build our `start` offer
    pub fn start_content(&self, from_device: DeviceId, transaction_id: TransactionId) -> StartContent {
        StartContent {
            from_device,
            method: SAS_METHOD.to_string(),
            key_agreement_protocols: wire_list(&self.key_agreements, KeyAgreement::as_str),
            hashes: wire_list(&self.hashes, HashAlgorithm::as_str),
            message_authentication_codes: wire_list(&self.macs, MacMethod::as_str),
            short_authentication_string: wire_list(&self.sas_methods, SasMethod::as_str),
            transaction_id,
            extra: Default::default(),
        }
    }

    /// Intersect a peer's `start` offer with the local table
    ///
    /// Key agreement and hash follow the offer's order; the MAC follows local
    /// preference so the unpadded variant wins whenever both are offered.
    pub fn negotiate(&self, start: &StartContent) -> Result<NegotiatedParameters, NegotiationError> {
        if start.method != SAS_METHOD {
            return Err(NegotiationError::UnsupportedMethod(start.method.clone()));
        }
        let key_agreement = start
            .key_agreement_protocols
            .iter()
            .filter_map(|p| KeyAgreement::from_wire(p))
            .find(|p| self.key_agreements.contains(p))
            .ok_or(NegotiationError::UnsupportedKeyAgreement)?;
        let hash = start
            .hashes
            .iter()
            .filter_map(|h| HashAlgorithm::from_wire(h))
            .find(|h| self.hashes.contains(h))
            .ok_or(NegotiationError::UnsupportedHash)?;
        let mac = self
            .macs
            .iter()
            .copied()
            .find(|m| start.message_authentication_codes.iter().any(|o| o == m.as_str()))
            .ok_or(NegotiationError::UnsupportedMac)?;
        let sas_methods: Vec<SasMethod> = self
            .sas_methods
            .iter()
            .copied()
            .filter(|s| start.short_authentication_string.iter().any(|o| o == s.as_str()))
            .collect();
        if sas_methods.is_empty() {
            return Err(NegotiationError::NoCommonSas);
        }

        Ok(NegotiatedParameters {
            key_agreement,
            hash,
            mac,
            sas_methods,
        })
    }

    /// Check the responder's `accept` against what we offered
    pub fn validate_accept(
        &self,
        accept: &AcceptContent,
    ) -> Result<NegotiatedParameters, NegotiationError> {
        if accept.method != SAS_METHOD {
            return Err(NegotiationError::UnsupportedMethod(accept.method.clone()));
        }
        let key_agreement = KeyAgreement::from_wire(&accept.key_agreement_protocol)
            .filter(|p| self.key_agreements.contains(p))
            .ok_or(NegotiationError::UnsupportedKeyAgreement)?;
        let hash = HashAlgorithm::from_wire(&accept.hash)
            .filter(|h| self.hashes.contains(h))
            .ok_or(NegotiationError::UnsupportedHash)?;
        let mac = MacMethod::from_wire(&accept.message_authentication_code)
            .filter(|m| self.macs.contains(m))
            .ok_or(NegotiationError::UnsupportedMac)?;
        let sas_methods: Vec<SasMethod> = accept
            .short_authentication_string
            .iter()
            .filter_map(|s| SasMethod::from_wire(s))
            .filter(|s| self.sas_methods.contains(s))
            .collect();
        if sas_methods.is_empty() {
            return Err(NegotiationError::NoCommonSas);
        }

        Ok(NegotiatedParameters {
            key_agreement,
            hash,
            mac,
            sas_methods,
        })
    }
}

fn wire_list<T: Copy>(items: &[T], name: fn(&T) -> &'static str) -> Vec<String> {
    items.iter().map(|item| name(item).to_string()).collect()
}
