//! Cryptographic primitives for SAS verification
//!
//! Everything here is pure: no function reads or mutates session state. The
//! session machinery composes these into the protocol steps.

pub mod canonical;
pub mod commitment;
pub mod encoding;
pub mod keys;
pub mod mac;
pub mod sas;

pub use canonical::canonicalize;
pub use commitment::{compute_commitment, verify_commitment};
pub use encoding::{decode_base64, encode_padded, encode_unpadded};
pub use keys::{EphemeralKeyPair, SharedSecret};
pub use mac::{derive_mac_key, hmac_base64, MacKey, MAC_INFO_PREFIX};
pub use sas::{
    derive_sas_bytes, derive_sas_info, format_decimal_sas, format_emoji_sas, DecimalSas, EmojiSas,
    SasEmoji, SasParticipant, SAS_EMOJI_TABLE, SAS_INFO_PREFIX,
};
