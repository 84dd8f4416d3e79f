//! Base64 helpers
//!
//! The protocol emits unpadded standard base64 but peers are not consistent,
//! so decoding accepts either form.

use base64::{
    alphabet,
    engine::{general_purpose, DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};

use crate::errors::CryptographicError;

const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Standard alphabet, no trailing `=`
pub fn encode_unpadded(bytes: &[u8]) -> String {
    general_purpose::STANDARD_NO_PAD.encode(bytes)
}

/// Standard alphabet with padding
pub fn encode_padded(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Decode standard base64 with or without padding, ignoring surrounding whitespace
pub fn decode_base64(input: &str) -> Result<Vec<u8>, CryptographicError> {
    LENIENT
        .decode(input.trim())
        .map_err(|_| CryptographicError::InvalidBase64)
}
