//! MAC key derivation and keyed MACs over long-term keys

use core::fmt;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use super::encoding::{encode_padded, encode_unpadded};
use crate::errors::CryptographicError;

/// Leading component of the MAC HKDF info string
pub const MAC_INFO_PREFIX: &str = "MATRIX_KEY_VERIFICATION_MAC";

type HmacSha256 = Hmac<Sha256>;

/// 32-byte HMAC key for one key id in one direction
#[derive(Clone, ZeroizeOnDrop)]
pub struct MacKey([u8; 32]);

impl MacKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for MacKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MacKey(..)")
    }
}

/// Derive the HMAC key for `key_id`
///
/// "my" is the side producing the MAC. A verifier checking a received MAC
/// passes the peer as "my" and itself as "other".
pub fn derive_mac_key(
    shared_secret: &[u8],
    my_user: &str,
    my_device: &str,
    other_user: &str,
    other_device: &str,
    transaction_id: &str,
    key_id: &str,
) -> Result<MacKey, CryptographicError> {
    let info = [
        MAC_INFO_PREFIX,
        my_user,
        my_device,
        other_user,
        other_device,
        transaction_id,
        key_id,
    ]
    .concat();
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; 32];
    hk.expand(info.as_bytes(), &mut okm)
        .map_err(|_| CryptographicError::KeyDerivationFailed)?;
    Ok(MacKey(okm))
}

/// HMAC-SHA256 of `value`, base64 encoded with or without padding
pub fn hmac_base64(key: &MacKey, value: &str, unpadded: bool) -> Result<String, CryptographicError> {
    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| CryptographicError::InvalidMacKey)?;
    mac.update(value.as_bytes());
    let tag = mac.finalize().into_bytes();
    Ok(if unpadded {
        encode_unpadded(&tag)
    } else {
        encode_padded(&tag)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHARED: &str = "a84dc7c3c8f058b1b2dc4cd1e9b5dc0a7987f88b6a9564cde3391fc421159e77";
    const USER: &str = "@alice:example.org";

    fn shared() -> Vec<u8> {
        hex::decode(SHARED).unwrap()
    }

    #[test]
    fn test_mac_key_golden_vector() {
        let key = derive_mac_key(&shared(), USER, "DEVA", USER, "DEVB", "txn1", "ed25519:DEVA")
            .unwrap();
        assert_eq!(
            hex::encode(key.as_bytes()),
            "d9d420111f0980967afe624c340d04d70567d03aef9830ebe55a3a992243a2f6"
        );
    }

    #[test]
    fn test_hmac_padding_variants() {
        let key = derive_mac_key(&shared(), USER, "DEVA", USER, "DEVB", "txn1", "ed25519:DEVA")
            .unwrap();
        assert_eq!(
            hmac_base64(&key, "ed25519pubkeyvalue", true).unwrap(),
            "P7DJcsvSchxdiMQNb5RlqYn1Kof7MPL7ZTcMUR1wZOM"
        );
        assert_eq!(
            hmac_base64(&key, "ed25519pubkeyvalue", false).unwrap(),
            "P7DJcsvSchxdiMQNb5RlqYn1Kof7MPL7ZTcMUR1wZOM="
        );
    }

    #[test]
    fn test_role_swap_matches_and_unswapped_does_not() {
        // DEVA sends a MAC over its key; DEVB verifies with roles swapped.
        let sent_key =
            derive_mac_key(&shared(), USER, "DEVA", USER, "DEVB", "txn1", "ed25519:DEVA").unwrap();
        let sent = hmac_base64(&sent_key, "value", true).unwrap();

        let verifier_key =
            derive_mac_key(&shared(), USER, "DEVA", USER, "DEVB", "txn1", "ed25519:DEVA").unwrap();
        assert_eq!(hmac_base64(&verifier_key, "value", true).unwrap(), sent);

        let unswapped =
            derive_mac_key(&shared(), USER, "DEVB", USER, "DEVA", "txn1", "ed25519:DEVA").unwrap();
        assert_ne!(hmac_base64(&unswapped, "value", true).unwrap(), sent);
    }

    #[test]
    fn test_key_id_is_bound() {
        let a = derive_mac_key(&shared(), USER, "DEVA", USER, "DEVB", "txn1", "ed25519:DEVA").unwrap();
        let b = derive_mac_key(&shared(), USER, "DEVA", USER, "DEVB", "txn1", "KEY_IDS").unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }
}
