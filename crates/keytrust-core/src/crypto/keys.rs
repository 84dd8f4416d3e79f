//! Ephemeral X25519 key agreement

use core::fmt;

use rand_core::{CryptoRng, OsRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

use super::encoding::{decode_base64, encode_unpadded};
use crate::errors::CryptographicError;

/// One side's ephemeral key pair for a single verification
///
/// The private half is scrubbed when the pair is dropped.
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a fresh key pair from the operating system RNG
    pub fn generate() -> Self {
        Self::generate_with_rng(&mut OsRng)
    }

    /// Generate a key pair from the supplied RNG
    pub fn generate_with_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a key pair from raw private bytes
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Public key as unpadded base64, the form sent in `key` messages
    pub fn public_key_base64(&self) -> String {
        encode_unpadded(self.public.as_bytes())
    }

    /// Diffie-Hellman with the peer's base64 public key
    pub fn compute_shared_secret(
        &self,
        their_public_base64: &str,
    ) -> Result<SharedSecret, CryptographicError> {
        let decoded =
            decode_base64(their_public_base64).map_err(|_| CryptographicError::InvalidPublicKey {
                reason: "not valid base64".to_string(),
            })?;
        let bytes: [u8; 32] =
            decoded
                .as_slice()
                .try_into()
                .map_err(|_| CryptographicError::InvalidPublicKey {
                    reason: format!("expected 32 bytes, got {}", decoded.len()),
                })?;

        let shared = self.secret.diffie_hellman(&PublicKey::from(bytes));
        if !shared.was_contributory() {
            return Err(CryptographicError::NonContributory);
        }
        Ok(SharedSecret(shared.to_bytes()))
    }
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

/// Raw X25519 output, scrubbed on drop
#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn fixed_pair(start: u8) -> EphemeralKeyPair {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = start + i as u8;
        }
        EphemeralKeyPair::from_secret_bytes(bytes)
    }

    #[test]
    fn test_shared_secret_golden_vector() {
        let alice = fixed_pair(1);
        let bob = fixed_pair(33);
        assert_eq!(
            alice.public_key_base64(),
            "B6N8vBQgk8i3VdwbEOhstCY3StFqqFPtC9/AsrhtHHw"
        );
        assert_eq!(
            bob.public_key_base64(),
            "WGmv9FBUlzLLqu1eXfmzCm2jHLDldCutWtShp2jxpns"
        );

        let secret = alice
            .compute_shared_secret(&bob.public_key_base64())
            .unwrap();
        assert_eq!(
            hex::encode(secret.as_bytes()),
            "a84dc7c3c8f058b1b2dc4cd1e9b5dc0a7987f88b6a9564cde3391fc421159e77"
        );
    }

    #[test]
    fn test_shared_secret_is_symmetric() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let alice = EphemeralKeyPair::generate_with_rng(&mut rng);
        let bob = EphemeralKeyPair::generate_with_rng(&mut rng);

        let ab = alice.compute_shared_secret(&bob.public_key_base64()).unwrap();
        let ba = bob.compute_shared_secret(&alice.public_key_base64()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_padded_peer_key_is_accepted() {
        let alice = fixed_pair(1);
        let bob = fixed_pair(33);
        let padded = format!("{}=", bob.public_key_base64());
        assert_eq!(
            alice.compute_shared_secret(&padded).unwrap(),
            alice
                .compute_shared_secret(&bob.public_key_base64())
                .unwrap()
        );
    }

    #[test]
    fn test_generated_pairs_differ() {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();
        assert_ne!(a.public_key_bytes(), b.public_key_bytes());
    }

    #[test]
    fn test_rejects_malformed_public_keys() {
        let alice = fixed_pair(1);
        assert!(matches!(
            alice.compute_shared_secret("AQID"),
            Err(CryptographicError::InvalidPublicKey { .. })
        ));
        assert!(matches!(
            alice.compute_shared_secret("@@@"),
            Err(CryptographicError::InvalidPublicKey { .. })
        ));
        let zero = encode_unpadded(&[0u8; 32]);
        assert_eq!(
            alice.compute_shared_secret(&zero),
            Err(CryptographicError::NonContributory)
        );
    }
}
