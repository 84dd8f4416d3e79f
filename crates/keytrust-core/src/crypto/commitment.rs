//! Commitment over the acceptor's key and the `start` content

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::canonical::canonicalize;
use super::encoding::encode_unpadded;

/// `base64(SHA-256(acceptor_public_key || canonical(start)))`, unpadded
pub fn compute_commitment(acceptor_public_key: &str, start_content: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(acceptor_public_key.as_bytes());
    hasher.update(canonicalize(start_content).as_bytes());
    encode_unpadded(&hasher.finalize())
}

/// Recompute the commitment and compare it with the one received in `accept`
pub fn verify_commitment(expected: &str, acceptor_public_key: &str, start_content: &Value) -> bool {
    compute_commitment(acceptor_public_key, start_content) == expected
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn start_content() -> Value {
        json!({
            "from_device": "DEVA",
            "method": "m.sas.v1",
            "key_agreement_protocols": ["curve25519-hkdf-sha256"],
            "hashes": ["sha256"],
            "message_authentication_codes": ["hkdf-hmac-sha256.v2", "hkdf-hmac-sha256"],
            "short_authentication_string": ["decimal", "emoji"],
            "transaction_id": "txn1"
        })
    }

    #[test]
    fn test_commitment_golden_vector() {
        let commitment = compute_commitment(
            "WGmv9FBUlzLLqu1eXfmzCm2jHLDldCutWtShp2jxpns",
            &start_content(),
        );
        assert_eq!(commitment, "O/51iAFd+A/+O2lZDrKSSgXxomDRVQWmP0JEtv/HReg");
        assert!(!commitment.contains('='));
    }

    #[test]
    fn test_any_field_change_breaks_commitment() {
        let key = "WGmv9FBUlzLLqu1eXfmzCm2jHLDldCutWtShp2jxpns";
        let original = compute_commitment(key, &start_content());

        let mut tampered = start_content();
        tampered["from_device"] = json!("DEVX");
        assert!(!verify_commitment(&original, key, &tampered));

        let mut reordered = start_content();
        reordered["short_authentication_string"] = json!(["emoji", "decimal"]);
        assert!(!verify_commitment(&original, key, &reordered));

        assert!(verify_commitment(&original, key, &start_content()));
        assert!(!verify_commitment(&original, "other", &start_content()));
    }
}
