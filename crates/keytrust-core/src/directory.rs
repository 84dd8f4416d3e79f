//! Device and cross-signing key directory
//!
//! A [`KeysQueryResponse`] is the snapshot the transport returns for one
//! account. The helpers here pick the keys this device MACs and resolve the
//! key ids a peer MACed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{DeviceId, UserId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeys {
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossSigningKey {
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
}

/// Key directory snapshot, keyed by user id and then device id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysQueryResponse {
    #[serde(default)]
    pub device_keys: BTreeMap<String, BTreeMap<String, DeviceKeys>>,
    #[serde(default)]
    pub master_keys: BTreeMap<String, CrossSigningKey>,
    #[serde(default)]
    pub self_signing_keys: BTreeMap<String, CrossSigningKey>,
    #[serde(default)]
    pub user_signing_keys: BTreeMap<String, CrossSigningKey>,
}

/// A key id and its public value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    pub key_id: String,
    pub value: String,
}

/// Outcome of resolving a peer's MACed key ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedKeys {
    pub found: BTreeMap<String, String>,
    pub missing: Vec<String>,
}

impl KeysQueryResponse {
    fn device_map(&self, user_id: &UserId, device_id: &DeviceId) -> Option<&BTreeMap<String, String>> {
        self.device_keys
            .get(user_id.as_str())
            .and_then(|devices| devices.get(device_id.as_str()))
            .map(|device| &device.keys)
    }

    fn cross_signing_maps(&self, user_id: &UserId) -> [Option<&BTreeMap<String, String>>; 3] {
        [
            &self.master_keys,
            &self.self_signing_keys,
            &self.user_signing_keys,
        ]
        .map(|source| source.get(user_id.as_str()).map(|key| &key.keys))
    }

    /// Keys this device attests in its `mac`
    ///
    /// The device's own `ed25519:<device>` key comes first, followed by any
    /// master, self-signing and user-signing keys.
    pub fn keys_to_mac(&self, user_id: &UserId, device_id: &DeviceId) -> Vec<KeyEntry> {
        let mut entries = Vec::new();

        let ed_key_id = format!("ed25519:{device_id}");
        if let Some(value) = self
            .device_map(user_id, device_id)
            .and_then(|keys| keys.get(&ed_key_id))
            .filter(|value| !value.is_empty())
        {
            entries.push(KeyEntry {
                key_id: ed_key_id,
                value: value.clone(),
            });
        }

        for keys in self.cross_signing_maps(user_id).into_iter().flatten() {
            for (key_id, value) in keys {
                if !value.is_empty() {
                    entries.push(KeyEntry {
                        key_id: key_id.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
        entries
    }

    /// Look up each key id, preferring device keys, then master,
    /// self-signing and user-signing keys
    pub fn resolve_key_values<'a, I>(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        key_ids: I,
    ) -> ResolvedKeys
    where
        I: IntoIterator<Item = &'a str>,
    {
        let device = self.device_map(user_id, device_id);
        let cross = self.cross_signing_maps(user_id);

        let mut resolved = ResolvedKeys::default();
        for key_id in key_ids {
            let value = std::iter::once(device)
                .chain(cross)
                .flatten()
                .find_map(|keys| keys.get(key_id).filter(|value| !value.is_empty()));
            match value {
                Some(value) => {
                    resolved.found.insert(key_id.to_string(), value.clone());
                }
                None => resolved.missing.push(key_id.to_string()),
            }
        }
        resolved
    }

    // ------------------------------------------------------------------------
    // Builders
    // ------------------------------------------------------------------------

    pub fn with_device_key(
        mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        key_id: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.device_keys
            .entry(user_id.to_string())
            .or_default()
            .entry(device_id.to_string())
            .or_default()
            .keys
            .insert(key_id.into(), value.into());
        self
    }

    pub fn with_master_key(
        mut self,
        user_id: &UserId,
        key_id: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.master_keys
            .entry(user_id.to_string())
            .or_default()
            .keys
            .insert(key_id.into(), value.into());
        self
    }

    pub fn with_self_signing_key(
        mut self,
        user_id: &UserId,
        key_id: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.self_signing_keys
            .entry(user_id.to_string())
            .or_default()
            .keys
            .insert(key_id.into(), value.into());
        self
    }

    pub fn with_user_signing_key(
        mut self,
        user_id: &UserId,
        key_id: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.user_signing_keys
            .entry(user_id.to_string())
            .or_default()
            .keys
            .insert(key_id.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserId {
        UserId::from("@alice:example.org")
    }

    fn directory() -> KeysQueryResponse {
        let user = alice();
        KeysQueryResponse::default()
            .with_device_key(&user, &"DEVA".into(), "ed25519:DEVA", "edA")
            .with_device_key(&user, &"DEVA".into(), "curve25519:DEVA", "cvA")
            .with_device_key(&user, &"DEVB".into(), "ed25519:DEVB", "edB")
            .with_master_key(&user, "ed25519:master", "mk")
            .with_self_signing_key(&user, "ed25519:ssk", "ssk")
            .with_user_signing_key(&user, "ed25519:usk", "")
    }

    #[test]
    fn test_keys_to_mac_order_and_filtering() {
        let keys = directory().keys_to_mac(&alice(), &"DEVA".into());
        let ids: Vec<&str> = keys.iter().map(|k| k.key_id.as_str()).collect();
        assert_eq!(ids, ["ed25519:DEVA", "ed25519:master", "ed25519:ssk"]);
    }

    #[test]
    fn test_keys_to_mac_unknown_device() {
        let keys = directory().keys_to_mac(&alice(), &"NOPE".into());
        assert_eq!(keys.len(), 2);
        assert!(directory().keys_to_mac(&"@bob:x".into(), &"DEVA".into()).is_empty());
    }

    #[test]
    fn test_resolve_prefers_device_keys() {
        let user = alice();
        let dir = directory().with_master_key(&user, "ed25519:DEVB", "shadow");
        let resolved = dir.resolve_key_values(&user, &"DEVB".into(), ["ed25519:DEVB", "ed25519:master"]);
        assert_eq!(resolved.found["ed25519:DEVB"], "edB");
        assert_eq!(resolved.found["ed25519:master"], "mk");
        assert!(resolved.missing.is_empty());
    }

    #[test]
    fn test_resolve_reports_missing_ids() {
        let resolved = directory().resolve_key_values(
            &alice(),
            &"DEVB".into(),
            ["ed25519:DEVB", "ed25519:gone", "ed25519:usk"],
        );
        assert_eq!(resolved.missing, vec!["ed25519:gone", "ed25519:usk"]);
    }

    #[test]
    fn test_deserializes_wire_shape() {
        let json = r#"{
            "device_keys": {"@alice:example.org": {"DEVA": {"keys": {"ed25519:DEVA": "edA"}, "algorithms": []}}},
            "master_keys": {"@alice:example.org": {"keys": {"ed25519:m": "m"}, "usage": ["master"]}}
        }"#;
        let parsed: KeysQueryResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.keys_to_mac(&alice(), &"DEVA".into()).len(), 2);
    }
}
