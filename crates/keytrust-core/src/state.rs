//! The persisted "already verified" record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DeviceIdentity, Timestamp};

/// Peer a verification completed with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedPeer {
    pub user_id: String,
    pub device_id: String,
}

/// Contents of the verified-state file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedStateRecord {
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_with: Option<VerifiedPeer>,
}

impl VerifiedStateRecord {
    /// `verifiedAt` is left out when `at` has no calendar representation
    pub fn verified_with(peer: &DeviceIdentity, at: Timestamp) -> Self {
        let verified_at = i64::try_from(at.as_millis())
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis);
        Self {
            verified: true,
            verified_at,
            verified_with: Some(VerifiedPeer {
                user_id: peer.user_id.to_string(),
                device_id: peer.device_id.to_string(),
            }),
        }
    }
}
