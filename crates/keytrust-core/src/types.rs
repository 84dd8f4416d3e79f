//! Core identifier and time types

use core::fmt;
use core::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Identifiers
// ----------------------------------------------------------------------------

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new<S: Into<String>>(value: S) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Account identifier, e.g. `@alice:example.org`
    UserId
);
string_id!(
    /// Device identifier within an account
    DeviceId
);
string_id!(
    /// Opaque identifier scoping one verification attempt
    TransactionId
);

impl TransactionId {
    /// Generate a fresh transaction id of the form `kt_<millis>_<random>`
    pub fn generate(now: Timestamp) -> Self {
        Self(format!(
            "kt_{}_{}",
            now.as_millis(),
            uuid::Uuid::new_v4().simple()
        ))
    }
}

/// A `(user, device)` pair
///
/// Ordering is lexicographic on the user id, then the device id. Start
/// collisions are resolved with this ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub user_id: UserId,
    pub device_id: DeviceId,
}

impl DeviceIdentity {
    pub fn new(user_id: impl Into<UserId>, device_id: impl Into<DeviceId>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }

    /// The same account on another device
    pub fn sibling(&self, device_id: impl Into<DeviceId>) -> Self {
        Self {
            user_id: self.user_id.clone(),
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.user_id, self.device_id)
    }
}

/// An entry of the account's device list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnDevice {
    pub device_id: DeviceId,
    /// Last activity in milliseconds since the epoch, if the server knows it
    pub last_seen_ts: Option<u64>,
}

// ----------------------------------------------------------------------------
// Time
// ----------------------------------------------------------------------------

/// Milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(other))
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Timestamp {
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

/// Trait for abstracting time sources
pub trait TimeSource {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall-clock time source
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_identity_orders_by_user_then_device() {
        let a = DeviceIdentity::new("@alice:example.org", "AAAA");
        let b = DeviceIdentity::new("@alice:example.org", "BBBB");
        let c = DeviceIdentity::new("@bob:example.org", "AAAA");
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.sibling("BBBB"), b);
    }

    #[test]
    fn test_transaction_ids_are_unique_and_prefixed() {
        let now = Timestamp::new(1_700_000_000_000);
        let first = TransactionId::generate(now);
        let second = TransactionId::generate(now);
        assert!(first.as_str().starts_with("kt_1700000000000_"));
        assert_ne!(first, second);
    }

    #[test]
    fn test_timestamp_arithmetic_saturates() {
        let t = Timestamp::new(10);
        assert_eq!((t + 5).as_millis(), 15);
        assert_eq!(Timestamp::new(3) - t, 0);
        assert_eq!(t - Timestamp::new(3), 7);
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let id = UserId::from("@alice:example.org");
        assert_eq!(
            serde_json::to_string(&id).unwrap(),
            "\"@alice:example.org\""
        );
    }
}
