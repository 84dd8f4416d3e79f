//! Typed verification messages and the boundary parser
//!
//! Inbound payloads are checked here once. Handlers further in only ever see
//! a [`VerificationMessage`] whose required fields are present and non-empty.

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{CancelCode, ParseError};
use crate::types::{DeviceId, TransactionId};

/// Common prefix of every verification event type
pub const EVENT_PREFIX: &str = "m.key.verification.";

/// Synthetic key id for the MAC over the sorted key-id list
pub const KEY_IDS_MAC_ID: &str = "KEY_IDS";

// ----------------------------------------------------------------------------
// Message Types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Request,
    Ready,
    Start,
    Accept,
    Key,
    Mac,
    Done,
    Cancel,
}

impl MessageType {
    pub const ALL: [MessageType; 8] = [
        MessageType::Request,
        MessageType::Ready,
        MessageType::Start,
        MessageType::Accept,
        MessageType::Key,
        MessageType::Mac,
        MessageType::Done,
        MessageType::Cancel,
    ];

    /// Full event type, e.g. `m.key.verification.start`
    pub fn event_type(&self) -> &'static str {
        match self {
            MessageType::Request => "m.key.verification.request",
            MessageType::Ready => "m.key.verification.ready",
            MessageType::Start => "m.key.verification.start",
            MessageType::Accept => "m.key.verification.accept",
            MessageType::Key => "m.key.verification.key",
            MessageType::Mac => "m.key.verification.mac",
            MessageType::Done => "m.key.verification.done",
            MessageType::Cancel => "m.key.verification.cancel",
        }
    }

    pub fn from_event_type(event_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.event_type() == event_type)
    }
}

// ----------------------------------------------------------------------------
// Content Records
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContent {
    pub from_device: DeviceId,
    #[serde(default)]
    pub methods: Vec<String>,
    pub transaction_id: TransactionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyContent {
    pub from_device: DeviceId,
    #[serde(default)]
    pub methods: Vec<String>,
    pub transaction_id: TransactionId,
}

/// `start` content
///
/// Fields this implementation does not interpret are kept in `extra` so the
/// commitment is computed over the content exactly as the peer sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartContent {
    pub from_device: DeviceId,
    pub method: String,
    #[serde(default)]
    pub key_agreement_protocols: Vec<String>,
    #[serde(default)]
    pub hashes: Vec<String>,
    #[serde(default)]
    pub message_authentication_codes: Vec<String>,
    #[serde(default)]
    pub short_authentication_string: Vec<String>,
    pub transaction_id: TransactionId,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StartContent {
    /// JSON form used for the commitment
    pub fn commitment_value(&self) -> Result<Value, ParseError> {
        Ok(serde_json::to_value(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptContent {
    pub method: String,
    pub commitment: String,
    pub key_agreement_protocol: String,
    pub hash: String,
    pub message_authentication_code: String,
    #[serde(default)]
    pub short_authentication_string: Vec<String>,
    pub transaction_id: TransactionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyContent {
    pub transaction_id: TransactionId,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacContent {
    pub transaction_id: TransactionId,
    /// Key id to base64 MAC
    pub mac: BTreeMap<String, String>,
    /// MAC over the sorted, comma-joined key ids
    pub keys: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoneContent {
    pub transaction_id: TransactionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelContent {
    pub transaction_id: TransactionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<CancelCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ----------------------------------------------------------------------------
// Tagged Union
// ----------------------------------------------------------------------------

/// One parsed verification message
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationMessage {
    Request(RequestContent),
    Ready(ReadyContent),
    Start(StartContent),
    Accept(AcceptContent),
    Key(KeyContent),
    Mac(MacContent),
    Done(DoneContent),
    Cancel(CancelContent),
}

impl VerificationMessage {
    /// Parse an inbound event into a typed message
    ///
    /// Unknown fields are ignored. Missing or empty required fields are an
    /// error.
    pub fn parse(event_type: &str, content: &Value) -> Result<Self, ParseError> {
        let kind = MessageType::from_event_type(event_type).ok_or_else(|| {
            ParseError::UnknownEventType {
                event_type: event_type.to_string(),
            }
        })?;
        if !content.is_object() {
            return Err(ParseError::NotAnObject);
        }

        let message = match kind {
            MessageType::Request => {
                let c: RequestContent = decode(content)?;
                non_empty("from_device", c.from_device.as_str())?;
                VerificationMessage::Request(c)
            }
            MessageType::Ready => {
                let c: ReadyContent = decode(content)?;
                non_empty("from_device", c.from_device.as_str())?;
                VerificationMessage::Ready(c)
            }
            MessageType::Start => {
                let c: StartContent = decode(content)?;
                non_empty("from_device", c.from_device.as_str())?;
                non_empty("method", &c.method)?;
                VerificationMessage::Start(c)
            }
            MessageType::Accept => {
                let c: AcceptContent = decode(content)?;
                non_empty("method", &c.method)?;
                non_empty("commitment", &c.commitment)?;
                non_empty("key_agreement_protocol", &c.key_agreement_protocol)?;
                non_empty("hash", &c.hash)?;
                non_empty("message_authentication_code", &c.message_authentication_code)?;
                VerificationMessage::Accept(c)
            }
            MessageType::Key => {
                let c: KeyContent = decode(content)?;
                non_empty("key", &c.key)?;
                VerificationMessage::Key(c)
            }
            MessageType::Mac => {
                let c: MacContent = decode(content)?;
                non_empty("keys", &c.keys)?;
                if c.mac.is_empty() {
                    return Err(ParseError::missing("mac"));
                }
                VerificationMessage::Mac(c)
            }
            MessageType::Done => VerificationMessage::Done(decode(content)?),
            MessageType::Cancel => VerificationMessage::Cancel(decode(content)?),
        };

        non_empty("transaction_id", message.transaction_id().as_str())?;
        Ok(message)
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            VerificationMessage::Request(_) => MessageType::Request,
            VerificationMessage::Ready(_) => MessageType::Ready,
            VerificationMessage::Start(_) => MessageType::Start,
            VerificationMessage::Accept(_) => MessageType::Accept,
            VerificationMessage::Key(_) => MessageType::Key,
            VerificationMessage::Mac(_) => MessageType::Mac,
            VerificationMessage::Done(_) => MessageType::Done,
            VerificationMessage::Cancel(_) => MessageType::Cancel,
        }
    }

    pub fn transaction_id(&self) -> &TransactionId {
        match self {
            VerificationMessage::Request(c) => &c.transaction_id,
            VerificationMessage::Ready(c) => &c.transaction_id,
            VerificationMessage::Start(c) => &c.transaction_id,
            VerificationMessage::Accept(c) => &c.transaction_id,
            VerificationMessage::Key(c) => &c.transaction_id,
            VerificationMessage::Mac(c) => &c.transaction_id,
            VerificationMessage::Done(c) => &c.transaction_id,
            VerificationMessage::Cancel(c) => &c.transaction_id,
        }
    }

    /// Device that claims to have sent the message, when the content says so
    pub fn from_device(&self) -> Option<&DeviceId> {
        match self {
            VerificationMessage::Request(c) => Some(&c.from_device),
            VerificationMessage::Ready(c) => Some(&c.from_device),
            VerificationMessage::Start(c) => Some(&c.from_device),
            _ => None,
        }
    }

    /// JSON content for the transport
    pub fn to_content(&self) -> Result<Value, ParseError> {
        let value = match self {
            VerificationMessage::Request(c) => serde_json::to_value(c)?,
            VerificationMessage::Ready(c) => serde_json::to_value(c)?,
            VerificationMessage::Start(c) => serde_json::to_value(c)?,
            VerificationMessage::Accept(c) => serde_json::to_value(c)?,
            VerificationMessage::Key(c) => serde_json::to_value(c)?,
            VerificationMessage::Mac(c) => serde_json::to_value(c)?,
            VerificationMessage::Done(c) => serde_json::to_value(c)?,
            VerificationMessage::Cancel(c) => serde_json::to_value(c)?,
        };
        Ok(value)
    }

    pub fn cancel<R: Into<String>>(
        transaction_id: TransactionId,
        code: CancelCode,
        reason: R,
    ) -> Self {
        VerificationMessage::Cancel(CancelContent {
            transaction_id,
            code: Some(code),
            reason: Some(reason.into()),
        })
    }
}

fn decode<T: DeserializeOwned>(content: &Value) -> Result<T, ParseError> {
    Ok(T::deserialize(content)?)
}

fn non_empty(field: &'static str, value: &str) -> Result<(), ParseError> {
    if value.is_empty() {
        Err(ParseError::missing(field))
    } else {
        Ok(())
    }
}

/// Best-effort transaction id and sender device of a payload that failed to parse
pub fn salvage_routing(content: &Value) -> (Option<TransactionId>, Option<DeviceId>) {
    let field = |name: &str| {
        content
            .get(name)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    (
        field("transaction_id").map(TransactionId::from),
        field("from_device").map(DeviceId::from),
    )
}
