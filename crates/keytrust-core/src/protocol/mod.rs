//! Wire protocol for `m.key.verification.*` messages

pub mod messages;

pub use messages::{
    AcceptContent, CancelContent, DoneContent, KeyContent, MacContent, MessageType, ReadyContent,
    RequestContent, StartContent, VerificationMessage, EVENT_PREFIX, KEY_IDS_MAC_ID,
    salvage_routing,
};
