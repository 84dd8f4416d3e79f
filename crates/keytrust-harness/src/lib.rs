//! KeyTrust Harness
//!
//! An in-memory loopback network connecting several devices of one account,
//! used by the runtime tests and the CLI simulation.

pub mod loopback;

pub use loopback::{DeviceTransport, LoopbackConfig, LoopbackNetwork, LoopbackStats, SentMessage};
