//! Command handlers for the KeyTrust CLI

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use keytrust_core::crypto::{format_decimal_sas, format_emoji_sas};
use keytrust_harness::{LoopbackConfig, LoopbackNetwork};
use keytrust_runtime::{
    JsonFileStore, MemoryStateStore, Notice, VerificationConfig, VerificationManager,
    VerifiedStateStore,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::cli::Commands;

const DEMO_USER: &str = "@demo:example.org";

/// Execute a CLI command
pub async fn execute(command: Commands) -> Result<()> {
    match command {
        Commands::Simulate {
            latency_ms,
            timeout_secs,
        } => {
            simulate(
                Duration::from_millis(latency_ms),
                Duration::from_secs(timeout_secs),
            )
            .await
        }
        Commands::Sas { bytes } => sas(&bytes),
        Commands::Status { path } => status(path).await,
    }
}

// ----------------------------------------------------------------------------
// Simulate
// ----------------------------------------------------------------------------

/// Two devices on a loopback network; the first bootstraps against the second
async fn simulate(latency: Duration, limit: Duration) -> Result<()> {
    let network = LoopbackNetwork::with_config(
        DEMO_USER,
        LoopbackConfig {
            latency,
            ..LoopbackConfig::ideal()
        },
    );
    let initiator_transport = network.add_device("DEMOA", Some(1)).await;
    let responder_transport = network.add_device("DEMOB", Some(2)).await;

    let responder = VerificationManager::new(
        Arc::new(responder_transport),
        Arc::new(MemoryStateStore::new()),
        VerificationConfig {
            bootstrap_on_start: false,
            ..VerificationConfig::default()
        },
    )?;
    let initiator_store = Arc::new(MemoryStateStore::new());
    let initiator = VerificationManager::new(
        Arc::new(initiator_transport),
        initiator_store.clone(),
        VerificationConfig::default(),
    )?;

    let mut notices = initiator.subscribe_notices();
    responder.start().await?;
    initiator.start().await?;
    info!("Simulating verification between DEMOA and DEMOB");

    let outcome = tokio::time::timeout(limit, async {
        loop {
            match notices.recv().await {
                Ok(Notice::SasReady { emoji, decimal, .. }) => {
                    if let Some(emoji) = emoji {
                        println!("Emoji:   {emoji}");
                    }
                    if let Some(decimal) = decimal {
                        println!("Decimal: {decimal}");
                    }
                }
                Ok(Notice::Verified { peer, .. }) => return Ok(peer),
                Ok(Notice::Cancelled { code, reason, .. })
                | Ok(Notice::Rejected { code, reason, .. }) => {
                    bail!("verification cancelled ({code}): {reason}")
                }
                Ok(other) => debug!("{}", other),
                Err(RecvError::Lagged(skipped)) => debug!("Skipped {} notices", skipped),
                Err(RecvError::Closed) => bail!("notice channel closed"),
            }
        }
    })
    .await;

    initiator.dispose().await;
    responder.dispose().await;

    let peer = outcome.context("verification did not finish in time")??;
    println!("Verified with {peer}");
    let record = initiator_store.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

// ----------------------------------------------------------------------------
// SAS Rendering
// ----------------------------------------------------------------------------

fn sas(input: &str) -> Result<()> {
    let bytes = hex::decode(input.trim()).context("SAS bytes must be hex")?;
    match bytes.len() {
        6 => {
            let emoji = format_emoji_sas(&bytes)?;
            println!("Emoji:   {emoji}");
            println!("Indices: {:?}", emoji.indices());
            println!("Decimal: {}", format_decimal_sas(&bytes[..5])?);
        }
        5 => println!("Decimal: {}", format_decimal_sas(&bytes)?),
        n => bail!("expected 5 or 6 bytes, got {n}"),
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Status
// ----------------------------------------------------------------------------

async fn status(path: Option<PathBuf>) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => default_state_path()?,
    };
    let store = JsonFileStore::new(path);
    let record = store.load().await?;

    println!("State file: {}", store.path().display());
    if !record.verified {
        println!("Not verified");
        return Ok(());
    }
    println!("Verified");
    if let Some(at) = record.verified_at {
        println!("  at:   {}", at.to_rfc3339());
    }
    if let Some(peer) = record.verified_with {
        println!("  with: {} / {}", peer.user_id, peer.device_id);
    }
    Ok(())
}

fn default_state_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().context("no data directory for this platform")?;
    Ok(data_dir
        .join("keytrust")
        .join(VerificationConfig::default().state_file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sas_rejects_bad_input() {
        assert!(sas("zz").is_err());
        assert!(sas("0102").is_err());
        assert!(sas("0102030405").is_ok());
        assert!(sas("010203040506").is_ok());
    }

    #[tokio::test]
    async fn test_status_of_missing_file() {
        let path = std::env::temp_dir().join("keytrust-cli-missing-state.json");
        assert!(status(Some(path)).await.is_ok());
    }

    #[tokio::test]
    async fn test_simulation_verifies() {
        assert!(simulate(Duration::ZERO, Duration::from_secs(10)).await.is_ok());
    }
}
