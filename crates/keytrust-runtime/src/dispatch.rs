//! Inbound dispatch and per-transaction workers
//!
//! One dispatcher task drains the transport subscription, filters and parses
//! events, and routes each to the worker owning its transaction id. Workers
//! process their queue strictly in order, so messages for one transaction
//! never interleave while different transactions proceed independently.

use std::sync::{Arc, Weak};

use keytrust_core::{
    errors::ParseError,
    protocol::{salvage_routing, EVENT_PREFIX},
    DeviceId, DeviceIdentity, InboundEvent, MessageType, TransactionId, UserId,
    VerificationMessage,
};
use tokio::sync::mpsc::{self, error::SendError};
use tracing::{debug, trace};

use crate::manager::Shared;

/// Unit of work for a transaction worker
#[derive(Debug)]
pub(crate) enum Job {
    Message {
        sender: UserId,
        message: VerificationMessage,
    },
    Malformed {
        sender: UserId,
        message_type: MessageType,
        transaction_id: TransactionId,
        from_device: Option<DeviceId>,
        error: ParseError,
    },
    Timeout {
        transaction_id: TransactionId,
        generation: u64,
    },
}

/// Turn a raw event into a job, or drop it
pub(crate) fn classify(event: InboundEvent, local: &DeviceIdentity) -> Option<(TransactionId, Job)> {
    if !event.event_type.starts_with(EVENT_PREFIX) {
        return None;
    }
    if event.sender != local.user_id {
        trace!("Ignoring {} from {}", event.event_type, event.sender);
        return None;
    }
    let message_type = MessageType::from_event_type(&event.event_type)?;

    match VerificationMessage::parse(&event.event_type, &event.content) {
        Ok(message) => Some((
            message.transaction_id().clone(),
            Job::Message {
                sender: event.sender,
                message,
            },
        )),
        Err(error) => {
            let (transaction_id, from_device) = salvage_routing(&event.content);
            let Some(transaction_id) = transaction_id else {
                debug!("Dropping {} without transaction id: {}", event.event_type, error);
                return None;
            };
            Some((
                transaction_id.clone(),
                Job::Malformed {
                    sender: event.sender,
                    message_type,
                    transaction_id,
                    from_device,
                    error,
                },
            ))
        }
    }
}

/// Drain the subscription until it closes or the manager is disposed
pub(crate) async fn run_dispatcher(
    shared: Arc<Shared>,
    local: DeviceIdentity,
    mut inbound: mpsc::UnboundedReceiver<InboundEvent>,
) {
    while let Some(event) = inbound.recv().await {
        if shared.is_disposed() {
            break;
        }
        if let Some((transaction_id, job)) = classify(event, &local) {
            enqueue(&shared, transaction_id, job);
        }
    }
    debug!("Verification dispatcher stopped");
}

/// Queue a job behind any earlier work for the same transaction
pub(crate) fn enqueue(shared: &Arc<Shared>, transaction_id: TransactionId, job: Job) {
    if shared.is_disposed() {
        return;
    }
    let mut worker = shared
        .workers
        .entry(transaction_id.clone())
        .or_insert_with(|| spawn_worker(shared, transaction_id.clone()));
    if let Err(SendError(job)) = worker.send(job) {
        *worker = spawn_worker(shared, transaction_id);
        let _ = worker.send(job);
    }
}

fn spawn_worker(shared: &Arc<Shared>, transaction_id: TransactionId) -> mpsc::UnboundedSender<Job> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_worker(Arc::downgrade(shared), transaction_id, rx));
    tx
}

/// Holds the manager state weakly; an idle worker ends once the manager is gone
async fn run_worker(
    shared: Weak<Shared>,
    transaction_id: TransactionId,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) {
    while let Some(job) = jobs.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.is_disposed() {
            return;
        }
        shared.process(job).await;

        if !shared.has_session(&transaction_id).await {
            let retired = shared
                .workers
                .remove_if(&transaction_id, |_, _| jobs.is_empty())
                .is_some();
            if retired {
                trace!("Worker for {} retired", transaction_id);
                return;
            }
        }
    }
}
