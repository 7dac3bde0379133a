//! Palaver Core
//!
//! Turn state machine for a per-sender chat bot: language policy, turn
//! classification, reply generation, response composition and the
//! dispatcher that runs one turn per sender at a time

pub mod classifier;
pub mod composer;
pub mod dispatcher;
pub mod gateway;
pub mod language;
pub mod similarity;

pub use classifier::{classify, QuickReplyAction, TurnIntent};
pub use composer::ResponseComposer;
pub use dispatcher::{DropReason, SessionDispatcher, TurnOutcome};
pub use gateway::{GenerationFailure, GenerationGateway, Modality, ProviderGateway};
pub use language::{detect_script, resolve_locale};
pub use similarity::overlap;

use palaver_events::{InboundEvent, EVENT_BUS_CAPACITY};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Processes bus events until every publisher is gone, one task per event,
/// then waits for the turns still running. A sender whose previous turn is
/// still running has the new event dropped as busy.
pub async fn run(dispatcher: Arc<SessionDispatcher>, mut inbound: mpsc::Receiver<InboundEvent>) {
    info!("Palaver runtime started");
    let mut turns = JoinSet::new();

    loop {
        tokio::select! {
            Some(joined) = turns.join_next(), if !turns.is_empty() => {
                log_join(joined);
            }
            received = inbound.recv() => {
                let Some(event) = received else {
                    info!("Event bus closed, stopping dispatcher loop");
                    break;
                };
                let dispatcher = Arc::clone(&dispatcher);
                turns.spawn(async move {
                    dispatcher.handle(event).await;
                });
            }
        }
    }

    while let Some(joined) = turns.join_next().await {
        log_join(joined);
    }
}

/// Like [`run`], but each sender's events wait for that sender's previous
/// turn, in arrival order. Distinct senders still run concurrently.
pub async fn run_ordered(
    dispatcher: Arc<SessionDispatcher>,
    mut inbound: mpsc::Receiver<InboundEvent>,
) {
    info!("Palaver runtime started (ordered per sender)");
    let mut lanes: HashMap<String, mpsc::Sender<InboundEvent>> = HashMap::new();
    let mut turns = JoinSet::new();

    while let Some(event) = inbound.recv().await {
        let lane = lanes.entry(event.sender_id.clone()).or_insert_with(|| {
            let (tx, mut rx) = mpsc::channel::<InboundEvent>(EVENT_BUS_CAPACITY);
            let dispatcher = Arc::clone(&dispatcher);
            turns.spawn(async move {
                while let Some(event) = rx.recv().await {
                    dispatcher.handle(event).await;
                }
            });
            tx
        });

        if let Err(e) = lane.send(event).await {
            error!(sender_id = %e.0.sender_id, "Sender lane closed, event lost");
        }
    }

    info!("Event bus closed, draining sender lanes");
    drop(lanes);
    while let Some(joined) = turns.join_next().await {
        log_join(joined);
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!("Turn task failed: {}", e);
    }
}
