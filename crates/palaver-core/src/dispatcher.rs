//! Per-sender turn execution

use crate::classifier::{classify, TurnIntent};
use crate::composer::ResponseComposer;
use crate::gateway::{reexplain_prompt, GenerationGateway, Modality};
use crate::language::{detect_script, language_flip, resolve_locale};
use palaver_events::{InboundEvent, InboundPayload, Locale, OutboundChannel, OutboundMessage};
use palaver_policy::PolicyEngine;
use palaver_storage::{ConversationStore, SenderState, StateDelta};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Senders with a turn in flight.
#[derive(Default)]
pub struct TurnSlots {
    busy: Mutex<HashSet<String>>,
}

/// Held for the whole turn; the sender is released on drop.
pub struct TurnSlot<'a> {
    slots: &'a TurnSlots,
    sender_id: String,
}

impl TurnSlots {
    fn busy(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.busy.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn try_acquire(&self, sender_id: &str) -> Option<TurnSlot<'_>> {
        if !self.busy().insert(sender_id.to_string()) {
            return None;
        }
        Some(TurnSlot {
            slots: self,
            sender_id: sender_id.to_string(),
        })
    }

    pub fn is_busy(&self, sender_id: &str) -> bool {
        self.busy().contains(sender_id)
    }
}

impl Drop for TurnSlot<'_> {
    fn drop(&mut self) {
        self.slots.busy().remove(&self.sender_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Invalid,
    Denied,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Dropped(DropReason),
    /// The store failed; only a fallback was attempted.
    Degraded { delivered: usize, failed: usize },
    Completed {
        intent: TurnIntent,
        locale: Locale,
        delivered: usize,
        failed: usize,
    },
}

struct TurnPlan {
    intent: TurnIntent,
    locale: Locale,
    messages: Vec<OutboundMessage>,
    delta: StateDelta,
}

pub struct SessionDispatcher {
    store: Arc<dyn ConversationStore>,
    gateway: Arc<dyn GenerationGateway>,
    channel: Arc<dyn OutboundChannel>,
    composer: ResponseComposer,
    policy: PolicyEngine,
    slots: TurnSlots,
}

impl SessionDispatcher {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        gateway: Arc<dyn GenerationGateway>,
        channel: Arc<dyn OutboundChannel>,
        composer: ResponseComposer,
    ) -> Self {
        Self {
            store,
            gateway,
            channel,
            composer,
            policy: PolicyEngine::allow_all(),
            slots: TurnSlots::default(),
        }
    }

    pub fn with_policy(mut self, policy: PolicyEngine) -> Self {
        self.policy = policy;
        self
    }

    pub fn is_busy(&self, sender_id: &str) -> bool {
        self.slots.is_busy(sender_id)
    }

    /// Runs one turn. Never fails: every problem ends in a drop, a fallback
    /// reply or a log line.
    pub async fn handle(&self, event: InboundEvent) -> TurnOutcome {
        if let Err(e) = event.validate() {
            warn!(trace_id = %event.trace_id, kind = event.kind(), "Dropping invalid event: {}", e);
            return TurnOutcome::Dropped(DropReason::Invalid);
        }

        if !self.policy.is_allowed(&event.sender_id) {
            info!(
                trace_id = %event.trace_id,
                sender_id = %event.sender_id,
                "Sender blocked by policy"
            );
            return TurnOutcome::Dropped(DropReason::Denied);
        }

        let Some(_slot) = self.slots.try_acquire(&event.sender_id) else {
            debug!(
                trace_id = %event.trace_id,
                sender_id = %event.sender_id,
                "Turn already in flight, dropping event"
            );
            return TurnOutcome::Dropped(DropReason::Busy);
        };

        let state = match self.store.upsert_and_increment(&event.sender_id).await {
            Ok(state) => state,
            Err(e) => {
                error!(
                    trace_id = %event.trace_id,
                    sender_id = %event.sender_id,
                    "Conversation store failed, sending fallback: {}",
                    e
                );
                let locale = detect_script(event.body().unwrap_or_default());
                let (delivered, failed) = self.deliver(&event, &self.composer.fallback(locale)).await;
                return TurnOutcome::Degraded { delivered, failed };
            }
        };

        let plan = self.run_turn(&state, &event).await;
        info!(
            trace_id = %event.trace_id,
            sender_id = %event.sender_id,
            turn = state.turn_count,
            intent = %plan.intent,
            locale = %plan.locale,
            messages = plan.messages.len(),
            "Turn classified"
        );

        if !plan.delta.is_empty() {
            if let Err(e) = self.store.update(&event.sender_id, &plan.delta).await {
                error!(
                    trace_id = %event.trace_id,
                    sender_id = %event.sender_id,
                    "Failed to persist turn state: {}",
                    e
                );
            }
        }

        let (delivered, failed) = self.deliver(&event, &plan.messages).await;
        TurnOutcome::Completed {
            intent: plan.intent,
            locale: plan.locale,
            delivered,
            failed,
        }
    }

    async fn run_turn(&self, state: &SenderState, event: &InboundEvent) -> TurnPlan {
        let text = event.body().unwrap_or_default();
        let locale = resolve_locale(state, text);
        let mut delta = StateDelta {
            preferred_language: language_flip(state, text),
            ..Default::default()
        };
        let intent = classify(state, event);

        let messages = match intent {
            TurnIntent::FirstContact => self.composer.welcome(locale),
            TurnIntent::QuickReplyAck(action) => self.composer.acknowledgement(locale, action),
            TurnIntent::QuickReplyElaborate => self
                .composer
                .elaborate(locale, state.last_generated_reply.as_deref()),
            TurnIntent::RepeatedQuestion => {
                let previous = state.last_inbound_text.as_deref().unwrap_or(text);
                let prompt =
                    reexplain_prompt(locale, previous, state.last_generated_reply.as_deref());
                self.generate_reply(event, &prompt, locale, Modality::Text, &mut delta)
                    .await
            }
            TurnIntent::GenerateTextReply => {
                self.generate_reply(event, text, locale, Modality::Text, &mut delta)
                    .await
            }
            TurnIntent::GenerateImageReply => {
                let modality = match &event.payload {
                    InboundPayload::Image { image_url } => Modality::Image {
                        url: image_url.clone(),
                    },
                    _ => Modality::Text,
                };
                self.generate_reply(event, "", locale, modality, &mut delta)
                    .await
            }
        };

        TurnPlan {
            intent,
            locale,
            messages,
            delta,
        }
    }

    /// Only an accepted reply touches the stored question and reply.
    async fn generate_reply(
        &self,
        event: &InboundEvent,
        prompt: &str,
        locale: Locale,
        modality: Modality,
        delta: &mut StateDelta,
    ) -> Vec<OutboundMessage> {
        self.channel.set_typing(&event.sender_id).await;

        match self.gateway.generate(prompt, locale, &modality).await {
            Ok(reply) => {
                if let Some(text) = event.body() {
                    delta.last_inbound_text = Some(text.to_string());
                }
                let messages = self.composer.generated(locale, &reply);
                delta.last_generated_reply = Some(reply);
                messages
            }
            Err(failure) => {
                warn!(
                    trace_id = %event.trace_id,
                    sender_id = %event.sender_id,
                    modality = modality.name(),
                    "Generation failed, sending fallback: {}",
                    failure
                );
                self.composer.fallback(locale)
            }
        }
    }

    /// Sequential, in order. A failed send does not stop the rest.
    async fn deliver(&self, event: &InboundEvent, messages: &[OutboundMessage]) -> (usize, usize) {
        let mut delivered = 0;
        let mut failed = 0;

        for (index, message) in messages.iter().enumerate() {
            match self.channel.send(&event.sender_id, message).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    failed += 1;
                    warn!(
                        trace_id = %event.trace_id,
                        sender_id = %event.sender_id,
                        channel = self.channel.channel_name(),
                        index = index,
                        "Outbound send failed: {}",
                        e
                    );
                }
            }
        }

        (delivered, failed)
    }
}
