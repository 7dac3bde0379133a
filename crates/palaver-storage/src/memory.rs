use crate::{ConversationStore, SenderState, StateDelta, StoreFailure};
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Process-local store. Atomic per key because every operation runs under one lock.
#[derive(Default)]
pub struct MemoryStore {
    states: Mutex<HashMap<String, SenderState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ConversationStore for MemoryStore {
    async fn upsert_and_increment(&self, sender_id: &str) -> Result<SenderState, StoreFailure> {
        let now = Utc::now();
        let mut states = self.states.lock().await;
        let state = states
            .entry(sender_id.to_string())
            .or_insert_with(|| SenderState::unseen(sender_id, now));
        state.turn_count += 1;
        state.updated_at = now;
        Ok(state.clone())
    }

    async fn update(&self, sender_id: &str, delta: &StateDelta) -> Result<(), StoreFailure> {
        let mut states = self.states.lock().await;
        let state = states
            .get_mut(sender_id)
            .ok_or_else(|| StoreFailure::UnknownSender(sender_id.to_string()))?;
        delta.apply_to(state, Utc::now());
        Ok(())
    }

    async fn get(&self, sender_id: &str) -> Result<Option<SenderState>, StoreFailure> {
        Ok(self.states.lock().await.get(sender_id).cloned())
    }
}
