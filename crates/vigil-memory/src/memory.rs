use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use vigil_core::error::StoreError;
use vigil_core::state::ConversationState;
use vigil_core::traits::StateStore;
use vigil_core::types::ConversationId;

/// Process-local state store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    states: Mutex<HashMap<ConversationId, ConversationState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conversation identities with persisted state.
    pub fn list(&self) -> Vec<ConversationId> {
        match self.states.lock() {
            Ok(states) => {
                let mut ids: Vec<_> = states.keys().cloned().collect();
                ids.sort();
                ids
            }
            Err(_) => vec![],
        }
    }
}

impl StateStore for MemoryStore {
    fn load(&self, id: &ConversationId) -> BoxFuture<'_, Result<ConversationState, StoreError>> {
        let id = id.clone();
        Box::pin(async move {
            let states = self
                .states
                .lock()
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(states
                .get(&id)
                .cloned()
                .unwrap_or_else(|| ConversationState::new(id)))
        })
    }

    fn save(
        &self,
        id: &ConversationId,
        state: &ConversationState,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let id = id.clone();
        let state = state.clone();
        Box::pin(async move {
            self.states
                .lock()
                .map_err(|e| StoreError::Backend(e.to_string()))?
                .insert(id, state);
            Ok(())
        })
    }
}
