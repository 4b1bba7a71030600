//! Per-conversation execution lanes.
//!
//! At most one run is in flight per conversation. Runs for different
//! conversations proceed independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use vigil_core::config::LanePolicy;
use vigil_core::error::ExecutionError;
use vigil_core::types::ConversationId;

type Lanes = Arc<Mutex<HashMap<ConversationId, Arc<AsyncMutex<()>>>>>;

/// Lane coordinator keyed by conversation. A lane exists only while a run
/// holds it or a request waits on it.
pub struct LaneManager {
    policy: LanePolicy,
    lanes: Lanes,
}

impl LaneManager {
    pub fn new(policy: LanePolicy) -> Self {
        Self {
            policy,
            lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn policy(&self) -> LanePolicy {
        self.policy
    }

    fn lane(&self, conversation: &ConversationId) -> Arc<AsyncMutex<()>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes
            .entry(conversation.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Acquire the lane for a conversation.
    ///
    /// Under [`LanePolicy::Queue`] this waits behind earlier requests in
    /// arrival order. Under [`LanePolicy::Reject`] a busy lane fails at once.
    pub async fn acquire(&self, conversation: &ConversationId) -> Result<LaneGuard, ExecutionError> {
        let lane = self.lane(conversation);
        let guard = match self.policy {
            LanePolicy::Queue => lane.lock_owned().await,
            LanePolicy::Reject => lane.try_lock_owned().map_err(|_| {
                debug!(conversation = %conversation, "Lane busy, rejecting");
                ExecutionError::Busy {
                    conversation: conversation.to_string(),
                }
            })?,
        };
        Ok(LaneGuard {
            guard,
            lanes: Arc::clone(&self.lanes),
            conversation: conversation.clone(),
        })
    }

    /// Number of lanes currently tracked.
    pub fn len(&self) -> usize {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a run currently holds the conversation's lane.
    pub fn is_busy(&self, conversation: &ConversationId) -> bool {
        let lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes
            .get(conversation)
            .is_some_and(|lane| lane.try_lock().is_err())
    }
}

impl Default for LaneManager {
    fn default() -> Self {
        Self::new(LanePolicy::Queue)
    }
}

/// Held for the duration of one run. Dropping it releases the lane.
pub struct LaneGuard {
    guard: OwnedMutexGuard<()>,
    lanes: Lanes,
    conversation: ConversationId,
}

impl LaneGuard {
    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        // Clones are only taken under the map lock, so two references (the
        // map's and this guard's) means no request is waiting on the lane.
        if Arc::strong_count(OwnedMutexGuard::mutex(&self.guard)) == 2 {
            lanes.remove(&self.conversation);
        }
    }
}
