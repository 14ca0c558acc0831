//! Per-conversation mutual exclusion for the read-evaluate-write sequence.
//!
//! One semaphore per conversation id lives in the map only while someone
//! holds or waits for it. The last guard to release removes the entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::RatingError;

type LockMap = Arc<Mutex<HashMap<String, Arc<Semaphore>>>>;

#[derive(Clone, Default)]
pub struct ConversationLockManager {
    locks: LockMap,
}

fn lock_map(map: &LockMap) -> MutexGuard<'_, HashMap<String, Arc<Semaphore>>> {
    // The map is never left half-updated, so a poisoned lock is still usable.
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConversationLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a conversation. Released when the guard
    /// drops.
    pub async fn acquire(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationLockGuard, RatingError> {
        // Cloned under the map mutex, so release sees this caller as a holder.
        let semaphore = lock_map(&self.locks)
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RatingError::LockUnavailable)?;

        Ok(ConversationLockGuard {
            permit: Some(permit),
            semaphore,
            conversation_id: conversation_id.to_string(),
            locks: self.locks.clone(),
        })
    }

    #[cfg(test)]
    pub(crate) fn active(&self) -> usize {
        lock_map(&self.locks).len()
    }
}

pub struct ConversationLockGuard {
    permit: Option<OwnedSemaphorePermit>,
    semaphore: Arc<Semaphore>,
    conversation_id: String,
    locks: LockMap,
}

impl Drop for ConversationLockGuard {
    fn drop(&mut self) {
        drop(self.permit.take());

        let mut map = lock_map(&self.locks);
        let unused = map
            .get(&self.conversation_id)
            .is_some_and(|entry| {
                // One reference in the map, one in this guard; any more is a waiter.
                Arc::ptr_eq(entry, &self.semaphore) && Arc::strong_count(entry) == 2
            });
        if unused {
            map.remove(&self.conversation_id);
        }
    }
}
