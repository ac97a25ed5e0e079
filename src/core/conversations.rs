//! Per-conversation headset state with delayed cleanup

use super::scheduler::{schedule_after, ScheduledTask};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Headset state of one conversation as last requested or reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub off_hook: bool,
    pub muted: bool,
    pub held: bool,
    pub ringing: bool,
}

impl ConversationState {
    pub fn ringing() -> Self {
        Self {
            ringing: true,
            ..Self::default()
        }
    }

    pub fn off_hook() -> Self {
        Self {
            off_hook: true,
            ..Self::default()
        }
    }

    /// Neither ringing nor off-hook
    pub fn is_idle(&self) -> bool {
        !self.ringing && !self.off_hook
    }
}

struct Entry {
    state: ConversationState,
    removal: Option<ScheduledTask>,
    /// Bumped on every scheduled removal so a stale timer cannot remove a fresh entry
    generation: u64,
}

impl Entry {
    fn cancel_removal(&mut self) {
        if let Some(task) = self.removal.take() {
            task.cancel();
        }
    }
}

#[derive(Default)]
struct TableInner {
    entries: HashMap<String, Entry>,
    next_generation: u64,
}

/// Conversation id → state, at most one entry per id.
///
/// Every mutation cancels the entry's pending removal. Removal is only scheduled
/// explicitly, after a conversation reaches a terminal state.
#[derive(Clone)]
pub struct ConversationTable {
    inner: Arc<Mutex<TableInner>>,
    cleanup_delay: Duration,
}

impl ConversationTable {
    pub fn new(cleanup_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TableInner::default())),
            cleanup_delay,
        }
    }

    pub fn cleanup_delay(&self) -> Duration {
        self.cleanup_delay
    }

    pub fn get(&self, conversation_id: &str) -> Option<ConversationState> {
        self.inner
            .lock()
            .entries
            .get(conversation_id)
            .map(|entry| entry.state)
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.inner.lock().entries.contains_key(conversation_id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Create the entry if missing, then apply `update`
    pub fn upsert(
        &self,
        conversation_id: &str,
        update: impl FnOnce(&mut ConversationState),
    ) -> ConversationState {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .entry(conversation_id.to_string())
            .or_insert_with(|| Entry {
                state: ConversationState::default(),
                removal: None,
                generation: 0,
            });
        entry.cancel_removal();
        update(&mut entry.state);
        entry.state
    }

    /// Apply `update` to an existing entry only
    pub fn update(
        &self,
        conversation_id: &str,
        update: impl FnOnce(&mut ConversationState),
    ) -> Option<ConversationState> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(conversation_id)?;
        entry.cancel_removal();
        update(&mut entry.state);
        Some(entry.state)
    }

    /// Apply `update` to every entry; returns the affected ids
    pub fn update_all(&self, mut update: impl FnMut(&mut ConversationState)) -> Vec<String> {
        let mut inner = self.inner.lock();
        let mut ids = Vec::with_capacity(inner.entries.len());
        for (id, entry) in inner.entries.iter_mut() {
            entry.cancel_removal();
            update(&mut entry.state);
            ids.push(id.clone());
        }
        ids
    }

    /// States of every entry matching `filter`
    pub fn states_where(
        &self,
        filter: impl Fn(&ConversationState) -> bool,
    ) -> Vec<(String, ConversationState)> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| filter(&entry.state))
            .map(|(id, entry)| (id.clone(), entry.state))
            .collect()
    }

    pub fn has_pending_removal(&self, conversation_id: &str) -> bool {
        self.inner
            .lock()
            .entries
            .get(conversation_id)
            .and_then(|entry| entry.removal.as_ref())
            .is_some_and(|task| !task.is_finished())
    }

    /// Drop the entry after the cleanup delay, replacing any pending removal.
    /// No-op when there is no entry for the id.
    pub fn schedule_removal(&self, conversation_id: &str) {
        let mut inner = self.inner.lock();
        inner.next_generation += 1;
        let generation = inner.next_generation;

        let Some(entry) = inner.entries.get_mut(conversation_id) else {
            return;
        };
        entry.cancel_removal();
        entry.generation = generation;

        let table = Arc::downgrade(&self.inner);
        let id = conversation_id.to_string();
        entry.removal = Some(schedule_after(self.cleanup_delay, async move {
            remove_if_current(&table, &id, generation);
        }));
    }

    /// Remove immediately
    pub fn remove(&self, conversation_id: &str) -> Option<ConversationState> {
        let mut entry = self.inner.lock().entries.remove(conversation_id)?;
        entry.cancel_removal();
        Some(entry.state)
    }
}

fn remove_if_current(table: &Weak<Mutex<TableInner>>, conversation_id: &str, generation: u64) {
    let Some(inner) = table.upgrade() else {
        return;
    };
    let mut inner = inner.lock();
    let current = inner
        .entries
        .get(conversation_id)
        .is_some_and(|entry| entry.generation == generation && entry.removal.is_some());
    if current {
        inner.entries.remove(conversation_id);
        debug!("Conversation {} state removed", conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(3000);

    #[tokio::test]
    async fn test_upsert_creates_single_entry() {
        let table = ConversationTable::new(DELAY);
        table.upsert("c1", |s| s.ringing = true);
        table.upsert("c1", |s| s.off_hook = true);
        assert_eq!(table.len(), 1);
        let state = table.get("c1").unwrap();
        assert!(state.ringing && state.off_hook);
    }

    #[tokio::test]
    async fn test_update_ignores_missing() {
        let table = ConversationTable::new(DELAY);
        assert!(table.update("missing", |s| s.muted = true).is_none());
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_after_delay() {
        let table = ConversationTable::new(DELAY);
        table.upsert("c1", |s| *s = ConversationState::off_hook());
        table.schedule_removal("c1");
        assert!(table.contains("c1"));
        assert!(table.has_pending_removal("c1"));

        tokio::time::sleep(DELAY + Duration::from_millis(10)).await;
        assert!(!table.contains("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_cancels_removal() {
        let table = ConversationTable::new(DELAY);
        table.upsert("c1", |s| s.off_hook = false);
        table.schedule_removal("c1");

        tokio::time::sleep(Duration::from_millis(1000)).await;
        table.update("c1", |s| s.off_hook = true);
        assert!(!table.has_pending_removal("c1"));

        tokio::time::sleep(DELAY * 2).await;
        assert!(table.contains("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_restarts_delay() {
        let table = ConversationTable::new(DELAY);
        table.upsert("c1", |s| s.ringing = false);
        table.schedule_removal("c1");

        tokio::time::sleep(Duration::from_millis(2000)).await;
        table.schedule_removal("c1");

        // Original deadline passes, entry survives
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(table.contains("c1"));

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(!table.contains("c1"));
    }

    #[tokio::test]
    async fn test_schedule_removal_without_entry() {
        let table = ConversationTable::new(DELAY);
        table.schedule_removal("ghost");
        assert!(!table.contains("ghost"));
    }
}
