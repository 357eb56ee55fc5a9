//! Outbound queue of local changes awaiting acknowledgement.
//!
//! Every mutation updates memory first and then writes the full snapshot to
//! the store. If the write fails the in-memory queue stays authoritative and
//! the error is returned so the caller can surface it.

use serde_json::Value;

use crate::event::{ChangeEvent, LogicalKey};
use crate::store::{KeyValueStore, StorageError};

/// Storage key suffix for the pending list.
pub const PENDING_CHANGES_KEY: &str = "pending_changes";

/// Ordered, persisted list of unacknowledged local changes.
#[derive(Debug)]
pub struct OutboundQueue<S: KeyValueStore> {
    store: S,
    key: String,
    entries: Vec<ChangeEvent>,
}

impl<S: KeyValueStore> OutboundQueue<S> {
    /// Creates an empty queue persisted under `key`.
    pub fn new(store: S, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            entries: Vec::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Loads entries saved by a previous session, replacing memory.
    ///
    /// Returns the number of entries recovered. A missing key is an empty
    /// queue.
    pub fn hydrate(&mut self) -> Result<usize, StorageError> {
        let Some(raw) = self.store.get(&self.key)? else {
            self.entries.clear();
            return Ok(0);
        };
        let entries: Vec<ChangeEvent> =
            serde_json::from_str(&raw).map_err(|source| StorageError::Decode {
                key: self.key.clone(),
                source,
            })?;
        self.entries = entries;
        Ok(self.entries.len())
    }

    /// Appends an event.
    pub fn enqueue(&mut self, event: ChangeEvent) -> Result<(), StorageError> {
        self.entries.push(event);
        self.persist()
    }

    /// Removes the entry with the given id. Returns whether one was removed.
    pub fn remove(&mut self, event_id: &str) -> Result<bool, StorageError> {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != event_id);
        if self.entries.len() == before {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    /// Removes every entry whose id is listed. Returns how many were removed.
    pub fn remove_all(&mut self, event_ids: &[String]) -> Result<usize, StorageError> {
        let before = self.entries.len();
        self.entries.retain(|e| !event_ids.contains(&e.id));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Removes every entry for the given record. Returns the removed entries.
    pub fn remove_matching(&mut self, key: &LogicalKey) -> Result<Vec<ChangeEvent>, StorageError> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.matches_key(key));
        self.entries = kept;
        if !removed.is_empty() {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Replaces the payload of an entry in place, keeping its position.
    pub fn replace_payload(
        &mut self,
        event_id: &str,
        payload: Value,
        merged_at: Option<i64>,
    ) -> Result<bool, StorageError> {
        let Some(entry) = self.entries.iter_mut().find(|e| e.id == event_id) else {
            return Ok(false);
        };
        entry.payload = payload;
        entry.merged_at = merged_at;
        self.persist()?;
        Ok(true)
    }

    /// Replaces the whole queue.
    pub fn replace_all(&mut self, events: Vec<ChangeEvent>) -> Result<(), StorageError> {
        self.entries = events;
        self.persist()
    }

    /// Empties the queue.
    pub fn clear(&mut self) -> Result<(), StorageError> {
        self.entries.clear();
        self.persist()
    }

    /// The most recently queued entry for a record.
    pub fn latest_for(&self, key: &LogicalKey) -> Option<&ChangeEvent> {
        self.entries.iter().rev().find(|e| e.matches_key(key))
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.entries.iter().any(|e| e.id == event_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.entries.iter()
    }

    /// Copy of the entries in insertion order.
    pub fn snapshot(&self) -> Vec<ChangeEvent> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self) -> Result<(), StorageError> {
        let json = serde_json::to_string(&self.entries).map_err(|source| StorageError::Encode {
            key: self.key.clone(),
            source,
        })?;
        self.store.set(&self.key, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChangeKind;
    use crate::store::{FileStore, MemoryStore};
    use serde_json::json;
    use tempfile::TempDir;

    fn event(kind: ChangeKind, id: &str) -> ChangeEvent {
        ChangeEvent::new(kind, "offering", json!({"id": id}), 0)
    }

    fn key(id: &str) -> LogicalKey {
        LogicalKey {
            entity: "offering".to_string(),
            record_id: id.to_string(),
        }
    }

    #[test]
    fn test_persistence_roundtrip_across_restart() {
        let store = MemoryStore::new();
        let e1 = event(ChangeKind::Update, "a");
        let e2 = event(ChangeKind::Create, "b");

        let mut queue = OutboundQueue::new(store.clone(), "vedic_pending_changes");
        queue.enqueue(e1.clone()).unwrap();
        queue.enqueue(e2.clone()).unwrap();

        let mut restarted = OutboundQueue::new(store, "vedic_pending_changes");
        assert_eq!(restarted.hydrate().unwrap(), 2);
        assert_eq!(restarted.snapshot(), vec![e1, e2]);
    }

    #[test]
    fn test_file_backed_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path().to_path_buf());
        let e1 = event(ChangeKind::Delete, "a");

        let mut queue = OutboundQueue::new(store.clone(), "vedic_pending_changes");
        queue.enqueue(e1.clone()).unwrap();

        let mut restarted = OutboundQueue::new(store, "vedic_pending_changes");
        restarted.hydrate().unwrap();
        assert_eq!(restarted.snapshot(), vec![e1]);
    }

    #[test]
    fn test_hydrate_missing_key_is_empty() {
        let mut queue = OutboundQueue::new(MemoryStore::new(), "q");
        assert_eq!(queue.hydrate().unwrap(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_hydrate_corrupt_value_fails() {
        let store = MemoryStore::new();
        store.set("q", "not json").unwrap();
        let mut queue = OutboundQueue::new(store, "q");
        assert!(matches!(queue.hydrate(), Err(StorageError::Decode { .. })));
    }

    #[test]
    fn test_remove_and_clear_persist() {
        let store = MemoryStore::new();
        let mut queue = OutboundQueue::new(store.clone(), "q");
        let e1 = event(ChangeKind::Update, "a");
        let e2 = event(ChangeKind::Update, "b");
        queue.enqueue(e1.clone()).unwrap();
        queue.enqueue(e2.clone()).unwrap();

        assert!(queue.remove(&e1.id).unwrap());
        assert!(!queue.remove(&e1.id).unwrap());
        assert_eq!(store.get("q").unwrap().unwrap(), serde_json::to_string(&vec![e2]).unwrap());

        queue.clear().unwrap();
        assert_eq!(store.get("q").unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn test_memory_stays_authoritative_when_persist_fails() {
        let store = MemoryStore::with_quota(16);
        let mut queue = OutboundQueue::new(store.clone(), "q");
        let result = queue.enqueue(event(ChangeKind::Create, "a"));
        assert!(matches!(result, Err(StorageError::QuotaExceeded { .. })));
        assert_eq!(queue.len(), 1);
        assert!(store.get("q").unwrap().is_none());
    }

    #[test]
    fn test_latest_for_and_remove_matching() {
        let mut queue = OutboundQueue::new(MemoryStore::new(), "q");
        let first = event(ChangeKind::Create, "x");
        let other = event(ChangeKind::Update, "y");
        let second = event(ChangeKind::Update, "x");
        queue.enqueue(first.clone()).unwrap();
        queue.enqueue(other.clone()).unwrap();
        queue.enqueue(second.clone()).unwrap();

        assert_eq!(queue.latest_for(&key("x")), Some(&second));
        let removed = queue.remove_matching(&key("x")).unwrap();
        assert_eq!(removed, vec![first, second]);
        assert_eq!(queue.snapshot(), vec![other]);
    }

    #[test]
    fn test_replace_payload_keeps_position() {
        let mut queue = OutboundQueue::new(MemoryStore::new(), "q");
        let a = event(ChangeKind::Update, "a");
        let b = event(ChangeKind::Update, "b");
        queue.enqueue(a.clone()).unwrap();
        queue.enqueue(b.clone()).unwrap();

        assert!(queue
            .replace_payload(&a.id, json!({"id": "a", "price": 3}), Some(9))
            .unwrap());
        let entries = queue.snapshot();
        assert_eq!(entries[0].id, a.id);
        assert_eq!(entries[0].payload, json!({"id": "a", "price": 3}));
        assert_eq!(entries[0].merged_at, Some(9));
        assert_eq!(entries[1], b);
        assert!(!queue.replace_payload("missing", json!({}), None).unwrap());
    }

    #[test]
    fn test_replace_all_and_remove_all() {
        let store = MemoryStore::new();
        let mut queue = OutboundQueue::new(store.clone(), "q");
        let events = vec![
            event(ChangeKind::Create, "a"),
            event(ChangeKind::Create, "b"),
            event(ChangeKind::Create, "c"),
        ];
        queue.replace_all(events.clone()).unwrap();
        assert_eq!(queue.len(), 3);

        let acked = vec![events[0].id.clone(), events[2].id.clone(), "other".to_string()];
        assert_eq!(queue.remove_all(&acked).unwrap(), 2);
        assert_eq!(queue.snapshot(), vec![events[1].clone()]);

        let mut restarted = OutboundQueue::new(store, "q");
        restarted.hydrate().unwrap();
        assert_eq!(restarted.len(), 1);
    }
}
