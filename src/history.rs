use std::collections::VecDeque;
use std::sync::Mutex;

use uuid::Uuid;

/// Default ring size; tunable via [`HistoryStore::set_limit`].
pub const DEFAULT_LIMIT: usize = 50;
const MIN_LIMIT: usize = 10;
const MAX_LIMIT: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub content: String,
    pub source_name: String,
    pub timestamp_ms: u64,
}

impl HistoryEntry {
    pub fn new(content: String, source_name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            content,
            source_name,
            timestamp_ms: crate::now_ms(),
        }
    }
}

/// In-process ring buffer of recent clipboard entries, newest at the back.
///
/// Deliberately not persisted: a restart yields an empty history.
pub struct HistoryStore {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                limit: limit.clamp(MIN_LIMIT, MAX_LIMIT),
            }),
        }
    }

    pub fn record(&self, entry: HistoryEntry) {
        let mut inner = self.lock();
        inner.entries.push_back(entry);
        let limit = inner.limit;
        while inner.entries.len() > limit {
            inner.entries.pop_front();
        }
    }

    /// Newest first.
    pub fn list(&self, limit: usize) -> Vec<HistoryEntry> {
        self.lock()
            .entries
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Newest first, restricted to one source peer.
    pub fn list_for_peer(&self, source_name: &str, limit: usize) -> Vec<HistoryEntry> {
        self.lock()
            .entries
            .iter()
            .rev()
            .filter(|e| e.source_name == source_name)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Case-insensitive substring search scoped to one source peer,
    /// newest first.
    pub fn search(&self, source_name: &str, substring: &str, limit: usize) -> Vec<HistoryEntry> {
        let needle = substring.to_lowercase();
        self.lock()
            .entries
            .iter()
            .rev()
            .filter(|e| e.source_name == source_name)
            .filter(|e| e.content.to_lowercase().contains(&needle))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn find(&self, id: Uuid) -> Option<HistoryEntry> {
        self.lock().entries.iter().find(|e| e.id == id).cloned()
    }

    /// Adjusts the ring size (clamped to 10–200); shrinking drops the
    /// oldest entries immediately.
    pub fn set_limit(&self, limit: usize) {
        let mut inner = self.lock();
        inner.limit = limit.clamp(MIN_LIMIT, MAX_LIMIT);
        let limit = inner.limit;
        while inner.entries.len() > limit {
            inner.entries.pop_front();
        }
    }

    pub fn limit(&self) -> usize {
        self.lock().limit
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(content: &str, source: &str) -> HistoryEntry {
        HistoryEntry::new(content.to_string(), source.to_string())
    }

    #[test]
    fn list_is_newest_first() {
        let store = HistoryStore::new();
        store.record(entry("first", "laptop"));
        store.record(entry("second", "laptop"));
        store.record(entry("third", "phone"));

        let listed = store.list(10);
        let contents: Vec<&str> = listed.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, ["third", "second", "first"]);
        assert_eq!(store.list(2).len(), 2);
    }

    #[test]
    fn exceeding_the_limit_drops_oldest() {
        let store = HistoryStore::with_limit(10);
        for i in 0..15 {
            store.record(entry(&format!("clip {i}"), "laptop"));
        }
        assert_eq!(store.len(), 10);
        let listed = store.list(100);
        assert_eq!(listed.first().unwrap().content, "clip 14");
        assert_eq!(listed.last().unwrap().content, "clip 5");
    }

    #[test]
    fn list_for_peer_filters_by_source() {
        let store = HistoryStore::new();
        store.record(entry("hello", "laptop"));
        store.record(entry("token", "phone"));
        store.record(entry("HELLO again", "phone"));

        let phone = store.list_for_peer("phone", 10);
        assert_eq!(phone.len(), 2);
        assert!(phone.iter().all(|e| e.source_name == "phone"));
    }

    #[test]
    fn search_is_case_insensitive_and_peer_scoped() {
        let store = HistoryStore::new();
        store.record(entry("hello", "laptop"));
        store.record(entry("token", "phone"));
        store.record(entry("HELLO again", "phone"));

        let hits = store.search("phone", "hello", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "HELLO again");
    }

    #[test]
    fn find_by_id() {
        let store = HistoryStore::new();
        let wanted = entry("needle", "laptop");
        let id = wanted.id;
        store.record(entry("hay", "laptop"));
        store.record(wanted);

        assert_eq!(store.find(id).unwrap().content, "needle");
        assert!(store.find(Uuid::new_v4()).is_none());
    }

    #[test]
    fn set_limit_clamps_and_shrinks() {
        let store = HistoryStore::new();
        for i in 0..30 {
            store.record(entry(&format!("clip {i}"), "laptop"));
        }

        store.set_limit(3);
        assert_eq!(store.limit(), MIN_LIMIT);
        assert_eq!(store.len(), MIN_LIMIT);
        assert_eq!(store.list(1)[0].content, "clip 29");

        store.set_limit(100_000);
        assert_eq!(store.limit(), MAX_LIMIT);
    }
}
