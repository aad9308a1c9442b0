use std::collections::VecDeque;
use std::sync::Mutex;

/// Default number of remembered remote writes.
pub const DEFAULT_CAPACITY: usize = 20;

/// Bounded FIFO of recently remotely-written clipboard texts.
///
/// The poll loop consults this before broadcasting a local change so a
/// remote write does not reflect back to its origin. The bound matters:
/// once a text falls out of the window, setting it again locally is a
/// legitimate change and propagates normally.
pub struct EchoSuppressor {
    inner: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl EchoSuppressor {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Remembers a remotely-written text. Consecutive identical writes are
    /// collapsed into one slot.
    pub fn note_remote_write(&self, text: &str) {
        let mut queue = self.lock();
        if queue.back().map(String::as_str) == Some(text) {
            return;
        }
        queue.push_back(text.to_string());
        while queue.len() > self.capacity {
            queue.pop_front();
        }
    }

    /// True iff `text` is currently in the window.
    pub fn should_ignore_local(&self, text: &str) -> bool {
        self.lock().iter().any(|t| t == text)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for EchoSuppressor {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
