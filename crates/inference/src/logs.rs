//! Bounded, newest-first request log shared by the bridge and the server

use std::collections::VecDeque;

use chrono::Local;
use parking_lot::Mutex;

use crate::constants::limits;

/// Fixed-capacity log ring buffer.
///
/// Entries are timestamped and stored newest first; once the capacity is
/// exceeded the oldest entry is evicted. Safe for concurrent appenders.
pub struct LogBuffer {
    entries: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::with_capacity(limits::LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity + 1)),
            capacity,
        }
    }

    /// Append an entry, mirroring it to the `log` facade
    pub fn push(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        log::info!("{}", message);

        let entry = format!("{} {}", Local::now().format("%H:%M:%S"), message);
        let mut entries = self.entries.lock();
        entries.push_front(entry);
        if entries.len() > self.capacity {
            entries.pop_back();
        }
    }

    /// Copy of all entries, newest first
    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_newest_first() {
        let logs = LogBuffer::new();
        logs.push("first");
        logs.push("second");

        let entries = logs.snapshot();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].ends_with(" second"));
        assert!(entries[1].ends_with(" first"));
    }

    #[test]
    fn test_evicts_oldest_past_capacity() {
        let logs = LogBuffer::new();
        for i in 0..150 {
            logs.push(format!("entry {}", i));
        }

        let entries = logs.snapshot();
        assert_eq!(entries.len(), limits::LOG_CAPACITY);
        assert!(entries[0].ends_with("entry 149"));
        assert!(entries[99].ends_with("entry 50"));
    }

    #[test]
    fn test_entries_are_timestamped() {
        let logs = LogBuffer::with_capacity(3);
        logs.push("hello");
        let entry = &logs.snapshot()[0];
        // "HH:MM:SS hello"
        assert_eq!(entry.len(), "00:00:00 hello".len());
        assert_eq!(&entry[2..3], ":");
    }

    #[test]
    fn test_concurrent_appenders_respect_cap() {
        let logs = Arc::new(LogBuffer::with_capacity(10));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let logs = logs.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        logs.push(format!("thread {} entry {}", t, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(logs.len(), 10);
    }

    #[test]
    fn test_clear() {
        let logs = LogBuffer::new();
        logs.push("x");
        logs.clear();
        assert!(logs.is_empty());
    }
}
