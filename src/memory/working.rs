//! Session-scoped working memory.
//!
//! A fixed-capacity circular buffer of recently-touched memory ids per
//! session. The buffer is an explicit type with `push`/`shift`/`at`/`slice`
//! and an `Index` impl; all state lives in the instance, never in statics,
//! so concurrent sessions cannot interfere.

use std::collections::HashMap;
use std::ops::Index;
use std::sync::Mutex;

/// Fixed-capacity circular buffer. Pushing past capacity evicts the oldest
/// element.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append at the back, evicting and returning the oldest element when full.
    pub fn push(&mut self, value: T) -> Option<T> {
        let capacity = self.capacity();
        if self.len < capacity {
            let idx = (self.head + self.len) % capacity;
            self.slots[idx] = Some(value);
            self.len += 1;
            None
        } else {
            let evicted = self.slots[self.head].replace(value);
            self.head = (self.head + 1) % capacity;
            evicted
        }
    }

    /// Remove and return the oldest element.
    pub fn shift(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        value
    }

    /// Element at logical position `i` (0 = oldest).
    pub fn at(&self, i: usize) -> Option<&T> {
        if i >= self.len {
            return None;
        }
        self.slots[(self.head + i) % self.capacity()].as_ref()
    }

    /// All elements oldest-first.
    pub fn slice(&self) -> Vec<&T> {
        (0..self.len).filter_map(|i| self.at(i)).collect()
    }
}

impl<T> Index<usize> for RingBuffer<T> {
    type Output = T;

    fn index(&self, i: usize) -> &T {
        self.at(i).expect("ring buffer index out of bounds")
    }
}

/// Per-session working memory. Sessions are fully isolated from one another.
pub struct WorkingMemory {
    capacity: usize,
    sessions: Mutex<HashMap<String, RingBuffer<String>>>,
}

impl WorkingMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, RingBuffer<String>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record that a session just touched these memory ids, most recent last.
    pub fn touch(&self, session_id: &str, memory_ids: &[String]) {
        let mut sessions = self.sessions();
        let buffer = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| RingBuffer::new(self.capacity));
        for id in memory_ids {
            // Re-touching moves the id to the back rather than duplicating it.
            if let Some(pos) = buffer.slice().iter().position(|v| *v == id) {
                let mut kept: Vec<String> = Vec::with_capacity(buffer.len());
                while let Some(item) = buffer.shift() {
                    kept.push(item);
                }
                kept.remove(pos);
                for item in kept {
                    buffer.push(item);
                }
            }
            buffer.push(id.clone());
        }
    }

    /// Recency rank of a memory id in a session's working memory:
    /// 0.0 = most recently touched, 1.0 = about to be evicted or absent.
    pub fn recency(&self, session_id: &str, memory_id: &str) -> Option<f64> {
        let sessions = self.sessions();
        let buffer = sessions.get(session_id)?;
        let items = buffer.slice();
        let pos = items.iter().position(|v| *v == memory_id)?;
        // Newest element sits at the end of the slice.
        let age = (items.len() - 1 - pos) as f64;
        Some(age / self.capacity as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_at_preserve_order() {
        let mut rb = RingBuffer::new(3);
        rb.push(1);
        rb.push(2);
        rb.push(3);
        assert_eq!(rb.at(0), Some(&1));
        assert_eq!(rb.at(2), Some(&3));
        assert_eq!(rb[1], 2);
    }

    #[test]
    fn push_past_capacity_evicts_oldest() {
        let mut rb = RingBuffer::new(3);
        for i in 1..=4 {
            rb.push(i);
        }
        assert_eq!(rb.len(), 3);
        assert_eq!(rb.slice(), vec![&2, &3, &4]);
    }

    #[test]
    fn shift_removes_oldest_first() {
        let mut rb = RingBuffer::new(3);
        rb.push("a");
        rb.push("b");
        assert_eq!(rb.shift(), Some("a"));
        assert_eq!(rb.shift(), Some("b"));
        assert_eq!(rb.shift(), None);
        assert!(rb.is_empty());
    }

    #[test]
    fn wraparound_keeps_indexing_correct() {
        let mut rb = RingBuffer::new(2);
        rb.push(1);
        rb.push(2);
        rb.shift();
        rb.push(3); // wraps into the vacated slot
        assert_eq!(rb.slice(), vec![&2, &3]);
        assert_eq!(rb.at(5), None);
    }

    #[test]
    fn sessions_are_isolated() {
        let wm = WorkingMemory::new(4);
        wm.touch("session-a", &["m1".into(), "m2".into()]);

        assert!(wm.recency("session-a", "m1").is_some());
        assert!(wm.recency("session-b", "m1").is_none());
    }

    #[test]
    fn recency_ranks_newest_lowest() {
        let wm = WorkingMemory::new(4);
        wm.touch("s", &["old".into(), "new".into()]);

        let old = wm.recency("s", "old").unwrap();
        let new = wm.recency("s", "new").unwrap();
        assert!(new < old);
        assert_eq!(new, 0.0);
        assert!(wm.recency("s", "absent").is_none());
    }

    #[test]
    fn retouching_moves_to_back_without_duplicating() {
        let wm = WorkingMemory::new(4);
        wm.touch("s", &["a".into(), "b".into()]);
        wm.touch("s", &["a".into()]);

        assert_eq!(wm.recency("s", "a"), Some(0.0));
        let b = wm.recency("s", "b").unwrap();
        assert!(b > 0.0);
    }
}
