//! # Expiry Queues
//!
//! Time-wheel structures that expire many items without per-item timers.
//! Times are plain `u64` values in whatever unit the caller chooses (the
//! network uses milliseconds, the DHT stores use seconds); only their order
//! and differences matter.
//!
//! - [`TimeoutQueue`]: items with individual deadlines, drained by `advance`.
//! - [`DiscardQueue`]: a bounded set of recently seen keys that forgets them
//!   after a TTL, used to drop duplicate messages.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

// ============================================================================
// TimeoutQueue
// ============================================================================

/// Wheel of `ceil(span / interval) + 1` slots, each `interval` wide.
///
/// Deadlines beyond the wheel are clamped to the last slot and re-slotted as
/// the wheel turns.
#[derive(Debug)]
pub struct TimeoutQueue<T> {
    interval: u64,
    slots: Vec<Vec<(u64, T)>>,
    cursor: usize,
    /// Start time of the slot under the cursor.
    base: u64,
    len: usize,
}

impl<T> TimeoutQueue<T> {
    pub fn new(interval: u64, span: u64, now: u64) -> Self {
        let interval = interval.max(1);
        let slot_count = span.div_ceil(interval) as usize + 1;
        let mut slots = Vec::with_capacity(slot_count);
        slots.resize_with(slot_count, Vec::new);
        Self {
            interval,
            slots,
            cursor: 0,
            base: now - now % interval,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, item: T, deadline: u64) {
        let offset = (deadline.saturating_sub(self.base) / self.interval) as usize;
        let offset = offset.min(self.slots.len() - 1);
        let idx = (self.cursor + offset) % self.slots.len();
        self.slots[idx].push((deadline, item));
        self.len += 1;
    }

    /// Turn the wheel to `now`, returning every item whose deadline is `<= now`.
    pub fn advance(&mut self, now: u64) -> Vec<T> {
        let mut expired = Vec::new();
        if now < self.base {
            return expired;
        }

        let steps = ((now - self.base) / self.interval) as usize;
        let visit = (steps + 1).min(self.slots.len());
        let mut keep = Vec::new();
        for i in 0..visit {
            let idx = (self.cursor + i) % self.slots.len();
            for (deadline, item) in self.slots[idx].drain(..) {
                if deadline <= now {
                    expired.push(item);
                } else {
                    keep.push((deadline, item));
                }
            }
        }

        self.len -= expired.len() + keep.len();
        self.cursor = (self.cursor + steps) % self.slots.len();
        self.base += steps as u64 * self.interval;
        for (deadline, item) in keep {
            self.push(item, deadline);
        }
        expired
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
        self.len = 0;
    }
}

// ============================================================================
// DiscardQueue
// ============================================================================

const DEFAULT_GENERATIONS: usize = 4;

/// Set of recently seen keys that forgets each key between `ttl * (g-1)/g`
/// and `ttl` after insertion, holding at most about `capacity` keys.
#[derive(Debug)]
pub struct DiscardQueue<K> {
    generations: VecDeque<HashSet<K>>,
    generation_count: usize,
    generation_capacity: usize,
    generation_ttl: u64,
    current_started: u64,
}

impl<K: Hash + Eq> DiscardQueue<K> {
    pub fn new(capacity: usize, ttl: u64, now: u64) -> Self {
        Self::with_generations(capacity, ttl, DEFAULT_GENERATIONS, now)
    }

    pub fn with_generations(capacity: usize, ttl: u64, generations: usize, now: u64) -> Self {
        let generation_count = generations.max(1);
        let mut queue = VecDeque::with_capacity(generation_count);
        queue.push_front(HashSet::new());
        Self {
            generations: queue,
            generation_count,
            generation_capacity: (capacity / generation_count).max(1),
            generation_ttl: (ttl / generation_count as u64).max(1),
            current_started: now,
        }
    }

    /// Record `key`. Returns `false` when it was already present.
    pub fn insert(&mut self, key: K, now: u64) -> bool {
        self.rotate(now);
        if self.generations.iter().any(|g| g.contains(&key)) {
            return false;
        }
        if let Some(current) = self.generations.front_mut() {
            current.insert(key);
            if current.len() >= self.generation_capacity {
                self.push_generation(now);
            }
        }
        true
    }

    pub fn contains(&mut self, key: &K, now: u64) -> bool {
        self.rotate(now);
        self.generations.iter().any(|g| g.contains(key))
    }

    pub fn len(&self) -> usize {
        self.generations.iter().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn rotate(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.current_started);
        if elapsed < self.generation_ttl {
            return;
        }
        let turns = (elapsed / self.generation_ttl) as usize;
        if turns >= self.generation_count {
            self.generations.clear();
            self.generations.push_front(HashSet::new());
            self.current_started = now;
            return;
        }
        for _ in 0..turns {
            self.push_generation(self.current_started + self.generation_ttl);
        }
    }

    fn push_generation(&mut self, started: u64) {
        self.generations.push_front(HashSet::new());
        self.generations.truncate(self.generation_count);
        self.current_started = started;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_queue_expires_in_deadline_order() {
        let mut queue = TimeoutQueue::new(10, 100, 0);
        queue.push("late", 55);
        queue.push("early", 5);
        queue.push("mid", 30);
        assert_eq!(queue.len(), 3);

        assert!(queue.advance(4).is_empty());
        assert_eq!(queue.advance(5), vec!["early"]);
        assert_eq!(queue.advance(40), vec!["mid"]);
        assert_eq!(queue.advance(1000), vec!["late"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn timeout_queue_reslots_deadlines_beyond_span() {
        let mut queue = TimeoutQueue::new(10, 30, 0);
        queue.push(1, 500);
        queue.push(2, 35);

        let mut now = 0;
        let mut seen = Vec::new();
        while now <= 600 {
            for item in queue.advance(now) {
                seen.push((item, now));
            }
            now += 7;
        }
        assert_eq!(seen, vec![(2, 35), (1, 504)]);
    }

    #[test]
    fn timeout_queue_handles_past_deadlines() {
        let mut queue = TimeoutQueue::new(10, 100, 1000);
        queue.push('a', 0);
        assert_eq!(queue.advance(1000), vec!['a']);
    }

    #[test]
    fn timeout_queue_large_jump_drains_everything_due() {
        let mut queue = TimeoutQueue::new(1, 8, 0);
        for d in 0..8u64 {
            queue.push(d, d);
        }
        let mut got = queue.advance(10_000);
        got.sort();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn discard_queue_detects_duplicates() {
        let mut seen = DiscardQueue::new(100, 40, 0);
        assert!(seen.insert(1, 0));
        assert!(!seen.insert(1, 5));
        assert!(seen.insert(2, 5));
        assert!(seen.contains(&1, 5));
    }

    #[test]
    fn discard_queue_forgets_after_ttl() {
        let mut seen = DiscardQueue::new(100, 40, 0);
        seen.insert("k", 0);
        assert!(seen.contains(&"k", 29));
        assert!(!seen.contains(&"k", 40));
        assert!(seen.insert("k", 41));
    }

    #[test]
    fn discard_queue_is_bounded() {
        let mut seen = DiscardQueue::with_generations(8, 1_000, 4, 0);
        for i in 0..100 {
            seen.insert(i, 0);
        }
        assert!(seen.len() <= 8);
        assert!(seen.contains(&99, 0));
        assert!(!seen.contains(&0, 0));
    }
}
