//! Idle-connection timers kept in a list sorted by expiry.
//!
//! Nodes live in a slab and are linked in both directions, so a timer can be
//! unlinked in O(1) once found and `tick` only ever looks at the head. Timers
//! are keyed by the connection's slot index; a slot has at most one timer and
//! the list never holds a reference to the connection itself.
//!
//! Fresh timers almost always expire last, so inserts scan from the tail.

use slab::Slab;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Node {
    slot: usize,
    expire: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Timers ordered ascending by expiry.
#[derive(Default)]
pub struct TimerList {
    nodes: Slab<Node>,
    /// Slot index -> node key.
    index: HashMap<usize, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, slot: usize) -> bool {
        self.index.contains_key(&slot)
    }

    /// Expiry of the earliest timer.
    #[cfg(test)]
    pub fn next_expiry(&self) -> Option<Instant> {
        self.head.map(|key| self.nodes[key].expire)
    }

    /// Start a timer for `slot` expiring `timeout` from now.
    ///
    /// A slot that already has a timer is adjusted instead.
    pub fn add(&mut self, slot: usize, timeout: Duration) {
        self.add_at(slot, Instant::now() + timeout);
    }

    fn add_at(&mut self, slot: usize, expire: Instant) {
        if let Some(&key) = self.index.get(&slot) {
            self.unlink(key);
            self.nodes[key].expire = expire;
            self.link_sorted(key);
            return;
        }

        let key = self.nodes.insert(Node {
            slot,
            expire,
            prev: None,
            next: None,
        });
        self.index.insert(slot, key);
        self.link_sorted(key);
    }

    /// Push the timer for `slot` out to `timeout` from now.
    ///
    /// Returns `false` if the slot has no timer.
    pub fn adjust(&mut self, slot: usize, timeout: Duration) -> bool {
        let Some(&key) = self.index.get(&slot) else {
            return false;
        };
        self.unlink(key);
        self.nodes[key].expire = Instant::now() + timeout;
        self.link_sorted(key);
        true
    }

    /// Drop the timer for `slot`. Returns `false` if there was none.
    pub fn remove(&mut self, slot: usize) -> bool {
        let Some(key) = self.index.remove(&slot) else {
            return false;
        };
        self.unlink(key);
        self.nodes.remove(key);
        true
    }

    /// Remove every timer with `expire <= now`, calling `evict` with its slot.
    ///
    /// Timers are unlinked before `evict` runs. Stops at the first live timer.
    pub fn tick<F: FnMut(usize)>(&mut self, now: Instant, mut evict: F) -> usize {
        let mut expired = 0;
        while let Some(key) = self.head {
            if self.nodes[key].expire > now {
                break;
            }
            let slot = self.nodes[key].slot;
            self.remove(slot);
            evict(slot);
            expired += 1;
        }
        expired
    }

    fn unlink(&mut self, key: usize) {
        let (prev, next) = {
            let node = &self.nodes[key];
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        let node = &mut self.nodes[key];
        node.prev = None;
        node.next = None;
    }

    /// Insert an unlinked node after the last node expiring no later.
    fn link_sorted(&mut self, key: usize) {
        let expire = self.nodes[key].expire;
        let mut cursor = self.tail;
        while let Some(c) = cursor {
            if self.nodes[c].expire <= expire {
                break;
            }
            cursor = self.nodes[c].prev;
        }

        match cursor {
            Some(prev) => {
                let next = self.nodes[prev].next;
                self.nodes[key].prev = Some(prev);
                self.nodes[key].next = next;
                self.nodes[prev].next = Some(key);
                match next {
                    Some(n) => self.nodes[n].prev = Some(key),
                    None => self.tail = Some(key),
                }
            }
            None => {
                let next = self.head;
                self.nodes[key].prev = None;
                self.nodes[key].next = next;
                match next {
                    Some(n) => self.nodes[n].prev = Some(key),
                    None => self.tail = Some(key),
                }
                self.head = Some(key);
            }
        }
    }

    /// Slots in list order.
    #[cfg(test)]
    fn slots(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cursor = self.head;
        while let Some(key) = cursor {
            out.push(self.nodes[key].slot);
            cursor = self.nodes[key].next;
        }
        out
    }

    #[cfg(test)]
    fn is_sorted(&self) -> bool {
        let mut cursor = self.head;
        let mut last: Option<Instant> = None;
        while let Some(key) = cursor {
            let expire = self.nodes[key].expire;
            if last.is_some_and(|l| l > expire) {
                return false;
            }
            last = Some(expire);
            cursor = self.nodes[key].next;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_sorted_insert() {
        let base = Instant::now();
        let mut timers = TimerList::new();
        timers.add_at(1, base + secs(30));
        timers.add_at(2, base + secs(10));
        timers.add_at(3, base + secs(20));
        timers.add_at(4, base + secs(40));

        assert_eq!(timers.slots(), vec![2, 3, 1, 4]);
        assert!(timers.is_sorted());
        assert_eq!(timers.next_expiry(), Some(base + secs(10)));
    }

    #[test]
    fn test_equal_expiry_keeps_insertion_order() {
        let base = Instant::now();
        let mut timers = TimerList::new();
        timers.add_at(7, base);
        timers.add_at(8, base);
        timers.add_at(9, base);
        assert_eq!(timers.slots(), vec![7, 8, 9]);
    }

    #[test]
    fn test_adjust_moves_toward_tail() {
        let mut timers = TimerList::new();
        timers.add(1, secs(10));
        timers.add(2, secs(20));
        timers.add(3, secs(30));

        assert!(timers.adjust(1, secs(60)));
        assert_eq!(timers.slots(), vec![2, 3, 1]);
        assert!(timers.is_sorted());
        assert!(!timers.adjust(99, secs(1)));
    }

    #[test]
    fn test_add_existing_slot_replaces() {
        let mut timers = TimerList::new();
        timers.add(1, secs(10));
        timers.add(1, secs(20));
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut timers = TimerList::new();
        timers.add(1, secs(10));
        timers.add(2, secs(20));
        timers.add(3, secs(30));

        assert!(timers.remove(2));
        assert!(!timers.remove(2));
        assert_eq!(timers.slots(), vec![1, 3]);

        assert!(timers.remove(1));
        assert!(timers.remove(3));
        assert!(timers.is_empty());
        assert_eq!(timers.next_expiry(), None);
    }

    #[test]
    fn test_tick_evicts_expired_only() {
        let base = Instant::now();
        let mut timers = TimerList::new();
        timers.add_at(1, base + secs(5));
        timers.add_at(2, base + secs(10));
        timers.add_at(3, base + secs(15));

        let mut evicted = Vec::new();
        let count = timers.tick(base + secs(10), |slot| evicted.push(slot));

        assert_eq!(count, 2);
        assert_eq!(evicted, vec![1, 2]);
        assert_eq!(timers.slots(), vec![3]);
        assert!(!timers.contains(1));
    }

    #[test]
    fn test_idle_connection_evicted_without_activity() {
        let mut timers = TimerList::new();
        timers.add(42, Duration::from_millis(10));

        // Next tick, well after the idle threshold
        let mut evicted = Vec::new();
        timers.tick(Instant::now() + secs(1), |slot| evicted.push(slot));
        assert_eq!(evicted, vec![42]);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_tick_before_expiry_does_nothing() {
        let mut timers = TimerList::new();
        timers.add(1, secs(60));
        assert_eq!(timers.tick(Instant::now(), |_| panic!("evicted early")), 0);
        assert_eq!(timers.len(), 1);
    }
}
