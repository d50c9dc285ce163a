//! Replacement policies ordering cache entries for eviction.
//!
//! A policy sees only access history: `promote` on every admission and hit,
//! `evict` when the planner needs room. It never performs I/O and never
//! consults expiration. Two implementations are provided:
//!
//! - [`LruPolicy`]: recency order, evicting the least recently promoted key.
//! - [`LfuPolicy`]: frequency order with a recency tie-break, evicting the
//!   key with the fewest promotions and, among equals, the least recently
//!   touched one.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use lru::LruCache;
use tracing::debug;

/// Policy selected on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyKind {
    Lru,
    Lfu,
}

impl PolicyKind {
    /// Constructs a fresh policy of this kind.
    pub fn build(self) -> Box<dyn Policy> {
        match self {
            PolicyKind::Lru => Box::new(LruPolicy::new()),
            PolicyKind::Lfu => Box::new(LfuPolicy::new()),
        }
    }
}

impl FromStr for PolicyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LRU" => Ok(PolicyKind::Lru),
            "LFU" => Ok(PolicyKind::Lfu),
            other => bail!("invalid cache replacement policy [{other}]"),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PolicyKind::Lru => "LRU",
            PolicyKind::Lfu => "LFU",
        })
    }
}

/// An entry selected for eviction, with the size the planner reclaims.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Victim {
    pub key: String,
    pub size: u64,
}

/// Eviction-ordering capability: promote on access, evict on demand.
pub trait Policy: Send {
    /// Marks `key` as just used, inserting it if the policy has not seen it.
    fn promote(&mut self, key: &str, size: u64);

    /// Removes and returns the next entry to evict, or `None` when empty.
    fn evict(&mut self) -> Option<Victim>;

    /// Number of entries currently tracked.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Least-recently-used ordering.
pub struct LruPolicy {
    entries: LruCache<String, u64>,
}

impl LruPolicy {
    pub fn new() -> Self {
        Self { entries: LruCache::unbounded() }
    }
}

impl Default for LruPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl Policy for LruPolicy {
    fn promote(&mut self, key: &str, size: u64) {
        self.entries.put(key.to_owned(), size);
    }

    fn evict(&mut self) -> Option<Victim> {
        let (key, size) = self.entries.pop_lru()?;
        debug!("LRU - evict {key}");
        Some(Victim { key, size })
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Least-frequently-used ordering with a least-recently-touched tie-break.
///
/// Backed by an indexed binary min-heap over `(hits, tick)` so a promote of
/// an existing key restores heap order by sifting from its tracked slot.
pub struct LfuPolicy {
    slots: Vec<Slot>,
    positions: HashMap<String, usize>,
    tick: u64,
}

struct Slot {
    key: String,
    size: u64,
    hits: u64,
    tick: u64,
}

impl LfuPolicy {
    pub fn new() -> Self {
        Self { slots: Vec::new(), positions: HashMap::new(), tick: 0 }
    }

    fn less(&self, i: usize, j: usize) -> bool {
        (self.slots[i].hits, self.slots[i].tick) < (self.slots[j].hits, self.slots[j].tick)
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.slots.swap(i, j);
        self.positions.insert(self.slots[i].key.clone(), i);
        self.positions.insert(self.slots[j].key.clone(), j);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.less(i, parent) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut smallest = i;
            if left < self.slots.len() && self.less(left, smallest) {
                smallest = left;
            }
            if right < self.slots.len() && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }
}

impl Default for LfuPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl Policy for LfuPolicy {
    fn promote(&mut self, key: &str, size: u64) {
        self.tick += 1;
        if let Some(&at) = self.positions.get(key) {
            let slot = &mut self.slots[at];
            slot.hits += 1;
            slot.tick = self.tick;
            slot.size = size;
            self.sift_down(at);
        } else {
            let at = self.slots.len();
            self.slots.push(Slot { key: key.to_owned(), size, hits: 1, tick: self.tick });
            self.positions.insert(key.to_owned(), at);
            self.sift_up(at);
        }
    }

    fn evict(&mut self) -> Option<Victim> {
        if self.slots.is_empty() {
            return None;
        }
        let last = self.slots.len() - 1;
        self.swap(0, last);
        let slot = self.slots.pop()?;
        self.positions.remove(&slot.key);
        if !self.slots.is_empty() {
            self.sift_down(0);
        }
        debug!("LFU - evict {}, frequency {}", slot.key, slot.hits);
        Some(Victim { key: slot.key, size: slot.size })
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}
