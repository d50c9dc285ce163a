//! Capacity-bounded in-memory cache with pluggable replacement policy.
//!
//! The cache maps hashed keys to buffered responses and keeps two counters:
//! `current` (bytes of installed entries) and `pending` (bytes reserved by
//! admissions whose disk save has not completed). Their sum never exceeds
//! the configured capacity; reservations are what keep parallel admissions
//! from collectively overrunning a budget each one individually fits.
//!
//! Reads take the shared lock; the admission planner, `delete`, and `set`
//! take the exclusive lock. Policy state sits behind its own mutex and is
//! always acquired after the state lock.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::entry::CachedResponse;
use crate::key;
use crate::logging;
use crate::policy::{Policy, Victim};

/// Outcome of a cache lookup. Misses and expiries are signals, not errors.
#[derive(Clone, Debug)]
pub enum Lookup {
    Hit(CachedResponse),
    Miss,
    Expired,
}

struct StoredEntry {
    response: CachedResponse,
    size: u64,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, StoredEntry>,
    current: u64,
    pending: u64,
}

/// The in-memory cache tier.
pub struct WebCache {
    max_capacity: u64,
    ttl: Duration,
    state: RwLock<State>,
    policy: Mutex<Box<dyn Policy>>,
}

impl WebCache {
    /// Creates an empty cache with a byte budget and a uniform entry TTL.
    pub fn new(policy: Box<dyn Policy>, max_capacity: u64, ttl: Duration) -> Self {
        Self {
            max_capacity,
            ttl,
            state: RwLock::new(State::default()),
            policy: Mutex::new(policy),
        }
    }

    /// Looks up `url` under its hashed key.
    ///
    /// Fresh hits are promoted and served as a cheap clone. Expired entries
    /// are reported but left in place; they leave through the eviction path.
    pub fn get(&self, url: &str) -> Lookup {
        let hashed = key::hash(url);
        let state = self.state.read();
        let Some(entry) = state.entries.get(&hashed) else {
            debug!("MISS - {url}");
            return Lookup::Miss;
        };
        if entry.response.is_expired(SystemTime::now()) {
            debug!("EXPIRED - {url}");
            return Lookup::Expired;
        }
        self.policy.lock().promote(&hashed, entry.size);
        debug!("HIT - {url}");
        Lookup::Hit(entry.response.clone())
    }

    /// Admission planner: decides whether a body of `length` bytes fits and
    /// which keys must be evicted first.
    ///
    /// On success the bytes are reserved in `pending` and the victims are
    /// returned for the caller to delete, disk first. If the policy runs dry
    /// before enough room is found, the victims drawn so far are put back
    /// and nothing is reserved.
    pub fn find_eviction_entries(&self, url: &str, length: u64) -> (Vec<String>, bool) {
        let mut state = self.state.write();
        let mut policy = self.policy.lock();

        if length > self.max_capacity {
            info!("Not caching - response for {url} too large");
            return (Vec::new(), false);
        }

        let mut victims: Vec<Victim> = Vec::new();
        let mut free = self.max_capacity.saturating_sub(state.current + state.pending);
        while free < length {
            let Some(victim) = policy.evict() else {
                info!("Not caching - unable to make room for {url}");
                for victim in &victims {
                    policy.promote(&victim.key, victim.size);
                }
                return (Vec::new(), false);
            };
            free += victim.size;
            victims.push(victim);
        }

        state.pending += length;
        (victims.into_iter().map(|v| v.key).collect(), true)
    }

    /// Removes the entry for a hashed key, if present.
    ///
    /// Callers sequence this after the corresponding disk delete so a crash
    /// never leaves a memory-only entry.
    pub fn delete(&self, hashed: &str) {
        let mut state = self.state.write();
        if let Some(entry) = state.entries.remove(hashed) {
            state.current -= entry.size;
            info!("EVICT - {hashed}");
            logging::log_capacity(state.current, self.max_capacity);
        }
    }

    /// Installs a response for `url`, converting its reservation into
    /// accounted capacity and promoting the entry.
    ///
    /// An update of an existing key applies the size delta, so `current`
    /// stays equal to the sum of installed entry sizes.
    pub fn set(&self, url: &str, response: CachedResponse) {
        let hashed = key::hash(url);
        let size = response.size();
        let mut state = self.state.write();
        match state.entries.insert(hashed.clone(), StoredEntry { response, size }) {
            Some(old) => {
                info!("UPDATE - URL: {url} Key: {hashed}");
                state.current = state.current - old.size + size;
            }
            None => {
                info!("SET - URL: {url} Key: {hashed}");
                state.current += size;
            }
        }
        state.pending = state.pending.saturating_sub(size);
        self.policy.lock().promote(&hashed, size);
        logging::log_capacity(state.current, self.max_capacity);
    }

    /// Releases a reservation whose disk save failed.
    pub fn release_pending(&self, length: u64) {
        let mut state = self.state.write();
        state.pending = state.pending.saturating_sub(length);
    }

    /// Recovery-only insert of a pre-hashed entry, bypassing the planner.
    pub fn initialize(&self, hashed: &str, response: CachedResponse) {
        info!("Adding disk cache entry to web cache, key {hashed}");
        let size = response.size();
        let mut state = self.state.write();
        state.entries.insert(hashed.to_owned(), StoredEntry { response, size });
        state.current += size;
        self.policy.lock().promote(hashed, size);
    }

    /// TTL stamped onto entries at admission time.
    pub fn expiration(&self) -> Duration {
        self.ttl
    }

    /// Logs the current capacity status line.
    pub fn log_capacity(&self) {
        let state = self.state.read();
        logging::log_capacity(state.current, self.max_capacity);
    }
}
