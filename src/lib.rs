//! A forward HTTP proxy with a persistent, capacity-bounded web cache.
//!
//! Webcache sits between a browser and the open web. GET responses are
//! served from an in-memory cache when present and unexpired; misses fetch
//! the origin, persist the body to a journaled disk tier, and admit it into
//! memory under a capacity budget enforced by a pluggable replacement
//! policy (LRU or LFU). HTML responses get their absolute resource URLs
//! rewritten to route back through the proxy, and those resources are
//! prefetched concurrently so they are warm by the time the browser asks.
//!
//! # Architecture
//! - [cache::WebCache]: the capacity-bounded memory tier and its admission
//!   planner.
//! - [disk::DiskStore]: single-writer persistent store, content-addressed
//!   by [key::hash], made crash-safe by the [journal].
//! - [index::InvertedIndex]: hashed-key to origin-URL mapping behind the
//!   rewritten URLs.
//! - [policy]: LRU and LFU eviction orderings.
//! - [singleflight::SingleFlight]: one origin fetch per key, shared by all
//!   concurrent waiters.
//! - [rewrite]: HTML resource-URL rewriting.
//! - [proxy]: the HTTP surface tying it all together.
//!
//! # Compatibility
//! - Runtime: `tokio`
//! - HTTP: `hyper` 1.x (inbound), `reqwest` (outbound)

/// Capacity-bounded in-memory cache and admission planning.
pub mod cache;

/// Command-line configuration parsing.
pub mod config;

/// Durable disk tier keyed by hashed URLs.
pub mod disk;

/// Cached response records and their disk encoding.
pub mod entry;

/// Hashed-key to origin-URL inverted index.
pub mod index;

/// Append-only journal making disk recovery deterministic.
pub mod journal;

/// URL hashing and scheme-prefix handling.
pub mod key;

/// Tracing setup and capacity formatting.
pub mod logging;

/// Replacement policies: LRU and LFU.
pub mod policy;

/// HTTP accept loop, GET pipeline, and passthrough forwarding.
pub mod proxy;

/// HTML resource-URL rewriting.
pub mod rewrite;

/// Per-key request coalescing for origin fetches.
pub mod singleflight;

pub use cache::{Lookup, WebCache};
pub use entry::CachedResponse;
pub use key::hash;
