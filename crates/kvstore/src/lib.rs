//! The replicated key-value store carrying the link-state database.
//!
//! Eventually consistent by construction: a deterministic merge order,
//! epidemic flooding with loop detection, TTL countdown with per-hop
//! decrement, three-way full sync between peers, and an optional
//! spanning-tree flood optimization driven by a diffusing update
//! algorithm.

pub mod client;
pub mod dual;
pub mod flood;
pub mod server;
pub mod store;
pub mod ttl;

pub use client::KvStoreClient;
pub use dual::{DualEvent, DualNode, DualState, DISTANCE_INFINITY};
pub use server::KvStore;
pub use store::{
    compare_values, dump_all_with_filters, dump_difference, dump_hash_with_filters,
    merge_key_values, ComparisonResult, KeyFilters,
};
pub use ttl::{TtlCountdownEntry, TtlCountdownQueue};
