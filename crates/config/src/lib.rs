//! Immutable runtime configuration.
//!
//! The whole configuration is assembled once at startup (from CLI flags)
//! and passed by reference into each subsystem's constructor; nothing
//! reads flags at runtime.

use core::time::Duration;
use std::net::SocketAddr;

use meridian_primitives::{ADJ_DB_MARKER, PREFIX_DB_MARKER};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CoreConfig {
    /// Unique name of this node within the routing domain.
    pub node_name: String,
    pub kvstore: KvStoreConfig,
    pub decision: DecisionConfig,
    pub prefixes: PrefixConfig,
}

/// Flood rate limit: sustained messages per second with a burst budget.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct FloodRate {
    pub msgs_per_sec: u32,
    pub burst_size: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KvStoreConfig {
    /// Command endpoint peers and local clients connect to.
    pub cmd_bind_addr: SocketAddr,
    /// Publication fan-out endpoint for external subscribers.
    pub pub_bind_addr: SocketAddr,
    /// Default TTL for locally originated keys, milliseconds.
    pub key_ttl_ms: i64,
    /// Base interval between periodic anti-entropy syncs (jitter added).
    pub sync_interval: Duration,
    /// Per-hop TTL decrement applied to outgoing publications.
    pub ttl_decrement_ms: i64,
    /// Queue depth for peer links and the publication bus.
    pub high_watermark: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flood_rate: Option<FloodRate>,
    pub enable_flood_optimization: bool,
    pub is_flood_root: bool,
    pub use_flood_optimization: bool,
    /// Key prefixes accepted into the store; empty accepts everything.
    #[serde(default)]
    pub key_prefix_filters: Vec<String>,
    /// Originators accepted into the store; empty accepts everything.
    #[serde(default)]
    pub key_originator_id_filters: Vec<String>,
    /// Interval between counter submissions to the monitor.
    pub monitor_submit_interval: Duration,
}

impl Default for KvStoreConfig {
    fn default() -> Self {
        Self {
            cmd_bind_addr: localhost(0),
            pub_bind_addr: localhost(0),
            key_ttl_ms: 300_000,
            sync_interval: Duration::from_secs(60),
            ttl_decrement_ms: 1,
            high_watermark: 1024,
            flood_rate: None,
            enable_flood_optimization: false,
            is_flood_root: false,
            use_flood_optimization: false,
            key_prefix_filters: Vec::new(),
            key_originator_id_filters: Vec::new(),
            monitor_submit_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DecisionConfig {
    /// Publication endpoint for route database subscribers.
    pub pub_bind_addr: SocketAddr,
    pub debounce_min: Duration,
    pub debounce_max: Duration,
    /// Suppress route publication for this long after a cold start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graceful_restart_window: Option<Duration>,
    pub enable_v4: bool,
    pub enable_lfa: bool,
    pub enable_ordered_fib: bool,
    pub enable_bgp_route_programming: bool,
    pub adjacency_db_marker: String,
    pub prefix_db_marker: String,
    /// Interval between counter submissions to the monitor.
    pub monitor_submit_interval: Duration,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            pub_bind_addr: localhost(0),
            debounce_min: Duration::from_millis(10),
            debounce_max: Duration::from_millis(250),
            graceful_restart_window: None,
            enable_v4: false,
            enable_lfa: false,
            enable_ordered_fib: false,
            enable_bgp_route_programming: false,
            adjacency_db_marker: ADJ_DB_MARKER.to_owned(),
            prefix_db_marker: PREFIX_DB_MARKER.to_owned(),
            monitor_submit_interval: Duration::from_secs(30),
        }
    }
}

/// Defaults applied to locally originated prefix announcements.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct PrefixConfig {
    /// Advertise one key per prefix instead of one key per node.
    pub per_prefix_keys: bool,
    pub forwarding_type_mpls: bool,
    pub forwarding_algo_ksp2_ed_ecmp: bool,
}

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}
