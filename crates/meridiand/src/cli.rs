use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use eyre::{bail, Result as EyreResult};
use meridian_config::{
    CoreConfig, DecisionConfig, FloodRate, KvStoreConfig, PrefixConfig,
};
use meridian_counters::{spawn_monitor, CounterStore};
use meridian_decision::Decision;
use meridian_kvstore::KvStore;
use meridian_primitives::{PeerSpec, ADJ_DB_MARKER, PREFIX_DB_MARKER};
use tracing::info;

pub const EXAMPLES: &str = r"
  # Run a standalone node
  $ meridiand --node-name node1

  # Run two peered nodes on one host
  $ meridiand --node-name node1 \
      --kvstore-cmd-addr 127.0.0.1:60001 --kvstore-pub-addr 127.0.0.1:60002 \
      --decision-pub-addr 127.0.0.1:60003
  $ meridiand --node-name node2 \
      --kvstore-cmd-addr 127.0.0.1:61001 --kvstore-pub-addr 127.0.0.1:61002 \
      --decision-pub-addr 127.0.0.1:61003 \
      --peer node1=127.0.0.1:60001/127.0.0.1:60002
";

#[derive(Debug, Parser)]
#[command(author, version, about = "Meridian link-state routing daemon")]
#[command(after_help = EXAMPLES)]
pub struct RootCommand {
    /// Unique name of this node within the routing domain
    #[arg(long, value_name = "NAME", env = "MERIDIAN_NODE_NAME")]
    pub node_name: String,

    /// Initial peers, as NAME=CMD_ADDR/PUB_ADDR (repeatable)
    #[arg(long = "peer", value_name = "PEER")]
    pub peers: Vec<String>,

    #[arg(long, default_value = "127.0.0.1:60001")]
    pub kvstore_cmd_addr: SocketAddr,
    #[arg(long, default_value = "127.0.0.1:60002")]
    pub kvstore_pub_addr: SocketAddr,
    #[arg(long, default_value = "127.0.0.1:60003")]
    pub decision_pub_addr: SocketAddr,

    #[arg(long)]
    pub enable_v4: bool,
    #[arg(long)]
    pub enable_lfa: bool,
    #[arg(long)]
    pub enable_ordered_fib_programming: bool,
    #[arg(long)]
    pub enable_bgp_route_programming: bool,

    #[arg(long, default_value_t = 10)]
    pub decision_debounce_min_ms: u64,
    #[arg(long, default_value_t = 250)]
    pub decision_debounce_max_ms: u64,
    /// Suppress route publication for this long after startup
    #[arg(long)]
    pub decision_graceful_restart_window_s: Option<u64>,

    #[arg(long, default_value_t = 300_000)]
    pub kvstore_key_ttl_ms: i64,
    #[arg(long, default_value_t = 60)]
    pub kvstore_sync_interval_s: u64,
    #[arg(long, default_value_t = 1)]
    pub kvstore_ttl_decrement_ms: i64,
    /// Queue depth for peer links and publication buses
    #[arg(long, default_value_t = 1024)]
    pub kvstore_hwm: usize,

    /// Flood rate limit, messages per second
    #[arg(long)]
    pub kvstore_flood_msg_per_sec: Option<u32>,
    /// Flood rate limit burst budget
    #[arg(long)]
    pub kvstore_flood_msg_burst_size: Option<u32>,

    #[arg(long)]
    pub enable_flood_optimization: bool,
    #[arg(long)]
    pub is_flood_root: bool,
    #[arg(long)]
    pub use_flood_optimization: bool,

    /// Key prefixes accepted into the store (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub key_prefix_filters: Vec<String>,
    /// Originator ids accepted into the store (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub key_originator_id_filters: Vec<String>,

    #[arg(long)]
    pub per_prefix_keys: bool,
    #[arg(long)]
    pub prefix_fwd_type_mpls: bool,
    #[arg(long)]
    pub prefix_algo_type_ksp2_ed_ecmp: bool,

    #[arg(long, default_value_t = 30)]
    pub monitor_submit_interval_s: u64,
}

impl RootCommand {
    pub async fn run(self) -> EyreResult<()> {
        let peers = self.parse_peers()?;
        let config = self.into_config();

        let monitor = spawn_monitor();
        let kv_client = KvStore::spawn(&config, CounterStore::new(), monitor.clone()).await?;
        let _decision_client =
            Decision::spawn(&config, kv_client.clone(), CounterStore::new(), monitor).await?;

        if !peers.is_empty() {
            let reply = kv_client.add_peers(peers).await?;
            info!(peers = reply.peers.len(), "initial peers configured");
        }

        info!(node = %config.node_name, "meridiand is up");
        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        Ok(())
    }

    /// `NAME=CMD_ADDR/PUB_ADDR` per `--peer` flag.
    fn parse_peers(&self) -> EyreResult<BTreeMap<String, PeerSpec>> {
        let mut peers = BTreeMap::new();
        for arg in &self.peers {
            let Some((name, addrs)) = arg.split_once('=') else {
                bail!("malformed --peer {arg}: expected NAME=CMD_ADDR/PUB_ADDR");
            };
            let Some((cmd_addr, pub_addr)) = addrs.split_once('/') else {
                bail!("malformed --peer {arg}: expected NAME=CMD_ADDR/PUB_ADDR");
            };
            let _ = peers.insert(
                name.to_owned(),
                PeerSpec {
                    cmd_addr: cmd_addr.to_owned(),
                    pub_addr: pub_addr.to_owned(),
                    support_flood_optimization: self.use_flood_optimization,
                },
            );
        }
        Ok(peers)
    }

    fn into_config(self) -> CoreConfig {
        let flood_rate = match (self.kvstore_flood_msg_per_sec, self.kvstore_flood_msg_burst_size)
        {
            (Some(msgs_per_sec), Some(burst_size)) => Some(FloodRate {
                msgs_per_sec,
                burst_size,
            }),
            (Some(msgs_per_sec), None) => Some(FloodRate {
                msgs_per_sec,
                burst_size: msgs_per_sec,
            }),
            _ => None,
        };

        CoreConfig {
            node_name: self.node_name,
            kvstore: KvStoreConfig {
                cmd_bind_addr: self.kvstore_cmd_addr,
                pub_bind_addr: self.kvstore_pub_addr,
                key_ttl_ms: self.kvstore_key_ttl_ms,
                sync_interval: Duration::from_secs(self.kvstore_sync_interval_s),
                ttl_decrement_ms: self.kvstore_ttl_decrement_ms,
                high_watermark: self.kvstore_hwm,
                flood_rate,
                enable_flood_optimization: self.enable_flood_optimization,
                is_flood_root: self.is_flood_root,
                use_flood_optimization: self.use_flood_optimization,
                key_prefix_filters: self.key_prefix_filters,
                key_originator_id_filters: self.key_originator_id_filters,
                monitor_submit_interval: Duration::from_secs(self.monitor_submit_interval_s),
            },
            decision: DecisionConfig {
                pub_bind_addr: self.decision_pub_addr,
                debounce_min: Duration::from_millis(self.decision_debounce_min_ms),
                debounce_max: Duration::from_millis(self.decision_debounce_max_ms),
                graceful_restart_window: self
                    .decision_graceful_restart_window_s
                    .map(Duration::from_secs),
                enable_v4: self.enable_v4,
                enable_lfa: self.enable_lfa,
                enable_ordered_fib: self.enable_ordered_fib_programming,
                enable_bgp_route_programming: self.enable_bgp_route_programming,
                adjacency_db_marker: ADJ_DB_MARKER.to_owned(),
                prefix_db_marker: PREFIX_DB_MARKER.to_owned(),
                monitor_submit_interval: Duration::from_secs(self.monitor_submit_interval_s),
            },
            prefixes: PrefixConfig {
                per_prefix_keys: self.per_prefix_keys,
                forwarding_type_mpls: self.prefix_fwd_type_mpls,
                forwarding_algo_ksp2_ed_ecmp: self.prefix_algo_type_ksp2_ed_ecmp,
            },
        }
    }
}
