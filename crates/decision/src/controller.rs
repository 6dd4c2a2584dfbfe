//! The decision engine's event loop.
//!
//! Subscribes to the store's publication bus, classifies keys by their
//! marker, feeds the solver, and debounces recomputation: adjacency
//! changes trigger a full SPF, prefix-only changes just rebuild the
//! route database. Changed routes go out as a full database plus a
//! delta against the previously published one.

use std::collections::BTreeMap;
use std::time::Duration;

use eyre::{Result as EyreResult, WrapErr};
use meridian_config::CoreConfig;
use meridian_counters::{CounterStore, MonitorClient};
use meridian_kvstore::KvStoreClient;
use meridian_network::spawn_pub_fanout;
use meridian_primitives::{
    route_db_delta, AdjacencyDatabase, ExponentialBackoff, IpPrefix, KeyDumpParams, KvRequest,
    KvResponse, PerfEvents, PrefixDatabase, PrefixEntry, Publication, RouteDatabase, RouteUpdate,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::spf::SpfSolver;

/// How often ordered-FIB holds are decremented while any are pending.
const ORDERED_FIB_TICK: Duration = Duration::from_millis(250);

/// Tracks publications buffered behind the debounce timer: how many, and
/// the perf-event chain of the oldest one, so convergence is measured
/// from the event that actually started the batch.
#[derive(Debug, Default)]
struct PendingUpdates {
    count: u32,
    min_ts: Option<i64>,
    perf_events: Option<PerfEvents>,
}

impl PendingUpdates {
    fn add_update(&mut self, node_name: &str, perf_events: Option<&PerfEvents>) {
        self.count += 1;

        match perf_events {
            None => {
                if self.perf_events.is_none() {
                    let mut chain = PerfEvents::default();
                    chain.mark(node_name, "DECISION_RECEIVED");
                    self.min_ts = chain.started_at();
                    self.perf_events = Some(chain);
                }
            }
            Some(perf_events) => {
                let started = perf_events.started_at().unwrap_or(i64::MAX);
                if self.min_ts.is_none_or(|ts| started < ts) {
                    let mut chain = perf_events.clone();
                    chain.mark(node_name, "DECISION_RECEIVED");
                    self.min_ts = Some(started);
                    self.perf_events = Some(chain);
                }
            }
        }
    }

    fn clear(&mut self) {
        self.count = 0;
        self.min_ts = None;
        self.perf_events = None;
    }
}

/// Window scheduling for pending-update processing. As long as every
/// window keeps finding new work, the next one waits twice as long,
/// from `debounce_min` up to `debounce_max`; a window that fires with
/// nothing pending drops the wait back to the floor.
#[derive(Debug)]
struct Debounce {
    backoff: ExponentialBackoff,
    deadline: Option<Instant>,
}

impl Debounce {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            backoff: ExponentialBackoff::new(min, max),
            deadline: None,
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Arms a window for newly arrived work; a pending window stands.
    fn schedule(&mut self) {
        if self.deadline.is_none() {
            self.arm();
        }
    }

    /// The window fired and processed work: arm the trailing window
    /// with a longer wait, so sustained churn coalesces into fewer
    /// recomputations.
    fn fired_busy(&mut self) {
        self.arm();
    }

    /// The window fired with nothing pending: the storm is over.
    fn fired_idle(&mut self) {
        self.deadline = None;
        self.backoff.report_success();
    }

    fn arm(&mut self) {
        self.backoff.report_error();
        self.deadline = Some(Instant::now() + self.backoff.time_remaining_until_retry());
    }
}

/// Requests served by the decision loop.
#[derive(Debug)]
pub enum DecisionRequest {
    GetRouteDb {
        reply: oneshot::Sender<RouteDatabase>,
    },
}

/// Cloneable handle to a running decision engine.
#[derive(Clone, Debug)]
pub struct DecisionClient {
    requests: mpsc::Sender<DecisionRequest>,
    routes: broadcast::Sender<RouteUpdate>,
    pub_addr: std::net::SocketAddr,
}

impl DecisionClient {
    pub fn pub_addr(&self) -> std::net::SocketAddr {
        self.pub_addr
    }

    /// Live stream of route database updates.
    pub fn subscribe(&self) -> broadcast::Receiver<RouteUpdate> {
        self.routes.subscribe()
    }

    pub async fn get_route_db(&self) -> EyreResult<RouteDatabase> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(DecisionRequest::GetRouteDb { reply: reply_tx })
            .await
            .map_err(|_| eyre::eyre!("decision engine is gone"))?;
        reply_rx
            .await
            .map_err(|_| eyre::eyre!("decision engine dropped the request"))
    }
}

pub struct Decision {
    node_name: String,
    cfg: meridian_config::DecisionConfig,
    per_prefix_keys: bool,

    solver: SpfSolver,
    route_db: RouteDatabase,
    /// Rollup of per-prefix keys into one prefix database per node.
    node_prefix_entries: BTreeMap<String, BTreeMap<IpPrefix, PrefixEntry>>,

    pending_adj: PendingUpdates,
    pending_prefix: PendingUpdates,
    debounce: Debounce,

    counters: CounterStore,
    monitor: MonitorClient,
    routes: broadcast::Sender<RouteUpdate>,

    ordered_fib_at: Option<Instant>,
    cold_start_until: Option<Instant>,
}

impl Decision {
    /// Binds the route publication endpoint and spawns the loop. A bind
    /// failure is fatal.
    pub async fn spawn(
        config: &CoreConfig,
        kv_client: KvStoreClient,
        counters: CounterStore,
        monitor: MonitorClient,
    ) -> EyreResult<DecisionClient> {
        let cfg = config.decision.clone();

        let pub_listener = TcpListener::bind(cfg.pub_bind_addr)
            .await
            .wrap_err_with(|| {
                format!("failed to bind route publication endpoint {}", cfg.pub_bind_addr)
            })?;
        let pub_addr = pub_listener.local_addr().wrap_err("route publication endpoint")?;

        let (routes, _) = broadcast::channel(256);
        let (requests_tx, requests_rx) = mpsc::channel(16);
        spawn_pub_fanout(pub_listener, routes.clone());

        let decision = Self {
            node_name: config.node_name.clone(),
            per_prefix_keys: config.prefixes.per_prefix_keys,
            solver: SpfSolver::new(
                &config.node_name,
                cfg.enable_v4,
                cfg.enable_lfa,
                cfg.enable_ordered_fib,
                cfg.enable_bgp_route_programming,
            ),
            route_db: RouteDatabase {
                this_node_name: config.node_name.clone(),
                ..Default::default()
            },
            node_prefix_entries: BTreeMap::new(),
            pending_adj: PendingUpdates::default(),
            pending_prefix: PendingUpdates::default(),
            debounce: Debounce::new(cfg.debounce_min, cfg.debounce_max),
            counters,
            monitor,
            routes: routes.clone(),
            ordered_fib_at: None,
            cold_start_until: cfg
                .graceful_restart_window
                .map(|window| Instant::now() + window),
            cfg,
        };

        info!(node = %config.node_name, %pub_addr, "decision engine started");
        drop(tokio::spawn(decision.run(kv_client, requests_rx)));

        Ok(DecisionClient {
            requests: requests_tx,
            routes,
            pub_addr,
        })
    }

    async fn run(
        mut self,
        kv_client: KvStoreClient,
        mut requests_rx: mpsc::Receiver<DecisionRequest>,
    ) {
        // Subscribe before the initial dump so no publication is lost in
        // between.
        let mut publications = kv_client.subscribe();
        if let Err(err) = self.initial_sync(&kv_client).await {
            warn!(%err, "initial sync with the store failed");
        }

        let mut monitor_interval = interval(self.cfg.monitor_submit_interval);
        monitor_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let debounce_at = self.debounce.deadline();
            let ordered_fib_at = self.ordered_fib_at;
            let cold_start_until = self.cold_start_until;

            tokio::select! {
                publication = publications.recv() => match publication {
                    Ok(publication) => self.process_publication(&publication),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "publication stream lagged, resyncing from the store");
                        if let Err(err) = self.initial_sync(&kv_client).await {
                            warn!(%err, "resync with the store failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("publication bus closed, decision loop exiting");
                        return;
                    }
                },
                Some(request) = requests_rx.recv() => self.handle_request(request),
                _ = sleep_until(debounce_at.unwrap_or_else(far_future)), if debounce_at.is_some() => {
                    self.process_pending_updates();
                }
                _ = sleep_until(ordered_fib_at.unwrap_or_else(far_future)), if ordered_fib_at.is_some() => {
                    self.decrement_ordered_fib_holds();
                }
                _ = sleep_until(cold_start_until.unwrap_or_else(far_future)), if cold_start_until.is_some() => {
                    self.cold_start_expired();
                }
                _ = monitor_interval.tick() => self.submit_counters(),
            }
        }
    }

    fn handle_request(&mut self, request: DecisionRequest) {
        match request {
            DecisionRequest::GetRouteDb { reply } => {
                let _ = reply.send(self.route_db.clone());
            }
        }
    }

    /// Seeds the solver from a full dump of both marker spaces, then
    /// runs one computation immediately.
    async fn initial_sync(&mut self, kv_client: &KvStoreClient) -> EyreResult<()> {
        let params = KeyDumpParams {
            prefix: format!("{},{}", self.cfg.adjacency_db_marker, self.cfg.prefix_db_marker),
            ..Default::default()
        };
        match kv_client.request(KvRequest::KeyDump(params)).await? {
            KvResponse::Publication(publication) => {
                info!(keys = publication.key_vals.len(), "initial link-state dump received");
                self.process_publication(&publication);
                self.process_pending_updates();
                Ok(())
            }
            other => eyre::bail!("unexpected dump response: {other:?}"),
        }
    }

    fn process_publication(&mut self, publication: &Publication) {
        self.counters.bump("decision.received_publications");

        for (key, value) in &publication.key_vals {
            // TTL refreshes carry no payload and change nothing here.
            let Some(bytes) = &value.value else {
                continue;
            };

            if let Some(node) = key.strip_prefix(&self.cfg.adjacency_db_marker) {
                match serde_json::from_slice::<AdjacencyDatabase>(bytes) {
                    Ok(db) => {
                        if db.this_node_name != node {
                            warn!(%key, body_node = %db.this_node_name, "adjacency key/body mismatch");
                        }
                        let perf_events = db.perf_events.clone();
                        let (topology, attributes) = self.solver.update_adjacency_database(db);
                        if topology || attributes {
                            self.pending_adj.add_update(node, perf_events.as_ref());
                            self.schedule_debounce();
                        }
                    }
                    Err(err) => warn!(%key, %err, "undecodable adjacency database"),
                }
            } else if key.starts_with(&self.cfg.prefix_db_marker) {
                match serde_json::from_slice::<PrefixDatabase>(bytes) {
                    Ok(db) => {
                        let node = db.this_node_name.clone();
                        let perf_events = db.perf_events.clone();
                        let changed = if self.is_per_prefix_key(key) {
                            let rolled_up = self.update_node_prefix_database(&node, db);
                            self.solver.update_prefix_database(rolled_up)
                        } else {
                            self.solver.update_prefix_database(db)
                        };
                        if changed {
                            self.pending_prefix.add_update(&node, perf_events.as_ref());
                            self.schedule_debounce();
                        }
                    }
                    Err(err) => warn!(%key, %err, "undecodable prefix database"),
                }
            }
        }

        for key in &publication.expired_keys {
            if let Some(node) = key.strip_prefix(&self.cfg.adjacency_db_marker) {
                if self.solver.delete_adjacency_database(node) {
                    self.pending_adj.add_update(node, None);
                    self.schedule_debounce();
                }
            } else if let Some(rest) = key.strip_prefix(&self.cfg.prefix_db_marker) {
                let changed = if self.is_per_prefix_key(key) {
                    self.expire_per_prefix_key(rest)
                } else {
                    self.solver.delete_prefix_database(rest)
                };
                if changed {
                    self.pending_prefix.add_update(rest, None);
                    self.schedule_debounce();
                }
            }
        }
    }

    /// Per-prefix keys look like `prefix:<node>:<ip_prefix>`; node-level
    /// keys carry no second separator.
    fn is_per_prefix_key(&self, key: &str) -> bool {
        self.per_prefix_keys
            && key
                .strip_prefix(&self.cfg.prefix_db_marker)
                .is_some_and(|rest| rest.contains(':'))
    }

    /// Rolls the per-prefix announcements of `node` into one database.
    fn update_node_prefix_database(&mut self, node: &str, db: PrefixDatabase) -> PrefixDatabase {
        let entries = self.node_prefix_entries.entry(node.to_owned()).or_default();
        for entry in db.prefix_entries {
            let _ = entries.insert(entry.prefix, entry);
        }
        PrefixDatabase {
            this_node_name: node.to_owned(),
            prefix_entries: entries.values().cloned().collect(),
            perf_events: None,
        }
    }

    fn expire_per_prefix_key(&mut self, rest: &str) -> bool {
        let Some((node, prefix)) = rest.split_once(':') else {
            return false;
        };
        let Ok(prefix) = prefix.parse::<IpPrefix>() else {
            warn!(%rest, "expired per-prefix key with undecodable prefix");
            return false;
        };
        let Some(entries) = self.node_prefix_entries.get_mut(node) else {
            return false;
        };
        if entries.remove(&prefix).is_none() {
            return false;
        }
        let rolled_up = PrefixDatabase {
            this_node_name: node.to_owned(),
            prefix_entries: entries.values().cloned().collect(),
            perf_events: None,
        };
        self.solver.update_prefix_database(rolled_up)
    }

    fn schedule_debounce(&mut self) {
        self.debounce.schedule();
    }

    /// Debounce expiry: adjacency changes force a full SPF, prefix-only
    /// changes just re-join the route database.
    fn process_pending_updates(&mut self) {
        let adj_count = self.pending_adj.count;
        let prefix_count = self.pending_prefix.count;
        if adj_count == 0 && prefix_count == 0 {
            // Quiet trailing window: the storm is over.
            self.debounce.fired_idle();
            return;
        }
        // Escalate while work keeps arriving; the armed trailing window
        // fires idle and resets the wait once the churn stops.
        self.debounce.fired_busy();
        debug!(adj_count, prefix_count, "processing pending updates");

        let mut perf_events = self
            .pending_adj
            .perf_events
            .take()
            .or_else(|| self.pending_prefix.perf_events.take());

        let new_db = if adj_count > 0 {
            self.counters.bump("decision.spf_recompute");
            if let Some(chain) = perf_events.as_mut() {
                chain.mark(&self.node_name, "DECISION_SPF");
            }
            self.solver.build_paths(&self.node_name)
        } else {
            self.counters.bump("decision.route_db_rebuild");
            self.solver.build_route_db(&self.node_name)
        };

        self.pending_adj.clear();
        self.pending_prefix.clear();

        match new_db {
            None => debug!("no prefix database announced for this node yet"),
            Some(mut db) => {
                if let Some(chain) = perf_events.as_mut() {
                    chain.mark(&self.node_name, "DECISION_ROUTE_DB_BUILT");
                }
                db.perf_events = perf_events;
                self.publish_routes(db);
            }
        }

        if self.cfg.enable_ordered_fib && self.solver.has_holds() && self.ordered_fib_at.is_none()
        {
            self.ordered_fib_at = Some(Instant::now() + ORDERED_FIB_TICK);
        }
    }

    fn publish_routes(&mut self, db: RouteDatabase) {
        if db.unicast_routes == self.route_db.unicast_routes {
            debug!("routes unchanged, nothing to publish");
            return;
        }

        let delta = route_db_delta(&self.route_db, &db);
        self.route_db = db.clone();
        self.counters.bump("decision.route_db_updates");

        if self.cold_start_until.is_some() {
            debug!("suppressing route publication during the graceful restart window");
            return;
        }

        info!(
            routes = db.unicast_routes.len(),
            updated = delta.routes_to_update.len(),
            deleted = delta.routes_to_delete.len(),
            "publishing route database"
        );
        let _ = self.routes.send(RouteUpdate::Full(db));
        let _ = self.routes.send(RouteUpdate::Delta(delta));
    }

    fn decrement_ordered_fib_holds(&mut self) {
        self.ordered_fib_at = None;
        if self.solver.decrement_holds() {
            debug!("ordered-fib hold expired, recomputing");
            if let Some(db) = self.solver.build_paths(&self.node_name) {
                self.publish_routes(db);
            }
        }
        if self.solver.has_holds() {
            self.ordered_fib_at = Some(Instant::now() + ORDERED_FIB_TICK);
        }
    }

    fn cold_start_expired(&mut self) {
        self.cold_start_until = None;
        info!("graceful restart window elapsed, publishing routes");
        let _ = self.routes.send(RouteUpdate::Full(self.route_db.clone()));
    }

    fn submit_counters(&self) {
        let mut counters = self.counters.snapshot();
        counters.extend(self.solver.counters());
        self.monitor.set_counters("decision", counters);
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod controller_tests;
