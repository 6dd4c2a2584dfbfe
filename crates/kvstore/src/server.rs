//! The replicated store's event loop.
//!
//! One task owns all mutable state: the key-value map, the TTL countdown
//! queue, the peer table with its sync state machine, the DUAL spanning
//! trees, and the flood rate limiter. Everything reaches the loop through
//! channels: local client commands, requests read off the command
//! listener, and events from the outgoing peer links. Timers are served
//! by the same `select!`.

use std::cmp;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use eyre::{Result as EyreResult, WrapErr};
use meridian_config::CoreConfig;
use meridian_counters::{CounterStore, ExportType, MonitorClient};
use meridian_network::{
    spawn_cmd_server, spawn_pub_fanout, LinkEvent, PeerLink, ServerEvent,
};
use meridian_primitives::{
    ExponentialBackoff, FloodTopoSetParams, KeyDumpParams, KeySetParams, KvRequest, KvResponse,
    PeerCmdReply, PeerSpec, Publication, SptInfos, Value, WireMessage,
};
use rand::seq::IteratorRandom;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::client::{ClientCommand, KvStoreClient};
use crate::dual::{DualEvent, DualNode};
use crate::flood::{PublicationBuffer, TokenBucket};
use crate::store::{
    dump_all_with_filters, dump_difference, dump_hash_with_filters, get_key_vals, merge_key_values,
    KeyFilters,
};
use crate::ttl::{update_publication_ttl, TtlCountdownQueue};

/// Peer sync retry bounds.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(64);
pub const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// How long a rate-limited publication waits before the drain retries.
const FLOOD_PENDING_DRAIN: Duration = Duration::from_millis(100);

/// Capacity of the local client command channel.
const CLIENT_CHANNEL_CAPACITY: usize = 64;

struct PeerEntry {
    spec: PeerSpec,
    link: PeerLink,
}

/// The store and everything attached to it. Constructed by [`KvStore::spawn`],
/// then moved into its loop task.
pub struct KvStore {
    node_id: String,
    cfg: meridian_config::KvStoreConfig,
    filters: Option<KeyFilters>,
    ttl_decrement: Duration,

    entries: BTreeMap<String, Value>,
    ttl_queue: TtlCountdownQueue,

    peers: HashMap<String, PeerEntry>,
    peer_add_counter: u64,
    peers_to_sync_with: HashMap<String, ExponentialBackoff>,
    latest_sent_peer_sync: HashMap<String, Instant>,

    dual: DualNode,
    flood_limiter: Option<TokenBucket>,
    publication_buffer: PublicationBuffer,

    counters: CounterStore,
    monitor: MonitorClient,
    publications: broadcast::Sender<Publication>,
    link_events_tx: mpsc::Sender<LinkEvent>,
    request_id_counter: u64,

    full_sync_at: Option<Instant>,
    pending_flood_at: Option<Instant>,
    next_anti_entropy_at: Instant,
}

impl KvStore {
    /// Binds the command and publication endpoints and spawns the loop.
    /// A bind failure is fatal: the caller exits the process.
    pub async fn spawn(
        config: &CoreConfig,
        counters: CounterStore,
        monitor: MonitorClient,
    ) -> EyreResult<KvStoreClient> {
        let cfg = config.kvstore.clone();

        let cmd_listener = TcpListener::bind(cfg.cmd_bind_addr)
            .await
            .wrap_err_with(|| format!("failed to bind command endpoint {}", cfg.cmd_bind_addr))?;
        let cmd_addr = cmd_listener.local_addr().wrap_err("command endpoint")?;
        let pub_listener = TcpListener::bind(cfg.pub_bind_addr)
            .await
            .wrap_err_with(|| format!("failed to bind publication endpoint {}", cfg.pub_bind_addr))?;
        let pub_addr = pub_listener.local_addr().wrap_err("publication endpoint")?;

        let (publications, _) = broadcast::channel(cfg.high_watermark);
        let (server_tx, server_rx) = mpsc::channel(cfg.high_watermark);
        let (link_events_tx, link_events_rx) = mpsc::channel(cfg.high_watermark);
        let (cmd_tx, cmd_rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);

        spawn_cmd_server(cmd_listener, server_tx);
        spawn_pub_fanout(pub_listener, publications.clone());

        let filters = if cfg.key_prefix_filters.is_empty() && cfg.key_originator_id_filters.is_empty()
        {
            None
        } else {
            Some(KeyFilters::new(
                cfg.key_prefix_filters.clone(),
                cfg.key_originator_id_filters.iter().cloned(),
            ))
        };

        let now = Instant::now();
        let store = Self {
            node_id: config.node_name.clone(),
            filters,
            ttl_decrement: Duration::from_millis(cfg.ttl_decrement_ms.max(0) as u64),
            entries: BTreeMap::new(),
            ttl_queue: TtlCountdownQueue::new(),
            peers: HashMap::new(),
            peer_add_counter: 0,
            peers_to_sync_with: HashMap::new(),
            latest_sent_peer_sync: HashMap::new(),
            dual: DualNode::new(&config.node_name, cfg.is_flood_root),
            flood_limiter: cfg
                .flood_rate
                .map(|rate| TokenBucket::new(rate.msgs_per_sec, rate.burst_size, now)),
            publication_buffer: PublicationBuffer::default(),
            counters,
            monitor,
            publications: publications.clone(),
            link_events_tx,
            request_id_counter: 0,
            full_sync_at: None,
            pending_flood_at: None,
            next_anti_entropy_at: now,
            cfg,
        };

        info!(node = %config.node_name, %cmd_addr, %pub_addr, "key-value store started");
        drop(tokio::spawn(store.run(cmd_rx, server_rx, link_events_rx)));

        Ok(KvStoreClient::new(cmd_tx, publications, cmd_addr, pub_addr))
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<ClientCommand>,
        mut server_rx: mpsc::Receiver<ServerEvent>,
        mut link_events_rx: mpsc::Receiver<LinkEvent>,
    ) {
        let mut monitor_interval = interval(self.cfg.monitor_submit_interval);
        monitor_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let ttl_at = self.ttl_queue.next_expiry();
            let full_sync_at = self.full_sync_at;
            let drain_at = self.pending_flood_at;

            tokio::select! {
                command = cmd_rx.recv() => match command {
                    Some(command) => self.handle_client_command(command),
                    None => {
                        debug!("all local clients gone, store loop exiting");
                        return;
                    }
                },
                Some(event) = server_rx.recv() => self.handle_server_event(event),
                Some(event) = link_events_rx.recv() => self.handle_link_event(event),
                _ = sleep_until(ttl_at.unwrap_or_else(far_future)), if ttl_at.is_some() => {
                    self.cleanup_ttl_queue();
                }
                _ = sleep_until(full_sync_at.unwrap_or_else(far_future)), if full_sync_at.is_some() => {
                    self.full_sync_at = None;
                    self.request_full_sync_from_peers();
                }
                _ = sleep_until(drain_at.unwrap_or_else(far_future)), if drain_at.is_some() => {
                    self.drain_pending_floods();
                }
                _ = sleep_until(self.next_anti_entropy_at) => self.request_periodic_sync(),
                _ = monitor_interval.tick() => self.submit_counters(),
            }
        }
    }

    fn handle_client_command(&mut self, command: ClientCommand) {
        let response = self.process_request(None, command.request);
        let _ = command.reply.send(response);
    }

    fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Request {
                peer,
                request,
                reply,
            } => {
                let response = self.process_request(peer.as_deref(), request);
                if reply.wants_response() {
                    reply.send(response);
                }
            }
        }
    }

    /// Single dispatch point for every command, local or remote.
    fn process_request(&mut self, sender: Option<&str>, request: KvRequest) -> KvResponse {
        if let Some(sender) = sender {
            trace!(%sender, "processing peer request");
        }
        match request {
            KvRequest::KeySet(params) => self.process_key_set(params),
            KvRequest::KeyGet(params) => {
                self.counters.bump("kvstore.cmd_key_get");
                let mut publication = get_key_vals(&self.entries, &params.keys);
                update_publication_ttl(
                    &self.ttl_queue,
                    self.ttl_decrement,
                    &mut publication,
                    false,
                    Instant::now(),
                );
                KvResponse::Publication(publication)
            }
            KvRequest::KeyDump(params) => {
                self.counters.bump("kvstore.cmd_key_dump");
                let dump_filters = KeyFilters::new(
                    split_prefix_list(&params.prefix),
                    params.originator_ids.iter().cloned(),
                );
                let mut publication = dump_all_with_filters(&self.entries, &dump_filters);
                if let Some(hashes) = &params.key_val_hashes {
                    publication = dump_difference(&publication.key_vals, hashes);
                }
                update_publication_ttl(
                    &self.ttl_queue,
                    self.ttl_decrement,
                    &mut publication,
                    false,
                    Instant::now(),
                );
                // We are answering a dump: stamp our own tree root.
                publication.flood_root_id = self.dual.spt_root_id();
                KvResponse::Publication(publication)
            }
            KvRequest::HashDump(params) => {
                self.counters.bump("kvstore.cmd_hash_dump");
                let dump_filters = KeyFilters::new(split_prefix_list(&params.prefix), []);
                let mut publication = dump_hash_with_filters(&self.entries, &dump_filters);
                update_publication_ttl(
                    &self.ttl_queue,
                    self.ttl_decrement,
                    &mut publication,
                    false,
                    Instant::now(),
                );
                KvResponse::Publication(publication)
            }
            KvRequest::PeerAdd(params) => {
                self.counters.bump("kvstore.cmd_peer_add");
                if params.peers.is_empty() {
                    return self.protocol_error("empty peer-add request");
                }
                self.add_peers(params.peers);
                KvResponse::Peers(self.dump_peers())
            }
            KvRequest::PeerDel(params) => {
                self.counters.bump("kvstore.cmd_peer_del");
                if params.peer_names.is_empty() {
                    return self.protocol_error("empty peer-del request");
                }
                self.del_peers(&params.peer_names);
                KvResponse::Peers(self.dump_peers())
            }
            KvRequest::PeerDump => {
                self.counters.bump("kvstore.cmd_peer_dump");
                KvResponse::Peers(self.dump_peers())
            }
            KvRequest::Dual(messages) => {
                if messages.messages.is_empty() {
                    return self.protocol_error("empty dual message batch");
                }
                self.counters.bump("kvstore.received_dual_messages");
                let mut events = Vec::new();
                self.dual.process_messages(messages, &mut events);
                self.handle_dual_events(events);
                KvResponse::Ok
            }
            KvRequest::FloodTopoSet(params) => {
                self.process_flood_topo_set(params);
                KvResponse::Ok
            }
            KvRequest::FloodTopoGet => KvResponse::SptInfos(self.flood_topo_snapshot()),
            KvRequest::CountersGet => KvResponse::Counters(self.get_counters()),
        }
    }

    fn process_key_set(&mut self, mut params: KeySetParams) -> KvResponse {
        self.counters.bump("kvstore.cmd_key_set");
        if params.key_vals.is_empty() && params.expired_keys.is_empty() {
            return self.protocol_error("empty key-set request");
        }

        for value in params.key_vals.values_mut() {
            if value.value.is_some() {
                value.hash = Some(value.compute_hash());
            }
        }

        let publication = Publication {
            key_vals: params.key_vals,
            expired_keys: params.expired_keys,
            node_ids: params.node_ids,
            flood_root_id: params.flood_root_id,
            tobe_updated_keys: None,
        };
        let _ = self.merge_publication(publication, None);
        KvResponse::Ok
    }

    fn protocol_error(&self, reason: &str) -> KvResponse {
        warn!(%reason, "malformed request");
        self.counters.bump("kvstore.protocol_errors");
        KvResponse::Error(reason.to_owned())
    }

    /// Merges a received publication, floods the resulting delta, and
    /// (when replying to our own KEY_DUMP) finishes the three-way sync.
    fn merge_publication(&mut self, publication: Publication, sender: Option<&str>) -> usize {
        self.counters.bump("kvstore.received_publications");
        self.counters.add_value(
            "kvstore.received_key_vals",
            publication.key_vals.len() as i64,
            ExportType::Sum,
        );

        let needs_finalize = sender.is_some()
            && publication
                .tobe_updated_keys
                .as_ref()
                .is_some_and(|keys| !keys.is_empty());

        if publication.is_empty() && !needs_finalize {
            return 0;
        }

        if let Some(node_ids) = &publication.node_ids {
            if node_ids.iter().any(|id| id == &self.node_id) {
                self.counters.bump("kvstore.looped_publications");
                return 0;
            }
        }

        let delta_key_vals =
            merge_key_values(&mut self.entries, &publication.key_vals, self.filters.as_ref());
        let removed = self.apply_expired_keys(&publication.expired_keys);
        let update_count = delta_key_vals.len();
        self.counters.add_value(
            "kvstore.updated_key_vals",
            update_count as i64,
            ExportType::Sum,
        );

        let delta = Publication {
            key_vals: delta_key_vals,
            expired_keys: removed,
            node_ids: publication.node_ids.clone(),
            flood_root_id: publication.flood_root_id.clone(),
            tobe_updated_keys: None,
        };
        self.ttl_queue.schedule_from(&delta.key_vals, Instant::now());

        if delta.is_empty() {
            self.counters.bump("kvstore.received_redundant_publications");
        } else {
            self.flood_publication(delta, true, true);
        }

        if needs_finalize {
            let keys = publication.tobe_updated_keys.unwrap_or_default();
            self.finalize_full_sync(&keys, sender.expect("checked above"));
        }

        update_count
    }

    /// Applies remote expiration tombstones, returning the keys actually
    /// removed here. Re-flooding only those keeps tombstones from
    /// circulating forever.
    fn apply_expired_keys(&mut self, expired_keys: &[String]) -> Vec<String> {
        let mut removed = Vec::new();
        for key in expired_keys {
            if self.entries.remove(key).is_some() {
                debug!(%key, "removed remotely expired key");
                removed.push(key.clone());
            }
        }
        if !removed.is_empty() {
            self.counters.add_value(
                "kvstore.received_expired_keys",
                removed.len() as i64,
                ExportType::Sum,
            );
        }
        removed
    }

    /// Floods a publication: locally to subscribers, then to the flood
    /// peer set, rate limited and TTL-adjusted on the way out.
    fn flood_publication(
        &mut self,
        mut publication: Publication,
        rate_limit: bool,
        set_flood_root: bool,
    ) {
        let suppressed = rate_limit
            && match self.flood_limiter.as_mut() {
                Some(limiter) => !limiter.consume(1.0, Instant::now()),
                None => false,
            };
        if suppressed {
            self.buffer_publication(&publication);
            if self.pending_flood_at.is_none() {
                self.pending_flood_at = Some(Instant::now() + FLOOD_PENDING_DRAIN);
            }
            return;
        }

        // Anything already buffered goes out first, folded together.
        if !self.publication_buffer.is_empty() {
            self.buffer_publication(&publication);
            self.drain_buffered_publications();
            return;
        }

        update_publication_ttl(
            &self.ttl_queue,
            self.ttl_decrement,
            &mut publication,
            true,
            Instant::now(),
        );
        if publication.is_empty() {
            return;
        }

        // The terminal path entry is whoever handed us this publication.
        let sender = publication
            .node_ids
            .as_ref()
            .and_then(|ids| ids.last().cloned());
        publication
            .node_ids
            .get_or_insert_with(Vec::new)
            .push(self.node_id.clone());

        let _ = self.publications.send(publication.clone());

        if set_flood_root && sender.is_none() {
            // We are the initiator: stamp our tree root.
            publication.flood_root_id = self.dual.spt_root_id();
        }

        let params = KeySetParams {
            key_vals: publication.key_vals.clone(),
            expired_keys: publication.expired_keys.clone(),
            solicit_response: false,
            node_ids: publication.node_ids.clone(),
            flood_root_id: publication.flood_root_id.clone(),
        };

        for peer in self.flood_peers(publication.flood_root_id.as_deref()) {
            if sender.as_deref() == Some(peer.as_str()) {
                continue;
            }
            debug!(
                from = sender.as_deref().unwrap_or("-"),
                to = %peer,
                via = %self.node_id,
                "forwarding publication"
            );
            self.counters.bump("kvstore.sent_publications");
            self.counters.add_value(
                "kvstore.sent_key_vals",
                params.key_vals.len() as i64,
                ExportType::Sum,
            );
            let _ = self.send_to_peer(&peer, false, KvRequest::KeySet(params.clone()));
        }
    }

    fn buffer_publication(&mut self, publication: &Publication) {
        self.counters.bump("kvstore.rate_limit_suppress");
        self.counters.add_value(
            "kvstore.rate_limit_keys",
            publication.key_vals.len() as i64,
            ExportType::Avg,
        );
        self.publication_buffer.buffer(publication);
    }

    /// Re-floods everything the rate limiter parked, one merged
    /// publication per flood root, re-reading current values so an
    /// overwritten key floods its newest record and an expired key
    /// floods as a tombstone.
    fn drain_buffered_publications(&mut self) {
        for (flood_root_id, keys) in self.publication_buffer.drain() {
            let mut publication = Publication {
                flood_root_id,
                ..Default::default()
            };
            for key in keys {
                match self.entries.get(&key) {
                    Some(value) => {
                        let _ = publication.key_vals.insert(key, value.clone());
                    }
                    None => publication.expired_keys.push(key),
                }
            }
            // Forwarder mode: keep the original root, skip the limiter.
            self.flood_publication(publication, false, false);
        }
    }

    fn drain_pending_floods(&mut self) {
        self.pending_flood_at = None;
        if let Some(limiter) = self.flood_limiter.as_mut() {
            if !limiter.consume(1.0, Instant::now()) {
                self.pending_flood_at = Some(Instant::now() + FLOOD_PENDING_DRAIN);
                return;
            }
        }
        self.drain_buffered_publications();
    }

    /// Flood peer selection: the spanning tree when it is usable, plus
    /// peers outside the optimization, otherwise everyone.
    fn flood_peers(&self, flood_root_id: Option<&str>) -> Vec<String> {
        let optimized =
            self.cfg.enable_flood_optimization && self.cfg.use_flood_optimization;
        let spt_peers = match flood_root_id {
            Some(root_id) if optimized => self.dual.spt_peers(root_id),
            _ => BTreeSet::new(),
        };
        let flood_to_all = !optimized || spt_peers.is_empty();

        self.peers
            .iter()
            .filter(|(name, entry)| {
                flood_to_all
                    || spt_peers.contains(*name)
                    || !entry.spec.support_flood_optimization
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn add_peers(&mut self, peers: BTreeMap<String, PeerSpec>) {
        self.peer_add_counter += 1;
        let mut dual_peers_to_add = Vec::new();

        for (peer_name, new_spec) in peers {
            if peer_name == self.node_id {
                warn!("refusing to peer with ourselves");
                continue;
            }
            let connect_id = format!("{}::{}::{}", self.node_id, peer_name, self.peer_add_counter);
            if new_spec.support_flood_optimization {
                dual_peers_to_add.push(peer_name.clone());
            }

            let is_new_peer = match self.peers.get_mut(&peer_name) {
                Some(entry) => {
                    info!(
                        peer = %peer_name,
                        support_flood_optimization = new_spec.support_flood_optimization,
                        "updating existing peer"
                    );
                    let is_new = if entry.spec.cmd_addr != new_spec.cmd_addr {
                        // Peer moved: dropping the old link tears the
                        // session down, then dial the new address.
                        info!(peer = %peer_name, old = %entry.spec.cmd_addr, new = %new_spec.cmd_addr, "peer command address changed");
                        entry.link = PeerLink::open(
                            &self.node_id,
                            &peer_name,
                            &connect_id,
                            new_spec.cmd_addr.clone(),
                            self.cfg.high_watermark,
                            self.link_events_tx.clone(),
                        );
                        false
                    } else {
                        warn!(peer = %peer_name, "peer came back, previously shut down non-gracefully");
                        true
                    };
                    entry.spec = new_spec.clone();
                    is_new
                }
                None => {
                    info!(
                        peer = %peer_name,
                        support_flood_optimization = new_spec.support_flood_optimization,
                        "adding new peer"
                    );
                    let link = PeerLink::open(
                        &self.node_id,
                        &peer_name,
                        &connect_id,
                        new_spec.cmd_addr.clone(),
                        self.cfg.high_watermark,
                        self.link_events_tx.clone(),
                    );
                    let _ = self.peers.insert(
                        peer_name.clone(),
                        PeerEntry {
                            spec: new_spec.clone(),
                            link,
                        },
                    );
                    true
                }
            };

            if is_new_peer && new_spec.support_flood_optimization {
                // The peer must drop us as child everywhere first; proper
                // dual events will rebuild the tree from scratch.
                let _ = self.send_to_peer(
                    &peer_name,
                    false,
                    KvRequest::FloodTopoSet(FloodTopoSetParams {
                        root_id: String::new(),
                        src_id: self.node_id.clone(),
                        set_child: false,
                        all_roots: true,
                    }),
                );
            }

            debug!(peer = %peer_name, "enqueueing full sync");
            let _ = self
                .peers_to_sync_with
                .entry(peer_name)
                .or_insert_with(|| ExponentialBackoff::new(INITIAL_BACKOFF, MAX_BACKOFF));
        }

        self.full_sync_at = Some(Instant::now());

        if self.cfg.enable_flood_optimization {
            let mut events = Vec::new();
            for peer in dual_peers_to_add {
                // Hop count is the metric: every link costs one.
                self.dual.peer_up(&peer, 1, &mut events);
            }
            self.handle_dual_events(events);
        }
    }

    fn del_peers(&mut self, peer_names: &[String]) {
        let mut dual_peers_to_remove = Vec::new();

        for peer_name in peer_names {
            match self.peers.remove(peer_name) {
                None => warn!(peer = %peer_name, "trying to delete non-existing peer"),
                Some(entry) => {
                    info!(peer = %peer_name, cmd_addr = %entry.spec.cmd_addr, "detaching from peer");
                    if entry.spec.support_flood_optimization {
                        dual_peers_to_remove.push(peer_name.clone());
                    }
                    let _ = self.peers_to_sync_with.remove(peer_name);
                    drop(entry);
                }
            }
        }

        if self.cfg.enable_flood_optimization {
            let mut events = Vec::new();
            for peer in dual_peers_to_remove {
                self.dual.peer_down(&peer, &mut events);
            }
            self.handle_dual_events(events);
        }
    }

    fn dump_peers(&self) -> PeerCmdReply {
        PeerCmdReply {
            peers: self
                .peers
                .iter()
                .map(|(name, entry)| (name.clone(), entry.spec.clone()))
                .collect(),
        }
    }

    /// Sends KEY_DUMP (with our hash dump) to every peer pending sync,
    /// applying exponential backoff per peer on failure.
    fn request_full_sync_from_peers(&mut self) {
        let mut timeout = MAX_BACKOFF;
        let pending: Vec<String> = self.peers_to_sync_with.keys().cloned().collect();

        for peer_name in pending {
            let Some(backoff) = self.peers_to_sync_with.get(&peer_name) else {
                continue;
            };
            if !backoff.can_try_now() {
                timeout = cmp::min(timeout, backoff.time_remaining_until_retry());
                continue;
            }
            if !self.peers.contains_key(&peer_name) {
                let _ = self.peers_to_sync_with.remove(&peer_name);
                continue;
            }

            let params = KeyDumpParams {
                prefix: self
                    .filters
                    .as_ref()
                    .map(|filters| filters.key_prefixes().join(","))
                    .unwrap_or_default(),
                originator_ids: self
                    .filters
                    .as_ref()
                    .map(|filters| filters.originator_ids().clone())
                    .unwrap_or_default(),
                key_val_hashes: Some(
                    dump_hash_with_filters(&self.entries, &KeyFilters::all()).key_vals,
                ),
            };

            debug!(peer = %peer_name, "sending full sync request");
            if self.send_to_peer(&peer_name, true, KvRequest::KeyDump(params)) {
                let _ = self.peers_to_sync_with.remove(&peer_name);
                let _ = self
                    .latest_sent_peer_sync
                    .insert(peer_name, Instant::now());
            } else {
                let backoff = self
                    .peers_to_sync_with
                    .get_mut(&peer_name)
                    .expect("still pending");
                backoff.report_error();
                timeout = cmp::min(timeout, backoff.time_remaining_until_retry());
            }
        }

        if !self.peers_to_sync_with.is_empty() {
            warn!(
                pending = self.peers_to_sync_with.len(),
                retry_in = ?timeout,
                "peers still require sync"
            );
            self.full_sync_at = Some(Instant::now() + timeout);
        }
    }

    /// Periodic anti-entropy: pick one random peer and re-sync with it.
    fn request_periodic_sync(&mut self) {
        // Reschedule with 20% jitter either way.
        let base = self.cfg.sync_interval.as_secs_f64();
        let jittered = base * rand::thread_rng().gen_range(0.8..=1.2);
        self.next_anti_entropy_at = Instant::now() + Duration::from_secs_f64(jittered);

        if self.peers.is_empty() {
            return;
        }
        let Some(peer) = self
            .peers
            .keys()
            .choose(&mut rand::thread_rng())
            .cloned()
        else {
            return;
        };

        info!(%peer, "requesting periodic sync");
        let _ = self
            .peers_to_sync_with
            .entry(peer)
            .or_insert_with(|| ExponentialBackoff::new(INITIAL_BACKOFF, MAX_BACKOFF));
        if self.full_sync_at.is_none() {
            self.full_sync_at = Some(Instant::now());
        }
    }

    /// The third leg of three-way sync: ship the keys the responder asked
    /// for back to it as a fire-and-forget KEY_SET.
    fn finalize_full_sync(&mut self, keys: &[String], sender: &str) {
        if keys.is_empty() {
            return;
        }

        let mut key_vals = BTreeMap::new();
        for key in keys {
            if let Some(value) = self.entries.get(key) {
                let _ = key_vals.insert(key.clone(), value.clone());
            }
        }
        debug!(peer = %sender, keys = key_vals.len(), "finalizing full sync");

        let params = KeySetParams {
            key_vals,
            expired_keys: Vec::new(),
            solicit_response: false,
            node_ids: None,
            flood_root_id: self.dual.spt_root_id(),
        };
        let _ = self.send_to_peer(sender, false, KvRequest::KeySet(params));
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Response {
                peer,
                id: _,
                response,
            } => self.process_sync_response(&peer, response),
            LinkEvent::Down { peer } => {
                if self.peers.contains_key(&peer) {
                    debug!(%peer, "peer session dropped, scheduling re-sync");
                    let _ = self
                        .peers_to_sync_with
                        .entry(peer)
                        .or_insert_with(|| ExponentialBackoff::new(INITIAL_BACKOFF, MAX_BACKOFF));
                    if self.full_sync_at.is_none() {
                        self.full_sync_at = Some(Instant::now() + INITIAL_BACKOFF);
                    }
                }
            }
        }
    }

    fn process_sync_response(&mut self, peer: &str, response: KvResponse) {
        match response {
            KvResponse::Ok => debug!(%peer, "publication acknowledged"),
            KvResponse::Error(reason) => {
                warn!(%peer, %reason, "peer rejected our request");
            }
            KvResponse::Publication(publication) => {
                let received = publication.key_vals.len();
                let updated = self.merge_publication(publication, Some(peer));
                if let Some(started) = self.latest_sent_peer_sync.remove(peer) {
                    let took = started.elapsed();
                    self.counters.add_value(
                        "kvstore.peer_sync_time_ms",
                        took.as_millis() as i64,
                        ExportType::Avg,
                    );
                    info!(%peer, ?took, received, updated, "full sync response processed");
                }
            }
            other => debug!(%peer, ?other, "unexpected response on peer link"),
        }
    }

    fn cleanup_ttl_queue(&mut self) {
        let expired = self
            .ttl_queue
            .purge_expired(&mut self.entries, Instant::now());
        if expired.is_empty() {
            return;
        }

        for key in &expired {
            info!(%key, node = %self.node_id, event = "KEY_EXPIRE", "key expired");
        }
        self.counters.add_value(
            "kvstore.expired_key_vals",
            expired.len() as i64,
            ExportType::Sum,
        );

        let publication = Publication {
            expired_keys: expired,
            ..Default::default()
        };
        self.flood_publication(publication, true, true);
    }

    fn handle_dual_events(&mut self, events: Vec<DualEvent>) {
        for event in events {
            match event {
                DualEvent::Send { peer, messages } => {
                    if self.peers.contains_key(&peer) {
                        self.counters.bump("kvstore.sent_dual_messages");
                        let _ = self.send_to_peer(&peer, false, KvRequest::Dual(messages));
                    } else {
                        debug!(%peer, "dropping dual messages for unknown peer");
                    }
                }
                DualEvent::NexthopChange { root_id, old, new } => {
                    info!(%root_id, ?old, ?new, "spanning tree parent changed");
                    if let Some(new_parent) = new {
                        if new_parent != self.node_id && self.peers.contains_key(&new_parent) {
                            self.send_topo_set(&root_id, &new_parent, true, false);
                            // Sync with the new parent so we are not left
                            // disconnected once the tree carries floods.
                            let _ = self
                                .peers_to_sync_with
                                .entry(new_parent)
                                .or_insert_with(|| {
                                    ExponentialBackoff::new(INITIAL_BACKOFF, MAX_BACKOFF)
                                });
                            if self.full_sync_at.is_none() {
                                self.full_sync_at = Some(Instant::now());
                            }
                        }
                    }
                    if let Some(old_parent) = old {
                        if old_parent != self.node_id && self.peers.contains_key(&old_parent) {
                            self.send_topo_set(&root_id, &old_parent, false, false);
                        }
                    }
                }
            }
        }
    }

    fn send_topo_set(&mut self, root_id: &str, peer: &str, set_child: bool, all_roots: bool) {
        let _ = self.send_to_peer(
            peer,
            false,
            KvRequest::FloodTopoSet(FloodTopoSetParams {
                root_id: root_id.to_owned(),
                src_id: self.node_id.clone(),
                set_child,
                all_roots,
            }),
        );
    }

    fn process_flood_topo_set(&mut self, params: FloodTopoSetParams) {
        if params.all_roots && !params.set_child {
            self.dual.remove_child_all(&params.src_id);
            return;
        }
        if !self.dual.has_dual(&params.root_id) {
            warn!(root = %params.root_id, "flood-topo-set for unknown root, ignoring");
            self.counters.bump("kvstore.unknown_flood_root");
            return;
        }
        let dual = self.dual.dual_mut(&params.root_id).expect("checked above");
        if params.set_child {
            info!(root = %params.root_id, child = %params.src_id, "dual child set");
            dual.add_child(&params.src_id);
        } else {
            info!(root = %params.root_id, child = %params.src_id, "dual child unset");
            dual.remove_child(&params.src_id);
        }
    }

    fn flood_topo_snapshot(&self) -> SptInfos {
        let flood_root_id = self.dual.spt_root_id();
        SptInfos {
            infos: self.dual.infos(),
            counters: self.dual.counters(),
            flood_peers: self
                .flood_peers(flood_root_id.as_deref())
                .into_iter()
                .collect(),
            flood_root_id,
        }
    }

    /// Queues a request on a peer link. `solicit` allocates a response id
    /// so the answer comes back as a link event.
    fn send_to_peer(&mut self, peer: &str, solicit: bool, request: KvRequest) -> bool {
        let id = if solicit {
            self.request_id_counter += 1;
            Some(self.request_id_counter)
        } else {
            None
        };

        let Some(entry) = self.peers.get(peer) else {
            warn!(%peer, "no link for peer");
            return false;
        };

        match entry.link.send(WireMessage::Request { id, request }) {
            Ok(()) => true,
            Err(err) => {
                warn!(%peer, %err, "failed to send to peer");
                self.counters
                    .bump(&format!("kvstore.send_failure.{}.{}", peer, err.tag()));
                false
            }
        }
    }

    fn get_counters(&self) -> BTreeMap<String, i64> {
        self.counters
            .set_gauge("kvstore.num_keys", self.entries.len() as i64);
        self.counters
            .set_gauge("kvstore.num_peers", self.peers.len() as i64);
        self.counters.set_gauge(
            "kvstore.pending_full_sync",
            self.peers_to_sync_with.len() as i64,
        );

        let mut counters = self.counters.snapshot();
        counters.extend(self.dual.counters());
        counters
    }

    fn submit_counters(&self) {
        self.monitor.set_counters("kvstore", self.get_counters());
    }
}

fn split_prefix_list(prefix: &str) -> Vec<String> {
    prefix
        .split(',')
        .filter(|part| !part.is_empty())
        .map(str::to_owned)
        .collect()
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}
