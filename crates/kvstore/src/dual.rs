//! Diffusing update algorithm for flood optimization.
//!
//! Every flood root anchors one computation; each node tracks, per root,
//! its distance, its spanning-tree parent (nexthop), and the children
//! that chose it as parent. A node with a feasible successor switches
//! parents passively; losing the route without one sends the computation
//! Active, querying every neighbor and returning Passive once all replies
//! are in. Only Passive computations expose spanning-tree peers.
//!
//! The state machine owns no sockets: it emits [`DualEvent`]s the owning
//! loop turns into wire messages and `FLOOD_TOPO_SET` commands.

use std::collections::{BTreeMap, BTreeSet};

use meridian_primitives::{DualMessage, DualMessageKind, DualMessages, SptInfo};
use tracing::{debug, info, warn};

/// Unreachable.
pub const DISTANCE_INFINITY: i64 = i64::MAX;

/// What the owning loop must do on behalf of the state machine.
#[derive(Debug)]
pub enum DualEvent {
    /// Send `messages` to `peer` over its command channel.
    Send {
        peer: String,
        messages: DualMessages,
    },
    /// The spanning-tree parent for `root_id` moved; tell the new parent
    /// to adopt us and the old one to drop us.
    NexthopChange {
        root_id: String,
        old: Option<String>,
        new: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DualState {
    Passive,
    Active,
}

/// Shared read-only view handed into per-root computations.
struct Ctx<'a> {
    node_id: &'a str,
    neighbors: &'a BTreeMap<String, i64>,
}

/// One per-root computation.
#[derive(Debug)]
pub struct Dual {
    root_id: String,
    state: DualState,
    distance: i64,
    /// Feasibility bound: a neighbor reporting below this can be adopted
    /// as successor without diffusing.
    feasible_distance: i64,
    nexthop: Option<String>,
    /// Latest distance each neighbor reported for this root.
    reports: BTreeMap<String, i64>,
    children: BTreeSet<String>,
    awaiting_replies: BTreeSet<String>,
}

impl Dual {
    fn new(root_id: String) -> Self {
        Self {
            root_id,
            state: DualState::Passive,
            distance: DISTANCE_INFINITY,
            feasible_distance: DISTANCE_INFINITY,
            nexthop: None,
            reports: BTreeMap::new(),
            children: BTreeSet::new(),
            awaiting_replies: BTreeSet::new(),
        }
    }

    fn new_self_root(root_id: String) -> Self {
        let nexthop = Some(root_id.clone());
        Self {
            root_id: root_id.clone(),
            state: DualState::Passive,
            distance: 0,
            feasible_distance: 0,
            nexthop,
            reports: BTreeMap::new(),
            children: BTreeSet::new(),
            awaiting_replies: BTreeSet::new(),
        }
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn state(&self) -> DualState {
        self.state
    }

    pub fn distance(&self) -> i64 {
        self.distance
    }

    pub fn nexthop(&self) -> Option<&str> {
        self.nexthop.as_deref()
    }

    pub fn add_child(&mut self, child: &str) {
        let _ = self.children.insert(child.to_owned());
    }

    pub fn remove_child(&mut self, child: &str) {
        let _ = self.children.remove(child);
    }

    pub fn children(&self) -> &BTreeSet<String> {
        &self.children
    }

    pub fn info(&self) -> SptInfo {
        SptInfo {
            passive: self.state == DualState::Passive,
            cost: self.distance,
            parent: self.nexthop.clone(),
            children: self.children.clone(),
        }
    }

    /// Cheapest route via any neighbor, feasibility ignored.
    fn best_route(&self, ctx: &Ctx<'_>) -> (i64, Option<String>) {
        let mut best = (DISTANCE_INFINITY, None);
        for (neighbor, cost) in ctx.neighbors {
            let Some(report) = self.reports.get(neighbor) else {
                continue;
            };
            if *report == DISTANCE_INFINITY {
                continue;
            }
            let via = report.saturating_add(*cost);
            if via < best.0 {
                best = (via, Some(neighbor.clone()));
            }
        }
        best
    }

    /// Cheapest route via a feasible successor (one reporting a distance
    /// strictly below our feasibility bound).
    fn feasible_route(&self, ctx: &Ctx<'_>) -> Option<(i64, String)> {
        let mut best: Option<(i64, String)> = None;
        for (neighbor, cost) in ctx.neighbors {
            let Some(report) = self.reports.get(neighbor) else {
                continue;
            };
            if *report >= self.feasible_distance {
                continue;
            }
            let via = report.saturating_add(*cost);
            if best.as_ref().is_none_or(|(d, _)| via < *d) {
                best = Some((via, neighbor.clone()));
            }
        }
        best
    }

    fn is_self_root(&self, ctx: &Ctx<'_>) -> bool {
        self.root_id == ctx.node_id
    }

    /// Re-evaluates the route after a report change. Passive only; an
    /// Active computation waits for its diffusion to complete.
    fn local_compute(&mut self, ctx: &Ctx<'_>, out: &mut Vec<DualEvent>) {
        if self.is_self_root(ctx) || self.state == DualState::Active {
            return;
        }

        let old_distance = self.distance;
        let old_nexthop = self.nexthop.clone();

        match self.feasible_route(ctx) {
            Some((distance, via)) => {
                self.distance = distance;
                self.nexthop = Some(via);
                self.feasible_distance = self.feasible_distance.min(distance);
            }
            None => {
                let (best, via) = self.best_route(ctx);
                if via.is_none() {
                    // Nobody offers a route at all.
                    self.distance = DISTANCE_INFINITY;
                    self.feasible_distance = DISTANCE_INFINITY;
                    self.nexthop = None;
                } else {
                    self.start_diffusion(ctx, best, via, out);
                }
            }
        }

        self.emit_changes(ctx, old_distance, old_nexthop, out);
    }

    fn start_diffusion(
        &mut self,
        ctx: &Ctx<'_>,
        distance: i64,
        via: Option<String>,
        out: &mut Vec<DualEvent>,
    ) {
        debug!(root = %self.root_id, distance, "going active");
        self.state = DualState::Active;
        self.distance = distance;
        self.nexthop = via;
        self.awaiting_replies = ctx.neighbors.keys().cloned().collect();

        for neighbor in ctx.neighbors.keys() {
            out.push(send_one(
                neighbor,
                ctx.node_id,
                &self.root_id,
                DualMessageKind::Query,
                self.distance,
            ));
        }

        if self.awaiting_replies.is_empty() {
            self.finish_diffusion(ctx, out);
        }
    }

    fn finish_diffusion(&mut self, ctx: &Ctx<'_>, out: &mut Vec<DualEvent>) {
        debug!(root = %self.root_id, "diffusion complete, back to passive");
        self.state = DualState::Passive;
        // All replies are in: any successor may be adopted.
        self.feasible_distance = DISTANCE_INFINITY;
        self.local_compute(ctx, out);
    }

    fn emit_changes(
        &mut self,
        ctx: &Ctx<'_>,
        old_distance: i64,
        old_nexthop: Option<String>,
        out: &mut Vec<DualEvent>,
    ) {
        if self.nexthop != old_nexthop {
            out.push(DualEvent::NexthopChange {
                root_id: self.root_id.clone(),
                old: old_nexthop,
                new: self.nexthop.clone(),
            });
        }
        if self.distance != old_distance {
            for neighbor in ctx.neighbors.keys() {
                out.push(send_one(
                    neighbor,
                    ctx.node_id,
                    &self.root_id,
                    DualMessageKind::Update,
                    self.distance,
                ));
            }
        }
    }

    fn process_update(&mut self, ctx: &Ctx<'_>, from: &str, distance: i64, out: &mut Vec<DualEvent>) {
        let _ = self.reports.insert(from.to_owned(), distance);
        self.local_compute(ctx, out);
    }

    fn process_query(&mut self, ctx: &Ctx<'_>, from: &str, distance: i64, out: &mut Vec<DualEvent>) {
        let _ = self.reports.insert(from.to_owned(), distance);
        self.local_compute(ctx, out);
        // Reply regardless of state; a full SIA treatment is not needed
        // for tree forming, the naive-flood fallback covers stalls.
        out.push(send_one(
            from,
            ctx.node_id,
            &self.root_id,
            DualMessageKind::Reply,
            self.distance,
        ));
    }

    fn process_reply(&mut self, ctx: &Ctx<'_>, from: &str, distance: i64, out: &mut Vec<DualEvent>) {
        let _ = self.reports.insert(from.to_owned(), distance);
        if self.state == DualState::Active {
            let _ = self.awaiting_replies.remove(from);
            if self.awaiting_replies.is_empty() {
                self.finish_diffusion(ctx, out);
            }
        } else {
            self.local_compute(ctx, out);
        }
    }

    fn on_neighbor_lost(&mut self, ctx: &Ctx<'_>, peer: &str, out: &mut Vec<DualEvent>) {
        let _ = self.reports.remove(peer);
        let _ = self.children.remove(peer);

        match self.state {
            DualState::Active => {
                let _ = self.awaiting_replies.remove(peer);
                if self.awaiting_replies.is_empty() {
                    self.finish_diffusion(ctx, out);
                }
            }
            DualState::Passive => {
                if self.nexthop.as_deref() == Some(peer) {
                    self.local_compute(ctx, out);
                }
            }
        }
    }
}

fn send_one(
    peer: &str,
    src_id: &str,
    root_id: &str,
    kind: DualMessageKind,
    distance: i64,
) -> DualEvent {
    DualEvent::Send {
        peer: peer.to_owned(),
        messages: DualMessages {
            src_id: src_id.to_owned(),
            messages: vec![DualMessage {
                root_id: root_id.to_owned(),
                kind,
                distance,
            }],
        },
    }
}

/// All per-root computations of one node plus its neighbor set.
#[derive(Debug)]
pub struct DualNode {
    node_id: String,
    neighbors: BTreeMap<String, i64>,
    duals: BTreeMap<String, Dual>,
    counters: BTreeMap<String, i64>,
}

impl DualNode {
    pub fn new(node_id: &str, is_root: bool) -> Self {
        let mut duals = BTreeMap::new();
        if is_root {
            let _ = duals.insert(node_id.to_owned(), Dual::new_self_root(node_id.to_owned()));
        }
        Self {
            node_id: node_id.to_owned(),
            neighbors: BTreeMap::new(),
            duals,
            counters: BTreeMap::new(),
        }
    }

    pub fn peer_up(&mut self, peer: &str, cost: i64, out: &mut Vec<DualEvent>) {
        info!(%peer, cost, "dual peer up");
        let _ = self.neighbors.insert(peer.to_owned(), cost);
        *self.counters.entry("dual.peer_up".to_owned()).or_insert(0) += 1;

        // Advertise every known root to the new neighbor so it can fold
        // us into its computations.
        for dual in self.duals.values() {
            out.push(send_one(
                peer,
                &self.node_id,
                &dual.root_id,
                DualMessageKind::Update,
                dual.distance,
            ));
        }
    }

    pub fn peer_down(&mut self, peer: &str, out: &mut Vec<DualEvent>) {
        info!(%peer, "dual peer down");
        let _ = self.neighbors.remove(peer);
        *self.counters.entry("dual.peer_down".to_owned()).or_insert(0) += 1;

        let ctx = Ctx {
            node_id: &self.node_id,
            neighbors: &self.neighbors,
        };
        for dual in self.duals.values_mut() {
            dual.on_neighbor_lost(&ctx, peer, out);
        }
    }

    /// Feeds a neighbor's message batch through the per-root machines.
    pub fn process_messages(&mut self, messages: DualMessages, out: &mut Vec<DualEvent>) {
        let from = messages.src_id;
        if !self.neighbors.contains_key(&from) {
            warn!(%from, "dual messages from unknown neighbor, ignoring");
            *self
                .counters
                .entry("dual.unknown_neighbor".to_owned())
                .or_insert(0) += 1;
            return;
        }

        let ctx = Ctx {
            node_id: &self.node_id,
            neighbors: &self.neighbors,
        };
        for message in messages.messages {
            let counter = match message.kind {
                DualMessageKind::Update => "dual.rcvd_updates",
                DualMessageKind::Query => "dual.rcvd_queries",
                DualMessageKind::Reply => "dual.rcvd_replies",
            };
            *self.counters.entry(counter.to_owned()).or_insert(0) += 1;

            let dual = self
                .duals
                .entry(message.root_id.clone())
                .or_insert_with(|| Dual::new(message.root_id.clone()));
            match message.kind {
                DualMessageKind::Update => dual.process_update(&ctx, &from, message.distance, out),
                DualMessageKind::Query => dual.process_query(&ctx, &from, message.distance, out),
                DualMessageKind::Reply => dual.process_reply(&ctx, &from, message.distance, out),
            }
        }
    }

    /// The elected flood root: the smallest root id with a live Passive
    /// computation. `None` falls back to naive flooding.
    pub fn spt_root_id(&self) -> Option<String> {
        self.duals
            .values()
            .find(|dual| dual.state == DualState::Passive && dual.distance < DISTANCE_INFINITY)
            .map(|dual| dual.root_id.clone())
    }

    /// Spanning-tree peers for a root: its parent plus the children that
    /// adopted us. Empty while Active or for unknown roots.
    pub fn spt_peers(&self, root_id: &str) -> BTreeSet<String> {
        let Some(dual) = self.duals.get(root_id) else {
            return BTreeSet::new();
        };
        if dual.state != DualState::Passive {
            return BTreeSet::new();
        }
        let mut peers = dual.children.clone();
        if let Some(nexthop) = &dual.nexthop {
            if nexthop != &self.node_id {
                let _ = peers.insert(nexthop.clone());
            }
        }
        peers
    }

    pub fn has_dual(&self, root_id: &str) -> bool {
        self.duals.contains_key(root_id)
    }

    pub fn dual_mut(&mut self, root_id: &str) -> Option<&mut Dual> {
        self.duals.get_mut(root_id)
    }

    /// Drops `child` from every root's child set.
    pub fn remove_child_all(&mut self, child: &str) {
        for dual in self.duals.values_mut() {
            dual.remove_child(child);
        }
    }

    pub fn infos(&self) -> BTreeMap<String, SptInfo> {
        self.duals
            .iter()
            .map(|(root_id, dual)| (root_id.clone(), dual.info()))
            .collect()
    }

    pub fn counters(&self) -> BTreeMap<String, i64> {
        self.counters.clone()
    }
}

#[cfg(test)]
#[path = "dual_tests.rs"]
mod dual_tests;
