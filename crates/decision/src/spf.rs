//! Shortest-path computation over the link-state databases.
//!
//! Links are usable only when both endpoints report them; overloaded
//! nodes accept traffic but never carry transit. Dijkstra keeps the ECMP
//! union of equal-cost first hops. Loop-free alternates (per-link LFA)
//! and ordered-FIB link holds are computed here as well.

use std::cmp::{self, Reverse};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::net::IpAddr;

use meridian_primitives::{
    AdjacencyDatabase, IpPrefix, NextHop, PrefixDatabase, PrefixEntry, PrefixForwardingAlgo,
    PrefixForwardingType, PrefixType, RouteDatabase, UnicastRoute,
};
use tracing::{debug, trace};

/// Ordered-FIB: how many decrement ticks a new or improved link stays
/// out of the graph, bounded for very large topologies.
const MAX_HOLD_TICKS: u32 = 16;

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct LinkKey {
    local: String,
    remote: String,
    if_name: String,
}

#[derive(Clone, Debug)]
struct Edge {
    remote: String,
    if_name: String,
    metric: i64,
}

/// Distance and ECMP first-hop set for one destination.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SpfNode {
    pub distance: i64,
    pub nexthops: BTreeSet<FirstHop>,
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct FirstHop {
    pub node: String,
    pub if_name: String,
}

pub struct SpfSolver {
    node_name: String,
    enable_v4: bool,
    compute_lfa: bool,
    enable_ordered_fib: bool,
    enable_bgp: bool,

    adj_dbs: BTreeMap<String, AdjacencyDatabase>,
    prefix_dbs: BTreeMap<String, PrefixDatabase>,

    /// SPF results per source, invalidated on any topology change.
    spf_results: BTreeMap<String, BTreeMap<String, SpfNode>>,
    /// Links under ordered-FIB hold, by remaining ticks.
    held_links: BTreeMap<LinkKey, u32>,

    spf_runs: i64,
}

impl SpfSolver {
    pub fn new(
        node_name: &str,
        enable_v4: bool,
        compute_lfa: bool,
        enable_ordered_fib: bool,
        enable_bgp: bool,
    ) -> Self {
        Self {
            node_name: node_name.to_owned(),
            enable_v4,
            compute_lfa,
            enable_ordered_fib,
            enable_bgp,
            adj_dbs: BTreeMap::new(),
            prefix_dbs: BTreeMap::new(),
            spf_results: BTreeMap::new(),
            held_links: BTreeMap::new(),
            spf_runs: 0,
        }
    }

    /// Folds in a node's adjacency database. Returns
    /// `(topology_changed, attributes_changed)`: topology covers the link
    /// set, metrics, and overload bits; attributes cover nexthop
    /// addresses and labels only.
    pub fn update_adjacency_database(&mut self, db: AdjacencyDatabase) -> (bool, bool) {
        let node = db.this_node_name.clone();

        let (topology_changed, attributes_changed) = match self.adj_dbs.get(&node) {
            None => (true, false),
            Some(old) => {
                let topology = link_view(old) != link_view(&db)
                    || old.is_overloaded != db.is_overloaded;
                let attributes = old.node_label != db.node_label
                    || attribute_view(old) != attribute_view(&db);
                (topology, attributes)
            }
        };

        if self.enable_ordered_fib && topology_changed {
            let old = self.adj_dbs.get(&node).cloned();
            if let Some(old) = old {
                self.hold_improved_links(&node, old, &db);
            }
        }

        debug!(
            %node,
            topology_changed,
            attributes_changed,
            adjacencies = db.adjacencies.len(),
            "adjacency database updated"
        );
        let _ = self.adj_dbs.insert(node, db);
        if topology_changed || attributes_changed {
            self.spf_results.clear();
        }
        (topology_changed, attributes_changed)
    }

    /// Holds links that are brand new or whose metric improved; losses
    /// and worsenings take effect immediately.
    fn hold_improved_links(&mut self, node: &str, old: AdjacencyDatabase, new: &AdjacencyDatabase) {
        let old_view = link_view(&old);
        let ticks = cmp::min(MAX_HOLD_TICKS, self.adj_dbs.len() as u32 + 1);

        for adj in &new.adjacencies {
            let key = (adj.other_node_name.clone(), adj.if_name.clone());
            let improved = match old_view.get(&key) {
                None => true,
                Some((old_metric, _)) => adj.metric < *old_metric,
            };
            if improved {
                trace!(local = %node, remote = %adj.other_node_name, ticks, "holding link");
                let _ = self.held_links.insert(
                    LinkKey {
                        local: node.to_owned(),
                        remote: adj.other_node_name.clone(),
                        if_name: adj.if_name.clone(),
                    },
                    ticks,
                );
            }
        }
    }

    pub fn delete_adjacency_database(&mut self, node_name: &str) -> bool {
        let existed = self.adj_dbs.remove(node_name).is_some();
        if existed {
            self.held_links
                .retain(|key, _| key.local != node_name && key.remote != node_name);
            self.spf_results.clear();
        }
        existed
    }

    pub fn adjacency_databases(&self) -> &BTreeMap<String, AdjacencyDatabase> {
        &self.adj_dbs
    }

    /// Returns true when the change can affect the route database.
    pub fn update_prefix_database(&mut self, db: PrefixDatabase) -> bool {
        let node = db.this_node_name.clone();
        let changed = match self.prefix_dbs.get(&node) {
            Some(old) => entry_set(old) != entry_set(&db),
            None => true,
        };
        let _ = self.prefix_dbs.insert(node, db);
        changed
    }

    pub fn delete_prefix_database(&mut self, node_name: &str) -> bool {
        self.prefix_dbs.remove(node_name).is_some()
    }

    pub fn prefix_databases(&self) -> &BTreeMap<String, PrefixDatabase> {
        &self.prefix_dbs
    }

    pub fn has_holds(&self) -> bool {
        !self.held_links.is_empty()
    }

    /// Ticks every hold; returns true when at least one link was
    /// released into the live graph.
    pub fn decrement_holds(&mut self) -> bool {
        let mut released = false;
        self.held_links.retain(|_, ticks| {
            *ticks -= 1;
            if *ticks == 0 {
                released = true;
                false
            } else {
                true
            }
        });
        if released {
            self.spf_results.clear();
        }
        released
    }

    /// Full recompute: SPF from our own perspective (and from each
    /// neighbor when LFA is on), then the route database join.
    pub fn build_paths(&mut self, my_node: &str) -> Option<RouteDatabase> {
        self.spf_results.clear();
        self.run_spf(my_node);

        if self.compute_lfa {
            let neighbors: Vec<String> = self
                .build_graph()
                .get(my_node)
                .map(|edges| edges.iter().map(|edge| edge.remote.clone()).collect())
                .unwrap_or_default();
            for neighbor in neighbors {
                self.run_spf(&neighbor);
            }
        }

        self.build_route_db(my_node)
    }

    /// Joins cached SPF output with the prefix databases. `None` until
    /// this node has announced a prefix database of its own.
    pub fn build_route_db(&mut self, my_node: &str) -> Option<RouteDatabase> {
        if !self.prefix_dbs.contains_key(my_node) {
            return None;
        }
        if !self.spf_results.contains_key(my_node) {
            self.run_spf(my_node);
            if self.compute_lfa {
                let neighbors: Vec<String> = self
                    .build_graph()
                    .get(my_node)
                    .map(|edges| edges.iter().map(|edge| edge.remote.clone()).collect())
                    .unwrap_or_default();
                for neighbor in neighbors {
                    self.run_spf(&neighbor);
                }
            }
        }

        let mut prefix_to_nodes: BTreeMap<IpPrefix, Vec<(String, PrefixEntry)>> = BTreeMap::new();
        for (node, db) in &self.prefix_dbs {
            for entry in &db.prefix_entries {
                prefix_to_nodes
                    .entry(entry.prefix)
                    .or_default()
                    .push((node.clone(), entry.clone()));
            }
        }

        let mut unicast_routes = Vec::new();
        for (prefix, advertisers) in prefix_to_nodes {
            if let Some(route) = self.route_for_prefix(my_node, prefix, &advertisers) {
                unicast_routes.push(route);
            }
        }

        Some(RouteDatabase {
            this_node_name: my_node.to_owned(),
            unicast_routes,
            perf_events: None,
        })
    }

    fn route_for_prefix(
        &self,
        my_node: &str,
        prefix: IpPrefix,
        advertisers: &[(String, PrefixEntry)],
    ) -> Option<UnicastRoute> {
        if prefix.is_v4() && !self.enable_v4 {
            return None;
        }
        let spf = self.spf_results.get(my_node)?;

        let mut candidates: Vec<(&String, &PrefixEntry, i64)> = advertisers
            .iter()
            .filter(|(node, entry)| {
                node.as_str() != my_node
                    && (entry.prefix_type != PrefixType::Bgp || self.enable_bgp)
            })
            .filter_map(|(node, entry)| {
                spf.get(node).map(|result| (node, entry, result.distance))
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        // Best-node set: smallest SPF cost, then the smallest entry
        // tuple among the equal-cost advertisers.
        let best_cost = candidates.iter().map(|(_, _, cost)| *cost).min()?;
        candidates.retain(|(_, _, cost)| *cost == best_cost);
        let best_key = candidates
            .iter()
            .map(|(_, entry, _)| entry.tie_break_key())
            .min()?;
        candidates.retain(|(_, entry, _)| entry.tie_break_key() == best_key);

        let mut nexthops: BTreeSet<NextHop> = BTreeSet::new();
        for (node, entry, cost) in &candidates {
            let push_label = (entry.forwarding_type == PrefixForwardingType::Mpls)
                .then(|| self.adj_dbs.get(*node).map(|db| db.node_label))
                .flatten();

            match entry.forwarding_algo {
                PrefixForwardingAlgo::SpEcmp => {
                    let Some(result) = spf.get(*node) else { continue };
                    for hop in &result.nexthops {
                        if let Some(nexthop) =
                            self.make_nexthop(my_node, hop, prefix, *cost, push_label, false)
                        {
                            let _ = nexthops.insert(nexthop);
                        }
                    }
                    if self.compute_lfa {
                        for (hop, lfa_cost) in self.lfa_alternates(my_node, node) {
                            if let Some(nexthop) = self.make_nexthop(
                                my_node, &hop, prefix, lfa_cost, push_label, true,
                            ) {
                                let _ = nexthops.insert(nexthop);
                            }
                        }
                    }
                }
                PrefixForwardingAlgo::Ksp2EdEcmp => {
                    for (hop, path_cost) in self.ksp2_first_hops(my_node, node) {
                        if let Some(nexthop) =
                            self.make_nexthop(my_node, &hop, prefix, path_cost, push_label, false)
                        {
                            let _ = nexthops.insert(nexthop);
                        }
                    }
                }
            }
        }

        if nexthops.is_empty() {
            return None;
        }
        Some(UnicastRoute {
            dest: prefix,
            nexthops: nexthops.into_iter().collect(),
        })
    }

    fn make_nexthop(
        &self,
        my_node: &str,
        hop: &FirstHop,
        prefix: IpPrefix,
        metric: i64,
        push_label: Option<i32>,
        is_lfa: bool,
    ) -> Option<NextHop> {
        let address = self.adj_dbs.get(my_node).and_then(|db| {
            db.adjacencies
                .iter()
                .find(|adj| adj.other_node_name == hop.node && adj.if_name == hop.if_name)
                .and_then(|adj| nexthop_address(adj.nexthop_v4, adj.nexthop_v6, prefix))
        });
        Some(NextHop {
            node: hop.node.clone(),
            if_name: hop.if_name.clone(),
            address,
            metric,
            push_label,
            is_lfa,
        })
    }

    /// Per-link LFA (RFC 5286): neighbor N protects destination D iff
    /// `d(N, D) < d(N, S) + d(S, D)`.
    fn lfa_alternates(&self, my_node: &str, dest: &str) -> Vec<(FirstHop, i64)> {
        let mut alternates = Vec::new();
        let Some(spf_s) = self.spf_results.get(my_node) else {
            return alternates;
        };
        let Some(dest_result) = spf_s.get(dest) else {
            return alternates;
        };
        let d_sd = dest_result.distance;
        let primaries: BTreeSet<&String> =
            dest_result.nexthops.iter().map(|hop| &hop.node).collect();

        let graph = self.build_graph();
        let Some(edges) = graph.get(my_node) else {
            return alternates;
        };

        for edge in edges {
            if primaries.contains(&edge.remote) {
                continue;
            }
            let Some(spf_n) = self.spf_results.get(&edge.remote) else {
                continue;
            };
            let (Some(n_to_d), Some(n_to_s)) = (spf_n.get(dest), spf_n.get(my_node)) else {
                continue;
            };
            if n_to_d.distance < n_to_s.distance.saturating_add(d_sd) {
                alternates.push((
                    FirstHop {
                        node: edge.remote.clone(),
                        if_name: edge.if_name.clone(),
                    },
                    edge.metric.saturating_add(n_to_d.distance),
                ));
            }
        }
        alternates
    }

    /// First hops of the two edge-disjoint shortest paths to `dest`: the
    /// shortest path, then the shortest path in the graph with the first
    /// path's edges erased.
    fn ksp2_first_hops(&self, source: &str, dest: &str) -> Vec<(FirstHop, i64)> {
        let graph = self.build_graph();
        let mut hops = Vec::new();

        let Some((first_path, first_cost)) = shortest_path(&graph, source, dest) else {
            return hops;
        };
        if let Some(hop) = first_hop_of(&graph, &first_path) {
            hops.push((hop, first_cost));
        }

        let mut pruned = graph.clone();
        for pair in first_path.windows(2) {
            remove_edge(&mut pruned, &pair[0], &pair[1]);
            remove_edge(&mut pruned, &pair[1], &pair[0]);
        }
        if let Some((second_path, second_cost)) = shortest_path(&pruned, source, dest) {
            if let Some(hop) = first_hop_of(&pruned, &second_path) {
                hops.push((hop, second_cost));
            }
        }

        hops
    }

    fn run_spf(&mut self, source: &str) {
        if self.spf_results.contains_key(source) {
            return;
        }
        let graph = self.build_graph();
        let result = self.dijkstra(source, &graph);
        self.spf_runs += 1;
        let _ = self.spf_results.insert(source.to_owned(), result);
    }

    /// Directed usable links: reported by both endpoints, not overloaded,
    /// not under an ordered-FIB hold.
    fn build_graph(&self) -> BTreeMap<String, Vec<Edge>> {
        let mut graph: BTreeMap<String, Vec<Edge>> = BTreeMap::new();

        for (node, db) in &self.adj_dbs {
            for adj in &db.adjacencies {
                if adj.is_overloaded {
                    continue;
                }
                let reverse_reported = self
                    .adj_dbs
                    .get(&adj.other_node_name)
                    .is_some_and(|remote| {
                        remote
                            .adjacencies
                            .iter()
                            .any(|back| back.other_node_name == *node && !back.is_overloaded)
                    });
                if !reverse_reported {
                    continue;
                }
                let held = self.held_links.contains_key(&LinkKey {
                    local: node.clone(),
                    remote: adj.other_node_name.clone(),
                    if_name: adj.if_name.clone(),
                });
                if held {
                    continue;
                }
                graph.entry(node.clone()).or_default().push(Edge {
                    remote: adj.other_node_name.clone(),
                    if_name: adj.if_name.clone(),
                    // Zero or negative metrics would break ECMP settlement.
                    metric: cmp::max(1, adj.metric),
                });
            }
        }

        graph
    }

    fn dijkstra(&self, source: &str, graph: &BTreeMap<String, Vec<Edge>>) -> BTreeMap<String, SpfNode> {
        let mut results: BTreeMap<String, SpfNode> = BTreeMap::new();
        let _ = results.insert(source.to_owned(), SpfNode::default());

        let mut heap: BinaryHeap<Reverse<(i64, String)>> = BinaryHeap::new();
        heap.push(Reverse((0, source.to_owned())));
        let mut settled: BTreeSet<String> = BTreeSet::new();

        while let Some(Reverse((distance, node))) = heap.pop() {
            if !settled.insert(node.clone()) {
                continue;
            }
            // Overloaded nodes terminate paths but never extend them.
            if node != source
                && self
                    .adj_dbs
                    .get(&node)
                    .is_some_and(|db| db.is_overloaded)
            {
                continue;
            }

            let Some(edges) = graph.get(&node) else {
                continue;
            };
            for edge in edges {
                let next_distance = distance.saturating_add(edge.metric);
                let hop_set: BTreeSet<FirstHop> = if node == source {
                    let mut set = BTreeSet::new();
                    let _ = set.insert(FirstHop {
                        node: edge.remote.clone(),
                        if_name: edge.if_name.clone(),
                    });
                    set
                } else {
                    results
                        .get(&node)
                        .map(|result| result.nexthops.clone())
                        .unwrap_or_default()
                };

                match results.get_mut(&edge.remote) {
                    None => {
                        let _ = results.insert(
                            edge.remote.clone(),
                            SpfNode {
                                distance: next_distance,
                                nexthops: hop_set,
                            },
                        );
                        heap.push(Reverse((next_distance, edge.remote.clone())));
                    }
                    Some(existing) if next_distance < existing.distance => {
                        existing.distance = next_distance;
                        existing.nexthops = hop_set;
                        heap.push(Reverse((next_distance, edge.remote.clone())));
                    }
                    Some(existing) if next_distance == existing.distance => {
                        // Equal cost: take the ECMP union of first hops.
                        existing.nexthops.extend(hop_set);
                    }
                    Some(_) => {}
                }
            }
        }

        results
    }

    pub fn counters(&self) -> BTreeMap<String, i64> {
        let mut counters = BTreeMap::new();
        let _ = counters.insert("decision.spf_runs".to_owned(), self.spf_runs);
        let _ = counters.insert(
            "decision.num_nodes".to_owned(),
            self.adj_dbs.len() as i64,
        );
        let _ = counters.insert(
            "decision.num_prefix_dbs".to_owned(),
            self.prefix_dbs.len() as i64,
        );
        let _ = counters.insert(
            "decision.held_links".to_owned(),
            self.held_links.len() as i64,
        );
        counters
    }
}

/// Topology view of a database: links keyed by (remote, ifname) with
/// their metric and overload bit.
fn link_view(db: &AdjacencyDatabase) -> BTreeMap<(String, String), (i64, bool)> {
    db.adjacencies
        .iter()
        .map(|adj| {
            (
                (adj.other_node_name.clone(), adj.if_name.clone()),
                (adj.metric, adj.is_overloaded),
            )
        })
        .collect()
}

/// Attribute view: nexthop addresses and labels only.
fn attribute_view(
    db: &AdjacencyDatabase,
) -> BTreeMap<(String, String), (Option<IpAddr>, Option<IpAddr>, i32)> {
    db.adjacencies
        .iter()
        .map(|adj| {
            (
                (adj.other_node_name.clone(), adj.if_name.clone()),
                (adj.nexthop_v4, adj.nexthop_v6, adj.adj_label),
            )
        })
        .collect()
}

fn entry_set(db: &PrefixDatabase) -> BTreeSet<PrefixEntry> {
    db.prefix_entries.iter().cloned().collect()
}

fn nexthop_address(
    nexthop_v4: Option<IpAddr>,
    nexthop_v6: Option<IpAddr>,
    prefix: IpPrefix,
) -> Option<IpAddr> {
    if prefix.is_v4() {
        nexthop_v4
    } else {
        nexthop_v6
    }
}

/// Single shortest path as a node list, ties broken toward the
/// lexicographically smallest predecessor.
fn shortest_path(
    graph: &BTreeMap<String, Vec<Edge>>,
    source: &str,
    dest: &str,
) -> Option<(Vec<String>, i64)> {
    let mut distance: BTreeMap<String, i64> = BTreeMap::new();
    let mut predecessor: BTreeMap<String, String> = BTreeMap::new();
    let mut settled: BTreeSet<String> = BTreeSet::new();
    let mut heap: BinaryHeap<Reverse<(i64, String)>> = BinaryHeap::new();

    let _ = distance.insert(source.to_owned(), 0);
    heap.push(Reverse((0, source.to_owned())));

    while let Some(Reverse((dist, node))) = heap.pop() {
        if !settled.insert(node.clone()) {
            continue;
        }
        let Some(edges) = graph.get(&node) else {
            continue;
        };
        for edge in edges {
            let next = dist.saturating_add(edge.metric);
            let better = match distance.get(&edge.remote) {
                None => true,
                Some(existing) if next < *existing => true,
                Some(existing) if next == *existing => predecessor
                    .get(&edge.remote)
                    .is_some_and(|pred| node < *pred),
                Some(_) => false,
            };
            if better {
                let _ = distance.insert(edge.remote.clone(), next);
                let _ = predecessor.insert(edge.remote.clone(), node.clone());
                heap.push(Reverse((next, edge.remote.clone())));
            }
        }
    }

    let total = *distance.get(dest)?;
    let mut path = vec![dest.to_owned()];
    let mut cursor = dest.to_owned();
    while cursor != source {
        cursor = predecessor.get(&cursor)?.clone();
        path.push(cursor.clone());
    }
    path.reverse();
    Some((path, total))
}

fn first_hop_of(graph: &BTreeMap<String, Vec<Edge>>, path: &[String]) -> Option<FirstHop> {
    let source = path.first()?;
    let next = path.get(1)?;
    graph
        .get(source)?
        .iter()
        .filter(|edge| edge.remote == *next)
        .min_by_key(|edge| edge.metric)
        .map(|edge| FirstHop {
            node: edge.remote.clone(),
            if_name: edge.if_name.clone(),
        })
}

fn remove_edge(graph: &mut BTreeMap<String, Vec<Edge>>, from: &str, to: &str) {
    if let Some(edges) = graph.get_mut(from) {
        edges.retain(|edge| edge.remote != to);
    }
}

#[cfg(test)]
#[path = "spf_tests.rs"]
mod spf_tests;
