use meridian_primitives::{
    Adjacency, AdjacencyDatabase, PrefixDatabase, PrefixEntry, PrefixForwardingAlgo,
    PrefixForwardingType,
};

use super::*;

fn adjacency(other: &str, metric: i64) -> Adjacency {
    Adjacency {
        other_node_name: other.to_owned(),
        if_name: format!("if-{other}"),
        metric,
        adj_label: 0,
        nexthop_v4: None,
        nexthop_v6: None,
        is_overloaded: false,
    }
}

fn adj_db(node: &str, links: &[(&str, i64)]) -> AdjacencyDatabase {
    AdjacencyDatabase {
        this_node_name: node.to_owned(),
        is_overloaded: false,
        adjacencies: links
            .iter()
            .map(|(other, metric)| adjacency(other, *metric))
            .collect(),
        node_label: i32::from(node.as_bytes()[0] - b'a' + 1),
        perf_events: None,
    }
}

fn prefix_db(node: &str, prefixes: &[&str]) -> PrefixDatabase {
    PrefixDatabase {
        this_node_name: node.to_owned(),
        prefix_entries: prefixes
            .iter()
            .map(|prefix| PrefixEntry::new(prefix.parse().expect("prefix")))
            .collect(),
        perf_events: None,
    }
}

/// Diamond: s-a, s-b, a-d, b-d, all cost 1; d advertises a prefix.
fn diamond(solver: &mut SpfSolver) {
    let _ = solver.update_adjacency_database(adj_db("s", &[("a", 1), ("b", 1)]));
    let _ = solver.update_adjacency_database(adj_db("a", &[("s", 1), ("d", 1)]));
    let _ = solver.update_adjacency_database(adj_db("b", &[("s", 1), ("d", 1)]));
    let _ = solver.update_adjacency_database(adj_db("d", &[("a", 1), ("b", 1)]));
    let _ = solver.update_prefix_database(prefix_db("s", &["fc00:5::/64"]));
    let _ = solver.update_prefix_database(prefix_db("d", &["fc00:d::/64"]));
}

#[test]
fn ecmp_yields_both_first_hops() {
    let mut solver = SpfSolver::new("s", false, false, false, false);
    diamond(&mut solver);

    let routes = solver.build_paths("s").expect("route database");
    let route = routes
        .unicast_routes
        .iter()
        .find(|route| route.dest.to_string() == "fc00:d::/64")
        .expect("route to d");

    let mut hops: Vec<&str> = route.nexthops.iter().map(|hop| hop.node.as_str()).collect();
    hops.sort_unstable();
    assert_eq!(hops, vec!["a", "b"]);
    assert!(route.nexthops.iter().all(|hop| hop.metric == 2));
}

#[test]
fn no_route_database_without_own_prefix_db() {
    let mut solver = SpfSolver::new("s", false, false, false, false);
    let _ = solver.update_adjacency_database(adj_db("s", &[("a", 1)]));
    let _ = solver.update_adjacency_database(adj_db("a", &[("s", 1)]));
    let _ = solver.update_prefix_database(prefix_db("a", &["fc00:a::/64"]));
    // We have not announced a prefix database of our own yet.
    assert!(solver.build_paths("x").is_none());
}

#[test]
fn one_way_adjacencies_are_not_used() {
    let mut solver = SpfSolver::new("s", false, false, false, false);
    let _ = solver.update_adjacency_database(adj_db("s", &[("a", 1)]));
    // "a" never reports the link back.
    let _ = solver.update_adjacency_database(adj_db("a", &[]));
    let _ = solver.update_prefix_database(prefix_db("s", &[]));
    let _ = solver.update_prefix_database(prefix_db("a", &["fc00:a::/64"]));

    let routes = solver.build_paths("s").expect("route database");
    assert!(routes.unicast_routes.is_empty());
}

#[test]
fn overloaded_nodes_do_not_carry_transit() {
    let mut solver = SpfSolver::new("s", false, false, false, false);
    let _ = solver.update_adjacency_database(adj_db("s", &[("a", 1), ("b", 10)]));
    let mut a = adj_db("a", &[("s", 1), ("d", 1)]);
    a.is_overloaded = true;
    let _ = solver.update_adjacency_database(a);
    let _ = solver.update_adjacency_database(adj_db("b", &[("s", 10), ("d", 1)]));
    let _ = solver.update_adjacency_database(adj_db("d", &[("a", 1), ("b", 1)]));
    let _ = solver.update_prefix_database(prefix_db("s", &[]));
    let _ = solver.update_prefix_database(prefix_db("d", &["fc00:d::/64"]));

    let routes = solver.build_paths("s").expect("route database");
    let route = &routes.unicast_routes[0];
    // The cheap path through the overloaded node is off the table.
    assert_eq!(route.nexthops.len(), 1);
    assert_eq!(route.nexthops[0].node, "b");
    assert_eq!(route.nexthops[0].metric, 11);
}

#[test]
fn v4_prefixes_are_gated_by_the_flag() {
    let mut gated = SpfSolver::new("s", false, false, false, false);
    let _ = gated.update_adjacency_database(adj_db("s", &[("a", 1)]));
    let _ = gated.update_adjacency_database(adj_db("a", &[("s", 1)]));
    let _ = gated.update_prefix_database(prefix_db("s", &[]));
    let _ = gated.update_prefix_database(prefix_db("a", &["10.1.0.0/16"]));
    assert!(gated
        .build_paths("s")
        .expect("route database")
        .unicast_routes
        .is_empty());

    let mut enabled = SpfSolver::new("s", true, false, false, false);
    let _ = enabled.update_adjacency_database(adj_db("s", &[("a", 1)]));
    let _ = enabled.update_adjacency_database(adj_db("a", &[("s", 1)]));
    let _ = enabled.update_prefix_database(prefix_db("s", &[]));
    let _ = enabled.update_prefix_database(prefix_db("a", &["10.1.0.0/16"]));
    assert_eq!(
        enabled
            .build_paths("s")
            .expect("route database")
            .unicast_routes
            .len(),
        1
    );
}

#[test]
fn lfa_adds_a_loop_free_alternate() {
    // s-a-d is the short way; s-b-d is loop free but more expensive.
    let mut solver = SpfSolver::new("s", false, true, false, false);
    let _ = solver.update_adjacency_database(adj_db("s", &[("a", 1), ("b", 2)]));
    let _ = solver.update_adjacency_database(adj_db("a", &[("s", 1), ("d", 1)]));
    let _ = solver.update_adjacency_database(adj_db("b", &[("s", 2), ("d", 2)]));
    let _ = solver.update_adjacency_database(adj_db("d", &[("a", 1), ("b", 2)]));
    let _ = solver.update_prefix_database(prefix_db("s", &[]));
    let _ = solver.update_prefix_database(prefix_db("d", &["fc00:d::/64"]));

    let routes = solver.build_paths("s").expect("route database");
    let route = &routes.unicast_routes[0];

    let primary: Vec<_> = route.nexthops.iter().filter(|hop| !hop.is_lfa).collect();
    let alternates: Vec<_> = route.nexthops.iter().filter(|hop| hop.is_lfa).collect();
    assert_eq!(primary.len(), 1);
    assert_eq!(primary[0].node, "a");
    assert_eq!(alternates.len(), 1);
    assert_eq!(alternates[0].node, "b");
    // d(b, d) = 2 < d(b, s) + d(s, d) = 4, at total cost 4 through b.
    assert_eq!(alternates[0].metric, 4);
}

#[test]
fn mpls_prefixes_carry_the_advertisers_label() {
    let mut solver = SpfSolver::new("s", false, false, false, false);
    let _ = solver.update_adjacency_database(adj_db("s", &[("a", 1)]));
    let _ = solver.update_adjacency_database(adj_db("a", &[("s", 1)]));
    let _ = solver.update_prefix_database(prefix_db("s", &[]));

    let mut db = prefix_db("a", &["fc00:a::/64"]);
    db.prefix_entries[0].forwarding_type = PrefixForwardingType::Mpls;
    let _ = solver.update_prefix_database(db);

    let routes = solver.build_paths("s").expect("route database");
    let route = &routes.unicast_routes[0];
    assert_eq!(route.nexthops[0].push_label, Some(1));
}

#[test]
fn ksp2_emits_two_edge_disjoint_paths() {
    let mut solver = SpfSolver::new("s", false, false, false, false);
    let _ = solver.update_adjacency_database(adj_db("s", &[("a", 1), ("b", 2)]));
    let _ = solver.update_adjacency_database(adj_db("a", &[("s", 1), ("d", 1)]));
    let _ = solver.update_adjacency_database(adj_db("b", &[("s", 2), ("d", 2)]));
    let _ = solver.update_adjacency_database(adj_db("d", &[("a", 1), ("b", 2)]));
    let _ = solver.update_prefix_database(prefix_db("s", &[]));

    let mut db = prefix_db("d", &["fc00:d::/64"]);
    db.prefix_entries[0].forwarding_algo = PrefixForwardingAlgo::Ksp2EdEcmp;
    let _ = solver.update_prefix_database(db);

    let routes = solver.build_paths("s").expect("route database");
    let route = &routes.unicast_routes[0];

    let mut hops: Vec<(&str, i64)> = route
        .nexthops
        .iter()
        .map(|hop| (hop.node.as_str(), hop.metric))
        .collect();
    hops.sort_unstable();
    assert_eq!(hops, vec![("a", 2), ("b", 4)]);
}

#[test]
fn update_flags_distinguish_topology_from_attributes() {
    let mut solver = SpfSolver::new("s", false, false, false, false);
    assert_eq!(
        solver.update_adjacency_database(adj_db("s", &[("a", 1)])),
        (true, false)
    );
    // Same database again: nothing changed.
    assert_eq!(
        solver.update_adjacency_database(adj_db("s", &[("a", 1)])),
        (false, false)
    );
    // Metric change is topology.
    assert_eq!(
        solver.update_adjacency_database(adj_db("s", &[("a", 5)])),
        (true, false)
    );
    // Label change is attributes only.
    let mut relabeled = adj_db("s", &[("a", 5)]);
    relabeled.adjacencies[0].adj_label = 777;
    assert_eq!(
        solver.update_adjacency_database(relabeled),
        (false, true)
    );
}

#[test]
fn ordered_fib_holds_delay_improved_links() {
    let mut solver = SpfSolver::new("s", false, false, true, false);
    let _ = solver.update_adjacency_database(adj_db("s", &[("a", 10)]));
    let _ = solver.update_adjacency_database(adj_db("a", &[("s", 10)]));
    let _ = solver.update_prefix_database(prefix_db("s", &[]));
    let _ = solver.update_prefix_database(prefix_db("a", &["fc00:a::/64"]));

    let routes = solver.build_paths("s").expect("route database");
    assert_eq!(routes.unicast_routes[0].nexthops[0].metric, 10);
    assert!(!solver.has_holds());

    // The link gets cheaper: held until the ordered-FIB ticks elapse.
    let _ = solver.update_adjacency_database(adj_db("s", &[("a", 2)]));
    assert!(solver.has_holds());
    let routes = solver.build_paths("s").expect("route database");
    // While held the link is out of the graph entirely.
    assert!(routes.unicast_routes.is_empty());

    while solver.has_holds() {
        let _ = solver.decrement_holds();
    }
    let routes = solver.build_paths("s").expect("route database");
    assert_eq!(routes.unicast_routes[0].nexthops[0].metric, 2);
}

#[test]
fn deleting_an_adjacency_database_changes_the_graph() {
    let mut solver = SpfSolver::new("s", false, false, false, false);
    diamond(&mut solver);
    let _ = solver.build_paths("s").expect("route database");

    assert!(solver.delete_adjacency_database("a"));
    assert!(!solver.delete_adjacency_database("a"));

    let routes = solver.build_paths("s").expect("route database");
    let route = routes
        .unicast_routes
        .iter()
        .find(|route| route.dest.to_string() == "fc00:d::/64")
        .expect("route to d");
    assert_eq!(route.nexthops.len(), 1);
    assert_eq!(route.nexthops[0].node, "b");
}
