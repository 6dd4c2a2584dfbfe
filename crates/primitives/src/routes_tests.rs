use super::*;

fn route(dest: &str, node: &str, metric: i64) -> UnicastRoute {
    UnicastRoute {
        dest: dest.parse().expect("prefix"),
        nexthops: vec![NextHop {
            node: node.to_owned(),
            if_name: format!("if-{node}"),
            address: None,
            metric,
            push_label: None,
            is_lfa: false,
        }],
    }
}

fn db(node: &str, routes: Vec<UnicastRoute>) -> RouteDatabase {
    RouteDatabase {
        this_node_name: node.to_owned(),
        unicast_routes: routes,
        perf_events: None,
    }
}

#[test]
fn delta_of_identical_databases_is_empty() {
    let full = db("s", vec![route("10.0.1.0/24", "a", 1)]);
    assert!(route_db_delta(&full, &full).is_empty());
}

#[test]
fn delta_reports_new_changed_and_removed_routes() {
    let old = db(
        "s",
        vec![route("10.0.1.0/24", "a", 1), route("10.0.2.0/24", "b", 2)],
    );
    let new = db(
        "s",
        vec![route("10.0.1.0/24", "a", 5), route("10.0.3.0/24", "c", 1)],
    );

    let delta = route_db_delta(&old, &new);

    // 10.0.1.0/24 changed metric, 10.0.3.0/24 is new.
    assert_eq!(delta.routes_to_update.len(), 2);
    assert_eq!(delta.routes_to_delete, vec!["10.0.2.0/24".parse().expect("prefix")]);
}
