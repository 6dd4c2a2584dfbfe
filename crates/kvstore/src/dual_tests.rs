use std::collections::{BTreeMap, VecDeque};

use super::*;

/// In-memory mesh delivering dual messages and mirroring what the store
/// loop does with nexthop changes (set/unset child on the parents).
struct Mesh {
    nodes: BTreeMap<String, DualNode>,
    queue: VecDeque<(String, DualMessages)>,
}

impl Mesh {
    fn new(nodes: &[(&str, bool)]) -> Self {
        Self {
            nodes: nodes
                .iter()
                .map(|(name, is_root)| ((*name).to_owned(), DualNode::new(name, *is_root)))
                .collect(),
            queue: VecDeque::new(),
        }
    }

    fn connect(&mut self, a: &str, b: &str) {
        let mut out = Vec::new();
        self.nodes.get_mut(a).expect("node a").peer_up(b, 1, &mut out);
        self.handle_events(a, out);

        let mut out = Vec::new();
        self.nodes.get_mut(b).expect("node b").peer_up(a, 1, &mut out);
        self.handle_events(b, out);

        self.run();
    }

    fn disconnect(&mut self, a: &str, b: &str) {
        let mut out = Vec::new();
        self.nodes.get_mut(a).expect("node a").peer_down(b, &mut out);
        self.handle_events(a, out);

        let mut out = Vec::new();
        self.nodes.get_mut(b).expect("node b").peer_down(a, &mut out);
        self.handle_events(b, out);

        self.run();
    }

    fn handle_events(&mut self, from: &str, events: Vec<DualEvent>) {
        for event in events {
            match event {
                DualEvent::Send { peer, messages } => self.queue.push_back((peer, messages)),
                DualEvent::NexthopChange { root_id, old, new } => {
                    if let Some(new_parent) = new {
                        if new_parent != from {
                            if let Some(dual) = self
                                .nodes
                                .get_mut(&new_parent)
                                .and_then(|node| node.dual_mut(&root_id))
                            {
                                dual.add_child(from);
                            }
                        }
                    }
                    if let Some(old_parent) = old {
                        if let Some(dual) = self
                            .nodes
                            .get_mut(&old_parent)
                            .and_then(|node| node.dual_mut(&root_id))
                        {
                            dual.remove_child(from);
                        }
                    }
                }
            }
        }
    }

    fn run(&mut self) {
        while let Some((to, messages)) = self.queue.pop_front() {
            let mut out = Vec::new();
            if let Some(node) = self.nodes.get_mut(&to) {
                node.process_messages(messages, &mut out);
            }
            self.handle_events(&to, out);
        }
    }

    fn node(&self, name: &str) -> &DualNode {
        &self.nodes[name]
    }
}

#[test]
fn line_topology_forms_a_rooted_tree() {
    let mut mesh = Mesh::new(&[("a", true), ("b", false), ("c", false)]);
    mesh.connect("a", "b");
    mesh.connect("b", "c");

    for name in ["a", "b", "c"] {
        assert_eq!(mesh.node(name).spt_root_id(), Some("a".to_owned()));
    }

    let infos_b = mesh.node("b").infos();
    assert_eq!(infos_b["a"].parent.as_deref(), Some("a"));
    assert_eq!(infos_b["a"].cost, 1);
    assert!(infos_b["a"].passive);

    let infos_c = mesh.node("c").infos();
    assert_eq!(infos_c["a"].parent.as_deref(), Some("b"));
    assert_eq!(infos_c["a"].cost, 2);

    // Children sets mirror the parent choices.
    assert!(mesh.node("a").infos()["a"].children.contains("b"));
    assert!(infos_b["a"].children.contains("c"));
}

#[test]
fn spt_peers_are_parent_plus_children() {
    let mut mesh = Mesh::new(&[("a", true), ("b", false), ("c", false)]);
    mesh.connect("a", "b");
    mesh.connect("b", "c");

    assert_eq!(
        mesh.node("b").spt_peers("a"),
        ["a", "c"].into_iter().map(str::to_owned).collect()
    );
    assert_eq!(
        mesh.node("a").spt_peers("a"),
        ["b"].into_iter().map(str::to_owned).collect()
    );
    // Unknown root: no tree, callers fall back to naive flooding.
    assert!(mesh.node("b").spt_peers("zz").is_empty());
}

#[test]
fn smallest_reachable_root_wins_the_election() {
    let mut mesh = Mesh::new(&[("a", true), ("b", false), ("c", true)]);
    mesh.connect("a", "b");
    mesh.connect("b", "c");

    for name in ["a", "b", "c"] {
        assert_eq!(mesh.node(name).spt_root_id(), Some("a".to_owned()));
    }
    // Both roots are known everywhere.
    assert!(mesh.node("b").has_dual("a"));
    assert!(mesh.node("b").has_dual("c"));
}

#[test]
fn losing_the_parent_diffuses_and_reconverges() {
    // Square: a-b, a-c, b-d, c-d, rooted at a.
    let mut mesh = Mesh::new(&[("a", true), ("b", false), ("c", false), ("d", false)]);
    mesh.connect("a", "b");
    mesh.connect("a", "c");
    mesh.connect("b", "d");
    mesh.connect("c", "d");

    assert_eq!(mesh.node("d").infos()["a"].cost, 2);

    mesh.disconnect("a", "b");

    // b must re-reach the root through d, which hangs off c.
    let infos_b = mesh.node("b").infos();
    assert!(infos_b["a"].passive);
    assert_eq!(infos_b["a"].parent.as_deref(), Some("d"));
    assert_eq!(infos_b["a"].cost, 3);
    assert_eq!(mesh.node("d").infos()["a"].parent.as_deref(), Some("c"));
}

#[test]
fn root_loss_leaves_the_computation_unreachable() {
    let mut mesh = Mesh::new(&[("a", true), ("b", false)]);
    mesh.connect("a", "b");
    assert_eq!(mesh.node("b").spt_root_id(), Some("a".to_owned()));

    mesh.disconnect("a", "b");

    assert_eq!(mesh.node("b").spt_root_id(), None);
    assert!(mesh.node("b").spt_peers("a").is_empty());
}

#[test]
fn messages_from_unknown_neighbors_are_dropped() {
    let mut node = DualNode::new("a", true);
    let mut out = Vec::new();
    node.process_messages(
        DualMessages {
            src_id: "stranger".to_owned(),
            messages: vec![DualMessage {
                root_id: "a".to_owned(),
                kind: DualMessageKind::Update,
                distance: 1,
            }],
        },
        &mut out,
    );

    assert!(out.is_empty());
    assert_eq!(node.counters()["dual.unknown_neighbor"], 1);
}
