//! Multi-node ring tests over the in-process transport.
//!
//! Maintenance rounds are driven by hand instead of timers, so convergence
//! is deterministic: a "round" runs check-predecessor and stabilize on every
//! node in turn.

use std::sync::Arc;

use ringnet::net::local::LocalNetwork;
use ringnet::net::transport::Transport;
use ringnet::ring::id::{Address, Id};
use ringnet::ring::node::Node;
use ringnet::{RingConfig, RingError};

fn test_config() -> RingConfig {
    RingConfig {
        successors: 3,
        ..Default::default()
    }
}

fn spawn_node(network: &Arc<LocalNetwork>, port: u16) -> Arc<Node> {
    let node = Node::new(
        test_config(),
        "127.0.0.1",
        port,
        network.clone() as Arc<dyn Transport>,
    )
    .unwrap();
    network.register(&node);
    node
}

async fn settle(nodes: &[Arc<Node>], rounds: usize) {
    for _ in 0..rounds {
        for node in nodes {
            node.check_predecessor().await;
        }
        for node in nodes {
            let _ = node.stabilize().await;
        }
    }
}

async fn fix_all_fingers(node: &Arc<Node>) {
    for _ in 0..node.space().bits() {
        let _ = node.fix_fingers().await;
    }
}

/// Creates a ring from the first port and joins the rest sequentially,
/// settling between joins.
async fn build_ring(network: &Arc<LocalNetwork>, ports: &[u16]) -> Vec<Arc<Node>> {
    let nodes: Vec<_> = ports.iter().map(|p| spawn_node(network, *p)).collect();
    nodes[0].create().await.unwrap();
    for i in 1..nodes.len() {
        let bootstrap = nodes[0].address().clone();
        nodes[i].join(&bootstrap).await.unwrap();
        settle(&nodes[..=i], 4).await;
    }
    settle(&nodes, nodes.len() + 2).await;
    nodes
}

fn sorted_by_id(nodes: &[Arc<Node>]) -> Vec<Arc<Node>> {
    let mut sorted = nodes.to_vec();
    sorted.sort_by_key(|n| n.address().id());
    sorted
}

/// Ground truth: the owner of `id` is the first node at or after it,
/// wrapping past the top of the space.
fn expected_owner(sorted: &[Arc<Node>], id: Id) -> Address {
    for node in sorted {
        if node.address().id() >= id {
            return node.address().clone();
        }
    }
    sorted[0].address().clone()
}

#[tokio::test]
async fn two_node_ring_closes_symmetrically() {
    let network = LocalNetwork::new();
    let a = spawn_node(&network, 7001);
    let b = spawn_node(&network, 7002);

    a.create().await.unwrap();
    let a_addr = a.address().clone();
    b.join(&a_addr).await.unwrap();
    settle(&[a.clone(), b.clone()], 3).await;

    assert_eq!(a.successor().await.as_ref(), Some(b.address()));
    assert_eq!(b.successor().await.as_ref(), Some(a.address()));
    assert_eq!(a.predecessor().await.as_ref(), Some(b.address()));
    assert_eq!(b.predecessor().await.as_ref(), Some(a.address()));
}

#[tokio::test]
async fn sequential_joins_converge_to_a_sorted_cycle() {
    let network = LocalNetwork::new();
    let ports: Vec<u16> = (7100..7108).collect();
    let nodes = build_ring(&network, &ports).await;
    let sorted = sorted_by_id(&nodes);
    let n = sorted.len();

    for (i, node) in sorted.iter().enumerate() {
        let succ = sorted[(i + 1) % n].address();
        let pred = sorted[(i + n - 1) % n].address();
        assert_eq!(
            node.successor().await.as_ref(),
            Some(succ),
            "successor of {}",
            node.address()
        );
        assert_eq!(
            node.predecessor().await.as_ref(),
            Some(pred),
            "predecessor of {}",
            node.address()
        );
    }

    // Following successor pointers visits every node exactly once.
    let mut seen = vec![sorted[0].address().clone()];
    let mut cursor = sorted[0].successor().await.unwrap();
    while cursor != *sorted[0].address() {
        assert!(!seen.contains(&cursor), "cycle revisited {cursor}");
        seen.push(cursor.clone());
        let next = sorted
            .iter()
            .find(|n| *n.address() == cursor)
            .unwrap()
            .successor()
            .await
            .unwrap();
        cursor = next;
    }
    assert_eq!(seen.len(), n);
}

#[tokio::test]
async fn lookups_agree_from_every_node() {
    let network = LocalNetwork::new();
    let ports: Vec<u16> = (7200..7206).collect();
    let nodes = build_ring(&network, &ports).await;
    for node in &nodes {
        fix_all_fingers(node).await;
    }
    let sorted = sorted_by_id(&nodes);

    for key in ["apple", "banana", "cherry", "dates", "elder", "figs"] {
        let id = nodes[0].space().hash(key.as_bytes());
        let expected = expected_owner(&sorted, id);
        for node in &nodes {
            let owner = node.find_successor(id).await.unwrap();
            assert_eq!(owner, expected, "lookup of {key:?} from {}", node.address());
        }
    }
}

#[tokio::test]
async fn fix_fingers_matches_full_recomputation() {
    let network = LocalNetwork::new();
    let ports: Vec<u16> = (7300..7305).collect();
    let nodes = build_ring(&network, &ports).await;
    let sorted = sorted_by_id(&nodes);

    for node in &nodes {
        fix_all_fingers(node).await;
        let fingers = node.fingers().await;
        assert_eq!(fingers.len(), node.space().bits() as usize);
        for (i, entry) in fingers.iter().enumerate() {
            let start = node.space().finger_start(node.address().id(), i as u32);
            let expected = expected_owner(&sorted, start);
            assert_eq!(
                entry.as_ref(),
                Some(&expected),
                "finger {i} of {}",
                node.address()
            );
        }
    }
}

#[tokio::test]
async fn trace_reports_bounded_hop_counts() {
    let network = LocalNetwork::new();
    let ports: Vec<u16> = (7400..7408).collect();
    let nodes = build_ring(&network, &ports).await;
    for node in &nodes {
        fix_all_fingers(node).await;
    }
    let sorted = sorted_by_id(&nodes);

    for key in ["alpha", "beta", "gamma", "delta"] {
        let id = nodes[0].space().hash(key.as_bytes());
        let expected = expected_owner(&sorted, id);
        for node in &nodes {
            let (owner, hops) = node.trace_successor(id, 0).await.unwrap();
            assert_eq!(owner, expected);
            assert!(
                hops <= nodes.len() as u32,
                "lookup from {} took {hops} hops",
                node.address()
            );
        }
    }
}

#[tokio::test]
async fn killed_node_is_routed_around() {
    let network = LocalNetwork::new();
    let ports: Vec<u16> = (7500..7505).collect();
    let nodes = build_ring(&network, &ports).await;
    for node in &nodes {
        fix_all_fingers(node).await;
    }
    let sorted = sorted_by_id(&nodes);

    // Kill a mid-ring node outright: no goodbye, it just stops answering.
    let victim = sorted[2].clone();
    network.unregister(victim.address());

    let survivors: Vec<_> = sorted
        .iter()
        .filter(|n| n.address() != victim.address())
        .cloned()
        .collect();
    settle(&survivors, 4).await;

    let n = survivors.len();
    for (i, node) in survivors.iter().enumerate() {
        let succ = survivors[(i + 1) % n].address();
        let pred = survivors[(i + n - 1) % n].address();
        assert_eq!(node.successor().await.as_ref(), Some(succ));
        assert_eq!(node.predecessor().await.as_ref(), Some(pred));
    }

    // Keys the victim used to own now resolve to its old successor.
    let probe = victim.address().id();
    let expected = expected_owner(&survivors, probe);
    for node in &survivors {
        assert_eq!(node.find_successor(probe).await.unwrap(), expected);
    }
}

#[tokio::test]
async fn graceful_leave_heals_without_failure_detection() {
    let network = LocalNetwork::new();
    let ports: Vec<u16> = (7600..7604).collect();
    let nodes = build_ring(&network, &ports).await;
    let sorted = sorted_by_id(&nodes);

    let leaver = sorted[1].clone();
    leaver.leave().await.unwrap();

    let survivors: Vec<_> = sorted
        .iter()
        .filter(|n| n.address() != leaver.address())
        .cloned()
        .collect();
    settle(&survivors, 4).await;

    let n = survivors.len();
    for (i, node) in survivors.iter().enumerate() {
        let succ = survivors[(i + 1) % n].address();
        assert_eq!(node.successor().await.as_ref(), Some(succ));
    }
    assert!(leaver.handle_ping().await.is_err());
}

#[tokio::test]
async fn exhausted_successor_list_surfaces_ring_unavailable() {
    let network = LocalNetwork::new();
    let ports: Vec<u16> = (7700..7703).collect();
    let nodes = build_ring(&network, &ports).await;
    let sorted = sorted_by_id(&nodes);

    // Every peer of the first node dies at once.
    network.unregister(sorted[1].address());
    network.unregister(sorted[2].address());
    let alone = sorted[0].clone();

    let mut saw_unavailable = false;
    for _ in 0..4 {
        alone.check_predecessor().await;
        if let Err(RingError::RingUnavailable(_)) = alone.stabilize().await {
            saw_unavailable = true;
            break;
        }
    }
    assert!(saw_unavailable, "stabilize never reported an unavailable ring");

    // The node falls back to a ring of one and keeps running.
    settle(&[alone.clone()], 2).await;
    assert_eq!(alone.successor().await.as_ref(), Some(alone.address()));
    assert_eq!(
        alone.find_successor(alone.space().hash(b"key")).await.unwrap(),
        *alone.address()
    );
}
