//! Property directory synchronization across nodes.

mod common;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use common::{eventually, init_tracing, serving_node, virtual_cp};
use nodelink_transport::{
    NodeConfig, NodeId, NodePropertiesChangeListener, NodePropertiesRegistry, NodeProperty,
    NodeValueMaps, ReachableNodesListener, VirtualNetwork,
};
use parking_lot::Mutex;

#[derive(Default)]
struct ReachabilityRecorder {
    calls: Mutex<Vec<(BTreeSet<NodeId>, BTreeSet<NodeId>, BTreeSet<NodeId>)>>,
}

impl ReachableNodesListener for ReachabilityRecorder {
    fn on_reachable_nodes_changed(
        &self,
        reachable: &BTreeSet<NodeId>,
        added: &BTreeSet<NodeId>,
        removed: &BTreeSet<NodeId>,
    ) {
        self.calls
            .lock()
            .push((reachable.clone(), added.clone(), removed.clone()));
    }
}

#[derive(Default)]
struct PropertyRecorder {
    added: Mutex<Vec<NodeProperty>>,
    removed: Mutex<Vec<NodeProperty>>,
    maps: Mutex<Vec<NodeValueMaps>>,
}

impl NodePropertiesChangeListener for PropertyRecorder {
    fn on_reachable_node_properties_changed(
        &self,
        added: &[NodeProperty],
        _updated: &[NodeProperty],
        removed: &[NodeProperty],
    ) {
        self.added.lock().extend_from_slice(added);
        self.removed.lock().extend_from_slice(removed);
    }

    fn on_node_property_maps_of_nodes_changed(&self, value_maps: &NodeValueMaps) {
        self.maps.lock().push(value_maps.clone());
    }
}

fn value_of(
    node: &nodelink_transport::CommunicationNode,
    about: &NodeId,
    key: &str,
) -> Option<String> {
    node.properties().get_node_properties(about).get(key).cloned()
}

#[tokio::test]
async fn test_properties_sync_both_ways_and_follow_updates() {
    init_tracing();
    let network = VirtualNetwork::new();
    let a = serving_node(&network, "a", NodeConfig::local_network()).await;
    let b = serving_node(&network, "b", NodeConfig::local_network()).await;
    a.publish_property("role", Some("worker".to_string()));
    b.publish_property("role", Some("controller".to_string()));

    a.connect(&virtual_cp("b")).await.expect("connect");
    let (a_id, b_id) = (a.node_id().clone(), b.node_id().clone());
    eventually("b to learn a's role", || {
        value_of(&b, &a_id, "role").as_deref() == Some("worker")
    })
    .await;
    eventually("a to learn b's role", || {
        value_of(&a, &b_id, "role").as_deref() == Some("controller")
    })
    .await;

    a.publish_property("role", Some("idle".to_string()));
    eventually("b to see the update", || {
        value_of(&b, &a_id, "role").as_deref() == Some("idle")
    })
    .await;

    a.publish_property("role", None);
    eventually("b to see the removal", || value_of(&b, &a_id, "role").is_none()).await;
    let tombstone = b.properties().get_node_property(&a_id, "role").expect("removal is remembered");
    assert_eq!(tombstone.value(), None);
}

#[tokio::test]
async fn test_bulk_update_shares_one_sequence_number() {
    let network = VirtualNetwork::new();
    let a = serving_node(&network, "a", NodeConfig::local_network()).await;
    a.properties().add_or_update_local_properties(HashMap::from([
        ("x".to_string(), Some("1".to_string())),
        ("y".to_string(), Some("2".to_string())),
    ]));
    let x = a.properties().get_node_property(a.node_id(), "x").expect("x");
    let y = a.properties().get_node_property(a.node_id(), "y").expect("y");
    assert_eq!(x.sequence_no(), y.sequence_no());
}

#[tokio::test]
async fn test_relay_forwards_properties_between_leaves() {
    init_tracing();
    let network = VirtualNetwork::new();
    let relay = serving_node(&network, "relay", NodeConfig::local_network().with_relay(true)).await;
    let left = serving_node(&network, "left", NodeConfig::local_network()).await;
    let right = serving_node(&network, "right", NodeConfig::local_network()).await;
    left.publish_property("location", Some("lab".to_string()));

    left.connect(&virtual_cp("relay")).await.expect("left connects");
    right.connect(&virtual_cp("relay")).await.expect("right connects");

    let left_id = left.node_id().clone();
    eventually("right to learn left's property", || {
        value_of(&right, &left_id, "location").as_deref() == Some("lab")
    })
    .await;
    eventually("right to consider left reachable", || {
        right.state().reachable_node_properties(&left_id).is_some()
    })
    .await;
    let seen = right.state().reachable_node_properties(&left_id).expect("reachable");
    assert_eq!(seen.get("location").map(String::as_str), Some("lab"));

    // Updates published after the initial exchange travel through the relay too.
    left.publish_property("location", Some("office".to_string()));
    eventually("right to see the update", || {
        value_of(&right, &left_id, "location").as_deref() == Some("office")
    })
    .await;
}

#[tokio::test]
async fn test_late_listeners_get_full_bootstrap() {
    let network = VirtualNetwork::new();
    let relay = serving_node(&network, "relay", NodeConfig::local_network().with_relay(true)).await;
    let a = serving_node(&network, "a", NodeConfig::local_network()).await;
    let b = serving_node(&network, "b", NodeConfig::local_network()).await;
    a.publish_property("name", Some("alpha".to_string()));
    a.connect(&virtual_cp("relay")).await.expect("connect a");
    b.connect(&virtual_cp("relay")).await.expect("connect b");

    let expected: BTreeSet<NodeId> = [a.node_id(), b.node_id(), relay.node_id()]
        .into_iter()
        .cloned()
        .collect();
    eventually("b to see everyone", || b.reachable_nodes() == expected).await;
    let a_id = a.node_id().clone();
    eventually("b to learn a's name", || value_of(&b, &a_id, "name").is_some()).await;

    let reachability = Arc::new(ReachabilityRecorder::default());
    b.topology().add_reachable_nodes_listener(reachability.clone());
    eventually("reachability bootstrap", || !reachability.calls.lock().is_empty()).await;
    let (reachable, added, removed) = reachability.calls.lock()[0].clone();
    assert_eq!(reachable, expected);
    assert_eq!(added, expected);
    assert!(removed.is_empty());

    let properties = Arc::new(PropertyRecorder::default());
    b.state().add_node_properties_change_listener(properties.clone());
    eventually("property bootstrap", || !properties.maps.lock().is_empty()).await;
    assert!(
        properties
            .added
            .lock()
            .iter()
            .any(|p| p.node_id() == a.node_id() && p.key() == "name" && p.value() == Some("alpha"))
    );
    assert!(properties.removed.lock().is_empty());
    let maps = properties.maps.lock()[0].clone();
    assert_eq!(
        maps.get(a.node_id()).cloned().flatten().and_then(|m| m.get("name").cloned()).as_deref(),
        Some("alpha")
    );
}

#[tokio::test]
async fn test_shutdown_node_becomes_unreachable() {
    let network = VirtualNetwork::new();
    let relay = serving_node(&network, "relay", NodeConfig::local_network().with_relay(true)).await;
    let a = serving_node(&network, "a", NodeConfig::local_network()).await;
    let b = serving_node(&network, "b", NodeConfig::local_network()).await;
    a.publish_property("name", Some("alpha".to_string()));
    a.connect(&virtual_cp("relay")).await.expect("connect a");
    b.connect(&virtual_cp("relay")).await.expect("connect b");

    let a_id = a.node_id().clone();
    eventually("b to reach a", || b.state().reachable_node_properties(&a_id).is_some()).await;

    let listener = Arc::new(PropertyRecorder::default());
    b.state().add_node_properties_change_listener(listener.clone());

    a.shutdown().await;
    eventually("a to drop out", || !b.topology().is_reachable(&a_id)).await;
    assert!(b.state().reachable_node_properties(&a_id).is_none());
    assert!(relay.channels().channel_to(&a_id).is_none());
    eventually("removal notification", || {
        listener.removed.lock().iter().any(|p| p.node_id() == &a_id && p.key() == "name")
    })
    .await;
    // The raw directory keeps what it knew.
    assert_eq!(value_of(&b, &a_id, "name").as_deref(), Some("alpha"));
}

#[test]
fn test_merge_is_order_independent() {
    let node = NodeId::generate();
    let updates: Vec<NodeProperty> = (1..=4)
        .map(|seq| NodeProperty::new(node.clone(), "k", Some(format!("v{seq}")), seq))
        .collect();
    let orders: [[usize; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1]];

    for order in orders {
        let mut registry = NodePropertiesRegistry::new();
        let mut highest = 0;
        for index in order {
            let update = &updates[index];
            registry.merge_and_get_effective_subset([update.clone()]);
            highest = highest.max(update.sequence_no());
            let stored = registry.get_node_property(&node, "k").expect("stored");
            assert_eq!(stored.sequence_no(), highest);
            assert_eq!(stored.value(), Some(format!("v{highest}").as_str()));
        }
    }
}
