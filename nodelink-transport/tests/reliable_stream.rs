//! Reliable RPC streams over a lossy virtual network.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{
    Counter, CounterService, CounterServiceDispatch, CounterServiceProxy, eventually, init_tracing,
    serving_node, virtual_cp, virtual_node_builder,
};
use nodelink_transport::topology::LINKS_PROPERTY;
use nodelink_transport::{
    CommunicationNode, NodeConfig, NodeId, RemoteErrorKind, ServiceProxy, VirtualNetwork,
};

struct Pair {
    network: Arc<VirtualNetwork>,
    client: CommunicationNode,
    server: CommunicationNode,
    counter: Arc<Counter>,
}

fn links_mention(
    observer: &CommunicationNode,
    about: &CommunicationNode,
    wanted: &CommunicationNode,
) -> bool {
    observer
        .properties()
        .get_node_properties(about.node_id())
        .get(LINKS_PROPERTY)
        .is_some_and(|links| links.contains(&wanted.node_id().to_string()))
}

/// Connect a client to a counter server and wait until property traffic
/// between them has died down, so injected losses hit service calls only.
async fn settled_pair(config: NodeConfig) -> Pair {
    init_tracing();
    let network = VirtualNetwork::new();
    let counter = Arc::new(Counter::default());
    let server = virtual_node_builder(&network, config.clone())
        .register_service_all_declared(Arc::new(CounterServiceDispatch::new(counter.clone())))
        .start()
        .expect("start server node");
    server.start_server(&virtual_cp("server")).await.expect("serve");
    let client = serving_node(&network, "client", config.with_node_id(NodeId::generate())).await;
    client.connect(&virtual_cp("server")).await.expect("connect");

    eventually("client to see the server's links", || {
        links_mention(&client, &server, &client)
    })
    .await;
    eventually("server to see the client's links", || {
        links_mention(&server, &client, &server)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    Pair {
        network,
        client,
        server,
        counter,
    }
}

fn reliable_proxy(pair: &Pair) -> CounterServiceProxy {
    let stream = pair.client.create_reliable_rpc_stream(pair.server.node_id());
    pair.client
        .proxy_factory()
        .create_service_proxy::<CounterServiceProxy>(pair.server.node_id(), Some(&stream))
}

#[tokio::test]
async fn test_lost_response_is_replayed_not_reexecuted() {
    let pair = settled_pair(NodeConfig::local_network()).await;
    let proxy = reliable_proxy(&pair);

    pair.network.lose_next_responses(1);
    assert_eq!(proxy.increment(1).await.expect("increment survives the loss"), 1);
    assert_eq!(pair.counter.value.load(Ordering::SeqCst), 1);

    assert_eq!(proxy.increment(2).await.expect("next call"), 3);
    assert_eq!(proxy.current().await.expect("current"), 3);
    let stream = proxy.caller().reliable_stream().expect("stream attached");
    assert!(!stream.is_broken().await);
}

#[tokio::test]
async fn test_plain_call_reports_lost_response_after_executing() {
    let pair = settled_pair(NodeConfig::local_network()).await;
    let proxy: CounterServiceProxy = pair.client.create_service_proxy(pair.server.node_id());

    pair.network.lose_next_responses(1);
    let err = proxy.increment(1).await.expect_err("response lost");
    assert_eq!(err.remote_kind(), Some(RemoteErrorKind::CommunicationFailed));
    // The call ran even though the caller never heard back.
    assert_eq!(pair.counter.value.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_exhausted_retries_leave_outcome_unknown() {
    let config = NodeConfig::local_network().with_reliable_retries(
        1,
        Duration::from_millis(10),
        Duration::from_millis(10),
    );
    let pair = settled_pair(config).await;
    let proxy = reliable_proxy(&pair);

    pair.network.lose_next_responses(1);
    let err = proxy.increment(1).await.expect_err("no retries left");
    assert_eq!(err.remote_kind(), Some(RemoteErrorKind::OutcomeUnknown));
    let stream = proxy.caller().reliable_stream().expect("stream attached");
    assert!(stream.is_broken().await);

    let err = proxy.current().await.expect_err("stream unusable");
    assert_eq!(err.remote_kind(), Some(RemoteErrorKind::CommunicationFailed));

    // A fresh stream works again.
    let fresh = reliable_proxy(&pair);
    assert_eq!(fresh.current().await.expect("current"), 1);
}

#[tokio::test]
async fn test_lost_response_behind_relay_never_replays_for_next_call() {
    init_tracing();
    let config = NodeConfig::local_network().with_reliable_retries(
        1,
        Duration::from_millis(10),
        Duration::from_millis(10),
    );
    let network = VirtualNetwork::new();
    let counter = Arc::new(Counter::default());
    let relay_config = config.clone().with_node_id(NodeId::generate()).with_relay(true);
    let _relay = serving_node(&network, "relay", relay_config).await;
    let provider = virtual_node_builder(&network, config.clone().with_node_id(NodeId::generate()))
        .register_service_all_declared(Arc::new(CounterServiceDispatch::new(counter.clone())))
        .start()
        .expect("start provider node");
    let consumer =
        serving_node(&network, "consumer", config.with_node_id(NodeId::generate())).await;
    provider.connect(&virtual_cp("relay")).await.expect("provider connects");
    consumer.connect(&virtual_cp("relay")).await.expect("consumer connects");

    let provider_id = provider.node_id().clone();
    eventually("consumer to see the provider", || {
        consumer.topology().is_reachable(&provider_id)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stream = consumer.create_reliable_rpc_stream(&provider_id);
    let proxy = consumer
        .proxy_factory()
        .create_service_proxy::<CounterServiceProxy>(&provider_id, Some(&stream));

    // The provider executes the call but its answer to the relay is lost.
    network.lose_next_responses(1);
    let err = proxy.increment(1).await.expect_err("response lost behind the relay");
    assert_eq!(err.remote_kind(), Some(RemoteErrorKind::OutcomeUnknown));
    assert_eq!(counter.value.load(Ordering::SeqCst), 1);
    assert!(stream.is_broken().await);

    // The next call must neither reuse the sequence number nor see the old result.
    let err = proxy.increment(100).await.expect_err("stream unusable");
    assert_eq!(err.remote_kind(), Some(RemoteErrorKind::CommunicationFailed));
    assert_eq!(counter.value.load(Ordering::SeqCst), 1);
}
