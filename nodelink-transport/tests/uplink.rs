//! Uplink sessions over real sockets and their bounded queues.

mod common;

use common::init_tracing;
use nodelink_transport::{
    BoundedMessageBlockPrioritizer, MessageBlock, MessageBlockPriority, MessageBlockType,
    MessageBlockWithMetadata, UplinkConfigurationProvider, UplinkError, UplinkProtocolConfiguration,
    UplinkSession,
};
use tokio::net::{TcpListener, TcpStream};

fn block(payload: &str, priority: MessageBlockPriority) -> MessageBlockWithMetadata {
    MessageBlockWithMetadata::new(
        MessageBlock::new(MessageBlockType::Request, payload),
        1,
        priority,
    )
}

fn payload(block: Option<MessageBlock>) -> String {
    String::from_utf8(block.expect("block").payload).expect("utf8")
}

#[test]
fn test_full_bucket_rejects_without_affecting_others() {
    let config = UplinkProtocolConfiguration::builder()
        .max_buffered_messages_for_priority(MessageBlockPriority::Default, 2)
        .max_buffered_messages_for_priority(MessageBlockPriority::LowNonBlockable, 1)
        .build();
    let prioritizer = BoundedMessageBlockPrioritizer::new(&config);

    prioritizer.submit_or_fail(block("a", MessageBlockPriority::Default)).expect("a");
    prioritizer.submit_or_fail(block("b", MessageBlockPriority::Default)).expect("b");
    let err = prioritizer
        .submit_or_fail(block("c", MessageBlockPriority::Default))
        .expect_err("default bucket full");
    assert!(matches!(
        err,
        UplinkError::QueueFull { priority: MessageBlockPriority::Default, capacity: 2 }
    ));
    prioritizer.submit_or_fail(block("low", MessageBlockPriority::LowNonBlockable)).expect("low");

    let order: Vec<String> = std::iter::from_fn(|| prioritizer.take_next())
        .map(|b| String::from_utf8(b.block.payload).expect("utf8"))
        .collect();
    assert_eq!(order, vec!["a", "b", "low"]);
    assert!(prioritizer.is_empty());
}

#[test]
fn test_overriding_configuration_is_not_retroactive() {
    let provider = UplinkConfigurationProvider::default();
    let before = BoundedMessageBlockPrioritizer::new(&provider.current());

    provider.override_default(
        provider
            .current()
            .to_builder()
            .max_buffered_messages_for_priority(MessageBlockPriority::SessionControl, 1)
            .build(),
    );
    let after = BoundedMessageBlockPrioritizer::new(&provider.current());

    after
        .submit_or_fail(block("x", MessageBlockPriority::SessionControl))
        .expect("first fits");
    assert!(after.submit_or_fail(block("y", MessageBlockPriority::SessionControl)).is_err());

    for i in 0..2 {
        before
            .submit_or_fail(block(&i.to_string(), MessageBlockPriority::SessionControl))
            .expect("old capacity still applies");
    }
}

#[tokio::test]
async fn test_session_send_fails_fast_when_bucket_is_full() {
    let (left, _right) = tokio::io::duplex(1024);
    let config = UplinkProtocolConfiguration::builder()
        .max_buffered_messages_for_priority(MessageBlockPriority::Forwarding, 1)
        .build();
    let (session, _) = UplinkSession::new(left, &config);

    // The writer has not run yet on this runtime, so the first block stays queued.
    session
        .send(
            MessageBlock::new(MessageBlockType::Event, "one"),
            2,
            MessageBlockPriority::Forwarding,
        )
        .expect("first");
    let err = session
        .send(
            MessageBlock::new(MessageBlockType::Event, "two"),
            2,
            MessageBlockPriority::Forwarding,
        )
        .expect_err("full");
    assert!(matches!(err, UplinkError::QueueFull { .. }));
    assert_eq!(session.queued(MessageBlockPriority::Forwarding), 1);
    assert_eq!(session.queued(MessageBlockPriority::Default), 0);
}

#[tokio::test]
async fn test_session_over_tcp() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local addr");
    let (connected, accepted) = tokio::join!(TcpStream::connect(address), listener.accept());
    let client_stream = connected.expect("connect");
    let (server_stream, _) = accepted.expect("accept");

    let config = UplinkProtocolConfiguration::default();
    let (client, _) = UplinkSession::new(client_stream, &config);
    let (server, mut server_unrouted) = UplinkSession::new(server_stream, &config);
    let mut client_channel = client.register_channel(42).expect("register");

    client
        .send(
            MessageBlock::new(MessageBlockType::ChannelInit, "open 42"),
            42,
            MessageBlockPriority::ChannelInitiation,
        )
        .expect("send init");
    let init = server_unrouted.recv().await.expect("init block");
    assert_eq!(init.channel_id, 42);
    assert_eq!(init.block.block_type, MessageBlockType::ChannelInit);

    let mut server_channel = server.register_channel(42).expect("register");
    server
        .send(
            MessageBlock::new(MessageBlockType::ChannelInitResponse, "accepted"),
            42,
            MessageBlockPriority::ChannelInitiation,
        )
        .expect("send response");
    assert_eq!(payload(client_channel.recv().await), "accepted");

    for i in 0..10 {
        client
            .send(
                MessageBlock::new(MessageBlockType::Request, format!("r{i}")),
                42,
                MessageBlockPriority::Default,
            )
            .expect("send request");
    }
    for i in 0..10 {
        assert_eq!(payload(server_channel.recv().await), format!("r{i}"));
    }

    client.close().await.expect("close");
    assert!(server_channel.recv().await.is_none());
    assert!(server.is_closed());
    assert!(matches!(client.close().await, Err(UplinkError::SessionClosed)));
}
