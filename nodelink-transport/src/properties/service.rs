//! NodePropertiesService: publishes local properties and keeps the
//! network-wide view in sync.
//!
//! # Exchange
//!
//! ```text
//! new channel ─► NodePropertiesInit(knowledge) ─► remote merges
//!             ◄─ complementing knowledge ◄──────── response
//!
//! local update / effective remote delta (relay only)
//!   └─► BatchAggregator (25 entries / 150 ms) ─► NodePropertiesDelta to neighbours
//! ```
//!
//! Non-relay nodes only send what they published themselves; relays send
//! and forward everything they know.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::batch::BatchAggregator;
use super::sequence::IncreasingSequence;
use super::{NodeProperty, NodePropertiesRegistry};
use crate::callbacks::OrderedCallbacks;
use crate::channel::{
    MessageChannel, MessageChannelLifecycleListener, MessageChannelService, NetworkRequestHandler,
};
use crate::protocol::{MessageType, NetworkRequest, NetworkResponse, ResultCode};
use crate::{JsonCodec, MessageCodec, NodeId};

/// Observer of every effective property change, unfiltered by reachability.
pub trait RawNodePropertiesChangeListener: Send + Sync {
    /// Entries that were added or superseded. The first call after
    /// registration carries the complete current knowledge.
    fn on_raw_node_properties_added_or_modified(&self, properties: &[NodeProperty]);
}

struct Knowledge {
    complete: NodePropertiesRegistry,
    locally_published: NodePropertiesRegistry,
}

struct DeltaForBroadcast {
    properties: Vec<NodeProperty>,
    exclude: Option<NodeId>,
}

/// Property directory of the local node.
pub struct NodePropertiesService {
    local_node_id: NodeId,
    is_relay: bool,
    knowledge: Mutex<Knowledge>,
    sequence: IncreasingSequence,
    callbacks: OrderedCallbacks<dyn RawNodePropertiesChangeListener>,
    broadcaster: BatchAggregator<DeltaForBroadcast>,
    channels: Arc<MessageChannelService>,
    codec: JsonCodec,
}

impl NodePropertiesService {
    /// Create the service and register its request handlers and channel
    /// listener with `channels`. Requires a tokio runtime.
    pub fn new(
        channels: Arc<MessageChannelService>,
        is_relay: bool,
        max_batch_size: usize,
        max_batch_latency: Duration,
    ) -> Arc<Self> {
        let broadcaster = {
            let channels = channels.clone();
            BatchAggregator::new(max_batch_size, max_batch_latency, move |batch| {
                broadcast_batch(channels.clone(), batch)
            })
        };
        let service = Arc::new(Self {
            local_node_id: channels.local_node_id().clone(),
            is_relay,
            knowledge: Mutex::new(Knowledge {
                complete: NodePropertiesRegistry::new(),
                locally_published: NodePropertiesRegistry::new(),
            }),
            sequence: IncreasingSequence::default(),
            callbacks: OrderedCallbacks::default(),
            broadcaster,
            channels: channels.clone(),
            codec: JsonCodec,
        });

        let weak = Arc::downgrade(&service);
        for message_type in [MessageType::NodePropertiesInit, MessageType::NodePropertiesDelta] {
            channels.register_request_handler(
                message_type,
                Arc::new(PropertiesUpdateHandler {
                    service: weak.clone(),
                }),
            );
        }
        channels.add_lifecycle_listener(Arc::new(InitialExchangeTrigger { service: weak }));
        service
    }

    /// Id of the local node.
    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    /// Whether this node forwards the properties of other nodes.
    pub fn is_relay(&self) -> bool {
        self.is_relay
    }

    /// Publish or update one local property; `None` removes it.
    pub fn add_or_update_local_property(&self, key: impl Into<String>, value: Option<String>) {
        self.add_or_update_local_properties(HashMap::from([(key.into(), value)]));
    }

    /// Publish several local properties under one shared sequence number.
    pub fn add_or_update_local_properties(&self, data: HashMap<String, Option<String>>) {
        if data.is_empty() {
            tracing::debug!("ignoring empty local property update");
            return;
        }
        let mut knowledge = self.knowledge.lock();
        self.publish_locked(&mut knowledge, data);
    }

    /// The non-null properties of `node`.
    pub fn get_node_properties(&self, node: &NodeId) -> HashMap<String, String> {
        self.knowledge.lock().complete.get_node_properties(node)
    }

    /// The non-null properties of every known node.
    pub fn get_all_node_properties(&self) -> HashMap<NodeId, HashMap<String, String>> {
        self.knowledge.lock().complete.get_all_node_properties()
    }

    /// The non-null properties of the given nodes.
    pub fn get_all_node_properties_for(
        &self,
        nodes: &[NodeId],
    ) -> HashMap<NodeId, HashMap<String, String>> {
        self.knowledge.lock().complete.get_all_node_properties_for(nodes)
    }

    /// The stored entry for `(node, key)`, tombstones included.
    pub fn get_node_property(&self, node: &NodeId, key: &str) -> Option<NodeProperty> {
        self.knowledge.lock().complete.get_node_property(node, key).cloned()
    }

    /// Number of entries known, tombstones included.
    pub fn entry_count(&self) -> usize {
        self.knowledge.lock().complete.entry_count()
    }

    /// Register a listener. Its first callback carries the full current
    /// knowledge; later callbacks carry effective deltas in order.
    pub fn add_raw_node_properties_change_listener(
        &self,
        listener: Arc<dyn RawNodePropertiesChangeListener>,
    ) {
        let knowledge = self.knowledge.lock();
        let snapshot = knowledge.complete.get_detached_copy_of_entries();
        self.callbacks.add_listener_with_initial(listener, move |l| {
            l.on_raw_node_properties_added_or_modified(&snapshot)
        });
    }

    fn publish_locked(&self, knowledge: &mut Knowledge, data: HashMap<String, Option<String>>) {
        let sequence_no = self.sequence.next();
        let delta: Vec<NodeProperty> = data
            .into_iter()
            .map(|(key, value)| {
                NodeProperty::new(self.local_node_id.clone(), key, value, sequence_no)
            })
            .collect();
        tracing::debug!(
            node = %self.local_node_id,
            entries = delta.len(),
            sequence_no,
            "publishing local properties"
        );
        knowledge.complete.merge_unchecked(delta.iter().cloned());
        knowledge.locally_published.merge_unchecked(delta.iter().cloned());
        self.broadcaster.enqueue(DeltaForBroadcast {
            properties: delta.clone(),
            exclude: None,
        });
        self.report_locked(delta);
    }

    fn report_locked(&self, delta: Vec<NodeProperty>) {
        self.callbacks
            .enqueue(move |l| l.on_raw_node_properties_added_or_modified(&delta));
    }

    /// Merge entries received from `sender`, returning the effective subset.
    fn merge_external(&self, entries: Vec<NodeProperty>, sender: &NodeId) -> Vec<NodeProperty> {
        let mut knowledge = self.knowledge.lock();

        let mut foreign = Vec::with_capacity(entries.len());
        let mut republish: HashMap<String, Option<String>> = HashMap::new();
        for entry in entries {
            if entry.node_id() == &self.local_node_id {
                let key = entry.key().to_string();
                match knowledge.locally_published.get_node_property(&self.local_node_id, &key) {
                    None => {
                        tracing::debug!(
                            %entry,
                            "received a local property with no local counterpart; cancelling it"
                        );
                        republish.insert(key, None);
                    }
                    Some(existing) if existing.sequence_no() < entry.sequence_no() => {
                        tracing::warn!(
                            local = %existing,
                            received = %entry,
                            "received a newer version of a local property; re-publishing"
                        );
                        republish.insert(key, existing.value().map(str::to_string));
                    }
                    Some(_) => {}
                }
            } else if entry.node_id().is_same_instance_as(&self.local_node_id) {
                tracing::debug!(%entry, "ignoring property of an earlier session of this instance");
            } else {
                foreign.push(entry);
            }
        }
        if !republish.is_empty() {
            self.publish_locked(&mut knowledge, republish);
        }

        let effective = knowledge.complete.merge_and_get_effective_subset(foreign);
        if effective.is_empty() {
            return effective;
        }
        self.report_locked(effective.clone());
        if self.is_relay {
            self.broadcaster.enqueue(DeltaForBroadcast {
                properties: effective.clone(),
                exclude: Some(sender.clone()),
            });
        }
        effective
    }

    fn knowledge_to_publish(&self) -> Vec<NodeProperty> {
        let knowledge = self.knowledge.lock();
        if self.is_relay {
            knowledge.complete.get_detached_copy_of_entries()
        } else {
            knowledge.locally_published.get_detached_copy_of_entries()
        }
    }

    fn complementing_knowledge(&self, known: &[NodeProperty]) -> Vec<NodeProperty> {
        let knowledge = self.knowledge.lock();
        if self.is_relay {
            knowledge.complete.get_complementing_knowledge(known)
        } else {
            knowledge.locally_published.get_complementing_knowledge(known)
        }
    }

    async fn perform_initial_exchange(self: Arc<Self>, channel: Arc<dyn MessageChannel>) {
        let remote = channel.remote_node_id().clone();
        let payload = match self.codec.encode(&self.knowledge_to_publish()) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode initial property exchange");
                return;
            }
        };
        let request = NetworkRequest::new(
            MessageType::NodePropertiesInit,
            self.local_node_id.clone(),
            payload,
        );
        let response = match self.channels.send_request(&channel, request).await {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                tracing::warn!(
                    %remote,
                    channel_id = channel.channel_id(),
                    code = ?response.result_code,
                    "initial property exchange rejected"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(
                    %remote,
                    channel_id = channel.channel_id(),
                    error = %e,
                    "initial property exchange failed"
                );
                return;
            }
        };
        match self.codec.decode::<Vec<NodeProperty>>(&response.payload) {
            Ok(entries) => {
                let effective = self.merge_external(entries, &remote);
                tracing::debug!(
                    %remote,
                    effective = effective.len(),
                    "initial property exchange complete"
                );
            }
            Err(e) => tracing::warn!(%remote, error = %e, "undecodable initial property response"),
        }
    }
}

struct PropertiesUpdateHandler {
    service: Weak<NodePropertiesService>,
}

#[async_trait]
impl NetworkRequestHandler for PropertiesUpdateHandler {
    async fn handle_request(&self, request: NetworkRequest) -> NetworkResponse {
        let Some(service) = self.service.upgrade() else {
            return NetworkResponse::failure(
                &request,
                ResultCode::ExceptionAtDestination,
                "property service stopped",
            );
        };
        let entries: Vec<NodeProperty> = match service.codec.decode(&request.payload) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(sender = %request.sender, error = %e, "undecodable property update");
                return NetworkResponse::failure(
                    &request,
                    ResultCode::ExceptionAtDestination,
                    &e.to_string(),
                );
            }
        };

        if request.message_type != MessageType::NodePropertiesInit {
            service.merge_external(entries, &request.sender);
            return NetworkResponse::success(&request, Vec::new());
        }

        service.merge_external(entries.clone(), &request.sender);
        let complementing = service.complementing_knowledge(&entries);
        tracing::debug!(
            sender = %request.sender,
            entries = complementing.len(),
            "answering initial property exchange"
        );
        match service.codec.encode(&complementing) {
            Ok(payload) => NetworkResponse::success(&request, payload),
            Err(e) => NetworkResponse::failure(
                &request,
                ResultCode::ExceptionAtDestination,
                &e.to_string(),
            ),
        }
    }
}

struct InitialExchangeTrigger {
    service: Weak<NodePropertiesService>,
}

impl MessageChannelLifecycleListener for InitialExchangeTrigger {
    fn on_channel_established(&self, channel: &Arc<dyn MessageChannel>) {
        if let Some(service) = self.service.upgrade() {
            tokio::spawn(service.perform_initial_exchange(channel.clone()));
        }
    }
}

/// Send each neighbour the merged deltas that concern it.
async fn broadcast_batch(channels: Arc<MessageChannelService>, batch: Vec<DeltaForBroadcast>) {
    let mut served: HashSet<NodeId> = HashSet::new();
    for channel in channels.get_all_channels() {
        let remote = channel.remote_node_id().clone();
        if !served.insert(remote.clone()) {
            continue;
        }

        let mut merged: HashMap<(NodeId, String), NodeProperty> = HashMap::new();
        for delta in batch.iter().filter(|d| d.exclude.as_ref() != Some(&remote)) {
            for property in &delta.properties {
                let newer = merged
                    .get(&property.composite_key())
                    .is_none_or(|existing| existing.sequence_no() < property.sequence_no());
                if newer {
                    merged.insert(property.composite_key(), property.clone());
                }
            }
        }
        if merged.is_empty() {
            continue;
        }

        let entries: Vec<NodeProperty> = merged.into_values().collect();
        let payload = match JsonCodec.encode(&entries) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode property delta");
                return;
            }
        };
        let request = NetworkRequest::new(
            MessageType::NodePropertiesDelta,
            channels.local_node_id().clone(),
            payload,
        );
        match channels.send_request(&channel, request).await {
            Ok(response) if response.is_success() => {}
            Ok(response) => {
                tracing::warn!(%remote, code = ?response.result_code, "property delta rejected")
            }
            Err(e) => tracing::warn!(%remote, error = %e, "failed to send property delta"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransportRegistry, VirtualNetwork, VirtualTransportProvider};
    use crate::ContactPoint;

    fn channels(network: &Arc<VirtualNetwork>) -> Arc<MessageChannelService> {
        let registry = Arc::new(TransportRegistry::new());
        registry.add(Arc::new(VirtualTransportProvider::new(network.clone(), true)));
        MessageChannelService::new(NodeId::generate(), registry, Duration::from_secs(1))
    }

    fn properties(network: &Arc<VirtualNetwork>) -> Arc<NodePropertiesService> {
        NodePropertiesService::new(channels(network), false, 25, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_bulk_update_shares_one_sequence_number() {
        let service = properties(&VirtualNetwork::new());
        service.add_or_update_local_properties(HashMap::from([
            ("a".to_string(), Some("1".to_string())),
            ("b".to_string(), Some("2".to_string())),
        ]));
        let me = service.local_node_id().clone();
        let a = service.get_node_property(&me, "a").expect("a");
        let b = service.get_node_property(&me, "b").expect("b");
        assert_eq!(a.sequence_no(), b.sequence_no());

        service.add_or_update_local_property("a", None);
        assert_eq!(service.get_node_properties(&me).len(), 1);
        let tombstone = service.get_node_property(&me, "a").expect("tombstone");
        assert!(tombstone.sequence_no() > b.sequence_no());
    }

    #[tokio::test]
    async fn test_stale_entry_about_local_node_is_cancelled() {
        let service = properties(&VirtualNetwork::new());
        let me = service.local_node_id().clone();
        let sender = NodeId::generate();

        let ghost = NodeProperty::new(me.clone(), "ghost", Some("x".to_string()), 1);
        service.merge_external(vec![ghost], &sender);
        let tombstone = service.get_node_property(&me, "ghost").expect("cancel published");
        assert_eq!(tombstone.value(), None);

        service.add_or_update_local_property("real", Some("v".to_string()));
        let local = service.get_node_property(&me, "real").expect("local");
        let forged = NodeProperty::new(
            me.clone(),
            "real",
            Some("forged".to_string()),
            local.sequence_no() + 1_000_000,
        );
        service.merge_external(vec![forged], &sender);
        let republished = service.get_node_property(&me, "real").expect("republished");
        assert_eq!(republished.value(), Some("v"));
        assert!(republished.sequence_no() > local.sequence_no());
    }

    #[tokio::test]
    async fn test_init_exchange_syncs_both_directions() {
        let network = VirtualNetwork::new();
        let (a, b) = (properties(&network), properties(&network));
        a.add_or_update_local_property("role", Some("client".to_string()));
        b.add_or_update_local_property("role", Some("server".to_string()));

        let cp = ContactPoint::new("virtual", "props-b", 1).expect("contact point");
        b.channels.start_server(&cp).await.expect("server");
        a.channels.connect(&cp, true).await.expect("connect");

        let (a_id, b_id) = (a.local_node_id().clone(), b.local_node_id().clone());
        for _ in 0..100 {
            if a.get_node_properties(&b_id).contains_key("role")
                && b.get_node_properties(&a_id).contains_key("role")
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(a.get_node_properties(&b_id).get("role").map(String::as_str), Some("server"));
        assert_eq!(b.get_node_properties(&a_id).get("role").map(String::as_str), Some("client"));
    }
}
