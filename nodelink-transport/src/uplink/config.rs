//! Uplink protocol configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::MessageBlockPriority;

/// Immutable uplink settings, produced by [`UplinkProtocolConfigurationBuilder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UplinkProtocolConfiguration {
    max_buffered_messages: BTreeMap<MessageBlockPriority, usize>,
}

impl Default for UplinkProtocolConfiguration {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl UplinkProtocolConfiguration {
    /// A builder starting from the default capacities.
    pub fn builder() -> UplinkProtocolConfigurationBuilder {
        UplinkProtocolConfigurationBuilder {
            max_buffered_messages: MessageBlockPriority::ALL
                .into_iter()
                .map(|p| (p, default_capacity(p)))
                .collect(),
        }
    }

    /// Capacity of the queue for `priority`.
    pub fn max_buffered_messages_for_priority(&self, priority: MessageBlockPriority) -> usize {
        self.max_buffered_messages
            .get(&priority)
            .copied()
            .unwrap_or_else(|| default_capacity(priority))
    }

    /// A builder preloaded with this configuration.
    pub fn to_builder(&self) -> UplinkProtocolConfigurationBuilder {
        UplinkProtocolConfigurationBuilder {
            max_buffered_messages: self.max_buffered_messages.clone(),
        }
    }
}

fn default_capacity(priority: MessageBlockPriority) -> usize {
    match priority {
        MessageBlockPriority::SessionControl => 8,
        MessageBlockPriority::ChannelInitiation => 32,
        MessageBlockPriority::Default => 64,
        MessageBlockPriority::ToolDescriptorUpdates => 8,
        MessageBlockPriority::Forwarding => 128,
        MessageBlockPriority::LowNonBlockable => 32,
    }
}

/// Builder for [`UplinkProtocolConfiguration`].
#[derive(Clone, Debug)]
pub struct UplinkProtocolConfigurationBuilder {
    max_buffered_messages: BTreeMap<MessageBlockPriority, usize>,
}

impl UplinkProtocolConfigurationBuilder {
    /// Set the queue capacity for one priority.
    pub fn max_buffered_messages_for_priority(
        mut self,
        priority: MessageBlockPriority,
        capacity: usize,
    ) -> Self {
        self.max_buffered_messages.insert(priority, capacity);
        self
    }

    /// Take the snapshot.
    pub fn build(self) -> UplinkProtocolConfiguration {
        UplinkProtocolConfiguration {
            max_buffered_messages: self.max_buffered_messages,
        }
    }
}

/// Source of the process-wide default configuration.
///
/// Created once at startup and handed to whatever constructs sessions.
/// An override only affects configurations fetched afterwards; prioritizers
/// already built keep their capacities.
#[derive(Debug, Default)]
pub struct UplinkConfigurationProvider {
    current: RwLock<Arc<UplinkProtocolConfiguration>>,
}

impl UplinkConfigurationProvider {
    /// A provider starting with `initial`.
    pub fn new(initial: UplinkProtocolConfiguration) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// The configuration to use for new sessions.
    pub fn current(&self) -> Arc<UplinkProtocolConfiguration> {
        self.current.read().clone()
    }

    /// Replace the default for later constructions.
    pub fn override_default(&self, configuration: UplinkProtocolConfiguration) {
        tracing::debug!(?configuration, "overriding default uplink configuration");
        *self.current.write() = Arc::new(configuration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides_single_priority() {
        let config = UplinkProtocolConfiguration::builder()
            .max_buffered_messages_for_priority(MessageBlockPriority::Default, 2)
            .build();
        assert_eq!(config.max_buffered_messages_for_priority(MessageBlockPriority::Default), 2);
        assert_eq!(
            config.max_buffered_messages_for_priority(MessageBlockPriority::Forwarding),
            UplinkProtocolConfiguration::default()
                .max_buffered_messages_for_priority(MessageBlockPriority::Forwarding)
        );
    }

    #[test]
    fn test_override_is_not_retroactive() {
        let provider = UplinkConfigurationProvider::default();
        let before = provider.current();
        provider.override_default(
            before
                .to_builder()
                .max_buffered_messages_for_priority(MessageBlockPriority::LowNonBlockable, 1)
                .build(),
        );
        assert_eq!(
            before.max_buffered_messages_for_priority(MessageBlockPriority::LowNonBlockable),
            32
        );
        assert_eq!(
            provider
                .current()
                .max_buffered_messages_for_priority(MessageBlockPriority::LowNonBlockable),
            1
        );
    }
}
