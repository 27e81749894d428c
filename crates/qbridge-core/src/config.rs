//! Centralized configuration for qbridge.
//!
//! Protocol constants are fixed by the wire format. Lifecycle timings have
//! defaults here and can be overridden per connection through
//! [`ConnectionConfig`].

use std::time::Duration;

/// Wire protocol constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const VERSION: u32 = 2;
    pub const ROOT_IDENTIFIER: &'static str = "root";
    /// Marker key of the tagged map that stands for an object reference.
    pub const OBJECT_TAG_KEY: &'static str = "_qbackend_";
    pub const OBJECT_TAG_VALUE: &'static str = "object";
    /// Property name under which a model publishes its model API object.
    pub const MODEL_API_PROPERTY: &'static str = "_qb_model";
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024; // 64MB
    /// Longest accepted decimal length prefix, in bytes.
    pub const MAX_LENGTH_DIGITS: usize = 20;
    pub const INBOUND_QUEUE_CAPACITY: usize = 128;
    pub const MAX_CREATABLE_TYPES: usize = 10;
}

/// Object lifecycle timings.
pub struct LifecycleConfig;

impl LifecycleConfig {
    /// How long an object with no references stays registered.
    pub const GRACE_PERIOD: Duration = Duration::from_secs(5);
    /// Minimum time between two collection sweeps.
    pub const COLLECTION_INTERVAL: Duration = Duration::from_secs(5);
}

/// Per-connection tunables.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub grace_period: Duration,
    pub collection_interval: Duration,
    pub queue_capacity: usize,
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            grace_period: LifecycleConfig::GRACE_PERIOD,
            collection_interval: LifecycleConfig::COLLECTION_INTERVAL,
            queue_capacity: ProtocolConfig::INBOUND_QUEUE_CAPACITY,
            max_message_size: ProtocolConfig::MAX_MESSAGE_SIZE,
        }
    }
}
