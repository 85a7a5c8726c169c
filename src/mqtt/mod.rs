//! # MQTT Integration Module
//!
//! Everything between the relay and the broker: topic validation, the durable
//! message model, the broker transport seam and the connection manager that
//! owns the one broker session of the process.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - broker and backoff settings, rumqttc options
//! ├── topic.rs            - publish topics and subscription filters
//! ├── backoff.rs          - reconnect/retry delay schedule
//! ├── message_manager.rs  - RelayMessage, inbound handlers, partitioned dispatch
//! ├── transport.rs        - BrokerLink / BrokerEvents traits and rumqttc implementations
//! └── mqtt_handler.rs     - ConnectionManager: state machine, reconnect buffer, acks
//! ```
//!
//! Other components never touch the transport directly; they go through the
//! [`mqtt_handler::ConnectionManager`] operations.

pub mod backoff;
pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod topic;
pub mod transport;
