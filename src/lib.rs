//! realtimemq: an MQTT relay gateway for chat and notification messages.
//!
//! One broker connection per process, owned by the
//! [`mqtt::mqtt_handler::ConnectionManager`]. Every message is written to the
//! SQLite message log before it is sent (outbound) or dispatched (inbound).
//! Applications drive it through [`relay::Relay`].

pub mod auth;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod notification;
pub mod persistence;
pub mod registry;
pub mod relay;

pub use error::{AuthError, PersistenceError, PublishError, RelayError, SubscribeError};
pub use relay::Relay;
