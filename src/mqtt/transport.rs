//! Broker transport seam.
//!
//! The connection kernel talks to the broker through two halves: a cloneable
//! request side ([`BrokerLink`]) and a single-owner event side
//! ([`BrokerEvents`]). The rumqttc client and event loop implement them; tests
//! plug in an in-process fake.

use std::future::Future;
use std::pin::Pin;

use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming,
    Outgoing, QoS,
};
use tracing::debug;

use super::config::BrokerConfig;
use crate::error::TransportError;

pub type LinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// What the kernel cares about from the broker event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Inbound {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
    },
    /// A publish left the client; carries the packet id used for its ack
    PublishQueued { pkid: u16 },
    /// PUBACK (QoS 1) or PUBCOMP (QoS 2)
    Acknowledged { pkid: u16 },
    /// Broker sent DISCONNECT
    Disconnected(String),
    Other,
}

pub trait BrokerLink: Send + Sync {
    fn publish(&self, topic: String, qos: QoS, payload: Vec<u8>) -> LinkFuture<'_, ()>;
    fn subscribe(&self, filter: String, qos: QoS) -> LinkFuture<'_, ()>;
    fn unsubscribe(&self, filter: String) -> LinkFuture<'_, ()>;
    fn disconnect(&self) -> LinkFuture<'_, ()>;
}

pub trait BrokerEvents: Send {
    /// Credentials for the next connection attempt.
    fn set_credentials(&mut self, username: &str, password: &str);

    /// Next event; an error means the connection is gone and the next poll reconnects.
    fn poll(&mut self) -> LinkFuture<'_, LinkEvent>;
}

pub struct MqttLink {
    client: AsyncClient,
}

impl MqttLink {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

impl BrokerLink for MqttLink {
    fn publish(&self, topic: String, qos: QoS, payload: Vec<u8>) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            self.client
                .publish(topic, qos, false, payload)
                .await
                .map_err(TransportError::from)
        })
    }

    fn subscribe(&self, filter: String, qos: QoS) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            self.client
                .subscribe(filter, qos)
                .await
                .map_err(TransportError::from)
        })
    }

    fn unsubscribe(&self, filter: String) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            self.client
                .unsubscribe(filter)
                .await
                .map_err(TransportError::from)
        })
    }

    fn disconnect(&self) -> LinkFuture<'_, ()> {
        Box::pin(async move { self.client.disconnect().await.map_err(TransportError::from) })
    }
}

pub struct MqttEvents {
    event_loop: EventLoop,
}

impl MqttEvents {
    pub fn new(event_loop: EventLoop) -> Self {
        Self { event_loop }
    }
}

impl BrokerEvents for MqttEvents {
    fn set_credentials(&mut self, username: &str, password: &str) {
        self.event_loop
            .mqtt_options
            .set_credentials(username.to_string(), password.to_string());
    }

    fn poll(&mut self) -> LinkFuture<'_, LinkEvent> {
        Box::pin(async move {
            let event = self.event_loop.poll().await?;
            Ok(translate(event))
        })
    }
}

fn translate(event: Event) -> LinkEvent {
    match event {
        Event::Incoming(Incoming::ConnAck(ack)) => {
            debug!("ConnAck: {:?}", ack.code);
            LinkEvent::Connected
        }
        Event::Incoming(Incoming::Publish(publish)) => LinkEvent::Inbound {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
            qos: publish.qos,
        },
        Event::Incoming(Incoming::PubAck(ack)) => LinkEvent::Acknowledged { pkid: ack.pkid },
        Event::Incoming(Incoming::PubComp(comp)) => LinkEvent::Acknowledged { pkid: comp.pkid },
        Event::Incoming(Incoming::Disconnect) => {
            LinkEvent::Disconnected("broker sent DISCONNECT".to_string())
        }
        Event::Outgoing(Outgoing::Publish(pkid)) => LinkEvent::PublishQueued { pkid },
        _ => LinkEvent::Other,
    }
}

/// Builds the client halves for `config`; nothing touches the network until
/// the event side is polled.
pub fn connect_parts(config: &BrokerConfig) -> (MqttLink, MqttEvents) {
    let (client, event_loop) =
        AsyncClient::new(config.mqtt_options(), config.request_capacity.max(1));
    (MqttLink::new(client), MqttEvents::new(event_loop))
}

impl From<ConnectionError> for TransportError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Io(io) => TransportError::Io(io.to_string()),
            ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
                TransportError::Timeout
            }
            ConnectionError::RequestsDone => TransportError::Closed,
            ConnectionError::ConnectionRefused(code) => match code {
                ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                    TransportError::NotAuthorized(format!("{code:?}"))
                }
                other => TransportError::Refused(format!("{other:?}")),
            },
            ConnectionError::MqttState(state) => TransportError::Protocol(state.to_string()),
            ConnectionError::NotConnAck(packet) => {
                TransportError::Protocol(format!("expected ConnAck, got {packet:?}"))
            }
            #[allow(unreachable_patterns)]
            other => TransportError::Tls(other.to_string()),
        }
    }
}

impl From<ClientError> for TransportError {
    fn from(e: ClientError) -> Self {
        TransportError::Client(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, PubAck, Publish};

    #[test]
    fn broker_events_are_translated() {
        assert_eq!(
            translate(Event::Incoming(Incoming::ConnAck(ConnAck::new(
                ConnectReturnCode::Success,
                false
            )))),
            LinkEvent::Connected
        );
        assert_eq!(
            translate(Event::Incoming(Incoming::PubAck(PubAck::new(7)))),
            LinkEvent::Acknowledged { pkid: 7 }
        );
        assert_eq!(
            translate(Event::Outgoing(Outgoing::Publish(3))),
            LinkEvent::PublishQueued { pkid: 3 }
        );
        assert_eq!(
            translate(Event::Incoming(Incoming::Publish(Publish::new(
                "chat/general",
                QoS::AtLeastOnce,
                "hi"
            )))),
            LinkEvent::Inbound {
                topic: "chat/general".to_string(),
                payload: b"hi".to_vec(),
                qos: QoS::AtLeastOnce,
            }
        );
        assert_eq!(translate(Event::Outgoing(Outgoing::PingReq)), LinkEvent::Other);
    }

    #[test]
    fn credential_refusals_map_to_not_authorized() {
        let err: TransportError =
            ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword).into();
        assert!(err.is_auth_refusal());

        let err: TransportError =
            ConnectionError::ConnectionRefused(ConnectReturnCode::ServiceUnavailable).into();
        assert_eq!(err, TransportError::Refused("ServiceUnavailable".to_string()));

        let err: TransportError = ConnectionError::NetworkTimeout.into();
        assert_eq!(err, TransportError::Timeout);
    }
}
