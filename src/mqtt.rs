// rumqttc implementation of `BrokerTransport`.
//
// Each `connect` builds a fresh `AsyncClient`/`EventLoop` pair, polls until
// CONNACK and then hands the event loop to a driver task. The driver turns
// rumqttc events into `TransportEvent`s and exits on the first error instead
// of letting rumqttc reconnect on its own: reconnect decisions belong to the
// `ConnectionManager`.
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::{BrokerTransport, ConnectionOptions, TransportEvent};
use crate::error::TransportError;
use crate::router::{InboundMessage, TopicFilters};

/// How long `disconnect` waits for the driver to flush DISCONNECT.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct Session {
    client: AsyncClient,
    driver: JoinHandle<()>,
}

pub struct MqttTransport {
    filters: TopicFilters,
    events: mpsc::Sender<TransportEvent>,
    request_capacity: usize,
    session: Mutex<Option<Session>>,
}

impl MqttTransport {
    /// `capacity` bounds both the rumqttc request channel and the event
    /// channel returned here. A full event channel slows down reads from the
    /// broker rather than dropping messages.
    pub fn new(filters: TopicFilters, capacity: usize) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(capacity.max(1));
        let transport = Self {
            filters,
            events,
            request_capacity: capacity.max(2),
            session: Mutex::new(None),
        };
        (transport, rx)
    }
}

pub fn mqtt_options(options: &ConnectionOptions) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(&options.client_id, &options.host, options.port);
    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_session(options.clean_session);
    if let Some(credentials) = &options.credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }
    mqtt_options
}

/// MQTT 3.1.1 does not tell a subscriber who published a message, so devices
/// publish under `<root>/<kind>/<connection-id>/...` and the id is read back
/// from that level. Topics without it yield an empty id, which no device is
/// registered under.
pub fn connection_id_from_topic(filters: &TopicFilters, topic: &str) -> String {
    filters
        .split(topic)
        .and_then(|(_, rest)| rest.strip_prefix('/'))
        .and_then(|rest| rest.split('/').next())
        .unwrap_or_default()
        .to_string()
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<bool, TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack.session_present),
            Ok(_) => {}
            Err(e) => return Err(TransportError::Connect(e.to_string())),
        }
    }
}

async fn drive(
    mut eventloop: EventLoop,
    filters: TopicFilters,
    events: mpsc::Sender<TransportEvent>,
    session_present: bool,
) {
    if events
        .send(TransportEvent::Connected { session_present })
        .await
        .is_err()
    {
        return;
    }

    loop {
        let reason = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let connection_id = connection_id_from_topic(&filters, &publish.topic);
                let message = InboundMessage {
                    topic: publish.topic,
                    connection_id,
                    payload: publish.payload,
                };
                if events.send(TransportEvent::MessageReceived(message)).await.is_err() {
                    return;
                }
                continue;
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    warn!(pkid = ack.pkid, "broker rejected subscription");
                } else {
                    debug!(pkid = ack.pkid, "subscription acknowledged");
                }
                continue;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => "client requested disconnect".to_string(),
            Ok(_) => continue,
            Err(e) => e.to_string(),
        };

        let _ = events
            .send(TransportEvent::Disconnected {
                was_connected: true,
                reason,
            })
            .await;
        return;
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn connect(&self, options: &ConnectionOptions) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            previous.driver.abort();
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options(options), self.request_capacity);
        let session_present = tokio::time::timeout(options.connect_timeout, await_connack(&mut eventloop))
            .await
            .map_err(|_| TransportError::ConnectTimeout(options.connect_timeout))??;

        let driver = tokio::spawn(drive(eventloop, self.filters.clone(), self.events.clone(), session_present));
        *session = Some(Session { client, driver });
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        let client = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or(TransportError::NotConnected)?;

        client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe {
                filter: filter.to_string(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Err(TransportError::NotConnected);
        };

        let result = session
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::Disconnect(e.to_string()));

        if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut session.driver).await.is_err() {
            warn!("MQTT driver did not stop in time, aborting it");
            session.driver.abort();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Credentials;

    fn options(port: u16) -> ConnectionOptions {
        ConnectionOptions {
            host: "127.0.0.1".to_string(),
            port,
            client_id: "ingest-test".to_string(),
            credentials: Some(Credentials {
                username: "svc".to_string(),
                password: "secret".to_string(),
            }),
            keep_alive: Duration::from_secs(7),
            connect_timeout: Duration::from_secs(2),
            clean_session: true,
        }
    }

    #[test]
    fn test_connection_id_from_topic() {
        let filters = TopicFilters::new("/devices");
        assert_eq!(connection_id_from_topic(&filters, "/devices/telemetry/dev-1"), "dev-1");
        assert_eq!(connection_id_from_topic(&filters, "/Devices/Attributes/dev-2/fw/v"), "dev-2");
        assert_eq!(connection_id_from_topic(&filters, "/devices/telemetry"), "");
        assert_eq!(connection_id_from_topic(&filters, "/devices/telemetry/"), "");
        assert_eq!(connection_id_from_topic(&filters, "/devices/rpc/dev-1"), "");
    }

    #[test]
    fn test_mqtt_options_mapping() {
        let mqtt = mqtt_options(&options(1884));
        assert_eq!(mqtt.client_id(), "ingest-test");
        assert_eq!(mqtt.broker_address(), ("127.0.0.1".to_string(), 1884));
        assert_eq!(mqtt.keep_alive(), Duration::from_secs(7));
        assert!(mqtt.clean_session());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let (transport, _events) = MqttTransport::new(TopicFilters::new("/devices"), 10);
        // port 1 is reserved and nothing listens there in CI
        let res = transport.connect(&options(1)).await;
        assert!(matches!(
            res,
            Err(TransportError::Connect(_)) | Err(TransportError::ConnectTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_calls_without_session() {
        let (transport, _events) = MqttTransport::new(TopicFilters::new("/devices"), 10);
        assert!(matches!(transport.disconnect().await, Err(TransportError::NotConnected)));
        assert!(matches!(
            transport.subscribe("/devices/telemetry/#").await,
            Err(TransportError::NotConnected)
        ));
    }
}
