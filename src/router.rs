// Topic classification and device resolution. Runs synchronously on the
// reception path, so nothing in here may await.
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::device::DeviceRegistry;
use crate::dispatcher::{IngestionDispatcher, SubmitOutcome};
use crate::metrics::IngestMetrics;
use crate::payload::DataKind;

/// One message as delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub connection_id: String,
    pub payload: Bytes,
}

/// The two topic spaces under `<root>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilters {
    telemetry_prefix: String,
    attributes_prefix: String,
}

impl TopicFilters {
    pub fn new(root: &str) -> Self {
        let root = root.trim_end_matches('/');
        Self {
            telemetry_prefix: format!("{}/telemetry", root),
            attributes_prefix: format!("{}/attributes", root),
        }
    }

    /// Wildcard filters to subscribe to once connected.
    pub fn subscriptions(&self) -> [String; 2] {
        [
            format!("{}/#", self.telemetry_prefix),
            format!("{}/#", self.attributes_prefix),
        ]
    }

    /// Case-insensitive prefix match. Returns the data kind and the rest of
    /// the topic after the matched prefix.
    pub fn split<'a>(&self, topic: &'a str) -> Option<(DataKind, &'a str)> {
        [
            (DataKind::Telemetry, self.telemetry_prefix.as_str()),
            (DataKind::Attribute, self.attributes_prefix.as_str()),
        ]
        .into_iter()
        .find_map(|(kind, prefix)| {
            let head = topic.get(..prefix.len())?;
            head.eq_ignore_ascii_case(prefix).then(|| (kind, &topic[prefix.len()..]))
        })
    }

    pub fn classify(&self, topic: &str) -> Option<DataKind> {
        self.split(topic).map(|(kind, _)| kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Ignored,
    UnknownDevice,
    Dispatched(SubmitOutcome),
}

pub struct TopicRouter {
    filters: TopicFilters,
    registry: Arc<dyn DeviceRegistry>,
    dispatcher: Arc<IngestionDispatcher>,
    metrics: IngestMetrics,
}

impl TopicRouter {
    pub fn new(
        filters: TopicFilters,
        registry: Arc<dyn DeviceRegistry>,
        dispatcher: Arc<IngestionDispatcher>,
        metrics: IngestMetrics,
    ) -> Self {
        Self {
            filters,
            registry,
            dispatcher,
            metrics,
        }
    }

    pub fn route(&self, message: &InboundMessage) -> RouteOutcome {
        self.metrics.messages_received.inc();
        debug!(topic = %message.topic, connection_id = %message.connection_id, "received message");

        let Some(kind) = self.filters.classify(&message.topic) else {
            self.metrics.messages_ignored.inc();
            return RouteOutcome::Ignored;
        };

        let Some(device) = self.registry.lookup(&message.connection_id) else {
            debug!(
                topic = %message.topic,
                connection_id = %message.connection_id,
                "no device registered for connection id, dropping message"
            );
            self.metrics.unknown_device.inc();
            return RouteOutcome::UnknownDevice;
        };

        RouteOutcome::Dispatched(self.dispatcher.submit(device, kind, message.payload.clone()))
    }
}
