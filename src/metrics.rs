// Prometheus counters, one per outcome the ingestion path can produce.
// Handlers gather them from the shared `Registry` for `/metrics`.
use prometheus::{IntCounter, Registry};

#[derive(Clone)]
pub struct IngestMetrics {
    pub messages_received: IntCounter,
    pub messages_ignored: IntCounter,
    pub unknown_device: IntCounter,
    pub decode_failures: IntCounter,
    pub dispatch_rejected: IntCounter,
    pub persisted: IntCounter,
    pub persistence_failures: IntCounter,
    pub reconnect_attempts: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl IngestMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            messages_received: counter(registry, "mqtt_messages_total", "Total MQTT messages received")?,
            messages_ignored: counter(registry, "mqtt_messages_ignored_total", "Messages on topics outside the known prefixes")?,
            unknown_device: counter(registry, "ingest_unknown_device_total", "Messages dropped because the connection id is not registered")?,
            decode_failures: counter(registry, "ingest_decode_failures_total", "Payloads that were not a JSON object")?,
            dispatch_rejected: counter(registry, "ingest_dispatch_rejected_total", "Jobs rejected because the persistence queue was full or closed")?,
            persisted: counter(registry, "ingest_persisted_total", "Payloads stored successfully")?,
            persistence_failures: counter(registry, "ingest_persistence_failures_total", "Payloads the storage layer failed to store")?,
            reconnect_attempts: counter(registry, "mqtt_reconnect_attempts_total", "Reconnect attempts after an unexpected disconnect")?,
        })
    }
}
