//! Device telemetry ingestion: subscribe to device topics on an MQTT broker,
//! attribute each message to a registered device and persist the decoded
//! key/value payload to DuckDB without blocking message reception.
pub mod config;
pub mod connection;
pub mod db;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod mqtt;
pub mod payload;
pub mod router;
pub mod server;
pub mod telemetry;

#[cfg(test)]
mod test_support;
