// `main.rs` only delegates to `server::run()`. Everything else lives in the
// library crate so it can be tested without a broker.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    device_telemetry_ingest::server::run().await
}
