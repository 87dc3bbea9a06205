// Shared fakes for the unit tests.
use std::sync::Mutex;

use async_trait::async_trait;
use prometheus::Registry;
use tokio::sync::Notify;

use crate::device::Device;
use crate::error::PersistenceError;
use crate::gateway::PersistenceGateway;
use crate::metrics::IngestMetrics;
use crate::payload::{DataKind, DataSide, DecodedPayload};

pub fn device(id: i64, name: &str) -> Device {
    Device { id, name: name.to_string() }
}

pub fn metrics() -> IngestMetrics {
    IngestMetrics::register(&Registry::new()).expect("fresh registry")
}

#[derive(Debug, Clone)]
pub struct SaveCall {
    pub payload: DecodedPayload,
    pub device: Device,
    pub side: DataSide,
    pub kind: DataKind,
}

/// Records every `save` call. A blocked gateway never completes a save and
/// signals `started` when the first one begins.
#[derive(Default)]
pub struct RecordingGateway {
    calls: Mutex<Vec<SaveCall>>,
    block: bool,
    pub started: Notify,
}

impl RecordingGateway {
    pub fn blocked() -> Self {
        Self {
            block: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<SaveCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PersistenceGateway for RecordingGateway {
    async fn save(
        &self,
        payload: &DecodedPayload,
        device: &Device,
        side: DataSide,
        kind: DataKind,
    ) -> Result<(), PersistenceError> {
        if self.block {
            self.started.notify_one();
            std::future::pending::<()>().await;
        }
        self.calls.lock().unwrap().push(SaveCall {
            payload: payload.clone(),
            device: device.clone(),
            side,
            kind,
        });
        Ok(())
    }
}
