use async_trait::async_trait;

use crate::device::Device;
use crate::error::PersistenceError;
use crate::payload::{DataKind, DataSide, DecodedPayload};

/// Durable storage for decoded payloads.
///
/// One handle is shared by every in-flight persistence task without extra
/// locking on the caller side, so implementations must accept concurrent
/// `save` calls, including calls for the same device and kind. Repeating a
/// save should leave the "latest" shape unchanged.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn save(
        &self,
        payload: &DecodedPayload,
        device: &Device,
        side: DataSide,
        kind: DataKind,
    ) -> Result<(), PersistenceError>;
}
