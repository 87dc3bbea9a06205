// Decode-and-persist stage.
//
// `submit` runs on the reception path: it hands the raw payload to a bounded
// queue without awaiting. A supervisor task drains the queue into a
// `JoinSet`, with a semaphore capping in-flight tasks. Each task decodes its
// payload and calls `save`. Tasks complete in any order.
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::device::Device;
use crate::gateway::PersistenceGateway;
use crate::metrics::IngestMetrics;
use crate::payload::{decode_payload, DataKind, DataSide};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    pub max_in_flight: usize,
    /// Upper bound on how long a draining shutdown waits for in-flight saves.
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_in_flight: 16,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    QueueFull,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Persist everything already queued, waiting up to the grace period.
    Drain,
    /// Abort queued and in-flight work immediately.
    Abandon,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub persisted: u64,
    pub failed: u64,
    pub undecodable: u64,
    /// Queued jobs never started plus tasks aborted mid-flight.
    pub abandoned: u64,
}

impl DispatchReport {
    fn record(&mut self, result: Result<JobOutcome, JoinError>) {
        match result {
            Ok(JobOutcome::Persisted) => self.persisted += 1,
            Ok(JobOutcome::Failed) => self.failed += 1,
            Ok(JobOutcome::Undecodable) => self.undecodable += 1,
            Err(e) if e.is_cancelled() => self.abandoned += 1,
            Err(e) => {
                error!(error = %e, "persistence task panicked");
                self.failed += 1;
            }
        }
    }
}

struct PersistJob {
    device: Device,
    kind: DataKind,
    payload: Bytes,
}

enum JobOutcome {
    Persisted,
    Failed,
    Undecodable,
}

pub struct IngestionDispatcher {
    jobs: mpsc::Sender<PersistJob>,
    metrics: IngestMetrics,
    shutdown_tx: Mutex<Option<oneshot::Sender<ShutdownMode>>>,
    supervisor: Mutex<Option<JoinHandle<DispatchReport>>>,
}

impl IngestionDispatcher {
    /// Spawn the supervisor. Must be called inside a tokio runtime.
    pub fn start(gateway: Arc<dyn PersistenceGateway>, config: DispatcherConfig, metrics: IngestMetrics) -> Self {
        let (jobs, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let supervisor = tokio::spawn(
            supervise(rx, shutdown_rx, gateway, config, metrics.clone()).instrument(info_span!("dispatcher")),
        );

        Self {
            jobs,
            metrics,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    /// Queue `payload` to be decoded and persisted. Never waits.
    pub fn submit(&self, device: Device, kind: DataKind, payload: Bytes) -> SubmitOutcome {
        let job = PersistJob { device, kind, payload };

        match self.jobs.try_send(job) {
            Ok(()) => SubmitOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(
                    device_id = job.device.id,
                    device_name = %job.device.name,
                    payload = %String::from_utf8_lossy(&job.payload),
                    "persistence queue full, dropping message"
                );
                self.metrics.dispatch_rejected.inc();
                SubmitOutcome::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                debug!(device_id = job.device.id, "dispatcher shutting down, dropping message");
                self.metrics.dispatch_rejected.inc();
                SubmitOutcome::ShuttingDown
            }
        }
    }

    /// Stop intake and settle outstanding work according to `mode`.
    /// Later calls return an empty report.
    pub async fn shutdown(&self, mode: ShutdownMode) -> DispatchReport {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(mode);
        }
        let Some(handle) = self.supervisor.lock().await.take() else {
            return DispatchReport::default();
        };
        match handle.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "dispatcher supervisor failed");
                DispatchReport::default()
            }
        }
    }
}

async fn supervise(
    mut rx: mpsc::Receiver<PersistJob>,
    mut shutdown_rx: oneshot::Receiver<ShutdownMode>,
    gateway: Arc<dyn PersistenceGateway>,
    config: DispatcherConfig,
    metrics: IngestMetrics,
) -> DispatchReport {
    let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
    let mut in_flight: JoinSet<JobOutcome> = JoinSet::new();
    let mut report = DispatchReport::default();

    let mode = loop {
        tokio::select! {
            biased;
            mode = &mut shutdown_rx => break mode.unwrap_or(ShutdownMode::Drain),
            Some(result) = in_flight.join_next(), if !in_flight.is_empty() => report.record(result),
            permit = Arc::clone(&permits).acquire_owned() => {
                let Ok(permit) = permit else { break ShutdownMode::Abandon };
                tokio::select! {
                    mode = &mut shutdown_rx => break mode.unwrap_or(ShutdownMode::Drain),
                    job = rx.recv() => match job {
                        Some(job) => spawn_persist(&mut in_flight, job, permit, &gateway, &metrics),
                        None => break ShutdownMode::Drain,
                    },
                }
            }
        }
    };

    rx.close();

    match mode {
        ShutdownMode::Drain => {
            let drained = tokio::time::timeout(config.shutdown_grace, async {
                // Permit first, so a job is only taken off the queue once it
                // can start. Anything still queued at the deadline is counted.
                while let Ok(permit) = Arc::clone(&permits).acquire_owned().await {
                    let Some(job) = rx.recv().await else { break };
                    spawn_persist(&mut in_flight, job, permit, &gateway, &metrics);
                }
                while let Some(result) = in_flight.join_next().await {
                    report.record(result);
                }
            })
            .await;

            if drained.is_err() {
                while rx.try_recv().is_ok() {
                    report.abandoned += 1;
                }
                warn!(
                    remaining = in_flight.len(),
                    grace = ?config.shutdown_grace,
                    "shutdown grace period elapsed, abandoning persistence tasks"
                );
            }
        }
        ShutdownMode::Abandon => {
            while rx.try_recv().is_ok() {
                report.abandoned += 1;
            }
        }
    }

    in_flight.abort_all();
    while let Some(result) = in_flight.join_next().await {
        report.record(result);
    }

    info!(
        persisted = report.persisted,
        failed = report.failed,
        undecodable = report.undecodable,
        abandoned = report.abandoned,
        "dispatcher stopped"
    );
    report
}

fn spawn_persist(
    in_flight: &mut JoinSet<JobOutcome>,
    job: PersistJob,
    permit: OwnedSemaphorePermit,
    gateway: &Arc<dyn PersistenceGateway>,
    metrics: &IngestMetrics,
) {
    let gateway = Arc::clone(gateway);
    let metrics = metrics.clone();
    in_flight.spawn(
        async move {
            let _permit = permit;
            persist(job, gateway.as_ref(), &metrics).await
        }
        .in_current_span(),
    );
}

async fn persist(job: PersistJob, gateway: &dyn PersistenceGateway, metrics: &IngestMetrics) -> JobOutcome {
    let raw = String::from_utf8_lossy(&job.payload);
    let payload = match decode_payload(&job.payload) {
        Ok(p) => p,
        Err(e) => {
            metrics.decode_failures.inc();
            error!(
                device_id = job.device.id,
                device_name = %job.device.name,
                kind = job.kind.as_str(),
                payload = %raw,
                error = %e,
                "failed to decode payload"
            );
            return JobOutcome::Undecodable;
        }
    };

    match gateway
        .save(&payload, &job.device, DataSide::ClientSide, job.kind)
        .await
    {
        Ok(()) => {
            metrics.persisted.inc();
            debug!(device_id = job.device.id, kind = job.kind.as_str(), "payload persisted");
            JobOutcome::Persisted
        }
        Err(e) => {
            metrics.persistence_failures.inc();
            error!(
                device_id = job.device.id,
                device_name = %job.device.name,
                kind = job.kind.as_str(),
                payload = %raw,
                error = %e,
                "failed to persist payload"
            );
            JobOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistenceError;
    use crate::gateway::MockPersistenceGateway;
    use crate::test_support::{device, metrics, RecordingGateway};
    use serde_json::json;
    use tracing_test::traced_test;

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            queue_capacity: 8,
            max_in_flight: 2,
            shutdown_grace: Duration::from_secs(5),
        }
    }

    fn body(text: &'static str) -> Bytes {
        Bytes::from_static(text.as_bytes())
    }

    #[tokio::test]
    async fn test_valid_payload_is_saved_client_side() {
        let gateway = Arc::new(RecordingGateway::default());
        let dispatcher = IngestionDispatcher::start(gateway.clone(), config(), metrics());

        let outcome = dispatcher.submit(device(1, "d1"), DataKind::Telemetry, body(r#"{"temp":21.5}"#));
        assert_eq!(outcome, SubmitOutcome::Queued);

        let report = dispatcher.shutdown(ShutdownMode::Drain).await;
        assert_eq!(
            report,
            DispatchReport {
                persisted: 1,
                failed: 0,
                undecodable: 0,
                abandoned: 0
            }
        );

        let calls = gateway.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].payload.get("temp"), Some(&json!(21.5)));
        assert_eq!(calls[0].device, device(1, "d1"));
        assert_eq!(calls[0].side, DataSide::ClientSide);
        assert_eq!(calls[0].kind, DataKind::Telemetry);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_invalid_payload_logs_once_and_never_saves() {
        let gateway = Arc::new(RecordingGateway::default());
        let m = metrics();
        let dispatcher = IngestionDispatcher::start(gateway.clone(), config(), m.clone());

        let outcome = dispatcher.submit(device(1, "d1"), DataKind::Telemetry, body("not-json"));
        assert_eq!(outcome, SubmitOutcome::Queued);

        let report = dispatcher.shutdown(ShutdownMode::Drain).await;
        assert_eq!(report.persisted, 0);
        assert_eq!(report.undecodable, 1);
        assert!(gateway.calls().is_empty());
        assert_eq!(m.decode_failures.get(), 1);

        logs_assert(|lines: &[&str]| {
            let hits: Vec<&&str> = lines.iter().filter(|l| l.contains("failed to decode payload")).collect();
            match hits.as_slice() {
                [line] if line.contains("not-json") && line.contains("device_id=1") => Ok(()),
                other => Err(format!("expected one decode failure log, got {}", other.len())),
            }
        });
    }

    #[tokio::test]
    #[traced_test]
    async fn test_persistence_failure_is_isolated() {
        let mut mock = MockPersistenceGateway::new();
        mock.expect_save()
            .withf(|_, device, _, _| device.id == 1)
            .times(1)
            .returning(|_, _, _, _| Err(PersistenceError::WorkerUnavailable("disk full".to_string())));
        mock.expect_save()
            .withf(|_, device, _, _| device.id == 2)
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let gateway = Arc::new(mock);

        let m = metrics();
        let dispatcher = IngestionDispatcher::start(gateway.clone(), config(), m.clone());
        assert_eq!(dispatcher.submit(device(1, "d1"), DataKind::Attribute, body(r#"{"a":1}"#)), SubmitOutcome::Queued);
        assert_eq!(dispatcher.submit(device(2, "d2"), DataKind::Attribute, body(r#"{"a":2}"#)), SubmitOutcome::Queued);

        let report = dispatcher.shutdown(ShutdownMode::Drain).await;
        assert_eq!(report.persisted, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(m.persistence_failures.get(), 1);
        assert_eq!(m.persisted.get(), 1);

        logs_assert(|lines: &[&str]| {
            let hits: Vec<&&str> = lines.iter().filter(|l| l.contains("failed to persist payload")).collect();
            match hits.as_slice() {
                [line]
                    if line.contains("device_id=1")
                        && line.contains("device_name=d1")
                        && line.contains(r#"{"a":1}"#)
                        && line.contains("disk full") =>
                {
                    Ok(())
                }
                other => Err(format!("expected one persistence failure log for d1, got {:?}", other)),
            }
        });
    }

    #[tokio::test]
    async fn test_submit_does_not_wait_for_slow_saves() {
        let gateway = Arc::new(RecordingGateway::blocked());
        let dispatcher = IngestionDispatcher::start(
            gateway.clone(),
            DispatcherConfig {
                queue_capacity: 2,
                max_in_flight: 1,
                shutdown_grace: Duration::from_millis(50),
            },
            metrics(),
        );

        // Wait until the first save is in progress and holding the only permit.
        assert_eq!(dispatcher.submit(device(1, "d1"), DataKind::Telemetry, body(r#"{"n":0}"#)), SubmitOutcome::Queued);
        gateway.started.notified().await;

        // The supervisor is parked on the permit, so the queue fills up.
        let outcomes: Vec<SubmitOutcome> = (1..=4)
            .map(|n| {
                dispatcher.submit(
                    device(1, "d1"),
                    DataKind::Telemetry,
                    Bytes::from(format!(r#"{{"n":{}}}"#, n)),
                )
            })
            .collect();
        assert!(outcomes.contains(&SubmitOutcome::QueueFull));

        let report = dispatcher.shutdown(ShutdownMode::Abandon).await;
        assert_eq!(report.persisted, 0);
        assert!(report.abandoned >= 1);
    }

    #[tokio::test]
    async fn test_drain_past_grace_accounts_for_every_queued_job() {
        let gateway = Arc::new(RecordingGateway::blocked());
        let dispatcher = IngestionDispatcher::start(
            gateway.clone(),
            DispatcherConfig {
                queue_capacity: 8,
                max_in_flight: 1,
                shutdown_grace: Duration::from_millis(50),
            },
            metrics(),
        );

        assert_eq!(dispatcher.submit(device(1, "d1"), DataKind::Telemetry, body(r#"{"n":0}"#)), SubmitOutcome::Queued);
        gateway.started.notified().await;
        for n in 1..=3 {
            let outcome = dispatcher.submit(
                device(1, "d1"),
                DataKind::Telemetry,
                Bytes::from(format!(r#"{{"n":{}}}"#, n)),
            );
            assert_eq!(outcome, SubmitOutcome::Queued);
        }

        let report = dispatcher.shutdown(ShutdownMode::Drain).await;
        assert_eq!(
            report,
            DispatchReport {
                persisted: 0,
                failed: 0,
                undecodable: 0,
                abandoned: 4
            }
        );
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let gateway = Arc::new(RecordingGateway::default());
        let dispatcher = IngestionDispatcher::start(gateway.clone(), config(), metrics());
        dispatcher.shutdown(ShutdownMode::Drain).await;

        let outcome = dispatcher.submit(device(1, "d1"), DataKind::Telemetry, body(r#"{"x":1}"#));
        assert_eq!(outcome, SubmitOutcome::ShuttingDown);
        assert_eq!(dispatcher.shutdown(ShutdownMode::Drain).await, DispatchReport::default());
    }
}
