// DuckDB-backed persistence. A single blocking worker thread owns the
// connection; `DbHandle` clones send jobs to it over a crossbeam channel and
// await the reply on a oneshot. That serialises all writes, which is what
// lets any number of dispatcher tasks share one gateway.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use duckdb::arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray};
use duckdb::arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use duckdb::arrow::record_batch::RecordBatch;
use duckdb::{params, Connection};
use tokio::sync::oneshot;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info};

use crate::device::Device;
use crate::error::PersistenceError;
use crate::gateway::PersistenceGateway;
use crate::payload::{key_values, DataKind, DataSide, DecodedPayload, KeyValue};

pub struct SaveRequest {
    pub device: Device,
    pub side: DataSide,
    pub kind: DataKind,
    pub values: Vec<KeyValue>,
    /// microseconds since epoch
    pub recorded_at: i64,
}

pub enum DbCommand {
    Save(Box<SaveRequest>),
    Flush,
    Shutdown,
}

struct DbJob {
    command: DbCommand,
    response: oneshot::Sender<Result<DbResponse, PersistenceError>>,
}

pub enum DbResponse {
    Saved,
    Flushed,
    ShutDown,
}

#[derive(Clone)]
pub struct DbHandle {
    tx: Sender<DbJob>,
}

impl DbHandle {
    fn new(tx: Sender<DbJob>) -> Self {
        DbHandle { tx }
    }

    async fn call(&self, command: DbCommand) -> Result<DbResponse, PersistenceError> {
        let (tx, rx) = oneshot::channel();
        let job = DbJob { command, response: tx };
        self.tx
            .send(job)
            .map_err(|e| PersistenceError::WorkerUnavailable(format!("DB job send error: {}", e)))?;
        rx.await
            .map_err(|e| PersistenceError::WorkerUnavailable(format!("DB job response error: {}", e)))?
    }

    pub async fn save(&self, request: SaveRequest) -> Result<(), PersistenceError> {
        self.call(DbCommand::Save(Box::new(request))).await.map(|_| ())
    }

    /// Force a CHECKPOINT so the WAL is folded into the database file.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        self.call(DbCommand::Flush).await.map(|_| ())
    }

    pub async fn shutdown(&self) -> Result<(), PersistenceError> {
        self.call(DbCommand::Shutdown).await.map(|_| ())
    }
}

pub fn create_tables(conn: &Connection) -> Result<(), PersistenceError> {
    for kind in [DataKind::Telemetry, DataKind::Attribute] {
        let latest = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                device_id BIGINT NOT NULL,
                key_name VARCHAR NOT NULL,
                data_side VARCHAR NOT NULL,
                value_type VARCHAR NOT NULL,
                value_boolean BOOLEAN,
                value_string VARCHAR,
                value_long BIGINT,
                value_double DOUBLE,
                value_json VARCHAR,
                updated_at TIMESTAMP NOT NULL,
                PRIMARY KEY (device_id, key_name)
            )",
            kind.latest_table()
        );
        let history = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                device_id BIGINT,
                key_name VARCHAR,
                data_side VARCHAR,
                value_type VARCHAR,
                value_boolean BOOLEAN,
                value_string VARCHAR,
                value_long BIGINT,
                value_double DOUBLE,
                value_json VARCHAR,
                recorded_at TIMESTAMP
            )",
            kind.history_table()
        );
        conn.execute(&latest, [])?;
        conn.execute(&history, [])?;
    }
    Ok(())
}

/// Open the database and start the worker thread that owns it. `None` or
/// `":memory:"` opens an in-memory database.
pub fn start_db_worker(path: Option<&str>) -> Result<(DbHandle, JoinHandle<()>), PersistenceError> {
    let mut conn = match path {
        Some(p) if p != ":memory:" => Connection::open(p)?,
        _ => Connection::open_in_memory()?,
    };
    create_tables(&conn)?;
    info!(path = ?path, "DuckDB storage ready");

    let (tx, rx): (Sender<DbJob>, Receiver<DbJob>) = unbounded();
    let handle = DbHandle::new(tx);

    let join = task::spawn_blocking(move || {
        while let Ok(job) = rx.recv() {
            match job.command {
                DbCommand::Save(request) => {
                    let res = save_in_transaction(&mut conn, &request);
                    let _ = job.response.send(res.map(|_| DbResponse::Saved));
                }
                DbCommand::Flush => {
                    let res = conn.execute("CHECKPOINT", []);
                    let _ = job.response.send(res.map(|_| DbResponse::Flushed).map_err(PersistenceError::from));
                }
                DbCommand::Shutdown => {
                    let res = conn.close();
                    let _ = job
                        .response
                        .send(res.map(|_| DbResponse::ShutDown).map_err(|(_, e)| PersistenceError::from(e)));
                    debug!("DuckDB worker stopped");
                    return;
                }
            }
        }
        debug!("DuckDB worker channel closed");
    });

    Ok((handle, join))
}

fn save_in_transaction(conn: &mut Connection, request: &SaveRequest) -> Result<(), PersistenceError> {
    if request.values.is_empty() {
        return Ok(());
    }

    let tx = conn.transaction()?;
    {
        let sql = format!(
            "INSERT OR REPLACE INTO {} (device_id, key_name, data_side, value_type, value_boolean, value_string, value_long, value_double, value_json, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, make_timestamp(CAST(? AS BIGINT)))",
            request.kind.latest_table()
        );
        let mut stmt = tx.prepare(&sql)?;
        for kv in &request.values {
            stmt.execute(params![
                request.device.id,
                kv.key,
                request.side.as_str(),
                kv.value_type.as_str(),
                kv.boolean,
                kv.string,
                kv.long,
                kv.double,
                kv.json,
                request.recorded_at,
            ])?;
        }
    }
    {
        let batch = history_record_batch(request)?;
        let mut appender = tx.appender(request.kind.history_table())?;
        appender.append_record_batch(batch)?;
        appender.flush()?;
    }
    tx.commit()?;
    Ok(())
}

fn history_record_batch(request: &SaveRequest) -> Result<RecordBatch, PersistenceError> {
    let values = &request.values;
    let n = values.len();

    let schema = Arc::new(Schema::new(vec![
        Field::new("device_id", DataType::Int64, false),
        Field::new("key_name", DataType::Utf8, false),
        Field::new("data_side", DataType::Utf8, false),
        Field::new("value_type", DataType::Utf8, false),
        Field::new("value_boolean", DataType::Boolean, true),
        Field::new("value_string", DataType::Utf8, true),
        Field::new("value_long", DataType::Int64, true),
        Field::new("value_double", DataType::Float64, true),
        Field::new("value_json", DataType::Utf8, true),
        Field::new("recorded_at", DataType::Timestamp(TimeUnit::Microsecond, None), false),
    ]));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(vec![request.device.id; n])),
        Arc::new(StringArray::from(values.iter().map(|kv| kv.key.clone()).collect::<Vec<String>>())),
        Arc::new(StringArray::from(vec![request.side.as_str(); n])),
        Arc::new(StringArray::from(values.iter().map(|kv| kv.value_type.as_str()).collect::<Vec<&str>>())),
        Arc::new(BooleanArray::from(values.iter().map(|kv| kv.boolean).collect::<Vec<Option<bool>>>())),
        Arc::new(StringArray::from(values.iter().map(|kv| kv.string.clone()).collect::<Vec<Option<String>>>())),
        Arc::new(Int64Array::from(values.iter().map(|kv| kv.long).collect::<Vec<Option<i64>>>())),
        Arc::new(Float64Array::from(values.iter().map(|kv| kv.double).collect::<Vec<Option<f64>>>())),
        Arc::new(StringArray::from(values.iter().map(|kv| kv.json.clone()).collect::<Vec<Option<String>>>())),
        Arc::new(TimestampMicrosecondArray::from(vec![request.recorded_at; n])),
    ];

    Ok(RecordBatch::try_new(schema, columns)?)
}

/// `PersistenceGateway` over the DuckDB worker.
#[derive(Clone)]
pub struct DuckDbGateway {
    handle: DbHandle,
}

impl DuckDbGateway {
    pub fn new(handle: DbHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl PersistenceGateway for DuckDbGateway {
    async fn save(
        &self,
        payload: &DecodedPayload,
        device: &Device,
        side: DataSide,
        kind: DataKind,
    ) -> Result<(), PersistenceError> {
        let request = SaveRequest {
            device: device.clone(),
            side,
            kind,
            values: key_values(payload),
            recorded_at: Utc::now().timestamp_micros(),
        };
        self.handle.save(request).await.inspect_err(|e| {
            error!(device_id = device.id, kind = kind.as_str(), error = %e, "DuckDB save failed");
        })
    }
}
