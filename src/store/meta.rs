// =============================================================================
// Metadata Store — durable ingestion/backtest bookkeeping in SQLite
// =============================================================================
//
// Tables:
//   ingestion_job   — backfill job lifecycle and progress
//   data_source     — one row per (pair, timeframe, exchange) series
//   data_gap        — detected holes in stored candle series
//   backtest_result — persisted backtest / optimization runs
//
// Writes are idempotent upserts keyed by (pair, timeframe, exchange) or by
// job/record id. The connection lives behind a mutex; every operation is a
// single short transaction.
// =============================================================================

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::{Pair, Timeframe};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(CoreError::validation(format!("unknown job status: {other}"))),
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionJob {
    pub id: String,
    pub pair: String,
    pub timeframe: String,
    pub exchange: String,
    pub status: JobStatus,
    pub priority: i64,
    pub candles_fetched: i64,
    pub candles_stored: i64,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub pair: String,
    pub timeframe: String,
    pub exchange: String,
    pub earliest_date: i64,
    pub latest_date: i64,
    pub total_candles: i64,
    pub file_path: String,
    pub file_size: i64,
    pub is_complete: bool,
    pub last_updated: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataGap {
    pub id: String,
    pub pair: String,
    pub timeframe: String,
    pub gap_start: i64,
    pub gap_end: i64,
    pub reason: String,
    pub is_repaired: bool,
    pub detected_at: String,
    pub repaired_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestRecord {
    pub id: String,
    pub user_id: String,
    /// "RUN" or "OPTIMIZE".
    pub kind: String,
    pub exchange: String,
    pub pair: String,
    pub timeframe: String,
    pub strategy_type: String,
    pub strategy_params: Value,
    pub backtest_config: Value,
    pub result: Value,
    pub created_at: String,
}

/// Filters for the backtest history listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BacktestRecordFilter {
    #[serde(alias = "type")]
    pub kind: Option<String>,
    #[serde(alias = "strategyType")]
    pub strategy_type: Option<String>,
    /// Milliseconds since epoch, inclusive.
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// SQLite-backed metadata store.
pub struct MetaStore {
    conn: Mutex<Connection>,
}

impl MetaStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &str) -> CoreResult<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!(path, "metadata store opened");
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> CoreResult<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ingestion_job (
                id TEXT PRIMARY KEY,
                pair TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                exchange TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                candles_fetched INTEGER NOT NULL DEFAULT 0,
                candles_stored INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error_message TEXT
            );
            CREATE TABLE IF NOT EXISTS data_source (
                pair TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                exchange TEXT NOT NULL,
                earliest_date INTEGER NOT NULL,
                latest_date INTEGER NOT NULL,
                total_candles INTEGER NOT NULL,
                file_path TEXT NOT NULL,
                file_size INTEGER NOT NULL DEFAULT 0,
                is_complete INTEGER NOT NULL DEFAULT 0,
                last_updated TEXT NOT NULL,
                PRIMARY KEY (pair, timeframe, exchange)
            );
            CREATE TABLE IF NOT EXISTS data_gap (
                id TEXT PRIMARY KEY,
                pair TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                gap_start INTEGER NOT NULL,
                gap_end INTEGER NOT NULL,
                reason TEXT NOT NULL,
                is_repaired INTEGER NOT NULL DEFAULT 0,
                detected_at TEXT NOT NULL,
                repaired_at TEXT
            );
            CREATE TABLE IF NOT EXISTS backtest_result (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                exchange TEXT NOT NULL,
                pair TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                strategy_type TEXT NOT NULL,
                strategy_params TEXT NOT NULL,
                backtest_config TEXT NOT NULL,
                result TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_gap_series
                ON data_gap (pair, timeframe, is_repaired);
            CREATE INDEX IF NOT EXISTS idx_backtest_user
                ON backtest_result (user_id, created_at);",
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Ingestion jobs
    // -------------------------------------------------------------------------

    pub fn create_job(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        exchange: &str,
        priority: i64,
    ) -> CoreResult<IngestionJob> {
        let job = IngestionJob {
            id: Uuid::new_v4().to_string(),
            pair: pair.to_string(),
            timeframe: timeframe.to_string(),
            exchange: exchange.to_string(),
            status: JobStatus::Pending,
            priority,
            candles_fetched: 0,
            candles_stored: 0,
            created_at: Utc::now().to_rfc3339(),
            started_at: None,
            completed_at: None,
            error_message: None,
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ingestion_job
                (id, pair, timeframe, exchange, status, priority,
                 candles_fetched, candles_stored, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                job.id,
                job.pair,
                job.timeframe,
                job.exchange,
                job.status.as_str(),
                job.priority,
                job.candles_fetched,
                job.candles_stored,
                job.created_at,
            ],
        )?;
        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> CoreResult<IngestionJob> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, pair, timeframe, exchange, status, priority,
                    candles_fetched, candles_stored, created_at, started_at,
                    completed_at, error_message
             FROM ingestion_job WHERE id = ?1",
            params![id],
            job_from_row,
        )
        .optional()?
        .ok_or_else(|| CoreError::not_found("ingestion job", id))
    }

    /// Move a job to `status`, stamping started/completed where appropriate.
    pub fn set_job_status(
        &self,
        id: &str,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> CoreResult<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        let updated = match status {
            JobStatus::Running => conn.execute(
                "UPDATE ingestion_job SET status = ?2, started_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), now],
            )?,
            s if s.is_terminal() => conn.execute(
                "UPDATE ingestion_job
                 SET status = ?2, completed_at = ?3, error_message = ?4
                 WHERE id = ?1",
                params![id, status.as_str(), now, error_message],
            )?,
            _ => conn.execute(
                "UPDATE ingestion_job SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )?,
        };
        if updated == 0 {
            return Err(CoreError::not_found("ingestion job", id));
        }
        Ok(())
    }

    pub fn update_job_progress(&self, id: &str, fetched: i64, stored: i64) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE ingestion_job SET candles_fetched = ?2, candles_stored = ?3 WHERE id = ?1",
            params![id, fetched, stored],
        )?;
        Ok(())
    }

    /// Request cancellation. Only non-terminal jobs can be cancelled.
    pub fn cancel_job(&self, id: &str) -> CoreResult<()> {
        let job = self.get_job(id)?;
        if job.status.is_terminal() {
            return Err(CoreError::conflict(format!(
                "job {id} already {}",
                job.status.as_str()
            )));
        }
        self.set_job_status(id, JobStatus::Cancelled, None)
    }

    pub fn list_jobs(&self, status: Option<JobStatus>) -> CoreResult<Vec<IngestionJob>> {
        let conn = self.conn.lock();
        let mut out = Vec::new();
        match status {
            Some(s) => {
                let mut stmt = conn.prepare(
                    "SELECT id, pair, timeframe, exchange, status, priority,
                            candles_fetched, candles_stored, created_at, started_at,
                            completed_at, error_message
                     FROM ingestion_job WHERE status = ?1
                     ORDER BY priority DESC, created_at",
                )?;
                let rows = stmt.query_map(params![s.as_str()], job_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, pair, timeframe, exchange, status, priority,
                            candles_fetched, candles_stored, created_at, started_at,
                            completed_at, error_message
                     FROM ingestion_job ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map([], job_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Data sources
    // -------------------------------------------------------------------------

    /// Idempotent upsert keyed by (pair, timeframe, exchange).
    pub fn upsert_data_source(&self, source: &DataSource) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO data_source
                (pair, timeframe, exchange, earliest_date, latest_date,
                 total_candles, file_path, file_size, is_complete, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (pair, timeframe, exchange) DO UPDATE SET
                earliest_date = excluded.earliest_date,
                latest_date = excluded.latest_date,
                total_candles = excluded.total_candles,
                file_path = excluded.file_path,
                file_size = excluded.file_size,
                is_complete = excluded.is_complete,
                last_updated = excluded.last_updated",
            params![
                source.pair,
                source.timeframe,
                source.exchange,
                source.earliest_date,
                source.latest_date,
                source.total_candles,
                source.file_path,
                source.file_size,
                source.is_complete as i64,
                source.last_updated,
            ],
        )?;
        Ok(())
    }

    pub fn get_data_source(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        exchange: &str,
    ) -> CoreResult<Option<DataSource>> {
        let conn = self.conn.lock();
        let source = conn
            .query_row(
                "SELECT pair, timeframe, exchange, earliest_date, latest_date,
                        total_candles, file_path, file_size, is_complete, last_updated
                 FROM data_source
                 WHERE pair = ?1 AND timeframe = ?2 AND exchange = ?3",
                params![pair.to_string(), timeframe.to_string(), exchange],
                |row| {
                    Ok(DataSource {
                        pair: row.get(0)?,
                        timeframe: row.get(1)?,
                        exchange: row.get(2)?,
                        earliest_date: row.get(3)?,
                        latest_date: row.get(4)?,
                        total_candles: row.get(5)?,
                        file_path: row.get(6)?,
                        file_size: row.get(7)?,
                        is_complete: row.get::<_, i64>(8)? != 0,
                        last_updated: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(source)
    }

    // -------------------------------------------------------------------------
    // Data gaps
    // -------------------------------------------------------------------------

    pub fn insert_gap(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        gap_start: i64,
        gap_end: i64,
        reason: &str,
    ) -> CoreResult<DataGap> {
        let gap = DataGap {
            id: Uuid::new_v4().to_string(),
            pair: pair.to_string(),
            timeframe: timeframe.to_string(),
            gap_start,
            gap_end,
            reason: reason.to_string(),
            is_repaired: false,
            detected_at: Utc::now().to_rfc3339(),
            repaired_at: None,
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO data_gap
                (id, pair, timeframe, gap_start, gap_end, reason, is_repaired, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![
                gap.id,
                gap.pair,
                gap.timeframe,
                gap.gap_start,
                gap.gap_end,
                gap.reason,
                gap.detected_at,
            ],
        )?;
        Ok(gap)
    }

    pub fn open_gaps(&self, pair: &Pair, timeframe: Timeframe) -> CoreResult<Vec<DataGap>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, pair, timeframe, gap_start, gap_end, reason,
                    is_repaired, detected_at, repaired_at
             FROM data_gap
             WHERE pair = ?1 AND timeframe = ?2 AND is_repaired = 0
             ORDER BY gap_start",
        )?;
        let rows = stmt.query_map(
            params![pair.to_string(), timeframe.to_string()],
            gap_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn mark_gap_repaired(&self, id: &str) -> CoreResult<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE data_gap SET is_repaired = 1, repaired_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(CoreError::not_found("data gap", id));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Backtest records
    // -------------------------------------------------------------------------

    pub fn insert_backtest(&self, record: &BacktestRecord) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO backtest_result
                (id, user_id, kind, exchange, pair, timeframe, strategy_type,
                 strategy_params, backtest_config, result, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.id,
                record.user_id,
                record.kind,
                record.exchange,
                record.pair,
                record.timeframe,
                record.strategy_type,
                record.strategy_params.to_string(),
                record.backtest_config.to_string(),
                record.result.to_string(),
                record.created_at,
            ],
        )?;
        Ok(())
    }

    /// Fetch a record, enforcing ownership.
    pub fn get_backtest(&self, id: &str, user_id: &str) -> CoreResult<BacktestRecord> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT id, user_id, kind, exchange, pair, timeframe, strategy_type,
                        strategy_params, backtest_config, result, created_at
                 FROM backtest_result WHERE id = ?1",
                params![id],
                backtest_from_row,
            )
            .optional()?
            .ok_or_else(|| CoreError::not_found("backtest", id))?;
        if record.user_id != user_id {
            return Err(CoreError::Forbidden(format!(
                "backtest {id} belongs to another user"
            )));
        }
        Ok(record)
    }

    pub fn list_backtests(
        &self,
        user_id: &str,
        filter: &BacktestRecordFilter,
    ) -> CoreResult<Vec<BacktestRecord>> {
        let limit = filter.limit.unwrap_or(20).min(100) as i64;
        let page = filter.page.unwrap_or(1).max(1) as i64;
        let offset = (page - 1) * limit;

        let mut sql = String::from(
            "SELECT id, user_id, kind, exchange, pair, timeframe, strategy_type,
                    strategy_params, backtest_config, result, created_at
             FROM backtest_result WHERE user_id = ?1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(user_id.to_string())];

        if let Some(kind) = &filter.kind {
            args.push(Box::new(kind.clone()));
            sql.push_str(&format!(" AND kind = ?{}", args.len()));
        }
        if let Some(st) = &filter.strategy_type {
            args.push(Box::new(st.clone()));
            sql.push_str(&format!(" AND strategy_type = ?{}", args.len()));
        }
        if let Some(from) = filter.from {
            args.push(Box::new(millis_to_rfc3339(from)));
            sql.push_str(&format!(" AND created_at >= ?{}", args.len()));
        }
        if let Some(to) = filter.to {
            args.push(Box::new(millis_to_rfc3339(to)));
            sql.push_str(&format!(" AND created_at <= ?{}", args.len()));
        }

        args.push(Box::new(limit));
        sql.push_str(&format!(" ORDER BY created_at DESC LIMIT ?{}", args.len()));
        args.push(Box::new(offset));
        sql.push_str(&format!(" OFFSET ?{}", args.len()));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params_ref.as_slice(), backtest_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStore").finish()
    }
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<IngestionJob> {
    let status_text: String = row.get(4)?;
    Ok(IngestionJob {
        id: row.get(0)?,
        pair: row.get(1)?,
        timeframe: row.get(2)?,
        exchange: row.get(3)?,
        status: JobStatus::parse(&status_text).unwrap_or(JobStatus::Failed),
        priority: row.get(5)?,
        candles_fetched: row.get(6)?,
        candles_stored: row.get(7)?,
        created_at: row.get(8)?,
        started_at: row.get(9)?,
        completed_at: row.get(10)?,
        error_message: row.get(11)?,
    })
}

fn gap_from_row(row: &Row<'_>) -> rusqlite::Result<DataGap> {
    Ok(DataGap {
        id: row.get(0)?,
        pair: row.get(1)?,
        timeframe: row.get(2)?,
        gap_start: row.get(3)?,
        gap_end: row.get(4)?,
        reason: row.get(5)?,
        is_repaired: row.get::<_, i64>(6)? != 0,
        detected_at: row.get(7)?,
        repaired_at: row.get(8)?,
    })
}

fn backtest_from_row(row: &Row<'_>) -> rusqlite::Result<BacktestRecord> {
    let params_text: String = row.get(7)?;
    let config_text: String = row.get(8)?;
    let result_text: String = row.get(9)?;
    Ok(BacktestRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: row.get(2)?,
        exchange: row.get(3)?,
        pair: row.get(4)?,
        timeframe: row.get(5)?,
        strategy_type: row.get(6)?,
        strategy_params: serde_json::from_str(&params_text).unwrap_or(Value::Null),
        backtest_config: serde_json::from_str(&config_text).unwrap_or(Value::Null),
        result: serde_json::from_str(&result_text).unwrap_or(Value::Null),
        created_at: row.get(10)?,
    })
}

fn millis_to_rfc3339(ms: i64) -> String {
    chrono::TimeZone::timestamp_millis_opt(&Utc, ms)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}
