// =============================================================================
// Historical Data Ingestor — chunked backfill with gap detection and repair
// =============================================================================
//
// The ingestor walks a time range in chunks against a `CandleSource`,
// validating and appending each chunk to the columnar store and persisting
// progress on its `ingestion_job` row. The job row doubles as the
// cancellation channel: it is re-read every chunk and the loop aborts when an
// operator has flipped it to CANCELLED.
//
// Transient fetch failures retry with linear-multiple backoff
// (`retry_delay * attempt`) up to `max_retries`; exhaustion fails the job.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::IngestorConfig;
use crate::error::{CoreError, CoreResult};
use crate::exchange::CandleSource;
use crate::store::{CandleStore, DataGap, DataSource, IngestionJob, JobStatus, MetaStore};
use crate::types::{Candle, Pair, Timeframe};

/// Gaps wider than this multiple of the timeframe are reported.
const GAP_FACTOR: f64 = 1.5;

/// Start of the assumed-available history for a series with no data source.
/// 2020-01-01T00:00:00Z.
const HISTORY_EPOCH_MS: i64 = 1_577_836_800_000;

/// Priority assigned to gap-repair jobs.
const REPAIR_PRIORITY: i64 = 2;

pub struct Ingestor {
    config: IngestorConfig,
    source: Arc<dyn CandleSource>,
    candles: Arc<CandleStore>,
    meta: Arc<MetaStore>,
}

impl Ingestor {
    pub fn new(
        config: IngestorConfig,
        source: Arc<dyn CandleSource>,
        candles: Arc<CandleStore>,
        meta: Arc<MetaStore>,
    ) -> Self {
        Self {
            config,
            source,
            candles,
            meta,
        }
    }

    // -------------------------------------------------------------------------
    // Backfill
    // -------------------------------------------------------------------------

    /// Backfill `[start_ms, end_ms)` for one series. Returns the final job row.
    pub async fn ingest(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
        priority: i64,
    ) -> CoreResult<IngestionJob> {
        if start_ms >= end_ms {
            return Err(CoreError::validation("ingest: start must precede end"));
        }

        let job = self
            .meta
            .create_job(pair, timeframe, &self.config.exchange, priority)?;
        self.meta.set_job_status(&job.id, JobStatus::Running, None)?;

        info!(
            job_id = %job.id,
            pair = %pair,
            timeframe = %timeframe,
            start_ms,
            end_ms,
            "ingestion started"
        );

        let tf_ms = timeframe.as_millis();
        let mut current = start_ms;
        let mut fetched: i64 = 0;
        let mut stored: i64 = 0;

        loop {
            // The job row is the cancellation channel.
            if self.meta.get_job(&job.id)?.status == JobStatus::Cancelled {
                warn!(job_id = %job.id, "ingestion cancelled by operator");
                return self.meta.get_job(&job.id);
            }

            let chunk = match self.fetch_with_retry(pair, timeframe, current).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.meta
                        .set_job_status(&job.id, JobStatus::Failed, Some(&e.to_string()))?;
                    return Err(e);
                }
            };

            fetched += chunk.len() as i64;

            // Validate, clamp to the requested range.
            let mut valid: Vec<Candle> = Vec::with_capacity(chunk.len());
            for c in &chunk {
                if !c.is_valid() {
                    warn!(job_id = %job.id, ts = c.timestamp, "rejecting malformed candle");
                    continue;
                }
                if c.timestamp >= current && c.timestamp < end_ms {
                    valid.push(*c);
                }
            }

            if chunk.is_empty() {
                // The venue has nothing past `current`.
                break;
            }

            if !valid.is_empty() {
                let outcome = self.candles.append_candles(pair, timeframe, &valid)?;
                stored += (outcome.written + outcome.replaced) as i64;
            }

            self.meta.update_job_progress(&job.id, fetched, stored)?;

            let last_ts = chunk.last().map(|c| c.timestamp).unwrap_or(current);
            let next = last_ts + tf_ms;
            if next <= current {
                // Defend against a venue returning stale pages forever.
                break;
            }
            current = next;

            if current >= end_ms {
                break;
            }

            tokio::time::sleep(Duration::from_millis(self.config.rate_limit_ms)).await;
        }

        self.meta
            .set_job_status(&job.id, JobStatus::Completed, None)?;
        self.refresh_data_source(pair, timeframe)?;

        let done = self.meta.get_job(&job.id)?;
        info!(
            job_id = %done.id,
            fetched = done.candles_fetched,
            stored = done.candles_stored,
            "ingestion completed"
        );
        Ok(done)
    }

    async fn fetch_with_retry(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        start_ms: i64,
    ) -> CoreResult<Vec<Candle>> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self
                .source
                .fetch_candles(pair, timeframe, start_ms, self.config.chunk_size)
                .await
            {
                Ok(chunk) => return Ok(chunk),
                Err(e) if attempt < self.config.max_retries => {
                    let delay = self.config.retry_delay_ms * attempt as u64;
                    warn!(
                        pair = %pair,
                        attempt,
                        delay_ms = delay,
                        error = %e,
                        "candle fetch failed — retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Recompute the data_source row from what is actually on disk.
    fn refresh_data_source(&self, pair: &Pair, timeframe: Timeframe) -> CoreResult<()> {
        let Some(range) = self.candles.available_range(pair, timeframe)? else {
            return Ok(());
        };

        let dir = self.candles.series_dir(pair, timeframe);
        let file_size = dir_size(&dir);

        self.meta.upsert_data_source(&DataSource {
            pair: pair.to_string(),
            timeframe: timeframe.to_string(),
            exchange: self.config.exchange.clone(),
            earliest_date: range.earliest,
            latest_date: range.latest,
            total_candles: range.total_candles as i64,
            file_path: dir.display().to_string(),
            file_size,
            is_complete: false,
            last_updated: Utc::now().to_rfc3339(),
        })
    }

    // -------------------------------------------------------------------------
    // Gap detection & repair
    // -------------------------------------------------------------------------

    /// Scan the stored series for holes wider than `1.5 * timeframe` and
    /// persist any not already on file. Returns all currently open gaps.
    pub fn detect_gaps(&self, pair: &Pair, timeframe: Timeframe) -> CoreResult<Vec<DataGap>> {
        let tf_ms = timeframe.as_millis();
        let known = self.meta.open_gaps(pair, timeframe)?;

        let source = self
            .meta
            .get_data_source(pair, timeframe, &self.config.exchange)?;

        let Some(source) = source else {
            // Nothing ingested yet: the entire assumed history is one gap.
            let now = Utc::now().timestamp_millis();
            if known.is_empty() {
                let gap = self.meta.insert_gap(
                    pair,
                    timeframe,
                    HISTORY_EPOCH_MS,
                    now,
                    "no data source",
                )?;
                return Ok(vec![gap]);
            }
            return Ok(known);
        };

        let candles =
            self.candles
                .read_range(pair, timeframe, source.earliest_date, source.latest_date)?;

        let threshold = (tf_ms as f64 * GAP_FACTOR) as i64;
        let mut open = known;
        for pairwise in candles.windows(2) {
            let delta = pairwise[1].timestamp - pairwise[0].timestamp;
            if delta > threshold {
                let gap_start = pairwise[0].timestamp + tf_ms;
                let gap_end = pairwise[1].timestamp - tf_ms;
                let already = open
                    .iter()
                    .any(|g| g.gap_start == gap_start && g.gap_end == gap_end);
                if !already {
                    let gap = self.meta.insert_gap(
                        pair,
                        timeframe,
                        gap_start,
                        gap_end,
                        "missing candles",
                    )?;
                    info!(
                        pair = %pair,
                        timeframe = %timeframe,
                        gap_start,
                        gap_end,
                        "gap detected"
                    );
                    open.push(gap);
                }
            }
        }

        open.sort_by_key(|g| g.gap_start);
        Ok(open)
    }

    /// Re-ingest every open gap at repair priority and mark it repaired.
    /// Returns the number of gaps repaired.
    pub async fn repair_gaps(&self, pair: &Pair, timeframe: Timeframe) -> CoreResult<usize> {
        let gaps = self.meta.open_gaps(pair, timeframe)?;
        let tf_ms = timeframe.as_millis();
        let mut repaired = 0;

        for gap in gaps {
            // The gap bounds are the first/last missing candle; the fetch
            // range is end-exclusive, so extend by one step.
            self.ingest(pair, timeframe, gap.gap_start, gap.gap_end + tf_ms, REPAIR_PRIORITY)
                .await?;
            self.meta.mark_gap_repaired(&gap.id)?;
            repaired += 1;
        }

        if repaired > 0 {
            info!(pair = %pair, timeframe = %timeframe, repaired, "gap repair finished");
        }
        Ok(repaired)
    }
}

impl std::fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("exchange", &self.config.exchange)
            .field("chunk_size", &self.config.chunk_size)
            .finish()
    }
}

fn dir_size(dir: &std::path::Path) -> i64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len() as i64)
        .sum()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    const HOUR: i64 = 3_600_000;
    // 2024-03-01T00:00:00Z.
    const T0: i64 = 1_709_251_200_000;

    fn candle(ts: i64) -> Candle {
        Candle {
            timestamp: ts,
            open: 100.0,
            high: 102.0,
            low: 99.0,
            close: 101.0,
            volume: 5.0,
        }
    }

    /// Serves hourly candles from a fixed set, honouring start/limit.
    struct FixedSource {
        candles: Vec<Candle>,
        /// Fetches observed, for chunking assertions.
        calls: Mutex<u32>,
        /// Fail this many initial calls with a transient error.
        failures: Mutex<u32>,
    }

    impl FixedSource {
        fn hourly(n: i64) -> Self {
            Self {
                candles: (0..n).map(|i| candle(T0 + i * HOUR)).collect(),
                calls: Mutex::new(0),
                failures: Mutex::new(0),
            }
        }

        fn with_gap(n: i64, missing: std::ops::Range<i64>) -> Self {
            Self {
                candles: (0..n)
                    .filter(|i| !missing.contains(i))
                    .map(|i| candle(T0 + i * HOUR))
                    .collect(),
                calls: Mutex::new(0),
                failures: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl CandleSource for FixedSource {
        async fn fetch_candles(
            &self,
            _pair: &Pair,
            _timeframe: Timeframe,
            start_ms: i64,
            limit: usize,
        ) -> CoreResult<Vec<Candle>> {
            *self.calls.lock() += 1;
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(CoreError::transient("synthetic venue hiccup"));
                }
            }
            Ok(self
                .candles
                .iter()
                .filter(|c| c.timestamp >= start_ms)
                .take(limit)
                .copied()
                .collect())
        }
    }

    fn fast_config() -> IngestorConfig {
        IngestorConfig {
            exchange: "binance".into(),
            rate_limit_ms: 0,
            chunk_size: 10,
            max_retries: 3,
            retry_delay_ms: 0,
        }
    }

    fn ingestor(source: Arc<dyn CandleSource>) -> (tempfile::TempDir, Ingestor) {
        let dir = tempfile::tempdir().unwrap();
        let candles = Arc::new(CandleStore::new(dir.path()));
        let meta = Arc::new(MetaStore::open_in_memory().unwrap());
        (dir, Ingestor::new(fast_config(), source, candles, meta))
    }

    #[tokio::test]
    async fn chunked_backfill_completes_and_counts() {
        let source = Arc::new(FixedSource::hourly(25));
        let (_dir, ing) = ingestor(source.clone());
        let pair = Pair::new("BTC", "USDT");
        let tf = Timeframe::hours(1);

        let job = ing.ingest(&pair, tf, T0, T0 + 25 * HOUR, 1).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.candles_stored, 25);
        // 10-candle chunks over 25 candles: three fetches.
        assert_eq!(*source.calls.lock(), 3);

        let stored = ing
            .candles
            .read_range(&pair, tf, T0, T0 + 25 * HOUR)
            .unwrap();
        assert_eq!(stored.len(), 25);

        // Data source row reflects the ingested range.
        let ds = ing
            .meta
            .get_data_source(&pair, tf, "binance")
            .unwrap()
            .unwrap();
        assert_eq!(ds.earliest_date, T0);
        assert_eq!(ds.latest_date, T0 + 24 * HOUR);
        assert_eq!(ds.total_candles, 25);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let source = Arc::new(FixedSource {
            failures: Mutex::new(2),
            ..FixedSource::hourly(5)
        });
        let (_dir, ing) = ingestor(source.clone());
        let pair = Pair::new("ETH", "USDT");

        let job = ing
            .ingest(&pair, Timeframe::hours(1), T0, T0 + 5 * HOUR, 0)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.candles_stored, 5);
    }

    #[tokio::test]
    async fn retry_exhaustion_fails_the_job() {
        let source = Arc::new(FixedSource {
            failures: Mutex::new(10),
            ..FixedSource::hourly(5)
        });
        let (_dir, ing) = ingestor(source);
        let pair = Pair::new("ETH", "USDT");

        let err = ing
            .ingest(&pair, Timeframe::hours(1), T0, T0 + 5 * HOUR, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Transient(_)));

        let jobs = ing.meta.list_jobs(Some(JobStatus::Failed)).unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].error_message.as_deref().unwrap().contains("hiccup"));
    }

    #[tokio::test]
    async fn gap_detection_finds_exactly_the_missing_window() {
        // 10 hourly candles with hours 3..=6 missing: prev candle at T0+2h,
        // next at T0+7h.
        let source = Arc::new(FixedSource::with_gap(10, 3..7));
        let (_dir, ing) = ingestor(source);
        let pair = Pair::new("BTC", "USD");
        let tf = Timeframe::hours(1);

        ing.ingest(&pair, tf, T0, T0 + 10 * HOUR, 1).await.unwrap();

        let gaps = ing.detect_gaps(&pair, tf).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].gap_start, T0 + 3 * HOUR);
        assert_eq!(gaps[0].gap_end, T0 + 6 * HOUR);

        // Detection is idempotent: no duplicate rows on a second pass.
        let again = ing.detect_gaps(&pair, tf).unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn repair_closes_detected_gaps() {
        // First ingest sees a hole; the source later has the full series
        // (mirrors a venue that had an outage window backfilled).
        let gappy = Arc::new(FixedSource::with_gap(10, 3..7));
        let dir = tempfile::tempdir().unwrap();
        let candles = Arc::new(CandleStore::new(dir.path()));
        let meta = Arc::new(MetaStore::open_in_memory().unwrap());
        let ing = Ingestor::new(fast_config(), gappy, candles.clone(), meta.clone());

        let pair = Pair::new("BTC", "USD");
        let tf = Timeframe::hours(1);
        ing.ingest(&pair, tf, T0, T0 + 10 * HOUR, 1).await.unwrap();
        assert_eq!(ing.detect_gaps(&pair, tf).unwrap().len(), 1);

        // Same stores, healed source.
        let healed = Arc::new(FixedSource::hourly(10));
        let ing = Ingestor::new(fast_config(), healed, candles, meta);
        let repaired = ing.repair_gaps(&pair, tf).await.unwrap();
        assert_eq!(repaired, 1);

        assert!(ing.detect_gaps(&pair, tf).unwrap().is_empty());
        let stored = ing
            .candles
            .read_range(&pair, tf, T0, T0 + 10 * HOUR)
            .unwrap();
        assert_eq!(stored.len(), 10);
    }

    #[tokio::test]
    async fn unknown_series_is_one_whole_history_gap() {
        let source = Arc::new(FixedSource::hourly(0));
        let (_dir, ing) = ingestor(source);
        let pair = Pair::new("ADA", "USDT");

        let gaps = ing.detect_gaps(&pair, Timeframe::hours(1)).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].gap_start, HISTORY_EPOCH_MS);
        assert!(gaps[0].gap_end > HISTORY_EPOCH_MS);
        assert_eq!(gaps[0].reason, "no data source");
    }
}
