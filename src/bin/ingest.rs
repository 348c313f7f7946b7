// =============================================================================
// vela-ingest — historical candle backfill CLI
// =============================================================================
//
// Backfills one or more (pair, timeframe) series from a venue REST API into
// the columnar store, with gap detection and repair. Exits non-zero on any
// fatal error; SIGINT/SIGTERM cancel the in-flight job row so a re-run can
// resume cleanly.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vela::config::IngestorConfig;
use vela::exchange::RestClient;
use vela::ingest::Ingestor;
use vela::store::{CandleStore, JobStatus, MetaStore};
use vela::types::{Pair, Timeframe};

#[derive(Debug, Parser)]
#[command(name = "vela-ingest", about = "Backfill historical candles")]
struct Args {
    /// Pairs to ingest, e.g. BTC/USDT (repeatable, comma-separated).
    #[arg(long, value_delimiter = ',', required = true)]
    pairs: Vec<String>,

    /// Timeframes to ingest, e.g. 1h (repeatable, comma-separated).
    #[arg(long, value_delimiter = ',', default_value = "1h")]
    timeframes: Vec<String>,

    /// Inclusive start date, YYYY-MM-DD.
    #[arg(long)]
    from: String,

    /// Exclusive end date, YYYY-MM-DD. Defaults to today.
    #[arg(long)]
    to: Option<String>,

    /// Venue to pull from.
    #[arg(long, default_value = "binance")]
    exchange: String,

    /// Root directory for columnar candle files.
    #[arg(long, default_value = "data/candles")]
    data_dir: String,

    /// Path of the sqlite metadata database.
    #[arg(long, default_value = "data/vela-meta.db")]
    meta_db: String,

    /// Venue REST base URL.
    #[arg(long, default_value = "https://api.binance.com")]
    base_url: String,

    /// Detect gaps after ingesting and repair them.
    #[arg(long)]
    repair_gaps: bool,

    /// Milliseconds to sleep between fetch chunks.
    #[arg(long, default_value_t = 100)]
    rate_limit_ms: u64,
}

fn parse_date(text: &str) -> anyhow::Result<i64> {
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .with_context(|| format!("bad date (want YYYY-MM-DD): {text}"))?;
    Ok(date
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc()
        .timestamp_millis())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let from = parse_date(&args.from)?;
    let to = match &args.to {
        Some(text) => parse_date(text)?,
        None => chrono::Utc::now().timestamp_millis(),
    };
    if from >= to {
        anyhow::bail!("--from must precede --to");
    }

    let series: Vec<(Pair, Timeframe)> = {
        let mut out = Vec::new();
        for pair_text in &args.pairs {
            let pair = Pair::parse(pair_text)?;
            for tf_text in &args.timeframes {
                out.push((pair.clone(), Timeframe::parse(tf_text)?));
            }
        }
        out
    };

    let candles = Arc::new(CandleStore::new(&*args.data_dir));
    let meta = Arc::new(MetaStore::open(&args.meta_db)?);
    let rest = RestClient::new(
        &args.exchange,
        std::env::var("VELA_API_KEY").unwrap_or_default(),
        std::env::var("VELA_API_SECRET").unwrap_or_default(),
        args.base_url.clone(),
    );
    let config = IngestorConfig {
        exchange: args.exchange.clone(),
        rate_limit_ms: args.rate_limit_ms,
        ..IngestorConfig::default()
    };
    let ingestor = Arc::new(Ingestor::new(config, Arc::new(rest), candles, meta.clone()));

    // SIGINT/SIGTERM flip every live job row to CANCELLED; the ingest loop
    // notices at its next chunk boundary and persists progress.
    {
        let meta = meta.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received — cancelling running jobs");
                match meta.list_jobs(Some(JobStatus::Running)) {
                    Ok(jobs) => {
                        for job in jobs {
                            if let Err(e) = meta.cancel_job(&job.id) {
                                warn!(job_id = %job.id, error = %e, "cancel failed");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "could not list running jobs"),
                }
            }
        });
    }

    let mut failures = 0usize;
    for (pair, timeframe) in &series {
        info!(pair = %pair, timeframe = %timeframe, "ingesting series");
        match ingestor.ingest(pair, *timeframe, from, to, 1).await {
            Ok(job) => {
                info!(
                    job_id = %job.id,
                    status = job.status.as_str(),
                    fetched = job.candles_fetched,
                    stored = job.candles_stored,
                    "series finished"
                );
                if job.status == JobStatus::Cancelled {
                    warn!("ingestion cancelled — stopping");
                    break;
                }
            }
            Err(e) => {
                warn!(pair = %pair, timeframe = %timeframe, error = %e, "series failed");
                failures += 1;
            }
        }

        if args.repair_gaps {
            let gaps = ingestor.detect_gaps(pair, *timeframe)?;
            if !gaps.is_empty() {
                info!(count = gaps.len(), "repairing detected gaps");
                ingestor.repair_gaps(pair, *timeframe).await?;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} series failed to ingest");
    }
    info!("ingestion complete");
    Ok(())
}
