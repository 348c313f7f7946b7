// =============================================================================
// Persistence: columnar candle files + sqlite metadata
// =============================================================================

pub mod columnar;
pub mod meta;

pub use columnar::{AvailableRange, CandleStore};
pub use meta::{
    BacktestRecord, BacktestRecordFilter, DataGap, DataSource, IngestionJob, JobStatus, MetaStore,
};
