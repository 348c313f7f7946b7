// =============================================================================
// Columnar Candle Store — one zstd-compressed file per calendar month
// =============================================================================
//
// Layout: <base>/<BASE-QUOTE>/<timeframe>/YYYY-MM.vcz
//
// File format (little-endian):
//   magic   u32   "VELA"
//   version u16
//   rows    u32
//   crc32   u32   checksum of the compressed payload
//   len     u32   compressed payload length
//   payload       zstd( ts[i64; rows] ++ open[f64] ++ high ++ low ++ close
//                       ++ volume )
//
// Writes follow read-merge-rewrite: the month file is decoded, incoming
// candles merged with last-write-wins dedup by timestamp, sorted, and the
// file is atomically replaced (tmp + rename). A per-file mutex serialises
// concurrent writers of the same (pair, timeframe, month).
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::types::{Candle, Pair, Timeframe};

const FILE_MAGIC: u32 = 0x5645_4C41; // "VELA"
const FILE_VERSION: u16 = 1;
const FILE_EXT: &str = "vcz";
const ZSTD_LEVEL: i32 = 3;

/// Summary of the data available for one (pair, timeframe) series.
#[derive(Debug, Clone, Serialize)]
pub struct AvailableRange {
    pub earliest: i64,
    pub latest: i64,
    pub total_candles: u64,
    pub total_files: usize,
}

/// Outcome of an append call.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendOutcome {
    /// Candles newly written (not present before).
    pub written: usize,
    /// Candles that replaced an existing timestamp.
    pub replaced: usize,
}

/// Columnar store rooted at a base directory.
pub struct CandleStore {
    base: PathBuf,
    /// One lock per (pair, timeframe, month) file.
    file_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl CandleStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            file_locks: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Append
    // -------------------------------------------------------------------------

    /// Merge `candles` into the store.
    ///
    /// Candles are routed to their month file, deduplicated by timestamp with
    /// last write winning, sorted ascending, and each touched file is
    /// rewritten atomically.
    pub fn append_candles(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        candles: &[Candle],
    ) -> CoreResult<AppendOutcome> {
        if candles.is_empty() {
            return Ok(AppendOutcome::default());
        }

        // Group by calendar month of the candle timestamp.
        let mut by_month: BTreeMap<(i32, u32), Vec<Candle>> = BTreeMap::new();
        for c in candles {
            if !c.is_valid() {
                return Err(CoreError::validation(format!(
                    "invalid candle at ts {}",
                    c.timestamp
                )));
            }
            by_month.entry(month_of(c.timestamp)).or_default().push(*c);
        }

        let mut outcome = AppendOutcome::default();
        for ((year, month), batch) in by_month {
            let path = self.file_path(pair, timeframe, year, month);
            let lock = self.lock_for(&path);
            let _guard = lock.lock();

            let mut merged: BTreeMap<i64, Candle> = match read_candle_file(&path) {
                Ok(existing) => existing.into_iter().map(|c| (c.timestamp, c)).collect(),
                Err(CoreError::NotFound { .. }) => BTreeMap::new(),
                Err(e) => return Err(e),
            };

            for c in batch {
                match merged.insert(c.timestamp, c) {
                    Some(_) => outcome.replaced += 1,
                    None => outcome.written += 1,
                }
            }

            let sorted: Vec<Candle> = merged.into_values().collect();
            write_candle_file(&path, &sorted)?;

            debug!(
                pair = %pair,
                timeframe = %timeframe,
                file = %path.display(),
                rows = sorted.len(),
                "candle file rewritten"
            );
        }

        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // Read
    // -------------------------------------------------------------------------

    /// Read all candles with `from <= timestamp <= to`, merged and sorted.
    ///
    /// Existing month files covering `[from, to]` plus one neighbor on each
    /// side are consulted, so candles filed under an adjacent month boundary
    /// are never missed.
    pub fn read_range(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        from: i64,
        to: i64,
    ) -> CoreResult<Vec<Candle>> {
        if from > to {
            return Err(CoreError::validation("read_range: from > to"));
        }

        let lo = prev_month(month_of(from));
        let hi = next_month(month_of(to));

        let mut out = Vec::new();
        for path in list_month_files(&self.series_dir(pair, timeframe))? {
            let Some(month) = parse_month_stem(&path) else {
                continue;
            };
            if month < lo || month > hi {
                continue;
            }
            match read_candle_file(&path) {
                Ok(candles) => {
                    out.extend(
                        candles
                            .into_iter()
                            .filter(|c| c.timestamp >= from && c.timestamp <= to),
                    );
                }
                Err(CoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        // Files are month-ordered and internally sorted; a final sort guards
        // the cross-file boundary.
        out.sort_by_key(|c| c.timestamp);
        out.dedup_by_key(|c| c.timestamp);
        Ok(out)
    }

    /// Range summary for a series, or `None` when nothing is stored.
    pub fn available_range(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
    ) -> CoreResult<Option<AvailableRange>> {
        let dir = self.series_dir(pair, timeframe);
        let mut files = list_month_files(&dir)?;
        if files.is_empty() {
            return Ok(None);
        }
        files.sort();

        let mut total: u64 = 0;
        for f in &files {
            total += read_row_count(f)? as u64;
        }

        let first = read_candle_file(&files[0])?;
        let last = read_candle_file(files.last().expect("non-empty"))?;

        let (earliest, latest) = match (first.first(), last.last()) {
            (Some(a), Some(b)) => (a.timestamp, b.timestamp),
            _ => return Ok(None),
        };

        Ok(Some(AvailableRange {
            earliest,
            latest,
            total_candles: total,
            total_files: files.len(),
        }))
    }

    /// Delete every candle with `timestamp < cutoff`.
    ///
    /// Whole months before the cutoff are unlinked; the boundary month is
    /// filtered and rewritten.
    pub fn delete_before(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        cutoff: i64,
    ) -> CoreResult<u64> {
        let dir = self.series_dir(pair, timeframe);
        let files = list_month_files(&dir)?;

        let mut removed: u64 = 0;
        for path in files {
            let lock = self.lock_for(&path);
            let _guard = lock.lock();

            let candles = match read_candle_file(&path) {
                Ok(c) => c,
                Err(CoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };

            let kept: Vec<Candle> = candles
                .iter()
                .copied()
                .filter(|c| c.timestamp >= cutoff)
                .collect();

            if kept.len() == candles.len() {
                continue;
            }
            removed += (candles.len() - kept.len()) as u64;

            if kept.is_empty() {
                fs::remove_file(&path)?;
                info!(file = %path.display(), "candle file removed");
            } else {
                write_candle_file(&path, &kept)?;
            }
        }

        Ok(removed)
    }

    // -------------------------------------------------------------------------
    // Paths & locks
    // -------------------------------------------------------------------------

    /// Directory holding this series' month files.
    pub fn series_dir(&self, pair: &Pair, timeframe: Timeframe) -> PathBuf {
        self.base
            .join(pair.file_form())
            .join(timeframe.to_string())
    }

    fn file_path(&self, pair: &Pair, timeframe: Timeframe, year: i32, month: u32) -> PathBuf {
        self.series_dir(pair, timeframe)
            .join(format!("{year:04}-{month:02}.{FILE_EXT}"))
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.file_locks.lock();
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl std::fmt::Debug for CandleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleStore")
            .field("base", &self.base)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Month helpers
// ---------------------------------------------------------------------------

fn month_of(ts: i64) -> (i32, u32) {
    let dt: DateTime<Utc> = Utc
        .timestamp_millis_opt(ts)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());
    (dt.year(), dt.month())
}

/// `YYYY-MM` from a month file path.
fn parse_month_stem(path: &Path) -> Option<(i32, u32)> {
    let stem = path.file_stem()?.to_str()?;
    let (year, month) = stem.split_once('-')?;
    Some((year.parse().ok()?, month.parse().ok()?))
}

fn prev_month((year, month): (i32, u32)) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

fn next_month((year, month): (i32, u32)) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

fn list_month_files(dir: &Path) -> CoreResult<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some(FILE_EXT) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

// ---------------------------------------------------------------------------
// File codec
// ---------------------------------------------------------------------------

fn write_candle_file(path: &Path, candles: &[Candle]) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Column-major payload.
    let rows = candles.len();
    let mut payload = Vec::with_capacity(rows * 48);
    for c in candles {
        payload.write_i64::<LittleEndian>(c.timestamp)?;
    }
    for c in candles {
        payload.write_f64::<LittleEndian>(c.open)?;
    }
    for c in candles {
        payload.write_f64::<LittleEndian>(c.high)?;
    }
    for c in candles {
        payload.write_f64::<LittleEndian>(c.low)?;
    }
    for c in candles {
        payload.write_f64::<LittleEndian>(c.close)?;
    }
    for c in candles {
        payload.write_f64::<LittleEndian>(c.volume)?;
    }

    let compressed = zstd::encode_all(payload.as_slice(), ZSTD_LEVEL)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&compressed);
    let crc = hasher.finalize();

    let mut buf = Vec::with_capacity(compressed.len() + 18);
    buf.write_u32::<LittleEndian>(FILE_MAGIC)?;
    buf.write_u16::<LittleEndian>(FILE_VERSION)?;
    buf.write_u32::<LittleEndian>(rows as u32)?;
    buf.write_u32::<LittleEndian>(crc)?;
    buf.write_u32::<LittleEndian>(compressed.len() as u32)?;
    buf.extend_from_slice(&compressed);

    // Atomic replace: write a tmp sibling, then rename over the target.
    let tmp = path.with_extension(format!("{FILE_EXT}.tmp"));
    fs::write(&tmp, &buf)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_candle_file(path: &Path) -> CoreResult<Vec<Candle>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CoreError::not_found("candle file", path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };

    let mut cursor = Cursor::new(bytes.as_slice());
    let (rows, crc, len) = read_header(&mut cursor, path)?;

    let offset = cursor.position() as usize;
    let compressed = bytes
        .get(offset..offset + len)
        .ok_or_else(|| CoreError::transient(format!("truncated candle file {}", path.display())))?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(compressed);
    if hasher.finalize() != crc {
        return Err(CoreError::transient(format!(
            "crc mismatch in {}",
            path.display()
        )));
    }

    let payload = zstd::decode_all(compressed)?;
    let mut cursor = Cursor::new(payload.as_slice());

    let mut timestamps = Vec::with_capacity(rows);
    for _ in 0..rows {
        timestamps.push(cursor.read_i64::<LittleEndian>()?);
    }
    let mut columns = [
        Vec::with_capacity(rows),
        Vec::with_capacity(rows),
        Vec::with_capacity(rows),
        Vec::with_capacity(rows),
        Vec::with_capacity(rows),
    ];
    for col in columns.iter_mut() {
        for _ in 0..rows {
            col.push(cursor.read_f64::<LittleEndian>()?);
        }
    }

    Ok((0..rows)
        .map(|i| Candle {
            timestamp: timestamps[i],
            open: columns[0][i],
            high: columns[1][i],
            low: columns[2][i],
            close: columns[3][i],
            volume: columns[4][i],
        })
        .collect())
}

fn read_row_count(path: &Path) -> CoreResult<usize> {
    let bytes = fs::read(path)?;
    let mut cursor = Cursor::new(bytes.as_slice());
    let (rows, _, _) = read_header(&mut cursor, path)?;
    Ok(rows)
}

fn read_header(cursor: &mut Cursor<&[u8]>, path: &Path) -> CoreResult<(usize, u32, usize)> {
    let magic = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| CoreError::transient(format!("short header in {}", path.display())))?;
    if magic != FILE_MAGIC {
        return Err(CoreError::transient(format!(
            "bad magic {magic:#x} in {}",
            path.display()
        )));
    }
    let version = cursor.read_u16::<LittleEndian>()?;
    if version != FILE_VERSION {
        return Err(CoreError::transient(format!(
            "unsupported candle file version {version} in {}",
            path.display()
        )));
    }
    let rows = cursor.read_u32::<LittleEndian>()? as usize;
    let crc = cursor.read_u32::<LittleEndian>()?;
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    Ok((rows, crc, len))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(ts: i64, close: f64) -> Candle {
        Candle {
            timestamp: ts,
            open: close - 1.0,
            high: close + 2.0,
            low: close - 2.0,
            close,
            volume: 10.0,
        }
    }

    fn store() -> (tempfile::TempDir, CandleStore, Pair, Timeframe) {
        let dir = tempfile::tempdir().unwrap();
        let store = CandleStore::new(dir.path());
        (dir, store, Pair::new("BTC", "USDT"), Timeframe::hours(1))
    }

    // 2024-01-15T00:00:00Z.
    const JAN: i64 = 1_705_276_800_000;
    const HOUR: i64 = 3_600_000;

    #[test]
    fn append_then_read_round_trips_sorted() {
        let (_dir, store, pair, tf) = store();

        // Shuffled input with one duplicate timestamp.
        let candles = vec![
            candle(JAN + 2 * HOUR, 102.0),
            candle(JAN, 100.0),
            candle(JAN + HOUR, 101.0),
            candle(JAN, 999.0), // last write wins
        ];
        let outcome = store.append_candles(&pair, tf, &candles).unwrap();
        assert_eq!(outcome.written, 3);
        assert_eq!(outcome.replaced, 1);

        let read = store
            .read_range(&pair, tf, JAN, JAN + 3 * HOUR)
            .unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read[0].close, 999.0);
        assert!(read.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn second_append_merges_with_existing_file() {
        let (_dir, store, pair, tf) = store();

        store
            .append_candles(&pair, tf, &[candle(JAN, 100.0)])
            .unwrap();
        store
            .append_candles(&pair, tf, &[candle(JAN + HOUR, 101.0), candle(JAN, 90.0)])
            .unwrap();

        let read = store.read_range(&pair, tf, 0, i64::MAX / 2).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].close, 90.0);
    }

    #[test]
    fn read_spans_month_boundaries() {
        let (_dir, store, pair, tf) = store();

        // 2024-01-31T23:00:00Z and 2024-02-01T00:00:00Z land in different files.
        let jan_end = 1_706_742_000_000;
        let feb_start = jan_end + HOUR;
        store
            .append_candles(&pair, tf, &[candle(jan_end, 100.0), candle(feb_start, 101.0)])
            .unwrap();

        let dir = store.series_dir(&pair, tf);
        assert_eq!(list_month_files(&dir).unwrap().len(), 2);

        let read = store
            .read_range(&pair, tf, jan_end, feb_start)
            .unwrap();
        assert_eq!(read.len(), 2);
    }

    #[test]
    fn available_range_reports_totals() {
        let (_dir, store, pair, tf) = store();
        assert!(store.available_range(&pair, tf).unwrap().is_none());

        let candles: Vec<Candle> = (0..48).map(|i| candle(JAN + i * HOUR, 100.0)).collect();
        store.append_candles(&pair, tf, &candles).unwrap();

        let range = store.available_range(&pair, tf).unwrap().unwrap();
        assert_eq!(range.earliest, JAN);
        assert_eq!(range.latest, JAN + 47 * HOUR);
        assert_eq!(range.total_candles, 48);
        assert_eq!(range.total_files, 1);
    }

    #[test]
    fn delete_before_trims_and_unlinks() {
        let (_dir, store, pair, tf) = store();
        let candles: Vec<Candle> = (0..10).map(|i| candle(JAN + i * HOUR, 100.0)).collect();
        store.append_candles(&pair, tf, &candles).unwrap();

        let removed = store.delete_before(&pair, tf, JAN + 5 * HOUR).unwrap();
        assert_eq!(removed, 5);

        let read = store.read_range(&pair, tf, 0, i64::MAX / 2).unwrap();
        assert_eq!(read.len(), 5);
        assert_eq!(read[0].timestamp, JAN + 5 * HOUR);

        // Cutoff beyond everything unlinks the file.
        store.delete_before(&pair, tf, JAN + 100 * HOUR).unwrap();
        assert!(store.available_range(&pair, tf).unwrap().is_none());
    }

    #[test]
    fn corrupt_file_is_reported_not_panicked() {
        let (_dir, store, pair, tf) = store();
        store
            .append_candles(&pair, tf, &[candle(JAN, 100.0)])
            .unwrap();

        let dir = store.series_dir(&pair, tf);
        let file = &list_month_files(&dir).unwrap()[0];
        let mut bytes = fs::read(file).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(file, bytes).unwrap();

        let err = store.read_range(&pair, tf, 0, i64::MAX / 2).unwrap_err();
        assert!(err.to_string().contains("crc mismatch"));
    }

    #[test]
    fn invalid_candles_are_rejected() {
        let (_dir, store, pair, tf) = store();
        let bad = Candle {
            timestamp: JAN,
            open: 100.0,
            high: 90.0, // high < low
            low: 95.0,
            close: 96.0,
            volume: 1.0,
        };
        assert!(store.append_candles(&pair, tf, &[bad]).is_err());
    }
}
