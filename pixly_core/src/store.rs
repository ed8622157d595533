//! Learning store.
//!
//! A single SQLite file holds every conversion record plus per-(rule, format)
//! aggregates. One dedicated writer thread consumes a channel and batches
//! inserts in transactions; predictors read a lock-guarded in-memory snapshot
//! of the aggregates, never the connection. 读写分离：快照只读，写入串行。
//!
//! A missing or empty store is normal (first run). A corrupt store is renamed
//! aside and recreated - history is an optimization, never a dependency.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rusqlite::Connection;

use crate::outcome::ConversionRecord;
use crate::predict::{RuleStats, StatsProvider};

/// Flush the write buffer at this many pending records...
const FLUSH_EVERY: usize = 32;
/// ...or after this long, whichever comes first.
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
/// Backstop when SQLite keeps failing: drop oldest beyond this.
const MAX_BUFFERED: usize = 10_000;

/// Running aggregate for one (rule, format) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RuleAggregate {
    pub observations: u64,
    pub sum_abs_error: f64,
    pub sum_actual_saving: f64,
    pub validation_failures: u64,
}

impl RuleAggregate {
    pub fn absorb(&mut self, record: &ConversionRecord) {
        self.observations += 1;
        self.sum_abs_error += record.prediction_error();
        self.sum_actual_saving += record.actual_saving_ratio;
        if !record.validation_passed {
            self.validation_failures += 1;
        }
    }

    pub fn to_rule_stats(self) -> RuleStats {
        let n = self.observations.max(1) as f64;
        RuleStats {
            observations: self.observations,
            mean_abs_error: self.sum_abs_error / n,
            mean_actual_saving: self.sum_actual_saving / n,
        }
    }
}

type StatsMap = HashMap<(String, String), RuleAggregate>;

/// Read side of the store: a cheaply clonable snapshot handle. Reads observe
/// every write that was flushed before the read began.
#[derive(Clone)]
pub struct StoreSnapshot {
    inner: Arc<RwLock<StatsMap>>,
}

impl StatsProvider for StoreSnapshot {
    fn rule_stats(&self, rule: &str, format: &str) -> Option<RuleStats> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard
            .get(&(rule.to_string(), format.to_string()))
            .map(|agg| agg.to_rule_stats())
    }
}

enum WriterMsg {
    Record(Box<ConversionRecord>),
    Flush,
}

pub struct LearningStore {
    path: PathBuf,
    snapshot: Arc<RwLock<StatsMap>>,
    tx: Option<Sender<WriterMsg>>,
    writer: Option<JoinHandle<()>>,
}

impl LearningStore {
    /// Open (or create) the store, taking the process-exclusive lock. A store
    /// that fails to open or create its schema is renamed aside and rebuilt.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = match Self::open_connection(path) {
            Ok(conn) => conn,
            Err(e) => {
                let aside = quarantine_path(path);
                tracing::warn!(
                    store = %path.display(),
                    error = %e,
                    renamed_to = %aside.display(),
                    "Learning store unreadable, renaming aside and recreating"
                );
                std::fs::rename(path, &aside)?;
                Self::open_connection(path)?
            }
        };

        let stats = load_stats(&conn)?;
        tracing::info!(
            store = %path.display(),
            rules = stats.len(),
            "Learning store opened"
        );

        let snapshot = Arc::new(RwLock::new(stats));
        let (tx, rx) = mpsc::channel();
        let writer_snapshot = Arc::clone(&snapshot);
        let writer = std::thread::Builder::new()
            .name("pixly-store-writer".to_string())
            .spawn(move || writer_loop(conn, rx, writer_snapshot))?;

        Ok(Self {
            path: path.to_path_buf(),
            snapshot,
            tx: Some(tx),
            writer: Some(writer),
        })
    }

    fn open_connection(path: &Path) -> anyhow::Result<Connection> {
        let conn = Connection::open(path)?;
        // Exclusive process lock: concurrent engines are not supported.
        conn.pragma_update(None, "locking_mode", "exclusive")?;
        conn.pragma_update(None, "synchronous", "normal")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                 file_hash   TEXT PRIMARY KEY,
                 rule        TEXT NOT NULL,
                 format      TEXT NOT NULL,
                 recorded_at INTEGER NOT NULL,
                 payload     BLOB NOT NULL
             );
             CREATE TABLE IF NOT EXISTS stats (
                 rule                TEXT NOT NULL,
                 format              TEXT NOT NULL,
                 observations        INTEGER NOT NULL,
                 sum_abs_error       REAL NOT NULL,
                 sum_actual_saving   REAL NOT NULL,
                 validation_failures INTEGER NOT NULL,
                 PRIMARY KEY (rule, format)
             );",
        )?;
        // Materialize the exclusive lock now, not at first write.
        conn.execute_batch("BEGIN EXCLUSIVE; COMMIT;")?;
        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Handle the predictor reads aggregates through.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            inner: Arc::clone(&self.snapshot),
        }
    }

    /// Queue a record for the writer. Never blocks on SQLite.
    pub fn append(&self, record: ConversionRecord) {
        if let Some(tx) = &self.tx {
            if tx.send(WriterMsg::Record(Box::new(record))).is_err() {
                tracing::warn!("Learning store writer is gone; record dropped");
            }
        }
    }

    /// Force pending records to disk (the writer also flushes on its own
    /// cadence).
    pub fn flush(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(WriterMsg::Flush);
        }
    }

    /// Graceful shutdown: drain the channel, flush, close the connection.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.tx.take());
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                tracing::error!("Learning store writer panicked during shutdown");
            }
        }
    }
}

impl Drop for LearningStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn quarantine_path(path: &Path) -> PathBuf {
    let ts = chrono::Utc::now().format("%Y%m%d%H%M%S");
    path.with_extension(format!("corrupt.{}", ts))
}

fn load_stats(conn: &Connection) -> anyhow::Result<StatsMap> {
    let mut stmt = conn.prepare(
        "SELECT rule, format, observations, sum_abs_error, sum_actual_saving, validation_failures
         FROM stats",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            (row.get::<_, String>(0)?, row.get::<_, String>(1)?),
            RuleAggregate {
                observations: row.get::<_, i64>(2)? as u64,
                sum_abs_error: row.get(3)?,
                sum_actual_saving: row.get(4)?,
                validation_failures: row.get::<_, i64>(5)? as u64,
            },
        ))
    })?;

    let mut map = StatsMap::new();
    for row in rows {
        let (key, agg) = row?;
        map.insert(key, agg);
    }
    Ok(map)
}

fn writer_loop(mut conn: Connection, rx: Receiver<WriterMsg>, snapshot: Arc<RwLock<StatsMap>>) {
    let mut buffer: Vec<ConversionRecord> = Vec::new();
    let mut last_flush = Instant::now();

    loop {
        let timeout = FLUSH_INTERVAL
            .checked_sub(last_flush.elapsed())
            .unwrap_or(Duration::ZERO);
        match rx.recv_timeout(timeout) {
            Ok(WriterMsg::Record(record)) => {
                buffer.push(*record);
                if buffer.len() >= FLUSH_EVERY {
                    flush_buffer(&mut conn, &mut buffer, &snapshot);
                    last_flush = Instant::now();
                }
            }
            Ok(WriterMsg::Flush) | Err(RecvTimeoutError::Timeout) => {
                flush_buffer(&mut conn, &mut buffer, &snapshot);
                last_flush = Instant::now();
            }
            Err(RecvTimeoutError::Disconnected) => {
                // Engine shutting down: final flush, then let the connection
                // close on drop.
                flush_buffer(&mut conn, &mut buffer, &snapshot);
                if !buffer.is_empty() {
                    tracing::warn!(
                        dropped = buffer.len(),
                        "Learning store records still unflushed at shutdown"
                    );
                }
                return;
            }
        }
    }
}

/// Write the buffered records in one transaction and mirror the aggregates
/// into the snapshot. On failure the buffer is retained for the next flush.
fn flush_buffer(conn: &mut Connection, buffer: &mut Vec<ConversionRecord>, snapshot: &Arc<RwLock<StatsMap>>) {
    if buffer.is_empty() {
        return;
    }

    match write_batch(conn, buffer) {
        Ok(()) => {
            let mut guard = snapshot.write().unwrap_or_else(|e| e.into_inner());
            for record in buffer.iter() {
                guard
                    .entry((record.rule_name.clone(), record.format.clone()))
                    .or_default()
                    .absorb(record);
            }
            tracing::debug!(records = buffer.len(), "Learning store flush");
            buffer.clear();
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                pending = buffer.len(),
                "Learning store write failed; will retry on next flush"
            );
            if buffer.len() > MAX_BUFFERED {
                let drop_count = buffer.len() - MAX_BUFFERED;
                buffer.drain(..drop_count);
                tracing::error!(dropped = drop_count, "Learning store buffer overflow");
            }
        }
    }
}

fn write_batch(conn: &mut Connection, records: &[ConversionRecord]) -> anyhow::Result<()> {
    let tx = conn.transaction()?;
    {
        let mut insert_record = tx.prepare_cached(
            "INSERT OR REPLACE INTO records (file_hash, rule, format, recorded_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        let mut upsert_stats = tx.prepare_cached(
            "INSERT INTO stats (rule, format, observations, sum_abs_error, sum_actual_saving, validation_failures)
             VALUES (?1, ?2, 1, ?3, ?4, ?5)
             ON CONFLICT(rule, format) DO UPDATE SET
                 observations        = observations + 1,
                 sum_abs_error       = sum_abs_error + excluded.sum_abs_error,
                 sum_actual_saving   = sum_actual_saving + excluded.sum_actual_saving,
                 validation_failures = validation_failures + excluded.validation_failures",
        )?;

        for record in records {
            let payload = rmp_serde::to_vec_named(record)?;
            insert_record.execute(rusqlite::params![
                record.file_hash,
                record.rule_name,
                record.format,
                record.recorded_at.timestamp(),
                payload,
            ])?;
            upsert_stats.execute(rusqlite::params![
                record.rule_name,
                record.format,
                record.prediction_error(),
                record.actual_saving_ratio,
                if record.validation_passed { 0i64 } else { 1i64 },
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Count of durable records; used by the summary and by startup logging.
pub fn record_count(path: &Path) -> anyhow::Result<u64> {
    let conn = Connection::open(path)?;
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
    Ok(n as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(rule: &str, format: &str, hash: &str, expected: f64, actual: f64) -> ConversionRecord {
        ConversionRecord {
            file_hash: hash.to_string(),
            file_name: "test.png".to_string(),
            format: format.to_string(),
            media_class: "still_image".to_string(),
            size_bytes: 1000,
            width: 100,
            height: 100,
            pixel_format: "rgb24".to_string(),
            frame_count: 1,
            rule_name: rule.to_string(),
            method_tag: "jxl.d0.e7".to_string(),
            expected_saving_ratio: expected,
            confidence: 0.85,
            explored: false,
            actual_saving_ratio: actual,
            encoder_elapsed_ms: 120,
            validation_passed: true,
            validation_metric: Some(1.0),
            recorded_at: Utc::now(),
            host_os: "linux".to_string(),
        }
    }

    #[test]
    fn test_open_creates_store_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("deep").join("knowledge.db");
        let store = LearningStore::open(&path).unwrap();
        assert!(path.exists());
        store.close();
    }

    #[test]
    fn test_append_flush_and_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("knowledge.db");

        {
            let store = LearningStore::open(&path).unwrap();
            store.append(record("png.lossless_default", "png", "h1", 0.62, 0.60));
            store.append(record("png.lossless_default", "png", "h2", 0.62, 0.58));
            store.close();
        }

        assert_eq!(record_count(&path).unwrap(), 2);

        let store = LearningStore::open(&path).unwrap();
        let stats = store
            .snapshot()
            .rule_stats("png.lossless_default", "png")
            .unwrap();
        assert_eq!(stats.observations, 2);
        assert!((stats.mean_actual_saving - 0.59).abs() < 1e-9);
        store.close();
    }

    #[test]
    fn test_snapshot_sees_flushed_writes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("knowledge.db");
        let store = LearningStore::open(&path).unwrap();

        let snapshot = store.snapshot();
        assert!(snapshot.rule_stats("gif.static", "gif").is_none());

        store.append(record("gif.static", "gif", "h1", 0.40, 0.35));
        store.flush();
        // The flush message is processed asynchronously; give the writer a
        // moment rather than sleeping a fixed eternity.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if snapshot.rule_stats("gif.static", "gif").is_some() {
                break;
            }
            assert!(Instant::now() < deadline, "flush never landed");
            std::thread::sleep(Duration::from_millis(10));
        }
        let stats = snapshot.rule_stats("gif.static", "gif").unwrap();
        assert_eq!(stats.observations, 1);
        store.close();
    }

    #[test]
    fn test_same_hash_replaces_record_but_stats_accumulate() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("knowledge.db");
        {
            let store = LearningStore::open(&path).unwrap();
            store.append(record("webp.static", "webp", "same", 0.20, 0.22));
            store.append(record("webp.static", "webp", "same", 0.20, 0.18));
            store.close();
        }
        // One durable record (keyed), two observations.
        assert_eq!(record_count(&path).unwrap(), 1);
        let store = LearningStore::open(&path).unwrap();
        let stats = store.snapshot().rule_stats("webp.static", "webp").unwrap();
        assert_eq!(stats.observations, 2);
        store.close();
    }

    #[test]
    fn test_negative_learning_counts_failures() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("knowledge.db");
        {
            let store = LearningStore::open(&path).unwrap();
            let mut failed = record("webp.animated", "webp", "h9", 0.35, 0.0);
            failed.validation_passed = false;
            failed.validation_metric = None;
            store.append(failed);
            store.close();
        }
        let store = LearningStore::open(&path).unwrap();
        let stats = store.snapshot().rule_stats("webp.animated", "webp").unwrap();
        assert_eq!(stats.observations, 1);
        assert!((stats.mean_abs_error - 0.35).abs() < 1e-9);
        store.close();
    }

    #[test]
    fn test_corrupt_store_renamed_aside() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("knowledge.db");
        std::fs::write(&path, b"this is not a sqlite database, not even close").unwrap();

        let store = LearningStore::open(&path).unwrap();
        store.append(record("gif.static", "gif", "h1", 0.40, 0.41));
        store.close();

        assert_eq!(record_count(&path).unwrap(), 1);
        // The old garbage survives under a quarantine name.
        let quarantined = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains("corrupt"));
        assert!(quarantined);
    }

    #[test]
    fn test_rule_aggregate_absorb() {
        let mut agg = RuleAggregate::default();
        agg.absorb(&record("r", "f", "h", 0.5, 0.4));
        agg.absorb(&record("r", "f", "h2", 0.5, 0.6));
        assert_eq!(agg.observations, 2);
        let stats = agg.to_rule_stats();
        assert!((stats.mean_abs_error - 0.1).abs() < 1e-9);
        assert!((stats.mean_actual_saving - 0.5).abs() < 1e-9);
    }
}
