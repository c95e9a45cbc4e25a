//! Run store: runs, parameter specs and result rows in one SQLite file.
//!
//! Layout:
//! - `runs`: one row per run (state, timestamps, metadata JSON, guid)
//! - `parameters`: the ordered spec list of each run
//! - `results_<run_id>`: one table per run, a column per parameter
//!
//! Run creation, deletion and migration go through a per-file writer lock
//! shared by every handle in the process. Result batches are a single
//! immediate transaction each, so readers see all of a batch or none of it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::codec;
use crate::config::StoreConfig;
use crate::error::{MeasdbError, Result};
use crate::models::{Metadata, ParamSpec, ResultRow, Run, RunState, RunSummary, Value};
use crate::schema;
use crate::validate::Layout;

// ─── Per-file writer locks ───────────────────────────────────────────────────

static FILE_LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| MeasdbError::Other("mutex poisoned".to_string()))
}

/// The writer lock for `path`. The parent directory must exist.
fn file_lock(path: &Path) -> Result<Arc<Mutex<()>>> {
    let key = match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            parent.canonicalize()?.join(name)
        }
        _ => path.to_path_buf(),
    };
    let registry = FILE_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut locks = lock(registry)?;
    Ok(locks.entry(key).or_default().clone())
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn result_table(run_id: i64) -> String {
    format!("\"results_{run_id}\"")
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| MeasdbError::Corrupt(format!("timestamp {micros} out of range")))
}

fn opt_from_micros(micros: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    micros.map(from_micros).transpose()
}

fn create_results_sql(run_id: i64, specs: &[ParamSpec]) -> String {
    let mut columns = vec![
        "id INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
        "timestamp INTEGER NOT NULL".to_string(),
    ];
    // Names are validated identifiers, so plain quoting is enough.
    columns.extend(
        specs
            .iter()
            .map(|s| format!("\"{}\" {}", s.name, s.param_type.sql_type())),
    );
    format!("CREATE TABLE {} ({});", result_table(run_id), columns.join(", "))
}

/// One `runs` row before its specs are attached.
struct RunRecord {
    run_id: i64,
    guid: String,
    name: String,
    state: RunState,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    metadata: Metadata,
}

const RUN_COLUMNS: &str =
    "run_id, guid, name, state, created_at, started_at, completed_at, metadata";

type RawRun = (i64, Option<String>, String, String, i64, Option<i64>, Option<i64>, String);

fn map_run_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn build_run_record(raw: RawRun) -> Result<RunRecord> {
    let (run_id, guid, name, state, created_at, started_at, completed_at, metadata) = raw;
    Ok(RunRecord {
        run_id,
        guid: guid.unwrap_or_default(),
        name,
        state: state.parse()?,
        created_at: from_micros(created_at)?,
        started_at: opt_from_micros(started_at)?,
        completed_at: opt_from_micros(completed_at)?,
        metadata: serde_json::from_str(&metadata)?,
    })
}

fn load_record(conn: &Connection, run_id: i64) -> Result<RunRecord> {
    let raw = conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
            params![run_id],
            map_run_record,
        )
        .optional()?
        .ok_or(MeasdbError::RunNotFound(run_id))?;
    build_run_record(raw)
}

fn load_state(conn: &Connection, run_id: i64) -> Result<RunState> {
    let state: Option<String> = conn
        .query_row(
            "SELECT state FROM runs WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()?;
    state.ok_or(MeasdbError::RunNotFound(run_id))?.parse()
}

fn load_specs(conn: &Connection, run_id: i64) -> Result<Vec<ParamSpec>> {
    let mut stmt = conn.prepare_cached(
        "SELECT name, param_type, label, unit, depends_on, inferred_from
         FROM parameters WHERE run_id = ?1 ORDER BY position",
    )?;
    let raw = stmt
        .query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    raw.into_iter()
        .map(|(name, ptype, label, unit, depends_on, inferred_from)| -> Result<ParamSpec> {
            Ok(ParamSpec {
                name,
                param_type: ptype.parse()?,
                label,
                unit,
                depends_on: serde_json::from_str(&depends_on)?,
                inferred_from: serde_json::from_str(&inferred_from)?,
            })
        })
        .collect()
}

fn count_rows(conn: &Connection, run_id: i64) -> Result<u64> {
    let n: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", result_table(run_id)),
        [],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

/// Stored rows as `(timestamp, values in layout order)`.
pub(crate) type StoredRow = (DateTime<Utc>, Vec<Option<Value>>);

fn read_rows(conn: &Connection, run_id: i64, layout: &Layout) -> Result<Vec<StoredRow>> {
    let mut columns = vec!["timestamp".to_string()];
    columns.extend(layout.specs().iter().map(|s| format!("\"{}\"", s.name)));
    let sql = format!(
        "SELECT {} FROM {} ORDER BY id",
        columns.join(", "),
        result_table(run_id)
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let ts = from_micros(row.get(0)?)?;
        let mut values = Vec::with_capacity(layout.specs().len());
        for pos in 0..layout.specs().len() {
            let raw: ValueRef<'_> = row.get_ref(pos + 1)?;
            values.push(codec::from_sql(raw, layout.param_type(pos))?);
        }
        out.push((ts, values));
    }
    Ok(out)
}

/// A consistent view of one run, read in a single transaction.
pub(crate) struct Snapshot {
    pub run: Run,
    pub rows: Vec<StoredRow>,
}

// ─── Store ───────────────────────────────────────────────────────────────────

struct Inner {
    config: StoreConfig,
    conn: Mutex<Connection>,
    writer_lock: Arc<Mutex<()>>,
}

/// Handle to a measurement database file.
///
/// Cheap to clone; clones share one connection. Open a second handle on the
/// same path to read from another thread while this one writes.
#[derive(Clone)]
pub struct RunStore {
    inner: Arc<Inner>,
}

impl RunStore {
    /// Open (creating if needed) the store at `path` with default settings.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(StoreConfig::new(path))
    }

    /// Open a store, running the version guard first.
    ///
    /// Fails with `VersionMismatch` for files newer than this build and with
    /// `UpgradeRequired` for older files when `auto_upgrade` is off.
    pub fn open_with_config(config: StoreConfig) -> Result<Self> {
        if config.path.is_dir() {
            return Err(MeasdbError::Other(format!(
                "{} is a directory",
                config.path.display()
            )));
        }
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let writer_lock = file_lock(&config.path)?;
        let conn = {
            let _guard = lock(&writer_lock)?;
            let mut conn = open_connection(&config)?;
            let version = schema::ensure_current(&mut conn, config.auto_upgrade)?;
            info!(path = %config.path.display(), version, "Opened run store");
            conn
        };

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                conn: Mutex::new(conn),
                writer_lock,
            }),
        })
    }

    /// Migrate an existing file to the current schema, ignoring
    /// `auto_upgrade`. Returns the versions before and after.
    pub fn upgrade(path: impl Into<PathBuf>) -> Result<(u32, u32)> {
        let config = StoreConfig::new(path);
        let before = schema::inspect_version(&config.path)?;
        let writer_lock = file_lock(&config.path)?;
        let _guard = lock(&writer_lock)?;
        let mut conn = open_connection(&config)?;
        let after = schema::ensure_current(&mut conn, true)?;
        if after != before {
            info!(path = %config.path.display(), from = before, to = after, "Upgraded run store");
        }
        Ok((before, after))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        lock(&self.inner.conn)
    }

    /// Register a new run, returning its id. Ids increase monotonically and
    /// are never reused, even after deletion.
    pub fn create_run(&self, name: &str, specs: Vec<ParamSpec>, metadata: Metadata) -> Result<i64> {
        let layout = Layout::new(specs)?;

        let _writer = lock(&self.inner.writer_lock)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO runs (name, state, created_at, metadata, guid) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                name,
                RunState::Created.as_str(),
                to_micros(Utc::now()),
                serde_json::to_string(&metadata)?,
                Uuid::new_v4().to_string(),
            ],
        )?;
        let run_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO parameters
                 (run_id, position, name, param_type, label, unit, depends_on, inferred_from)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for (pos, spec) in layout.specs().iter().enumerate() {
                stmt.execute(params![
                    run_id,
                    pos as i64,
                    spec.name,
                    spec.param_type.as_str(),
                    spec.label,
                    spec.unit,
                    serde_json::to_string(&spec.depends_on)?,
                    serde_json::to_string(&spec.inferred_from)?,
                ])?;
            }
        }
        tx.execute_batch(&create_results_sql(run_id, layout.specs()))?;
        tx.commit()?;

        info!(run_id, name, params = layout.specs().len(), "Created run");
        Ok(run_id)
    }

    pub fn get_run(&self, run_id: i64) -> Result<Run> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let run = load_run(&tx, run_id)?;
        tx.commit()?;
        Ok(run)
    }

    /// All runs, oldest first.
    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let raw = {
            let mut stmt = tx.prepare(&format!("SELECT {RUN_COLUMNS} FROM runs ORDER BY run_id"))?;
            let raw = stmt
                .query_map([], map_run_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raw
        };
        let mut out = Vec::with_capacity(raw.len());
        for record in raw {
            let record = build_run_record(record)?;
            out.push(RunSummary {
                run_id: record.run_id,
                result_count: count_rows(&tx, record.run_id)?,
                guid: record.guid,
                name: record.name,
                state: record.state,
                created_at: record.created_at,
                completed_at: record.completed_at,
            });
        }
        tx.commit()?;
        Ok(out)
    }

    /// Remove a run, its specs and its result table.
    pub fn delete_run(&self, run_id: i64) -> Result<()> {
        let _writer = lock(&self.inner.writer_lock)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        load_state(&tx, run_id)?;
        tx.execute("DELETE FROM parameters WHERE run_id = ?1", params![run_id])?;
        tx.execute("DELETE FROM runs WHERE run_id = ?1", params![run_id])?;
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {};", result_table(run_id)))?;
        tx.commit()?;
        info!(run_id, "Deleted run");
        Ok(())
    }

    /// `Created → Writing`.
    pub fn mark_started(&self, run_id: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match load_state(&tx, run_id)? {
            RunState::Created => {}
            RunState::Writing => return Err(MeasdbError::AlreadyStarted(run_id)),
            RunState::Completed => return Err(MeasdbError::AlreadyCompleted(run_id)),
        }
        tx.execute(
            "UPDATE runs SET state = ?1, started_at = ?2 WHERE run_id = ?3",
            params![RunState::Writing.as_str(), to_micros(Utc::now()), run_id],
        )?;
        tx.commit()?;
        info!(run_id, "Run started");
        Ok(())
    }

    /// `Writing → Completed`. A second call fails with `AlreadyCompleted`.
    pub fn mark_completed(&self, run_id: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match load_state(&tx, run_id)? {
            RunState::Writing => {}
            RunState::Created => return Err(MeasdbError::RunNotStarted(run_id)),
            RunState::Completed => return Err(MeasdbError::AlreadyCompleted(run_id)),
        }
        tx.execute(
            "UPDATE runs SET state = ?1, completed_at = ?2 WHERE run_id = ?3",
            params![RunState::Completed.as_str(), to_micros(Utc::now()), run_id],
        )?;
        tx.commit()?;
        info!(run_id, "Run completed");
        Ok(())
    }

    /// Set one metadata entry. Allowed in every state.
    pub fn add_metadata(&self, run_id: i64, key: &str, value: serde_json::Value) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut record = load_record(&tx, run_id)?;
        record.metadata.insert(key.to_string(), value);
        tx.execute(
            "UPDATE runs SET metadata = ?1 WHERE run_id = ?2",
            params![serde_json::to_string(&record.metadata)?, run_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// The validated parameter layout of a run.
    pub fn layout(&self, run_id: i64) -> Result<Layout> {
        let conn = self.conn()?;
        load_state(&conn, run_id)?;
        Ok(Layout::from_trusted(load_specs(&conn, run_id)?))
    }

    /// Append a batch atomically. Any invalid row rejects the whole batch and
    /// nothing is written. Returns the number of rows committed.
    pub fn add_results(&self, run_id: i64, rows: &[ResultRow]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match load_state(&tx, run_id)? {
            RunState::Writing => {}
            RunState::Created => return Err(MeasdbError::RunNotStarted(run_id)),
            RunState::Completed => return Err(MeasdbError::AlreadyCompleted(run_id)),
        }
        let layout = Layout::from_trusted(load_specs(&tx, run_id)?);
        layout.validate_rows(rows)?;

        let mut columns = vec!["timestamp".to_string()];
        columns.extend(layout.specs().iter().map(|s| format!("\"{}\"", s.name)));
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            result_table(run_id),
            columns.join(", "),
            placeholders
        );

        let policy = self.inner.config.non_finite;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for row in rows {
                let mut values = Vec::with_capacity(columns.len());
                values.push(SqlValue::Integer(to_micros(row.timestamp)));
                for spec in layout.specs() {
                    values.push(
                        row.values
                            .get(&spec.name)
                            .map(|v| codec::to_sql(v, policy))
                            .unwrap_or(SqlValue::Null),
                    );
                }
                stmt.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;

        debug!(run_id, rows = rows.len(), "Committed result batch");
        Ok(rows.len())
    }

    /// Committed rows of a run in insertion order, in any state.
    pub fn get_results(&self, run_id: i64) -> Result<Vec<ResultRow>> {
        let snapshot = self.snapshot(run_id)?;
        let specs = snapshot.run.specs;
        Ok(snapshot
            .rows
            .into_iter()
            .map(|(timestamp, values)| ResultRow {
                timestamp,
                values: specs
                    .iter()
                    .zip(values)
                    .filter_map(|(spec, v)| v.map(|v| (spec.name.clone(), v)))
                    .collect(),
            })
            .collect())
    }

    pub fn result_count(&self, run_id: i64) -> Result<u64> {
        let conn = self.conn()?;
        load_state(&conn, run_id)?;
        count_rows(&conn, run_id)
    }

    /// Stage rows in memory and commit them later as one batch.
    pub fn begin_batch(&self, run_id: i64) -> Result<Batch> {
        let conn = self.conn()?;
        match load_state(&conn, run_id)? {
            RunState::Writing => {}
            RunState::Created => return Err(MeasdbError::RunNotStarted(run_id)),
            RunState::Completed => return Err(MeasdbError::AlreadyCompleted(run_id)),
        }
        let layout = Layout::from_trusted(load_specs(&conn, run_id)?);
        drop(conn);
        Ok(Batch {
            store: self.clone(),
            run_id,
            layout,
            rows: Vec::new(),
        })
    }

    pub(crate) fn snapshot(&self, run_id: i64) -> Result<Snapshot> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let run = load_run(&tx, run_id)?;
        let layout = Layout::from_trusted(run.specs.clone());
        let rows = read_rows(&tx, run_id, &layout)?;
        tx.commit()?;
        Ok(Snapshot { run, rows })
    }
}

fn load_run(conn: &Connection, run_id: i64) -> Result<Run> {
    let record = load_record(conn, run_id)?;
    let specs = load_specs(conn, run_id)?;
    let result_count = count_rows(conn, run_id)?;
    Ok(Run {
        run_id: record.run_id,
        guid: record.guid,
        name: record.name,
        state: record.state,
        created_at: record.created_at,
        started_at: record.started_at,
        completed_at: record.completed_at,
        specs,
        metadata: record.metadata,
        result_count,
    })
}

fn open_connection(config: &StoreConfig) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let conn = Connection::open_with_flags(&config.path, flags)?;
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    // journal_mode returns the resulting mode as a row.
    let _mode: String = conn.query_row(
        &format!("PRAGMA journal_mode = {}", config.journal_mode.pragma_value()),
        [],
        |row| row.get(0),
    )?;
    Ok(conn)
}

// ─── Staged batches ──────────────────────────────────────────────────────────

/// Rows staged for one atomic commit.
///
/// Rows are checked as they are pushed. Dropping the batch without calling
/// [`Batch::commit`] discards everything.
pub struct Batch {
    store: RunStore,
    run_id: i64,
    layout: Layout,
    rows: Vec<ResultRow>,
}

impl Batch {
    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn push(&mut self, row: ResultRow) -> Result<()> {
        self.layout.validate_row(self.rows.len(), &row)?;
        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn commit(self) -> Result<usize> {
        self.store.add_results(self.run_id, &self.rows)
    }

    pub fn abort(self) {
        debug!(run_id = self.run_id, rows = self.rows.len(), "Aborted result batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn iv_store(tmp: &TempDir) -> (RunStore, i64) {
        let store = RunStore::open(tmp.path().join("iv.db")).unwrap();
        let id = store
            .create_run(
                "iv",
                vec![
                    ParamSpec::numeric("V"),
                    ParamSpec::numeric("I").depends_on(["V"]),
                ],
                Metadata::new(),
            )
            .unwrap();
        (store, id)
    }

    #[test]
    fn run_ids_are_not_reused() {
        let tmp = TempDir::new().unwrap();
        let (store, first) = iv_store(&tmp);
        store.delete_run(first).unwrap();
        let second = store
            .create_run("again", vec![ParamSpec::numeric("x")], Metadata::new())
            .unwrap();
        assert!(second > first);
    }

    #[test]
    fn delete_drops_everything() {
        let tmp = TempDir::new().unwrap();
        let (store, id) = iv_store(&tmp);
        store.delete_run(id).unwrap();
        assert!(matches!(store.get_run(id), Err(MeasdbError::RunNotFound(_))));
        assert!(matches!(store.delete_run(id), Err(MeasdbError::RunNotFound(_))));
        let conn = store.conn().unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name LIKE 'results_%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 0);
    }

    #[test]
    fn writing_requires_started_run() {
        let tmp = TempDir::new().unwrap();
        let (store, id) = iv_store(&tmp);
        let row = ResultRow::from_pairs([("V", 1.0)]);
        assert!(matches!(
            store.add_results(id, &[row.clone()]),
            Err(MeasdbError::RunNotStarted(_))
        ));
        store.mark_started(id).unwrap();
        assert_eq!(store.add_results(id, &[row]).unwrap(), 1);
    }

    #[test]
    fn aborted_batch_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let (store, id) = iv_store(&tmp);
        store.mark_started(id).unwrap();

        let mut batch = store.begin_batch(id).unwrap();
        batch.push(ResultRow::from_pairs([("V", 1.0), ("I", 2.0)])).unwrap();
        assert!(batch.push(ResultRow::from_pairs([("I", 2.0)])).is_err());
        assert_eq!(batch.len(), 1);
        batch.abort();
        assert_eq!(store.result_count(id).unwrap(), 0);

        let mut batch = store.begin_batch(id).unwrap();
        batch.push(ResultRow::from_pairs([("V", 1.0)])).unwrap();
        assert_eq!(batch.commit().unwrap(), 1);
        assert_eq!(store.result_count(id).unwrap(), 1);
    }

    #[test]
    fn metadata_can_be_added_after_completion() {
        let tmp = TempDir::new().unwrap();
        let (store, id) = iv_store(&tmp);
        store.mark_started(id).unwrap();
        store.mark_completed(id).unwrap();
        store
            .add_metadata(id, "sample", serde_json::json!("wafer-7"))
            .unwrap();
        let run = store.get_run(id).unwrap();
        assert_eq!(run.metadata.get("sample"), Some(&serde_json::json!("wafer-7")));
        assert!(run.duration_secs().is_some());
    }

    #[test]
    fn upgrade_reports_versions() {
        let tmp = TempDir::new().unwrap();
        let (store, _) = iv_store(&tmp);
        let path = store.path().to_path_buf();
        assert_eq!(
            RunStore::upgrade(&path).unwrap(),
            (schema::CURRENT_VERSION, schema::CURRENT_VERSION)
        );

        let newer = tmp.path().join("newer.db");
        Connection::open(&newer)
            .unwrap()
            .execute_batch("CREATE TABLE t (x); PRAGMA user_version = 99;")
            .unwrap();
        assert!(matches!(
            RunStore::upgrade(&newer),
            Err(MeasdbError::VersionMismatch { found: 99, .. })
        ));
        assert!(RunStore::upgrade(tmp.path().join("missing.db")).is_err());
    }

    #[test]
    fn starting_twice_is_refused() {
        let tmp = TempDir::new().unwrap();
        let (store, id) = iv_store(&tmp);
        store.mark_started(id).unwrap();
        assert!(matches!(store.mark_started(id), Err(MeasdbError::AlreadyStarted(_))));
        store.mark_completed(id).unwrap();
        assert!(matches!(store.mark_started(id), Err(MeasdbError::AlreadyCompleted(_))));
    }

    #[test]
    fn run_without_parameters_can_be_created_and_exported() {
        let tmp = TempDir::new().unwrap();
        let store = RunStore::open(tmp.path().join("empty.db")).unwrap();
        let id = store.create_run("empty", Vec::new(), Metadata::new()).unwrap();
        assert!(store.get_run(id).unwrap().specs.is_empty());

        store.mark_started(id).unwrap();
        store.mark_completed(id).unwrap();
        let table = store.export(id).unwrap();
        assert_eq!(table.num_rows(), 0);
        assert_eq!(table.to_record_batch(false).unwrap().num_columns(), 0);
        assert_eq!(table.to_csv(), "timestamp\n");
    }

    #[test]
    fn concurrent_creation_allocates_distinct_ids() {
        const THREADS: usize = 8;
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("busy.db");
        RunStore::open(&path).unwrap();

        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = RunStore::open(&path).unwrap();
                    store
                        .create_run(
                            &format!("worker_{i}"),
                            vec![ParamSpec::numeric("x")],
                            Metadata::new(),
                        )
                        .unwrap()
                })
            })
            .collect();
        let mut ids: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), THREADS);

        let store = RunStore::open(&path).unwrap();
        assert_eq!(store.list_runs().unwrap().len(), THREADS);
        for id in ids {
            assert_eq!(store.result_count(id).unwrap(), 0);
        }
    }

    #[test]
    fn handles_share_the_writer_lock() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("shared.db");
        let a = RunStore::open(&path).unwrap();
        let b = RunStore::open(tmp.path().join(".").join("shared.db")).unwrap();
        assert!(Arc::ptr_eq(&a.inner.writer_lock, &b.inner.writer_lock));
    }
}
