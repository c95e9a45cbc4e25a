//! Schema version guard and migrations.
//!
//! The version lives in SQLite's `user_version` header field. Each migration
//! step runs in its own immediate transaction together with the version bump,
//! so a failing step leaves the file exactly as it was before that step.

use std::path::Path;

use rusqlite::{params, Connection, OpenFlags, Transaction, TransactionBehavior};
use tracing::info;
use uuid::Uuid;

use crate::error::{MeasdbError, Result};

/// Highest schema version this build reads and writes.
pub const CURRENT_VERSION: u32 = 3;

type Step = fn(&Transaction<'_>) -> Result<()>;

/// `(target_version, step)`; step N upgrades from N-1 to N.
const MIGRATIONS: [(u32, Step); 3] = [
    (1, create_base_tables),
    (2, add_run_metadata),
    (3, add_run_guid),
];

pub fn user_version(conn: &Connection) -> Result<u32> {
    let v: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    u32::try_from(v).map_err(|_| MeasdbError::Corrupt(format!("invalid schema version {v}")))
}

fn set_user_version(tx: &Transaction<'_>, version: u32) -> Result<()> {
    // PRAGMA does not take bound parameters.
    tx.execute_batch(&format!("PRAGMA user_version = {version}"))?;
    Ok(())
}

/// A file with no tables at all has never been initialised.
fn is_fresh(conn: &Connection) -> Result<bool> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get(0))?;
    Ok(n == 0)
}

/// Bring `conn` to [`CURRENT_VERSION`] or refuse it.
///
/// The caller must hold the file's writer lock. Fresh files are always
/// initialised; older non-empty files are migrated only when
/// `auto_upgrade` is set.
pub fn ensure_current(conn: &mut Connection, auto_upgrade: bool) -> Result<u32> {
    let found = user_version(conn)?;
    if found > CURRENT_VERSION {
        return Err(MeasdbError::VersionMismatch {
            found,
            supported: CURRENT_VERSION,
        });
    }
    if found == 0 && !is_fresh(conn)? {
        return Err(MeasdbError::Corrupt(
            "file has tables but no schema version; not a measdb store".into(),
        ));
    }
    if found < CURRENT_VERSION {
        if !auto_upgrade && !is_fresh(conn)? {
            return Err(MeasdbError::UpgradeRequired {
                found,
                current: CURRENT_VERSION,
            });
        }
        migrate(conn)?;
    }
    Ok(CURRENT_VERSION)
}

/// Apply every pending step in order. Returns the version reached.
pub fn migrate(conn: &mut Connection) -> Result<u32> {
    for (target, step) in MIGRATIONS {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // Re-read inside the transaction: another connection may have
        // migrated the file while we waited for the write lock.
        let version = user_version(&tx)?;
        if version > CURRENT_VERSION {
            return Err(MeasdbError::VersionMismatch {
                found: version,
                supported: CURRENT_VERSION,
            });
        }
        if version >= target {
            continue;
        }
        step(&tx)?;
        set_user_version(&tx, target)?;
        tx.commit()?;
        info!(from = target - 1, to = target, "Applied schema migration");
    }
    user_version(conn)
}

/// Read a file's schema version without migrating it.
///
/// Opened read-write (never created) so WAL files without a `-shm` sidecar
/// can still be read.
pub fn inspect_version(path: &Path) -> Result<u32> {
    if !path.exists() {
        return Err(MeasdbError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} does not exist", path.display()),
        )));
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
    user_version(&conn)
}

// ─── Steps ───────────────────────────────────────────────────────────────────

fn create_base_tables(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        "CREATE TABLE runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            state TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER
        );
        CREATE TABLE parameters (
            run_id INTEGER NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            name TEXT NOT NULL,
            param_type TEXT NOT NULL,
            label TEXT NOT NULL DEFAULT '',
            unit TEXT NOT NULL DEFAULT '',
            depends_on TEXT NOT NULL DEFAULT '[]',
            inferred_from TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (run_id, position),
            UNIQUE (run_id, name)
        );",
    )?;
    Ok(())
}

fn add_run_metadata(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch("ALTER TABLE runs ADD COLUMN metadata TEXT NOT NULL DEFAULT '{}';")?;
    Ok(())
}

fn add_run_guid(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch("ALTER TABLE runs ADD COLUMN guid TEXT;")?;
    let run_ids: Vec<i64> = {
        let mut stmt = tx.prepare("SELECT run_id FROM runs ORDER BY run_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        ids
    };
    for run_id in &run_ids {
        tx.execute(
            "UPDATE runs SET guid = ?1 WHERE run_id = ?2",
            params![Uuid::new_v4().to_string(), run_id],
        )?;
    }
    tx.execute_batch("CREATE UNIQUE INDEX idx_runs_guid ON runs (guid);")?;
    Ok(())
}
