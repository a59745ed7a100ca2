#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! SQLite adapter for rare-drop synchronization.
//!
//! Every operation works against the live reference tables in place. Writes
//! are issued statement by statement so that the per-statement parameter
//! ceiling of the target store can be honoured.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rare_drop_core::SyncError;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};

pub mod backup;
pub mod catalog;
pub mod detect;
pub mod engine;
pub mod fixtures;
pub mod writer;

pub use backup::{
    RestoreReport, SnapshotAction, SnapshotProvenance, SnapshotReport, SnapshotStatus,
};
pub use detect::DetectOptions;
pub use engine::{
    run_operation, spawn, ApplyReport, JobEvent, JobHandle, Operation, OperationReport,
};
pub use writer::WriteReport;

pub const CATALOG_TABLE: &str = "_RefObjCommon";
pub const ACTOR_TABLE: &str = "_RefObjChar";
pub const GROUP_TABLE: &str = "_RefDropItemGroup";
pub const ASSIGNMENT_TABLE: &str = "_RefMonster_AssignedItemRndDrop";
pub const GROUP_BACKUP_TABLE: &str = "_RefDropItemGroup_Backup";
pub const ASSIGNMENT_BACKUP_TABLE: &str = "_RefMonster_AssignedItemRndDrop_Backup";
pub const SNAPSHOT_TABLE: &str = "_RareDropSnapshot";

pub const CATALOG_COLUMNS: &[&str] = &[
    "Service",
    "ID",
    "CodeName128",
    "TypeID1",
    "TypeID2",
    "Country",
    "Link",
    "ReqLevel1",
];
pub const ACTOR_COLUMNS: &[&str] = &["ID", "Lvl"];
pub const GROUP_COLUMNS: &[&str] = &[
    "Service",
    "RefItemGroupID",
    "CodeName128",
    "RefItemID",
    "SelectRatio",
    "RefMagicGroupID",
];
pub const ASSIGNMENT_COLUMNS: &[&str] = &[
    "Service",
    "RefMonsterID",
    "RefItemGroupID",
    "ItemGroupCodeName128",
    "Overlap",
    "DropAmountMin",
    "DropAmountMax",
    "DropRatio",
    "param1",
    "param2",
];

const SCHEMA_SNAPSHOT_V1: &str = r"
CREATE TABLE IF NOT EXISTS _RareDropSnapshot (
  snapshot_id TEXT PRIMARY KEY,
  captured_at TEXT NOT NULL,
  provenance TEXT NOT NULL CHECK (provenance IN ('initial', 'manual_refresh')),
  group_rows INTEGER NOT NULL CHECK (group_rows >= 0),
  assignment_rows INTEGER NOT NULL CHECK (assignment_rows >= 0)
);
";

pub struct SqliteDropStore {
    conn: Connection,
}

impl SqliteDropStore {
    /// Opens an existing database. A missing file is a connectivity failure,
    /// never an implicitly created empty database.
    pub fn open(path: &Path) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .map_err(|err| connectivity_error(&err))
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|err| classify_error(&err))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Read-only check that the reference tables carry the required columns.
    pub fn check_compatibility(&self) -> Result<()> {
        ensure_reference_compatibility(&self.conn)
    }

    /// Verifies the reference tables and creates the snapshot record table.
    /// Only operations that write should call this.
    pub fn migrate(&self) -> Result<()> {
        self.check_compatibility()?;

        self.conn
            .execute_batch(SCHEMA_SNAPSHOT_V1)
            .map_err(|err| classify_error(&err))
            .context("failed to apply snapshot schema")?;

        Ok(())
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

fn ensure_reference_compatibility(conn: &Connection) -> Result<()> {
    for (table, columns) in [
        (CATALOG_TABLE, CATALOG_COLUMNS),
        (ACTOR_TABLE, ACTOR_COLUMNS),
        (GROUP_TABLE, GROUP_COLUMNS),
        (ASSIGNMENT_TABLE, ASSIGNMENT_COLUMNS),
    ] {
        if !table_exists(conn, table)? {
            return Err(anyhow!(SyncError::Validation(format!(
                "reference schema check failed: expected table {table}"
            ))));
        }
        ensure_table_has_columns(conn, table, columns)?;
    }
    Ok(())
}

pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .map_err(|err| classify_error(&err))
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .map_err(|err| classify_error(&err))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(required))
        {
            return Err(anyhow!(SyncError::Validation(format!(
                "reference schema check failed: missing column {table_name}.{required}"
            ))));
        }
    }

    Ok(())
}

pub(crate) fn count_rows(conn: &Connection, table_name: &str) -> Result<u64> {
    let count: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table_name}"), [], |row| {
            row.get(0)
        })
        .map_err(|err| classify_error(&err))
        .with_context(|| format!("failed to count rows in {table_name}"))?;
    u64::try_from(count).with_context(|| format!("invalid row count for {table_name}: {count}"))
}

/// True when the failure means the database itself is unreachable.
#[must_use]
pub fn is_connectivity_failure(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => matches!(
            failure.code,
            ErrorCode::CannotOpen
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::NotADatabase
                | ErrorCode::DatabaseCorrupt
        ),
        _ => false,
    }
}

fn connectivity_error(err: &rusqlite::Error) -> anyhow::Error {
    anyhow!(SyncError::Connectivity(err.to_string()))
}

/// Raises connectivity failures as [`SyncError::Connectivity`] and keeps
/// everything else as a plain error.
pub(crate) fn classify_error(err: &rusqlite::Error) -> anyhow::Error {
    if is_connectivity_failure(err) {
        connectivity_error(err)
    } else {
        anyhow!(err.to_string())
    }
}

pub(crate) fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> rusqlite::Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

pub(crate) fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Integer,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

/// Extracts the structured failure from an operation error, if any.
#[must_use]
pub fn sync_error(err: &anyhow::Error) -> Option<&SyncError> {
    err.downcast_ref::<SyncError>()
}
