//! Backup Manager: one full-table shadow generation of the drop tables.

use anyhow::{anyhow, Context, Result};
use rare_drop_core::{
    format_rfc3339, now_utc, parse_rfc3339, ProgressSink, ProgressUpdate, SyncError, WritePhase,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};
use ulid::Ulid;

use crate::{
    classify_error, count_rows, table_exists, SqliteDropStore, ASSIGNMENT_BACKUP_TABLE,
    ASSIGNMENT_TABLE, GROUP_BACKUP_TABLE, GROUP_TABLE, SNAPSHOT_TABLE,
};

const SHADOW_PAIRS: [(&str, &str); 2] = [
    (GROUP_TABLE, GROUP_BACKUP_TABLE),
    (ASSIGNMENT_TABLE, ASSIGNMENT_BACKUP_TABLE),
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotProvenance {
    Initial,
    ManualRefresh,
}

impl SnapshotProvenance {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::ManualRefresh => "manual_refresh",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initial" => Some(Self::Initial),
            "manual_refresh" => Some(Self::ManualRefresh),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SnapshotStatus {
    pub exists: bool,
    pub snapshot_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub captured_at: Option<OffsetDateTime>,
    pub provenance: Option<SnapshotProvenance>,
    pub group_rows: u64,
    pub assignment_rows: u64,
}

impl SnapshotStatus {
    fn missing() -> Self {
        Self {
            exists: false,
            snapshot_id: None,
            captured_at: None,
            provenance: None,
            group_rows: 0,
            assignment_rows: 0,
        }
    }

    #[must_use]
    pub fn is_restorable(&self) -> bool {
        self.exists && self.group_rows > 0 && self.assignment_rows > 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotAction {
    Created,
    Refreshed,
    Kept,
}

impl SnapshotAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Refreshed => "refreshed",
            Self::Kept => "kept",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SnapshotReport {
    pub action: SnapshotAction,
    pub status: SnapshotStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RestoreReport {
    pub groups_cleared: u64,
    pub assignments_cleared: u64,
    pub group_rows_restored: u64,
    pub assignment_rows_restored: u64,
    pub snapshot: SnapshotStatus,
}

struct SnapshotRecord {
    snapshot_id: String,
    captured_at: String,
    provenance: String,
}

impl SqliteDropStore {
    pub fn snapshot_status(&self) -> Result<SnapshotStatus> {
        let conn = self.conn();
        if !table_exists(conn, GROUP_BACKUP_TABLE)? || !table_exists(conn, ASSIGNMENT_BACKUP_TABLE)? {
            return Ok(SnapshotStatus::missing());
        }

        let record = if table_exists(conn, SNAPSHOT_TABLE)? {
            read_record(conn)?
        } else {
            None
        };
        let (snapshot_id, captured_at, provenance) = match record {
            Some(record) => {
                let captured_at = parse_rfc3339(&record.captured_at)
                    .map_err(|err| anyhow!("invalid snapshot timestamp: {err}"))?;
                let provenance = SnapshotProvenance::parse(&record.provenance).ok_or_else(|| {
                    anyhow!("invalid snapshot provenance: {}", record.provenance)
                })?;
                (Some(record.snapshot_id), Some(captured_at), Some(provenance))
            }
            // Shadow tables captured by an earlier tool without a record.
            None => (None, None, None),
        };

        Ok(SnapshotStatus {
            exists: true,
            snapshot_id,
            captured_at,
            provenance,
            group_rows: count_rows(conn, GROUP_BACKUP_TABLE)?,
            assignment_rows: count_rows(conn, ASSIGNMENT_BACKUP_TABLE)?,
        })
    }

    /// Captures a snapshot unless one already exists and `force` is false.
    pub fn ensure_snapshot(&mut self, force: bool) -> Result<SnapshotReport> {
        let current = self.snapshot_status()?;
        if current.exists && !force {
            info!(
                group_rows = current.group_rows,
                assignment_rows = current.assignment_rows,
                "snapshot already present; keeping it"
            );
            return Ok(SnapshotReport {
                action: SnapshotAction::Kept,
                status: current,
            });
        }

        let (action, provenance) = if current.exists {
            (SnapshotAction::Refreshed, SnapshotProvenance::ManualRefresh)
        } else {
            (SnapshotAction::Created, SnapshotProvenance::Initial)
        };
        let snapshot_id = Ulid::new().to_string();
        let captured_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn_mut()
            .transaction()
            .map_err(|err| classify_error(&err))
            .context("failed to start snapshot transaction")?;

        for (source, shadow) in SHADOW_PAIRS {
            tx.execute_batch(&format!(
                "DROP TABLE IF EXISTS {shadow};
                 CREATE TABLE {shadow} AS SELECT * FROM {source};"
            ))
            .map_err(|err| classify_error(&err))
            .with_context(|| format!("failed to copy {source} into {shadow}"))?;
        }
        let group_rows = count_rows(&tx, GROUP_BACKUP_TABLE)?;
        let assignment_rows = count_rows(&tx, ASSIGNMENT_BACKUP_TABLE)?;

        tx.execute(&format!("DELETE FROM {SNAPSHOT_TABLE}"), [])
            .map_err(|err| classify_error(&err))
            .context("failed to clear snapshot record")?;
        tx.execute(
            &format!(
                "INSERT INTO {SNAPSHOT_TABLE}(snapshot_id, captured_at, provenance, group_rows, assignment_rows)
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            params![
                snapshot_id,
                captured_at,
                provenance.as_str(),
                i64::try_from(group_rows).unwrap_or(i64::MAX),
                i64::try_from(assignment_rows).unwrap_or(i64::MAX),
            ],
        )
        .map_err(|err| classify_error(&err))
        .context("failed to record snapshot")?;

        tx.commit()
            .map_err(|err| classify_error(&err))
            .context("failed to commit snapshot")?;

        info!(
            snapshot_id = snapshot_id.as_str(),
            provenance = provenance.as_str(),
            group_rows,
            assignment_rows,
            "snapshot captured"
        );
        Ok(SnapshotReport {
            action,
            status: self.snapshot_status()?,
        })
    }

    /// Replaces both drop tables with the snapshot contents.
    ///
    /// Refuses with [`SyncError::EmptySnapshot`] before touching anything when
    /// either shadow table is missing or empty.
    pub fn restore(&self, sink: &mut dyn ProgressSink) -> Result<RestoreReport> {
        let snapshot = self.snapshot_status()?;
        if !snapshot.is_restorable() {
            warn!(
                exists = snapshot.exists,
                group_rows = snapshot.group_rows,
                assignment_rows = snapshot.assignment_rows,
                "refusing to restore from an empty snapshot"
            );
            return Err(anyhow!(SyncError::EmptySnapshot {
                groups: snapshot.group_rows,
                assignments: snapshot.assignment_rows,
            }));
        }

        let conn = self.conn();
        let mut committed = 0_u64;
        sink.on_progress(&ProgressUpdate::message(10, "clearing drop tables"));
        let mut cleared = [0_u64; 2];
        for (index, (table, _)) in SHADOW_PAIRS.iter().enumerate() {
            let deleted = conn
                .execute(&format!("DELETE FROM {table}"), [])
                .map_err(|err| restore_failure(WritePhase::ClearTables, index + 1, committed, &err))?;
            cleared[index] = u64::try_from(deleted).unwrap_or(u64::MAX);
            committed += 1;
        }

        sink.on_progress(&ProgressUpdate::message(50, "copying snapshot rows back"));
        let mut restored = [0_u64; 2];
        for (index, (table, shadow)) in SHADOW_PAIRS.iter().enumerate() {
            let inserted = conn
                .execute(&format!("INSERT INTO {table} SELECT * FROM {shadow}"), [])
                .map_err(|err| restore_failure(WritePhase::CopySnapshot, index + 1, committed, &err))?;
            restored[index] = u64::try_from(inserted).unwrap_or(u64::MAX);
            committed += 1;
        }

        info!(
            group_rows = restored[0],
            assignment_rows = restored[1],
            "snapshot restored"
        );
        sink.on_progress(&ProgressUpdate::message(100, "restore complete"));
        Ok(RestoreReport {
            groups_cleared: cleared[0],
            assignments_cleared: cleared[1],
            group_rows_restored: restored[0],
            assignment_rows_restored: restored[1],
            snapshot,
        })
    }
}

fn read_record(conn: &Connection) -> Result<Option<SnapshotRecord>> {
    conn.query_row(
        &format!(
            "SELECT snapshot_id, captured_at, provenance FROM {SNAPSHOT_TABLE}
             ORDER BY captured_at DESC LIMIT 1"
        ),
        [],
        |row| {
            Ok(SnapshotRecord {
                snapshot_id: row.get(0)?,
                captured_at: row.get(1)?,
                provenance: row.get(2)?,
            })
        },
    )
    .optional()
    .map_err(|err| classify_error(&err))
    .context("failed to read snapshot record")
}

fn restore_failure(
    phase: WritePhase,
    step: usize,
    committed: u64,
    err: &rusqlite::Error,
) -> anyhow::Error {
    if committed == 0 {
        return classify_error(err).context(format!("{phase} failed before any change"));
    }
    anyhow!(SyncError::PartialBatch {
        phase,
        chunk_index: step,
        chunks_total: SHADOW_PAIRS.len(),
        rows_committed: committed,
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use rare_drop_core::{plan_drops, BatchLimits, DropConfig, NullProgress, Strategy};

    use super::*;
    use crate::fixtures;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteDropStore {
        let conn = match Connection::open_in_memory() {
            Ok(conn) => conn,
            Err(err) => panic!("test failure: {err}"),
        };
        must(fixtures::create_reference_schema(&conn));
        let store = must(SqliteDropStore::from_connection(conn));
        must(store.migrate());
        store
    }

    fn seeded_store() -> SqliteDropStore {
        let store = fixture_store();
        must(fixtures::seed_banded_world(store.conn()));
        must(fixtures::insert_foreign_group(store.conn(), 7, "ITEM_GROUP_GOLD", 1));
        must(fixtures::insert_foreign_assignment(store.conn(), 5010, 7, "ITEM_GROUP_GOLD", 0.25));
        store
    }

    fn apply(store: &SqliteDropStore, config: &DropConfig) {
        let catalog = must(store.load_catalog());
        let plan = plan_drops(&catalog, config);
        must(store.write_plan(&plan, &BatchLimits::default(), &mut NullProgress));
    }

    #[test]
    fn first_snapshot_wins_until_forced() {
        let mut store = seeded_store();

        let first = must(store.ensure_snapshot(false));
        assert_eq!(first.action, SnapshotAction::Created);
        assert_eq!(first.status.provenance, Some(SnapshotProvenance::Initial));
        assert_eq!(first.status.group_rows, 1);

        apply(&store, &DropConfig::default());

        let kept = must(store.ensure_snapshot(false));
        assert_eq!(kept.action, SnapshotAction::Kept);
        assert_eq!(kept.status.snapshot_id, first.status.snapshot_id);
        assert_eq!(kept.status.group_rows, 1);

        let refreshed = must(store.ensure_snapshot(true));
        assert_eq!(refreshed.action, SnapshotAction::Refreshed);
        assert_eq!(
            refreshed.status.provenance,
            Some(SnapshotProvenance::ManualRefresh)
        );
        assert!(refreshed.status.group_rows > 1);
        assert_ne!(refreshed.status.snapshot_id, first.status.snapshot_id);
    }

    #[test]
    fn snapshot_apply_restore_round_trips_exactly() {
        let mut store = seeded_store();
        let groups_before = must(fixtures::table_rows(store.conn(), GROUP_TABLE));
        let assignments_before = must(fixtures::table_rows(store.conn(), ASSIGNMENT_TABLE));

        must(store.ensure_snapshot(false));
        apply(
            &store,
            &DropConfig {
                strategy: Strategy::Legacy,
                level_distance: 30,
                ..DropConfig::default()
            },
        );
        assert_ne!(
            must(fixtures::table_rows(store.conn(), GROUP_TABLE)),
            groups_before
        );

        let mut updates: Vec<ProgressUpdate> = Vec::new();
        let report = must(store.restore(&mut updates));

        assert_eq!(report.group_rows_restored, 1);
        assert_eq!(report.assignment_rows_restored, 1);
        assert_eq!(must(fixtures::table_rows(store.conn(), GROUP_TABLE)), groups_before);
        assert_eq!(
            must(fixtures::table_rows(store.conn(), ASSIGNMENT_TABLE)),
            assignments_before
        );
        assert_eq!(updates.last().map(|u| u.percent), Some(100));
    }

    #[test]
    fn restore_without_snapshot_is_refused() {
        let store = seeded_store();

        let err = match store.restore(&mut NullProgress) {
            Ok(_) => panic!("expected restore to be refused"),
            Err(err) => err,
        };
        assert!(matches!(
            crate::sync_error(&err),
            Some(SyncError::EmptySnapshot { .. })
        ));
        assert_eq!(must(fixtures::table_rows(store.conn(), GROUP_TABLE)).len(), 1);
    }

    #[test]
    fn restore_from_half_empty_snapshot_is_refused() {
        let mut store = fixture_store();
        must(fixtures::seed_banded_world(store.conn()));
        must(fixtures::insert_foreign_group(store.conn(), 7, "ITEM_GROUP_GOLD", 1));
        must(store.ensure_snapshot(false));
        apply(&store, &DropConfig::default());
        let applied = must(fixtures::table_rows(store.conn(), GROUP_TABLE));

        let err = match store.restore(&mut NullProgress) {
            Ok(_) => panic!("expected restore to be refused"),
            Err(err) => err,
        };
        match crate::sync_error(&err) {
            Some(SyncError::EmptySnapshot {
                groups,
                assignments,
            }) => {
                assert_eq!(*groups, 1);
                assert_eq!(*assignments, 0);
            }
            other => panic!("expected empty snapshot, got {other:?}"),
        }
        assert_eq!(must(fixtures::table_rows(store.conn(), GROUP_TABLE)), applied);
    }

    #[test]
    fn shadow_tables_without_record_count_as_existing() {
        let mut store = seeded_store();
        if let Err(err) = store.conn().execute_batch(
            "CREATE TABLE _RefDropItemGroup_Backup AS SELECT * FROM _RefDropItemGroup;
             CREATE TABLE _RefMonster_AssignedItemRndDrop_Backup AS SELECT * FROM _RefMonster_AssignedItemRndDrop;",
        ) {
            panic!("test failure: {err}");
        }

        let report = must(store.ensure_snapshot(false));
        assert_eq!(report.action, SnapshotAction::Kept);
        assert!(report.status.exists);
        assert!(report.status.snapshot_id.is_none());
        assert!(report.status.is_restorable());
    }
}
