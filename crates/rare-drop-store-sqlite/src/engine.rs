//! Operation engine: runs one apply, snapshot or restore off the caller's
//! thread and reports through a progress/completion channel only.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use rare_drop_core::{
    plan_drops, BatchLimits, DropConfig, PlanSummary, ProgressSink, ProgressUpdate, SyncError,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{RestoreReport, SnapshotReport, SqliteDropStore, WriteReport};

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Snapshot if missing, then plan and write.
    Apply {
        config: DropConfig,
        limits: BatchLimits,
    },
    EnsureSnapshot {
        force: bool,
    },
    Restore,
}

impl Operation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apply { .. } => "apply",
            Self::EnsureSnapshot { .. } => "ensure_snapshot",
            Self::Restore => "restore",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplyReport {
    pub snapshot: SnapshotReport,
    pub plan: PlanSummary,
    pub write: WriteReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum OperationReport {
    Applied(ApplyReport),
    Snapshot(SnapshotReport),
    Restored(RestoreReport),
}

#[derive(Debug)]
pub enum JobEvent {
    Progress(ProgressUpdate),
    /// Always the last event of a job.
    Finished(Result<OperationReport>),
}

pub struct JobHandle {
    events: Receiver<JobEvent>,
    worker: JoinHandle<()>,
}

impl JobHandle {
    #[must_use]
    pub fn events(&self) -> &Receiver<JobEvent> {
        &self.events
    }

    /// Drains events until the job finishes, forwarding progress.
    pub fn wait(self, mut on_progress: impl FnMut(&ProgressUpdate)) -> Result<OperationReport> {
        let mut outcome = None;
        while let Ok(event) = self.events.recv() {
            match event {
                JobEvent::Progress(update) => on_progress(&update),
                JobEvent::Finished(result) => {
                    outcome = Some(result);
                    break;
                }
            }
        }

        if self.worker.join().is_err() {
            return Err(anyhow!("operation worker panicked"));
        }
        outcome.unwrap_or_else(|| Err(anyhow!("operation worker exited without a result")))
    }
}

struct ChannelSink {
    sender: Sender<JobEvent>,
}

impl ProgressSink for ChannelSink {
    fn on_progress(&mut self, update: &ProgressUpdate) {
        // A dropped receiver only means nobody is watching.
        let _ = self.sender.send(JobEvent::Progress(update.clone()));
    }
}

/// Starts `operation` on a dedicated thread with its own connection.
pub fn spawn(db_path: PathBuf, operation: Operation) -> Result<JobHandle> {
    let (sender, events) = mpsc::channel();
    let worker = thread::Builder::new()
        .name(format!("rare-drop-{}", operation.as_str()))
        .spawn(move || {
            let mut sink = ChannelSink {
                sender: sender.clone(),
            };
            let result = SqliteDropStore::open(&db_path).and_then(|mut store| {
                store.migrate()?;
                run_operation(&mut store, &operation, &mut sink)
            });
            let _ = sender.send(JobEvent::Finished(result));
        })
        .context("failed to start operation worker")?;

    Ok(JobHandle { events, worker })
}

/// Runs `operation` to completion on the current thread.
pub fn run_operation(
    store: &mut SqliteDropStore,
    operation: &Operation,
    sink: &mut dyn ProgressSink,
) -> Result<OperationReport> {
    info!(operation = operation.as_str(), "operation started");
    let report = match operation {
        Operation::Apply { config, limits } => {
            config
                .validate()
                .map_err(|err| anyhow!(SyncError::from(err)))?;
            store.batch_sizes(limits)?;

            sink.on_progress(&ProgressUpdate::message(0, "ensuring snapshot"));
            let snapshot = store.ensure_snapshot(false)?;

            sink.on_progress(&ProgressUpdate::message(4, "reading catalog"));
            let catalog = store.load_catalog()?;

            sink.on_progress(&ProgressUpdate::message(8, "planning drop groups"));
            let plan = plan_drops(&catalog, config);
            let summary = plan.summary();
            info!(
                groups = summary.groups,
                member_rows = summary.member_rows,
                assignments = summary.assignments,
                "plan computed"
            );

            let write = store.write_plan(&plan, limits, sink)?;
            OperationReport::Applied(ApplyReport {
                snapshot,
                plan: summary,
                write,
            })
        }
        Operation::EnsureSnapshot { force } => {
            sink.on_progress(&ProgressUpdate::message(0, "capturing snapshot"));
            let snapshot = store.ensure_snapshot(*force)?;
            sink.on_progress(&ProgressUpdate::message(100, "snapshot ready"));
            OperationReport::Snapshot(snapshot)
        }
        Operation::Restore => OperationReport::Restored(store.restore(sink)?),
    };
    info!(operation = operation.as_str(), "operation finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rare_drop_core::{DegradationRule, NullProgress, Tier};
    use rusqlite::Connection;
    use ulid::Ulid;

    use super::*;
    use crate::{fixtures, SnapshotAction, ASSIGNMENT_TABLE, GROUP_TABLE};

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn temp_db() -> PathBuf {
        let path = std::env::temp_dir().join(format!("rare-drop-engine-{}.sqlite3", Ulid::new()));
        let conn = match Connection::open(&path) {
            Ok(conn) => conn,
            Err(err) => panic!("test failure: {err}"),
        };
        must(fixtures::create_reference_schema(&conn));
        path
    }

    #[test]
    fn apply_job_snapshots_then_writes_and_reports_progress() {
        let path = temp_db();
        {
            let conn = match Connection::open(&path) {
                Ok(conn) => conn,
                Err(err) => panic!("test failure: {err}"),
            };
            must(fixtures::insert_rare_item(&conn, 1, Tier::Star, 100, 0));
            for level in 80..=110 {
                must(fixtures::insert_monster(&conn, 1_000 + level, level, 0));
            }
            must(fixtures::insert_foreign_group(&conn, 3, "ITEM_GROUP_GOLD", 1));
            must(fixtures::insert_foreign_assignment(&conn, 1_080, 3, "ITEM_GROUP_GOLD", 0.5));
        }

        let handle = must(spawn(
            path.clone(),
            Operation::Apply {
                config: DropConfig {
                    enabled_tiers: BTreeSet::from([Tier::Star]),
                    ..DropConfig::default()
                },
                limits: BatchLimits::default(),
            },
        ));
        let mut seen = Vec::new();
        let report = must(handle.wait(|update| seen.push(update.clone())));

        let OperationReport::Applied(applied) = report else {
            panic!("expected an apply report");
        };
        assert_eq!(applied.snapshot.action, SnapshotAction::Created);
        assert_eq!(applied.plan.assignments, 21);
        assert_eq!(applied.write.assignment_rows_written, 21);
        assert!(seen.iter().any(|update| update.message == "reading catalog"));
        assert_eq!(seen.last().map(|update| update.percent), Some(100));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn restore_job_brings_back_pristine_tables() {
        let path = temp_db();
        {
            let conn = match Connection::open(&path) {
                Ok(conn) => conn,
                Err(err) => panic!("test failure: {err}"),
            };
            must(fixtures::seed_banded_world(&conn));
            must(fixtures::insert_foreign_group(&conn, 3, "ITEM_GROUP_GOLD", 1));
            must(fixtures::insert_foreign_assignment(&conn, 5_010, 3, "ITEM_GROUP_GOLD", 0.5));
        }
        let pristine = {
            let conn = match Connection::open(&path) {
                Ok(conn) => conn,
                Err(err) => panic!("test failure: {err}"),
            };
            (
                must(fixtures::table_rows(&conn, GROUP_TABLE)),
                must(fixtures::table_rows(&conn, ASSIGNMENT_TABLE)),
            )
        };

        let apply = Operation::Apply {
            config: DropConfig {
                degradation: Some(DegradationRule {
                    threshold_level: 50,
                    factor: 0.9,
                }),
                ..DropConfig::default()
            },
            limits: BatchLimits::default(),
        };
        must(must(spawn(path.clone(), apply)).wait(|_| {}));
        let restored = must(must(spawn(path.clone(), Operation::Restore)).wait(|_| {}));
        assert!(matches!(restored, OperationReport::Restored(_)));

        let conn = match Connection::open(&path) {
            Ok(conn) => conn,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(must(fixtures::table_rows(&conn, GROUP_TABLE)), pristine.0);
        assert_eq!(must(fixtures::table_rows(&conn, ASSIGNMENT_TABLE)), pristine.1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn invalid_configuration_is_refused_before_any_change() {
        let conn = match Connection::open_in_memory() {
            Ok(conn) => conn,
            Err(err) => panic!("test failure: {err}"),
        };
        must(fixtures::create_reference_schema(&conn));
        let mut store = must(SqliteDropStore::from_connection(conn));
        must(store.migrate());

        let mut config = DropConfig::default();
        config.probability_per_tier.insert(Tier::Star, 0.0);
        let err = match run_operation(
            &mut store,
            &Operation::Apply {
                config,
                limits: BatchLimits::default(),
            },
            &mut NullProgress,
        ) {
            Ok(_) => panic!("expected validation failure"),
            Err(err) => err,
        };

        assert!(matches!(
            crate::sync_error(&err),
            Some(SyncError::Validation(_))
        ));
        assert!(!must(store.snapshot_status()).exists);
    }

    #[test]
    fn unusable_ceiling_is_refused_before_the_snapshot() {
        let conn = match Connection::open_in_memory() {
            Ok(conn) => conn,
            Err(err) => panic!("test failure: {err}"),
        };
        must(fixtures::create_reference_schema(&conn));
        let mut store = must(SqliteDropStore::from_connection(conn));
        must(store.migrate());

        for ceiling in [8, 1_000_000] {
            let err = match run_operation(
                &mut store,
                &Operation::Apply {
                    config: DropConfig::default(),
                    limits: BatchLimits {
                        parameter_ceiling: ceiling,
                        safety_margin: 0,
                    },
                },
                &mut NullProgress,
            ) {
                Ok(_) => panic!("expected ceiling {ceiling} to be refused"),
                Err(err) => err,
            };
            assert!(matches!(
                crate::sync_error(&err),
                Some(SyncError::Validation(_))
            ));
        }
        assert!(!must(store.snapshot_status()).exists);
        assert!(!must(crate::table_exists(store.conn(), crate::GROUP_BACKUP_TABLE)));
    }

    #[test]
    fn missing_database_finishes_with_connectivity_failure() {
        let path = std::env::temp_dir()
            .join(format!("rare-drop-absent-{}", Ulid::new()))
            .join("db.sqlite3");
        let handle = must(spawn(path, Operation::Restore));

        let err = match handle.wait(|_| {}) {
            Ok(_) => panic!("expected failure"),
            Err(err) => err,
        };
        assert!(matches!(
            crate::sync_error(&err),
            Some(SyncError::Connectivity(_))
        ));
    }
}
