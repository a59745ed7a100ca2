//! Batch Writer: delete managed rows, then insert the plan chunk by chunk.
//!
//! The sequence is not wrapped in a transaction. Each statement commits on
//! its own, so a failure after the first commit leaves the drop tables in a
//! mixed state that only a restore can repair.

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use rare_drop_core::{
    chunk_ranges, estimate_remaining, rows_per_batch, scaled_percent, BatchLimits, GroupName,
    Plan, ProgressSink, ProgressUpdate, SyncError, WritePhase,
};
use rusqlite::limits::Limit;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{classify_error, SqliteDropStore, ASSIGNMENT_COLUMNS, GROUP_COLUMNS};

const WRITE_PERCENT_START: u8 = 10;
const WRITE_PERCENT_END: u8 = 100;

/// A row type the writer can bind as a flat list of parameters.
pub trait InsertRow {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];

    fn push_values(&self, out: &mut Vec<Value>);
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupRow {
    pub group_id: i64,
    pub name: String,
    pub item_id: i64,
    pub select_ratio: f64,
}

impl InsertRow for GroupRow {
    const TABLE: &'static str = crate::GROUP_TABLE;
    const COLUMNS: &'static [&'static str] = GROUP_COLUMNS;

    fn push_values(&self, out: &mut Vec<Value>) {
        out.extend([
            Value::Integer(1),
            Value::Integer(self.group_id),
            Value::Text(self.name.clone()),
            Value::Integer(self.item_id),
            Value::Real(self.select_ratio),
            Value::Integer(0),
        ]);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentRow {
    pub monster_id: i64,
    pub group_id: i64,
    pub name: String,
    pub drop_ratio: f64,
}

impl InsertRow for AssignmentRow {
    const TABLE: &'static str = crate::ASSIGNMENT_TABLE;
    const COLUMNS: &'static [&'static str] = ASSIGNMENT_COLUMNS;

    fn push_values(&self, out: &mut Vec<Value>) {
        out.extend([
            Value::Integer(1),
            Value::Integer(self.monster_id),
            Value::Integer(self.group_id),
            Value::Text(self.name.clone()),
            Value::Integer(0),
            Value::Integer(1),
            Value::Integer(1),
            Value::Real(self.drop_ratio),
            Value::Integer(0),
            Value::Integer(0),
        ]);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct WriteReport {
    pub groups_deleted: u64,
    pub assignments_deleted: u64,
    pub group_rows_written: u64,
    pub assignment_rows_written: u64,
    pub group_chunks: usize,
    pub assignment_chunks: usize,
    pub rows_per_group_statement: usize,
    pub rows_per_assignment_statement: usize,
    /// Largest number of bound parameters carried by one statement.
    pub max_parameters_per_statement: usize,
    pub first_group_id: Option<i64>,
}

/// Progress and failure accounting for one write sequence.
struct WriteCursor<'a> {
    sink: &'a mut dyn ProgressSink,
    started: Instant,
    rows_written: u64,
    rows_total: u64,
    statements_committed: u64,
}

impl WriteCursor<'_> {
    fn emit(&mut self, message: String) {
        let percent = scaled_percent(
            WRITE_PERCENT_START,
            WRITE_PERCENT_END,
            self.rows_written,
            self.rows_total,
        );
        self.sink.on_progress(&ProgressUpdate {
            percent,
            message,
            rows_written: self.rows_written,
            rows_total: self.rows_total,
            eta: estimate_remaining(self.started.elapsed(), self.rows_written, self.rows_total),
        });
    }

    /// Converts a statement failure into the error callers see.
    fn fail(
        &self,
        phase: WritePhase,
        chunk_index: usize,
        chunks_total: usize,
        err: &rusqlite::Error,
    ) -> anyhow::Error {
        if self.statements_committed == 0 {
            return classify_error(err).context(format!("{phase} failed before any change"));
        }
        warn!(
            phase = phase.as_str(),
            chunk_index,
            chunks_total,
            rows_committed = self.rows_written,
            "write sequence failed mid-way; tables are in a mixed state"
        );
        anyhow!(SyncError::PartialBatch {
            phase,
            chunk_index,
            chunks_total,
            rows_committed: self.rows_written,
            message: err.to_string(),
        })
    }
}

impl SqliteDropStore {
    /// Rows per group and per assignment statement under `limits`.
    ///
    /// Fails with [`SyncError::Validation`] when one row does not fit, or when
    /// the usable parameters exceed what this connection accepts per statement.
    pub fn batch_sizes(&self, limits: &BatchLimits) -> Result<(usize, usize)> {
        let store_limit = usize::try_from(self.conn().limit(Limit::SQLITE_LIMIT_VARIABLE_NUMBER))
            .unwrap_or(0);
        if limits.usable_parameters() > store_limit {
            return Err(anyhow!(SyncError::Validation(format!(
                "parameter ceiling {} (margin {}) exceeds the store limit of \
                 {store_limit} bound parameters per statement",
                limits.parameter_ceiling, limits.safety_margin
            ))));
        }
        let group_batch = rows_per_batch(GroupRow::COLUMNS.len(), limits)
            .map_err(|err| anyhow!(SyncError::from(err)))?;
        let assignment_batch = rows_per_batch(AssignmentRow::COLUMNS.len(), limits)
            .map_err(|err| anyhow!(SyncError::from(err)))?;
        Ok((group_batch, assignment_batch))
    }

    /// Replaces every managed row with the rows of `plan`.
    pub fn write_plan(
        &self,
        plan: &Plan,
        limits: &BatchLimits,
        sink: &mut dyn ProgressSink,
    ) -> Result<WriteReport> {
        let (group_batch, assignment_batch) = self.batch_sizes(limits)?;

        let member_rows = plan.member_row_count();
        let mut cursor = WriteCursor {
            sink,
            started: Instant::now(),
            rows_written: 0,
            rows_total: to_u64(member_rows + plan.assignments.len()),
            statements_committed: 0,
        };
        let mut report = WriteReport {
            rows_per_group_statement: group_batch,
            rows_per_assignment_statement: assignment_batch,
            ..WriteReport::default()
        };

        let pattern = GroupName::managed_like_pattern();
        report.assignments_deleted = delete_managed(
            self.conn(),
            &mut cursor,
            WritePhase::DeleteAssignments,
            &format!(
                "DELETE FROM {} WHERE ItemGroupCodeName128 LIKE ?1 ESCAPE '\\'",
                crate::ASSIGNMENT_TABLE
            ),
            &pattern,
        )?;
        report.groups_deleted = delete_managed(
            self.conn(),
            &mut cursor,
            WritePhase::DeleteGroups,
            &format!(
                "DELETE FROM {} WHERE CodeName128 LIKE ?1 ESCAPE '\\'",
                crate::GROUP_TABLE
            ),
            &pattern,
        )?;
        info!(
            groups = report.groups_deleted,
            assignments = report.assignments_deleted,
            "managed rows deleted"
        );
        cursor.emit(format!(
            "deleted {} group rows and {} assignment rows",
            report.groups_deleted, report.assignments_deleted
        ));

        let base_id = next_group_id(self.conn())
            .map_err(|err| cursor.fail(WritePhase::InsertGroups, 0, 0, &err))?;
        let (group_rows, assignment_rows) = expand_plan(plan, base_id);
        if !plan.groups.is_empty() {
            report.first_group_id = Some(base_id);
        }

        let (chunks, widest) = insert_rows(
            self.conn(),
            &mut cursor,
            WritePhase::InsertGroups,
            &group_rows,
            group_batch,
        )?;
        report.group_chunks = chunks;
        report.group_rows_written = to_u64(group_rows.len());
        report.max_parameters_per_statement = widest;

        let (chunks, widest) = insert_rows(
            self.conn(),
            &mut cursor,
            WritePhase::InsertAssignments,
            &assignment_rows,
            assignment_batch,
        )?;
        report.assignment_chunks = chunks;
        report.assignment_rows_written = to_u64(assignment_rows.len());
        report.max_parameters_per_statement = report.max_parameters_per_statement.max(widest);

        info!(
            group_rows = report.group_rows_written,
            assignment_rows = report.assignment_rows_written,
            group_chunks = report.group_chunks,
            assignment_chunks = report.assignment_chunks,
            "plan written"
        );
        cursor.emit("write complete".to_string());
        Ok(report)
    }
}

/// Flattens a plan into table rows, numbering groups from `base_id`.
#[must_use]
pub fn expand_plan(plan: &Plan, base_id: i64) -> (Vec<GroupRow>, Vec<AssignmentRow>) {
    let mut ids = std::collections::HashMap::new();
    let mut group_rows = Vec::with_capacity(plan.member_row_count());
    let mut next_id = base_id;

    for group in &plan.groups {
        let name = group.name.to_string();
        ids.insert(group.name, next_id);
        for item_id in &group.member_item_ids {
            group_rows.push(GroupRow {
                group_id: next_id,
                name: name.clone(),
                item_id: *item_id,
                select_ratio: group.member_select_weight,
            });
        }
        next_id += 1;
    }

    let assignment_rows = plan
        .assignments
        .iter()
        .filter_map(|assignment| {
            ids.get(&assignment.group).map(|group_id| AssignmentRow {
                monster_id: assignment.actor_id,
                group_id: *group_id,
                name: assignment.group.to_string(),
                drop_ratio: assignment.drop_probability,
            })
        })
        .collect();

    (group_rows, assignment_rows)
}

fn delete_managed(
    conn: &Connection,
    cursor: &mut WriteCursor<'_>,
    phase: WritePhase,
    sql: &str,
    pattern: &str,
) -> Result<u64> {
    let deleted = conn
        .execute(sql, params![pattern])
        .map_err(|err| cursor.fail(phase, 1, 1, &err))?;
    cursor.statements_committed += 1;
    Ok(to_u64(deleted))
}

fn next_group_id(conn: &Connection) -> rusqlite::Result<i64> {
    let current: i64 = conn.query_row(
        &format!(
            "SELECT COALESCE(MAX(RefItemGroupID), 0) FROM {}",
            crate::GROUP_TABLE
        ),
        [],
        |row| row.get(0),
    )?;
    Ok(current + 1)
}

fn insert_rows<R: InsertRow>(
    conn: &Connection,
    cursor: &mut WriteCursor<'_>,
    phase: WritePhase,
    rows: &[R],
    batch: usize,
) -> Result<(usize, usize)> {
    let ranges = chunk_ranges(rows.len(), batch);
    let chunks_total = ranges.len();
    let mut widest = 0;
    let mut values = Vec::with_capacity(batch * R::COLUMNS.len());

    for (index, range) in ranges.into_iter().enumerate() {
        let chunk = &rows[range];
        values.clear();
        for row in chunk {
            row.push_values(&mut values);
        }
        widest = widest.max(values.len());

        let sql = insert_statement(R::TABLE, R::COLUMNS, chunk.len());
        conn.execute(&sql, params_from_iter(values.iter()))
            .map_err(|err| cursor.fail(phase, index + 1, chunks_total, &err))
            .with_context(|| format!("failed to insert chunk {} into {}", index + 1, R::TABLE))?;

        cursor.statements_committed += 1;
        cursor.rows_written += to_u64(chunk.len());
        debug!(
            table = R::TABLE,
            chunk = index + 1,
            chunks_total,
            rows = chunk.len(),
            parameters = values.len(),
            "chunk inserted"
        );
        cursor.emit(format!(
            "{}: chunk {}/{} ({} rows)",
            phase,
            index + 1,
            chunks_total,
            chunk.len()
        ));
    }

    Ok((chunks_total, widest))
}

/// Multi-row `INSERT` with one placeholder group per row.
#[must_use]
pub fn insert_statement(table: &str, columns: &[&str], rows: usize) -> String {
    let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
    format!(
        "INSERT INTO {table} ({}) VALUES {}",
        columns.join(", "),
        vec![placeholders.as_str(); rows].join(", ")
    )
}

fn to_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
