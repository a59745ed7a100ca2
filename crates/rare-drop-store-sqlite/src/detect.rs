use anyhow::{Context, Result};
use rare_drop_core::{
    DetectionEvidence, DetectionReport, GroupName, ObservedAssignment, DEFAULT_DETECTION_SAMPLE,
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::{classify_error, collect_rows, SqliteDropStore};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DetectOptions {
    /// Maximum number of groups inspected for the level distance.
    pub sample_size: usize,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            sample_size: DEFAULT_DETECTION_SAMPLE,
        }
    }
}

impl SqliteDropStore {
    /// Infers the last applied configuration from managed rows. Read-only.
    pub fn detect_configuration(&self, options: &DetectOptions) -> Result<DetectionReport> {
        let evidence = gather_evidence(self.conn(), options)
            .map_err(|err| classify_error(&err))
            .context("failed to inspect managed drop rows")?;
        let report = evidence.conclude();

        match &report {
            DetectionReport::NotDetected => info!("no managed drop configuration detected"),
            DetectionReport::Detected(detected) => {
                for note in &detected.notes {
                    warn!(note = note.as_str(), "detection ambiguity");
                }
                info!(
                    scheme = detected.scheme.as_str(),
                    confidence = detected.confidence.as_str(),
                    distance = detected.config.level_distance,
                    groups = detected.managed_groups,
                    "configuration detected"
                );
            }
        }
        Ok(report)
    }
}

fn gather_evidence(
    conn: &Connection,
    options: &DetectOptions,
) -> rusqlite::Result<DetectionEvidence> {
    let mut stmt = conn.prepare(
        r"SELECT ItemGroupCodeName128, DropRatio, COUNT(*)
          FROM _RefMonster_AssignedItemRndDrop
          WHERE ItemGroupCodeName128 LIKE ?1 ESCAPE '\'
          GROUP BY ItemGroupCodeName128, DropRatio
          ORDER BY ItemGroupCodeName128 ASC, DropRatio ASC",
    )?;
    let rows = stmt.query_map(params![GroupName::managed_like_pattern()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, f64>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;

    let mut evidence = DetectionEvidence::default();
    let mut unparsed = std::collections::BTreeSet::new();
    for (raw, probability, rows) in collect_rows(rows)? {
        match GroupName::parse(&raw) {
            Some(name) => evidence.assignments.push(ObservedAssignment {
                name,
                probability,
                rows: u64::try_from(rows).unwrap_or(0),
            }),
            None => {
                unparsed.insert(raw);
            }
        }
    }
    evidence.unparsed_names = unparsed.len();

    let Some(scheme) = evidence.dominant_scheme() else {
        return Ok(evidence);
    };
    let candidates: Vec<GroupName> = evidence
        .names()
        .into_iter()
        .filter(|name| name.scheme() == scheme)
        .collect();

    for name in sample_evenly(&candidates, options.sample_size) {
        let deviation = match name {
            GroupName::OwnerBucket { owner_id, .. } => owner_deviation(conn, name, *owner_id)?,
            GroupName::LegacyLevelBucket { level, .. } => legacy_deviation(conn, name, *level)?,
        };
        if let Some(value) = deviation {
            evidence.deviations.push(value);
        }
    }

    Ok(evidence)
}

/// Up to `limit` entries spread evenly across `values`.
fn sample_evenly<T>(values: &[T], limit: usize) -> Vec<&T> {
    if limit == 0 || values.is_empty() {
        return Vec::new();
    }
    let step = values.len().div_ceil(limit).max(1);
    values.iter().step_by(step).take(limit).collect()
}

/// Largest gap between the owner's level and any member item's level.
fn owner_deviation(
    conn: &Connection,
    name: &GroupName,
    owner_id: i64,
) -> rusqlite::Result<Option<u32>> {
    let owner_level: Option<i64> = conn
        .query_row(
            "SELECT ch.Lvl
             FROM _RefObjCommon c
             JOIN _RefObjChar ch ON c.Link = ch.ID
             WHERE c.ID = ?1",
            params![owner_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(owner_level) = owner_level else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT c.ReqLevel1
         FROM _RefDropItemGroup g
         JOIN _RefObjCommon c ON g.RefItemID = c.ID
         WHERE g.CodeName128 = ?1 AND c.ReqLevel1 IS NOT NULL",
    )?;
    let levels = stmt.query_map(params![name.to_string()], |row| row.get::<_, i64>(0))?;
    let deviation = collect_rows(levels)?
        .into_iter()
        .map(|level| level.abs_diff(owner_level))
        .max();
    Ok(deviation.and_then(|value| u32::try_from(value).ok()))
}

/// Largest gap between the bucket level and any assigned actor's level.
fn legacy_deviation(
    conn: &Connection,
    name: &GroupName,
    level: u32,
) -> rusqlite::Result<Option<u32>> {
    let bounds: (Option<i64>, Option<i64>) = conn.query_row(
        "SELECT MIN(ch.Lvl), MAX(ch.Lvl)
         FROM _RefMonster_AssignedItemRndDrop a
         JOIN _RefObjCommon c ON a.RefMonsterID = c.ID
         JOIN _RefObjChar ch ON c.Link = ch.ID
         WHERE a.ItemGroupCodeName128 = ?1",
        params![name.to_string()],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let (Some(min_level), Some(max_level)) = bounds else {
        return Ok(None);
    };
    let key = i64::from(level);
    let deviation = key.abs_diff(min_level).max(key.abs_diff(max_level));
    Ok(u32::try_from(deviation).ok())
}
