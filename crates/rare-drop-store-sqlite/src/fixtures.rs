//! Reference-schema seeding helpers for tests and local dry runs.

use anyhow::{Context, Result};
use rare_drop_core::Tier;
use rusqlite::types::Value;
use rusqlite::{params, Connection};

/// Actor property rows are keyed by `ID + ACTOR_LINK_OFFSET` so joins that
/// skip `_RefObjCommon.Link` would find nothing.
pub const ACTOR_LINK_OFFSET: i64 = 1_000_000;

const REFERENCE_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS _RefObjCommon (
  Service INTEGER NOT NULL,
  ID INTEGER PRIMARY KEY,
  CodeName128 TEXT NOT NULL,
  TypeID1 INTEGER NOT NULL,
  TypeID2 INTEGER NOT NULL,
  Country INTEGER NOT NULL,
  Link INTEGER NOT NULL,
  ReqLevel1 INTEGER
);

CREATE TABLE IF NOT EXISTS _RefObjChar (
  ID INTEGER PRIMARY KEY,
  Lvl INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS _RefDropItemGroup (
  Service INTEGER NOT NULL,
  RefItemGroupID INTEGER NOT NULL,
  CodeName128 TEXT NOT NULL,
  RefItemID INTEGER NOT NULL,
  SelectRatio REAL NOT NULL,
  RefMagicGroupID INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS _RefMonster_AssignedItemRndDrop (
  Service INTEGER NOT NULL,
  RefMonsterID INTEGER NOT NULL,
  RefItemGroupID INTEGER NOT NULL,
  ItemGroupCodeName128 TEXT NOT NULL,
  Overlap INTEGER NOT NULL,
  DropAmountMin INTEGER NOT NULL,
  DropAmountMax INTEGER NOT NULL,
  DropRatio REAL NOT NULL,
  param1 INTEGER NOT NULL,
  param2 INTEGER NOT NULL
);
";

pub fn create_reference_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(REFERENCE_SCHEMA)
        .context("failed to create reference schema")
}

/// Inserts an equippable item row (`TypeID1 = 3`).
pub fn insert_item(
    conn: &Connection,
    id: i64,
    codename: &str,
    required_level: i64,
    country: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO _RefObjCommon(Service, ID, CodeName128, TypeID1, TypeID2, Country, Link, ReqLevel1)
         VALUES (1, ?1, ?2, 3, 1, ?3, 0, ?4)",
        params![id, codename, country, required_level],
    )
    .with_context(|| format!("failed to seed item {codename}"))?;
    Ok(())
}

/// Inserts a tiered rare item with a generated codename.
pub fn insert_rare_item(
    conn: &Connection,
    id: i64,
    tier: Tier,
    required_level: i64,
    country: i64,
) -> Result<()> {
    let codename = format!("ITEM_{id}{}", tier.codename_marker());
    insert_item(conn, id, &codename, required_level, country)
}

/// Inserts a monster row and its linked level row.
pub fn insert_monster(conn: &Connection, id: i64, level: i64, country: i64) -> Result<()> {
    let link = id + ACTOR_LINK_OFFSET;
    conn.execute(
        "INSERT INTO _RefObjCommon(Service, ID, CodeName128, TypeID1, TypeID2, Country, Link, ReqLevel1)
         VALUES (1, ?1, ?2, 1, 2, ?3, ?4, NULL)",
        params![id, format!("MOB_TEST_{id}"), country, link],
    )
    .with_context(|| format!("failed to seed monster {id}"))?;
    conn.execute(
        "INSERT INTO _RefObjChar(ID, Lvl) VALUES (?1, ?2)",
        params![link, level],
    )
    .with_context(|| format!("failed to seed level for monster {id}"))?;
    Ok(())
}

/// Inserts a group row owned by another tool.
pub fn insert_foreign_group(
    conn: &Connection,
    group_id: i64,
    codename: &str,
    item_id: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO _RefDropItemGroup(Service, RefItemGroupID, CodeName128, RefItemID, SelectRatio, RefMagicGroupID)
         VALUES (1, ?1, ?2, ?3, 1.0, 0)",
        params![group_id, codename, item_id],
    )
    .with_context(|| format!("failed to seed foreign group {codename}"))?;
    Ok(())
}

/// Inserts an assignment row owned by another tool.
pub fn insert_foreign_assignment(
    conn: &Connection,
    monster_id: i64,
    group_id: i64,
    codename: &str,
    drop_ratio: f64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO _RefMonster_AssignedItemRndDrop(
            Service, RefMonsterID, RefItemGroupID, ItemGroupCodeName128, Overlap,
            DropAmountMin, DropAmountMax, DropRatio, param1, param2)
         VALUES (1, ?1, ?2, ?3, 0, 1, 1, ?4, 0, 0)",
        params![monster_id, group_id, codename, drop_ratio],
    )
    .with_context(|| format!("failed to seed foreign assignment {codename}"))?;
    Ok(())
}

/// Seeds rare items of every tier at each multiple of 10 in `0..=200` and
/// monsters at each multiple of 10 in `10..=190`, all in one region.
pub fn seed_banded_world(conn: &Connection) -> Result<()> {
    let mut next_id = 1;
    for tier in Tier::ALL {
        for level in (0..=200).step_by(10) {
            insert_rare_item(conn, next_id, tier, level, 0)?;
            next_id += 1;
        }
    }
    for level in (10..=190).step_by(10) {
        insert_monster(conn, 5_000 + level, level, 0)?;
    }
    Ok(())
}

/// All rows of `table`, in a canonical order for multiset comparison.
pub fn table_rows(conn: &Connection, table: &str) -> Result<Vec<Vec<Value>>> {
    let mut stmt = conn
        .prepare(&format!("SELECT * FROM {table}"))
        .with_context(|| format!("failed to read {table}"))?;
    let width = stmt.column_count();
    let rows = stmt.query_map([], |row| {
        (0..width)
            .map(|index| row.get::<_, Value>(index))
            .collect::<rusqlite::Result<Vec<Value>>>()
    })?;
    let mut values = crate::collect_rows(rows)?;
    values.sort_by_cached_key(|row| format!("{row:?}"));
    Ok(values)
}
