use anyhow::{anyhow, Context, Result};
use rare_drop_core::{Actor, Catalog, RareItem, Region, SyncError, Tier};
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::{collect_rows, invalid_column, is_connectivity_failure, SqliteDropStore};

const ITEM_QUERY: &str = r"
SELECT ID, CodeName128, ReqLevel1, Country
FROM _RefObjCommon
WHERE Service = 1
  AND TypeID1 = 3
  AND ReqLevel1 IS NOT NULL
  AND (CodeName128 LIKE ?1 ESCAPE '\'
       OR CodeName128 LIKE ?2 ESCAPE '\'
       OR CodeName128 LIKE ?3 ESCAPE '\')
ORDER BY ID ASC
";

const ACTOR_QUERY: &str = r"
SELECT c.ID, c.CodeName128, ch.Lvl, c.Country
FROM _RefObjCommon c
JOIN _RefObjChar ch ON c.Link = ch.ID
WHERE c.Service = 1
  AND c.TypeID1 = 1
  AND c.CodeName128 LIKE 'MOB\_%' ESCAPE '\'
ORDER BY c.ID ASC
";

impl SqliteDropStore {
    /// Reads every rare item and actor inside one read transaction.
    ///
    /// Any failure surfaces as [`SyncError::CatalogUnavailable`] (or
    /// [`SyncError::Connectivity`]); no partial catalog is returned.
    pub fn load_catalog(&self) -> Result<Catalog> {
        let tx = self
            .conn()
            .unchecked_transaction()
            .map_err(|err| catalog_error(&err))
            .context("failed to start catalog read")?;

        let items = read_items(&tx)
            .map_err(|err| catalog_error(&err))
            .context("failed to read rare items")?;
        let actors = read_actors(&tx)
            .map_err(|err| catalog_error(&err))
            .context("failed to read actors")?;

        tx.finish()
            .map_err(|err| catalog_error(&err))
            .context("failed to finish catalog read")?;

        let catalog = Catalog::new(items, actors);
        for tier in Tier::ALL {
            debug!(tier = tier.as_str(), items = catalog.items_of(tier).len(), "catalog tier loaded");
        }
        info!(
            items = catalog.item_count(),
            actors = catalog.actors.len(),
            "catalog loaded"
        );
        Ok(catalog)
    }
}

fn read_items(conn: &Connection) -> rusqlite::Result<Vec<RareItem>> {
    let patterns: Vec<String> = Tier::ALL
        .into_iter()
        .map(Tier::codename_like_pattern)
        .collect();
    let mut stmt = conn.prepare(ITEM_QUERY)?;
    let rows = stmt.query_map(params![patterns[0], patterns[1], patterns[2]], |row| {
        let id: i64 = row.get(0)?;
        let codename: String = row.get(1)?;
        let required_level = level_column(row.get(2)?, 2)?;
        let region = Region::from_country(row.get(3)?);
        Ok((id, codename, required_level, region))
    })?;

    let mut items = Vec::new();
    for (id, codename, required_level, region) in collect_rows(rows)? {
        let Some(tier) = Tier::from_codename(&codename) else {
            continue;
        };
        items.push(RareItem {
            id,
            codename,
            tier,
            required_level,
            region,
        });
    }
    Ok(items)
}

fn read_actors(conn: &Connection) -> rusqlite::Result<Vec<Actor>> {
    let mut stmt = conn.prepare(ACTOR_QUERY)?;
    let rows = stmt.query_map([], |row| {
        Ok(Actor {
            id: row.get(0)?,
            codename: row.get(1)?,
            level: level_column(row.get(2)?, 2)?,
            region: Region::from_country(row.get(3)?),
        })
    })?;
    collect_rows(rows)
}

fn level_column(raw: i64, index: usize) -> rusqlite::Result<u32> {
    u32::try_from(raw).map_err(|_| invalid_column(index, format!("invalid level value: {raw}")))
}

fn catalog_error(err: &rusqlite::Error) -> anyhow::Error {
    if is_connectivity_failure(err) {
        anyhow!(SyncError::Connectivity(err.to_string()))
    } else {
        anyhow!(SyncError::CatalogUnavailable(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
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

    #[test]
    fn recognition_rules_filter_at_the_store() {
        let store = fixture_store();
        let conn = store.conn();
        must(fixtures::insert_item(conn, 1, "ITEM_CH_SWORD_A_RARE", 30, 0));
        must(fixtures::insert_item(conn, 2, "ITEM_EU_AXE_C_RARE", 40, 1));
        must(fixtures::insert_item(conn, 3, "ITEM_CH_SWORD", 30, 0));
        must(fixtures::insert_item(conn, 4, "ITEM_NOLEVEL_B_RARE", 0, 0));
        if let Err(err) = conn.execute(
            "UPDATE _RefObjCommon SET ReqLevel1 = NULL WHERE ID = 4",
            [],
        ) {
            panic!("test failure: {err}");
        }
        if let Err(err) = conn.execute(
            "UPDATE _RefObjCommon SET Service = 0 WHERE ID = 2",
            [],
        ) {
            panic!("test failure: {err}");
        }
        must(fixtures::insert_monster(conn, 10, 33, 1));
        must(fixtures::insert_item(conn, 11, "NPC_VENDOR", 0, 0));

        let catalog = must(store.load_catalog());

        assert_eq!(catalog.item_count(), 1);
        assert_eq!(catalog.items_of(Tier::Star)[0].id, 1);
        assert_eq!(catalog.actors.len(), 1);
        assert_eq!(catalog.actors[0].level, 33);
        assert_eq!(catalog.actors[0].region, Region::Europe);
    }

    #[test]
    fn wide_country_values_load_as_numbered_regions() {
        let store = fixture_store();
        let conn = store.conn();
        must(fixtures::insert_item(conn, 1, "ITEM_XX_BOW_B_RARE", 20, 300));
        must(fixtures::insert_monster(conn, 10, 20, -2));

        let catalog = must(store.load_catalog());

        assert_eq!(catalog.items_of(Tier::Moon)[0].region, Region::Other(300));
        assert_eq!(catalog.actors[0].region, Region::Other(-2));
    }

    #[test]
    fn missing_table_is_catalog_unavailable() {
        let store = fixture_store();
        if let Err(err) = store.conn().execute_batch("DROP TABLE _RefObjChar;") {
            panic!("test failure: {err}");
        }

        let err = match store.load_catalog() {
            Ok(_) => panic!("expected catalog read to fail"),
            Err(err) => err,
        };
        assert!(matches!(
            crate::sync_error(&err),
            Some(SyncError::CatalogUnavailable(_))
        ));
    }
}
