/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Metadata for generated reports (§4.9). CRUD only — no algorithmic
//! content; report generation itself is out of scope.

use rusqlite::{params, OptionalExtension};

use crate::clock::now_unix;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::ReportRecord;

fn row_to_report(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReportRecord> {
    Ok(ReportRecord {
        id: row.get("id")?,
        site_id: row.get("site_id")?,
        kind: row.get("kind")?,
        period_start_unix: row.get("period_start_unix")?,
        period_end_unix: row.get("period_end_unix")?,
        file_path: row.get("file_path")?,
        created_at: row.get("created_at")?,
    })
}

const SELECT_COLUMNS: &str = "id, site_id, kind, period_start_unix, period_end_unix, file_path, created_at";

pub struct ReportCatalog<'a> {
    store: &'a Store,
}

impl<'a> ReportCatalog<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn create(&self, site_id: Option<i64>, kind: &str, period_start_unix: f64, period_end_unix: f64, file_path: &str) -> Result<i64> {
        if period_end_unix <= period_start_unix {
            return Err(Error::bad_input("ReportCatalog::create: period_end_unix must be greater than period_start_unix"));
        }
        let created_at = now_unix();
        self.store.write(|conn, _scope| {
            conn.execute(
                "INSERT INTO reports (site_id, kind, period_start_unix, period_end_unix, file_path, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![site_id, kind, period_start_unix, period_end_unix, file_path, created_at],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get(&self, id: i64) -> Result<ReportRecord> {
        self.store
            .read(|conn| {
                conn.query_row(&format!("SELECT {SELECT_COLUMNS} FROM reports WHERE id = ?"), [id], row_to_report)
                    .optional()
                    .map_err(Into::into)
            })?
            .ok_or(Error::NotFound)
    }

    /// All reports, optionally filtered by site, newest first.
    pub fn list(&self, site_id: Option<i64>) -> Result<Vec<ReportRecord>> {
        self.store.read(|conn| {
            let mut stmt = if site_id.is_some() {
                conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM reports WHERE site_id = ? ORDER BY created_at DESC"))?
            } else {
                conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM reports ORDER BY created_at DESC"))?
            };
            let rows = if let Some(site_id) = site_id {
                stmt.query_map([site_id], row_to_report)?.collect::<rusqlite::Result<Vec<_>>>()
            } else {
                stmt.query_map([], row_to_report)?.collect::<rusqlite::Result<Vec<_>>>()
            };
            Ok(rows?)
        })
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        self.store.write(|conn, _scope| {
            let changed = conn.execute("DELETE FROM reports WHERE id = ?", [id])?;
            if changed == 0 {
                return Err(Error::NotFound);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VelocityConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_store() -> Store {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        Store::open(VelocityConfig::new(format!("file:report_catalog_test_{n}?mode=memory&cache=shared"))).unwrap()
    }

    #[test]
    fn create_then_get_round_trips() {
        let store = test_store();
        let catalog = ReportCatalog::new(&store);
        let id = catalog.create(Some(1), "daily-speed", 0.0, 86400.0, "/reports/1.pdf").unwrap();
        let fetched = catalog.get(id).unwrap();
        assert_eq!(fetched.kind, "daily-speed");
        assert_eq!(fetched.file_path, "/reports/1.pdf");
    }

    #[test]
    fn create_rejects_inverted_period() {
        let store = test_store();
        let catalog = ReportCatalog::new(&store);
        let err = catalog.create(Some(1), "daily-speed", 100.0, 0.0, "/reports/x.pdf").unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[test]
    fn list_filters_by_site_and_orders_newest_first() {
        let store = test_store();
        let catalog = ReportCatalog::new(&store);
        catalog.create(Some(1), "a", 0.0, 10.0, "/a").unwrap();
        catalog.create(Some(2), "b", 0.0, 10.0, "/b").unwrap();
        catalog.create(Some(1), "c", 0.0, 10.0, "/c").unwrap();
        let site1 = catalog.list(Some(1)).unwrap();
        assert_eq!(site1.len(), 2);
        assert_eq!(site1[0].kind, "c");
        let all = catalog.list(None).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn delete_missing_report_is_not_found() {
        let store = test_store();
        let catalog = ReportCatalog::new(&store);
        let err = catalog.delete(12345).unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }
}
