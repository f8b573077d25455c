/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Non-overlapping, time-bounded site configuration periods (§4.3).

use rusqlite::{params, OptionalExtension, Transaction};

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::SiteConfigPeriod;

fn validate(site_id: i64, start: f64, end: Option<f64>, cosine_error_angle: f64) -> Result<()> {
    if site_id == 0 {
        return Err(Error::bad_input("site_id must not be 0"));
    }
    if start < 0.0 {
        return Err(Error::bad_input("effective_start_unix must be >= 0"));
    }
    if let Some(end) = end {
        if end <= start {
            return Err(Error::bad_input("effective_end_unix must be > effective_start_unix"));
        }
    }
    if !cosine_error_angle.is_finite() || !(0.0..=80.0).contains(&cosine_error_angle) {
        return Err(Error::bad_input("cosine_error_angle must be a finite number in [0, 80]"));
    }
    Ok(())
}

/// Rejects a candidate `[start, end)` period on `site_id` if it overlaps
/// any existing period on that site (§4.3 "Overlap check"). `exclude_id`
/// is the row being updated, if any.
fn check_overlap(
    tx: &Transaction<'_>,
    site_id: i64,
    start: f64,
    end: Option<f64>,
    exclude_id: Option<i64>,
) -> Result<()> {
    // NULL end is +infinity: an existing period overlaps the candidate
    // [start, end) when `existing.start < candidate.end AND
    // (existing.end IS NULL OR existing.end > candidate.start)`.
    let conflicting: i64 = tx.query_row(
        "SELECT COUNT(*) FROM site_config_periods \
         WHERE site_id = ?1 \
           AND (?4 IS NULL OR id != ?4) \
           AND effective_start_unix < COALESCE(?3, 1e18) \
           AND (effective_end_unix IS NULL OR effective_end_unix > ?2)",
        params![site_id, start, end, exclude_id],
        |row| row.get(0),
    )?;
    if conflicting > 0 {
        return Err(Error::Overlap);
    }
    Ok(())
}

fn row_to_period(row: &rusqlite::Row<'_>) -> rusqlite::Result<SiteConfigPeriod> {
    Ok(SiteConfigPeriod {
        id: row.get("id")?,
        site_id: row.get("site_id")?,
        site_variable_config_id: row.get("site_variable_config_id")?,
        effective_start_unix: row.get("effective_start_unix")?,
        effective_end_unix: row.get("effective_end_unix")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        notes: row.get("notes")?,
        cosine_error_angle: row.get("cosine_error_angle")?,
    })
}

const SELECT_COLUMNS: &str = "id, site_id, site_variable_config_id, effective_start_unix, \
     effective_end_unix, is_active, notes, cosine_error_angle";

/// CRUD and lookup for `SiteConfigPeriod`, always operating through a
/// `Store` so every write happens inside one transaction.
pub struct SiteConfigTimeline<'a> {
    store: &'a Store,
}

impl<'a> SiteConfigTimeline<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn create(&self, period: &SiteConfigPeriod) -> Result<i64> {
        validate(
            period.site_id,
            period.effective_start_unix,
            period.effective_end_unix,
            period.cosine_error_angle,
        )?;
        self.store.write_tx(|tx, _scope| {
            check_overlap(tx, period.site_id, period.effective_start_unix, period.effective_end_unix, None)?;
            if period.is_active {
                deactivate_others(tx, period.site_id, None)?;
            }
            tx.execute(
                "INSERT INTO site_config_periods \
                 (site_id, site_variable_config_id, effective_start_unix, effective_end_unix, \
                  is_active, notes, cosine_error_angle) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    period.site_id,
                    period.site_variable_config_id,
                    period.effective_start_unix,
                    period.effective_end_unix,
                    period.is_active as i64,
                    period.notes,
                    period.cosine_error_angle,
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    pub fn update(&self, period: &SiteConfigPeriod) -> Result<()> {
        validate(
            period.site_id,
            period.effective_start_unix,
            period.effective_end_unix,
            period.cosine_error_angle,
        )?;
        self.store.write_tx(|tx, _scope| {
            check_overlap(
                tx,
                period.site_id,
                period.effective_start_unix,
                period.effective_end_unix,
                Some(period.id),
            )?;
            if period.is_active {
                deactivate_others(tx, period.site_id, Some(period.id))?;
            }
            let changed = tx.execute(
                "UPDATE site_config_periods SET \
                 site_variable_config_id = ?2, effective_start_unix = ?3, effective_end_unix = ?4, \
                 is_active = ?5, notes = ?6, cosine_error_angle = ?7 \
                 WHERE id = ?1",
                params![
                    period.id,
                    period.site_variable_config_id,
                    period.effective_start_unix,
                    period.effective_end_unix,
                    period.is_active as i64,
                    period.notes,
                    period.cosine_error_angle,
                ],
            )?;
            if changed == 0 {
                return Err(Error::NotFound);
            }
            Ok(())
        })
    }

    /// Sets `effective_end_unix` and clears `is_active`, but only if the
    /// period was previously open-ended (§4.3).
    pub fn close(&self, period_id: i64, end_time: f64) -> Result<()> {
        self.store.write_tx(|tx, _scope| {
            let changed = tx.execute(
                "UPDATE site_config_periods SET effective_end_unix = ?2, is_active = 0 \
                 WHERE id = ?1 AND effective_end_unix IS NULL",
                params![period_id, end_time],
            )?;
            if changed == 0 {
                return Err(Error::NotFound);
            }
            Ok(())
        })
    }

    pub fn get(&self, period_id: i64) -> Result<SiteConfigPeriod> {
        self.store
            .read(|conn| {
                conn.query_row(
                    &format!("SELECT {SELECT_COLUMNS} FROM site_config_periods WHERE id = ?"),
                    [period_id],
                    row_to_period,
                )
                .optional()
                .map_err(Into::into)
            })?
            .ok_or(Error::NotFound)
    }

    pub fn get_active(&self, site_id: i64) -> Result<Option<SiteConfigPeriod>> {
        self.store.read(|conn| {
            conn.query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM site_config_periods WHERE site_id = ? AND is_active = 1"),
                [site_id],
                row_to_period,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// The period effective at `ts` for `site_id`, if any.
    pub fn get_for_timestamp(&self, site_id: i64, ts: f64) -> Result<Option<SiteConfigPeriod>> {
        self.store.read(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM site_config_periods \
                     WHERE site_id = ?1 AND effective_start_unix <= ?2 \
                       AND (effective_end_unix IS NULL OR effective_end_unix > ?2)"
                ),
                params![site_id, ts],
                row_to_period,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// All periods, optionally filtered by site, ordered by
    /// `effective_start_unix` ascending.
    pub fn list(&self, site_id: Option<i64>) -> Result<Vec<SiteConfigPeriod>> {
        self.store.read(|conn| {
            let mut stmt = if site_id.is_some() {
                conn.prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM site_config_periods WHERE site_id = ? \
                     ORDER BY effective_start_unix ASC"
                ))?
            } else {
                conn.prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM site_config_periods ORDER BY effective_start_unix ASC"
                ))?
            };
            let rows = if let Some(site_id) = site_id {
                stmt.query_map([site_id], row_to_period)?
                    .collect::<rusqlite::Result<Vec<_>>>()
            } else {
                stmt.query_map([], row_to_period)?
                    .collect::<rusqlite::Result<Vec<_>>>()
            };
            Ok(rows?)
        })
    }
}

fn deactivate_others(tx: &Transaction<'_>, site_id: i64, exclude_id: Option<i64>) -> Result<()> {
    tx.execute(
        "UPDATE site_config_periods SET is_active = 0 \
         WHERE site_id = ?1 AND (?2 IS NULL OR id != ?2)",
        params![site_id, exclude_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VelocityConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_store() -> Store {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        Store::open(VelocityConfig::new(format!(
            "file:config_timeline_test_{n}?mode=memory&cache=shared"
        )))
        .unwrap()
    }

    fn period(site_id: i64, start: f64, end: Option<f64>, angle: f64) -> SiteConfigPeriod {
        SiteConfigPeriod {
            id: 0,
            site_id,
            site_variable_config_id: None,
            effective_start_unix: start,
            effective_end_unix: end,
            is_active: end.is_none(),
            notes: None,
            cosine_error_angle: angle,
        }
    }

    #[test]
    fn create_then_get_round_trips() {
        let store = test_store();
        let timeline = SiteConfigTimeline::new(&store);
        let id = timeline.create(&period(1, 100.0, None, 10.0)).unwrap();
        let fetched = timeline.get(id).unwrap();
        assert_eq!(fetched.site_id, 1);
        assert_eq!(fetched.cosine_error_angle, 10.0);
        assert!(fetched.is_active);
    }

    #[test]
    fn overlapping_periods_are_rejected() {
        let store = test_store();
        let timeline = SiteConfigTimeline::new(&store);
        timeline.create(&period(1, 0.0, Some(100.0), 5.0)).unwrap();
        let err = timeline.create(&period(1, 50.0, Some(150.0), 5.0)).unwrap_err();
        assert!(matches!(err, Error::Overlap));
    }

    #[test]
    fn adjacent_periods_do_not_overlap() {
        let store = test_store();
        let timeline = SiteConfigTimeline::new(&store);
        timeline.create(&period(1, 0.0, Some(100.0), 5.0)).unwrap();
        // [100, 200) starts exactly where [0, 100) ends: not an overlap.
        timeline.create(&period(1, 100.0, Some(200.0), 5.0)).unwrap();
    }

    #[test]
    fn only_one_active_period_per_site() {
        let store = test_store();
        let timeline = SiteConfigTimeline::new(&store);
        let first = timeline.create(&period(1, 0.0, None, 5.0)).unwrap();
        timeline.create(&period(1, 1000.0, None, 8.0)).unwrap();
        let first = timeline.get(first).unwrap();
        assert!(!first.is_active);
        let active = timeline.get_active(1).unwrap().unwrap();
        assert_eq!(active.cosine_error_angle, 8.0);
    }

    #[test]
    fn get_for_timestamp_picks_the_effective_period() {
        let store = test_store();
        let timeline = SiteConfigTimeline::new(&store);
        timeline.create(&period(1, 0.0, Some(100.0), 5.0)).unwrap();
        timeline.create(&period(1, 100.0, None, 10.0)).unwrap();
        assert_eq!(timeline.get_for_timestamp(1, 50.0).unwrap().unwrap().cosine_error_angle, 5.0);
        assert_eq!(timeline.get_for_timestamp(1, 150.0).unwrap().unwrap().cosine_error_angle, 10.0);
        assert!(timeline.get_for_timestamp(1, 100.0).unwrap().unwrap().cosine_error_angle == 10.0);
    }

    #[test]
    fn close_sets_end_and_clears_active_only_once() {
        let store = test_store();
        let timeline = SiteConfigTimeline::new(&store);
        let id = timeline.create(&period(1, 0.0, None, 5.0)).unwrap();
        timeline.close(id, 500.0).unwrap();
        let closed = timeline.get(id).unwrap();
        assert_eq!(closed.effective_end_unix, Some(500.0));
        assert!(!closed.is_active);
        // already closed: no-op turns into NotFound since the WHERE clause no longer matches
        assert!(matches!(timeline.close(id, 600.0).unwrap_err(), Error::NotFound));
    }

    #[test]
    fn rejects_invalid_angle() {
        let store = test_store();
        let timeline = SiteConfigTimeline::new(&store);
        let err = timeline.create(&period(1, 0.0, None, 95.0)).unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[test]
    fn list_is_ordered_by_start_ascending() {
        let store = test_store();
        let timeline = SiteConfigTimeline::new(&store);
        timeline.create(&period(1, 200.0, Some(300.0), 1.0)).unwrap();
        timeline.create(&period(1, 0.0, Some(100.0), 2.0)).unwrap();
        timeline.create(&period(1, 100.0, Some(200.0), 3.0)).unwrap();
        let all = timeline.list(Some(1)).unwrap();
        let starts: Vec<f64> = all.iter().map(|p| p.effective_start_unix).collect();
        assert_eq!(starts, vec![0.0, 100.0, 200.0]);
    }
}
