/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Greedy online clustering of raw samples into transits (§4.5), the
//! algorithmic core of the crate.

use rusqlite::params;
use sha1::{Digest, Sha1};

use crate::clock::now_unix;
use crate::error::{Error, Result};
use crate::interrupt::SqlInterruptScope;
use crate::store::Store;
use crate::types::Transit;

/// Tuning knobs for [`TransitWorker::run_range`] and the derived
/// higher-level entry points. Defaults match §4.5/§4.6.
#[derive(Clone, Debug)]
pub struct TransitWorkerConfig {
    pub threshold_seconds: f64,
    pub model_version: String,
    /// `RunOnce`'s rolling window width.
    pub window_seconds: f64,
    /// `RunOnce`'s tick interval; also `IsHealthy`'s staleness multiplier base.
    pub interval_seconds: f64,
    /// Maximum `|p.speed - candidate.max_speed|` (m/s) to extend a candidate.
    pub speed_delta_tolerance: f64,
    /// Weight given to the time-proximity term in link scoring.
    pub link_alpha: f64,
    /// Denominator of the speed term in link scoring.
    pub link_speed_denom: f64,
    /// Minimum link score to persist a `TransitLink`.
    pub link_score_min: f64,
}

impl Default for TransitWorkerConfig {
    fn default() -> Self {
        Self {
            threshold_seconds: 5.0,
            model_version: "rebuild-full".to_string(),
            window_seconds: 20.0 * 60.0,
            interval_seconds: 15.0 * 60.0,
            speed_delta_tolerance: 3.0,
            link_alpha: 0.6,
            link_speed_denom: 5.0,
            link_score_min: 0.01,
        }
    }
}

struct Point {
    row_id: i64,
    ts: f64,
    speed: Option<f64>,
}

struct Candidate {
    start: f64,
    end: f64,
    max_speed: f64,
    min_speed: f64,
    max_magnitude: f64,
    min_magnitude: f64,
    points: Vec<Point>,
}

impl Candidate {
    fn new(row_id: i64, ts: f64, abs_speed: Option<f64>, magnitude: Option<f64>, raw_speed: Option<f64>) -> Self {
        Self {
            start: ts,
            end: ts,
            max_speed: abs_speed.unwrap_or(0.0),
            min_speed: abs_speed.unwrap_or(0.0),
            max_magnitude: magnitude.unwrap_or(0.0),
            min_magnitude: magnitude.unwrap_or(0.0),
            points: vec![Point { row_id, ts, speed: raw_speed }],
        }
    }

    fn extend(&mut self, row_id: i64, ts: f64, abs_speed: Option<f64>, magnitude: Option<f64>, raw_speed: Option<f64>) {
        self.start = self.start.min(ts);
        self.end = self.end.max(ts);
        if let Some(s) = abs_speed {
            self.max_speed = self.max_speed.max(s);
            self.min_speed = self.min_speed.min(s);
        }
        if let Some(m) = magnitude {
            self.max_magnitude = self.max_magnitude.max(m);
            self.min_magnitude = self.min_magnitude.min(m);
        }
        self.points.push(Point { row_id, ts, speed: raw_speed });
    }
}

fn transit_key(start: f64, threshold_ms: i64, model_version: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{}|{}|{}", start.floor() as i64, threshold_ms, model_version).as_bytes());
    hex::encode(hasher.finalize())
}

/// Converts a dense stream of raw samples into a sparse list of transits.
/// Holds no state between calls beyond its configuration; every method
/// borrows a `Store`.
pub struct TransitWorker<'a> {
    store: &'a Store,
    config: TransitWorkerConfig,
}

impl<'a> TransitWorker<'a> {
    pub fn new(store: &'a Store, config: TransitWorkerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &TransitWorkerConfig {
        &self.config
    }

    /// Re-clusters `[start, end]`, replacing every transit tagged with
    /// this worker's `model_version` that overlaps the range. Idempotent:
    /// re-running over the same range yields the same transit keys and
    /// aggregates. Returns the number of transits written.
    pub fn run_range(&self, start: f64, end: f64) -> Result<usize> {
        self.run_range_as(start, end, &self.config.model_version)
    }

    fn run_range_as(&self, start: f64, end: f64, model_version: &str) -> Result<usize> {
        if end <= start {
            return Err(Error::bad_input("RunRange: end must be greater than start"));
        }
        let threshold = self.config.threshold_seconds;
        let threshold_ms = (threshold * 1000.0).round() as i64;
        let speed_delta_tolerance = self.config.speed_delta_tolerance;

        self.store.write_tx(|tx, scope| {
            // Step 2: delete overlapping transits (starts-in, ends-in, spans).
            tx.execute(
                "DELETE FROM transits WHERE model_version = ?1 AND (
                     (transit_start_unix BETWEEN ?2 AND ?3) OR
                     (transit_end_unix BETWEEN ?2 AND ?3) OR
                     (transit_start_unix <= ?2 AND transit_end_unix >= ?3)
                 )",
                params![model_version, start, end],
            )?;
            scope.err_if_interrupted()?;

            // Step 3: read raw samples in range with at least one of
            // speed/magnitude present.
            let rows: Vec<(i64, f64, Option<f64>, Option<f64>)> = {
                let mut stmt = tx.prepare(
                    "SELECT row_id, write_timestamp, speed, magnitude FROM radar_data \
                     WHERE write_timestamp >= ?1 AND write_timestamp <= ?2 \
                       AND (speed IS NOT NULL OR magnitude IS NOT NULL) \
                     ORDER BY write_timestamp ASC",
                )?;
                stmt.query_map(params![start, end], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?
            };

            // Step 4: greedy online clustering.
            let candidates = cluster(&rows, threshold, speed_delta_tolerance, scope)?;

            // Step 5: upsert transits, keeping each candidate's points so
            // step 6 can attribute links without re-reading the range.
            let mut written: Vec<(i64, Candidate)> = Vec::with_capacity(candidates.len());
            let now = now_unix();
            for candidate in candidates {
                let key = transit_key(candidate.start, threshold_ms, model_version);
                let transit_id: i64 = tx.query_row(
                    "INSERT INTO transits (
                         transit_key, threshold_ms, transit_start_unix, transit_end_unix,
                         transit_max_speed, transit_min_speed, transit_max_magnitude, transit_min_magnitude,
                         point_count, model_version, created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                     ON CONFLICT(transit_key) DO UPDATE SET
                         threshold_ms = excluded.threshold_ms,
                         transit_start_unix = excluded.transit_start_unix,
                         transit_end_unix = excluded.transit_end_unix,
                         transit_max_speed = excluded.transit_max_speed,
                         transit_min_speed = excluded.transit_min_speed,
                         transit_max_magnitude = excluded.transit_max_magnitude,
                         transit_min_magnitude = excluded.transit_min_magnitude,
                         point_count = excluded.point_count,
                         model_version = excluded.model_version,
                         updated_at = excluded.updated_at
                     RETURNING transit_id",
                    params![
                        key,
                        threshold_ms,
                        candidate.start,
                        candidate.end,
                        candidate.max_speed,
                        candidate.min_speed,
                        candidate.max_magnitude,
                        candidate.min_magnitude,
                        candidate.points.len() as i64,
                        model_version,
                        now,
                    ],
                    |row| row.get(0),
                )?;
                written.push((transit_id, candidate));
                scope.err_if_interrupted()?;
            }

            // Step 6: rewrite links for transits whose start falls in range.
            tx.execute(
                "DELETE FROM transit_links WHERE transit_id IN (
                     SELECT transit_id FROM transits
                     WHERE model_version = ?1 AND transit_start_unix BETWEEN ?2 AND ?3
                 )",
                params![model_version, start, end],
            )?;
            let alpha = self.config.link_alpha;
            let speed_denom = self.config.link_speed_denom;
            let score_min = self.config.link_score_min;
            for (transit_id, candidate) in &written {
                let duration = (candidate.end - candidate.start).max(f64::MIN_POSITIVE);
                for point in &candidate.points {
                    let time_score = if candidate.end > candidate.start {
                        (point.ts - candidate.start) / duration
                    } else {
                        1.0
                    };
                    let speed_score = match point.speed {
                        Some(s) => (1.0 - (s.abs() - candidate.max_speed).abs() / speed_denom).max(0.0),
                        None => 0.0,
                    };
                    let score = alpha * time_score + (1.0 - alpha) * speed_score;
                    if score >= score_min {
                        tx.execute(
                            "INSERT INTO transit_links (transit_id, data_rowid, link_score, created_at) \
                             VALUES (?1, ?2, ?3, ?4)",
                            params![transit_id, point.row_id, score, now],
                        )?;
                    }
                }
            }

            Ok(written.len())
        })
    }

    /// Rolling window of `now - window` to `now`.
    pub fn run_once(&self) -> Result<usize> {
        let now = now_unix();
        self.run_range(now - self.config.window_seconds, now)
    }

    /// Clusters the entire observed history. No-op if `radar_data` is
    /// empty.
    pub fn run_full_history(&self) -> Result<usize> {
        self.run_full_history_as(&self.config.model_version.clone())
    }

    fn run_full_history_as(&self, model_version: &str) -> Result<usize> {
        let span: Option<(f64, f64)> = self.store.read(|conn| {
            conn.query_row(
                "SELECT MIN(write_timestamp), MAX(write_timestamp) FROM radar_data",
                [],
                |row| {
                    let min: Option<f64> = row.get(0)?;
                    let max: Option<f64> = row.get(1)?;
                    Ok(min.zip(max))
                },
            )
            .map_err(Into::into)
        })?;
        match span {
            Some((min, max)) if max > min => self.run_range_as(min, max, model_version),
            _ => Ok(0),
        }
    }

    /// Unconditionally removes every transit (and its links) tagged
    /// `model_version`.
    pub fn delete_all_transits(&self, model_version: &str) -> Result<usize> {
        self.store.write_tx(|tx, _scope| {
            tx.execute(
                "DELETE FROM transit_links WHERE transit_id IN (
                     SELECT transit_id FROM transits WHERE model_version = ?1
                 )",
                params![model_version],
            )?;
            let deleted = tx.execute("DELETE FROM transits WHERE model_version = ?1", params![model_version])?;
            Ok(deleted)
        })
    }

    /// Deletes every transit tagged `old`, then re-clusters full history
    /// under `new`.
    pub fn migrate_model_version(&self, old: &str, new: &str) -> Result<usize> {
        if old == new {
            return Err(Error::bad_input("MigrateModelVersion: old and new must differ"));
        }
        self.delete_all_transits(old)?;
        self.run_full_history_as(new)
    }
}

fn cluster(
    rows: &[(i64, f64, Option<f64>, Option<f64>)],
    threshold: f64,
    speed_delta_tolerance: f64,
    scope: &SqlInterruptScope,
) -> Result<Vec<Candidate>> {
    let mut candidates: Vec<Candidate> = Vec::new();
    for (row_id, ts, speed, magnitude) in rows.iter().copied() {
        scope.err_if_interrupted()?;
        let abs_speed = speed.map(f64::abs);

        let mut best_idx: Option<usize> = None;
        let mut best_diff = f64::INFINITY;
        for (i, cand) in candidates.iter().enumerate() {
            if ts - cand.end > threshold {
                continue;
            }
            let (qualifies, diff) = match abs_speed {
                Some(s) => {
                    let diff = (s - cand.max_speed).abs();
                    (diff <= speed_delta_tolerance, diff)
                }
                // Magnitude-only samples carry no speed to compare: any
                // candidate still within the time threshold qualifies,
                // and we prefer the most recently touched one.
                None => (true, 0.0),
            };
            if qualifies && diff < best_diff {
                best_diff = diff;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(i) => candidates[i].extend(row_id, ts, abs_speed, magnitude, speed),
            None => candidates.push(Candidate::new(row_id, ts, abs_speed, magnitude, speed)),
        }
    }
    Ok(candidates)
}

/// Row-shape view of a transit, for callers that don't need the full
/// `Transit` struct's owned strings.
pub fn list_transits(store: &Store, model_version: &str) -> Result<Vec<Transit>> {
    store.read(|conn| {
        let mut stmt = conn.prepare(
            "SELECT transit_id, transit_key, threshold_ms, transit_start_unix, transit_end_unix,
                    transit_max_speed, transit_min_speed, transit_max_magnitude, transit_min_magnitude,
                    point_count, model_version, created_at, updated_at
             FROM transits WHERE model_version = ?1 ORDER BY transit_start_unix ASC",
        )?;
        let rows = stmt
            .query_map(params![model_version], |row| {
                Ok(Transit {
                    transit_id: row.get(0)?,
                    transit_key: row.get(1)?,
                    threshold_ms: row.get(2)?,
                    transit_start_unix: row.get(3)?,
                    transit_end_unix: row.get(4)?,
                    transit_max_speed: row.get(5)?,
                    transit_min_speed: row.get(6)?,
                    transit_max_magnitude: row.get(7)?,
                    transit_min_magnitude: row.get(8)?,
                    point_count: row.get(9)?,
                    model_version: row.get(10)?,
                    created_at: row.get(11)?,
                    updated_at: row.get(12)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VelocityConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_store() -> Store {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        Store::open(VelocityConfig::new(format!("file:transit_test_{n}?mode=memory&cache=shared"))).unwrap()
    }

    fn insert_sample(store: &Store, ts: f64, speed: Option<f64>) {
        store
            .write(|conn, _| {
                let json = match speed {
                    Some(s) => format!(r#"{{"speed": {s}}}"#),
                    None => r#"{"magnitude": 0.5}"#.to_string(),
                };
                conn.execute(
                    "INSERT INTO radar_data (write_timestamp, raw_json) VALUES (?1, ?2)",
                    params![ts, json],
                )?;
                Ok(())
            })
            .unwrap();
    }

    fn worker(store: &Store) -> TransitWorker<'_> {
        TransitWorker::new(
            store,
            TransitWorkerConfig {
                threshold_seconds: 5.0,
                model_version: "test-model".to_string(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn contiguous_samples_cluster_into_one_transit() {
        let store = test_store();
        for (ts, speed) in [(0.0, 10.0), (1.0, 10.5), (2.0, 11.0)] {
            insert_sample(&store, ts, Some(speed));
        }
        let w = worker(&store);
        let count = w.run_range(0.0, 10.0).unwrap();
        assert_eq!(count, 1);
        let transits = list_transits(&store, "test-model").unwrap();
        assert_eq!(transits.len(), 1);
        assert_eq!(transits[0].point_count, 3);
        assert_eq!(transits[0].transit_max_speed, 11.0);
    }

    #[test]
    fn a_large_gap_starts_a_new_transit() {
        let store = test_store();
        insert_sample(&store, 0.0, Some(10.0));
        insert_sample(&store, 100.0, Some(10.0));
        let w = worker(&store);
        let count = w.run_range(0.0, 200.0).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn a_large_speed_jump_starts_a_new_transit() {
        let store = test_store();
        insert_sample(&store, 0.0, Some(10.0));
        insert_sample(&store, 1.0, Some(30.0));
        let w = worker(&store);
        let count = w.run_range(0.0, 10.0).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn rerunning_over_same_range_is_idempotent() {
        let store = test_store();
        for (ts, speed) in [(0.0, 10.0), (1.0, 10.5)] {
            insert_sample(&store, ts, Some(speed));
        }
        let w = worker(&store);
        w.run_range(0.0, 10.0).unwrap();
        let first = list_transits(&store, "test-model").unwrap();
        w.run_range(0.0, 10.0).unwrap();
        let second = list_transits(&store, "test-model").unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].transit_key, second[0].transit_key);
    }

    #[test]
    fn run_range_rejects_inverted_range() {
        let store = test_store();
        let w = worker(&store);
        let err = w.run_range(10.0, 5.0).unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[test]
    fn run_full_history_is_noop_on_empty_table() {
        let store = test_store();
        let w = worker(&store);
        assert_eq!(w.run_full_history().unwrap(), 0);
    }

    #[test]
    fn delete_all_transits_removes_links_too() {
        let store = test_store();
        insert_sample(&store, 0.0, Some(10.0));
        let w = worker(&store);
        w.run_range(0.0, 10.0).unwrap();
        let deleted = w.delete_all_transits("test-model").unwrap();
        assert_eq!(deleted, 1);
        let remaining_links: i64 = store
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM transit_links", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(remaining_links, 0);
    }

    #[test]
    fn migrate_model_version_rejects_identical_versions() {
        let store = test_store();
        let w = worker(&store);
        let err = w.migrate_model_version("a", "a").unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[test]
    fn migrate_model_version_moves_history_to_new_tag() {
        let store = test_store();
        insert_sample(&store, 0.0, Some(10.0));
        let w = worker(&store);
        w.run_range(0.0, 10.0).unwrap();
        w.migrate_model_version("test-model", "next-model").unwrap();
        assert_eq!(list_transits(&store, "test-model").unwrap().len(), 0);
        assert_eq!(list_transits(&store, "next-model").unwrap().len(), 1);
    }

    #[test]
    fn overlapping_reruns_stay_idempotent_across_windows() {
        let store = test_store();
        for (ts, speed) in [(0.0, 10.0), (5.0, 10.0), (10.0, 10.0), (15.0, 10.0)] {
            insert_sample(&store, ts, Some(speed));
        }
        let w = worker(&store);
        w.run_range(0.0, 8.0).unwrap();
        w.run_range(6.0, 20.0).unwrap();
        let once = list_transits(&store, "test-model").unwrap();

        let store2 = test_store();
        for (ts, speed) in [(0.0, 10.0), (5.0, 10.0), (10.0, 10.0), (15.0, 10.0)] {
            insert_sample(&store2, ts, Some(speed));
        }
        let w2 = worker(&store2);
        w2.run_range(0.0, 20.0).unwrap();
        let whole = list_transits(&store2, "test-model").unwrap();

        assert_eq!(once.len(), whole.len());
    }
}
