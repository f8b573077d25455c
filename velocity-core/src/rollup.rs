/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Time-bucketed speed aggregates with optional histogram, applying
//! per-period cosine correction (§4.7).

use std::collections::{BTreeMap, HashMap};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::store::Store;

const DEFAULT_MIN_SPEED_MPS: f64 = 2.2352;
const DEFAULT_TRANSIT_MODEL_VERSION: &str = "rebuild-full";
const SECONDS_PER_DAY: f64 = 86_400.0;
/// `site_id = 0` means "the single active site"; rollups fall back to
/// the baseline-seeded default site, matching `config_timeline`'s
/// `site_id = 0` convention (open question (i) in SPEC_FULL.md §9).
const DEFAULT_SITE_ID: i64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    RadarObjects,
    RadarData,
    RadarDataTransits,
}

impl Source {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "radar_objects" => Ok(Self::RadarObjects),
            "radar_data" => Ok(Self::RadarData),
            "radar_data_transits" => Ok(Self::RadarDataTransits),
            other => Err(Error::bad_input(format!("unrecognised rollup source: {other}"))),
        }
    }
}

/// Parameters for [`RollupEngine::run`].
#[derive(Clone, Debug)]
pub struct RollupQuery {
    pub start_unix: f64,
    pub end_unix: f64,
    /// `0` collapses everything into a single UTC-midnight-aligned bucket.
    pub group_seconds: f64,
    /// `<= 0` is replaced by the ≈5 mph default.
    pub min_speed: f64,
    pub source: String,
    /// Only consulted when `source == "radar_data_transits"`; defaults to
    /// `"rebuild-full"` when empty.
    pub model_version: String,
    /// `<= 0` disables the histogram.
    pub hist_bucket_size: f64,
    /// `<= 0` disables the upper-bound drop.
    pub hist_max: f64,
    pub site_id: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RollupBucket {
    pub classifier: String,
    pub start_time: f64,
    pub count: i64,
    pub p50_speed: f64,
    pub p85_speed: f64,
    pub p98_speed: f64,
    pub max_speed: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RollupResult {
    /// Ordered by `start_time` ascending; empty buckets are never present.
    pub buckets: Vec<RollupBucket>,
    /// `bin_start -> count`, ordered by `bin_start` ascending. `None` when
    /// `hist_bucket_size <= 0`.
    pub histogram: Option<Vec<(f64, i64)>>,
}

pub struct RollupEngine<'a> {
    store: &'a Store,
}

impl<'a> RollupEngine<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn run(&self, query: &RollupQuery) -> Result<RollupResult> {
        if query.end_unix <= query.start_unix {
            return Err(Error::bad_input("Rollup: endUnix must be greater than startUnix"));
        }
        if query.group_seconds < 0.0 {
            return Err(Error::bad_input("Rollup: groupSeconds must not be negative"));
        }
        let source = Source::parse(&query.source)?;
        let model_version = if source == Source::RadarDataTransits && query.model_version.is_empty() {
            DEFAULT_TRANSIT_MODEL_VERSION.to_string()
        } else {
            query.model_version.clone()
        };
        let min_speed = if query.min_speed <= 0.0 {
            DEFAULT_MIN_SPEED_MPS
        } else {
            query.min_speed
        };

        self.store.read(|conn| {
            let rows = fetch_rows(conn, source, &model_version, query.start_unix, query.end_unix)?;

            let mut corrected = Vec::with_capacity(rows.len());
            for (ts, raw_speed) in rows {
                let angle_deg = correction_angle(conn, query.site_id, ts)?;
                let s_corr = raw_speed / (angle_deg.to_radians()).cos();
                corrected.push((ts, s_corr));
            }
            let filtered: Vec<(f64, f64)> = corrected.into_iter().filter(|(_, s)| *s >= min_speed).collect();

            let histogram = build_histogram(&filtered, query.hist_bucket_size, query.hist_max);
            let buckets = build_buckets(&filtered, query.start_unix, query.group_seconds);

            Ok(RollupResult { buckets, histogram })
        })
    }
}

fn fetch_rows(conn: &Connection, source: Source, model_version: &str, start: f64, end: f64) -> Result<Vec<(f64, f64)>> {
    let (sql, needs_model_version) = match source {
        Source::RadarObjects => (
            "SELECT write_timestamp, max_speed_mps FROM radar_objects \
             WHERE write_timestamp BETWEEN ?1 AND ?2 AND max_speed_mps IS NOT NULL \
             ORDER BY write_timestamp ASC",
            false,
        ),
        Source::RadarData => (
            "SELECT write_timestamp, speed FROM radar_data \
             WHERE write_timestamp BETWEEN ?1 AND ?2 AND speed IS NOT NULL \
             ORDER BY write_timestamp ASC",
            false,
        ),
        Source::RadarDataTransits => (
            "SELECT transit_start_unix, transit_max_speed FROM transits \
             WHERE transit_start_unix BETWEEN ?1 AND ?2 AND model_version = ?3 \
             ORDER BY transit_start_unix ASC",
            true,
        ),
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = if needs_model_version {
        stmt.query_map(params![start, end, model_version], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?
    } else {
        stmt.query_map(params![start, end], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };
    Ok(rows)
}

/// Looks up the `cosine_error_angle` of the period effective at `ts`
/// directly (rather than through `config_timeline::SiteConfigTimeline`,
/// which would open a fresh reader connection per sample). Returns `0.0`
/// (uncorrected) when no period covers `ts`.
fn correction_angle(conn: &Connection, site_id: i64, ts: f64) -> Result<f64> {
    let effective_site = if site_id == 0 { DEFAULT_SITE_ID } else { site_id };
    let angle: Option<f64> = conn
        .query_row(
            "SELECT cosine_error_angle FROM site_config_periods \
             WHERE site_id = ?1 AND effective_start_unix <= ?2 \
               AND (effective_end_unix IS NULL OR effective_end_unix > ?2) \
             LIMIT 1",
            params![effective_site, ts],
            |row| row.get(0),
        )
        .optional()?;
    Ok(angle.unwrap_or(0.0))
}

fn build_histogram(filtered: &[(f64, f64)], bucket_size: f64, hist_max: f64) -> Option<Vec<(f64, i64)>> {
    if bucket_size <= 0.0 {
        return None;
    }
    let mut hist: HashMap<u64, (f64, i64)> = HashMap::new();
    for (_, s) in filtered {
        if hist_max > 0.0 && *s > hist_max {
            continue;
        }
        let bin_start = (*s / bucket_size).floor() * bucket_size;
        let entry = hist.entry(bin_start.to_bits()).or_insert((bin_start, 0));
        entry.1 += 1;
    }
    let mut pairs: Vec<(f64, i64)> = hist.into_values().collect();
    pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
    Some(pairs)
}

fn build_buckets(filtered: &[(f64, f64)], start_unix: f64, group_seconds: f64) -> Vec<RollupBucket> {
    // Keys are bucketed timestamps' bit patterns, used purely as a
    // deterministic ordering for non-negative unix timestamps.
    let mut buckets: BTreeMap<u64, (f64, Vec<f64>)> = BTreeMap::new();

    if group_seconds > 0.0 {
        for (ts, s) in filtered {
            let offset = ((*ts - start_unix) / group_seconds).floor() * group_seconds;
            let bucket_start = start_unix + offset;
            buckets.entry(bucket_start.to_bits()).or_insert_with(|| (bucket_start, Vec::new())).1.push(*s);
        }
    } else if !filtered.is_empty() {
        let min_ts = filtered.iter().map(|(ts, _)| *ts).fold(f64::INFINITY, f64::min);
        let bucket_start = (min_ts / SECONDS_PER_DAY).floor() * SECONDS_PER_DAY;
        let speeds: Vec<f64> = filtered.iter().map(|(_, s)| *s).collect();
        buckets.insert(bucket_start.to_bits(), (bucket_start, speeds));
    }

    buckets
        .into_values()
        .map(|(start, mut speeds)| {
            speeds.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let max_speed = *speeds.last().unwrap();
            RollupBucket {
                classifier: "all".to_string(),
                start_time: start,
                count: speeds.len() as i64,
                p50_speed: percentile(&speeds, 0.50),
                p85_speed: percentile(&speeds, 0.85),
                p98_speed: percentile(&speeds, 0.98),
                max_speed,
            }
        })
        .collect()
}

/// Empirical quantile: `rank = q * n`, truncated to an index.
fn percentile(sorted_speeds: &[f64], q: f64) -> f64 {
    let n = sorted_speeds.len();
    let idx = ((q * n as f64).floor() as usize).min(n - 1);
    sorted_speeds[idx]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VelocityConfig;
    use crate::config_timeline::SiteConfigTimeline;
    use crate::types::SiteConfigPeriod;
    use more_asserts::assert_le;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_store() -> Store {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        Store::open(VelocityConfig::new(format!("file:rollup_test_{n}?mode=memory&cache=shared"))).unwrap()
    }

    fn insert_object(store: &Store, ts: f64, max_speed_mps: f64) {
        store
            .write(|conn, _| {
                conn.execute(
                    "INSERT INTO radar_objects (write_timestamp, raw_json) VALUES (?1, ?2)",
                    params![ts, format!(r#"{{"max_speed_mps": {max_speed_mps}}}"#)],
                )?;
                Ok(())
            })
            .unwrap();
    }

    fn base_query(start: f64, end: f64) -> RollupQuery {
        RollupQuery {
            start_unix: start,
            end_unix: end,
            group_seconds: 0.0,
            min_speed: 0.0,
            source: "radar_objects".to_string(),
            model_version: String::new(),
            hist_bucket_size: 0.0,
            hist_max: 0.0,
            site_id: 0,
        }
    }

    #[test]
    fn rejects_inverted_range() {
        let store = test_store();
        let engine = RollupEngine::new(&store);
        let err = engine.run(&base_query(10.0, 5.0)).unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[test]
    fn rejects_unknown_source() {
        let store = test_store();
        let engine = RollupEngine::new(&store);
        let mut q = base_query(0.0, 100.0);
        q.source = "bogus".to_string();
        let err = engine.run(&q).unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[test]
    fn single_site_cosine_correction() {
        let store = test_store();
        let timeline = SiteConfigTimeline::new(&store);
        timeline
            .create(&SiteConfigPeriod {
                id: 0,
                site_id: 1,
                site_variable_config_id: None,
                effective_start_unix: 0.0,
                effective_end_unix: None,
                is_active: true,
                notes: None,
                cosine_error_angle: 60.0,
            })
            .unwrap();
        insert_object(&store, 50.0, 10.0);

        let engine = RollupEngine::new(&store);
        let mut q = base_query(0.0, 100.0);
        q.site_id = 1;
        let result = engine.run(&q).unwrap();
        assert_eq!(result.buckets.len(), 1);
        assert!((result.buckets[0].max_speed - 20.0).abs() < 0.01);
    }

    #[test]
    fn period_switch_applies_correct_angle_per_timestamp() {
        let store = test_store();
        let timeline = SiteConfigTimeline::new(&store);
        // January at 5 degrees, February onward at 10 degrees.
        let jan_start = 0.0;
        let feb_start = 31.0 * SECONDS_PER_DAY;
        timeline
            .create(&SiteConfigPeriod {
                id: 0,
                site_id: 1,
                site_variable_config_id: None,
                effective_start_unix: jan_start,
                effective_end_unix: Some(feb_start),
                is_active: false,
                notes: None,
                cosine_error_angle: 5.0,
            })
            .unwrap();
        timeline
            .create(&SiteConfigPeriod {
                id: 0,
                site_id: 1,
                site_variable_config_id: None,
                effective_start_unix: feb_start,
                effective_end_unix: None,
                is_active: true,
                notes: None,
                cosine_error_angle: 10.0,
            })
            .unwrap();
        insert_object(&store, jan_start + 1.0, 25.0);
        insert_object(&store, feb_start + 1.0, 25.0);

        let engine = RollupEngine::new(&store);
        let mut jan_query = base_query(jan_start, feb_start);
        jan_query.site_id = 1;
        let jan_result = engine.run(&jan_query).unwrap();
        assert!((jan_result.buckets[0].max_speed - 25.0 / 5.0f64.to_radians().cos()).abs() < 0.01);

        let mut feb_query = base_query(feb_start, feb_start + SECONDS_PER_DAY);
        feb_query.site_id = 1;
        let feb_result = engine.run(&feb_query).unwrap();
        assert!((feb_result.buckets[0].max_speed - 25.0 / 10.0f64.to_radians().cos()).abs() < 0.01);
    }

    #[test]
    fn percentiles_are_ordered_and_count_matches() {
        let store = test_store();
        for (i, speed) in [5.0, 10.0, 15.0, 20.0, 100.0].into_iter().enumerate() {
            insert_object(&store, i as f64, speed);
        }
        let engine = RollupEngine::new(&store);
        let result = engine.run(&base_query(0.0, 10.0)).unwrap();
        assert_eq!(result.buckets.len(), 1);
        let bucket = &result.buckets[0];
        assert_eq!(bucket.count, 5);
        assert_le!(bucket.p50_speed, bucket.p85_speed);
        assert_le!(bucket.p85_speed, bucket.p98_speed);
        assert_le!(bucket.p98_speed, bucket.max_speed);
        assert_eq!(bucket.max_speed, 100.0);
    }

    #[test]
    fn grouped_buckets_are_ordered_ascending_and_empty_buckets_omitted() {
        let store = test_store();
        insert_object(&store, 0.0, 10.0);
        insert_object(&store, 100.0, 20.0);
        // [50,100) deliberately left empty.
        let engine = RollupEngine::new(&store);
        let mut q = base_query(0.0, 150.0);
        q.group_seconds = 50.0;
        let result = engine.run(&q).unwrap();
        assert_eq!(result.buckets.len(), 2);
        assert!(result.buckets[0].start_time < result.buckets[1].start_time);
    }

    #[test]
    fn histogram_respects_max_cutoff() {
        let store = test_store();
        insert_object(&store, 0.0, 5.0);
        insert_object(&store, 1.0, 15.0);
        insert_object(&store, 2.0, 95.0);
        let engine = RollupEngine::new(&store);
        let mut q = base_query(0.0, 10.0);
        q.hist_bucket_size = 10.0;
        q.hist_max = 50.0;
        let result = engine.run(&q).unwrap();
        let hist = result.histogram.unwrap();
        let total: i64 = hist.iter().map(|(_, c)| c).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn min_speed_default_applies_when_unset() {
        let store = test_store();
        insert_object(&store, 0.0, 1.0);
        let engine = RollupEngine::new(&store);
        let result = engine.run(&base_query(0.0, 10.0)).unwrap();
        assert!(result.buckets.is_empty());
    }
}
