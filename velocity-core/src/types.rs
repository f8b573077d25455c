/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Shared row types (§3 "Data model"). These are plain data; the
//! operations that produce and consume them live in the modules named
//! after each one (`config_timeline`, `ingest`, `transit`, `snapshot`,
//! `report_catalog`).

use serde::{Deserialize, Serialize};

/// A single raw radar reading. Append-only: once written, a row is never
/// updated. `speed` and `magnitude` are independently optional, but
/// `transit::run_range` only considers rows where at least one is
/// present.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub row_id: i64,
    pub write_timestamp: f64,
    pub speed: Option<f64>,
    pub magnitude: Option<f64>,
    pub uptime: Option<f64>,
}

/// A per-event aggregate record produced by the sensor's own front-end
/// object tracker (as opposed to `RawSample`, which is a single reading).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RadarObject {
    pub row_id: i64,
    pub classifier: Option<String>,
    pub start_time: f64,
    pub end_time: f64,
    pub delta_time_ms: f64,
    pub max_speed_mps: f64,
    pub min_speed_mps: f64,
    pub speed_change: f64,
    pub max_magnitude: f64,
    pub avg_magnitude: f64,
    pub total_frames: i64,
    pub frames_per_mps: f64,
    pub length_m: f64,
    pub write_timestamp: f64,
}

/// A contiguous passage of a single physical object, reconstructed from
/// raw samples by `transit::run_range`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transit {
    pub transit_id: i64,
    pub transit_key: String,
    pub threshold_ms: i64,
    pub transit_start_unix: f64,
    pub transit_end_unix: f64,
    pub transit_max_speed: f64,
    pub transit_min_speed: f64,
    pub transit_max_magnitude: f64,
    pub transit_min_magnitude: f64,
    pub point_count: i64,
    pub model_version: String,
    pub created_at: f64,
    pub updated_at: f64,
}

/// Attributes a raw sample to the transit it was clustered into.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitLink {
    pub transit_id: i64,
    pub data_rowid: i64,
    pub link_score: f64,
    pub created_at: f64,
}

/// Static site identity. Never deleted by any operation in this crate;
/// sites are seeded by the baseline migration and otherwise managed by
/// the (out-of-scope) admin surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: i64,
    pub name: String,
    pub location: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub map_metadata: Option<String>,
}

/// The cosine-correction angle (and any future per-site tunable), shared
/// by reference across any number of `SiteConfigPeriod`s.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SiteVariableConfig {
    pub id: i64,
    pub cosine_error_angle: f64,
}

/// A half-open, non-overlapping effective period during which one
/// `SiteVariableConfig` governs a site's rollups. See `config_timeline`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SiteConfigPeriod {
    pub id: i64,
    pub site_id: i64,
    pub site_variable_config_id: Option<i64>,
    pub effective_start_unix: f64,
    pub effective_end_unix: Option<f64>,
    pub is_active: bool,
    pub notes: Option<String>,
    pub cosine_error_angle: f64,
}

/// An opaque background-grid blob plus metadata; content identity is
/// `SHA-256(grid_blob)`. See `snapshot`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BgSnapshot {
    pub snapshot_id: i64,
    pub sensor_id: i64,
    pub grid_blob: Vec<u8>,
    pub created_at: f64,
}

/// Metadata for a generated report (§4.9). CRUD only; no algorithmic
/// content. See `report_catalog`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub id: i64,
    pub site_id: Option<i64>,
    pub kind: String,
    pub period_start_unix: f64,
    pub period_end_unix: f64,
    pub file_path: String,
    pub created_at: f64,
}
