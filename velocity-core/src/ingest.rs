/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Append-only write paths for raw samples and derived radar-object
//! events (§4.4). Both paths store the caller's JSON verbatim and let
//! SQLite's `GENERATED ALWAYS AS (json_extract(...)) STORED` columns
//! (§4.2 migration `radar`) derive the indexed fields, so the hot write
//! path never parses the payload itself.

use rusqlite::params;

use crate::clock::now_unix;
use crate::error::{Error, Result};
use crate::store::Store;

/// Append-only write paths for `radar_data` and `radar_objects`.
pub struct RadarIngest<'a> {
    store: &'a Store,
}

impl<'a> RadarIngest<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Writes one row to `radar_data`. `raw_json` must be non-empty;
    /// `write_timestamp` is assigned by the server at insert time.
    pub fn record_sample(&self, raw_json: &str) -> Result<i64> {
        if raw_json.trim().is_empty() {
            return Err(Error::bad_input("RecordSample: rawJSON must not be empty"));
        }
        let write_timestamp = now_unix();
        self.store.write(|conn, _scope| {
            conn.execute(
                "INSERT INTO radar_data (write_timestamp, raw_json) VALUES (?1, ?2)",
                params![write_timestamp, raw_json],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Writes one row to `radar_objects`. Same shape as
    /// [`Self::record_sample`]: server-assigned `write_timestamp`,
    /// everything else derived from `raw_json`.
    pub fn record_object(&self, raw_json: &str) -> Result<i64> {
        if raw_json.trim().is_empty() {
            return Err(Error::bad_input("RecordObject: rawJSON must not be empty"));
        }
        let write_timestamp = now_unix();
        self.store.write(|conn, _scope| {
            conn.execute(
                "INSERT INTO radar_objects (write_timestamp, raw_json) VALUES (?1, ?2)",
                params![write_timestamp, raw_json],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }
}
