/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The embedded migration set and the flat `schema.sql` a fresh database
//! should end at. `dev_mode` (§7.3) reads the same files from
//! `migrations_dir` on disk instead, so edits take effect without a
//! rebuild; see [`load_dev_steps`].

use std::path::Path;

use rusqlite::Transaction;

use crate::error::{Error, Result};
use crate::sql_support::open_database::ConnectionInitializer;

pub struct MigrationStep {
    pub version: u32,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

pub const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

const EMBEDDED_STEPS: &[MigrationStep] = &[
    MigrationStep {
        version: 1,
        name: "initial",
        up_sql: include_str!("../../sql/migrations/000001_initial.up.sql"),
        down_sql: include_str!("../../sql/migrations/000001_initial.down.sql"),
    },
    MigrationStep {
        version: 2,
        name: "radar",
        up_sql: include_str!("../../sql/migrations/000002_radar.up.sql"),
        down_sql: include_str!("../../sql/migrations/000002_radar.down.sql"),
    },
    MigrationStep {
        version: 3,
        name: "transits",
        up_sql: include_str!("../../sql/migrations/000003_transits.up.sql"),
        down_sql: include_str!("../../sql/migrations/000003_transits.down.sql"),
    },
    MigrationStep {
        version: 4,
        name: "snapshots",
        up_sql: include_str!("../../sql/migrations/000004_snapshots.up.sql"),
        down_sql: include_str!("../../sql/migrations/000004_snapshots.down.sql"),
    },
    MigrationStep {
        version: 5,
        name: "report_catalog",
        up_sql: include_str!("../../sql/migrations/000005_report_catalog.up.sql"),
        down_sql: include_str!("../../sql/migrations/000005_report_catalog.down.sql"),
    },
];

pub const LATEST_VERSION: u32 = EMBEDDED_STEPS.len() as u32;

/// An owned counterpart to [`EMBEDDED_STEPS`], used in `dev_mode` to read
/// migrations from disk on every open instead of the binary's embedded
/// copy.
pub struct OwnedMigrationStep {
    pub version: u32,
    pub name: String,
    pub up_sql: String,
    pub down_sql: String,
}

/// Reads `NNNNNN_<name>.up.sql` / `.down.sql` pairs from `dir`, sorted by
/// the numeric prefix. Used only when `VelocityConfig::dev_mode` is set.
pub fn load_dev_steps(dir: &Path) -> Result<Vec<OwnedMigrationStep>> {
    let mut ups: Vec<(u32, String, std::path::PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        let Some(rest) = file_name.strip_suffix(".up.sql") else {
            continue;
        };
        let Some((version_str, name)) = rest.split_once('_') else {
            continue;
        };
        let version: u32 = version_str
            .parse()
            .map_err(|_| Error::Internal(format!("bad migration file name: {file_name}")))?;
        ups.push((version, name.to_string(), entry.path()));
    }
    ups.sort_by_key(|(version, ..)| *version);

    let mut steps = Vec::with_capacity(ups.len());
    for (version, name, up_path) in ups {
        let up_sql = std::fs::read_to_string(&up_path)?;
        let down_path = up_path.with_file_name(format!("{version:06}_{name}.down.sql"));
        let down_sql = std::fs::read_to_string(&down_path)?;
        steps.push(OwnedMigrationStep {
            version,
            name,
            up_sql,
            down_sql,
        });
    }
    Ok(steps)
}

pub fn embedded_steps() -> &'static [MigrationStep] {
    EMBEDDED_STEPS
}

/// Replays the embedded migration set (version 0 = empty database) via
/// the generic [`ConnectionInitializer`] protocol, so that
/// [`crate::sql_support::open_database::build_scratch_at_version`] and
/// [`crate::sql_support::open_database::build_scratch_fresh`] can build
/// disposable comparison databases for §4.2's baseline detection and
/// consistency check.
pub struct MigrationsConnectionInitializer;

impl ConnectionInitializer for MigrationsConnectionInitializer {
    const NAME: &'static str = "velocity schema";
    const END_VERSION: u32 = LATEST_VERSION;

    fn init(&self, db: &Transaction<'_>) -> Result<()> {
        db.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn upgrade_from(&self, db: &Transaction<'_>, version: u32) -> Result<()> {
        let step = EMBEDDED_STEPS
            .get(version as usize)
            .ok_or_else(|| Error::Internal(format!("no migration step at version {version}")))?;
        db.execute_batch(step.up_sql)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_steps_are_numbered_consecutively_from_one() {
        let steps = embedded_steps();
        for (i, step) in steps.iter().enumerate() {
            assert_eq!(step.version, (i + 1) as u32);
        }
        assert_eq!(LATEST_VERSION, steps.len() as u32);
    }
}
