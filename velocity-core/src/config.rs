/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::path::PathBuf;

/// Entry-point configuration for the whole core.
///
/// The spec's source carries `DevMode` as process-wide state; we pass it
/// through explicitly instead (see SPEC_FULL.md §7.3 / §9's open question).
#[derive(Clone, Debug)]
pub struct VelocityConfig {
    /// Path to the SQLite file. Use `":memory:"` or a shared-cache `file:`
    /// URI for tests.
    pub db_path: PathBuf,

    /// When `true`:
    ///   - migrations are read from `migrations_dir` on disk instead of the
    ///     binary's embedded copy, so edits take effect without a rebuild;
    ///   - the schema-consistency cache (§4.2.3) is bypassed and re-run on
    ///     every `Store::open`.
    pub dev_mode: bool,

    /// Only consulted when `dev_mode` is true.
    pub migrations_dir: Option<PathBuf>,

    /// Whether `Store::open` should refuse to proceed when the ledger shows
    /// pending migrations (`ErrPendingMigrations`). Operators running the
    /// migration CLI itself set this to `false`.
    pub check_migrations: bool,
}

impl VelocityConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            dev_mode: false,
            migrations_dir: None,
            check_migrations: true,
        }
    }

    pub fn dev(db_path: impl Into<PathBuf>, migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            dev_mode: true,
            migrations_dir: Some(migrations_dir.into()),
            check_migrations: true,
        }
    }
}
