/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A small "open a versioned SQLite database" helper, modeled on
//! `sql-support::open_database`'s `ConnectionInitializer` trait.
//!
//! `velocity-core`'s real schema lifecycle (§4.2 `MigrationEngine`) is
//! richer than this — it tracks an operator-visible ledger table with a
//! `dirty` flag rather than `PRAGMA user_version`, and supports baselining
//! a pre-existing legacy database. This module is instead used by
//! `MigrationEngine` itself, to build disposable *scratch* databases (one
//! per known schema version) that it diffs against a live database when
//! detecting a legacy baseline or validating that the migration path
//! agrees with the flat `schema.sql` (§4.2 steps 3 and 4).

use std::path::Path;

use rusqlite::{Connection, OpenFlags, Transaction};

use crate::error::{Error, Result};

/// Implemented once per schema family. `init` creates a brand-new (empty)
/// database straight to `END_VERSION` in one shot; `upgrade_from(v)`
/// advances a database sitting at version `v` to version `v + 1`.
pub trait ConnectionInitializer {
    const NAME: &'static str;
    const END_VERSION: u32;

    /// Runs outside any transaction, immediately after opening. Used for
    /// pragmas and scalar function registration.
    fn prepare(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }

    /// Initializes a brand-new (empty) database straight to `END_VERSION`.
    fn init(&self, db: &Transaction<'_>) -> Result<()>;

    /// Upgrades a database sitting at `version` to `version + 1`.
    fn upgrade_from(&self, db: &Transaction<'_>, version: u32) -> Result<()>;

    /// Runs once, outside any transaction, after init/upgrade has brought
    /// the database to `END_VERSION`.
    fn finish(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }
}

fn get_user_version(conn: &Connection) -> Result<u32> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn set_user_version(conn: &Connection, version: u32) -> Result<()> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

fn db_is_empty(conn: &Connection) -> Result<bool> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'", [], |row| {
        row.get(0)
    })?;
    Ok(count == 0)
}

/// Opens (creating if needed) the database at `path` with `flags`, and
/// brings it to `CI::END_VERSION` via `ci.init()` (if empty) or a chain of
/// `ci.upgrade_from()` calls (if not). Used by [`crate::sql_support::LazyDb`]
/// for every real connection `velocity-core` opens — reader and writer
/// alike — mirroring how `suggest`'s and `relevancy`'s `LazyDb` instances
/// each carry their own `ConnectionInitializer`.
pub fn open_database_with_flags<CI: ConnectionInitializer>(
    path: impl AsRef<Path>,
    flags: OpenFlags,
    ci: &CI,
) -> Result<Connection> {
    let mut conn = Connection::open_with_flags(path, flags)?;
    ci.prepare(&conn)?;

    let empty = db_is_empty(&conn)?;
    let tx = conn.transaction().map_err(|e| Error::sql(e, CI::NAME))?;
    if empty {
        ci.init(&tx)?;
        tx.commit().map_err(|e| Error::sql(e, CI::NAME))?;
        set_user_version(&conn, CI::END_VERSION)?;
    } else {
        let mut version = get_user_version(&tx)?;
        if version > CI::END_VERSION {
            return Err(Error::Internal(format!(
                "{} is at version {version}, newer than this build supports ({})",
                CI::NAME,
                CI::END_VERSION
            )));
        }
        while version < CI::END_VERSION {
            ci.upgrade_from(&tx, version)?;
            version += 1;
        }
        tx.commit().map_err(|e| Error::sql(e, CI::NAME))?;
        set_user_version(&conn, version)?;
    }
    ci.finish(&conn)?;
    Ok(conn)
}

/// Opens an in-memory scratch database and runs `ci` against it, starting
/// from version 0 (fresh) and walking every `upgrade_from` step up to
/// `upgrade_to` (which must be `<= CI::END_VERSION`). This is how
/// `MigrationEngine` reconstructs "what would the migrations path produce
/// at version N" for comparison purposes.
pub fn build_scratch_at_version<CI: ConnectionInitializer>(
    ci: &CI,
    upgrade_to: u32,
) -> Result<Connection> {
    let mut conn = Connection::open_in_memory_with_flags(OpenFlags::default())?;
    ci.prepare(&conn)?;
    let tx = conn.transaction().map_err(|e| Error::sql(e, CI::NAME))?;
    // Start from an empty v0 database: `upgrade_from(0)` is expected to
    // create the original tables, matching the style of
    // `AutofillConnectionInitializer::upgrade_from` where version 0 is a
    // real (if odd) starting point.
    let mut version = 0u32;
    while version < upgrade_to {
        ci.upgrade_from(&tx, version)?;
        version += 1;
    }
    tx.commit().map_err(|e| Error::sql(e, CI::NAME))?;
    set_user_version(&conn, version)?;
    Ok(conn)
}

/// Opens a fresh in-memory database initialized straight to
/// `CI::END_VERSION` via `ci.init()`, bypassing the step-by-step upgrades.
/// Used to validate that the flat `schema.sql` and the migrations path
/// produce the same schema (§4.2 step 4).
pub fn build_scratch_fresh<CI: ConnectionInitializer>(ci: &CI) -> Result<Connection> {
    let mut conn = Connection::open_in_memory_with_flags(OpenFlags::default())?;
    ci.prepare(&conn)?;
    let tx = conn.transaction().map_err(|e| Error::sql(e, CI::NAME))?;
    ci.init(&tx)?;
    tx.commit().map_err(|e| Error::sql(e, CI::NAME))?;
    set_user_version(&conn, CI::END_VERSION)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestInit;

    impl ConnectionInitializer for TestInit {
        const NAME: &'static str = "test db";
        const END_VERSION: u32 = 2;

        fn init(&self, db: &Transaction<'_>) -> Result<()> {
            db.execute_batch("CREATE TABLE t(a, b);")?;
            Ok(())
        }

        fn upgrade_from(&self, db: &Transaction<'_>, version: u32) -> Result<()> {
            match version {
                0 => db.execute_batch("CREATE TABLE t(a);").map_err(Into::into),
                1 => db
                    .execute_batch("ALTER TABLE t ADD COLUMN b;")
                    .map_err(Into::into),
                _ => Err(Error::Internal(format!("no upgrade from {version}"))),
            }
        }
    }

    #[test]
    fn scratch_fresh_and_upgraded_agree_on_user_version() {
        let fresh = build_scratch_fresh(&TestInit).unwrap();
        let upgraded = build_scratch_at_version(&TestInit, TestInit::END_VERSION).unwrap();
        assert_eq!(get_user_version(&fresh).unwrap(), 2);
        assert_eq!(get_user_version(&upgraded).unwrap(), 2);
    }
}
