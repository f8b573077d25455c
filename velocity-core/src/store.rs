/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The embedded single-file relational store (§4.1). Owns the file
//! handle; every other component borrows a connection from here.
//!
//! Grounded on `RelevancyDb`/`SuggestDb`'s split between a single writer
//! connection (serialized behind a mutex) and read-only connections
//! opened per call site, the way `PlacesDb::ConnectionType` distinguishes
//! `ReadOnly` from `ReadWrite`.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, Transaction};

use crate::config::VelocityConfig;
use crate::error::{Error, Result};
use crate::interrupt::SqlInterruptScope;
use crate::schema;
use crate::sql_support::open_database::{open_database_with_flags, ConnectionInitializer};
use crate::sql_support::LazyDb;

fn writer_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_READ_WRITE
}

fn reader_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_READ_ONLY
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "busy_timeout", 5_000)?;
    Ok(())
}

/// The writer connection's `ConnectionInitializer`: applies the pragma
/// set (§4.1) in `prepare`, then runs the migration open-time protocol
/// (§4.2) in `finish`, once the connection exists. `END_VERSION` is 0 —
/// this initializer owns no schema of its own, so `init`/`upgrade_from`
/// are never reached.
struct WriterInit {
    dev_mode: bool,
    migrations_dir: Option<PathBuf>,
    gate_pending: bool,
}

impl ConnectionInitializer for WriterInit {
    const NAME: &'static str = "velocity store (writer)";
    const END_VERSION: u32 = 0;

    fn prepare(&self, conn: &Connection) -> Result<()> {
        apply_pragmas(conn)
    }

    fn init(&self, _db: &Transaction<'_>) -> Result<()> {
        Ok(())
    }

    fn upgrade_from(&self, _db: &Transaction<'_>, version: u32) -> Result<()> {
        Err(Error::Internal(format!("writer connection has no schema of its own (version {version})")))
    }

    fn finish(&self, conn: &Connection) -> Result<()> {
        let source = schema::SchemaSource::resolve(self.dev_mode, self.migrations_dir.as_deref())?;
        schema::ensure_ready(conn, &source, self.gate_pending)
    }
}

/// The reader connections' `ConnectionInitializer`: pragmas only. Schema
/// readiness was already established by the writer at `Store::open`
/// time, so readers don't re-run `schema::ensure_ready`.
struct ReaderInit;

impl ConnectionInitializer for ReaderInit {
    const NAME: &'static str = "velocity store (reader)";
    const END_VERSION: u32 = 0;

    fn prepare(&self, conn: &Connection) -> Result<()> {
        apply_pragmas(conn)
    }

    fn init(&self, _db: &Transaction<'_>) -> Result<()> {
        Ok(())
    }

    fn upgrade_from(&self, _db: &Transaction<'_>, version: u32) -> Result<()> {
        Err(Error::Internal(format!("reader connection has no schema of its own (version {version})")))
    }
}

pub struct Store {
    writer: LazyDb<WriterInit>,
    path: PathBuf,
}

impl Store {
    /// Opens (creating if needed) the database at `config.db_path`,
    /// running the full open-time protocol against the writer
    /// connection immediately — migration-gate errors are fatal at open
    /// time (§7 policy), so they surface here rather than on first use.
    pub fn open(config: VelocityConfig) -> Result<Self> {
        let writer = LazyDb::new(
            &config.db_path,
            writer_flags(),
            WriterInit {
                dev_mode: config.dev_mode,
                migrations_dir: config.migrations_dir.clone(),
                gate_pending: config.check_migrations,
            },
        );
        writer.lock()?;
        Ok(Self {
            writer,
            path: config.db_path,
        })
    }

    /// Runs `op` against the writer connection without an explicit
    /// transaction (for single-statement operations that rely on
    /// SQLite's implicit auto-commit, e.g. `RadarIngest`).
    pub fn write<T>(&self, op: impl FnOnce(&Connection, &SqlInterruptScope) -> Result<T>) -> Result<T> {
        let (conn, scope) = self.writer.lock()?;
        scope.err_if_interrupted()?;
        op(&conn, &scope)
    }

    /// Runs `op` inside a transaction on the writer connection, committing
    /// on success and rolling back (via `Transaction`'s `Drop`) on error.
    pub fn write_tx<T>(
        &self,
        op: impl FnOnce(&Transaction<'_>, &SqlInterruptScope) -> Result<T>,
    ) -> Result<T> {
        let (mut conn, scope) = self.writer.lock()?;
        scope.err_if_interrupted()?;
        let tx = conn.transaction().map_err(|e| Error::sql(e, "write_tx"))?;
        let result = op(&tx, &scope)?;
        tx.commit().map_err(|e| Error::sql(e, "write_tx"))?;
        Ok(result)
    }

    /// Opens a fresh read-only connection and runs `op` against it. One
    /// connection per call site, matching `PlacesDb::ConnectionType`: WAL
    /// mode means this never blocks on the writer.
    pub fn read<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = open_database_with_flags(&self.path, reader_flags(), &ReaderInit)?;
        op(&conn)
    }

    pub fn interrupt(&self) {
        self.writer.interrupt();
    }

    /// Releases the writer's file descriptor (and, transitively, the WAL
    /// sidecar files once every reader has also closed).
    pub fn close(&self) {
        self.writer.close(true);
    }

    /// Streams a consistent snapshot of the database to `dest` via
    /// `VACUUM INTO`, which (unlike a raw file copy) is safe to run
    /// concurrently with writers.
    pub fn backup_to(&self, dest: &Path) -> Result<()> {
        if dest.exists() {
            return Err(Error::bad_input(format!(
                "backup destination already exists: {}",
                dest.display()
            )));
        }
        self.write(|conn, _scope| {
            conn.execute("VACUUM INTO ?", [dest.to_string_lossy().to_string()])?;
            Ok(())
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
