/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! `LazyDb`: a connection that isn't actually opened (and migrated) until
//! the first time it's locked. Grounded on how `relevancy`'s `RelevancyDb`
//! wraps two of these (one reader, one writer) rather than eagerly
//! opening both at construction time.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags};

use super::open_database::{open_database_with_flags, ConnectionInitializer};
use crate::error::{Error, Result};
use crate::interrupt::{SqlInterruptHandle, SqlInterruptScope};

struct LazyDbInner {
    conn: Mutex<Connection>,
    interrupt_handle: SqlInterruptHandle,
}

/// A database connection that's opened (and brought up to the current
/// schema) on first use, then held open for the lifetime of the owning
/// `Store`.
pub struct LazyDb<CI> {
    path: PathBuf,
    open_flags: OpenFlags,
    initializer: CI,
    inner: OnceCell<LazyDbInner>,
    closed: std::sync::atomic::AtomicBool,
}

impl<CI: ConnectionInitializer> LazyDb<CI> {
    pub fn new(path: impl AsRef<Path>, open_flags: OpenFlags, initializer: CI) -> Self {
        Self {
            path: path.as_ref().to_owned(),
            open_flags,
            initializer,
            inner: OnceCell::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn get_inner(&self) -> Result<&LazyDbInner> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Internal("database handle is closed".into()));
        }
        self.inner.get_or_try_init(|| {
            let conn = open_database_with_flags(&self.path, self.open_flags, &self.initializer)?;
            let interrupt_handle = SqlInterruptHandle::new(&conn);
            Ok(LazyDbInner {
                conn: Mutex::new(conn),
                interrupt_handle,
            })
        })
    }

    /// Locks the connection and returns a scope sampled against its
    /// interrupt handle's current generation.
    pub fn lock(&self) -> Result<(MutexGuard<'_, Connection>, SqlInterruptScope)> {
        let inner = self.get_inner()?;
        let scope = inner.interrupt_handle.begin_scope();
        scope.err_if_interrupted()?;
        Ok((inner.conn.lock(), scope))
    }

    pub fn interrupt(&self) {
        if let Some(inner) = self.inner.get() {
            inner.interrupt_handle.interrupt();
        }
    }

    /// Marks the handle closed. If `also_interrupt` is set, any
    /// in-progress statement on this connection is cancelled first.
    pub fn close(&self, also_interrupt: bool) {
        if also_interrupt {
            self.interrupt();
        }
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Transaction;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CounterInit;

    impl ConnectionInitializer for CounterInit {
        const NAME: &'static str = "lazy_db test";
        const END_VERSION: u32 = 1;

        fn init(&self, db: &Transaction<'_>) -> Result<()> {
            db.execute_batch("CREATE TABLE t(x INTEGER);")?;
            Ok(())
        }

        fn upgrade_from(&self, _db: &Transaction<'_>, version: u32) -> Result<()> {
            Err(Error::Internal(format!("no upgrade from {version}")))
        }
    }

    fn test_uri() -> String {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("file:lazy_db_test_{n}?mode=memory&cache=shared")
    }

    #[test]
    fn opens_lazily_and_migrates_once() {
        let flags = OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_READ_WRITE;
        let db = LazyDb::new(test_uri(), flags, CounterInit);
        assert!(db.inner.get().is_none());
        {
            let (conn, _scope) = db.lock().unwrap();
            conn.execute("INSERT INTO t(x) VALUES (1)", []).unwrap();
        }
        assert!(db.inner.get().is_some());
        let (conn, _scope) = db.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn closed_handle_refuses_further_locks() {
        let flags = OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_READ_WRITE;
        let db = LazyDb::new(test_uri(), flags, CounterInit);
        db.lock().unwrap();
        db.close(true);
        assert!(db.lock().is_err());
    }
}
