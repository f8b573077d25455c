/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use rusqlite::{types::FromSql, Connection, Result as SqlResult, Transaction};

/// This trait exists so that we can use these helpers on both
/// `rusqlite::Connection` and `rusqlite::Transaction`. You must import it
/// to call these methods on anything.
pub trait ConnExt {
    fn conn(&self) -> &Connection;

    /// Execute every statement in `stmts` in order, with no parameters.
    fn execute_all(&self, stmts: &[&str]) -> SqlResult<()> {
        for sql in stmts {
            self.conn().execute(sql, [])?;
        }
        Ok(())
    }

    /// Run a query that returns a single row with a single column, and
    /// return that value.
    fn query_one<T: FromSql>(&self, sql: &str) -> SqlResult<T> {
        self.conn().query_row(sql, [], |row| row.get(0))
    }

    /// Like [`ConnExt::query_one`], but returns `None` instead of erroring
    /// when the query returns no rows.
    fn try_query_one<T: FromSql>(&self, sql: &str) -> SqlResult<Option<T>> {
        match self.conn().query_row(sql, [], |row| row.get(0)) {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Whether a table or temp table with this name exists.
    fn table_exists(&self, name: &str) -> SqlResult<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

impl ConnExt for Connection {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

impl ConnExt for Transaction<'_> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}
