/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Cooperative cancellation for long-running queries, modeled on
//! `places`' `PlacesInterruptHandle`/`InterruptScope`.
//!
//! SQLite's own `sqlite3_interrupt` is connection-wide and one-shot: once
//! fired it keeps cancelling every statement on that connection until
//! explicitly cleared, which doesn't compose with a connection that's
//! reused by many independent operations (as `LazyDb` reuses `writer` and
//! `reader`). So interruption here is layered on top: a shared generation
//! counter plus SQLite's interrupt as the actual wakeup mechanism.
//!
//! `SqlInterruptHandle::interrupt()` bumps the counter *and* calls
//! `sqlite3_interrupt`, unblocking whatever statement is currently
//! executing. Every `SqlInterruptScope` created afterwards samples the
//! counter at creation time, so `was_interrupted()` only reports `true`
//! for scopes that existed at (or before) the moment of the interrupt;
//! new operations starting after `interrupt()` was called observe the
//! bumped value immediately and refuse to run at all, without needing a
//! second `sqlite3_interrupt` call.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use rusqlite::{Connection, InterruptHandle};

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct SqlInterruptHandle {
    db_handle: InterruptHandle,
    generation: Arc<AtomicUsize>,
}

impl SqlInterruptHandle {
    pub fn new(conn: &Connection) -> Self {
        Self {
            db_handle: conn.get_interrupt_handle(),
            generation: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Interrupts any statement currently running on the wrapped
    /// connection, and marks every `SqlInterruptScope` created before this
    /// call (and not yet completed) as cancelled.
    pub fn interrupt(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.db_handle.interrupt();
    }

    pub fn begin_scope(&self) -> SqlInterruptScope {
        SqlInterruptScope::new(self.generation.clone())
    }
}

/// A token sampled at the start of an operation. Cheap to check
/// repeatedly inside a long loop (e.g. between rows of a large clustering
/// pass).
#[derive(Clone)]
pub struct SqlInterruptScope {
    start_value: usize,
    generation: Arc<AtomicUsize>,
}

impl SqlInterruptScope {
    pub fn new(generation: Arc<AtomicUsize>) -> Self {
        let start_value = generation.load(Ordering::SeqCst);
        Self {
            start_value,
            generation,
        }
    }

    /// A scope that can never be interrupted. Useful for one-off
    /// connections (e.g. scratch databases in `schema::comparison`) that
    /// aren't reachable through `LazyDb`.
    pub fn dummy() -> Self {
        Self::new(Arc::new(AtomicUsize::new(0)))
    }

    pub fn was_interrupted(&self) -> bool {
        self.generation.load(Ordering::SeqCst) != self.start_value
    }

    pub fn err_if_interrupted(&self) -> Result<()> {
        if self.was_interrupted() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
