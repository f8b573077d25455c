/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Small helpers shared by every component that touches the SQLite
//! connection. Upstream this lives in a sibling `sql-support` crate
//! (`components/support/sql`); here it's an internal module since this
//! repository ships a single component.

mod conn_ext;
mod lazy_db;
pub mod open_database;

pub use conn_ext::ConnExt;
pub use lazy_db::LazyDb;
