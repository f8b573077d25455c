/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Embedded storage and transit-sessionization core for a traffic-speed
//! surveillance system: an append-only store of radar samples, a
//! greedy online clustering worker that turns them into *transits*
//! (contiguous same-object passages), and a rollup engine that serves
//! time-bucketed speed aggregates with per-period cosine correction.
//!
//! Components, in dependency order: [`store`] owns the single SQLite
//! file; [`schema`] gates every open against the migration ledger;
//! [`config_timeline`], [`ingest`], [`transit`], [`controller`],
//! [`rollup`], [`snapshot`], and [`report_catalog`] are the
//! spec-numbered components (C3-C9) built on top of it.

pub mod clock;
pub mod config;
pub mod config_timeline;
pub mod controller;
pub mod error;
pub mod ingest;
pub mod interrupt;
pub mod report_catalog;
pub mod rollup;
pub mod schema;
pub mod snapshot;
pub mod speed;
pub mod sql_support;
pub mod store;
pub mod transit;
pub mod types;

pub use config::VelocityConfig;
pub use error::{Error, Result};
pub use store::Store;
