/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::schema::comparison::SchemaDiff;

/// The error type for all `velocity-core` operations.
///
/// This is the only error type the crate exposes: unlike an FFI-facing
/// component (which splits an internal error from a simplified external
/// one), `velocity-core` is consumed directly by other Rust code, so
/// callers get the full detail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("not found")]
    NotFound,

    #[error("site config period overlaps an existing period")]
    Overlap,

    #[error("cannot modify a system-owned record")]
    SystemPreset,

    #[error("database has pending migrations; run `migrate up` (ledger at {current}, latest is {latest})")]
    PendingMigrations { current: u32, latest: u32 },

    #[error("schema drift detected at version {version}: {diffs}")]
    SchemaDrift { version: u32, diffs: SchemaDiff },

    #[error("schema produced by fresh init does not match the schema the migration path produces: {0}")]
    SchemaOutOfSync(SchemaDiff),

    #[error("migrations ledger is dirty; a previous migration step failed and must be resolved manually")]
    MigrationDirty,

    #[error("database busy")]
    Busy,

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("sql error: {inner} (context: {context})")]
    Sql {
        inner: rusqlite::Error,
        context: String,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn sql(e: rusqlite::Error, context: impl Into<String>) -> Self {
        Self::Sql {
            inner: e,
            context: context.into(),
        }
    }

    pub(crate) fn bad_input(msg: impl Into<String>) -> Self {
        Self::BadInput(msg.into())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        if matches!(
            e,
            rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error {
                    code: rusqlite::ffi::ErrorCode::DatabaseBusy,
                    ..
                },
                _
            )
        ) {
            return Self::Busy;
        }
        Self::sql(e, "<none>")
    }
}

/// Convenience extension so call sites can attach SQL context without a
/// verbose `.map_err(|e| Error::sql(e, "..."))` at every call.
pub(crate) trait RusqliteResultExt<T> {
    fn with_context(self, context: &str) -> Result<T>;
}

impl<T> RusqliteResultExt<T> for std::result::Result<T, rusqlite::Error> {
    fn with_context(self, context: &str) -> Result<T> {
        self.map_err(|e| Error::sql(e, context))
    }
}
