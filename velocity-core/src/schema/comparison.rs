/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Catalog-level schema comparison (§4.2.2). Operates purely on
//! `sqlite_master` text, never on row data: two databases are "the same
//! schema" if every table, index, and trigger definition matches
//! byte-for-byte after whitespace normalization.

use std::collections::BTreeMap;
use std::fmt;

use rusqlite::Connection;

use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SchemaEntity {
    pub kind: String,
    pub name: String,
    pub sql: String,
}

/// The outcome of comparing a live database's schema against a reference
/// (either the flat `schema.sql` or a scratch database replayed from
/// migrations). `score` is the percentage of reference entities present
/// in the live database with an exactly matching definition.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct SchemaDiff {
    pub score: u8,
    /// Present in the live database, absent from the reference.
    pub added: Vec<SchemaEntity>,
    /// Present in the reference, absent from the live database.
    pub missing: Vec<SchemaEntity>,
    /// Present in both, but with a different definition. `(live, reference)`.
    pub changed: Vec<(SchemaEntity, SchemaEntity)>,
}

impl SchemaDiff {
    pub fn is_exact_match(&self) -> bool {
        self.score == 100
    }
}

impl fmt::Display for SchemaDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "score={} added={} missing={} changed={}",
            self.score,
            self.added.len(),
            self.missing.len(),
            self.changed.len()
        )?;
        for e in &self.added {
            write!(f, "; +{} {}", e.kind, e.name)?;
        }
        for e in &self.missing {
            write!(f, "; -{} {}", e.kind, e.name)?;
        }
        for (live, reference) in &self.changed {
            write!(
                f,
                "; ~{} {} (live != reference, {} vs {} bytes)",
                live.kind,
                live.name,
                live.sql.len(),
                reference.sql.len()
            )?;
        }
        Ok(())
    }
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn catalog_entities(conn: &Connection) -> Result<BTreeMap<(String, String), SchemaEntity>> {
    let mut stmt = conn.prepare(
        "SELECT type, name, sql FROM sqlite_master \
         WHERE type IN ('table', 'index', 'trigger') \
           AND name NOT LIKE 'sqlite_%' \
           AND sql IS NOT NULL",
    )?;
    let rows = stmt.query_map([], |row| {
        let kind: String = row.get(0)?;
        let name: String = row.get(1)?;
        let sql: String = row.get(2)?;
        Ok(((kind.clone(), name.clone()), SchemaEntity { kind, name, sql: normalize(&sql) }))
    })?;
    let mut out = BTreeMap::new();
    for row in rows {
        let (key, entity) = row?;
        out.insert(key, entity);
    }
    Ok(out)
}

/// Compares `live`'s schema against `reference`'s. See module docs for
/// the semantics of `added`/`missing`/`changed`.
pub fn compare_schema(live: &Connection, reference: &Connection) -> Result<SchemaDiff> {
    let live_entities = catalog_entities(live)?;
    let reference_entities = catalog_entities(reference)?;

    let mut added = Vec::new();
    let mut missing = Vec::new();
    let mut changed = Vec::new();
    let mut matched = 0usize;

    for (key, live_entity) in &live_entities {
        match reference_entities.get(key) {
            None => added.push(live_entity.clone()),
            Some(reference_entity) => {
                if reference_entity.sql == live_entity.sql {
                    matched += 1;
                } else {
                    changed.push((live_entity.clone(), reference_entity.clone()));
                }
            }
        }
    }
    for (key, reference_entity) in &reference_entities {
        if !live_entities.contains_key(key) {
            missing.push(reference_entity.clone());
        }
    }

    let score = if reference_entities.is_empty() {
        100
    } else {
        ((matched * 100) / reference_entities.len()) as u8
    };

    Ok(SchemaDiff {
        score,
        added,
        missing,
        changed,
    })
}
