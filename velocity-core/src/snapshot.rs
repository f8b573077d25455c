/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Content-addressed background-grid snapshot storage (§4.8). Identity
//! is `SHA-256(grid_blob)`; duplicate detection loads every blob for a
//! sensor and hashes it in memory, rather than maintaining a hash
//! column, since snapshots are written rarely and pruned in bulk.

use rusqlite::params;
use sha2::{Digest, Sha256};

use crate::clock::now_unix;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::BgSnapshot;

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<BgSnapshot> {
    Ok(BgSnapshot {
        snapshot_id: row.get("snapshot_id")?,
        sensor_id: row.get("sensor_id")?,
        grid_blob: row.get("grid_blob")?,
        created_at: row.get("created_at")?,
    })
}

const SELECT_COLUMNS: &str = "snapshot_id, sensor_id, grid_blob, created_at";

fn hash_of(blob: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(blob);
    hasher.finalize().into()
}

/// One group of snapshots sharing a content hash, as returned by
/// [`SnapshotStore::find_duplicates`].
#[derive(Clone, Debug, PartialEq)]
pub struct DuplicateGroup {
    pub keep_id: i64,
    pub delete_ids: Vec<i64>,
}

impl DuplicateGroup {
    pub fn count(&self) -> usize {
        self.delete_ids.len() + 1
    }
}

pub struct SnapshotStore<'a> {
    store: &'a Store,
}

impl<'a> SnapshotStore<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn insert(&self, sensor_id: i64, grid_blob: &[u8]) -> Result<i64> {
        let created_at = now_unix();
        self.store.write(|conn, _scope| {
            conn.execute(
                "INSERT INTO bg_snapshots (sensor_id, grid_blob, created_at) VALUES (?1, ?2, ?3)",
                params![sensor_id, grid_blob, created_at],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_by_id(&self, id: i64) -> Result<BgSnapshot> {
        self.store
            .read(|conn| {
                use rusqlite::OptionalExtension;
                conn.query_row(&format!("SELECT {SELECT_COLUMNS} FROM bg_snapshots WHERE snapshot_id = ?"), [id], row_to_snapshot)
                    .optional()
                    .map_err(Into::into)
            })?
            .ok_or(Error::NotFound)
    }

    pub fn get_latest(&self, sensor_id: i64) -> Result<Option<BgSnapshot>> {
        self.store.read(|conn| {
            use rusqlite::OptionalExtension;
            conn.query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM bg_snapshots WHERE sensor_id = ? ORDER BY snapshot_id DESC LIMIT 1"),
                [sensor_id],
                row_to_snapshot,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn list_recent(&self, sensor_id: i64, limit: i64) -> Result<Vec<BgSnapshot>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM bg_snapshots WHERE sensor_id = ? ORDER BY snapshot_id DESC LIMIT ?"
            ))?;
            let rows = stmt
                .query_map(params![sensor_id, limit], row_to_snapshot)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn load_all(&self, sensor_id: i64) -> Result<Vec<BgSnapshot>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM bg_snapshots WHERE sensor_id = ? ORDER BY snapshot_id ASC"
            ))?;
            let rows = stmt
                .query_map([sensor_id], row_to_snapshot)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Hashes every blob for `sensor_id` and returns the number of
    /// distinct hashes observed.
    pub fn count_unique_hashes(&self, sensor_id: i64) -> Result<usize> {
        let snapshots = self.load_all(sensor_id)?;
        let hashes: std::collections::HashSet<[u8; 32]> = snapshots.iter().map(|s| hash_of(&s.grid_blob)).collect();
        Ok(hashes.len())
    }

    /// Groups snapshots sharing a hash (size >= 2 only), keeping the
    /// oldest `snapshot_id` per group as `keep_id`.
    pub fn find_duplicates(&self, sensor_id: i64) -> Result<Vec<DuplicateGroup>> {
        let snapshots = self.load_all(sensor_id)?;
        let mut by_hash: std::collections::HashMap<[u8; 32], Vec<i64>> = std::collections::HashMap::new();
        for snapshot in &snapshots {
            by_hash.entry(hash_of(&snapshot.grid_blob)).or_default().push(snapshot.snapshot_id);
        }
        let mut groups: Vec<DuplicateGroup> = by_hash
            .into_values()
            .filter(|ids| ids.len() >= 2)
            .map(|mut ids| {
                ids.sort();
                let keep_id = ids.remove(0);
                DuplicateGroup { keep_id, delete_ids: ids }
            })
            .collect();
        groups.sort_by_key(|g| g.keep_id);
        Ok(groups)
    }

    /// Deletes every non-keep snapshot from every duplicate group,
    /// returning the number of rows deleted.
    pub fn delete_duplicates(&self, sensor_id: i64) -> Result<usize> {
        let groups = self.find_duplicates(sensor_id)?;
        let ids: Vec<i64> = groups.into_iter().flat_map(|g| g.delete_ids).collect();
        if ids.is_empty() {
            return Ok(0);
        }
        self.store.write_tx(|tx, _scope| {
            let mut deleted = 0usize;
            for id in ids {
                deleted += tx.execute("DELETE FROM bg_snapshots WHERE snapshot_id = ?", [id])?;
            }
            Ok(deleted)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VelocityConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_store() -> Store {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        Store::open(VelocityConfig::new(format!("file:snapshot_test_{n}?mode=memory&cache=shared"))).unwrap()
    }

    #[test]
    fn insert_then_get_by_id_round_trips() {
        let store = test_store();
        let snapshots = SnapshotStore::new(&store);
        let id = snapshots.insert(1, b"grid-data").unwrap();
        let fetched = snapshots.get_by_id(id).unwrap();
        assert_eq!(fetched.grid_blob, b"grid-data");
    }

    #[test]
    fn get_latest_picks_highest_snapshot_id() {
        let store = test_store();
        let snapshots = SnapshotStore::new(&store);
        snapshots.insert(1, b"first").unwrap();
        let second = snapshots.insert(1, b"second").unwrap();
        let latest = snapshots.get_latest(1).unwrap().unwrap();
        assert_eq!(latest.snapshot_id, second);
    }

    #[test]
    fn duplicate_pruning_matches_spec_scenario() {
        let store = test_store();
        let snapshots = SnapshotStore::new(&store);
        // Blob pattern [B1, B1, B2, B1, B3].
        let b1 = b"B1-pattern".to_vec();
        let b2 = b"B2-pattern".to_vec();
        let b3 = b"B3-pattern".to_vec();
        let first_b1 = snapshots.insert(7, &b1).unwrap();
        snapshots.insert(7, &b1).unwrap();
        snapshots.insert(7, &b2).unwrap();
        snapshots.insert(7, &b1).unwrap();
        snapshots.insert(7, &b3).unwrap();

        let groups = snapshots.find_duplicates(7).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].keep_id, first_b1);
        assert_eq!(groups[0].count(), 3);

        let deleted = snapshots.delete_duplicates(7).unwrap();
        assert_eq!(deleted, 2);

        let remaining = snapshots.list_recent(7, 10).unwrap();
        assert_eq!(remaining.len(), 3);
        assert_eq!(snapshots.count_unique_hashes(7).unwrap(), 3);
    }

    #[test]
    fn get_by_id_missing_row_is_not_found() {
        let store = test_store();
        let snapshots = SnapshotStore::new(&store);
        let err = snapshots.get_by_id(9999).unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }
}
