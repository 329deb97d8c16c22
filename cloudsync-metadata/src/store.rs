use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use cloudsync_types::CoreError;
use cloudsync_types::CoreResult;
use cloudsync_types::Entry;
use cloudsync_types::ItemId;
use cloudsync_types::ItemType;
use parking_lot::Mutex;
use rusqlite::params;
use rusqlite::Connection;
use rusqlite::OptionalExtension;

/// Current on-disk catalog generation. Mirrors spec §6.3's `metadata_v2`
/// bucket; a legacy `metadata` (v1) table found without this marker
/// triggers `CoreError::Permanent("migration required")` rather than a
/// silent upgrade (spec §4.1 Bootstrap, §9 Open Question #1: "implementers
/// should choose the store-only path... accept that pre-migration callers
/// may get NotFound until bootstrap completes").
const SCHEMA_VERSION: i64 = 2;

/// Durable, indexed catalog of `Entry` records plus the misc KV buckets
/// (`delta`, `uploads`, `downloads`) from spec §6.3. Backed by a
/// single-writer embedded SQLite database: readers see committed snapshots,
/// `update()` is serialized per id via an in-process row-lock table so
/// concurrent updates to *different* ids never block each other behind the
/// same mutex (spec §5: "`update` blocks other writers but not readers on
/// other ids").
pub struct MetadataStore {
    conn: Mutex<Connection>,
    row_locks: Mutex<HashMap<ItemId, Arc<Mutex<()>>>>,
}

impl MetadataStore {
    /// Opens (creating if absent) the catalog at `path`. Runs the
    /// invariant sweep described in spec §4.1 ("Crash recovery: on open, an
    /// invariant check sweeps entries; entries referencing a missing parent
    /// are marked orphan (logged; not deleted)").
    pub fn open(path: &Path) -> CoreResult<Self> {
        let conn = Connection::open(path).map_err(sqlite_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=OFF;
             CREATE TABLE IF NOT EXISTS schema_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS entries (
                 id TEXT PRIMARY KEY,
                 parent_id TEXT NOT NULL,
                 data TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS entries_parent_idx ON entries(parent_id);
             CREATE TABLE IF NOT EXISTS kv (
                 bucket TEXT NOT NULL,
                 key TEXT NOT NULL,
                 value TEXT NOT NULL,
                 PRIMARY KEY (bucket, key)
             );",
        )
        .map_err(sqlite_err)?;

        let legacy_present: bool = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name='metadata'",
                [],
                |_| Ok(true),
            )
            .optional()
            .map_err(sqlite_err)?
            .unwrap_or(false);

        let version: Option<i64> = conn
            .query_row(
                "SELECT value FROM schema_meta WHERE key='version'",
                [],
                |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
            )
            .optional()
            .map_err(sqlite_err)?;

        match version {
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(CoreError::Permanent(format!(
                    "catalog schema v{v} is newer than supported v{SCHEMA_VERSION}"
                )))
            }
            None if legacy_present => {
                return Err(CoreError::Permanent(
                    "legacy v1 catalog present; migration to v2 required before continuing"
                        .to_string(),
                ));
            }
            None => {
                conn.execute(
                    "INSERT INTO schema_meta(key, value) VALUES ('version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )
                .map_err(sqlite_err)?;
            }
        }

        let store = Self {
            conn: Mutex::new(conn),
            row_locks: Mutex::new(HashMap::new()),
        };
        store.sweep_orphans()?;
        Ok(store)
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        conn.execute_batch(
            "CREATE TABLE schema_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
             CREATE TABLE entries (id TEXT PRIMARY KEY, parent_id TEXT NOT NULL, data TEXT NOT NULL);
             CREATE INDEX entries_parent_idx ON entries(parent_id);
             CREATE TABLE kv (bucket TEXT NOT NULL, key TEXT NOT NULL, value TEXT NOT NULL, PRIMARY KEY (bucket, key));
             INSERT INTO schema_meta(key, value) VALUES ('version', '2');",
        )
        .map_err(sqlite_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            row_locks: Mutex::new(HashMap::new()),
        })
    }

    fn lock_for(&self, id: &ItemId) -> Arc<Mutex<()>> {
        self.row_locks
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn get(&self, id: &ItemId) -> CoreResult<Entry> {
        let conn = self.conn.lock();
        let data: Option<String> = conn
            .query_row("SELECT data FROM entries WHERE id = ?1", params![id.as_str()], |row| {
                row.get(0)
            })
            .optional()
            .map_err(sqlite_err)?;
        match data {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| CoreError::Permanent(format!("corrupt entry {id}: {e}"))),
            None => Err(CoreError::NotFound(id.to_string())),
        }
    }

    pub fn try_get(&self, id: &ItemId) -> CoreResult<Option<Entry>> {
        match self.get(id) {
            Ok(e) => Ok(Some(e)),
            Err(CoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Unconditional replace. Validates the basic invariants (non-empty id
    /// and name, unless root) before writing.
    pub fn save(&self, entry: &Entry) -> CoreResult<()> {
        if entry.id.is_empty() {
            return Err(CoreError::Permanent("entry id must not be empty".into()));
        }
        if entry.name.is_empty() && !entry.is_root() {
            return Err(CoreError::Permanent("entry name must not be empty".into()));
        }
        let json = serde_json::to_string(entry)
            .map_err(|e| CoreError::Permanent(format!("failed to serialize entry: {e}")))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO entries(id, parent_id, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET parent_id = excluded.parent_id, data = excluded.data",
            params![entry.id.as_str(), entry.parent_id.as_str(), json],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    /// Atomic read-modify-write under a per-id lock. `f` mutates the entry
    /// in place; if it returns `Err`, nothing is persisted (spec §4.1:
    /// "failure rolls back").
    pub fn update(
        &self,
        id: &ItemId,
        f: impl FnOnce(&mut Entry) -> CoreResult<()>,
    ) -> CoreResult<Entry> {
        let lock = self.lock_for(id);
        let _guard = lock.lock();
        let mut entry = self.get(id)?;
        f(&mut entry)?;
        self.save(&entry)?;
        Ok(entry)
    }

    pub fn delete_row(&self, id: &ItemId) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM entries WHERE id = ?1", params![id.as_str()])
            .map_err(sqlite_err)?;
        Ok(())
    }

    pub fn add_child(&self, parent_id: &ItemId, child: &Entry) -> CoreResult<()> {
        self.update(parent_id, |parent| {
            if !parent.children.contains(&child.id) {
                parent.children.push(child.id.clone());
                parent.children.sort();
            }
            parent.subdir_count = self.count_dir_children(&parent.children, Some((&child.id, child.item_type)))?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn remove_child(&self, parent_id: &ItemId, child_id: &ItemId, was_dir: bool) -> CoreResult<()> {
        self.update(parent_id, |parent| {
            parent.children.retain(|c| c != child_id);
            if was_dir {
                parent.subdir_count = parent.subdir_count.saturating_sub(1);
            }
            Ok(())
        })?;
        Ok(())
    }

    pub fn replace_children(&self, parent_id: &ItemId, children: Vec<ItemId>) -> CoreResult<()> {
        self.update(parent_id, |parent| {
            let mut sorted = children;
            sorted.sort();
            parent.children = sorted;
            Ok(())
        })?;
        let count = self.count_dir_children(&self.get(parent_id)?.children, None)?;
        self.update(parent_id, |parent| {
            parent.subdir_count = count;
            Ok(())
        })?;
        Ok(())
    }

    /// Recomputes `subdir_count` from scratch, optionally pretending
    /// `extra` is already a child (used by `add_child` before the row that
    /// names it has necessarily been saved yet).
    fn count_dir_children(
        &self,
        children: &[ItemId],
        extra: Option<(&ItemId, ItemType)>,
    ) -> CoreResult<u32> {
        let mut count = 0u32;
        for c in children {
            if let Some((extra_id, extra_type)) = extra {
                if c == extra_id {
                    if extra_type == ItemType::Directory {
                        count += 1;
                    }
                    continue;
                }
            }
            if let Some(child) = self.try_get(c)? {
                if child.item_type == ItemType::Directory {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    pub fn iter_all(&self) -> CoreResult<Vec<Entry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT data FROM entries").map_err(sqlite_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(sqlite_err)?;
        let mut out = Vec::new();
        for row in rows {
            let json = row.map_err(sqlite_err)?;
            out.push(
                serde_json::from_str(&json)
                    .map_err(|e| CoreError::Permanent(format!("corrupt entry row: {e}")))?,
            );
        }
        Ok(out)
    }

    /// Sweeps all entries, logging (not deleting) any whose `parent_id`
    /// does not resolve to an existing row.
    fn sweep_orphans(&self) -> CoreResult<()> {
        let all = self.iter_all()?;
        let mut orphans = 0;
        for entry in &all {
            if entry.is_root() {
                continue;
            }
            if self.try_get(&entry.parent_id)?.is_none() {
                orphans += 1;
                tracing::warn!(id = %entry.id, parent = %entry.parent_id, "orphaned entry: missing parent");
            }
        }
        if orphans > 0 {
            tracing::warn!(count = orphans, "catalog invariant sweep found orphaned entries");
        }
        Ok(())
    }

    // --- misc KV buckets (spec §6.3) ---

    pub fn kv_get(&self, bucket: &str, key: &str) -> CoreResult<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM kv WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
            |row| row.get(0),
        )
        .optional()
        .map_err(sqlite_err)
    }

    pub fn kv_set(&self, bucket: &str, key: &str, value: &str) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv(bucket, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(bucket, key) DO UPDATE SET value = excluded.value",
            params![bucket, key, value],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    pub fn kv_delete(&self, bucket: &str, key: &str) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE bucket = ?1 AND key = ?2", params![bucket, key])
            .map_err(sqlite_err)?;
        Ok(())
    }

    pub fn kv_list(&self, bucket: &str) -> CoreResult<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT key, value FROM kv WHERE bucket = ?1")
            .map_err(sqlite_err)?;
        let rows = stmt
            .query_map(params![bucket], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(sqlite_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(sqlite_err)?);
        }
        Ok(out)
    }
}

fn sqlite_err(e: rusqlite::Error) -> CoreError {
    CoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}
