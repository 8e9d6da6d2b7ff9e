use crate::db;
use crate::models::PdfDescriptor;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Business-rule violation; the message is safe to show to callers.
    #[error("{0}")]
    Domain(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("store connection lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a versioned replace-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionedWrite {
    pub applied: bool,
    /// Version stored for the chat after the call.
    pub version: u64,
}

/// Persistence for chat to PDF associations.
pub trait PdfStore: Send + Sync {
    /// Associated PDF ids in insertion order. Unknown chats yield an empty list.
    fn get_pdfs_by_chat_id(&self, chat_id: &str) -> StoreResult<Vec<String>>;

    /// Ids and last applied replace-all version, read together.
    fn get_chat_selection(&self, chat_id: &str) -> StoreResult<(Vec<String>, u64)>;

    /// Creates the chat for `user_id` unless it already exists.
    fn ensure_chat(&self, chat_id: &str, user_id: &str) -> StoreResult<()>;

    /// Adds one association. Adding an existing pair is a no-op.
    fn add_pdf_to_chat(&self, chat_id: &str, pdf_id: &str) -> StoreResult<()>;

    /// Removes one association. Removing an absent pair is a no-op.
    fn remove_pdf_from_chat(&self, chat_id: &str, pdf_id: &str) -> StoreResult<()>;

    /// Replaces every association of the chat with `pdf_ids`.
    fn set_chat_pdfs(&self, chat_id: &str, pdf_ids: &[String]) -> StoreResult<()>;

    /// Replaces the associations only if `version` is newer than the last one
    /// applied for this chat.
    fn set_chat_pdfs_versioned(
        &self,
        chat_id: &str,
        pdf_ids: &[String],
        version: u64,
    ) -> StoreResult<VersionedWrite>;

    /// Registers or updates a PDF descriptor. Called by the ingestion side.
    fn upsert_pdf(&self, pdf: &PdfDescriptor) -> StoreResult<()>;

    fn list_pdfs(&self) -> StoreResult<Vec<PdfDescriptor>>;
}

/// SQLite-backed store. All access goes through one connection, so writes
/// for the same chat never interleave.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        db::init_database(db_path)?;
        let conn = db::get_connection(db_path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        db::create_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn require_chat(conn: &Connection, chat_id: &str) -> StoreResult<()> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM chats WHERE id = ?1",
        params![chat_id],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(StoreError::Domain(format!("Chat not found: {}", chat_id)))
    }
}

fn require_pdf(conn: &Connection, pdf_id: &str) -> StoreResult<()> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM pdfs WHERE pdf_id = ?1",
        params![pdf_id],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(StoreError::Domain(format!("PDF not found: {}", pdf_id)))
    }
}

/// Drops repeated ids, keeping the first occurrence.
fn dedup_ids(pdf_ids: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    pdf_ids
        .iter()
        .map(String::as_str)
        .filter(|id| seen.insert(*id))
        .collect()
}

/// SQLite integers are signed; versions past `i64::MAX` cannot be stored.
fn storable_version(version: u64) -> StoreResult<i64> {
    i64::try_from(version).map_err(|_| StoreError::Domain(format!("Invalid version: {}", version)))
}

fn read_ids(conn: &Connection, chat_id: &str) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT pdf_id FROM chat_pdfs WHERE chat_id = ?1 ORDER BY position, created_at",
    )?;
    let ids = stmt
        .query_map(params![chat_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

fn read_version(conn: &Connection, chat_id: &str) -> StoreResult<u64> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM chat_pdf_versions WHERE chat_id = ?1",
            params![chat_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.map_or(0, |v| u64::try_from(v).unwrap_or(0)))
}

fn replace_all(
    conn: &mut Connection,
    chat_id: &str,
    pdf_ids: &[String],
    version: Option<i64>,
) -> StoreResult<()> {
    let tx = conn.transaction()?;
    require_chat(&tx, chat_id)?;
    let ids = dedup_ids(pdf_ids);
    for pdf_id in &ids {
        require_pdf(&tx, pdf_id)?;
    }

    tx.execute("DELETE FROM chat_pdfs WHERE chat_id = ?1", params![chat_id])?;

    let now = chrono::Utc::now().timestamp();
    {
        let mut stmt = tx.prepare(
            "INSERT INTO chat_pdfs (chat_id, pdf_id, position, created_at) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (position, pdf_id) in ids.iter().enumerate() {
            stmt.execute(params![chat_id, pdf_id, position as i64, now])?;
        }
    }

    if let Some(version) = version {
        tx.execute(
            "INSERT INTO chat_pdf_versions (chat_id, version, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(chat_id) DO UPDATE SET version = excluded.version, updated_at = excluded.updated_at",
            params![chat_id, version, now],
        )?;
    }

    tx.commit()?;
    Ok(())
}

impl PdfStore for SqliteStore {
    fn get_pdfs_by_chat_id(&self, chat_id: &str) -> StoreResult<Vec<String>> {
        let conn = self.lock()?;
        read_ids(&conn, chat_id)
    }

    fn get_chat_selection(&self, chat_id: &str) -> StoreResult<(Vec<String>, u64)> {
        let conn = self.lock()?;
        let ids = read_ids(&conn, chat_id)?;
        let version = read_version(&conn, chat_id)?;
        Ok((ids, version))
    }

    fn ensure_chat(&self, chat_id: &str, user_id: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        let now = chrono::Utc::now().timestamp();
        let created = conn.execute(
            "INSERT OR IGNORE INTO chats (id, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![chat_id, user_id, now],
        )?;
        if created > 0 {
            log::info!("Created chat {} for user {}", chat_id, user_id);
        }
        Ok(())
    }

    fn add_pdf_to_chat(&self, chat_id: &str, pdf_id: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        require_chat(&conn, chat_id)?;
        require_pdf(&conn, pdf_id)?;

        let now = chrono::Utc::now().timestamp();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO chat_pdfs (chat_id, pdf_id, position, created_at)
             VALUES (?1, ?2,
                (SELECT COALESCE(MAX(position) + 1, 0) FROM chat_pdfs WHERE chat_id = ?1),
                ?3)",
            params![chat_id, pdf_id, now],
        )?;

        if inserted == 0 {
            log::debug!("PDF {} already linked to chat {}", pdf_id, chat_id);
        }
        Ok(())
    }

    fn remove_pdf_from_chat(&self, chat_id: &str, pdf_id: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        require_chat(&conn, chat_id)?;

        conn.execute(
            "DELETE FROM chat_pdfs WHERE chat_id = ?1 AND pdf_id = ?2",
            params![chat_id, pdf_id],
        )?;
        Ok(())
    }

    fn set_chat_pdfs(&self, chat_id: &str, pdf_ids: &[String]) -> StoreResult<()> {
        let mut conn = self.lock()?;
        replace_all(&mut conn, chat_id, pdf_ids, None)
    }

    fn set_chat_pdfs_versioned(
        &self,
        chat_id: &str,
        pdf_ids: &[String],
        version: u64,
    ) -> StoreResult<VersionedWrite> {
        let stored = storable_version(version)?;
        let mut conn = self.lock()?;
        require_chat(&conn, chat_id)?;

        let current = read_version(&conn, chat_id)?;
        if version <= current {
            log::info!(
                "Ignoring stale PDF set for chat {} (version {} <= {})",
                chat_id,
                version,
                current
            );
            return Ok(VersionedWrite {
                applied: false,
                version: current,
            });
        }

        replace_all(&mut conn, chat_id, pdf_ids, Some(stored))?;
        Ok(VersionedWrite {
            applied: true,
            version,
        })
    }

    fn upsert_pdf(&self, pdf: &PdfDescriptor) -> StoreResult<()> {
        let conn = self.lock()?;
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO pdfs (pdf_id, name, doc_count, page_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(pdf_id) DO UPDATE SET
                name = excluded.name,
                doc_count = excluded.doc_count,
                page_count = excluded.page_count",
            params![pdf.pdf_id, pdf.name, pdf.doc_count, pdf.page_count, now],
        )?;
        Ok(())
    }

    fn list_pdfs(&self) -> StoreResult<Vec<PdfDescriptor>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT pdf_id, name, doc_count, page_count FROM pdfs ORDER BY name, pdf_id")?;
        let pdfs = stmt
            .query_map([], |row| {
                Ok(PdfDescriptor {
                    pdf_id: row.get(0)?,
                    name: row.get(1)?,
                    doc_count: row.get(2)?,
                    page_count: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pdfs)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    pub(crate) fn pdf(id: &str) -> PdfDescriptor {
        PdfDescriptor {
            pdf_id: id.to_string(),
            name: format!("{}.pdf", id),
            doc_count: 1,
            page_count: 10,
        }
    }

    /// In-memory store with chat `c1` and PDFs `p1`..`p3`.
    pub(crate) fn seeded_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.ensure_chat("c1", "user-1").unwrap();
        for id in ["p1", "p2", "p3"] {
            store.upsert_pdf(&pdf(id)).unwrap();
        }
        store
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_get_unknown_chat_is_empty() {
        let store = seeded_store();
        assert!(store.get_pdfs_by_chat_id("nope").unwrap().is_empty());
    }

    #[test]
    fn test_set_then_get_preserves_order() {
        let store = seeded_store();
        store.set_chat_pdfs("c1", &ids(&["p2", "p1"])).unwrap();
        assert_eq!(store.get_pdfs_by_chat_id("c1").unwrap(), ids(&["p2", "p1"]));

        store.set_chat_pdfs("c1", &ids(&["p3"])).unwrap();
        assert_eq!(store.get_pdfs_by_chat_id("c1").unwrap(), ids(&["p3"]));
    }

    #[test]
    fn test_set_collapses_duplicates() {
        let store = seeded_store();
        store
            .set_chat_pdfs("c1", &ids(&["p1", "p2", "p1"]))
            .unwrap();
        assert_eq!(store.get_pdfs_by_chat_id("c1").unwrap(), ids(&["p1", "p2"]));
    }

    #[test]
    fn test_set_empty_clears() {
        let store = seeded_store();
        store.set_chat_pdfs("c1", &ids(&["p1", "p2"])).unwrap();
        store.set_chat_pdfs("c1", &[]).unwrap();
        assert!(store.get_pdfs_by_chat_id("c1").unwrap().is_empty());
    }

    #[test]
    fn test_set_with_unknown_pdf_leaves_state_untouched() {
        let store = seeded_store();
        store.set_chat_pdfs("c1", &ids(&["p1"])).unwrap();

        let err = store.set_chat_pdfs("c1", &ids(&["p2", "ghost"])).unwrap_err();
        assert!(matches!(err, StoreError::Domain(ref m) if m == "PDF not found: ghost"));
        assert_eq!(store.get_pdfs_by_chat_id("c1").unwrap(), ids(&["p1"]));
    }

    #[test]
    fn test_add_is_idempotent_and_appends() {
        let store = seeded_store();
        store.add_pdf_to_chat("c1", "p2").unwrap();
        store.add_pdf_to_chat("c1", "p1").unwrap();
        store.add_pdf_to_chat("c1", "p2").unwrap();
        assert_eq!(store.get_pdfs_by_chat_id("c1").unwrap(), ids(&["p2", "p1"]));
    }

    #[test]
    fn test_add_rejects_unknown_chat_and_pdf() {
        let store = seeded_store();
        assert!(matches!(
            store.add_pdf_to_chat("c9", "p1"),
            Err(StoreError::Domain(_))
        ));
        assert!(matches!(
            store.add_pdf_to_chat("c1", "ghost"),
            Err(StoreError::Domain(_))
        ));
    }

    #[test]
    fn test_remove_absent_is_ok() {
        let store = seeded_store();
        store.add_pdf_to_chat("c1", "p1").unwrap();
        store.remove_pdf_from_chat("c1", "p1").unwrap();
        store.remove_pdf_from_chat("c1", "p1").unwrap();
        store.remove_pdf_from_chat("c1", "ghost").unwrap();
        assert!(store.get_pdfs_by_chat_id("c1").unwrap().is_empty());
    }

    #[test]
    fn test_versioned_set_discards_stale() {
        let store = seeded_store();
        assert_eq!(store.get_chat_selection("c1").unwrap(), (vec![], 0));

        let first = store.set_chat_pdfs_versioned("c1", &ids(&["p1"]), 2).unwrap();
        assert_eq!(first, VersionedWrite { applied: true, version: 2 });

        let older = store.set_chat_pdfs_versioned("c1", &ids(&["p2"]), 1).unwrap();
        assert_eq!(older, VersionedWrite { applied: false, version: 2 });
        let same = store.set_chat_pdfs_versioned("c1", &ids(&["p3"]), 2).unwrap();
        assert!(!same.applied);

        assert_eq!(store.get_chat_selection("c1").unwrap(), (ids(&["p1"]), 2));
    }

    #[test]
    fn test_versioned_set_rejects_unstorable_version() {
        let store = seeded_store();
        store.set_chat_pdfs_versioned("c1", &ids(&["p1"]), 5).unwrap();

        let err = store
            .set_chat_pdfs_versioned("c1", &ids(&["p2"]), 1 << 63)
            .unwrap_err();
        assert!(matches!(err, StoreError::Domain(ref m) if m.starts_with("Invalid version")));
        assert_eq!(store.get_chat_selection("c1").unwrap(), (ids(&["p1"]), 5));

        let stale = store.set_chat_pdfs_versioned("c1", &ids(&["p3"]), 2).unwrap();
        assert!(!stale.applied);
        assert_eq!(store.get_pdfs_by_chat_id("c1").unwrap(), ids(&["p1"]));
    }

    #[test]
    fn test_max_storable_version_still_guards() {
        let store = seeded_store();
        let top = i64::MAX as u64;
        assert!(store.set_chat_pdfs_versioned("c1", &ids(&["p1"]), top).unwrap().applied);
        assert!(!store.set_chat_pdfs_versioned("c1", &ids(&["p2"]), 2).unwrap().applied);
        assert_eq!(store.get_chat_selection("c1").unwrap(), (ids(&["p1"]), top));
    }

    #[test]
    fn test_unversioned_set_keeps_version() {
        let store = seeded_store();
        store.set_chat_pdfs_versioned("c1", &ids(&["p1"]), 3).unwrap();
        store.set_chat_pdfs("c1", &ids(&["p2"])).unwrap();
        assert_eq!(store.get_chat_selection("c1").unwrap(), (ids(&["p2"]), 3));
    }

    #[test]
    fn test_ensure_chat_records_owner_once() {
        let store = seeded_store();
        store.ensure_chat("c2", "user-2").unwrap();
        store.ensure_chat("c2", "someone-else").unwrap();
        store.add_pdf_to_chat("c2", "p1").unwrap();

        let owner: String = store
            .lock()
            .unwrap()
            .query_row("SELECT user_id FROM chats WHERE id = 'c2'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(owner, "user-2");
        assert_eq!(store.get_pdfs_by_chat_id("c2").unwrap(), ids(&["p1"]));
    }

    #[test]
    fn test_deleting_chat_cascades() {
        let store = seeded_store();
        store.set_chat_pdfs_versioned("c1", &ids(&["p1"]), 1).unwrap();
        store
            .lock()
            .unwrap()
            .execute("DELETE FROM chats WHERE id = 'c1'", [])
            .unwrap();
        assert_eq!(store.get_chat_selection("c1").unwrap(), (vec![], 0));
    }

    #[test]
    fn test_list_pdfs_and_upsert() {
        let store = seeded_store();
        let mut updated = pdf("p1");
        updated.page_count = 42;
        store.upsert_pdf(&updated).unwrap();

        let pdfs = store.list_pdfs().unwrap();
        assert_eq!(pdfs.len(), 3);
        assert_eq!(pdfs[0].pdf_id, "p1");
        assert_eq!(pdfs[0].page_count, 42);
    }

    #[test]
    fn test_file_backed_store_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("links.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.ensure_chat("c1", "u").unwrap();
            store.upsert_pdf(&pdf("p1")).unwrap();
            store.add_pdf_to_chat("c1", "p1").unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get_pdfs_by_chat_id("c1").unwrap(), ids(&["p1"]));
    }
}
