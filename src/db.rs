use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;

/// Initialize the database with all required tables
pub fn init_database(db_path: &Path) -> Result<()> {
    let conn = get_connection(db_path)?;

    conn.execute_batch("PRAGMA journal_mode=WAL;")?;

    create_schema(&conn)?;

    log::info!("Database initialized successfully");
    Ok(())
}

/// Create all database tables
pub fn create_schema(conn: &Connection) -> Result<()> {
    // PDFs are written by the ingestion pipeline; this crate only reads them
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pdfs (
            pdf_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            doc_count INTEGER NOT NULL DEFAULT 0,
            page_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS chats (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS chat_pdfs (
            chat_id TEXT NOT NULL,
            pdf_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (chat_id, pdf_id),
            FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE,
            FOREIGN KEY (pdf_id) REFERENCES pdfs(pdf_id) ON DELETE CASCADE
        )",
        [],
    )?;

    // Last applied replace-all version per chat
    conn.execute(
        "CREATE TABLE IF NOT EXISTS chat_pdf_versions (
            chat_id TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_chat_pdfs_chat
         ON chat_pdfs(chat_id, position)",
        [],
    )?;

    log::info!("Database schema created successfully");
    Ok(())
}

/// Get a database connection
pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path).context("Failed to open database connection")?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");

        init_database(&db_path).unwrap();

        assert!(db_path.exists());

        let conn = get_connection(&db_path).unwrap();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"pdfs".to_string()));
        assert!(tables.contains(&"chats".to_string()));
        assert!(tables.contains(&"chat_pdfs".to_string()));
        assert!(tables.contains(&"chat_pdf_versions".to_string()));
    }

    #[test]
    fn test_init_database_is_repeatable() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");

        init_database(&db_path).unwrap();
        init_database(&db_path).unwrap();
    }
}
