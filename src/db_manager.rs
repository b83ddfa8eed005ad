use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

/// Local persistence for the replicated document.
///
/// The document is stored as a single opaque snapshot blob under a fixed
/// application identifier; its internal schema is owned by the document
/// layer, not by SQL.
pub struct DbManager {
    conn: Connection,
}

impl DbManager {
    pub fn open(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).expect("Could not create data directory");
            }
        }

        let conn = Connection::open(db_path)?;
        let db_manager = Self { conn };
        db_manager.initialize_schema()?;
        Ok(db_manager)
    }

    fn initialize_schema(&self) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS document (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                snapshot BLOB NOT NULL,
                saved_at_ms INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// Returns the persisted snapshot, if any run ever stored one.
    pub fn load_document(&self) -> Result<Option<Vec<u8>>, rusqlite::Error> {
        self.conn
            .query_row("SELECT snapshot FROM document WHERE id = 0", [], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()
    }

    pub fn store_document(&self, snapshot: &[u8], saved_at_ms: i64) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO document (id, snapshot, saved_at_ms) VALUES (0, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET snapshot = ?1, saved_at_ms = ?2",
            params![snapshot, saved_at_ms],
        )?;
        Ok(())
    }
}
