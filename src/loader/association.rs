//! Tour/photo association lookups.
//!
//! The SQL association stage asks which tours reference a photo. The
//! relationships are maintained elsewhere; this module only reads them.

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info};

/// Answers which tours reference a photo. Called on sql worker threads.
pub trait AssociationSource: Send + Sync {
    fn tour_ids(&self, path: &Path) -> Result<Vec<i64>>;
}

/// SQLite-backed association lookups.
///
/// Reads the `tour_photo (tour_id, path)` table.
pub struct SqliteAssociationStore {
    conn: Mutex<Connection>,
}

impl SqliteAssociationStore {
    /// Opens or creates the database at the specified path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )
        .context("Failed to configure SQLite pragmas")?;

        let store = Self::with_connection(conn)?;
        info!("Opened association store at {:?}", path);
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tour_photo (
                tour_id INTEGER NOT NULL,
                path TEXT NOT NULL,
                PRIMARY KEY (tour_id, path)
            );

            CREATE INDEX IF NOT EXISTS idx_tour_photo_path ON tour_photo(path);
            ",
        )
        .context("Failed to create association tables")?;

        debug!("Association tables created/verified");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Records that a tour references a photo.
    pub fn link(&self, tour_id: i64, path: &Path) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR IGNORE INTO tour_photo (tour_id, path) VALUES (?1, ?2)",
                params![tour_id, path.to_string_lossy()],
            )
            .context("Failed to link photo to tour")?;
        Ok(())
    }
}

impl AssociationSource for SqliteAssociationStore {
    fn tour_ids(&self, path: &Path) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT tour_id FROM tour_photo WHERE path = ?1 ORDER BY tour_id")
            .context("Failed to prepare association query")?;

        let ids = stmt
            .query_map(params![path.to_string_lossy()], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .with_context(|| format!("Failed to read associations for {:?}", path))?;
        Ok(ids)
    }
}
