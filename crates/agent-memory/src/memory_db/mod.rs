//! Memory database module - SQLite-backed storage for sessions, handoffs, patterns and embeddings
pub mod schema;
pub mod migration;
pub mod session_store;
pub mod handoff_store;
pub mod pattern_store;
pub mod workspace_store;
pub mod embedding_store;

pub use schema::*;
pub use migration::MigrationManager;
pub use session_store::{NewSession, SessionPatch, SessionStore};
pub use handoff_store::{HandoffStore, NewHandoff};
pub use pattern_store::{NewObservation, NewPattern, PatternFilter, PatternRecordStore};
pub use workspace_store::WorkspaceStore;
pub use embedding_store::{cosine_similarity, EmbeddingStats, EmbeddingStore};

use std::path::Path;
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON;
                                  PRAGMA busy_timeout = 5000;";

const FILE_PRAGMAS: &str = "PRAGMA foreign_keys = ON;
                            PRAGMA journal_mode = WAL;
                            PRAGMA synchronous = NORMAL;
                            PRAGMA busy_timeout = 5000;";

/// Owns the connection pool and hands out one store per collection.
pub struct MemoryDatabase {
    pub sessions: SessionStore,
    pub handoffs: HandoffStore,
    pub patterns: PatternRecordStore,
    pub workspace: WorkspaceStore,
    pub embeddings: EmbeddingStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MemoryDatabase {
    /// Open (or create) a file-backed database and apply pending migrations.
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        Self::with_pool_size(db_path, 10)
    }

    pub fn with_pool_size(db_path: &Path, max_connections: u32) -> anyhow::Result<Self> {
        info!("Opening memory database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| conn.execute_batch(FILE_PRAGMAS));
        let pool = Pool::builder()
            .max_size(max_connections.max(1))
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        Self::from_pool(pool)
    }

    /// A private in-memory database. The pool holds a single connection that
    /// is never recycled, so every store sees the same data.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        Self::from_pool(pool)
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>) -> anyhow::Result<Self> {
        {
            let mut conn = pool.get()?;
            let mut migrator = MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
        }

        let pool = Arc::new(pool);
        info!("Memory database initialized successfully");
        Ok(Self {
            sessions: SessionStore::new(Arc::clone(&pool)),
            handoffs: HandoffStore::new(Arc::clone(&pool)),
            patterns: PatternRecordStore::new(Arc::clone(&pool)),
            workspace: WorkspaceStore::new(Arc::clone(&pool)),
            embeddings: EmbeddingStore::new(Arc::clone(&pool)),
            pool,
        })
    }

    pub fn get_stats(&self) -> crate::error::Result<DatabaseStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }

    /// Raw SQL for tests that need to corrupt or backdate rows.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> crate::error::Result<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(sql)?;
        Ok(())
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}
