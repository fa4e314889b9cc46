use std::path::PathBuf;

use deadpool::Runtime;

use crate::errors::DatabaseError;

deadpool::managed_reexports!(
    "warden-store",
    SqlitePoolManager,
    deadpool::managed::Object<SqlitePoolManager>,
    rusqlite::Error,
    DatabaseError
);

use crate::SQL_STATEMENT_CACHE_CAPACITY;

const RUNTIME: Runtime = Runtime::Tokio1;

pub struct SqlitePoolManager {
    database_path: PathBuf,
}

impl SqlitePoolManager {
    pub fn new(database_path: PathBuf) -> Self {
        Self { database_path }
    }

    fn new_connection(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.database_path)?;
        let inner = conn.inner();

        // Increase the statement cache size.
        inner.set_prepared_statement_cache_capacity(SQL_STATEMENT_CACHE_CAPACITY);

        // Enable the WAL mode. This allows concurrent reads while a write transaction is
        // pending, which is required for keeping cache invalidation atomic with the commit
        // without starving readers (see [crate::state::State]).
        inner.pragma_update(None, "journal_mode", "WAL")?;

        // Enable foreign key checks.
        inner.execute("PRAGMA foreign_keys = ON;", ())?;

        // WAL permits a single writer; concurrent writers wait instead of failing with
        // SQLITE_BUSY.
        inner.busy_timeout(std::time::Duration::from_secs(5))?;

        Ok(conn)
    }
}

use deadpool::managed::{Manager, Metrics, RecycleResult};

use crate::db::connection::Connection;

impl Manager for SqlitePoolManager {
    type Type = deadpool_sync::SyncWrapper<Connection>;
    type Error = rusqlite::Error;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        let conn = self.new_connection();
        deadpool_sync::SyncWrapper::new(RUNTIME, move || conn).await
    }

    async fn recycle(&self, _: &mut Self::Type, _: &Metrics) -> RecycleResult<Self::Error> {
        Ok(())
    }
}
