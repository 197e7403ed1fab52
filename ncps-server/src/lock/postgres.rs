//! Row-backed lock executed through the same [`crate::database::Database`]
//! connection the metadata store already holds.
//!
//! Despite the module name this isn't a session-scoped `pg_advisory_lock`:
//! `sea_orm`'s pooled connections don't let us pin one physical connection
//! for a lock's lifetime, which session-scoped advisory locks require. A
//! conditional-upsert row in the `dlock` table gives the same acquire/renew/
//! expire contract without that constraint, and works unmodified against
//! SQLite and MySQL too, which is why the table-driven approach was chosen
//! over `pg_advisory_lock` even though PostgreSQL is the primary target.

use std::time::Duration;

use crate::database::Database;
use crate::error::ServerResult;
use crate::lock::LockBackend;

#[derive(Debug)]
pub struct RowLockBackend {
    database: Database,
    owner: String,
}

impl RowLockBackend {
    pub fn new(database: Database) -> Self {
        let owner: u128 = rand::random();
        Self { database, owner: format!("{owner:032x}") }
    }
}

#[async_trait::async_trait]
impl LockBackend for RowLockBackend {
    async fn try_acquire_exclusive(&self, key: &str, ttl: Duration) -> ServerResult<bool> {
        self.database.try_acquire_row_lock(key, &self.owner, ttl).await
    }

    async fn release_exclusive(&self, key: &str) -> ServerResult<()> {
        self.database.release_row_lock(key, &self.owner).await
    }
}
