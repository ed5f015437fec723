mod ledger;
mod schema;

use anyhow::{Context, Result};
use duckdb::{params, Connection};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use ledger::LedgerRepository;
pub use schema::{CLEAR_LEDGER, MIGRATIONS};

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, duckdb::Error>;
}

impl<T> OptionalExt<T> for Result<T, duckdb::Error> {
    fn optional(self) -> Result<Option<T>, duckdb::Error> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open database")?;

        conn.execute_batch(
            "SET threads=4;
             SET memory_limit='512MB';",
        )?;

        Ok(Self::from_connection(conn))
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let db = Self::from_connection(Connection::open_in_memory()?);
        db.migrate()?;
        Ok(db)
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    // A panic while holding the lock leaves no open transaction behind (dropping
    // it rolled back), so the connection stays usable.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        for (id, (name, sql)) in MIGRATIONS.iter().enumerate() {
            let applied: Option<i32> = conn
                .query_row(
                    "SELECT id FROM _migrations WHERE id = ?",
                    params![id as i32],
                    |row| row.get(0),
                )
                .optional()?;

            if applied.is_none() {
                tracing::info!("Running migration: {}", name);
                conn.execute_batch(sql)
                    .with_context(|| format!("Migration {} failed", name))?;
                conn.execute(
                    "INSERT INTO _migrations (id, name) VALUES (?, ?)",
                    params![id as i32, *name],
                )?;
            }
        }

        Ok(())
    }

    /// Runs `f` inside one database transaction. Commits when `f` succeeds,
    /// rolls back and returns its error otherwise.
    pub fn execute_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<duckdb::Error>,
        F: FnOnce(&Connection) -> Result<T, E>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        match f(&*tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::warn!("Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    pub fn query_one<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Option<T>, duckdb::Error>
    where
        P: duckdb::Params,
        F: FnOnce(&duckdb::Row<'_>) -> Result<T, duckdb::Error>,
    {
        let conn = self.lock();
        conn.query_row(sql, params, f).optional()
    }

    pub fn query_all<T, P, F>(&self, sql: &str, params: P, mut f: F) -> Result<Vec<T>, duckdb::Error>
    where
        P: duckdb::Params,
        F: FnMut(&duckdb::Row<'_>) -> Result<T, duckdb::Error>,
    {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(f(row)?);
        }
        Ok(results)
    }

    pub fn get_stats(&self) -> Result<DbStats> {
        let conn = self.lock();

        let block_count: i64 = conn.query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))?;

        let tx_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;

        let output_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM transaction_outputs", [], |row| row.get(0))?;

        let spent_output_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM transaction_outputs WHERE input_transaction_id IS NOT NULL",
            [],
            |row| row.get(0),
        )?;

        Ok(DbStats {
            block_count,
            tx_count,
            output_count,
            spent_output_count,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbStats {
    pub block_count: i64,
    pub tx_count: i64,
    pub output_count: i64,
    pub spent_output_count: i64,
}
