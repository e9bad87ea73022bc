use std::{fs, path::Path};

use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{
    Connection, OptionalExtension, ToSql, params,
    types::{FromSql, FromSqlError, ToSqlOutput, ValueRef},
};
use tracing::info;

use crate::{
    error::{RelayError, RelayResult},
    migration::{MigrationRecord, unix_now},
    pool::PremintedToken,
};

const DB_FILE: &str = "relay.sqlite";

struct AddressSqlable(Address);

impl ToSql for AddressSqlable {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.as_slice()))
    }
}

impl FromSql for AddressSqlable {
    fn column_result(value: ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        Ok(AddressSqlable(Address::from(<[u8; 20]>::column_result(
            value,
        )?)))
    }
}

/// Token ids are stored as decimal text so they stay readable from the sqlite shell.
struct TokenIdSqlable(U256);

impl ToSql for TokenIdSqlable {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.to_string()))
    }
}

impl FromSql for TokenIdSqlable {
    fn column_result(value: ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map(TokenIdSqlable)
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

fn to_storage(e: impl Into<anyhow::Error>) -> RelayError {
    RelayError::Storage(e.into())
}

/// Durable state: migration records and the preminted token pool.
#[derive(Debug)]
pub struct Db {
    db: Mutex<Connection>,
}

impl Db {
    /// Open `relay.sqlite` inside `data_dir`, or an in-memory database when there is no data directory.
    pub fn new<P: AsRef<Path>>(data_dir: Option<P>) -> Result<Db> {
        let connection = match data_dir {
            Some(dir) => {
                let dir = dir.as_ref();
                fs::create_dir_all(dir)
                    .with_context(|| format!("creating data directory {}", dir.display()))?;
                let path = dir.join(DB_FILE);
                info!(path = %path.display(), "opening database");
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };
        connection.trace_v2(
            rusqlite::trace::TraceEventCodes::SQLITE_TRACE_STMT,
            Some(|statement| {
                if let rusqlite::trace::TraceEvent::Stmt(_, statement) = statement {
                    tracing::trace!(statement, "sql executed");
                }
            }),
        );
        Self::ensure_schema(&connection)?;

        Ok(Db {
            db: Mutex::new(connection),
        })
    }

    fn ensure_schema(connection: &Connection) -> Result<()> {
        connection.execute_batch(
            "CREATE TABLE IF NOT EXISTS migrations (
                id TEXT NOT NULL PRIMARY KEY,
                step TEXT NOT NULL,
                record TEXT NOT NULL,
                updated_at INTEGER NOT NULL);
            CREATE TABLE IF NOT EXISTS preminted_tokens (
                universe TEXT NOT NULL,
                world BLOB NOT NULL,
                token_id TEXT NOT NULL,
                delivered INTEGER NOT NULL,
                minted INTEGER NOT NULL,
                PRIMARY KEY (universe, world, token_id));",
        )?;
        Ok(())
    }

    pub fn save_migration(&self, record: &MigrationRecord) -> RelayResult<()> {
        let json = serde_json::to_string(record).map_err(to_storage)?;
        self.db.lock().execute(
            "INSERT INTO migrations (id, step, record, updated_at) VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(id) DO UPDATE SET step = ?2, record = ?3, updated_at = ?4",
            params![
                record.id.to_string(),
                record.step.as_str(),
                json,
                unix_now() as i64
            ],
        )?;
        Ok(())
    }

    /// Every migration ever created, oldest first.
    pub fn load_migrations(&self) -> RelayResult<Vec<MigrationRecord>> {
        let db = self.db.lock();
        let mut statement = db.prepare("SELECT record FROM migrations")?;
        let mut records = statement
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|json| serde_json::from_str::<MigrationRecord>(&json?).map_err(to_storage))
            .collect::<RelayResult<Vec<_>>>()?;
        records.sort_by_key(|r| (r.created_at, r.id));
        Ok(records)
    }

    pub fn insert_preminted_token(&self, token: &PremintedToken) -> RelayResult<()> {
        self.db.lock().execute(
            "INSERT INTO preminted_tokens (universe, world, token_id, delivered, minted)
                VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                token.universe,
                AddressSqlable(token.world),
                TokenIdSqlable(token.token_id),
                token.delivered,
                token.minted
            ],
        )?;
        Ok(())
    }

    pub fn get_preminted_token(
        &self,
        universe: &str,
        world: Address,
        token_id: U256,
    ) -> RelayResult<Option<PremintedToken>> {
        Ok(self
            .db
            .lock()
            .query_row(
                "SELECT universe, world, token_id, delivered, minted FROM preminted_tokens
                    WHERE universe = ?1 AND world = ?2 AND token_id = ?3",
                params![
                    universe,
                    AddressSqlable(world),
                    TokenIdSqlable(token_id)
                ],
                |row| {
                    Ok(PremintedToken {
                        universe: row.get(0)?,
                        world: row.get::<_, AddressSqlable>(1)?.0,
                        token_id: row.get::<_, TokenIdSqlable>(2)?.0,
                        delivered: row.get(3)?,
                        minted: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    /// Mark the oldest available token of a world as delivered and return it. Runs as one transaction under the
    /// connection lock, so two callers never receive the same token.
    pub fn take_available_token(&self, universe: &str, world: Address) -> RelayResult<Option<U256>> {
        let mut db = self.db.lock();
        let tx = db.transaction()?;
        let token_id = tx
            .query_row(
                "SELECT token_id FROM preminted_tokens
                    WHERE universe = ?1 AND world = ?2 AND delivered = 0 AND minted = 0
                    ORDER BY rowid LIMIT 1",
                params![universe, AddressSqlable(world)],
                |row| row.get::<_, TokenIdSqlable>(0),
            )
            .optional()?
            .map(|t| t.0);
        if let Some(token_id) = token_id {
            tx.execute(
                "UPDATE preminted_tokens SET delivered = 1
                    WHERE universe = ?1 AND world = ?2 AND token_id = ?3",
                params![universe, AddressSqlable(world), TokenIdSqlable(token_id)],
            )?;
        }
        tx.commit()?;
        Ok(token_id)
    }

    pub fn count_available_tokens(&self, universe: &str, world: Address) -> RelayResult<usize> {
        let count: i64 = self.db.lock().query_row(
            "SELECT COUNT(*) FROM preminted_tokens
                WHERE universe = ?1 AND world = ?2 AND delivered = 0 AND minted = 0",
            params![universe, AddressSqlable(world)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Returns whether the token exists.
    pub fn set_token_delivered(
        &self,
        universe: &str,
        world: Address,
        token_id: U256,
        delivered: bool,
    ) -> RelayResult<bool> {
        let updated = self.db.lock().execute(
            "UPDATE preminted_tokens SET delivered = ?4
                WHERE universe = ?1 AND world = ?2 AND token_id = ?3",
            params![
                universe,
                AddressSqlable(world),
                TokenIdSqlable(token_id),
                delivered
            ],
        )?;
        Ok(updated > 0)
    }

    /// Returns whether the token exists.
    pub fn set_token_minted(&self, universe: &str, world: Address, token_id: U256) -> RelayResult<bool> {
        let updated = self.db.lock().execute(
            "UPDATE preminted_tokens SET minted = 1, delivered = 1
                WHERE universe = ?1 AND world = ?2 AND token_id = ?3",
            params![universe, AddressSqlable(world), TokenIdSqlable(token_id)],
        )?;
        Ok(updated > 0)
    }

    /// Hand every delivered but never minted token back to the pool. Returns how many were reset.
    pub fn reset_undelivered_tokens(&self) -> RelayResult<usize> {
        Ok(self.db.lock().execute(
            "UPDATE preminted_tokens SET delivered = 0 WHERE delivered = 1 AND minted = 0",
            [],
        )?)
    }
}
