//! SQLite log store.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, info};

use super::models::{ExportCursor, LogQuery};
use super::LogStore;
use crate::audit::entry::{Actor, LogEntry, Protection};
use crate::error::{ProtectedLogError, Result};

const ENTRY_COLUMNS: &str = "node_id, sequence_number, event_time, actor, module, event_kind, \
     comment, username, certificate_ref, previous_hash, current_hash, protection";

#[derive(Clone)]
pub struct SqliteLogStore {
    pool: SqlitePool,
}

impl SqliteLogStore {
    /// Open (creating if missing) the database at `database_url` and apply the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        info!("Opened protected log database {}", database_url);
        Ok(store)
    }

    /// A private in-memory database. One connection, since every
    /// connection to `:memory:` would see its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../../migrations/001_protected_log.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_db_sequence(sequence_number: u64) -> Result<i64> {
    i64::try_from(sequence_number)
        .map_err(|_| ProtectedLogError::Store(format!("sequence {} out of range", sequence_number)))
}

fn entry_from_row(row: &SqliteRow) -> Result<LogEntry> {
    let sequence_number: i64 = row.try_get("sequence_number")?;
    let millis: i64 = row.try_get("event_time")?;
    let actor: String = row.try_get("actor")?;
    let protection: Option<String> = row.try_get("protection")?;

    let timestamp = DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| ProtectedLogError::Store(format!("invalid event_time {}", millis)))?;
    let protection = match protection {
        Some(json) => Some(serde_json::from_str::<Protection>(&json)?),
        None => None,
    };

    Ok(LogEntry {
        node_id: row.try_get("node_id")?,
        sequence_number: u64::try_from(sequence_number).map_err(|_| {
            ProtectedLogError::Store(format!("negative sequence {}", sequence_number))
        })?,
        timestamp,
        actor: serde_json::from_str::<Actor>(&actor)?,
        module: row.try_get("module")?,
        event_kind: row.try_get("event_kind")?,
        comment: row.try_get("comment")?,
        username: row.try_get("username")?,
        certificate_ref: row.try_get("certificate_ref")?,
        previous_hash: row.try_get("previous_hash")?,
        current_hash: row.try_get("current_hash")?,
        protection,
    })
}

#[async_trait::async_trait]
impl LogStore for SqliteLogStore {
    async fn append(&self, entry: &LogEntry) -> Result<()> {
        let protection = match &entry.protection {
            Some(p) => Some(serde_json::to_string(p)?),
            None => None,
        };

        sqlx::query(&format!(
            "INSERT INTO protected_log_entries ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            ENTRY_COLUMNS
        ))
        .bind(&entry.node_id)
        .bind(to_db_sequence(entry.sequence_number)?)
        .bind(entry.timestamp.timestamp_millis())
        .bind(serde_json::to_string(&entry.actor)?)
        .bind(&entry.module)
        .bind(&entry.event_kind)
        .bind(&entry.comment)
        .bind(&entry.username)
        .bind(&entry.certificate_ref)
        .bind(&entry.previous_hash)
        .bind(&entry.current_hash)
        .bind(protection)
        .execute(&self.pool)
        .await?;

        debug!("Stored entry {}#{}", entry.node_id, entry.sequence_number);
        Ok(())
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<LogEntry>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM protected_log_entries WHERE 1 = 1",
            ENTRY_COLUMNS
        ));
        if let Some(node_id) = &query.node_id {
            builder.push(" AND node_id = ").push_bind(node_id.clone());
        }
        if let Some(after) = query.after_sequence {
            builder.push(" AND sequence_number > ").push_bind(to_db_sequence(after)?);
        }
        if let Some(up_to) = query.up_to_sequence {
            builder.push(" AND sequence_number <= ").push_bind(to_db_sequence(up_to)?);
        }
        if let Some(since) = query.since {
            builder.push(" AND event_time >= ").push_bind(since.timestamp_millis());
        }
        builder.push(" ORDER BY node_id, sequence_number");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit.min(i64::MAX as u64) as i64);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn newest_entry(&self, node_id: Option<&str>) -> Result<Option<LogEntry>> {
        let row = match node_id {
            Some(node) => {
                sqlx::query(&format!(
                    "SELECT {} FROM protected_log_entries WHERE node_id = ? \
                     ORDER BY sequence_number DESC LIMIT 1",
                    ENTRY_COLUMNS
                ))
                .bind(node)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM protected_log_entries ORDER BY event_time DESC LIMIT 1",
                    ENTRY_COLUMNS
                ))
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn node_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT node_id FROM protected_log_entries ORDER BY node_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("node_id").map_err(Into::into))
            .collect()
    }

    async fn count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM protected_log_entries")
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(total.max(0) as u64)
    }

    async fn set_protection(
        &self,
        node_id: &str,
        sequence_number: u64,
        protection: &Protection,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE protected_log_entries SET protection = ? \
             WHERE node_id = ? AND sequence_number = ?",
        )
        .bind(serde_json::to_string(protection)?)
        .bind(node_id)
        .bind(to_db_sequence(sequence_number)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ProtectedLogError::Store(format!(
                "entry {}#{} does not exist",
                node_id, sequence_number
            )));
        }
        Ok(())
    }

    async fn remove_node(&self, node_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM protected_log_entries WHERE node_id = ?")
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn remove_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM protected_log_entries")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn load_cursor(&self, destination: &str) -> Result<Option<ExportCursor>> {
        let row = sqlx::query(
            "SELECT cursor FROM protected_log_export_cursors WHERE destination = ?",
        )
        .bind(destination)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let json: String = row.try_get("cursor")?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn save_cursor(&self, destination: &str, cursor: &ExportCursor) -> Result<()> {
        sqlx::query(
            "INSERT INTO protected_log_export_cursors (destination, cursor, updated_at) \
             VALUES (?, ?, ?) \
             ON CONFLICT (destination) DO UPDATE SET \
                cursor = excluded.cursor, updated_at = excluded.updated_at",
        )
        .bind(destination)
        .bind(serde_json::to_string(cursor)?)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_epoch(&self) -> Result<u64> {
        let row = sqlx::query("SELECT value FROM protected_log_metadata WHERE key = 'reset_epoch'")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let value: String = row.try_get("value")?;
                value.parse::<u64>().map_err(|e| {
                    ProtectedLogError::Store(format!("invalid reset epoch {:?}: {}", value, e))
                })
            }
            None => Ok(0),
        }
    }

    async fn advance_reset_epoch(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO protected_log_metadata (key, value) VALUES ('reset_epoch', '1') \
             ON CONFLICT (key) DO UPDATE SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)",
        )
        .execute(&mut *tx)
        .await?;
        let row = sqlx::query("SELECT value FROM protected_log_metadata WHERE key = 'reset_epoch'")
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        let value: String = row.try_get("value")?;
        value
            .parse::<u64>()
            .map_err(|e| ProtectedLogError::Store(format!("invalid reset epoch {:?}: {}", value, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::LogEvent;
    use crate::database::ChainBoundary;

    #[tokio::test]
    async fn test_entry_survives_storage() {
        let store = SqliteLogStore::in_memory().await.unwrap();
        let genesis = LogEntry::chained(
            "node-1",
            0,
            None,
            LogEvent::internal("test", "genesis").with_username("alice"),
        );
        let next = LogEntry::chained(
            "node-1",
            1,
            Some(genesis.current_hash.clone()),
            LogEvent::internal("test", "second"),
        );
        store.append(&genesis).await.unwrap();
        store.append(&next).await.unwrap();

        let stored = store.query(&LogQuery::node("node-1")).await.unwrap();
        assert_eq!(stored, vec![genesis.clone(), next.clone()]);
        assert!(stored.iter().all(LogEntry::verify_hash));

        assert_eq!(store.newest_entry(Some("node-1")).await.unwrap(), Some(next));
        assert!(store.append(&genesis).await.is_err());
    }

    #[tokio::test]
    async fn test_cursor_and_epoch_persistence() {
        let store = SqliteLogStore::in_memory().await.unwrap();
        assert!(store.load_cursor("/tmp/export-").await.unwrap().is_none());

        let mut cursor = ExportCursor::fresh(0);
        cursor.boundaries.insert(
            "node-1".to_string(),
            ChainBoundary {
                sequence_number: 3,
                current_hash: "sha256:abc".to_string(),
            },
        );
        store.save_cursor("/tmp/export-", &cursor).await.unwrap();
        assert_eq!(store.load_cursor("/tmp/export-").await.unwrap(), Some(cursor));

        assert_eq!(store.reset_epoch().await.unwrap(), 0);
        assert_eq!(store.advance_reset_epoch().await.unwrap(), 1);
        assert_eq!(store.advance_reset_epoch().await.unwrap(), 2);
        assert_eq!(store.reset_epoch().await.unwrap(), 2);
    }
}
