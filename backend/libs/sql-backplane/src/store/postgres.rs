//! PostgreSQL implementation of [`BackplaneRepository`].
//!
//! Tables:
//!
//! ```text
//! backplane_messages     (id BIGSERIAL PK, channel, payload JSONB, created_at, is_deleted)
//! backplane_subscribers  (id TEXT PK, last_seen)
//! backplane_acks         (id BIGSERIAL PK, message_id FK ON DELETE CASCADE,
//!                         subscriber_id, acknowledged_at, UNIQUE(message_id, subscriber_id))
//! ```
//!
//! Liveness and retention windows are evaluated against the database clock
//! (`NOW()`), so processes with skewed clocks still agree on who is stale.

use super::BackplaneRepository;
use crate::config::{BackplaneConfig, CleanupMode};
use crate::error::{BackplaneError, BackplaneResult};
use crate::models::{AckCandidate, StoredMessage};
use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Advisory lock key serializing concurrent schema provisioning.
const SCHEMA_LOCK_KEY: i64 = 0x6261_636b_706c_6e65;

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS backplane_messages (
        id BIGSERIAL PRIMARY KEY,
        channel TEXT NOT NULL,
        payload JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        is_deleted BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_backplane_messages_channel_pending
        ON backplane_messages (channel, id)
        WHERE is_deleted = FALSE
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_backplane_messages_created_at
        ON backplane_messages (created_at)
        WHERE is_deleted = FALSE
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS backplane_subscribers (
        id TEXT PRIMARY KEY,
        last_seen TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS backplane_acks (
        id BIGSERIAL PRIMARY KEY,
        message_id BIGINT NOT NULL REFERENCES backplane_messages (id) ON DELETE CASCADE,
        subscriber_id TEXT NOT NULL,
        acknowledged_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT uq_backplane_acks_message_subscriber UNIQUE (message_id, subscriber_id)
    )
    "#,
];

/// SQLx-based repository over a PostgreSQL pool.
#[derive(Clone)]
pub struct PgBackplaneRepository {
    pool: PgPool,
}

impl PgBackplaneRepository {
    /// Create a new repository with the given database pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a verified connection pool from the configuration.
    pub async fn connect(config: &BackplaneConfig) -> Result<Self, sqlx::Error> {
        debug!(
            max_connections = config.max_connections,
            connect_timeout_secs = config.connect_timeout.as_secs(),
            "Creating backplane database pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .test_before_acquire(true)
            .connect(&config.database_url)
            .await?;

        match tokio::time::timeout(
            config.connect_timeout,
            sqlx::query("SELECT 1").execute(&pool),
        )
        .await
        {
            Ok(Ok(_)) => {
                info!("Backplane database pool created and verified");
                Ok(Self::new(pool))
            }
            Ok(Err(e)) => {
                error!(error = %e, "Backplane database verification failed");
                Err(e)
            }
            Err(_) => {
                error!(
                    timeout_secs = config.connect_timeout.as_secs(),
                    "Backplane database verification timeout"
                );
                Err(sqlx::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "Database verification timeout",
                )))
            }
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn stored_message(row: PgRow) -> Result<StoredMessage, sqlx::Error> {
        Ok(StoredMessage {
            id: row.try_get("id")?,
            channel: row.try_get("channel")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            is_deleted: row.try_get("is_deleted")?,
        })
    }
}

fn interval_secs(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

#[async_trait]
impl BackplaneRepository for PgBackplaneRepository {
    async fn provision_schema(&self) -> BackplaneResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .context("Failed to acquire schema provisioning lock")?;

        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .context("Failed to provision backplane schema")?;
        }

        tx.commit().await?;
        info!("Backplane schema provisioned");
        Ok(())
    }

    async fn verify_schema(&self) -> BackplaneResult<()> {
        for table in [
            "backplane_messages",
            "backplane_subscribers",
            "backplane_acks",
        ] {
            let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
                .bind(table)
                .fetch_one(&self.pool)
                .await?;

            if !exists {
                return Err(BackplaneError::SchemaUnavailable(format!(
                    "table {} does not exist",
                    table
                )));
            }
        }
        Ok(())
    }

    async fn insert_message(
        &self,
        channel: &str,
        payload: &serde_json::Value,
    ) -> BackplaneResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO backplane_messages (channel, payload, created_at, is_deleted)
            VALUES ($1, $2, NOW(), FALSE)
            RETURNING id
            "#,
        )
        .bind(channel)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn fetch_pending(
        &self,
        channel: &str,
        subscriber_id: &str,
        after_id: i64,
        limit: i64,
    ) -> BackplaneResult<Vec<StoredMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT m.id, m.channel, m.payload, m.created_at, m.is_deleted
            FROM backplane_messages m
            WHERE m.channel = $1
              AND m.is_deleted = FALSE
              AND m.id > $3
              AND NOT EXISTS (
                  SELECT 1 FROM backplane_acks a
                  WHERE a.message_id = m.id AND a.subscriber_id = $2
              )
            ORDER BY m.id ASC
            LIMIT $4
            "#,
        )
        .bind(channel)
        .bind(subscriber_id)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .into_iter()
            .map(Self::stored_message)
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(messages)
    }

    async fn insert_ack(&self, message_id: i64, subscriber_id: &str) -> BackplaneResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO backplane_acks (message_id, subscriber_id, acknowledged_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (message_id, subscriber_id) DO NOTHING
            "#,
        )
        .bind(message_id)
        .bind(subscriber_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(e) => {
                let err = BackplaneError::from(e);
                if err.is_unique_violation() {
                    Ok(false)
                } else if err.is_foreign_key_violation() {
                    debug!(
                        message_id,
                        subscriber_id = %subscriber_id,
                        "Ack for a message that was already removed"
                    );
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn upsert_subscriber(&self, subscriber_id: &str) -> BackplaneResult<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO backplane_subscribers (id, last_seen)
            VALUES ($1, NOW())
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(subscriber_id)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(done) if done.rows_affected() > 0 => {
                debug!(subscriber_id = %subscriber_id, "Subscriber registered");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                let err = BackplaneError::from(e);
                if !err.is_unique_violation() {
                    return Err(err);
                }
            }
        }

        sqlx::query("UPDATE backplane_subscribers SET last_seen = NOW() WHERE id = $1")
            .bind(subscriber_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn active_subscribers(&self, timeout: Duration) -> BackplaneResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM backplane_subscribers
            WHERE last_seen >= NOW() - make_interval(secs => $1)
            ORDER BY id
            "#,
        )
        .bind(interval_secs(timeout))
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn ack_candidates(
        &self,
        min_acks: i64,
        after_id: i64,
        limit: i64,
    ) -> BackplaneResult<Vec<AckCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT
                m.id,
                COALESCE(
                    array_agg(a.subscriber_id) FILTER (WHERE a.subscriber_id IS NOT NULL),
                    ARRAY[]::TEXT[]
                ) AS acked_by
            FROM backplane_messages m
            LEFT JOIN backplane_acks a ON a.message_id = m.id
            WHERE m.is_deleted = FALSE
              AND m.id > $2
            GROUP BY m.id
            HAVING COUNT(a.id) >= $1
            ORDER BY m.id ASC
            LIMIT $3
            "#,
        )
        .bind(min_acks)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let candidates = rows
            .into_iter()
            .map(|row| {
                Ok(AckCandidate {
                    message_id: row.try_get("id")?,
                    acked_by: row.try_get("acked_by")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(candidates)
    }

    async fn expired_messages(
        &self,
        retention: Duration,
        after_id: i64,
        limit: i64,
    ) -> BackplaneResult<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM backplane_messages
            WHERE is_deleted = FALSE
              AND created_at < NOW() - make_interval(secs => $1)
              AND id > $2
            ORDER BY id ASC
            LIMIT $3
            "#,
        )
        .bind(interval_secs(retention))
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn delete_messages(&self, message_ids: &[i64], mode: CleanupMode) -> BackplaneResult<u64> {
        if message_ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut affected = 0u64;

        for message_id in message_ids {
            match mode {
                CleanupMode::Logical => {
                    let result = sqlx::query(
                        "UPDATE backplane_messages SET is_deleted = TRUE WHERE id = $1 AND is_deleted = FALSE",
                    )
                    .bind(message_id)
                    .execute(&mut *tx)
                    .await?;
                    affected += result.rows_affected();
                }
                CleanupMode::Physical => {
                    sqlx::query("DELETE FROM backplane_acks WHERE message_id = $1")
                        .bind(message_id)
                        .execute(&mut *tx)
                        .await?;
                    let result = sqlx::query("DELETE FROM backplane_messages WHERE id = $1")
                        .bind(message_id)
                        .execute(&mut *tx)
                        .await?;
                    affected += result.rows_affected();
                }
            }
        }

        tx.commit().await?;

        if affected < message_ids.len() as u64 {
            warn!(
                requested = message_ids.len(),
                affected, "Some messages were already removed by another cleaner"
            );
        }

        Ok(affected)
    }
}
