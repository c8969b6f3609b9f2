//! PostgreSQL storage for concord.
//!
//! [`PgServerStore`] implements [`ServerStore`] so a [`concord_core::DispatchHub`]
//! can keep its resources in Postgres. Snapshots are stored as JSONB and
//! guarded by their version: a save only lands if the row is still at the
//! version the hub loaded, which lets several hub processes share one
//! database.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE resources (
//!     id UUID PRIMARY KEY,
//!     version BIGINT NOT NULL,
//!     snapshot JSONB NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE TABLE resource_audit (
//!     id BIGSERIAL PRIMARY KEY,
//!     resource UUID NOT NULL REFERENCES resources (id) ON DELETE CASCADE,
//!     record JSONB NOT NULL,
//!     recorded_at TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE INDEX idx_resource_audit_resource ON resource_audit (resource, id);
//! ```
//!
//! [`PgServerStore::ensure_schema`] creates both tables if they are missing.
//!
//! # Usage
//!
//! ```rust,ignore
//! use concord_core::DispatchHub;
//! use concord_store_postgres::PgServerStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let store = PgServerStore::<TodoDomain>::new(pool);
//! store.ensure_schema().await?;
//!
//! let hub = DispatchHub::new(store);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concord_core::{
    AuditEntry, Domain, ResourceId, ServerSnapshot, ServerStore, SnapshotUpdate, StoreError,
};
use sqlx::{PgPool, Row};
use std::marker::PhantomData;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS resources (
    id UUID PRIMARY KEY,
    version BIGINT NOT NULL,
    snapshot JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS resource_audit (
    id BIGSERIAL PRIMARY KEY,
    resource UUID NOT NULL REFERENCES resources (id) ON DELETE CASCADE,
    record JSONB NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_resource_audit_resource ON resource_audit (resource, id);
"#;

/// PostgreSQL server store for domain `D`.
pub struct PgServerStore<D: Domain> {
    pool: PgPool,
    _domain: PhantomData<fn() -> D>,
}

impl<D: Domain> Clone for PgServerStore<D> {
    fn clone(&self) -> Self {
        Self::new(self.pool.clone())
    }
}

impl<D: Domain> PgServerStore<D> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _domain: PhantomData,
        }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables and index this store uses, if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    /// Delete audit entries recorded before `older_than`.
    pub async fn prune_audit(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM resource_audit WHERE recorded_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(result.rows_affected())
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.into())
}

fn to_db(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version)
        .map_err(|_| StoreError::Backend(anyhow::anyhow!("version {version} out of range")))
}

fn from_db(version: i64) -> Result<u64, StoreError> {
    u64::try_from(version)
        .map_err(|_| StoreError::Backend(anyhow::anyhow!("stored version {version} is negative")))
}

#[async_trait]
impl<D: Domain> ServerStore<D> for PgServerStore<D> {
    async fn create(&self, id: ResourceId, snapshot: &ServerSnapshot<D>) -> Result<(), StoreError> {
        let body = serde_json::to_value(snapshot)?;

        let result = sqlx::query(
            r#"
            INSERT INTO resources (id, version, snapshot)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(to_db(snapshot.version())?)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(id));
        }
        Ok(())
    }

    async fn load(&self, id: ResourceId) -> Result<Option<ServerSnapshot<D>>, StoreError> {
        let row = sqlx::query("SELECT snapshot FROM resources WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let body: serde_json::Value = row.try_get("snapshot").map_err(backend)?;
        Ok(Some(serde_json::from_value(body)?))
    }

    /// Compare-and-swap on the version column.
    async fn save(
        &self,
        id: ResourceId,
        expected_version: u64,
        snapshot: &ServerSnapshot<D>,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_value(snapshot)?;

        let result = sqlx::query(
            r#"
            UPDATE resources
            SET version = $3,
                snapshot = $4,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(id)
        .bind(to_db(expected_version)?)
        .bind(to_db(snapshot.version())?)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Nothing matched: either the row is gone or someone else moved it.
        let row = sqlx::query("SELECT version FROM resources WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        match row {
            None => Err(StoreError::NotFound(id)),
            Some(row) => {
                let actual: i64 = row.try_get("version").map_err(backend)?;
                Err(StoreError::VersionConflict {
                    expected: expected_version,
                    actual: from_db(actual)?,
                })
            }
        }
    }

    /// Every guarded `UPDATE` runs in one transaction; the first miss rolls
    /// the whole batch back.
    async fn save_many(&self, updates: &[SnapshotUpdate<D>]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        for update in updates {
            let body = serde_json::to_value(&update.snapshot)?;
            let result = sqlx::query(
                r#"
                UPDATE resources
                SET version = $3,
                    snapshot = $4,
                    updated_at = NOW()
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(update.id)
            .bind(to_db(update.expected_version)?)
            .bind(to_db(update.snapshot.version())?)
            .bind(body)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

            if result.rows_affected() > 0 {
                continue;
            }

            let row = sqlx::query("SELECT version FROM resources WHERE id = $1")
                .bind(update.id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(backend)?;

            // Dropping `tx` rolls back the updates already made.
            return match row {
                None => Err(StoreError::NotFound(update.id)),
                Some(row) => {
                    let actual: i64 = row.try_get("version").map_err(backend)?;
                    Err(StoreError::BatchConflict {
                        resource: update.id,
                        expected: update.expected_version,
                        actual: from_db(actual)?,
                    })
                }
            };
        }

        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry<D>) -> Result<(), StoreError> {
        let record = serde_json::to_value(&entry.record)?;

        sqlx::query(
            r#"
            INSERT INTO resource_audit (resource, record, recorded_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(entry.resource)
        .bind(record)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn audit(&self, id: ResourceId) -> Result<Vec<AuditEntry<D>>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT record, recorded_at
            FROM resource_audit
            WHERE resource = $1
            ORDER BY id ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| {
                let record: serde_json::Value = row.try_get("record").map_err(backend)?;
                Ok(AuditEntry {
                    resource: id,
                    record: serde_json::from_value(record)?,
                    recorded_at: row.try_get("recorded_at").map_err(backend)?,
                })
            })
            .collect()
    }
}
