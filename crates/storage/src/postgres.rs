use std::future::Future;
use std::time::Duration;

use sqlx::Row;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use tablegate_contracts::{Attributes, ErrorKind, OwnershipCondition, Record};

use crate::StorageEngine;

const SELECT_COLUMNS: &str = "SELECT id, owner_id, created_at, attributes FROM tablegate_records";

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

#[derive(Debug)]
pub enum PgStoreError {
    Timeout,
    Sqlx(sqlx::Error),
    ItemNotFound,
    ConditionalCheckFailed,
    DuplicateKey,
}

impl std::fmt::Display for PgStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PgStoreError::Timeout => write!(f, "postgres operation timed out"),
            PgStoreError::Sqlx(err) => write!(f, "postgres sql error: {}", err),
            PgStoreError::ItemNotFound => write!(f, "no row with this id"),
            PgStoreError::ConditionalCheckFailed => write!(f, "row is owned by another principal"),
            PgStoreError::DuplicateKey => write!(f, "a row with this id already exists"),
        }
    }
}

impl std::error::Error for PgStoreError {}

impl From<sqlx::Error> for PgStoreError {
    fn from(value: sqlx::Error) -> Self {
        PgStoreError::Sqlx(value)
    }
}

/// Postgres-backed engine: one table keyed by id plus an index on owner id.
#[derive(Clone)]
pub struct PgEngine {
    pool: sqlx::PgPool,
    op_timeout: Duration,
}

impl PgEngine {
    pub async fn connect(db_url: &str, op_timeout: Duration) -> Result<Self, PgStoreError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| PgStoreError::Timeout)??;

        Ok(Self { pool, op_timeout })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        op_timeout: Duration,
    ) -> Result<Self, PgStoreError> {
        let engine = Self::connect(db_url, op_timeout).await?;
        engine.migrate().await?;
        Ok(engine)
    }

    pub fn from_pool(pool: sqlx::PgPool, op_timeout: Duration) -> Self {
        Self { pool, op_timeout }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), PgStoreError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| PgStoreError::Timeout)??;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), PgStoreError> {
        self.bounded(sqlx::query("SELECT 1").execute(&self.pool))
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, PgStoreError> {
        Ok(tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| PgStoreError::Timeout)??)
    }

    /// Runs a guarded statement that reports whether the row existed and whether
    /// the write applied, then maps the pair onto the native error vocabulary.
    /// `found` must come from the same locked read the write used: a row deleted
    /// while the statement waited on its lock reads as absent, not as foreign.
    async fn guarded(&self, query: PgQuery<'_>) -> Result<(), PgStoreError> {
        let row = self.bounded(query.fetch_one(&self.pool)).await?;
        let found: bool = row.try_get("found")?;
        let applied: bool = row.try_get("applied")?;
        match (found, applied) {
            (_, true) => Ok(()),
            (false, false) => Err(PgStoreError::ItemNotFound),
            (true, false) => Err(PgStoreError::ConditionalCheckFailed),
        }
    }
}

fn decode_record(row: &PgRow) -> Result<Record, sqlx::Error> {
    let Json(attributes): Json<Attributes> = row.try_get("attributes")?;
    Ok(Record {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        created_at: row.try_get("created_at")?,
        attributes,
    })
}

fn decode_records(rows: &[PgRow]) -> Result<Vec<Record>, PgStoreError> {
    rows.iter()
        .map(|row| decode_record(row).map_err(PgStoreError::from))
        .collect()
}

impl StorageEngine for PgEngine {
    type Error = PgStoreError;

    async fn put_item(&self, record: Record) -> Result<(), Self::Error> {
        let result = self
            .bounded(
                sqlx::query(
                    "INSERT INTO tablegate_records (id, owner_id, created_at, attributes) VALUES ($1, $2, $3, $4) ON CONFLICT (id) DO NOTHING",
                )
                .bind(&record.id)
                .bind(&record.owner_id)
                .bind(&record.created_at)
                .bind(Json(&record.attributes))
                .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(PgStoreError::DuplicateKey);
        }
        Ok(())
    }

    async fn get_item(&self, id: &str) -> Result<Option<Record>, Self::Error> {
        let query = format!("{SELECT_COLUMNS} WHERE id = $1");
        let row = self
            .bounded(sqlx::query(&query).bind(id).fetch_optional(&self.pool))
            .await?;
        row.as_ref()
            .map(decode_record)
            .transpose()
            .map_err(PgStoreError::from)
    }

    async fn scan(&self) -> Result<Vec<Record>, Self::Error> {
        let query = format!("{SELECT_COLUMNS} ORDER BY id");
        let rows = self
            .bounded(sqlx::query(&query).fetch_all(&self.pool))
            .await?;
        decode_records(&rows)
    }

    async fn query_by_owner(&self, owner_id: &str) -> Result<Vec<Record>, Self::Error> {
        let query = format!("{SELECT_COLUMNS} WHERE owner_id = $1 ORDER BY id");
        let rows = self
            .bounded(sqlx::query(&query).bind(owner_id).fetch_all(&self.pool))
            .await?;
        decode_records(&rows)
    }

    async fn update_if_owner(
        &self,
        id: &str,
        attributes: Attributes,
        condition: &OwnershipCondition,
    ) -> Result<(), Self::Error> {
        self.guarded(
            sqlx::query(
                "WITH target AS (SELECT id, owner_id FROM tablegate_records WHERE id = $1 FOR UPDATE), \
                 updated AS (UPDATE tablegate_records t SET attributes = t.attributes || $3::jsonb FROM target WHERE t.id = target.id AND target.owner_id = $2 RETURNING t.id) \
                 SELECT EXISTS (SELECT 1 FROM target) AS found, EXISTS (SELECT 1 FROM updated) AS applied",
            )
            .bind(id)
            .bind(&condition.owner_id)
            .bind(Json(attributes)),
        )
        .await
    }

    async fn delete_if_owner(
        &self,
        id: &str,
        condition: &OwnershipCondition,
    ) -> Result<(), Self::Error> {
        self.guarded(
            sqlx::query(
                "WITH target AS (SELECT id, owner_id FROM tablegate_records WHERE id = $1 FOR UPDATE), \
                 deleted AS (DELETE FROM tablegate_records t USING target WHERE t.id = target.id AND target.owner_id = $2 RETURNING t.id) \
                 SELECT EXISTS (SELECT 1 FROM target) AS found, EXISTS (SELECT 1 FROM deleted) AS applied",
            )
            .bind(id)
            .bind(&condition.owner_id),
        )
        .await
    }

    async fn check_owner(
        &self,
        id: &str,
        condition: &OwnershipCondition,
    ) -> Result<(), Self::Error> {
        self.guarded(
            sqlx::query(
                "SELECT EXISTS (SELECT 1 FROM tablegate_records WHERE id = $1) AS found, \
                 EXISTS (SELECT 1 FROM tablegate_records WHERE id = $1 AND owner_id = $2) AS applied",
            )
            .bind(id)
            .bind(&condition.owner_id),
        )
        .await
    }

    fn classify(error: &Self::Error) -> ErrorKind {
        match error {
            PgStoreError::ItemNotFound => ErrorKind::NotFound,
            PgStoreError::ConditionalCheckFailed | PgStoreError::DuplicateKey => {
                ErrorKind::ConditionFailed
            }
            PgStoreError::Timeout => ErrorKind::Unavailable,
            PgStoreError::Sqlx(err) => classify_sqlx(err),
        }
    }
}

fn classify_sqlx(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => ErrorKind::Unavailable,
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // too_many_connections, insufficient_resources, query_canceled
            Some("53300" | "53400" | "57014") => ErrorKind::Throttled,
            // admin_shutdown, crash_shutdown, cannot_connect_now
            Some("57P01" | "57P02" | "57P03") => ErrorKind::Unavailable,
            _ => ErrorKind::Unknown,
        },
        _ => ErrorKind::Unknown,
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
