//! Diesel-based job store for SQLite.
//!
//! Conditional writes are plain `UPDATE ... WHERE` statements; the affected
//! row count tells the caller whether it won.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{RunQueryDsl, SimpleAsyncConnection};

use super::diesel_models::{DocumentRow, NewDocumentRow, NewOutputRow, OutputRow};
use super::diesel_pool::{AsyncSqliteConnection, AsyncSqlitePool, DieselError};
use super::{check_transition, JobStore, StoreError, StoreResult};
use crate::models::{Classification, DocumentRecord, DocumentStatus, OutputRecord};
use crate::schema::{documents, outputs};

const SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS documents (
        document_id TEXT PRIMARY KEY,
        bucket TEXT NOT NULL,
        object_key TEXT NOT NULL,
        content_type TEXT,
        size_bytes BIGINT NOT NULL DEFAULT 0,
        classification TEXT,
        job_id TEXT,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        results_requested_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status, updated_at);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_job_id ON documents(job_id)
        WHERE job_id IS NOT NULL;

    CREATE TABLE IF NOT EXISTS outputs (
        document_id TEXT NOT NULL,
        output_type TEXT NOT NULL,
        bucket TEXT NOT NULL,
        object_key TEXT NOT NULL,
        written_at TEXT NOT NULL,
        PRIMARY KEY (document_id, output_type)
    );
"#;

fn in_flight() -> Vec<&'static str> {
    vec![DocumentStatus::Submitted.as_str(), DocumentStatus::InProgress.as_str()]
}

/// SQLite-backed job store.
#[derive(Clone)]
pub struct DieselJobStore {
    pool: AsyncSqlitePool,
}

impl DieselJobStore {
    pub fn new(pool: AsyncSqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they don't exist.
    pub async fn init_schema(&self) -> Result<(), DieselError> {
        let mut conn = self.pool.get().await?;
        conn.batch_execute(SCHEMA_SQL).await
    }

    async fn ensure_exists(conn: &mut AsyncSqliteConnection, document_id: &str) -> StoreResult<()> {
        use diesel::dsl::count_star;
        let count: i64 = documents::table
            .filter(documents::document_id.eq(document_id))
            .select(count_star())
            .first(conn)
            .await?;
        if count == 0 {
            return Err(StoreError::NotFound(document_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for DieselJobStore {
    async fn get_document(&self, document_id: &str) -> StoreResult<Option<DocumentRecord>> {
        let mut conn = self.pool.get().await?;

        let row = documents::table
            .find(document_id)
            .select(DocumentRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        row.map(DocumentRecord::try_from).transpose()
    }

    async fn insert_document(&self, document: &DocumentRecord) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;

        let rows = diesel::insert_or_ignore_into(documents::table)
            .values(NewDocumentRow::from(document))
            .execute(&mut conn)
            .await?;

        Ok(rows == 1)
    }

    async fn set_classification(
        &self,
        document_id: &str,
        classification: Classification,
    ) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now().to_rfc3339();

        let rows = diesel::update(
            documents::table
                .filter(documents::document_id.eq(document_id))
                .filter(documents::classification.is_null()),
        )
        .set((
            documents::classification.eq(Some(classification.as_str())),
            documents::updated_at.eq(now.as_str()),
        ))
        .execute(&mut conn)
        .await?;

        if rows == 0 {
            Self::ensure_exists(&mut conn, document_id).await?;
        }
        Ok(rows == 1)
    }

    async fn set_job_id(&self, document_id: &str, job_id: &str) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now().to_rfc3339();

        let rows = diesel::update(
            documents::table
                .filter(documents::document_id.eq(document_id))
                .filter(documents::job_id.is_null())
                .filter(documents::status.eq(DocumentStatus::Routed.as_str())),
        )
        .set((
            documents::job_id.eq(Some(job_id)),
            documents::status.eq(DocumentStatus::Submitted.as_str()),
            documents::attempts.eq(documents::attempts + 1),
            documents::updated_at.eq(now.as_str()),
        ))
        .execute(&mut conn)
        .await?;

        if rows == 0 {
            Self::ensure_exists(&mut conn, document_id).await?;
        }
        Ok(rows == 1)
    }

    async fn transition(
        &self,
        document_id: &str,
        from: &[DocumentStatus],
        to: DocumentStatus,
    ) -> StoreResult<bool> {
        check_transition(from, to)?;
        let mut conn = self.pool.get().await?;
        let now = Utc::now().to_rfc3339();
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();

        let rows = diesel::update(
            documents::table
                .filter(documents::document_id.eq(document_id))
                .filter(documents::status.eq_any(from)),
        )
        .set((
            documents::status.eq(to.as_str()),
            documents::updated_at.eq(now.as_str()),
        ))
        .execute(&mut conn)
        .await?;

        if rows == 0 {
            Self::ensure_exists(&mut conn, document_id).await?;
        }
        Ok(rows == 1)
    }

    async fn record_attempt(&self, document_id: &str) -> StoreResult<u32> {
        let mut conn = self.pool.get().await?;

        let now = Utc::now().to_rfc3339();

        let rows = diesel::update(documents::table.find(document_id))
            .set((
                documents::attempts.eq(documents::attempts + 1),
                documents::updated_at.eq(now.as_str()),
            ))
            .execute(&mut conn)
            .await?;
        if rows == 0 {
            return Err(StoreError::NotFound(document_id.to_string()));
        }

        let attempts: i32 = documents::table
            .find(document_id)
            .select(documents::attempts)
            .first(&mut conn)
            .await?;
        Ok(attempts.max(0) as u32)
    }

    async fn request_results(&self, document_id: &str) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now().to_rfc3339();

        let rows = diesel::update(
            documents::table
                .filter(documents::document_id.eq(document_id))
                .filter(documents::status.eq_any(in_flight()))
                .filter(documents::results_requested_at.is_null()),
        )
        .set((
            documents::status.eq(DocumentStatus::InProgress.as_str()),
            documents::results_requested_at.eq(Some(now.as_str())),
            documents::updated_at.eq(now.as_str()),
        ))
        .execute(&mut conn)
        .await?;

        if rows == 0 {
            Self::ensure_exists(&mut conn, document_id).await?;
        }
        Ok(rows == 1)
    }

    async fn find_by_job_id(&self, job_id: &str) -> StoreResult<Option<DocumentRecord>> {
        let mut conn = self.pool.get().await?;

        let row = documents::table
            .filter(documents::job_id.eq(Some(job_id)))
            .select(DocumentRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        row.map(DocumentRecord::try_from).transpose()
    }

    async fn scan_by_status(
        &self,
        statuses: &[DocumentStatus],
        limit: usize,
    ) -> StoreResult<Vec<DocumentRecord>> {
        let mut conn = self.pool.get().await?;
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();

        let rows = documents::table
            .filter(documents::status.eq_any(statuses))
            .order((documents::updated_at.asc(), documents::document_id.asc()))
            .limit(limit as i64)
            .select(DocumentRow::as_select())
            .load(&mut conn)
            .await?;

        rows.into_iter().map(DocumentRecord::try_from).collect()
    }

    async fn scan_in_flight(
        &self,
        results_requested: bool,
        limit: usize,
    ) -> StoreResult<Vec<DocumentRecord>> {
        let mut conn = self.pool.get().await?;

        let rows = documents::table
            .filter(documents::status.eq_any(in_flight()))
            .filter(documents::results_requested_at.is_null().eq(!results_requested))
            .order((documents::updated_at.asc(), documents::document_id.asc()))
            .limit(limit as i64)
            .select(DocumentRow::as_select())
            .load(&mut conn)
            .await?;

        rows.into_iter().map(DocumentRecord::try_from).collect()
    }

    async fn put_output(&self, output: &OutputRecord) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;

        // REPLACE INTO keyed by (document_id, output_type)
        diesel::replace_into(outputs::table)
            .values(NewOutputRow::from(output))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    async fn list_outputs(&self, document_id: &str) -> StoreResult<Vec<OutputRecord>> {
        let mut conn = self.pool.get().await?;

        let rows = outputs::table
            .filter(outputs::document_id.eq(document_id))
            .order(outputs::output_type.asc())
            .select(OutputRow::as_select())
            .load(&mut conn)
            .await?;

        Ok(rows.into_iter().map(OutputRecord::from).collect())
    }

    async fn count_by_status(&self) -> StoreResult<BTreeMap<DocumentStatus, u64>> {
        use diesel::dsl::count_star;
        let mut conn = self.pool.get().await?;

        let rows: Vec<(String, i64)> = documents::table
            .group_by(documents::status)
            .select((documents::status, count_star()))
            .load(&mut conn)
            .await?;

        let mut counts = BTreeMap::new();
        for (status, count) in rows {
            match DocumentStatus::from_str(&status) {
                Some(s) => {
                    counts.insert(s, count.max(0) as u64);
                }
                None => tracing::warn!("Ignoring documents with unknown status '{}'", status),
            }
        }
        Ok(counts)
    }
}
