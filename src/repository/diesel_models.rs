//! Diesel ORM models for the job store tables.

use diesel::prelude::*;

use super::{parse_datetime, StoreError};
use crate::models::{Classification, DocumentRecord, DocumentStatus, ObjectLocation, OutputRecord};
use crate::schema;

/// Document row from the database.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = schema::documents)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DocumentRow {
    pub document_id: String,
    pub bucket: String,
    pub object_key: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub classification: Option<String>,
    pub job_id: Option<String>,
    pub status: String,
    pub attempts: i32,
    pub results_requested_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// New document for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::documents)]
pub struct NewDocumentRow<'a> {
    pub document_id: &'a str,
    pub bucket: &'a str,
    pub object_key: &'a str,
    pub content_type: Option<&'a str>,
    pub size_bytes: i64,
    pub classification: Option<&'a str>,
    pub job_id: Option<&'a str>,
    pub status: &'a str,
    pub attempts: i32,
    pub results_requested_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl<'a> From<&'a DocumentRecord> for NewDocumentRow<'a> {
    fn from(doc: &'a DocumentRecord) -> Self {
        Self {
            document_id: &doc.document_id,
            bucket: &doc.object_location.bucket,
            object_key: &doc.object_location.key,
            content_type: doc.content_type.as_deref(),
            size_bytes: doc.size_bytes as i64,
            classification: doc.classification.map(|c| c.as_str()),
            job_id: doc.job_id.as_deref(),
            status: doc.status.as_str(),
            attempts: doc.attempts as i32,
            results_requested_at: doc.results_requested_at.map(|t| t.to_rfc3339()),
            created_at: doc.created_at.to_rfc3339(),
            updated_at: doc.updated_at.to_rfc3339(),
        }
    }
}

impl TryFrom<DocumentRow> for DocumentRecord {
    type Error = StoreError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        let status = DocumentStatus::from_str(&row.status).ok_or_else(|| StoreError::Corrupt {
            document_id: row.document_id.clone(),
            reason: format!("unknown status '{}'", row.status),
        })?;
        let classification = match row.classification.as_deref() {
            Some(c) => Some(Classification::from_str(c).ok_or_else(|| StoreError::Corrupt {
                document_id: row.document_id.clone(),
                reason: format!("unknown classification '{}'", c),
            })?),
            None => None,
        };
        Ok(DocumentRecord {
            document_id: row.document_id,
            object_location: ObjectLocation::new(row.bucket, row.object_key),
            content_type: row.content_type,
            size_bytes: row.size_bytes.max(0) as u64,
            classification,
            job_id: row.job_id,
            status,
            attempts: row.attempts.max(0) as u32,
            results_requested_at: row.results_requested_at.as_deref().map(parse_datetime),
            created_at: parse_datetime(&row.created_at),
            updated_at: parse_datetime(&row.updated_at),
        })
    }
}

/// Output row from the database.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = schema::outputs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct OutputRow {
    pub document_id: String,
    pub output_type: String,
    pub bucket: String,
    pub object_key: String,
    pub written_at: String,
}

/// New output for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::outputs)]
pub struct NewOutputRow<'a> {
    pub document_id: &'a str,
    pub output_type: &'a str,
    pub bucket: &'a str,
    pub object_key: &'a str,
    pub written_at: String,
}

impl<'a> From<&'a OutputRecord> for NewOutputRow<'a> {
    fn from(output: &'a OutputRecord) -> Self {
        Self {
            document_id: &output.document_id,
            output_type: &output.output_type,
            bucket: &output.location.bucket,
            object_key: &output.location.key,
            written_at: output.written_at.to_rfc3339(),
        }
    }
}

impl From<OutputRow> for OutputRecord {
    fn from(row: OutputRow) -> Self {
        OutputRecord {
            document_id: row.document_id,
            output_type: row.output_type,
            location: ObjectLocation::new(row.bucket, row.object_key),
            written_at: parse_datetime(&row.written_at),
        }
    }
}
