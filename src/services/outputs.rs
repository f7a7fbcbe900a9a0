//! Output generation: per-page artifacts written next to the source object.
//!
//! Layout under `{objectKey}-analysis/{documentId}/`:
//!
//! | output type         | object                    |
//! |---------------------|---------------------------|
//! | `Response`          | `response.json`           |
//! | `page-{n}-Response` | `page-{n}-response.json`  |
//! | `page-{n}-Text`     | `page-{n}-text.txt`       |
//! | `page-{n}-Forms`    | `page-{n}-forms.csv`      |
//! | `page-{n}-Tables`   | `page-{n}-tables.csv`     |

use std::sync::Arc;

use crate::analysis::{AnalysisOutput, FeatureSet, PageAnalysis, Table};
use crate::models::{DocumentRecord, ObjectLocation, OutputRecord};
use crate::repository::JobStore;
use crate::storage::ObjectStore;

use super::StageError;

struct Artifact {
    output_type: String,
    file_name: String,
    content_type: &'static str,
    bytes: Vec<u8>,
}

#[derive(Clone)]
pub struct OutputGenerator {
    objects: Arc<dyn ObjectStore>,
    store: Arc<dyn JobStore>,
    features: FeatureSet,
}

impl OutputGenerator {
    pub fn new(objects: Arc<dyn ObjectStore>, store: Arc<dyn JobStore>, features: FeatureSet) -> Self {
        Self {
            objects,
            store,
            features,
        }
    }

    pub fn features(&self) -> FeatureSet {
        self.features
    }

    /// Write every artifact for `output` and upsert its output record.
    ///
    /// Safe to repeat: objects are overwritten in place and records are
    /// upserted by `(document_id, output_type)`.
    pub async fn write(
        &self,
        document: &DocumentRecord,
        output: &AnalysisOutput,
    ) -> Result<Vec<OutputRecord>, StageError> {
        if output.is_empty() {
            tracing::debug!("No pages for {}; nothing to write", document.document_id);
            return Ok(Vec::new());
        }

        let prefix = format!(
            "{}-analysis/{}",
            document.object_location.key, document.document_id
        );
        let mut records = Vec::new();
        for artifact in self.render(output)? {
            let location = ObjectLocation::new(
                document.object_location.bucket.clone(),
                format!("{}/{}", prefix, artifact.file_name),
            );
            self.objects
                .put(&location, artifact.bytes, Some(artifact.content_type))
                .await?;
            let record = OutputRecord::new(&document.document_id, artifact.output_type, location);
            self.store.put_output(&record).await?;
            records.push(record);
        }

        tracing::info!(
            "Wrote {} outputs for {} under {}",
            records.len(),
            document.document_id,
            prefix
        );
        Ok(records)
    }

    fn render(&self, output: &AnalysisOutput) -> Result<Vec<Artifact>, StageError> {
        let mut artifacts = vec![Artifact {
            output_type: "Response".to_string(),
            file_name: "response.json".to_string(),
            content_type: "application/json",
            bytes: serde_json::to_vec_pretty(output)?,
        }];

        for page in &output.pages {
            let n = page.page_number;
            artifacts.push(Artifact {
                output_type: format!("page-{}-Response", n),
                file_name: format!("page-{}-response.json", n),
                content_type: "application/json",
                bytes: serde_json::to_vec_pretty(page)?,
            });
            artifacts.push(Artifact {
                output_type: format!("page-{}-Text", n),
                file_name: format!("page-{}-text.txt", n),
                content_type: "text/plain",
                bytes: page.text().into_bytes(),
            });
            if self.features.forms {
                artifacts.push(Artifact {
                    output_type: format!("page-{}-Forms", n),
                    file_name: format!("page-{}-forms.csv", n),
                    content_type: "text/csv",
                    bytes: forms_csv(page)?,
                });
            }
            if self.features.tables {
                artifacts.push(Artifact {
                    output_type: format!("page-{}-Tables", n),
                    file_name: format!("page-{}-tables.csv", n),
                    content_type: "text/csv",
                    bytes: tables_csv(&page.tables)?,
                });
            }
        }
        Ok(artifacts)
    }
}

fn forms_csv(page: &PageAnalysis) -> Result<Vec<u8>, StageError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["Key", "Value"])?;
    for kv in &page.key_values {
        writer.write_record([kv.key.as_str(), kv.value.as_deref().unwrap_or("")])?;
    }
    writer
        .into_inner()
        .map_err(|e| StageError::Output(e.to_string()))
}

/// Tables one after another, separated by a blank line.
fn tables_csv(tables: &[Table]) -> Result<Vec<u8>, StageError> {
    let mut out = Vec::new();
    for (i, table) in tables.iter().enumerate() {
        if i > 0 {
            out.push(b'\n');
        }
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(Vec::new());
        for row in &table.rows {
            writer.write_record(row)?;
        }
        out.extend(
            writer
                .into_inner()
                .map_err(|e| StageError::Output(e.to_string()))?,
        );
    }
    Ok(out)
}
