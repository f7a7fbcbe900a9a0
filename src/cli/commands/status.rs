//! Status command.

use std::collections::BTreeMap;

use console::style;

use crate::cli::icons::{dim_arrow, warn};
use crate::config::Settings;

/// Print counts per status, or one document with its outputs.
pub async fn cmd_status(
    settings: &Settings,
    document_id: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    if !settings.database_exists() {
        println!("{} No database found. Run 'ocrflow init' first.", warn());
        return Ok(());
    }
    let store = super::open_store(settings, false).await?;

    let Some(id) = document_id else {
        let counts: BTreeMap<String, u64> = store
            .count_by_status()
            .await?
            .into_iter()
            .map(|(status, n)| (status.as_str().to_string(), n))
            .collect();
        if json {
            println!("{}", serde_json::to_string_pretty(&counts)?);
        } else if counts.is_empty() {
            println!("No documents");
        } else {
            for (status, n) in &counts {
                println!("{:<12} {}", status, n);
            }
        }
        return Ok(());
    };

    let Some(doc) = store.get_document(id).await? else {
        anyhow::bail!("Document not found: {}", id);
    };
    let outputs = store.list_outputs(id).await?;

    if json {
        let value = serde_json::json!({
            "document": doc,
            "outputs": outputs,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{} {}", style(&doc.document_id).bold(), doc.status);
    println!("  {} Object: {}", dim_arrow(), doc.object_location);
    if let Some(ref content_type) = doc.content_type {
        println!("  {} Type: {} ({} bytes)", dim_arrow(), content_type, doc.size_bytes);
    }
    if let Some(classification) = doc.classification {
        println!("  {} Path: {}", dim_arrow(), classification);
    }
    if let Some(ref job_id) = doc.job_id {
        println!("  {} Job: {}", dim_arrow(), job_id);
    }
    println!("  {} Attempts: {}", dim_arrow(), doc.attempts);
    if let Some(requested) = doc.results_requested_at {
        println!("  {} Results requested: {}", dim_arrow(), requested.to_rfc3339());
    }
    println!("  {} Updated: {}", dim_arrow(), doc.updated_at.to_rfc3339());
    for output in &outputs {
        println!("    {} -> {}", output.output_type, output.location);
    }
    Ok(())
}
