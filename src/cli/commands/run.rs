//! Run the pipeline over local files.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use console::style;

use crate::cli::icons::{dim_arrow, error, success, warn};
use crate::config::Settings;
use crate::models::{document_id_for, DocumentStatus, ObjectCreatedEvent, ObjectLocation};
use crate::pipeline::{analysis_service, Pipeline};
use crate::storage::{guess_content_type, FsObjectStore, InMemoryObjectStore, ObjectStore};
use crate::topic::CompletionTopic;

/// Upload `files`, route them through the pipeline and report how each ended.
pub async fn cmd_run(
    settings: Settings,
    files: &[PathBuf],
    wait_secs: u64,
    memory: bool,
) -> anyhow::Result<()> {
    let store = super::open_store(&settings, memory).await?;
    let objects: Arc<dyn ObjectStore> = if memory {
        Arc::new(InMemoryObjectStore::new())
    } else {
        tokio::fs::create_dir_all(&settings.objects_dir).await?;
        Arc::new(FsObjectStore::new(&settings.objects_dir))
    };
    let topic = CompletionTopic::new(settings.notification.topic.clone());
    let analysis = analysis_service(&settings, objects.clone(), &topic)?;
    let bucket = settings.bucket.clone();

    let handle = Pipeline::build(settings, store.clone(), objects.clone(), analysis, topic).start();

    let mut document_ids = Vec::with_capacity(files.len());
    for path in files {
        let key = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => anyhow::bail!("Not a file: {}", path.display()),
        };
        let bytes = tokio::fs::read(path).await?;
        let location = ObjectLocation::new(&bucket, key);
        let content_type = guess_content_type(&location);
        let size_bytes = bytes.len() as u64;

        objects.put(&location, bytes, content_type.as_deref()).await?;
        document_ids.push(document_id_for(&location));
        handle
            .submit(ObjectCreatedEvent {
                location,
                size_bytes,
                content_type,
            })
            .await?;
    }
    println!("{} Submitted {} file(s)", success(), files.len());

    let finished = handle
        .wait_for_terminal(&document_ids, Duration::from_secs(wait_secs))
        .await?;
    if !finished {
        println!(
            "{} Not every document finished within {}s",
            warn(),
            wait_secs
        );
    }

    for (path, id) in files.iter().zip(&document_ids) {
        let Some(doc) = store.get_document(id).await? else {
            println!("{} {} was never registered", error(), path.display());
            continue;
        };
        let outputs = store.list_outputs(id).await?;
        let icon = match doc.status {
            DocumentStatus::Succeeded => success(),
            DocumentStatus::Failed => error(),
            _ => warn(),
        };
        let classification = doc
            .classification
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} {} {} [{}] {} output(s)",
            icon,
            style(&doc.document_id).bold(),
            doc.status,
            classification,
            outputs.len()
        );
        println!("  {} {}", dim_arrow(), doc.object_location);
    }

    let pending = handle.pending_results().await;
    if pending > 0 {
        println!("{} {} result fetch(es) still queued", warn(), pending);
    }

    let dead_letters = handle.pipeline().dead_letters.list().await;
    if !dead_letters.is_empty() {
        println!("{} {} dead-lettered message(s)", error(), dead_letters.len());
        for letter in &dead_letters {
            println!(
                "  {} {} {} after {} receive(s): {}",
                dim_arrow(),
                letter.source_queue,
                letter.message.document_id,
                letter.receive_count,
                letter.last_error.as_deref().unwrap_or("no error recorded")
            );
        }
    }

    handle.shutdown().await;
    Ok(())
}
