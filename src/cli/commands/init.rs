//! Initialize command.

use crate::cli::icons::{dim_arrow, success};
use crate::config::Settings;

/// Initialize the data directory, object directory and database.
pub async fn cmd_init(settings: &Settings) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&settings.data_dir).await?;
    tokio::fs::create_dir_all(&settings.objects_dir).await?;

    super::open_store(settings, false).await?;

    println!(
        "{} Initialized ocrflow in {}",
        success(),
        settings.data_dir.display()
    );
    println!("  {} Database: {}", dim_arrow(), settings.database_url());
    println!("  {} Objects: {}", dim_arrow(), settings.objects_dir.display());
    Ok(())
}
