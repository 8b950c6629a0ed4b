mod clear;
mod config;
mod delete;
mod ingest;
mod search;
mod stats;
mod status;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use crate::models::Config;
use crate::services::{KnowledgeBaseService, MetricsStore, TantivyKeywordIndex};

pub use config::ConfigCommand;
pub use ingest::IngestArgs;
pub use search::SearchArgs;

pub use clear::handle_clear;
pub use config::handle_config;
pub use delete::handle_delete;
pub use ingest::handle_ingest;
pub use search::handle_search;
pub use stats::handle_stats;
pub use status::handle_status;

/// Identifies one owner's knowledge base.
#[derive(Debug, Clone, Args)]
pub struct KnowledgeBaseArgs {
    /// Owner (tenant) id
    #[arg(long, short = 'o', env = "RAGKB_OWNER")]
    pub owner: String,

    /// Knowledge base name
    #[arg(long, short = 'k', env = "RAGKB_KB")]
    pub kb: String,
}

/// Open the metrics database if metrics are enabled. Failure only disables metrics.
pub(crate) fn open_metrics(config: &Config) -> Option<Arc<MetricsStore>> {
    if !config.metrics.enabled {
        return None;
    }
    let path = Config::metrics_db_path()?;
    if let Some(parent) = path.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        tracing::warn!(path = %parent.display(), error = %e, "cannot create data directory");
        return None;
    }
    match MetricsStore::open(&path) {
        Ok(store) => {
            store.cleanup(config.metrics.retention_days);
            Some(Arc::new(store))
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "metrics disabled");
            None
        }
    }
}

pub(crate) fn build_service(config: &Config, keyword_index: bool) -> Result<KnowledgeBaseService> {
    let mut service =
        KnowledgeBaseService::from_config(config).context("failed to initialize knowledge base")?;
    if let Some(metrics) = open_metrics(config) {
        service = service.with_metrics(metrics);
    }
    if keyword_index {
        let index = TantivyKeywordIndex::new().context("failed to create keyword index")?;
        service = service.with_keyword_index(Arc::new(index));
    }
    Ok(service)
}
