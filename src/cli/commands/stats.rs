use anyhow::Result;

use super::{KnowledgeBaseArgs, build_service};
use crate::cli::output::get_formatter;
use crate::models::{Config, OutputFormat};
use crate::services::collection_name;

pub async fn handle_stats(target: KnowledgeBaseArgs, format: OutputFormat) -> Result<()> {
    let config = Config::load()?;
    let formatter = get_formatter(format);
    let service = build_service(&config, false)?;

    let stats = service.get_stats(&target.owner, &target.kb).await?;
    print!(
        "{}",
        formatter.format_kb_stats(&collection_name(&target.owner, &target.kb), &stats)
    );
    Ok(())
}
