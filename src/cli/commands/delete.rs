use anyhow::Result;

use super::{KnowledgeBaseArgs, build_service};
use crate::cli::output::get_formatter;
use crate::models::{Config, OutputFormat};

pub async fn handle_delete(
    target: KnowledgeBaseArgs,
    document_id: String,
    format: OutputFormat,
) -> Result<()> {
    let config = Config::load()?;
    let formatter = get_formatter(format);
    let service = build_service(&config, false)?;

    let deleted = service
        .delete_document(&target.owner, &target.kb, &document_id)
        .await?;

    let message = if deleted {
        format!("Deleted document {document_id}")
    } else {
        format!("Document {document_id} not found")
    };
    println!("{}", formatter.format_message(&message));
    Ok(())
}
