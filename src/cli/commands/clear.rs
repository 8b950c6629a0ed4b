use anyhow::Result;

use super::{KnowledgeBaseArgs, build_service};
use crate::cli::output::get_formatter;
use crate::models::{Config, OutputFormat};
use crate::services::collection_name;

pub async fn handle_clear(
    target: KnowledgeBaseArgs,
    force: bool,
    format: OutputFormat,
    verbose: bool,
) -> Result<()> {
    let config = Config::load()?;
    let formatter = get_formatter(format);
    let collection = collection_name(&target.owner, &target.kb);

    if verbose {
        eprintln!("Clearing collection {collection}...");
    }

    if !force {
        println!("This will delete ALL documents in '{collection}'. Continue? [y/N]");
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("{}", formatter.format_message("Cancelled."));
            return Ok(());
        }
    }

    let service = build_service(&config, false)?;
    let existed = service
        .clear_knowledge_base(&target.owner, &target.kb)
        .await?;

    let message = if existed {
        format!("Knowledge base {collection} has been cleared.")
    } else {
        format!("Knowledge base {collection} did not exist.")
    };
    println!("{}", formatter.format_message(&message));
    Ok(())
}
