use anyhow::{Context, Result};
use clap::Args;
use std::time::Instant;

use super::{KnowledgeBaseArgs, build_service};
use crate::cli::output::{SearchReport, get_formatter};
use crate::models::{Config, MetadataFilter, OutputFormat};
use crate::services::collection_name;

#[derive(Debug, Args)]
pub struct SearchArgs {
    #[arg(required = true, help = "Search query text")]
    pub query: String,

    #[command(flatten)]
    pub target: KnowledgeBaseArgs,

    #[arg(long, short = 'n', help = "Maximum number of results to return")]
    pub limit: Option<usize>,

    #[arg(long, help = "Minimum similarity score threshold (0.0-1.0)")]
    pub min_score: Option<f32>,

    #[arg(
        long,
        help = "Metadata equality filter, key=value (can be specified multiple times)"
    )]
    pub filter: Vec<String>,

    #[arg(long, help = "Combine vector, keyword and recency signals")]
    pub hybrid: bool,
}

fn parse_filters(raw: &[String]) -> Result<MetadataFilter> {
    raw.iter().try_fold(
        MetadataFilter::new(),
        |filter, entry| -> Result<MetadataFilter> {
            let (key, value) = entry
                .split_once('=')
                .with_context(|| format!("invalid filter '{entry}', expected key=value"))?;
            let key = key.trim();
            if key.is_empty() {
                anyhow::bail!("invalid filter '{entry}', key is empty");
            }
            Ok(filter.eq(key, value.trim()))
        },
    )
}

pub async fn handle_search(args: SearchArgs, format: OutputFormat, verbose: bool) -> Result<()> {
    let query = args.query.trim();
    if query.is_empty() {
        anyhow::bail!("search query cannot be empty");
    }

    let config = Config::load()?;
    let formatter = get_formatter(format);
    let start_time = Instant::now();

    let service = build_service(&config, args.hybrid)?;
    let mut options = service.default_search_options();
    if let Some(limit) = args.limit {
        if limit == 0 {
            anyhow::bail!("limit must be at least 1");
        }
        options = options.with_limit(limit);
    }
    if let Some(score) = args.min_score {
        if !(0.0..=1.0).contains(&score) {
            anyhow::bail!("min_score must be between 0.0 and 1.0");
        }
        options = options.with_threshold(score);
    }
    options = options.with_filters(parse_filters(&args.filter)?);

    let owner = args.target.owner.as_str();
    let kb = args.target.kb.as_str();

    if verbose {
        eprintln!("Query: \"{query}\"");
        eprintln!("  Limit: {}", options.limit);
        eprintln!("  Min score: {:.3}", options.similarity_threshold);
    }

    let results = if args.hybrid {
        let indexed = service
            .rebuild_keyword_index(owner, kb)
            .await
            .context("failed to build keyword index")?;
        if verbose {
            eprintln!("  Keyword index: {indexed} chunks");
        }
        service.hybrid_search(owner, kb, query, &options).await?
    } else {
        service.search(owner, kb, query, &options).await?
    };

    let report = SearchReport {
        query: query.to_string(),
        collection: collection_name(owner, kb),
        hybrid: args.hybrid,
        duration_ms: start_time.elapsed().as_millis() as u64,
        results,
    };
    print!("{}", formatter.format_search_results(&report));

    Ok(())
}
