//! Command-line interface over the knowledge-base service.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};

use crate::models::OutputFormat;

/// Ingest documents into per-owner knowledge bases and query them.
#[derive(Debug, Parser)]
#[command(name = "ragkb")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[arg(long, short = 'f', global = true, help = "Output format: text or json")]
    pub format: Option<OutputFormat>,

    #[arg(long, short = 'v', global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Check embedding provider, vector store and operation metrics
    Status,

    /// Chunk, embed and store files into a knowledge base
    Ingest(commands::IngestArgs),

    /// Search a knowledge base
    Search(commands::SearchArgs),

    /// Show document and chunk counts for a knowledge base
    Stats(commands::KnowledgeBaseArgs),

    /// Delete one document from a knowledge base
    Delete {
        /// Document id as reported by ingest
        #[arg(required = true)]
        document_id: String,

        #[command(flatten)]
        target: commands::KnowledgeBaseArgs,
    },

    /// Delete a whole knowledge base
    Clear {
        #[command(flatten)]
        target: commands::KnowledgeBaseArgs,

        /// Skip confirmation prompt
        #[arg(long, short = 'y')]
        force: bool,
    },

    /// Manage configuration
    #[command(subcommand)]
    Config(commands::ConfigCommand),
}
