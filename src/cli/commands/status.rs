use anyhow::Result;

use super::open_metrics;
use crate::cli::output::{StatusInfo, get_formatter};
use crate::models::{Config, OutputFormat, VectorDriver};
use crate::services::{Operation, VectorStoreClient, create_provider};

pub async fn handle_status(format: OutputFormat, _verbose: bool) -> Result<()> {
    let config = Config::load()?;
    let formatter = get_formatter(format);

    let (embedding_model, embedding_dimension) = match create_provider(&config.embedding) {
        Ok(provider) => (provider.model_id().to_string(), provider.dimension()),
        Err(e) => (
            format!("unavailable ({e})"),
            config.embedding.dimension as usize,
        ),
    };

    let (vector_store_connected, circuit_state) = match VectorStoreClient::from_config(&config) {
        Ok(client) => {
            let connected = client.health_check().await;
            (connected, client.circuit_state().to_string())
        }
        Err(e) => {
            tracing::debug!(error = %e, "failed to build vector store client");
            (false, "unknown".to_string())
        }
    };

    let metrics = open_metrics(&config)
        .map(|store| {
            Operation::ALL
                .iter()
                .map(|op| {
                    (
                        *op,
                        store.get_summary(Some(*op), config.metrics.retention_days),
                    )
                })
                .filter(|(_, summary)| summary.total_requests > 0)
                .collect()
        })
        .unwrap_or_default();

    let status = StatusInfo {
        embedding_driver: config.embedding.driver.to_string(),
        embedding_model,
        embedding_dimension,
        vector_store_driver: config.vector_store.driver.to_string(),
        vector_store_url: config.vector_store.url.clone(),
        vector_store_connected,
        circuit_state,
        metrics,
    };

    print!("{}", formatter.format_status(&status));

    if !vector_store_connected {
        eprintln!();
        match config.vector_store.driver {
            VectorDriver::Qdrant => {
                eprintln!(
                    "Warning: Qdrant not reachable at {}",
                    config.vector_store.url
                );
            }
            VectorDriver::Http => {
                eprintln!(
                    "Warning: vector store not reachable at {}. Set RAGKB_STORE_URL or vector_store.url.",
                    config.vector_store.url
                );
            }
            VectorDriver::Memory => {}
        }
    }

    Ok(())
}
