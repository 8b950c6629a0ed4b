use std::fmt::Write as FmtWrite;

use serde::Serialize;

use crate::models::{DocumentUploadResult, KnowledgeBaseStats, OutputFormat, SearchResult};
use crate::services::{MetricsSummary, Operation};

pub trait Formatter {
    fn format_search_results(&self, results: &SearchReport) -> String;
    fn format_status(&self, status: &StatusInfo) -> String;
    fn format_ingest_report(&self, report: &IngestReport) -> String;
    fn format_kb_stats(&self, collection: &str, stats: &KnowledgeBaseStats) -> String;
    fn format_message(&self, message: &str) -> String;
    fn format_error(&self, error: &str) -> String;
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchReport {
    pub query: String,
    pub collection: String,
    pub hybrid: bool,
    pub duration_ms: u64,
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub embedding_driver: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub vector_store_driver: String,
    pub vector_store_url: String,
    pub vector_store_connected: bool,
    pub circuit_state: String,
    pub metrics: Vec<(Operation, MetricsSummary)>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub collection: String,
    pub files_scanned: u64,
    pub files_skipped: u64,
    pub documents: Vec<DocumentUploadResult>,
    pub duration_ms: u64,
}

impl IngestReport {
    pub fn succeeded(&self) -> usize {
        self.documents.iter().filter(|d| d.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.documents.len() - self.succeeded()
    }

    pub fn chunks_created(&self) -> u64 {
        self.documents
            .iter()
            .map(|d| u64::from(d.chunks_processed))
            .sum()
    }
}

pub struct TextFormatter;

impl Formatter for TextFormatter {
    fn format_search_results(&self, report: &SearchReport) -> String {
        if report.results.is_empty() {
            return format!("No results found for: {}\n", report.query);
        }

        let mut output = String::new();
        writeln!(output, "Search results for: \"{}\"", report.query).unwrap();
        writeln!(
            output,
            "Found {} results in {}ms{}\n",
            report.results.len(),
            report.duration_ms,
            if report.hybrid { " (hybrid)" } else { "" }
        )
        .unwrap();

        for (i, result) in report.results.iter().enumerate() {
            let marker = if result.keyword_match { " +kw" } else { "" };
            writeln!(output, "{}. [Score: {:.3}{}]", i + 1, result.score, marker).unwrap();
            let doc = &result.metadata.document;
            writeln!(
                output,
                "   Document: {} ({}, chunk {})",
                doc.file_name, doc.document_id, result.metadata.chunk_index
            )
            .unwrap();
            writeln!(output, "   ---").unwrap();

            let preview: String = result.content.chars().take(200).collect();
            let preview = if result.content.chars().count() > 200 {
                format!("{}...", preview)
            } else {
                preview
            };
            for line in preview.lines() {
                writeln!(output, "   {}", line).unwrap();
            }
            writeln!(output).unwrap();
        }

        output
    }

    fn format_status(&self, status: &StatusInfo) -> String {
        let mut output = String::new();
        writeln!(output, "Status").unwrap();
        writeln!(output, "------").unwrap();

        writeln!(output, "Embedding:     {}", status.embedding_driver).unwrap();
        writeln!(output, "  Model:       {}", status.embedding_model).unwrap();
        writeln!(output, "  Dimension:   {}", status.embedding_dimension).unwrap();
        writeln!(output).unwrap();

        let vector_status = if status.vector_store_connected {
            "[CONNECTED]"
        } else {
            "[DISCONNECTED]"
        };
        writeln!(
            output,
            "Vector Store:  {} ({})",
            status.vector_store_driver, vector_status
        )
        .unwrap();
        writeln!(output, "  URL:         {}", status.vector_store_url).unwrap();
        writeln!(output, "  Circuit:     {}", status.circuit_state).unwrap();

        if !status.metrics.is_empty() {
            writeln!(output).unwrap();
            writeln!(output, "Operations").unwrap();
            for (op, m) in &status.metrics {
                write!(
                    output,
                    "  {:<8} {:>6} req  {:>6}ms avg",
                    op.as_str(),
                    m.total_requests,
                    m.avg_latency_ms
                )
                .unwrap();
                if m.error_rate > 0.0 {
                    write!(output, "  {:.1}% errors", m.error_rate).unwrap();
                }
                writeln!(output).unwrap();
            }
        }

        output
    }

    fn format_ingest_report(&self, report: &IngestReport) -> String {
        let mut output = String::new();
        writeln!(output, "Ingestion Complete").unwrap();
        writeln!(output, "------------------").unwrap();
        writeln!(output, "Collection: {}", report.collection).unwrap();
        writeln!(output, "Files scanned: {}", report.files_scanned).unwrap();
        writeln!(output, "Files skipped: {}", report.files_skipped).unwrap();
        writeln!(output, "Documents processed: {}", report.succeeded()).unwrap();
        writeln!(output, "Documents failed: {}", report.failed()).unwrap();
        writeln!(output, "Chunks created: {}", report.chunks_created()).unwrap();
        writeln!(output, "Duration: {}ms", report.duration_ms).unwrap();

        for doc in report.documents.iter().filter(|d| !d.is_success()) {
            writeln!(
                output,
                "  failed: {} ({})",
                doc.metadata.file_name,
                doc.error.as_deref().unwrap_or("unknown error")
            )
            .unwrap();
        }
        output
    }

    fn format_kb_stats(&self, collection: &str, stats: &KnowledgeBaseStats) -> String {
        let mut output = String::new();
        writeln!(output, "Knowledge Base: {}", collection).unwrap();
        writeln!(output, "  Documents:   {}", stats.document_count).unwrap();
        writeln!(output, "  Chunks:      {}", stats.chunk_count).unwrap();
        writeln!(output, "  Total size:  {} bytes", stats.total_size_bytes).unwrap();
        output
    }

    fn format_message(&self, message: &str) -> String {
        format!("{}\n", message)
    }

    fn format_error(&self, error: &str) -> String {
        format!("Error: {}\n", error)
    }
}

pub struct JsonFormatter {
    pub pretty: bool,
}

impl JsonFormatter {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    fn render<T: Serialize + ?Sized>(&self, value: &T) -> String {
        let rendered = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };
        rendered.unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
    }
}

impl Formatter for JsonFormatter {
    fn format_search_results(&self, report: &SearchReport) -> String {
        self.render(report)
    }

    fn format_status(&self, status: &StatusInfo) -> String {
        let metrics: serde_json::Map<String, serde_json::Value> = status
            .metrics
            .iter()
            .map(|(op, m)| {
                (
                    op.as_str().to_string(),
                    serde_json::json!({
                        "total_requests": m.total_requests,
                        "avg_latency_ms": m.avg_latency_ms,
                        "error_rate": m.error_rate,
                    }),
                )
            })
            .collect();

        let json = serde_json::json!({
            "embedding": {
                "driver": status.embedding_driver,
                "model": status.embedding_model,
                "dimension": status.embedding_dimension,
            },
            "vector_store": {
                "driver": status.vector_store_driver,
                "url": status.vector_store_url,
                "connected": status.vector_store_connected,
                "circuit": status.circuit_state,
            },
            "metrics": metrics,
        });
        self.render(&json)
    }

    fn format_ingest_report(&self, report: &IngestReport) -> String {
        let json = serde_json::json!({
            "collection": report.collection,
            "files_scanned": report.files_scanned,
            "files_skipped": report.files_skipped,
            "documents_processed": report.succeeded(),
            "documents_failed": report.failed(),
            "chunks_created": report.chunks_created(),
            "duration_ms": report.duration_ms,
            "documents": report.documents,
        });
        self.render(&json)
    }

    fn format_kb_stats(&self, collection: &str, stats: &KnowledgeBaseStats) -> String {
        let json = serde_json::json!({
            "collection": collection,
            "document_count": stats.document_count,
            "chunk_count": stats.chunk_count,
            "total_size_bytes": stats.total_size_bytes,
        });
        self.render(&json)
    }

    fn format_message(&self, message: &str) -> String {
        serde_json::json!({"message": message}).to_string()
    }

    fn format_error(&self, error: &str) -> String {
        serde_json::json!({"error": error}).to_string()
    }
}

pub fn get_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Text => Box::new(TextFormatter),
        OutputFormat::Json => Box::new(JsonFormatter::new(true)),
    }
}
