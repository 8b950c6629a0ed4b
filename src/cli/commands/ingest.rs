//! Ingest command implementation.

use anyhow::{Context, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Instant;
use walkdir::WalkDir;

use super::{KnowledgeBaseArgs, build_service};
use crate::cli::output::{IngestReport, get_formatter};
use crate::models::{Config, DocumentUpload, OutputFormat};
use crate::services::collection_name;
use crate::utils::{detect_mime_type, is_text_file, read_file_content};

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// File or directory to ingest
    #[arg(required = true)]
    pub path: PathBuf,

    #[command(flatten)]
    pub target: KnowledgeBaseArgs,

    /// File patterns to exclude (can be specified multiple times)
    #[arg(long, short = 'e')]
    pub exclude: Vec<String>,

    /// Show what would be ingested without ingesting
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn handle_ingest(args: IngestArgs, format: OutputFormat, verbose: bool) -> Result<()> {
    let config = Config::load()?;
    let formatter = get_formatter(format);
    let start_time = Instant::now();

    let path = args.path.canonicalize().context("invalid path")?;
    let files = collect_files(&path, &args.exclude, &config.indexing.exclude_patterns)?;

    if files.is_empty() {
        println!("{}", formatter.format_message("No files found to ingest."));
        return Ok(());
    }

    if args.dry_run {
        println!(
            "{}",
            formatter.format_message(&format!("Dry run: Would ingest {} files", files.len()))
        );
        for file in &files {
            println!("  {}", file.display());
        }
        return Ok(());
    }

    let service = build_service(&config, false)?;
    let owner = args.target.owner.as_str();
    let kb = args.target.kb.as_str();

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .context("invalid progress template")?
            .progress_chars("#>-"),
    );

    let mut report = IngestReport {
        collection: collection_name(owner, kb),
        files_scanned: files.len() as u64,
        ..Default::default()
    };

    for file_path in &files {
        pb.inc(1);

        if !is_text_file(file_path) {
            report.files_skipped += 1;
            continue;
        }

        let content = match read_file_content(file_path, config.indexing.max_file_size) {
            Ok(c) => c,
            Err(e) => {
                if verbose {
                    pb.println(format!("Skipping {}: {}", file_path.display(), e));
                }
                report.files_skipped += 1;
                continue;
            }
        };

        if content.trim().is_empty() {
            report.files_skipped += 1;
            continue;
        }

        let upload = upload_for(file_path, content.len() as u64);
        let result = service
            .process_document(owner, kb, upload, &content)
            .await
            .context("invalid knowledge base identifiers")?;

        if verbose && !result.is_success() {
            pb.println(format!(
                "Failed {}: {}",
                file_path.display(),
                result.error.as_deref().unwrap_or("unknown error")
            ));
        }
        report.documents.push(result);
    }

    pb.finish_and_clear();
    report.duration_ms = start_time.elapsed().as_millis() as u64;
    print!("{}", formatter.format_ingest_report(&report));

    Ok(())
}

fn upload_for(path: &Path, size: u64) -> DocumentUpload {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string());

    let mut upload = DocumentUpload::new(file_name, detect_mime_type(path), size)
        .with_path(path.to_string_lossy().to_string());
    if let Some(language) = detect_language(path) {
        upload = upload.with_language(language);
    }
    upload
}

fn collect_files(
    path: &Path,
    exclude: &[String],
    default_exclude: &[String],
) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let patterns: Vec<glob::Pattern> = exclude
        .iter()
        .chain(default_exclude.iter())
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect();

    let mut files = Vec::new();
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.context("failed to read directory entry")?;
        let entry_path = entry.path();

        if !entry_path.is_file() {
            continue;
        }

        let path_str = entry_path.to_string_lossy();
        if !patterns.iter().any(|p| p.matches(&path_str)) {
            files.push(entry_path.to_path_buf());
        }
    }

    files.sort();
    Ok(files)
}

/// Natural language is not detected; source files are tagged by their programming language.
fn detect_language(path: &Path) -> Option<String> {
    path.extension().and_then(|ext| {
        let ext = ext.to_string_lossy().to_lowercase();
        match ext.as_str() {
            "rs" => Some("rust"),
            "py" => Some("python"),
            "js" | "jsx" => Some("javascript"),
            "ts" | "tsx" => Some("typescript"),
            "go" => Some("go"),
            "java" => Some("java"),
            "md" | "markdown" => Some("markdown"),
            "html" | "htm" => Some("html"),
            _ => None,
        }
        .map(String::from)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_files_applies_excludes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.md"), "# keep").unwrap();
        std::fs::create_dir(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("target").join("skip.md"), "skip").unwrap();

        let files = collect_files(dir.path(), &["*/target/*".to_string()], &[]).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("keep.md"));
    }

    #[test]
    fn test_upload_for_sets_path_and_type() {
        let upload = upload_for(Path::new("/docs/guide.md"), 12);
        assert_eq!(upload.file_name, "guide.md");
        assert_eq!(upload.file_size, 12);
        assert_eq!(upload.file_path.as_deref(), Some("/docs/guide.md"));
        assert_eq!(upload.language.as_deref(), Some("markdown"));
    }
}
