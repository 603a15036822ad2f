//! notechat - ask questions about your documents
//!
//! Usage:
//!   notechat ingest <files..>      Build the index from documents
//!   notechat ask "question"        Answer from the ingested documents
//!   notechat search "query"        Show the chunks a question retrieves
//!   notechat status                Show index status
//!   notechat chunks                List stored chunks
//!   notechat clear                 Delete the index

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use notechat_core::config::default_config_path;
use notechat_core::{
    load_config, load_embedder, ChatRequest, ChatService, Embedder, ErrorPayload, FileStorage,
    IngestMode, IngestOutcome, IngestSource, IngestWorker, Ingestor, OllamaClient, RagConfig,
    RetryPolicy, Retriever, Storage,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "notechat")]
#[command(about = "notechat - ask questions about your documents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log progress to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest documents into the index
    Ingest {
        /// Files to ingest (.txt, .md, .json, .pdf with --features pdf)
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Add to the current index instead of replacing it
        #[arg(long)]
        append: bool,
    },
    /// Answer a question
    Ask {
        question: String,
        /// Answer from general knowledge without the documents
        #[arg(long)]
        general: bool,
        /// Number of chunks to use as context
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        /// Fall back to a general answer when nothing has been ingested
        #[arg(long)]
        fallback: bool,
        /// Output the answer or error as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the chunks retrieved for a query
    Search {
        query: String,
        /// Number of chunks to return
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show index status
    Status {
        /// Output status as JSON
        #[arg(long)]
        json: bool,
    },
    /// List stored chunks in index order
    Chunks {
        /// Output chunks as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete the index and metadata
    Clear,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "notechat", &mut std::io::stdout());
        return Ok(());
    }

    let config = resolve_config(cli.config)?;

    match cli.command {
        Commands::Ingest { files, append } => cmd_ingest(&config, files, append),
        Commands::Ask {
            question,
            general,
            top_k,
            fallback,
            json,
        } => cmd_ask(&config, &question, general, top_k, fallback, json),
        Commands::Search {
            query,
            top_k,
            json,
        } => cmd_search(&config, &query, top_k, json),
        Commands::Status { json } => cmd_status(&config, json),
        Commands::Chunks { json } => cmd_chunks(&config, json),
        Commands::Clear => cmd_clear(&config),
        Commands::Completions { .. } => Ok(()),
    }
}

fn resolve_config(path: Option<PathBuf>) -> Result<RagConfig> {
    let path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };
    let mut config =
        load_config(&path).with_context(|| format!("Failed to load config {}", path.display()))?;
    config.apply_env();
    config.validate()?;
    tracing::info!("Using index {:?}", config.index_path);
    Ok(config)
}

fn storage(config: &RagConfig) -> Arc<dyn Storage> {
    Arc::new(FileStorage::from_config(config))
}

fn spinner(message: &str) -> ProgressBar {
    let sp = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {msg} [{elapsed}]") {
        sp.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
    }
    sp.set_message(message.to_string());
    sp.enable_steady_tick(Duration::from_millis(80));
    sp
}

/// Load the configured embedder with spinner feedback
fn load_embedder_with_spinner(config: &RagConfig) -> Result<Box<dyn Embedder>> {
    let sp = spinner("Loading embedding model...");
    let embedder = load_embedder(&config.embedding_model_id)
        .with_context(|| format!("Failed to load embedding model {}", config.embedding_model_id));
    match &embedder {
        Ok(e) => sp.finish_with_message(format!(
            "Model loaded ({}, {} dims)",
            e.model_id(),
            e.dimension()
        )),
        Err(_) => sp.finish_and_clear(),
    }
    embedder
}

fn cmd_ingest(config: &RagConfig, files: Vec<PathBuf>, append: bool) -> Result<()> {
    for file in &files {
        if !file.is_file() {
            anyhow::bail!("Not a file: {}", file.display());
        }
    }

    let embedder = load_embedder_with_spinner(config)?;
    let ingestor = Ingestor::new(config, embedder, storage(config))?;
    let first_mode = if append {
        IngestMode::Append
    } else {
        config.ingest_mode
    };

    let worker = IngestWorker::spawn(ingestor);
    // The first file sets up the generation, the rest extend it
    for (i, file) in files.iter().enumerate() {
        let mode = if i == 0 { first_mode } else { IngestMode::Append };
        worker.submit(IngestSource::File(file.clone()), Some(mode))?;
    }

    let pb = ProgressBar::new(files.len() as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }

    let mut persisted = 0;
    let mut empty = Vec::new();
    let mut failures = Vec::new();
    let mut total_chunks = 0;
    let mut generation_size = 0;

    for _ in 0..files.len() {
        let Some(done) = worker.recv() else { break };
        pb.set_message(done.source.clone());
        pb.inc(1);
        match done.result {
            Ok(report) if report.outcome == IngestOutcome::Persisted => {
                persisted += 1;
                total_chunks += report.chunks;
                generation_size = report.generation_size;
            }
            Ok(_) => empty.push(done.source),
            Err(e) => failures.push((done.source, e)),
        }
    }
    pb.finish_and_clear();
    drop(worker);

    println!("{}", "Ingestion complete!".green().bold());
    println!("  Documents ingested: {}", persisted.to_string().cyan());
    println!("  Chunks added:       {}", total_chunks.to_string().cyan());
    if persisted > 0 {
        println!("  Chunks in index:    {}", generation_size.to_string().cyan());
    }
    for source in &empty {
        println!("  {} {} (no text extracted)", "Skipped:".yellow(), source);
    }
    for (source, e) in &failures {
        println!("  {} {}: {}", "Failed:".red(), source, e);
    }

    if !failures.is_empty() {
        anyhow::bail!("{} of {} documents failed", failures.len(), files.len());
    }
    Ok(())
}

fn cmd_ask(
    config: &RagConfig,
    question: &str,
    general: bool,
    top_k: Option<usize>,
    fallback: bool,
    json: bool,
) -> Result<()> {
    let completion = OllamaClient::from_config(&config.completion);
    let mut service = ChatService::new(Box::new(completion))
        .with_retry(RetryPolicy::from_config(&config.completion))
        .with_fallback_ungrounded(fallback);

    let request = if general {
        ChatRequest::general(question)
    } else {
        let embedder = load_embedder_with_spinner(config)?;
        let retriever = Retriever::new(embedder, storage(config), config.top_k);
        service = service
            .with_retriever(retriever)
            .with_top_k(top_k.unwrap_or(config.top_k));
        ChatRequest::documents(question)
    };

    let sp = spinner("Thinking...");
    let result = service.ask(&request);
    sp.finish_and_clear();

    match result {
        Ok(response) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!("{}", response.answer.trim());
                println!();
                let source = match response.source {
                    notechat_core::AnswerSource::Documents => {
                        format!("documents, {} chunks", response.chunks_used)
                    }
                    notechat_core::AnswerSource::General => "general knowledge".to_string(),
                };
                println!("{}", format!("Source: {source}").dimmed());
            }
            Ok(())
        }
        Err(e) => {
            let payload = ErrorPayload::from(&e);
            if json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
                std::process::exit(1);
            }
            eprintln!("{} {}", "Error:".red().bold(), payload.error);
            eprintln!("  {}", payload.details.dimmed());
            Err(e.into())
        }
    }
}

#[derive(Serialize)]
struct SearchHitJson<'a> {
    rank: usize,
    position: usize,
    distance: f32,
    chunk_id: &'a str,
    source_file: &'a str,
    page: &'a str,
    text: &'a str,
}

fn cmd_search(config: &RagConfig, query: &str, top_k: Option<usize>, json: bool) -> Result<()> {
    let embedder = load_embedder_with_spinner(config)?;
    let mut retriever = Retriever::new(embedder, storage(config), config.top_k);
    let hits = retriever.search(query, top_k.unwrap_or(config.top_k))?;

    if json {
        let out: Vec<SearchHitJson> = hits
            .iter()
            .enumerate()
            .map(|(i, hit)| SearchHitJson {
                rank: i + 1,
                position: hit.position,
                distance: hit.distance,
                chunk_id: &hit.chunk.chunk_id,
                source_file: &hit.chunk.source_file,
                page: &hit.chunk.page,
                text: &hit.chunk.text,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if hits.is_empty() {
        println!("No matching chunks.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{} {} {}",
            format!("[Chunk {}]", i + 1).green().bold(),
            hit.chunk.source_file.cyan(),
            format!("(row {}, distance {:.4})", hit.position, hit.distance).dimmed()
        );
        println!("{}", snippet(&hit.chunk.text, 300));
        println!();
    }
    Ok(())
}

#[derive(Serialize)]
struct StatusJson {
    index_path: PathBuf,
    metadata_path: PathBuf,
    present: bool,
    chunks: usize,
    dimension: usize,
    embedding_model: String,
    source_files: Vec<String>,
}

fn cmd_status(config: &RagConfig, json: bool) -> Result<()> {
    let generation = storage(config).load()?;
    let status = StatusJson {
        index_path: config.index_path.clone(),
        metadata_path: config.metadata_path.clone(),
        present: generation.is_some(),
        chunks: generation.as_ref().map_or(0, |g| g.len()),
        dimension: generation.as_ref().map_or(0, |g| g.index().dim()),
        embedding_model: config.embedding_model_id.clone(),
        source_files: generation
            .as_ref()
            .map(|g| {
                g.store()
                    .source_files()
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("{}", "notechat index".bold());
    println!("  Index:     {}", status.index_path.display());
    println!("  Metadata:  {}", status.metadata_path.display());
    println!("  Model:     {}", status.embedding_model);
    if !status.present {
        println!("  Status:    {}", "empty (ingest a document first)".yellow());
        return Ok(());
    }
    println!("  Status:    {}", "ready".green());
    println!("  Chunks:    {}", status.chunks.to_string().cyan());
    println!("  Dimension: {}", status.dimension);
    println!("  Documents:");
    for file in &status.source_files {
        println!("    {file}");
    }
    Ok(())
}

fn cmd_chunks(config: &RagConfig, json: bool) -> Result<()> {
    let Some(generation) = storage(config).load()? else {
        if json {
            println!("[]");
        } else {
            println!("No index. Ingest a document first.");
        }
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(generation.store().chunks())?);
        return Ok(());
    }
    for (i, chunk) in generation.store().chunks().iter().enumerate() {
        println!(
            "{} {} {}",
            format!("#{i}").bold(),
            chunk.source_file.cyan(),
            format!("[{} | page {}]", chunk.chunk_id, chunk.page).dimmed()
        );
        println!("{}", snippet(&chunk.text, 200));
        println!();
    }
    Ok(())
}

fn cmd_clear(config: &RagConfig) -> Result<()> {
    let storage = storage(config);
    if !storage.exists() {
        println!("Nothing to clear.");
        return Ok(());
    }
    storage.clear()?;
    println!("{} {}", "Cleared".green(), storage.describe());
    Ok(())
}

/// First `max_chars` characters of `text`, with an ellipsis when cut
fn snippet(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_ingest_requires_files() {
        assert!(Cli::try_parse_from(["notechat", "ingest"]).is_err());
        let cli = Cli::try_parse_from(["notechat", "ingest", "a.txt", "b.md", "--append"]).unwrap();
        match cli.command {
            Commands::Ingest { files, append } => {
                assert_eq!(files.len(), 2);
                assert!(append);
            }
            _ => panic!("expected ingest"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["notechat", "status", "--config", "/tmp/nc.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/nc.toml")));
    }

    #[test]
    fn test_snippet() {
        assert_eq!(snippet("short", 10), "short");
        assert_eq!(snippet("abcdef", 3), "abc...");
        assert_eq!(snippet("héllo wörld", 4), "héll...");
    }
}
