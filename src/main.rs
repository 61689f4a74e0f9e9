//! # Evidence Harness CLI (`evh`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `evh init` | Write a starter configuration file |
//! | `evh ingest <file>` | Extract, chunk, embed and index one file |
//! | `evh sync` | Ingest every supported file under `[sync].root` |
//! | `evh remove <source>` | Drop a document from the index |
//! | `evh search "<query>"` | Ranked chunks (lexical, vector or hybrid) |
//! | `evh ask "<question>"` | Retrieve, rerank, group and answer |
//! | `evh batch <input.csv>` | Answer `id,question` rows into `id,answer,documents` |
//! | `evh sources` | List indexed documents |
//! | `evh stats` | Index size and embedding model |
//! | `evh serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! evh init --config ./config/evh.toml
//! evh sync --config ./config/evh.toml
//! evh search "delivery penalty" --mode lexical
//! evh ask "What is the penalty for late delivery?"
//! evh batch questions.csv --output answers.csv
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use evidence_harness::config::{self, SAMPLE_CONFIG};
use evidence_harness::engine::{Engine, SearchMode};
use evidence_harness::extract::extract_blocks;
use evidence_harness::models::ChatMessage;
use evidence_harness::{batch, logging, server, sync};

/// Evidence Harness: hybrid retrieval with conflict-aware answers over
/// private documents.
#[derive(Parser)]
#[command(name = "evh", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/evh.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v info, -vv debug). `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration to `--config`.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Ingest one file (.json block list, .txt, .md, .docx, .pdf).
    Ingest {
        path: PathBuf,
        /// Source name; defaults to the file stem.
        #[arg(long)]
        source: Option<String>,
        /// Replace the document if it is already indexed.
        #[arg(long)]
        replace: bool,
    },

    /// Ingest every supported file under `[sync].root`.
    Sync {
        /// Re-ingest documents that are already indexed.
        #[arg(long)]
        replace: bool,
        /// Report what would be ingested without changing the index.
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove a document from the index.
    Remove { source: String },

    /// Search indexed chunks.
    Search {
        query: String,
        #[arg(long, value_enum, default_value_t = SearchMode::Hybrid)]
        mode: SearchMode,
        /// Number of results (defaults to `retrieval.candidate_k`).
        #[arg(short, long)]
        k: Option<usize>,
        /// Cosine weight for hybrid mode.
        #[arg(long)]
        alpha: Option<f64>,
    },

    /// Answer a question from the indexed documents.
    Ask {
        question: String,
        /// Print the full answer record as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Answer every `id,question` row of a CSV file.
    Batch {
        input: PathBuf,
        /// Destination CSV with `id,answer,documents` columns.
        #[arg(long, default_value = "output.csv")]
        output: PathBuf,
    },

    /// List indexed documents with chunk counts.
    Sources,

    /// Show index statistics.
    Stats,

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Commands::Init { force } = cli.command {
        return write_sample_config(&cli.config, force);
    }

    let cfg = config::load_config(&cli.config)?;
    if let Commands::Serve = cli.command {
        return server::run_server(&cfg).await;
    }
    let engine = Engine::from_config(&cfg)?;

    match cli.command {
        Commands::Ingest { path, source, replace } => {
            let source = match source {
                Some(s) => s,
                None => path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .ok_or_else(|| anyhow::anyhow!("Cannot derive a source name from {}", path.display()))?,
            };
            let blocks = extract_blocks(&path).with_context(|| format!("Failed to extract {}", path.display()))?;
            let report = if replace {
                engine.upsert(&source, &blocks).await?
            } else {
                engine.ingest(&source, &blocks).await?
            };
            println!("ingest {}", report.source);
            println!("  chunks: {}", report.chunks);
            println!("  tokens: {}", report.tokens);
            if report.oversize_tables > 0 {
                println!("  oversize tables: {}", report.oversize_tables);
            }
            if let Some(previous) = report.replaced {
                println!("  replaced chunks: {}", previous);
            }
        }
        Commands::Sync { replace, dry_run } => {
            let summary = sync::run_sync(&engine, &cfg.sync, replace, dry_run).await?;
            println!("sync{}", if dry_run { " (dry-run)" } else { "" });
            println!("  files found: {}", summary.found);
            println!("  ingested: {}", summary.ingested);
            println!("  replaced: {}", summary.replaced);
            println!("  skipped: {}", summary.skipped);
            if !dry_run {
                println!("  chunks written: {}", summary.chunks);
            }
            for (file, error) in &summary.failed {
                println!("  failed: {} ({})", file, error);
            }
        }
        Commands::Remove { source } => {
            let removed = engine.remove(&source).await?;
            println!("Removed {} ({} chunks)", source, removed);
        }
        Commands::Search { query, mode, k, alpha } => {
            let k = k.unwrap_or(engine.options().candidate_k);
            let hits = engine.search(&query, k, mode, alpha).await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!(
                    "{}. [{:.3}] {} #{}",
                    i + 1,
                    hit.score,
                    hit.chunk.source,
                    hit.chunk.chunk_id
                );
                println!("    {}", snippet(&hit.chunk.text, 200));
            }
        }
        Commands::Ask { question, json } => {
            let answer = engine.answer(&[ChatMessage::new("user", question)]).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                match &answer.answer {
                    Some(text) => println!("{}\n", text),
                    None => println!("(generation disabled; evidence below)\n"),
                }
                println!("Sources: {}", answer.files_used.join(", "));
                if !answer.set_aside.is_empty() {
                    println!("Conflicting sources set aside: {}", answer.set_aside.join(", "));
                }
                if answer.answer.is_none() {
                    println!("\n{}", answer.context);
                }
            }
        }
        Commands::Batch { input, output } => {
            let summary = batch::run_batch_files(&engine, &input, &output).await?;
            println!("batch {}", output.display());
            println!("  questions: {}", summary.questions);
            println!("  answered: {}", summary.answered);
            if summary.questions > 0 {
                println!(
                    "  time: {:.1}s ({:.2}s per question)",
                    summary.elapsed_secs,
                    summary.elapsed_secs / summary.questions as f64
                );
            }
            for (id, error) in &summary.failed {
                println!("  failed: {} ({})", id, error);
            }
        }
        Commands::Sources => {
            let sources = engine.sources().await;
            if sources.is_empty() {
                println!("No documents indexed.");
            }
            for (source, chunks) in sources {
                println!("{:<40} {} chunks", source, chunks);
            }
        }
        Commands::Stats => {
            let stats = engine.stats().await;
            println!("documents: {}", stats.documents);
            println!("chunks: {}", stats.chunks);
            match stats.dimension {
                Some(d) => println!("dimension: {}", d),
                None => println!("dimension: -"),
            }
            println!("embedding model: {}", stats.embedding_model);
        }
        Commands::Init { .. } | Commands::Serve => {}
    }

    Ok(())
}

fn write_sample_config(path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, SAMPLE_CONFIG).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}
