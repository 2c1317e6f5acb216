//! AtomVault CLI — command-line ingestion, search, watch management, and
//! the foreground watcher loop, each a thin wrapper over one `Engine`
//! boundary operation.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use atomvault_core::engine::{Engine, IngestRequest, IngestStatus};
use atomvault_core::model::Provenance;

#[derive(Parser)]
#[command(name = "atomvault", version, about)]
struct Cli {
    /// Vault root directory (contains inbox/, external-inbox/, .atomvault/)
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Output as JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a file's bytes directly, bypassing the watcher
    Ingest {
        /// File to ingest
        path: PathBuf,

        /// Bucket to file the content under (default: inbox)
        #[arg(long)]
        bucket: Option<String>,

        /// Explicit tags to attach in addition to derived ones
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Content originates outside the vault owner's own writing
        #[arg(long)]
        external: bool,
    },
    /// Run the Tag-Walker search pipeline
    Search {
        query: String,

        #[arg(long)]
        bucket: Vec<String>,

        #[arg(long = "tag")]
        tags: Vec<String>,

        #[arg(long, default_value_t = 20_000)]
        max_chars: usize,

        /// Run per-sentence molecule search instead of whole-query search
        #[arg(long)]
        molecule: bool,
    },
    /// Manage additional watched directories
    Watch {
        #[command(subcommand)]
        action: WatchAction,
    },
    /// Start the filesystem watcher and run until interrupted
    Serve,
}

#[derive(Subcommand)]
enum WatchAction {
    Add { path: PathBuf },
    Remove { path: PathBuf },
    List,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("atomvault=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let engine = match Engine::new(cli.root.clone()) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("failed to open vault at {}: {e}", cli.root.display());
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Ingest { path, bucket, tags, external } => {
            let bytes = match std::fs::read(&path) {
                Ok(b) => b,
                Err(e) => {
                    eprintln!("could not read {}: {e}", path.display());
                    std::process::exit(1);
                }
            };
            let req = IngestRequest {
                bytes,
                path: path.to_string_lossy().to_string(),
                source: if external { Provenance::External } else { Provenance::Internal },
                type_hint: path.extension().and_then(|e| e.to_str()).map(str::to_string),
                buckets: bucket.into_iter().collect(),
                tags,
            };
            match engine.ingest(req).await {
                Ok(outcome) => {
                    if cli.json {
                        println!("{}", serde_json::to_string_pretty(&outcome).unwrap());
                    } else {
                        println!("{}: {:?} ({})", outcome.id, outcome.status, outcome.message);
                    }
                    if outcome.status == IngestStatus::Error {
                        std::process::exit(1);
                    }
                }
                Err(e) => {
                    eprintln!("ingest failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Search { query, bucket, tags, max_chars, molecule } => {
            let buckets = if bucket.is_empty() { None } else { Some(bucket.as_slice()) };
            let tag_filter = if tags.is_empty() { None } else { Some(tags.as_slice()) };

            let response = if molecule {
                engine.molecule_search(&query, buckets, tag_filter, max_chars, None).await
            } else {
                engine.search(&query, buckets, tag_filter, max_chars, None).await
            };

            match response {
                Ok(resp) => {
                    if cli.json {
                        let items: Vec<serde_json::Value> = resp
                            .results
                            .iter()
                            .map(|r| {
                                serde_json::json!({
                                    "id": r.molecule_id,
                                    "content": r.content,
                                    "source": r.source_path,
                                    "timestamp": r.timestamp,
                                    "bucket": r.bucket,
                                    "tags": r.tags,
                                    "score": r.score,
                                })
                            })
                            .collect();
                        println!("{}", serde_json::to_string_pretty(&items).unwrap());
                    } else if resp.results.is_empty() {
                        eprintln!("no results for '{query}'");
                    } else {
                        for r in &resp.results {
                            println!("{:>7.2}  {}  {}", r.score, r.bucket, r.source_path);
                            println!("        {}", r.content.trim());
                        }
                        eprintln!("\n{} results", resp.results.len());
                    }
                }
                Err(e) => {
                    eprintln!("search failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Watch { action } => match action {
            WatchAction::Add { path } => {
                if let Err(e) = engine.add_watch_path(path.clone()).await {
                    eprintln!("failed to add watch path: {e}");
                    std::process::exit(1);
                }
                println!("watching {}", path.display());
            }
            WatchAction::Remove { path } => {
                if let Err(e) = engine.remove_watch_path(&path).await {
                    eprintln!("failed to remove watch path: {e}");
                    std::process::exit(1);
                }
                println!("stopped watching {}", path.display());
            }
            WatchAction::List => {
                for path in engine.list_watch_paths() {
                    println!("{}", path.display());
                }
            }
        },
        Commands::Serve => {
            if let Err(e) = engine.start_watching().await {
                eprintln!("failed to start watcher: {e}");
                std::process::exit(1);
            }
            println!("watching {} — press ctrl-c to stop", cli.root.display());
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
