use std::io::Write as _;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use loam_config::AppConfig;
use loam_llm::OllamaClient;
use loam_memory::{HistoryMessage, RedbGraphStore};
use loam_runtime::Engine;

const CONFIG_PATH: &str = "config/loam.toml";

#[derive(Debug, Parser)]
#[command(name = "loam", version, about = "A local, privacy-first conversational memory engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Interactive chat with memory (default).
    Chat,
    /// Pre-flight check of the model server and both stores.
    Status,
    /// Memory statistics: chunk and graph counts.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::load_from(CONFIG_PATH)?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level)),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => run_chat(config).await,
        Commands::Status => run_status(config).await,
        Commands::Stats => run_stats(config).await,
    }
}

// ── status ────────────────────────────────────────────────────────────────────

/// The model server and vector store are required; the graph store only
/// warns because the engine can fall back to its in-memory variant.
async fn run_status(config: AppConfig) -> Result<()> {
    let mut critical_ok = true;
    println!("loam pre-flight check\n");

    let client = OllamaClient::new(&config.llm.ollama_base_url, Duration::from_secs(5));
    match client.list_models().await {
        Ok(models) => {
            println!("ollama        ok     {}", config.llm.ollama_base_url);
            for (label, wanted) in [
                ("main model", &config.llm.main_model),
                ("observer model", &config.llm.observer_model),
                ("embedding model", &config.llm.embedding_model),
            ] {
                let base = wanted.split(':').next().unwrap_or(wanted);
                if models.iter().any(|m| m.contains(base)) {
                    println!("  {label:<16} {wanted}");
                } else {
                    println!("  {label:<16} {wanted} (not installed — run: ollama pull {wanted})");
                    critical_ok = false;
                }
            }
        }
        Err(err) => {
            println!("ollama        ERROR  {err}");
            critical_ok = false;
        }
    }

    if config.memory.vector_backend == "memory" {
        println!("vector store  ok     in-memory (non-persistent)");
    } else {
        match loam_memory::QdrantVectorStore::connect(
            &config.memory.qdrant_url,
            &config.memory.qdrant_collection,
            config.llm.embedding_dim,
        )
        .await
        {
            Ok(store) => {
                use loam_memory::VectorStore as _;
                let chunks = store.count().await.unwrap_or(0);
                println!(
                    "vector store  ok     {} ({} chunks)",
                    config.memory.qdrant_url, chunks
                );
            }
            Err(err) => {
                println!("vector store  ERROR  {err}");
                critical_ok = false;
            }
        }
    }

    match RedbGraphStore::open(&config.memory.graph_path) {
        Ok(_) => println!("graph store   ok     {}", config.memory.graph_path),
        Err(err) => println!("graph store   warn   {err} (will use in-memory fallback)"),
    }

    if critical_ok {
        println!("\nall critical systems operational");
        Ok(())
    } else {
        anyhow::bail!("critical systems not ready");
    }
}

// ── stats ─────────────────────────────────────────────────────────────────────

async fn run_stats(config: AppConfig) -> Result<()> {
    let engine = Engine::new(config).await?;
    let stats = engine.stats().await?;
    println!("memory chunks        {}", stats.vector.chunks);
    if stats.vector.chunks > 0 {
        println!("average utility      {:.3}", stats.vector.average_utility);
        println!(
            "utility distribution high: {}, medium: {}, low: {}",
            stats.vector.high_utility, stats.vector.medium_utility, stats.vector.low_utility
        );
    }
    println!("graph entities       {}", stats.graph.entities);
    println!("graph relationships  {}", stats.graph.relationships);
    Ok(())
}

// ── chat ──────────────────────────────────────────────────────────────────────

async fn run_chat(config: AppConfig) -> Result<()> {
    let engine = Engine::new(config).await?;
    println!("conversation {} — type 'exit' to quit\n", engine.conversation_id());

    let mut history: Vec<HistoryMessage> = Vec::new();
    loop {
        let line = tokio::select! {
            line = read_user_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            // EOF or interrupt: drain observers once, then exit.
            println!("\nSaving memories...");
            engine.wait_for_observers().await;
            println!("Goodbye!");
            return Ok(());
        };

        let input = line.trim().to_string();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            println!("Saving memories...");
            engine.wait_for_observers().await;
            println!("Memories saved. Goodbye!");
            return Ok(());
        }

        let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(64);
        let printer = tokio::spawn(async move {
            print!("Assistant: ");
            let _ = std::io::stdout().flush();
            while let Some(token) = rx.recv().await {
                print!("{token}");
                let _ = std::io::stdout().flush();
            }
            println!("\n");
        });

        match engine.respond(&input, &history, tx).await {
            Ok(reply) => {
                history.push(HistoryMessage::user(&input));
                history.push(HistoryMessage::assistant(reply));
            }
            Err(err) => {
                warn!(error = %err, "turn failed");
                eprintln!("error: {err}");
            }
        }
        let _ = printer.await;
    }
}

/// Blocking stdin read moved off the scheduler so background observers keep
/// running while the user types.  `None` on EOF.
async fn read_user_line() -> Result<Option<String>> {
    let line = tokio::task::spawn_blocking(|| {
        print!("You: ");
        let _ = std::io::stdout().flush();
        let mut buffer = String::new();
        match std::io::stdin().read_line(&mut buffer) {
            Ok(0) => None,
            Ok(_) => Some(buffer),
            Err(_) => None,
        }
    })
    .await?;
    Ok(line)
}
