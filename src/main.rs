//! # Narrative Forge CLI (`nforge`)
//!
//! Turns a prose narrative into pre-production material: a locked story
//! bible, character profiles, a scene breakdown and a shot plan.
//!
//! ## Usage
//!
//! ```bash
//! nforge --config ./config/nforge.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `nforge chunk <file>` | Show how a narrative is chunked |
//! | `nforge retrieve <file> "<query>"` | Similarity search over a narrative |
//! | `nforge models` | List configured models and their capabilities |
//! | `nforge route <task> --prompt-length N` | Explain which model a task would use |
//! | `nforge run <file>` | Run the full pipeline with console review |
//!
//! ## Examples
//!
//! ```bash
//! # Chunk a novel with the default settings (no config file needed)
//! nforge chunk ./novel.txt
//!
//! # Which model would plan shots for a 40k-character prompt?
//! nforge route shot_planning --prompt-length 40000 --config ./config/nforge.toml
//!
//! # Full run, skipping review, writing stage output to ./out
//! nforge run ./novel.txt --auto-approve --out ./out --config ./config/nforge.toml
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use narrative_forge::commands;
use narrative_forge::config::{self, Config};

/// Narrative Forge: story bible, characters, scenes and shots from prose.
#[derive(Parser)]
#[command(
    name = "nforge",
    about = "Narrative Forge: retrieval-grounded story pre-production with human review",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Optional; built-in defaults apply when omitted. Model-backed
    /// commands need at least one `[models.<id>]` section.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a narrative into chunks and print their metadata.
    Chunk {
        /// Narrative text file.
        file: PathBuf,
    },

    /// Index a narrative and print the excerpts most similar to a query.
    Retrieve {
        /// Narrative text file.
        file: PathBuf,

        /// The search query string.
        query: String,

        /// Override `retrieval.top_k`.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// List registered models with derived capabilities and costs.
    Models,

    /// Show the routing decision for a task without calling a model.
    Route {
        /// Task type: `story_analysis`, `character_extraction`,
        /// `scene_breakdown`, `shot_planning` or `summarization`.
        task: String,

        /// Prompt length in characters.
        #[arg(long)]
        prompt_length: usize,

        /// Preferred model id.
        #[arg(long)]
        model: Option<String>,
    },

    /// Run the full pipeline over a narrative.
    ///
    /// Checkpoints that require review are prompted for on stdin unless
    /// `--auto-approve` is given.
    Run {
        /// Narrative text file.
        file: PathBuf,

        /// Skip human review; every stage is accepted as generated.
        #[arg(long)]
        auto_approve: bool,

        /// Directory for stage output and review state. A review state
        /// left by an earlier run is restored, so a locked story bible
        /// is reused.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Chunk { file } => commands::run_chunk(&cfg, &file)?,
        Commands::Retrieve { file, query, top_k } => {
            commands::run_retrieve(&cfg, &file, &query, top_k).await?
        }
        Commands::Models => commands::run_models(&cfg)?,
        Commands::Route {
            task,
            prompt_length,
            model,
        } => commands::run_route(&cfg, &task, prompt_length, model.as_deref())?,
        Commands::Run {
            file,
            auto_approve,
            out,
        } => commands::run_run(&cfg, &file, auto_approve, out).await?,
    }

    Ok(())
}
