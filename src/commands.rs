//! `nforge` command implementations.
//!
//! Each `run_*` function backs one CLI subcommand and prints a
//! human-readable summary to stdout. Logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;

use narrative_forge_core::chunk::{chunk_text, estimate_tokens};
use narrative_forge_core::retrieval::RetrievalIndex;
use narrative_forge_core::router::{ModelRouter, TaskType};

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::llm::ChatCompletionsGenerator;
use crate::persistence::{JsonFileSink, PersistenceSink};
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::review::{ReviewDecision, ReviewGate, ReviewOptions, TracingNotifier};

/// Build a router over the chat-completions client with every configured
/// model registered and task overrides applied.
pub fn build_router(config: &Config) -> Result<ModelRouter> {
    let generator = ChatCompletionsGenerator::new(config.generation.clone())?;
    let mut router = ModelRouter::new(Arc::new(generator));
    for (id, model) in &config.models {
        router
            .register_model(id.clone(), model.clone())
            .with_context(|| format!("Failed to register model '{}'", id))?;
    }
    for (task, requirement) in &config.tasks {
        router.set_task_requirement(*task, requirement.clone());
    }
    Ok(router)
}

fn read_narrative(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read narrative file: {}", path.display()))
}

async fn build_index(config: &Config, path: &Path) -> Result<RetrievalIndex> {
    let text = read_narrative(path)?;
    let chunks = chunk_text(&text, &config.chunking);
    if chunks.is_empty() {
        bail!("{} contains no text", path.display());
    }
    let embedder = create_embedder(&config.embedding)?;
    let source = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "narrative".to_string());
    let mut index = RetrievalIndex::new(embedder).with_source(source);
    index.build_from_chunks(&chunks).await?;
    Ok(index)
}

/// `nforge chunk <file>`
pub fn run_chunk(config: &Config, path: &Path) -> Result<()> {
    let text = read_narrative(path)?;
    let chunks = chunk_text(&text, &config.chunking);

    println!("{} chunk(s) from {}", chunks.len(), path.display());
    println!();
    for (i, chunk) in chunks.iter().enumerate() {
        println!(
            "#{:<3} {:>5} tokens  {:?}  importance {}",
            i,
            estimate_tokens(&chunk.content),
            chunk.metadata.chunk_type,
            chunk.metadata.importance
        );
        for boundary in &chunk.boundaries {
            println!("     chapter: {}", boundary.title);
        }
        if !chunk.metadata.characters.is_empty() {
            println!("     characters: {}", chunk.metadata.characters.join(", "));
        }
        if let Some(scene) = &chunk.metadata.scene_hint {
            println!("     scene: {}", scene);
        }
    }
    Ok(())
}

/// `nforge retrieve <file> <query>`
pub async fn run_retrieve(
    config: &Config,
    path: &Path,
    query: &str,
    top_k: Option<usize>,
) -> Result<()> {
    let index = build_index(config, path).await?;
    let mut opts = config.retrieval.options();
    if let Some(k) = top_k {
        opts.top_k = k;
    }
    let result = index.retrieve(query, &opts).await?;

    if result.is_empty() {
        println!("No excerpts scored above {:.2}.", opts.min_score);
        return Ok(());
    }

    println!(
        "{} excerpt(s), {} tokens, {:?}",
        result.relevant_chunks.len(),
        result.total_tokens,
        result.search_time
    );
    for (i, doc) in result.relevant_chunks.iter().enumerate() {
        println!();
        println!(
            "{}. [{:.3}] chunk {} (importance {})",
            i + 1,
            doc.score,
            doc.metadata.chunk_index,
            doc.metadata.importance
        );
        let preview: String = doc.content.chars().take(200).collect();
        println!("   {}", preview.replace('\n', " "));
    }
    Ok(())
}

/// `nforge models`
pub fn run_models(config: &Config) -> Result<()> {
    let router = build_router(config)?;
    if router.models().is_empty() {
        println!("No models configured. Add [models.<id>] sections to the config file.");
        return Ok(());
    }

    println!(
        "{:<24} {:<10} {:>9} {:>10} {:>10}  CAPABILITIES",
        "MODEL", "PROVIDER", "CONTEXT", "$/1K IN", "$/1K OUT"
    );
    for model in router.models() {
        let capabilities: Vec<&str> = model.capabilities.iter().map(|c| c.as_str()).collect();
        println!(
            "{:<24} {:<10} {:>9} {:>10.5} {:>10.5}  {}",
            model.id,
            model.provider,
            model.context_window,
            model.cost_per_1k_input,
            model.cost_per_1k_output,
            capabilities.join(", ")
        );
    }
    Ok(())
}

/// `nforge route <task> --prompt-length N [--model id]`
pub fn run_route(
    config: &Config,
    task: &str,
    prompt_length: usize,
    model: Option<&str>,
) -> Result<()> {
    let task: TaskType = task.parse()?;
    let router = build_router(config)?;
    let decision = router.get_routing_decision(task, prompt_length, model)?;

    println!("Task:      {}", task);
    println!("Model:     {}", decision.model);
    println!("Score:     {:.1}", decision.score);
    println!("Est. cost: ${:.5}", decision.estimated_cost);
    println!("Est. time: {:?}", decision.estimated_time);
    println!("Reason:    {}", decision.reason);
    if !decision.alternatives.is_empty() {
        println!();
        println!("Alternatives:");
        for alt in &decision.alternatives {
            println!(
                "  {:<24} score {:>5.1}  ${:.5}  {}",
                alt.model, alt.score, alt.estimated_cost, alt.reason
            );
        }
    }
    Ok(())
}

/// `nforge run <file> [--auto-approve] [--out dir]`
///
/// Without `--auto-approve`, checkpoints awaiting review are prompted for
/// on stdin.
pub async fn run_run(
    config: &Config,
    path: &Path,
    auto_approve: bool,
    out: Option<PathBuf>,
) -> Result<()> {
    let text = read_narrative(path)?;
    if let Some(warning) = config.min_score_warning() {
        println!("Note: {}", warning);
    }

    let mut review = config.review.clone();
    if auto_approve {
        review.enabled = false;
    }
    let gate = Arc::new(ReviewGate::new(review).with_notifier(Arc::new(TracingNotifier)));

    let router = Arc::new(build_router(config)?);
    let index = RetrievalIndex::new(create_embedder(&config.embedding)?);
    let options = PipelineOptions {
        retrieval: config.retrieval.options(),
        augment: config.retrieval.augment_options(),
        review_timeout: config.review.wait_timeout(),
        ..PipelineOptions::default()
    };
    let mut pipeline = Pipeline::new(config.chunking.clone(), index, router.clone(), gate.clone())
        .with_options(options);

    if let Some(dir) = out {
        let sink = JsonFileSink::new(dir);
        if let Some(snapshot) = sink.load_review_snapshot().await? {
            println!("Restored review state from {}", sink.dir().display());
            gate.restore(snapshot);
        }
        let sink: Arc<dyn PersistenceSink> = Arc::new(sink);
        pipeline = pipeline.with_sink(sink);
    }

    let reviewer = (!auto_approve).then(|| tokio::spawn(console_reviewer(gate.clone())));
    let result = pipeline.run(&text).await;
    if let Some(handle) = reviewer {
        handle.abort();
    }
    let report = result.with_context(|| format!("Pipeline failed for {}", path.display()))?;

    println!();
    println!("Pipeline complete: {} chunk(s)", report.chunk_count);
    for stage in &report.stages {
        println!(
            "  {:<12} {:<10} {:<24} ${:.5}{}",
            stage.stage.as_str(),
            stage.status.as_str(),
            stage.model.as_deref().unwrap_or("-"),
            stage.cost,
            if stage.reused { "  (locked, reused)" } else { "" }
        );
    }
    println!("  Total cost: ${:.5}", report.total_cost);

    let usage = router.usage();
    println!("  Model calls: {} ({} failed)", usage.calls, usage.failures);
    if let Some(bible) = &report.story_bible {
        println!(
            "  Story bible: {} character(s), {} scene(s), locked: {}",
            bible.characters.len(),
            bible.scenes.len(),
            bible.locked
        );
    }
    Ok(())
}

/// Prompt on stdin for every checkpoint awaiting review.
///
/// Stdin is read on a plain thread: tokio's stdin handle would keep the
/// runtime from shutting down while a read is pending.
async fn console_reviewer(gate: Arc<ReviewGate>) {
    let mut changes = gate.subscribe();
    let (tx, mut lines) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        for checkpoint in gate.pending_reviews() {
            println!();
            println!(
                "── Review {} ({}) ──",
                checkpoint.stage.as_str(),
                checkpoint.id
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&checkpoint.data).unwrap_or_default()
            );
            loop {
                println!("[a]pprove [notes] | [r]eject [notes] | [m]odify <json>");
                let Some(line) = lines.recv().await else {
                    return;
                };
                match parse_console_decision(&line) {
                    Ok((decision, opts)) => {
                        if let Err(e) = gate.review(&checkpoint.id, decision, opts) {
                            eprintln!("Review failed: {}", e);
                        }
                        break;
                    }
                    Err(e) => eprintln!("{}", e),
                }
            }
        }
        if changes.changed().await.is_err() {
            return;
        }
    }
}

/// Parse one console reply into a decision.
fn parse_console_decision(line: &str) -> std::result::Result<(ReviewDecision, ReviewOptions), String> {
    let line = line.trim();
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let notes = (!rest.is_empty()).then(|| rest.to_string());

    match verb.to_lowercase().as_str() {
        "a" | "approve" => Ok((
            ReviewDecision::Approve,
            ReviewOptions {
                notes,
                modifications: None,
            },
        )),
        "r" | "reject" => Ok((
            ReviewDecision::Reject,
            ReviewOptions {
                notes,
                modifications: None,
            },
        )),
        "m" | "modify" => {
            let modifications = serde_json::from_str(rest)
                .map_err(|e| format!("modify expects a JSON object: {}", e))?;
            Ok((
                ReviewDecision::Modify,
                ReviewOptions {
                    notes: None,
                    modifications: Some(modifications),
                },
            ))
        }
        other => Err(format!("unknown decision '{}'", other)),
    }
}
