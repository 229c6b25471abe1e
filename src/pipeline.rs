//! Pipeline orchestrator.
//!
//! Runs the four stages in order, each one the same way:
//!
//! ```text
//! retrieve context ─▶ augmented prompt ─▶ routed model call ─▶ parse JSON
//!        ─▶ review (if required) ─▶ persist ─▶ next stage
//! ```
//!
//! | Stage | Task type | Context |
//! |-------|-----------|---------|
//! | `story_bible` | `story_analysis` | broad similarity search |
//! | `characters` | `character_extraction` | broad similarity search |
//! | `scenes` | `scene_breakdown` | per-character retrieval |
//! | `shots` | `shot_planning` | per-scene retrieval |
//!
//! When no excerpt clears `min_score`, the stage falls back to the opening
//! chunks of the narrative within the same token budget.
//!
//! A rejected stage halts the run with [`Error::StageRejected`]; stages
//! accepted before it stay persisted. A run that starts with a locked
//! story bible reuses it instead of re-deriving it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use narrative_forge_core::chunk::{chunk_text, estimate_tokens, ChunkerConfig};
use narrative_forge_core::retrieval::{
    generate_augmented_prompt, AugmentOptions, RetrievalIndex, RetrievalOptions, RetrievalResult,
};
use narrative_forge_core::router::{ExecutionOptions, ModelRouter};
use narrative_forge_core::store::memory::InMemoryStore;
use narrative_forge_core::store::VectorStore;
use narrative_forge_core::{Error, Result};

use crate::persistence::PersistenceSink;
use crate::review::{
    CheckpointStatus, ReviewGate, Stage, StoryBible, SubmitOptions, DEFAULT_WAIT_TIMEOUT_SECS,
};

pub const SYSTEM_PROMPT: &str = "You are a story development assistant for film and animation \
    pre-production. Reply with a single JSON object and nothing else.";

const UNREVIEWED_NOTE: &str = "auto-approved: stage not under review";

/// Upper bound on per-character and per-scene retrieval queries.
const MAX_SCOPED_QUERIES: usize = 5;

const STORY_QUERY: &str = "main characters, setting, tone, visual style and central conflict";
const CHARACTER_QUERY: &str = "characters introduced, their appearance, personality and relationships";
const SCENE_QUERY: &str = "locations, time of day and key events";
const SHOT_QUERY: &str = "visual action, movement and setting details";

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub retrieval: RetrievalOptions,
    pub augment: AugmentOptions,
    /// Budget for each blocking review wait.
    pub review_timeout: Duration,
    pub temperature: Option<f32>,
    /// Per-stage model overrides.
    pub preferred_models: HashMap<Stage, String>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            retrieval: RetrievalOptions::default(),
            augment: AugmentOptions::default(),
            review_timeout: Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS),
            temperature: None,
            preferred_models: HashMap::new(),
        }
    }
}

/// Result of one accepted stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub stage: Stage,
    pub status: CheckpointStatus,
    /// `None` when the stage skipped review.
    pub checkpoint_id: Option<String>,
    /// `None` when a locked story bible was reused.
    pub model: Option<String>,
    pub cost: f64,
    pub context_chunks: usize,
    pub data: Value,
    pub reused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub chunk_count: usize,
    pub stages: Vec<StageOutcome>,
    pub story_bible: Option<StoryBible>,
    pub total_cost: f64,
}

/// Accepted output of earlier stages, fed into later prompts.
#[derive(Debug, Default)]
struct StageOutputs {
    story_bible: Option<Value>,
    characters: Option<Value>,
    scenes: Option<Value>,
}

impl StageOutputs {
    fn record(&mut self, stage: Stage, data: Value) {
        match stage {
            Stage::StoryBible => self.story_bible = Some(data),
            Stage::Characters => self.characters = Some(data),
            Stage::Scenes => self.scenes = Some(data),
            Stage::Shots => {}
        }
    }

    fn prior(&self, stage: Stage) -> Option<(&'static str, &Value)> {
        match stage {
            Stage::StoryBible => None,
            Stage::Characters => self.story_bible.as_ref().map(|v| ("Story bible", v)),
            Stage::Scenes => self
                .characters
                .as_ref()
                .or(self.story_bible.as_ref())
                .map(|v| ("Characters", v)),
            Stage::Shots => self.scenes.as_ref().map(|v| ("Scenes", v)),
        }
    }

    /// Character names from the characters stage, else the story bible.
    fn character_names(&self) -> Vec<String> {
        let from = |v: &Option<Value>| {
            v.as_ref()
                .map(|v| labels(v, "characters", &["name"]))
                .unwrap_or_default()
        };
        let names = from(&self.characters);
        if names.is_empty() {
            from(&self.story_bible)
        } else {
            names
        }
    }

    fn scene_descriptions(&self) -> Vec<String> {
        self.scenes
            .as_ref()
            .map(|v| labels(v, "scenes", &["description", "summary", "title"]))
            .unwrap_or_default()
    }
}

/// Strings from `value[list_key]` (or `value` itself if it is an array):
/// plain strings, or the first present `fields` entry of each object.
fn labels(value: &Value, list_key: &str, fields: &[&str]) -> Vec<String> {
    let items = value
        .get(list_key)
        .and_then(Value::as_array)
        .or_else(|| value.as_array());
    let Some(items) = items else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => fields
                .iter()
                .find_map(|f| map.get(*f).and_then(Value::as_str))
                .map(str::to_string),
            _ => None,
        })
        .filter(|s| !s.trim().is_empty())
        .collect()
}

/// Sequences stages over one narrative.
pub struct Pipeline<S = InMemoryStore> {
    chunker: ChunkerConfig,
    index: RetrievalIndex<S>,
    router: Arc<ModelRouter>,
    gate: Arc<ReviewGate>,
    sink: Option<Arc<dyn PersistenceSink>>,
    options: PipelineOptions,
}

impl<S: VectorStore> Pipeline<S> {
    pub fn new(
        chunker: ChunkerConfig,
        index: RetrievalIndex<S>,
        router: Arc<ModelRouter>,
        gate: Arc<ReviewGate>,
    ) -> Self {
        Self {
            chunker,
            index,
            router,
            gate,
            sink: None,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn gate(&self) -> &Arc<ReviewGate> {
        &self.gate
    }

    pub fn index(&self) -> &RetrievalIndex<S> {
        &self.index
    }

    /// Chunk and index `text`, then run every stage.
    ///
    /// The review state is handed to the persistence sink whether the
    /// run completes or halts.
    pub async fn run(&mut self, text: &str) -> Result<PipelineReport> {
        let chunks = chunk_text(text, &self.chunker);
        if chunks.is_empty() {
            return Err(Error::invalid_input("narrative text is empty"));
        }
        self.index.build_from_chunks(&chunks).await?;

        let mut report = PipelineReport {
            chunk_count: chunks.len(),
            stages: Vec::new(),
            story_bible: None,
            total_cost: 0.0,
        };
        let result = self.run_stages(&mut report).await;

        if let Some(sink) = &self.sink {
            let saved = sink.save_review_snapshot(&self.gate.snapshot()).await;
            match (&result, saved) {
                (Err(_), Err(e)) => {
                    tracing::error!(error = %e, "failed to save review state after a halted run");
                }
                (Ok(()), Err(e)) => return Err(e),
                (_, Ok(())) => {}
            }
        }
        result?;

        report.story_bible = self.gate.story_bible();
        tracing::info!(
            chunks = report.chunk_count,
            stages = report.stages.len(),
            total_cost = report.total_cost,
            "pipeline complete"
        );
        Ok(report)
    }

    async fn run_stages(&self, report: &mut PipelineReport) -> Result<()> {
        let mut outputs = StageOutputs::default();
        for stage in Stage::ALL {
            let outcome = match (stage, self.gate.locked_story_bible()) {
                (Stage::StoryBible, Some(bible)) => reuse_locked_bible(&bible)?,
                _ => self.run_stage(stage, &outputs).await?,
            };
            outputs.record(stage, outcome.data.clone());
            report.total_cost += outcome.cost;
            report.stages.push(outcome);
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(stage = %stage))]
    async fn run_stage(&self, stage: Stage, outputs: &StageOutputs) -> Result<StageOutcome> {
        let context = self.stage_context(stage, outputs).await?;
        let prompt = generate_augmented_prompt(
            &stage_prompt(stage, outputs),
            &context,
            &self.options.augment,
        );

        let exec = ExecutionOptions {
            preferred_model: self.options.preferred_models.get(&stage).cloned(),
            system_prompt: Some(SYSTEM_PROMPT.to_string()),
            temperature: self.options.temperature,
            max_tokens: None,
            json_output: true,
        };
        let result = self
            .router
            .route_and_execute(stage.task_type(), &prompt, &exec)
            .await?;
        let data = parse_json_payload(&result.content).map_err(|message| Error::InvalidOutput {
            stage: stage.to_string(),
            message,
        })?;

        let (status, checkpoint_id, data) = if self.gate.is_stage_required(stage) {
            let submitted = self
                .gate
                .submit_for_review(stage, data, SubmitOptions::default())
                .await?;
            let reviewed = if submitted.status.is_terminal() {
                submitted
            } else {
                self.gate
                    .wait_for_review(&submitted.id, self.options.review_timeout)
                    .await?
            };
            match reviewed.status {
                CheckpointStatus::Rejected => {
                    tracing::warn!(checkpoint = %reviewed.id, "stage rejected, halting");
                    return Err(Error::StageRejected {
                        stage: stage.to_string(),
                        notes: reviewed.reviewer_notes,
                    });
                }
                CheckpointStatus::Modified
                    if stage == Stage::StoryBible
                        && self.gate.config().auto_lock_after_approval =>
                {
                    self.gate.lock_story_bible(&reviewed.data);
                }
                _ => {}
            }
            (reviewed.status, Some(reviewed.id), reviewed.data)
        } else {
            // Same auto-approval path as a disabled gate, so the lock rule
            // and the checkpoint record match.
            let accepted = self
                .gate
                .submit_for_review(
                    stage,
                    data,
                    SubmitOptions {
                        auto_approve: true,
                        notes: Some(UNREVIEWED_NOTE.to_string()),
                    },
                )
                .await?;
            (accepted.status, Some(accepted.id), accepted.data)
        };

        if let Some(sink) = &self.sink {
            sink.save_stage_output(stage, &data).await?;
            if stage == Stage::StoryBible {
                if let Some(bible) = self.gate.locked_story_bible() {
                    sink.save_story_bible(&bible).await?;
                }
            }
        }

        tracing::info!(
            status = %status,
            model = %result.model,
            cost = result.cost,
            context_chunks = context.relevant_chunks.len(),
            "stage accepted"
        );
        Ok(StageOutcome {
            stage,
            status,
            checkpoint_id,
            model: Some(result.model),
            cost: result.cost,
            context_chunks: context.relevant_chunks.len(),
            data,
            reused: false,
        })
    }

    /// Retrieval for `stage`, or the opening of the narrative when nothing
    /// clears `min_score`.
    async fn stage_context(&self, stage: Stage, outputs: &StageOutputs) -> Result<RetrievalResult> {
        let opts = &self.options.retrieval;
        let context = self.similar_context(stage, outputs).await?;
        if !context.is_empty() {
            return Ok(context);
        }
        tracing::warn!(
            stage = %stage,
            min_score = opts.min_score,
            "no excerpt reached min_score, using the opening of the narrative"
        );
        self.index.opening_context(&context.query, opts).await
    }

    async fn similar_context(&self, stage: Stage, outputs: &StageOutputs) -> Result<RetrievalResult> {
        let opts = &self.options.retrieval;
        match stage {
            Stage::StoryBible => self.index.retrieve(STORY_QUERY, opts).await,
            Stage::Characters => self.index.retrieve(CHARACTER_QUERY, opts).await,
            Stage::Scenes => {
                let names = outputs.character_names();
                if names.is_empty() {
                    return self.index.retrieve(SCENE_QUERY, opts).await;
                }
                let mut results = Vec::new();
                for name in names.iter().take(MAX_SCOPED_QUERIES) {
                    results.push(self.index.retrieve_for_character(name, opts).await?);
                }
                Ok(merge_results(&names.join(", "), results, opts.max_tokens))
            }
            Stage::Shots => {
                let scenes = outputs.scene_descriptions();
                if scenes.is_empty() {
                    return self.index.retrieve(SHOT_QUERY, opts).await;
                }
                let mut results = Vec::new();
                for scene in scenes.iter().take(MAX_SCOPED_QUERIES) {
                    results.push(self.index.retrieve_for_scene(scene, opts).await?);
                }
                Ok(merge_results(&scenes.join(" | "), results, opts.max_tokens))
            }
        }
    }
}

fn reuse_locked_bible(bible: &StoryBible) -> Result<StageOutcome> {
    tracing::info!("story bible already locked, reusing it");
    let data = serde_json::to_value(bible).map_err(|e| Error::InvalidOutput {
        stage: Stage::StoryBible.to_string(),
        message: e.to_string(),
    })?;
    Ok(StageOutcome {
        stage: Stage::StoryBible,
        status: CheckpointStatus::Approved,
        checkpoint_id: None,
        model: None,
        cost: 0.0,
        context_chunks: 0,
        data,
        reused: true,
    })
}

/// Concatenate results, dropping duplicate documents, within `max_tokens`.
fn merge_results(query: &str, results: Vec<RetrievalResult>, max_tokens: usize) -> RetrievalResult {
    let mut seen = HashSet::new();
    let mut merged = RetrievalResult {
        query: query.to_string(),
        relevant_chunks: Vec::new(),
        total_tokens: 0,
        search_time: Duration::ZERO,
    };
    'outer: for result in results {
        merged.search_time += result.search_time;
        for doc in result.relevant_chunks {
            if !seen.insert(doc.id.clone()) {
                continue;
            }
            let tokens = estimate_tokens(&doc.content);
            if merged.total_tokens + tokens > max_tokens {
                break 'outer;
            }
            merged.total_tokens += tokens;
            merged.relevant_chunks.push(doc);
        }
    }
    merged
}

fn stage_prompt(stage: Stage, outputs: &StageOutputs) -> String {
    let (task, shape) = match stage {
        Stage::StoryBible => (
            "Analyse the story and write its story bible: the canonical characters, key scenes, \
             visual style, tone and target audience.",
            r#"{"characters": [{"name": "", "description": ""}], "scenes": [{"title": "", "description": ""}], "visual_style": "", "tone": "", "target_audience": ""}"#,
        ),
        Stage::Characters => (
            "Extract a detailed profile for every named character, consistent with the story bible.",
            r#"{"characters": [{"name": "", "role": "", "appearance": "", "personality": "", "relationships": []}]}"#,
        ),
        Stage::Scenes => (
            "Break the story into scenes. Use only the characters listed below.",
            r#"{"scenes": [{"title": "", "location": "", "time_of_day": "", "characters": [], "description": ""}]}"#,
        ),
        Stage::Shots => (
            "Plan the camera shots for every scene listed below.",
            r#"{"shots": [{"scene": "", "shot_type": "", "camera_movement": "", "description": "", "duration_secs": 0}]}"#,
        ),
    };

    let mut prompt = format!("{task}\n\nRespond with JSON shaped like:\n{shape}");
    if let Some((label, value)) = outputs.prior(stage) {
        prompt.push_str(&format!("\n\n{label}:\n{value}"));
    }
    prompt
}

/// Parse the JSON payload of a model reply.
///
/// Accepts bare JSON, JSON inside a Markdown code fence, or JSON
/// surrounded by prose.
pub fn parse_json_payload(content: &str) -> std::result::Result<Value, String> {
    let text = strip_code_fence(content.trim());
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Ok(value);
    }

    match (text.find(['{', '[']), text.rfind(['}', ']'])) {
        (Some(start), Some(end)) if end > start => {
            serde_json::from_str(&text[start..=end]).map_err(|e| format!("invalid JSON: {e}"))
        }
        _ => Err("reply contains no JSON".to_string()),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}
