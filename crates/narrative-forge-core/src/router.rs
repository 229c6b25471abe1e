//! Capability- and cost-aware model routing.
//!
//! The [`ModelRouter`] keeps a registry of callable text-generation
//! models, each tagged with [`Capability`] values inferred from its
//! configuration, and picks one per [`TaskType`].
//!
//! # Routing
//!
//! | Step | Rule |
//! |------|------|
//! | Override | A registered `preferred_model` wins outright, no alternatives |
//! | Hard gate | Context window below the task minimum → excluded |
//! | Hard gate | Any required capability missing → excluded |
//! | Score | +10 per required, +5 per preferred capability matched |
//! | Score | Cost bonus `max(0, 5 − avg_cost × 100)` |
//! | Score | Context bonus `min(5, context_window / 50000)` |
//! | Select | Highest score; ties keep registration order |
//!
//! Cost never excludes a model; it only breaks near-ties. When nothing
//! survives the hard gates routing fails with
//! [`Error::NoSuitableModel`] instead of degrading to an incapable model.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chunk::estimate_tokens;
use crate::error::{Error, Result};

pub const DEFAULT_COST_PER_1K_INPUT: f64 = 0.01;
pub const DEFAULT_COST_PER_1K_OUTPUT: f64 = 0.03;
pub const DEFAULT_MODEL_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_CONTEXT_WINDOW: u32 = 8192;

const LONG_CONTEXT_THRESHOLD: u32 = 100_000;
const CHEAP_THRESHOLD: f64 = 0.005;
const ACCURATE_THRESHOLD: f64 = 0.02;
const OUTPUT_TOKEN_CAP: u32 = 1000;
const OUTPUT_TOKENS_PER_SEC: f64 = 50.0;
const MAX_ALTERNATIVES: usize = 3;

/// Providers whose models are tagged [`Capability::Chinese`].
pub const CHINESE_PROVIDERS: &[&str] = &[
    "deepseek", "qwen", "zhipu", "moonshot", "baidu", "minimax", "doubao", "alibaba", "baichuan",
];

/// What a registered model can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    LongContext,
    Cheap,
    Accurate,
    JsonMode,
    Chinese,
    Creative,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::LongContext => "long_context",
            Capability::Cheap => "cheap",
            Capability::Accurate => "accurate",
            Capability::JsonMode => "json_mode",
            Capability::Chinese => "chinese",
            Capability::Creative => "creative",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output modality of a registered model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[default]
    Text,
    Image,
    Video,
    Embedding,
}

/// A named unit of model work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    StoryAnalysis,
    CharacterExtraction,
    SceneBreakdown,
    ShotPlanning,
    Summarization,
}

impl TaskType {
    pub const ALL: [TaskType; 5] = [
        TaskType::StoryAnalysis,
        TaskType::CharacterExtraction,
        TaskType::SceneBreakdown,
        TaskType::ShotPlanning,
        TaskType::Summarization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::StoryAnalysis => "story_analysis",
            TaskType::CharacterExtraction => "character_extraction",
            TaskType::SceneBreakdown => "scene_breakdown",
            TaskType::ShotPlanning => "shot_planning",
            TaskType::Summarization => "summarization",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::invalid_input(format!("unknown task type: {s}")))
    }
}

/// Routing constraints for one task type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRequirement {
    /// Hard gate: every capability must be present.
    pub required_capabilities: Vec<Capability>,
    /// Soft bonus per matched capability.
    pub preferred_capabilities: Vec<Capability>,
    /// Hard gate on the model's context window.
    pub min_context_window: u32,
    pub description: String,
}

impl TaskRequirement {
    /// Built-in requirement for `task`.
    pub fn default_for(task: TaskType) -> Self {
        use Capability::*;
        let (required, preferred, min_context_window, description) = match task {
            TaskType::StoryAnalysis => (
                vec![LongContext],
                vec![Accurate, Chinese],
                100_000,
                "Read the whole narrative and distill the story bible",
            ),
            TaskType::CharacterExtraction => (
                vec![JsonMode],
                vec![Accurate],
                16_000,
                "Extract structured character profiles",
            ),
            TaskType::SceneBreakdown => (
                vec![JsonMode],
                vec![Creative, LongContext],
                32_000,
                "Break the narrative into structured scenes",
            ),
            TaskType::ShotPlanning => (
                vec![JsonMode, Creative],
                vec![Cheap],
                8_000,
                "Plan camera shots for a scene",
            ),
            TaskType::Summarization => (
                vec![],
                vec![Cheap, LongContext],
                4_000,
                "Summarize a passage",
            ),
        };
        Self {
            required_capabilities: required,
            preferred_capabilities: preferred,
            min_context_window,
            description: description.to_string(),
        }
    }
}

/// Registration input for a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: String,
    /// Vendor model name sent on the wire; defaults to the registry id.
    pub model: Option<String>,
    pub kind: ModelKind,
    pub max_tokens: u32,
    pub context_window: u32,
    pub cost_per_1k_input: Option<f64>,
    pub cost_per_1k_output: Option<f64>,
    pub supports_json: bool,
    /// Requests per minute, informational.
    pub rate_limit: Option<u32>,
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: None,
            kind: ModelKind::Text,
            max_tokens: DEFAULT_MODEL_MAX_TOKENS,
            context_window: DEFAULT_CONTEXT_WINDOW,
            cost_per_1k_input: None,
            cost_per_1k_output: None,
            supports_json: false,
            rate_limit: None,
            base_url: None,
            api_key_env: None,
        }
    }
}

/// A registered model with its derived capability tags.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRuntimeEntry {
    pub id: String,
    pub provider: String,
    pub max_tokens: u32,
    pub context_window: u32,
    pub cost_per_1k_input: f64,
    pub cost_per_1k_output: f64,
    pub capabilities: BTreeSet<Capability>,
    pub rate_limit: Option<u32>,
    pub raw_config: ModelConfig,
}

impl ModelRuntimeEntry {
    fn from_config(id: String, config: ModelConfig) -> Self {
        let cost_per_1k_input = config.cost_per_1k_input.unwrap_or(DEFAULT_COST_PER_1K_INPUT);
        let cost_per_1k_output = config
            .cost_per_1k_output
            .unwrap_or(DEFAULT_COST_PER_1K_OUTPUT);
        let capabilities = infer_capabilities(&config, cost_per_1k_input, cost_per_1k_output);
        Self {
            id,
            provider: config.provider.clone(),
            max_tokens: config.max_tokens,
            context_window: config.context_window,
            cost_per_1k_input,
            cost_per_1k_output,
            capabilities,
            rate_limit: config.rate_limit,
            raw_config: config,
        }
    }

    pub fn average_cost(&self) -> f64 {
        (self.cost_per_1k_input + self.cost_per_1k_output) / 2.0
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Cost in currency units for the given token counts.
    pub fn cost_for(&self, input_tokens: usize, output_tokens: usize) -> f64 {
        input_tokens as f64 / 1000.0 * self.cost_per_1k_input
            + output_tokens as f64 / 1000.0 * self.cost_per_1k_output
    }

    /// Call configuration handed to the [`TextGenerator`].
    pub fn call_config(&self, opts: &ExecutionOptions) -> ModelCallConfig {
        ModelCallConfig {
            model_id: self.id.clone(),
            model: self
                .raw_config
                .model
                .clone()
                .unwrap_or_else(|| self.id.clone()),
            provider: self.provider.clone(),
            base_url: self.raw_config.base_url.clone(),
            api_key_env: self.raw_config.api_key_env.clone(),
            max_tokens: opts.max_tokens.unwrap_or(self.max_tokens),
            temperature: opts.temperature,
            json_output: opts.json_output,
        }
    }
}

fn infer_capabilities(config: &ModelConfig, input: f64, output: f64) -> BTreeSet<Capability> {
    let mut caps = BTreeSet::new();
    let average = (input + output) / 2.0;
    if config.context_window >= LONG_CONTEXT_THRESHOLD {
        caps.insert(Capability::LongContext);
    }
    if average < CHEAP_THRESHOLD {
        caps.insert(Capability::Cheap);
    }
    if average > ACCURATE_THRESHOLD {
        caps.insert(Capability::Accurate);
    }
    if config.supports_json {
        caps.insert(Capability::JsonMode);
    }
    let provider = config.provider.to_lowercase();
    if CHINESE_PROVIDERS.contains(&provider.as_str()) {
        caps.insert(Capability::Chinese);
    }
    if config.kind == ModelKind::Text {
        caps.insert(Capability::Creative);
    }
    caps
}

/// Per-call configuration passed to a [`TextGenerator`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCallConfig {
    /// Registry id.
    pub model_id: String,
    /// Vendor model name.
    pub model: String,
    pub provider: String,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub json_output: bool,
}

/// Reply from a text-generation backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub success: bool,
    pub data: Option<String>,
    pub error: Option<String>,
}

impl GenerationResponse {
    pub fn ok(data: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Opaque text-completion capability.
///
/// Implementations report failures through [`GenerationResponse`]
/// rather than panicking; the router converts them into
/// [`Error::Provider`].
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate_text(
        &self,
        prompt: &str,
        config: &ModelCallConfig,
        system_prompt: Option<&str>,
    ) -> GenerationResponse;
}

/// A runner-up in a [`RoutingDecision`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alternative {
    pub model: String,
    pub estimated_cost: f64,
    pub score: f64,
    pub reason: String,
}

/// The router's choice for one call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub model: String,
    pub estimated_cost: f64,
    pub estimated_time: Duration,
    pub reason: String,
    pub score: f64,
    pub alternatives: Vec<Alternative>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub preferred_model: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub json_output: bool,
}

/// Outcome of one routed call.
///
/// Batch placeholders have an empty `model` and `content`, zero cost
/// and the failure message in `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub model: String,
    pub content: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub cost: f64,
    pub latency: Duration,
    pub error: Option<String>,
}

impl ExecutionResult {
    fn placeholder(error: String) -> Self {
        Self {
            model: String::new(),
            content: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            latency: Duration::ZERO,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelUsage {
    pub calls: u64,
    pub failures: u64,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub cost: f64,
}

/// Running totals across every executed call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageLedger {
    pub calls: u64,
    pub failures: u64,
    pub total_cost: f64,
    pub per_model: BTreeMap<String, ModelUsage>,
}

impl UsageLedger {
    fn record_success(&mut self, result: &ExecutionResult) {
        self.calls += 1;
        self.total_cost += result.cost;
        let entry = self.per_model.entry(result.model.clone()).or_default();
        entry.calls += 1;
        entry.input_tokens += result.input_tokens;
        entry.output_tokens += result.output_tokens;
        entry.cost += result.cost;
    }

    fn record_failure(&mut self, model: &str) {
        self.calls += 1;
        self.failures += 1;
        let entry = self.per_model.entry(model.to_string()).or_default();
        entry.calls += 1;
        entry.failures += 1;
    }
}

/// Registry of models plus per-task routing requirements.
pub struct ModelRouter {
    models: Vec<ModelRuntimeEntry>,
    tasks: HashMap<TaskType, TaskRequirement>,
    generator: Arc<dyn TextGenerator>,
    usage: Mutex<UsageLedger>,
}

impl ModelRouter {
    /// Create an empty registry with the built-in task requirements.
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        let tasks = TaskType::ALL
            .into_iter()
            .map(|t| (t, TaskRequirement::default_for(t)))
            .collect();
        Self {
            models: Vec::new(),
            tasks,
            generator,
            usage: Mutex::new(UsageLedger::default()),
        }
    }

    /// Register (or fully replace) a model.
    ///
    /// A replaced entry moves to the end of registration order.
    pub fn register_model(&mut self, id: impl Into<String>, config: ModelConfig) -> Result<()> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::invalid_input("model id must not be empty"));
        }
        if config.context_window == 0 || config.max_tokens == 0 {
            return Err(Error::invalid_input(format!(
                "model '{id}': context_window and max_tokens must be positive"
            )));
        }
        let negative = [config.cost_per_1k_input, config.cost_per_1k_output]
            .into_iter()
            .flatten()
            .any(|c| c < 0.0);
        if negative {
            return Err(Error::invalid_input(format!(
                "model '{id}': costs must not be negative"
            )));
        }

        self.models.retain(|m| m.id != id);
        let entry = ModelRuntimeEntry::from_config(id, config);
        tracing::info!(
            model = %entry.id,
            provider = %entry.provider,
            capabilities = ?entry.capabilities,
            "registered model"
        );
        self.models.push(entry);
        Ok(())
    }

    /// Remove a model. Returns whether it was registered.
    pub fn unregister_model(&mut self, id: &str) -> bool {
        let before = self.models.len();
        self.models.retain(|m| m.id != id);
        let removed = self.models.len() != before;
        if removed {
            tracing::info!(model = id, "unregistered model");
        }
        removed
    }

    /// Registered models in registration order.
    pub fn models(&self) -> &[ModelRuntimeEntry] {
        &self.models
    }

    pub fn model(&self, id: &str) -> Option<&ModelRuntimeEntry> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn set_task_requirement(&mut self, task: TaskType, requirement: TaskRequirement) {
        self.tasks.insert(task, requirement);
    }

    pub fn task_requirement(&self, task: TaskType) -> TaskRequirement {
        self.tasks
            .get(&task)
            .cloned()
            .unwrap_or_else(|| TaskRequirement::default_for(task))
    }

    /// Cost of a call against a registered model, or `None` if unknown.
    pub fn estimate_cost(&self, model_id: &str, input_tokens: usize, output_tokens: usize) -> Option<f64> {
        self.model(model_id)
            .map(|m| m.cost_for(input_tokens, output_tokens))
    }

    /// Snapshot of the usage ledger.
    pub fn usage(&self) -> UsageLedger {
        self.usage
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Select a model for `task`.
    ///
    /// `prompt_length` is in characters. A `preferred_model` that is not
    /// registered is ignored.
    pub fn get_routing_decision(
        &self,
        task: TaskType,
        prompt_length: usize,
        preferred_model: Option<&str>,
    ) -> Result<RoutingDecision> {
        let requirement = self.task_requirement(task);

        if let Some(preferred) = preferred_model {
            match self.model(preferred) {
                Some(entry) => {
                    let (estimated_cost, estimated_time) = estimate(entry, prompt_length);
                    return Ok(RoutingDecision {
                        model: entry.id.clone(),
                        estimated_cost,
                        estimated_time,
                        reason: format!("user override: {} requested explicitly", entry.id),
                        score: score(entry, &requirement),
                        alternatives: Vec::new(),
                    });
                }
                None => {
                    tracing::warn!(
                        model = preferred,
                        task = %task,
                        "preferred model is not registered, routing normally"
                    );
                }
            }
        }

        let mut candidates: Vec<(&ModelRuntimeEntry, f64)> = self
            .models
            .iter()
            .filter(|m| passes_gates(m, &requirement))
            .map(|m| (m, score(m, &requirement)))
            .collect();

        if candidates.is_empty() {
            let missing = self.missing_capabilities(&requirement);
            tracing::warn!(task = %task, missing = ?missing, "no model passes the hard gates");
            return Err(Error::NoSuitableModel {
                task: task.to_string(),
                missing,
                min_context_window: requirement.min_context_window,
            });
        }

        // Equal scores fall back to cheaper first; the stable sort keeps
        // registration order after that.
        candidates.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    a.0.average_cost()
                        .partial_cmp(&b.0.average_cost())
                        .unwrap_or(Ordering::Equal)
                })
        });

        let (winner, best) = candidates[0];
        let (estimated_cost, estimated_time) = estimate(winner, prompt_length);
        let alternatives = candidates[1..]
            .iter()
            .take(MAX_ALTERNATIVES)
            .map(|(m, s)| Alternative {
                model: m.id.clone(),
                estimated_cost: estimate(m, prompt_length).0,
                score: *s,
                reason: format!(
                    "score {:.2} ({:.2} below {}), avg cost {:.4}/1K, context {}",
                    s,
                    best - s,
                    winner.id,
                    m.average_cost(),
                    m.context_window
                ),
            })
            .collect();

        let decision = RoutingDecision {
            model: winner.id.clone(),
            estimated_cost,
            estimated_time,
            reason: explain(winner, &requirement, best, task),
            score: best,
            alternatives,
        };
        tracing::debug!(
            task = %task,
            model = %decision.model,
            score = decision.score,
            estimated_cost = decision.estimated_cost,
            "routing decision"
        );
        Ok(decision)
    }

    /// Route and execute a single prompt.
    ///
    /// Cost is recomputed from token estimates of the actual prompt,
    /// system prompt and reply. Provider failures surface as
    /// [`Error::Provider`] without retry.
    pub async fn route_and_execute(
        &self,
        task: TaskType,
        prompt: &str,
        opts: &ExecutionOptions,
    ) -> Result<ExecutionResult> {
        let decision = self.get_routing_decision(
            task,
            prompt.chars().count(),
            opts.preferred_model.as_deref(),
        )?;
        let entry = self
            .model(&decision.model)
            .ok_or_else(|| Error::invalid_input(format!("model vanished: {}", decision.model)))?;
        let call = entry.call_config(opts);

        let started = Instant::now();
        let response = self
            .generator
            .generate_text(prompt, &call, opts.system_prompt.as_deref())
            .await;
        let latency = started.elapsed();

        if !response.success {
            let message = response
                .error
                .unwrap_or_else(|| "provider reported failure without a message".to_string());
            self.usage
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .record_failure(&entry.id);
            tracing::warn!(model = %entry.id, task = %task, error = %message, "generation failed");
            return Err(Error::Provider(message));
        }

        let content = response.data.unwrap_or_default();
        let input_tokens = estimate_tokens(prompt)
            + opts.system_prompt.as_deref().map(estimate_tokens).unwrap_or(0);
        let output_tokens = estimate_tokens(&content);
        let result = ExecutionResult {
            model: entry.id.clone(),
            cost: entry.cost_for(input_tokens, output_tokens),
            content,
            input_tokens,
            output_tokens,
            latency,
            error: None,
        };

        self.usage
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .record_success(&result);
        tracing::info!(
            model = %result.model,
            task = %task,
            input_tokens,
            output_tokens,
            cost = result.cost,
            latency_ms = latency.as_millis() as u64,
            "generation complete"
        );
        Ok(result)
    }

    /// Execute prompts one after another.
    ///
    /// A failing prompt yields a placeholder result carrying the error
    /// message; later prompts still run.
    pub async fn route_and_execute_batch<S: AsRef<str>>(
        &self,
        task: TaskType,
        prompts: &[S],
        opts: &ExecutionOptions,
    ) -> Vec<ExecutionResult> {
        let mut results = Vec::with_capacity(prompts.len());
        for (index, prompt) in prompts.iter().enumerate() {
            match self.route_and_execute(task, prompt.as_ref(), opts).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::warn!(index, task = %task, error = %e, "batch item failed");
                    results.push(ExecutionResult::placeholder(e.to_string()));
                }
            }
        }
        results
    }

    fn missing_capabilities(&self, requirement: &TaskRequirement) -> Vec<String> {
        let eligible: Vec<&ModelRuntimeEntry> = self
            .models
            .iter()
            .filter(|m| m.context_window >= requirement.min_context_window)
            .collect();
        requirement
            .required_capabilities
            .iter()
            .filter(|c| !eligible.iter().any(|m| m.has(**c)))
            .map(|c| c.to_string())
            .collect()
    }
}

fn passes_gates(model: &ModelRuntimeEntry, requirement: &TaskRequirement) -> bool {
    model.context_window >= requirement.min_context_window
        && requirement
            .required_capabilities
            .iter()
            .all(|c| model.has(*c))
}

fn score(model: &ModelRuntimeEntry, requirement: &TaskRequirement) -> f64 {
    let required = requirement
        .required_capabilities
        .iter()
        .filter(|c| model.has(**c))
        .count() as f64;
    let preferred = requirement
        .preferred_capabilities
        .iter()
        .filter(|c| model.has(**c))
        .count() as f64;
    let cost_bonus = (5.0 - model.average_cost() * 100.0).max(0.0);
    let context_bonus = (model.context_window as f64 / 50_000.0).min(5.0);
    required * 10.0 + preferred * 5.0 + cost_bonus + context_bonus
}

/// `(cost, time)` for `prompt_length` chars in and up to 1000 tokens out.
fn estimate(model: &ModelRuntimeEntry, prompt_length: usize) -> (f64, Duration) {
    let input_tokens = prompt_length / 4;
    let output_tokens = model.max_tokens.min(OUTPUT_TOKEN_CAP) as usize;
    let cost = model.cost_for(input_tokens, output_tokens);
    let time = Duration::from_secs_f64(output_tokens as f64 / OUTPUT_TOKENS_PER_SEC);
    (cost, time)
}

fn explain(model: &ModelRuntimeEntry, requirement: &TaskRequirement, score: f64, task: TaskType) -> String {
    let join = |caps: Vec<String>| {
        if caps.is_empty() {
            "none".to_string()
        } else {
            caps.join(", ")
        }
    };
    let preferred: Vec<String> = requirement
        .preferred_capabilities
        .iter()
        .filter(|c| model.has(**c))
        .map(|c| c.to_string())
        .collect();
    let required: Vec<String> = requirement
        .required_capabilities
        .iter()
        .map(|c| c.to_string())
        .collect();
    format!(
        "best score {:.2} for {}: required [{}], preferred matched [{}], avg cost {:.4}/1K, context {}",
        score,
        task,
        join(required),
        join(preferred),
        model.average_cost(),
        model.context_window
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockGenerator {
        reply: String,
        fail_marker: Option<String>,
        calls: Mutex<Vec<ModelCallConfig>>,
    }

    impl MockGenerator {
        fn replying(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl TextGenerator for MockGenerator {
        async fn generate_text(
            &self,
            prompt: &str,
            config: &ModelCallConfig,
            _system_prompt: Option<&str>,
        ) -> GenerationResponse {
            self.calls.lock().unwrap().push(config.clone());
            match &self.fail_marker {
                Some(marker) if prompt.contains(marker.as_str()) => {
                    GenerationResponse::failed("upstream 503")
                }
                _ => GenerationResponse::ok(self.reply.clone()),
            }
        }
    }

    fn json_model(input: f64, output: f64) -> ModelConfig {
        ModelConfig {
            context_window: 32_000,
            cost_per_1k_input: Some(input),
            cost_per_1k_output: Some(output),
            supports_json: true,
            ..ModelConfig::default()
        }
    }

    fn json_only() -> TaskRequirement {
        TaskRequirement {
            required_capabilities: vec![Capability::JsonMode],
            preferred_capabilities: vec![],
            min_context_window: 8_000,
            description: "test".to_string(),
        }
    }

    fn router() -> ModelRouter {
        let mut router = ModelRouter::new(Arc::new(MockGenerator::replying("ok")));
        router.set_task_requirement(TaskType::CharacterExtraction, json_only());
        router
    }

    #[test]
    fn test_capability_inference() {
        let mut r = router();
        r.register_model(
            "ds",
            ModelConfig {
                provider: "DeepSeek".to_string(),
                context_window: 128_000,
                cost_per_1k_input: Some(0.0005),
                cost_per_1k_output: Some(0.0015),
                supports_json: true,
                ..ModelConfig::default()
            },
        )
        .unwrap();
        r.register_model(
            "painter",
            ModelConfig {
                kind: ModelKind::Image,
                cost_per_1k_input: Some(0.03),
                cost_per_1k_output: Some(0.06),
                ..ModelConfig::default()
            },
        )
        .unwrap();

        let ds = r.model("ds").unwrap();
        let expected: BTreeSet<Capability> = [
            Capability::LongContext,
            Capability::Cheap,
            Capability::JsonMode,
            Capability::Chinese,
            Capability::Creative,
        ]
        .into_iter()
        .collect();
        assert_eq!(ds.capabilities, expected);

        let painter = r.model("painter").unwrap();
        assert!(painter.has(Capability::Accurate));
        assert!(!painter.has(Capability::Creative));
    }

    #[test]
    fn test_default_costs_are_neither_cheap_nor_accurate() {
        let mut r = router();
        r.register_model("plain", ModelConfig::default()).unwrap();
        let plain = r.model("plain").unwrap();
        assert_eq!(plain.cost_per_1k_input, DEFAULT_COST_PER_1K_INPUT);
        assert_eq!(plain.cost_per_1k_output, DEFAULT_COST_PER_1K_OUTPUT);
        assert!(!plain.has(Capability::Cheap));
        assert!(!plain.has(Capability::Accurate));
    }

    #[test]
    fn test_cheaper_model_wins_with_identical_capabilities() {
        let mut r = router();
        r.register_model("pricey", json_model(0.015, 0.015)).unwrap();
        r.register_model("thrifty", json_model(0.006, 0.006)).unwrap();
        assert_eq!(
            r.model("pricey").unwrap().capabilities,
            r.model("thrifty").unwrap().capabilities
        );

        let decision = r
            .get_routing_decision(TaskType::CharacterExtraction, 400, None)
            .unwrap();
        assert_eq!(decision.model, "thrifty");
        assert_eq!(decision.alternatives.len(), 1);
        assert_eq!(decision.alternatives[0].model, "pricey");
        assert!(decision.score > decision.alternatives[0].score);
    }

    #[test]
    fn test_unregister_falls_back_to_next_cheapest() {
        let mut r = router();
        r.register_model("a", json_model(0.006, 0.006)).unwrap();
        r.register_model("b", json_model(0.010, 0.010)).unwrap();
        r.register_model("c", json_model(0.015, 0.015)).unwrap();
        let first = r
            .get_routing_decision(TaskType::CharacterExtraction, 100, None)
            .unwrap();
        assert_eq!(first.model, "a");

        assert!(r.unregister_model("a"));
        assert!(!r.unregister_model("a"));
        let second = r
            .get_routing_decision(TaskType::CharacterExtraction, 100, None)
            .unwrap();
        assert_eq!(second.model, "b");
    }

    #[test]
    fn test_hard_gates_are_never_overridden_by_cost() {
        let mut r = router();
        let mut no_json = json_model(0.0001, 0.0001);
        no_json.supports_json = false;
        r.register_model("free-but-no-json", no_json).unwrap();
        let mut tiny = json_model(0.0001, 0.0001);
        tiny.context_window = 4_000;
        r.register_model("free-but-tiny", tiny).unwrap();
        r.register_model("capable", json_model(0.05, 0.05)).unwrap();

        let decision = r
            .get_routing_decision(TaskType::CharacterExtraction, 100, None)
            .unwrap();
        assert_eq!(decision.model, "capable");
        assert!(decision.alternatives.is_empty());

        let requirement = r.task_requirement(TaskType::CharacterExtraction);
        let chosen = r.model(&decision.model).unwrap();
        assert!(requirement
            .required_capabilities
            .iter()
            .all(|c| chosen.has(*c)));
        assert!(chosen.context_window >= requirement.min_context_window);
    }

    #[test]
    fn test_no_suitable_model_names_missing_capabilities() {
        let mut r = router();
        let mut no_json = json_model(0.001, 0.001);
        no_json.supports_json = false;
        r.register_model("prose-only", no_json).unwrap();

        let err = r
            .get_routing_decision(TaskType::CharacterExtraction, 100, None)
            .unwrap_err();
        match err {
            Error::NoSuitableModel {
                task,
                missing,
                min_context_window,
            } => {
                assert_eq!(task, "character_extraction");
                assert_eq!(missing, vec!["json_mode".to_string()]);
                assert_eq!(min_context_window, 8_000);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_registered_preference_is_user_override() {
        let mut r = router();
        r.register_model("thrifty", json_model(0.006, 0.006)).unwrap();
        r.register_model("pricey", json_model(0.015, 0.015)).unwrap();

        let decision = r
            .get_routing_decision(TaskType::CharacterExtraction, 100, Some("pricey"))
            .unwrap();
        assert_eq!(decision.model, "pricey");
        assert!(decision.reason.starts_with("user override"));
        assert!(decision.alternatives.is_empty());

        let ignored = r
            .get_routing_decision(TaskType::CharacterExtraction, 100, Some("ghost"))
            .unwrap();
        assert_eq!(ignored.model, "thrifty");
    }

    #[test]
    fn test_equal_scores_prefer_the_cheaper_model() {
        let mut r = router();
        r.register_model("pricier", json_model(0.08, 0.08)).unwrap();
        r.register_model("cheaper", json_model(0.06, 0.06)).unwrap();

        let decision = r
            .get_routing_decision(TaskType::CharacterExtraction, 100, None)
            .unwrap();
        assert_eq!(decision.model, "cheaper");
        assert_eq!(decision.alternatives[0].model, "pricier");
        assert_eq!(decision.score, decision.alternatives[0].score);

        r.register_model("dearest", json_model(0.2, 0.2)).unwrap();
        assert!(r.unregister_model("cheaper"));
        let fallback = r
            .get_routing_decision(TaskType::CharacterExtraction, 100, None)
            .unwrap();
        assert_eq!(fallback.model, "pricier");
    }

    #[test]
    fn test_cheap_small_model_beats_expensive_long_context_model() {
        let mut r = router();
        r.register_model("cheap", json_model(0.001, 0.003)).unwrap();
        let mut expensive = json_model(0.1, 0.3);
        expensive.context_window = 128_000;
        r.register_model("expensive", expensive).unwrap();

        let decision = r
            .get_routing_decision(TaskType::CharacterExtraction, 2_000, None)
            .unwrap();
        assert_eq!(decision.model, "cheap");
        assert_eq!(decision.alternatives[0].model, "expensive");

        assert!(r.unregister_model("cheap"));
        let fallback = r
            .get_routing_decision(TaskType::CharacterExtraction, 2_000, None)
            .unwrap();
        assert_eq!(fallback.model, "expensive");
        assert!(fallback.alternatives.is_empty());
    }

    #[test]
    fn test_ties_keep_registration_order_and_reregistration_moves_entry() {
        let mut r = router();
        r.register_model("first", json_model(0.01, 0.01)).unwrap();
        r.register_model("second", json_model(0.01, 0.01)).unwrap();
        let decision = r
            .get_routing_decision(TaskType::CharacterExtraction, 100, None)
            .unwrap();
        assert_eq!(decision.model, "first");

        r.register_model("first", json_model(0.01, 0.01)).unwrap();
        assert_eq!(r.models().len(), 2);
        let decision = r
            .get_routing_decision(TaskType::CharacterExtraction, 100, None)
            .unwrap();
        assert_eq!(decision.model, "second");
    }

    #[test]
    fn test_at_most_three_alternatives() {
        let mut r = router();
        for (i, cost) in [0.006, 0.008, 0.010, 0.012, 0.014].into_iter().enumerate() {
            r.register_model(format!("m{i}"), json_model(cost, cost)).unwrap();
        }
        let decision = r
            .get_routing_decision(TaskType::CharacterExtraction, 100, None)
            .unwrap();
        assert_eq!(decision.model, "m0");
        let alts: Vec<&str> = decision.alternatives.iter().map(|a| a.model.as_str()).collect();
        assert_eq!(alts, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_estimates() {
        let mut r = router();
        let mut config = json_model(0.006, 0.012);
        config.max_tokens = 500;
        r.register_model("m", config).unwrap();
        let decision = r
            .get_routing_decision(TaskType::CharacterExtraction, 4000, None)
            .unwrap();
        // 1000 input tokens, 500 output tokens
        assert!((decision.estimated_cost - (0.006 + 0.006)).abs() < 1e-9);
        assert_eq!(decision.estimated_time, Duration::from_secs(10));
    }

    #[test]
    fn test_default_requirements_and_task_parsing() {
        let r = ModelRouter::new(Arc::new(MockGenerator::default()));
        let shots = r.task_requirement(TaskType::ShotPlanning);
        assert_eq!(
            shots.required_capabilities,
            vec![Capability::JsonMode, Capability::Creative]
        );
        assert_eq!(
            "scene_breakdown".parse::<TaskType>().unwrap(),
            TaskType::SceneBreakdown
        );
        assert!("painting".parse::<TaskType>().unwrap_err().is_validation());
    }

    #[test]
    fn test_cli_task_names_parse() {
        for name in [
            "story_analysis",
            "character_extraction",
            "scene_breakdown",
            "shot_planning",
            "summarization",
        ] {
            assert_eq!(name.parse::<TaskType>().unwrap().to_string(), name);
        }
        assert!("prompt_generation".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_register_rejects_bad_config() {
        let mut r = router();
        assert!(r.register_model("", ModelConfig::default()).is_err());
        let mut zero = ModelConfig::default();
        zero.context_window = 0;
        assert!(r.register_model("z", zero).is_err());
        assert!(r.register_model("n", json_model(-0.1, 0.1)).is_err());
        assert!(r.models().is_empty());
    }

    #[tokio::test]
    async fn test_route_and_execute_uses_actual_tokens() {
        let generator = Arc::new(MockGenerator::replying("Hello world"));
        let mut r = ModelRouter::new(generator.clone());
        r.set_task_requirement(TaskType::CharacterExtraction, json_only());
        r.register_model("m", json_model(0.006, 0.012)).unwrap();

        let opts = ExecutionOptions {
            system_prompt: Some("be brief".to_string()),
            json_output: true,
            ..ExecutionOptions::default()
        };
        let result = r
            .route_and_execute(TaskType::CharacterExtraction, "one two three four", &opts)
            .await
            .unwrap();

        assert_eq!(result.model, "m");
        assert_eq!(result.content, "Hello world");
        assert_eq!(result.input_tokens, 6 + 3);
        assert_eq!(result.output_tokens, 3);
        assert!((result.cost - (0.009 * 0.006 + 0.003 * 0.012)).abs() < 1e-12);

        let calls = generator.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].json_output);
        assert_eq!(calls[0].model, "m");

        let usage = r.usage();
        assert_eq!(usage.calls, 1);
        assert_eq!(usage.per_model["m"].output_tokens, 3);
    }

    #[tokio::test]
    async fn test_provider_failure_propagates() {
        let generator = Arc::new(MockGenerator {
            fail_marker: Some("boom".to_string()),
            ..MockGenerator::default()
        });
        let mut r = ModelRouter::new(generator.clone());
        r.set_task_requirement(TaskType::CharacterExtraction, json_only());
        r.register_model("m", json_model(0.006, 0.006)).unwrap();

        let err = r
            .route_and_execute(TaskType::CharacterExtraction, "boom", &ExecutionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(ref m) if m == "upstream 503"));
        assert_eq!(generator.calls.lock().unwrap().len(), 1);
        assert_eq!(r.usage().failures, 1);
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let generator = Arc::new(MockGenerator {
            reply: "fine".to_string(),
            fail_marker: Some("fail".to_string()),
            ..MockGenerator::default()
        });
        let mut r = ModelRouter::new(generator);
        r.set_task_requirement(TaskType::CharacterExtraction, json_only());
        r.register_model("m", json_model(0.006, 0.006)).unwrap();

        let results = r
            .route_and_execute_batch(
                TaskType::CharacterExtraction,
                &["first", "please fail", "third"],
                &ExecutionOptions::default(),
            )
            .await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_success());
        assert_eq!(results[1].cost, 0.0);
        assert!(results[1].content.is_empty());
        assert!(results[1].error.as_deref().unwrap().contains("upstream 503"));
        assert!(results[2].is_success());
        assert_eq!(r.usage().calls, 3);
    }

    #[tokio::test]
    async fn test_batch_without_models_yields_placeholders() {
        let r = router();
        let results = r
            .route_and_execute_batch(TaskType::Summarization, &["a", "b"], &ExecutionOptions::default())
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.is_success()));
    }
}
