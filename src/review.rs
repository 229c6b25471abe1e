//! Human-in-the-loop review gate.
//!
//! Every pipeline stage output becomes a [`Checkpoint`] that a reviewer
//! approves, rejects or modifies. The gate also owns the lifecycle of the
//! canonical [`StoryBible`]: approving a `story_bible` checkpoint (with
//! auto-lock on) or calling [`ReviewGate::lock_story_bible`] locks it,
//! and only [`ReviewGate::unlock_story_bible`] releases it.
//!
//! # State machine
//!
//! ```text
//! awaiting_review ──approve──▶ approved
//!        │ ─────────reject───▶ rejected
//!        └─────────modify───▶ modified
//! ```
//!
//! All three outcomes are terminal. The checkpoint table sits behind a
//! mutex so a reviewer task and the orchestrator can share one gate via
//! `Arc`; every change bumps a `tokio::sync::watch` channel that
//! [`ReviewGate::wait_for_review`] sleeps on.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use narrative_forge_core::router::TaskType;
use narrative_forge_core::{Error, Result, ValidationError};

pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 3600;

const AUTO_APPROVED_NOTE: &str = "auto-approved: review disabled";

/// Pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    StoryBible,
    Characters,
    Scenes,
    Shots,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::StoryBible,
        Stage::Characters,
        Stage::Scenes,
        Stage::Shots,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::StoryBible => "story_bible",
            Stage::Characters => "characters",
            Stage::Scenes => "scenes",
            Stage::Shots => "shots",
        }
    }

    /// The router task type executed for this stage.
    pub fn task_type(&self) -> TaskType {
        match self {
            Stage::StoryBible => TaskType::StoryAnalysis,
            Stage::Characters => TaskType::CharacterExtraction,
            Stage::Scenes => TaskType::SceneBreakdown,
            Stage::Shots => TaskType::ShotPlanning,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| Error::invalid_input(format!("unknown stage: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// Recorded but not yet handed to a reviewer.
    Pending,
    AwaitingReview,
    Approved,
    Rejected,
    Modified,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::AwaitingReview => "awaiting_review",
            CheckpointStatus::Approved => "approved",
            CheckpointStatus::Rejected => "rejected",
            CheckpointStatus::Modified => "modified",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CheckpointStatus::Approved | CheckpointStatus::Rejected | CheckpointStatus::Modified
        )
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stage output under review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub stage: Stage,
    pub status: CheckpointStatus,
    pub data: Value,
    pub submitted_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewer_notes: Option<String>,
    pub modifications: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
    Modify,
}

#[derive(Debug, Clone, Default)]
pub struct ReviewOptions {
    pub notes: Option<String>,
    /// Required for [`ReviewDecision::Modify`].
    pub modifications: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Skip review for this checkpoint only.
    pub auto_approve: bool,
    pub notes: Option<String>,
}

/// Canonical story facts governing every later stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoryBible {
    pub locked: bool,
    pub characters: Vec<Value>,
    pub scenes: Vec<Value>,
    pub visual_style: String,
    pub tone: String,
    pub target_audience: String,
    pub locked_at: Option<DateTime<Utc>>,
}

impl StoryBible {
    /// Build an unlocked bible from loosely shaped stage output.
    ///
    /// Missing or mistyped fields fall back to empty values.
    pub fn from_value(value: &Value) -> Self {
        let list = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };
        let text = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            locked: false,
            characters: list("characters"),
            scenes: list("scenes"),
            visual_style: text("visual_style"),
            tone: text("tone"),
            target_audience: text("target_audience"),
            locked_at: None,
        }
    }
}

/// Review gate settings (`[review]` in the config file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub enabled: bool,
    pub auto_lock_after_approval: bool,
    /// Unlocking a bible locked more recently than this logs a warning.
    pub lock_timeout_secs: u64,
    pub required_stages: Vec<Stage>,
    /// How long the orchestrator blocks on one review.
    pub wait_timeout_secs: u64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_lock_after_approval: true,
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            required_stages: Stage::ALL.to_vec(),
            wait_timeout_secs: DEFAULT_WAIT_TIMEOUT_SECS,
        }
    }
}

impl ReviewConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

/// Hook fired when a checkpoint starts waiting for a reviewer.
///
/// Delivery is best effort: errors are logged and never fail the
/// submission.
#[async_trait]
pub trait ReviewNotifier: Send + Sync {
    async fn notify(&self, checkpoint: &Checkpoint) -> anyhow::Result<()>;
}

/// Notifier that emits a structured log event.
pub struct TracingNotifier;

#[async_trait]
impl ReviewNotifier for TracingNotifier {
    async fn notify(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        tracing::info!(
            checkpoint = %checkpoint.id,
            stage = %checkpoint.stage,
            "checkpoint awaiting review"
        );
        Ok(())
    }
}

/// Aggregate counts over every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReviewReport {
    pub total: usize,
    pub pending: usize,
    pub awaiting_review: usize,
    pub approved: usize,
    pub rejected: usize,
    pub modified: usize,
    /// Mean of `reviewed_at - submitted_at` over reviewed checkpoints.
    pub average_review_time: Duration,
    pub story_bible_locked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItemOutcome {
    pub id: String,
    pub status: Option<CheckpointStatus>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReviewReport {
    pub outcomes: Vec<BatchItemOutcome>,
}

impl BatchReviewReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_none()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// Serializable copy of the gate's state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewSnapshot {
    pub checkpoints: Vec<Checkpoint>,
    pub story_bible: Option<StoryBible>,
}

#[derive(Default)]
struct GateState {
    checkpoints: Vec<Checkpoint>,
    story_bible: Option<StoryBible>,
}

impl GateState {
    fn find_mut(&mut self, id: &str) -> Option<&mut Checkpoint> {
        self.checkpoints.iter_mut().find(|c| c.id == id)
    }

    fn lock_bible(&mut self, data: &Value) -> StoryBible {
        let mut bible = StoryBible::from_value(data);
        bible.locked = true;
        bible.locked_at = Some(Utc::now());
        self.story_bible = Some(bible.clone());
        bible
    }
}

/// Checkpoint table plus story-bible lock.
pub struct ReviewGate {
    config: ReviewConfig,
    state: Mutex<GateState>,
    changes: watch::Sender<u64>,
    notifier: Option<Arc<dyn ReviewNotifier>>,
}

impl ReviewGate {
    pub fn new(config: ReviewConfig) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            config,
            state: Mutex::new(GateState::default()),
            changes,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ReviewNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &ReviewConfig {
        &self.config
    }

    /// Change notifications: the value increments on every mutation.
    ///
    /// Lets an external reviewer react to new checkpoints without polling.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn bump(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    /// True if `stage` must pass human review before the pipeline moves on.
    pub fn is_stage_required(&self, stage: Stage) -> bool {
        self.config.enabled && self.config.required_stages.contains(&stage)
    }

    /// Record `data` as a checkpoint for `stage`.
    ///
    /// With review disabled (or `opts.auto_approve`) the checkpoint is
    /// approved on the spot and a `story_bible` checkpoint locks the
    /// bible. Otherwise it waits in `awaiting_review` and the notifier
    /// fires.
    pub async fn submit_for_review(
        &self,
        stage: Stage,
        data: Value,
        opts: SubmitOptions,
    ) -> Result<Checkpoint> {
        let now = Utc::now();
        let auto = !self.config.enabled || opts.auto_approve;
        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            stage,
            status: if auto {
                CheckpointStatus::Approved
            } else {
                CheckpointStatus::AwaitingReview
            },
            data,
            submitted_at: now,
            reviewed_at: auto.then_some(now),
            reviewer_notes: if auto {
                Some(opts.notes.unwrap_or_else(|| AUTO_APPROVED_NOTE.to_string()))
            } else {
                opts.notes
            },
            modifications: None,
        };

        {
            let mut state = self.state();
            if auto && stage == Stage::StoryBible {
                state.lock_bible(&checkpoint.data);
                tracing::info!(checkpoint = %checkpoint.id, "story bible locked on auto-approval");
            }
            state.checkpoints.push(checkpoint.clone());
        }
        self.bump();
        tracing::info!(
            checkpoint = %checkpoint.id,
            stage = %stage,
            status = %checkpoint.status,
            "checkpoint submitted"
        );

        if checkpoint.status == CheckpointStatus::AwaitingReview {
            if let Some(notifier) = &self.notifier {
                if let Err(e) = notifier.notify(&checkpoint).await {
                    tracing::warn!(checkpoint = %checkpoint.id, error = %e, "review notification failed");
                }
            }
        }

        Ok(checkpoint)
    }

    /// Apply a reviewer decision.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::CheckpointNotFound`] for an unknown id.
    /// - [`ValidationError::NotAwaitingReview`] if the checkpoint was
    ///   already reviewed.
    /// - [`ValidationError::InvalidInput`] for `modify` without
    ///   modifications.
    pub fn review(&self, id: &str, decision: ReviewDecision, opts: ReviewOptions) -> Result<Checkpoint> {
        let reviewed = {
            let mut state = self.state();
            let auto_lock = self.config.auto_lock_after_approval;
            let checkpoint = state
                .find_mut(id)
                .ok_or_else(|| ValidationError::CheckpointNotFound(id.to_string()))?;

            if checkpoint.status != CheckpointStatus::AwaitingReview {
                return Err(ValidationError::NotAwaitingReview {
                    id: id.to_string(),
                    status: checkpoint.status.to_string(),
                }
                .into());
            }

            match decision {
                ReviewDecision::Approve => checkpoint.status = CheckpointStatus::Approved,
                ReviewDecision::Reject => checkpoint.status = CheckpointStatus::Rejected,
                ReviewDecision::Modify => {
                    let modifications = opts.modifications.ok_or_else(|| {
                        Error::invalid_input("modify decision requires modifications")
                    })?;
                    merge_shallow(&mut checkpoint.data, &modifications);
                    checkpoint.modifications = Some(modifications);
                    checkpoint.status = CheckpointStatus::Modified;
                }
            }
            checkpoint.reviewed_at = Some(Utc::now());
            checkpoint.reviewer_notes = opts.notes;
            let reviewed = checkpoint.clone();

            if reviewed.status == CheckpointStatus::Approved
                && reviewed.stage == Stage::StoryBible
                && auto_lock
            {
                state.lock_bible(&reviewed.data);
                tracing::info!(checkpoint = %reviewed.id, "story bible locked on approval");
            }
            reviewed
        };

        self.bump();
        tracing::info!(
            checkpoint = %reviewed.id,
            stage = %reviewed.stage,
            status = %reviewed.status,
            "checkpoint reviewed"
        );
        Ok(reviewed)
    }

    /// Apply one decision to many checkpoints.
    ///
    /// Failures are logged and reported per item; they never stop the
    /// rest of the batch.
    pub fn batch_review(&self, ids: &[String], decision: ReviewDecision, opts: ReviewOptions) -> BatchReviewReport {
        let mut report = BatchReviewReport::default();
        for id in ids {
            let outcome = match self.review(id, decision, opts.clone()) {
                Ok(checkpoint) => BatchItemOutcome {
                    id: id.clone(),
                    status: Some(checkpoint.status),
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(checkpoint = %id, error = %e, "batch review item failed");
                    BatchItemOutcome {
                        id: id.clone(),
                        status: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            report.outcomes.push(outcome);
        }
        report
    }

    /// Block until checkpoint `id` leaves `awaiting_review`.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] once `timeout` elapses.
    /// - [`ValidationError::CheckpointNotFound`] immediately if the
    ///   checkpoint does not exist or is discarded while waiting.
    pub async fn wait_for_review(&self, id: &str, timeout: Duration) -> Result<Checkpoint> {
        let mut changes = self.changes.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            {
                let state = self.state();
                let checkpoint = state
                    .checkpoints
                    .iter()
                    .find(|c| c.id == id)
                    .ok_or_else(|| ValidationError::CheckpointNotFound(id.to_string()))?;
                if checkpoint.status != CheckpointStatus::AwaitingReview {
                    return Ok(checkpoint.clone());
                }
            }

            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(Error::invalid_input("review gate closed while waiting"));
                }
                Err(_) => {
                    tracing::warn!(checkpoint = id, waited = ?timeout, "review wait timed out");
                    return Err(Error::Timeout {
                        id: id.to_string(),
                        waited: timeout,
                    });
                }
            }
        }
    }

    /// Lock `data` as the canonical story bible, replacing any prior one.
    pub fn lock_story_bible(&self, data: &Value) -> StoryBible {
        let bible = self.state().lock_bible(data);
        self.bump();
        tracing::info!(
            characters = bible.characters.len(),
            scenes = bible.scenes.len(),
            "story bible locked"
        );
        bible
    }

    /// Unlock the story bible. Returns whether a locked bible existed.
    ///
    /// Unlocking is always honoured; unlocking sooner than the configured
    /// lock timeout only logs a warning.
    pub fn unlock_story_bible(&self, reason: &str) -> bool {
        let unlocked = {
            let mut state = self.state();
            match state.story_bible.as_mut() {
                Some(bible) if bible.locked => {
                    if let Some(locked_at) = bible.locked_at {
                        let age = (Utc::now() - locked_at).to_std().unwrap_or_default();
                        if age < self.config.lock_timeout() {
                            tracing::warn!(
                                age = ?age,
                                lock_timeout = ?self.config.lock_timeout(),
                                reason,
                                "unlocking story bible before lock timeout"
                            );
                        }
                    }
                    bible.locked = false;
                    bible.locked_at = None;
                    true
                }
                _ => false,
            }
        };
        if unlocked {
            self.bump();
            tracing::info!(reason, "story bible unlocked");
        }
        unlocked
    }

    pub fn story_bible(&self) -> Option<StoryBible> {
        self.state().story_bible.clone()
    }

    /// The story bible, only while it is locked.
    pub fn locked_story_bible(&self) -> Option<StoryBible> {
        self.state().story_bible.clone().filter(|b| b.locked)
    }

    pub fn is_story_bible_locked(&self) -> bool {
        self.state()
            .story_bible
            .as_ref()
            .is_some_and(|b| b.locked)
    }

    pub fn checkpoint(&self, id: &str) -> Option<Checkpoint> {
        self.state().checkpoints.iter().find(|c| c.id == id).cloned()
    }

    /// Checkpoints in submission order, optionally for one stage.
    pub fn checkpoints(&self, stage: Option<Stage>) -> Vec<Checkpoint> {
        self.state()
            .checkpoints
            .iter()
            .filter(|c| stage.is_none() || stage == Some(c.stage))
            .cloned()
            .collect()
    }

    /// Checkpoints still waiting for a reviewer.
    pub fn pending_reviews(&self) -> Vec<Checkpoint> {
        self.state()
            .checkpoints
            .iter()
            .filter(|c| c.status == CheckpointStatus::AwaitingReview)
            .cloned()
            .collect()
    }

    /// Drop a checkpoint. Waiters on it fail with not-found.
    pub fn discard_checkpoint(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.state();
            let before = state.checkpoints.len();
            state.checkpoints.retain(|c| c.id != id);
            state.checkpoints.len() != before
        };
        if removed {
            self.bump();
        }
        removed
    }

    pub fn generate_report(&self) -> ReviewReport {
        let state = self.state();
        let mut report = ReviewReport {
            total: state.checkpoints.len(),
            story_bible_locked: state.story_bible.as_ref().is_some_and(|b| b.locked),
            ..ReviewReport::default()
        };

        let mut reviewed = 0u32;
        let mut total_time = Duration::ZERO;
        for checkpoint in &state.checkpoints {
            match checkpoint.status {
                CheckpointStatus::Pending => report.pending += 1,
                CheckpointStatus::AwaitingReview => report.awaiting_review += 1,
                CheckpointStatus::Approved => report.approved += 1,
                CheckpointStatus::Rejected => report.rejected += 1,
                CheckpointStatus::Modified => report.modified += 1,
            }
            if let Some(reviewed_at) = checkpoint.reviewed_at {
                reviewed += 1;
                total_time += (reviewed_at - checkpoint.submitted_at)
                    .to_std()
                    .unwrap_or_default();
            }
        }
        if reviewed > 0 {
            report.average_review_time = total_time / reviewed;
        }
        report
    }

    pub fn snapshot(&self) -> ReviewSnapshot {
        let state = self.state();
        ReviewSnapshot {
            checkpoints: state.checkpoints.clone(),
            story_bible: state.story_bible.clone(),
        }
    }

    /// Replace the gate's state with `snapshot`.
    pub fn restore(&self, snapshot: ReviewSnapshot) {
        {
            let mut state = self.state();
            state.checkpoints = snapshot.checkpoints;
            state.story_bible = snapshot.story_bible;
        }
        self.bump();
        tracing::debug!("review state restored");
    }
}

/// Merge object `patch` into object `data`; any other shape replaces `data`.
fn merge_shallow(data: &mut Value, patch: &Value) {
    match (data.as_object_mut(), patch.as_object()) {
        (Some(target), Some(fields)) => {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        }
        _ => *data = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gate() -> ReviewGate {
        ReviewGate::new(ReviewConfig::default())
    }

    fn bible_data() -> Value {
        json!({
            "characters": [{"name": "Elena"}],
            "scenes": [],
            "visual_style": "ink wash",
            "tone": "melancholy",
            "target_audience": "adult"
        })
    }

    #[tokio::test]
    async fn test_story_bible_approval_locks() {
        let gate = gate();
        let cp = gate
            .submit_for_review(Stage::StoryBible, bible_data(), SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(cp.status, CheckpointStatus::AwaitingReview);
        assert!(!gate.is_story_bible_locked());

        let reviewed = gate
            .review(&cp.id, ReviewDecision::Approve, ReviewOptions::default())
            .unwrap();
        assert_eq!(reviewed.status, CheckpointStatus::Approved);
        assert!(reviewed.reviewed_at.is_some());

        let bible = gate.locked_story_bible().unwrap();
        assert!(bible.locked);
        assert!(bible.locked_at.is_some());
        assert_eq!(bible.tone, "melancholy");
        assert_eq!(bible.characters.len(), 1);
    }

    #[tokio::test]
    async fn test_approval_without_auto_lock_leaves_bible_unlocked() {
        let gate = ReviewGate::new(ReviewConfig {
            auto_lock_after_approval: false,
            ..ReviewConfig::default()
        });
        let cp = gate
            .submit_for_review(Stage::StoryBible, bible_data(), SubmitOptions::default())
            .await
            .unwrap();
        gate.review(&cp.id, ReviewDecision::Approve, ReviewOptions::default())
            .unwrap();
        assert!(!gate.is_story_bible_locked());
    }

    #[tokio::test]
    async fn test_terminal_states_cannot_be_reviewed_again() {
        let gate = gate();
        let cp = gate
            .submit_for_review(Stage::Scenes, json!({}), SubmitOptions::default())
            .await
            .unwrap();
        gate.review(&cp.id, ReviewDecision::Reject, ReviewOptions::default())
            .unwrap();
        let err = gate
            .review(&cp.id, ReviewDecision::Approve, ReviewOptions::default())
            .unwrap_err();
        assert!(err.is_not_awaiting_review());
        assert_eq!(gate.checkpoint(&cp.id).unwrap().status, CheckpointStatus::Rejected);
    }

    #[test]
    fn test_unknown_checkpoint_is_not_found() {
        let err = gate()
            .review("missing", ReviewDecision::Approve, ReviewOptions::default())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_modify_merges_objects_and_replaces_other_shapes() {
        let gate = gate();
        let cp = gate
            .submit_for_review(
                Stage::Characters,
                json!({"name": "Elena", "age": 30}),
                SubmitOptions::default(),
            )
            .await
            .unwrap();
        let reviewed = gate
            .review(
                &cp.id,
                ReviewDecision::Modify,
                ReviewOptions {
                    notes: Some("older".to_string()),
                    modifications: Some(json!({"age": 41})),
                },
            )
            .unwrap();
        assert_eq!(reviewed.status, CheckpointStatus::Modified);
        assert_eq!(reviewed.data, json!({"name": "Elena", "age": 41}));
        assert_eq!(reviewed.reviewer_notes.as_deref(), Some("older"));

        let list = gate
            .submit_for_review(Stage::Shots, json!(["a", "b"]), SubmitOptions::default())
            .await
            .unwrap();
        let replaced = gate
            .review(
                &list.id,
                ReviewDecision::Modify,
                ReviewOptions {
                    notes: None,
                    modifications: Some(json!({"shots": []})),
                },
            )
            .unwrap();
        assert_eq!(replaced.data, json!({"shots": []}));
    }

    #[tokio::test]
    async fn test_modify_requires_modifications() {
        let gate = gate();
        let cp = gate
            .submit_for_review(Stage::Scenes, json!({}), SubmitOptions::default())
            .await
            .unwrap();
        let err = gate
            .review(&cp.id, ReviewDecision::Modify, ReviewOptions::default())
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(
            gate.checkpoint(&cp.id).unwrap().status,
            CheckpointStatus::AwaitingReview
        );
    }

    #[tokio::test]
    async fn test_disabled_gate_auto_approves_and_locks() {
        let gate = ReviewGate::new(ReviewConfig {
            enabled: false,
            ..ReviewConfig::default()
        });
        assert!(!gate.is_stage_required(Stage::StoryBible));
        let cp = gate
            .submit_for_review(Stage::StoryBible, bible_data(), SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(cp.status, CheckpointStatus::Approved);
        assert_eq!(cp.reviewer_notes.as_deref(), Some(AUTO_APPROVED_NOTE));
        assert!(gate.is_story_bible_locked());
    }

    #[tokio::test]
    async fn test_unlock_is_always_honoured() {
        let gate = gate();
        assert!(!gate.unlock_story_bible("nothing locked"));
        gate.lock_story_bible(&bible_data());
        assert!(gate.is_story_bible_locked());
        assert!(gate.unlock_story_bible("fixing a typo"));
        assert!(!gate.is_story_bible_locked());
        assert!(gate.story_bible().is_some());
        assert!(gate.locked_story_bible().is_none());
    }

    #[tokio::test]
    async fn test_wait_for_review_wakes_on_decision() {
        let gate = Arc::new(gate());
        let cp = gate
            .submit_for_review(Stage::Scenes, json!({"scenes": []}), SubmitOptions::default())
            .await
            .unwrap();

        let reviewer = {
            let gate = gate.clone();
            let id = cp.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                gate.review(&id, ReviewDecision::Approve, ReviewOptions::default())
                    .unwrap();
            })
        };

        let done = gate
            .wait_for_review(&cp.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.status, CheckpointStatus::Approved);
        reviewer.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_review_times_out() {
        let gate = gate();
        let cp = gate
            .submit_for_review(Stage::Scenes, json!({}), SubmitOptions::default())
            .await
            .unwrap();
        let err = gate
            .wait_for_review(&cp.id, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { ref id, .. } if *id == cp.id));
    }

    #[tokio::test]
    async fn test_wait_fails_when_checkpoint_disappears() {
        let gate = Arc::new(gate());
        let cp = gate
            .submit_for_review(Stage::Scenes, json!({}), SubmitOptions::default())
            .await
            .unwrap();
        let discarder = {
            let gate = gate.clone();
            let id = cp.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert!(gate.discard_checkpoint(&id));
            })
        };
        let err = gate
            .wait_for_review(&cp.id, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        discarder.await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_review_isolates_failures() {
        let gate = gate();
        let a = gate
            .submit_for_review(Stage::Shots, json!({}), SubmitOptions::default())
            .await
            .unwrap();
        let b = gate
            .submit_for_review(Stage::Shots, json!({}), SubmitOptions::default())
            .await
            .unwrap();
        let ids = vec![a.id.clone(), "ghost".to_string(), b.id.clone()];
        let report = gate.batch_review(&ids, ReviewDecision::Approve, ReviewOptions::default());
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert!(report.outcomes[1].error.as_deref().unwrap().contains("ghost"));
        assert!(gate.pending_reviews().is_empty());
    }

    #[tokio::test]
    async fn test_report_counts_and_latency() {
        let gate = gate();
        assert_eq!(gate.generate_report(), ReviewReport::default());

        let a = gate
            .submit_for_review(Stage::Characters, json!({}), SubmitOptions::default())
            .await
            .unwrap();
        gate.submit_for_review(Stage::Scenes, json!({}), SubmitOptions::default())
            .await
            .unwrap();
        gate.review(&a.id, ReviewDecision::Reject, ReviewOptions::default())
            .unwrap();

        let report = gate.generate_report();
        assert_eq!(report.total, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.awaiting_review, 1);
        assert!(!report.story_bible_locked);
        assert_eq!(gate.checkpoints(Some(Stage::Scenes)).len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_restore_round_trip() {
        let gate = gate();
        gate.submit_for_review(Stage::Characters, json!({"x": 1}), SubmitOptions::default())
            .await
            .unwrap();
        gate.lock_story_bible(&bible_data());
        let snapshot = gate.snapshot();

        let other = ReviewGate::new(ReviewConfig::default());
        other.restore(snapshot.clone());
        assert_eq!(other.snapshot(), snapshot);
        assert!(other.is_story_bible_locked());
    }

    #[test]
    fn test_stage_parsing_and_task_mapping() {
        assert_eq!("scenes".parse::<Stage>().unwrap(), Stage::Scenes);
        assert!("storyboard".parse::<Stage>().is_err());
        assert_eq!(Stage::Shots.task_type(), TaskType::ShotPlanning);
    }
}
