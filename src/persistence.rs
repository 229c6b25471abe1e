//! Persistence collaborator for approved stage output.
//!
//! The orchestrator works without persistence; when a [`PersistenceSink`]
//! is supplied, every accepted stage output and the locked story bible are
//! handed to it. [`JsonFileSink`] writes one pretty-printed JSON file per
//! stage into a directory:
//!
//! | File | Contents |
//! |------|----------|
//! | `<stage>.json` | Accepted output of that stage |
//! | `story_bible.locked.json` | The locked story bible |
//! | `review_state.json` | Checkpoint table snapshot |

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use narrative_forge_core::{Error, Result};

use crate::review::{ReviewSnapshot, Stage, StoryBible};

const STORY_BIBLE_FILE: &str = "story_bible.locked.json";
const REVIEW_STATE_FILE: &str = "review_state.json";

#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn save_stage_output(&self, stage: Stage, data: &Value) -> Result<()>;

    async fn save_story_bible(&self, bible: &StoryBible) -> Result<()>;

    /// Persist the review gate's state. Defaults to a no-op.
    async fn save_review_snapshot(&self, _snapshot: &ReviewSnapshot) -> Result<()> {
        Ok(())
    }
}

/// Writes stage output as JSON files under one directory.
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stage_path(&self, stage: Stage) -> PathBuf {
        self.dir.join(format!("{}.json", stage.as_str()))
    }

    /// Read a review snapshot written by a previous run, if any.
    pub async fn load_review_snapshot(&self) -> Result<Option<ReviewSnapshot>> {
        let path = self.dir.join(REVIEW_STATE_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text).map(Some).map_err(|e| {
                Error::Persistence(format!("invalid review state {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Persistence(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn write_json<T: Serialize + ?Sized>(&self, file: &Path, value: &T) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            Error::Persistence(format!("failed to create {}: {e}", self.dir.display()))
        })?;
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| Error::Persistence(format!("failed to encode {}: {e}", file.display())))?;
        tokio::fs::write(file, text)
            .await
            .map_err(|e| Error::Persistence(format!("failed to write {}: {e}", file.display())))?;
        tracing::debug!(path = %file.display(), "wrote json");
        Ok(())
    }
}

#[async_trait]
impl PersistenceSink for JsonFileSink {
    async fn save_stage_output(&self, stage: Stage, data: &Value) -> Result<()> {
        self.write_json(&self.stage_path(stage), data).await
    }

    async fn save_story_bible(&self, bible: &StoryBible) -> Result<()> {
        self.write_json(&self.dir.join(STORY_BIBLE_FILE), bible).await
    }

    async fn save_review_snapshot(&self, snapshot: &ReviewSnapshot) -> Result<()> {
        self.write_json(&self.dir.join(REVIEW_STATE_FILE), snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_writes_stage_files_into_new_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sink = JsonFileSink::new(tmp.path().join("out"));

        sink.save_stage_output(Stage::Scenes, &json!({"scenes": [1, 2]}))
            .await
            .unwrap();

        let text = std::fs::read_to_string(sink.stage_path(Stage::Scenes)).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"scenes": [1, 2]}));
    }

    #[tokio::test]
    async fn test_review_snapshot_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sink = JsonFileSink::new(tmp.path());
        assert!(sink.load_review_snapshot().await.unwrap().is_none());

        let snapshot = ReviewSnapshot {
            checkpoints: Vec::new(),
            story_bible: Some(StoryBible {
                locked: true,
                tone: "wry".to_string(),
                ..StoryBible::default()
            }),
        };
        sink.save_review_snapshot(&snapshot).await.unwrap();
        assert_eq!(sink.load_review_snapshot().await.unwrap(), Some(snapshot));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_persistence_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join(REVIEW_STATE_FILE), "{not json").unwrap();
        let err = JsonFileSink::new(tmp.path())
            .load_review_snapshot()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
    }
}
