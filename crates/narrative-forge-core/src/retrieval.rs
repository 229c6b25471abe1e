//! Retrieval index: similarity search over chunks under token budgets.
//!
//! The index operates entirely through the [`VectorStore`] and
//! [`Embedder`] traits. The calling application chooses the embedder
//! (placeholder or network-backed) and the store implementation.
//!
//! # Retrieval Algorithm
//!
//! 1. Embed the query.
//! 2. Cosine similarity against every stored document.
//! 3. Keep documents with `score >= min_score`.
//! 4. Sort by score (desc); ties keep insertion order.
//! 5. Truncate to `top_k`.
//! 6. Walk the list accumulating estimated tokens; the first document
//!    that would exceed `max_tokens` and everything after it is dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::estimate_tokens;
use crate::embedding::{cosine_similarity, Embedder};
use crate::error::Result;
use crate::models::{Chunk, DocumentMetadata, IndexedDocument, ScoredDocument};
use crate::store::memory::InMemoryStore;
use crate::store::VectorStore;

pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_MIN_SCORE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: usize = 2000;
pub const DEFAULT_MAX_CONTEXT_LENGTH: usize = 1500;
pub const DEFAULT_SOURCE: &str = "narrative";

const EXCERPT_SEPARATOR: &str = "\n\n---\n\n";

/// Retrieval tuning parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalOptions {
    /// Maximum documents returned.
    pub top_k: usize,
    /// Minimum cosine similarity for a document to qualify.
    pub min_score: f64,
    /// Token budget across all returned documents.
    pub max_tokens: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            min_score: DEFAULT_MIN_SCORE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// Output of a retrieval call.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub query: String,
    pub relevant_chunks: Vec<ScoredDocument>,
    /// Estimated tokens across `relevant_chunks`.
    pub total_tokens: usize,
    pub search_time: Duration,
}

impl RetrievalResult {
    fn empty(query: &str, started: Instant) -> Self {
        Self {
            query: query.to_string(),
            relevant_chunks: Vec::new(),
            total_tokens: 0,
            search_time: started.elapsed(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.relevant_chunks.is_empty()
    }
}

/// Options for [`generate_augmented_prompt`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentOptions {
    /// Character budget for the excerpt block.
    pub max_context_length: usize,
    /// Prefix each excerpt with its source metadata.
    pub include_metadata: bool,
}

impl Default for AugmentOptions {
    fn default() -> Self {
        Self {
            max_context_length: DEFAULT_MAX_CONTEXT_LENGTH,
            include_metadata: false,
        }
    }
}

/// Index statistics.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub document_count: usize,
    pub dimensions: Option<usize>,
    pub embedding_model: String,
    pub total_tokens: usize,
    pub built_at: Option<DateTime<Utc>>,
}

/// Similarity-searchable index over narrative chunks.
///
/// Rebuilding takes `&mut self`, so a rebuild can never interleave with
/// queries issued through the same handle.
pub struct RetrievalIndex<S = InMemoryStore> {
    store: S,
    embedder: Arc<dyn Embedder>,
    source: String,
    built_at: Option<DateTime<Utc>>,
}

impl RetrievalIndex<InMemoryStore> {
    /// Create an index backed by an [`InMemoryStore`].
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self::with_store(InMemoryStore::new(), embedder)
    }
}

impl<S: VectorStore> RetrievalIndex<S> {
    pub fn with_store(store: S, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            store,
            embedder,
            source: DEFAULT_SOURCE.to_string(),
            built_at: None,
        }
    }

    /// Label recorded as `metadata.source` on indexed documents.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    /// Replace the index contents with `chunks`.
    ///
    /// Clears the store, embeds every chunk's content and inserts it.
    /// Returns the number of documents indexed.
    pub async fn build_from_chunks(&mut self, chunks: &[Chunk]) -> Result<usize> {
        self.store.clear().await?;

        for (index, chunk) in chunks.iter().enumerate() {
            let embedding = self.embedder.embed(&chunk.content).await?;
            self.store
                .insert(IndexedDocument {
                    id: chunk.id.clone(),
                    content: chunk.content.clone(),
                    metadata: DocumentMetadata {
                        source: self.source.clone(),
                        chunk_index: index,
                        character_mentions: chunk.metadata.characters.clone(),
                        scene_type: chunk.metadata.scene_hint.clone(),
                        importance: chunk.metadata.importance,
                    },
                    embedding,
                })
                .await?;
        }

        self.built_at = Some(Utc::now());
        tracing::info!(
            documents = chunks.len(),
            model = self.embedder.model_name(),
            source = %self.source,
            "built retrieval index"
        );
        Ok(chunks.len())
    }

    /// Top-K similarity search under score and token budgets.
    ///
    /// An unreachable `min_score` yields an empty result, not an error.
    ///
    /// # Errors
    ///
    /// [`Error::DimensionMismatch`](crate::error::Error::DimensionMismatch)
    /// if the query embedding and a stored embedding differ in length, or
    /// any error from the embedder or store.
    pub async fn retrieve(&self, query: &str, opts: &RetrievalOptions) -> Result<RetrievalResult> {
        let started = Instant::now();
        if query.trim().is_empty() {
            return Ok(RetrievalResult::empty(query, started));
        }

        let docs = self.store.documents().await?;
        if docs.is_empty() {
            return Ok(RetrievalResult::empty(query, started));
        }

        let query_vec = self.embedder.embed(query).await?;
        let mut scored = Vec::new();
        for doc in &docs {
            let score = cosine_similarity(&query_vec, &doc.embedding)? as f64;
            if score >= opts.min_score {
                scored.push(ScoredDocument::from_document(doc, score));
            }
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(opts.top_k);
        let (relevant_chunks, total_tokens) = apply_token_budget(scored, opts.max_tokens);

        let result = RetrievalResult {
            query: query.to_string(),
            relevant_chunks,
            total_tokens,
            search_time: started.elapsed(),
        };
        tracing::debug!(
            query,
            candidates = docs.len(),
            returned = result.relevant_chunks.len(),
            total_tokens,
            "retrieved context"
        );
        Ok(result)
    }

    /// Documents that literally mention `name`, most important first.
    ///
    /// Falls back to [`retrieve`](Self::retrieve) with a synthesized
    /// query when no document mentions the name. Direct matches carry a
    /// score of `1.0`.
    pub async fn retrieve_for_character(
        &self,
        name: &str,
        opts: &RetrievalOptions,
    ) -> Result<RetrievalResult> {
        let started = Instant::now();
        let name = name.trim();
        let docs = self.store.documents().await?;

        let mut matches: Vec<&IndexedDocument> = if name.is_empty() {
            Vec::new()
        } else {
            docs.iter()
                .filter(|d| {
                    d.content.contains(name)
                        || d.metadata.character_mentions.iter().any(|m| m == name)
                })
                .collect()
        };

        if matches.is_empty() {
            tracing::debug!(character = name, "no direct mentions, falling back to similarity");
            let query = format!("{name} character appearance personality dialogue actions");
            return self.retrieve(&query, opts).await;
        }

        matches.sort_by(|a, b| b.metadata.importance.cmp(&a.metadata.importance));
        matches.truncate(opts.top_k);
        let scored = matches
            .into_iter()
            .map(|d| ScoredDocument::from_document(d, 1.0))
            .collect();
        let (relevant_chunks, total_tokens) = apply_token_budget(scored, opts.max_tokens);

        Ok(RetrievalResult {
            query: name.to_string(),
            relevant_chunks,
            total_tokens,
            search_time: started.elapsed(),
        })
    }

    /// Retrieval with a scene-oriented query template.
    pub async fn retrieve_for_scene(
        &self,
        description: &str,
        opts: &RetrievalOptions,
    ) -> Result<RetrievalResult> {
        let query = format!(
            "Scene: {}. Setting, atmosphere, characters present and key events.",
            description.trim()
        );
        self.retrieve(&query, opts).await
    }

    /// The first documents in narrative order, within `opts.max_tokens`.
    ///
    /// Used when similarity search returns nothing, so a prompt still
    /// sees the start of the story. `top_k` and `min_score` do not apply.
    /// Every document carries a score of `0.0`.
    pub async fn opening_context(&self, label: &str, opts: &RetrievalOptions) -> Result<RetrievalResult> {
        let started = Instant::now();
        let docs = self.store.documents().await?;
        let scored = docs
            .iter()
            .map(|d| ScoredDocument::from_document(d, 0.0))
            .collect();
        let (relevant_chunks, total_tokens) = apply_token_budget(scored, opts.max_tokens);
        Ok(RetrievalResult {
            query: label.to_string(),
            relevant_chunks,
            total_tokens,
            search_time: started.elapsed(),
        })
    }

    pub async fn get_stats(&self) -> Result<IndexStats> {
        let docs = self.store.documents().await?;
        Ok(IndexStats {
            document_count: docs.len(),
            dimensions: docs
                .first()
                .map(|d| d.embedding.len())
                .or_else(|| self.embedder.dims()),
            embedding_model: self.embedder.model_name().to_string(),
            total_tokens: docs.iter().map(|d| estimate_tokens(&d.content)).sum(),
            built_at: self.built_at,
        })
    }
}

/// Keep documents in order until the next one would exceed `max_tokens`.
fn apply_token_budget(
    docs: Vec<ScoredDocument>,
    max_tokens: usize,
) -> (Vec<ScoredDocument>, usize) {
    let mut total = 0;
    let mut kept = Vec::with_capacity(docs.len());
    for doc in docs {
        let tokens = estimate_tokens(&doc.content);
        if total + tokens > max_tokens {
            break;
        }
        total += tokens;
        kept.push(doc);
    }
    (kept, total)
}

/// Wrap retrieved excerpts and a question into a grounded prompt.
///
/// Excerpts are added in order until `max_context_length` characters are
/// used; the excerpt that crosses the budget is cut to fit and later ones
/// are dropped. With no excerpts the base prompt is returned unchanged.
pub fn generate_augmented_prompt(
    base_prompt: &str,
    context: &RetrievalResult,
    opts: &AugmentOptions,
) -> String {
    let mut used = 0;
    let mut sections: Vec<String> = Vec::new();

    for (n, doc) in context.relevant_chunks.iter().enumerate() {
        let section = if opts.include_metadata {
            let scene = doc
                .metadata
                .scene_type
                .as_deref()
                .map(|s| format!(" | scene: {s}"))
                .unwrap_or_default();
            format!(
                "[Excerpt {} | source: {} | chunk {} | importance {}{}]\n{}",
                n + 1,
                doc.metadata.source,
                doc.metadata.chunk_index,
                doc.metadata.importance,
                scene,
                doc.content
            )
        } else {
            doc.content.clone()
        };

        let remaining = opts.max_context_length.saturating_sub(used);
        if remaining == 0 {
            break;
        }
        let len = section.chars().count();
        if len > remaining {
            sections.push(section.chars().take(remaining).collect());
            break;
        }
        used += len;
        sections.push(section);
    }

    if sections.is_empty() {
        return base_prompt.to_string();
    }

    format!(
        "Answer strictly from the reference excerpts below. Do not invent facts that the \
         excerpts do not support; if they do not contain the answer, say so.\n\n\
         === Reference excerpts ===\n{}\n=== End of excerpts ===\n\n{}",
        sections.join(EXCERPT_SEPARATOR),
        base_prompt
    )
}
