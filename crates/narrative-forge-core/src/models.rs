//! Core data models used throughout Narrative Forge.
//!
//! These types represent the chunks and indexed documents that flow
//! from the chunker into the retrieval index.

use serde::{Deserialize, Serialize};

/// Kind of structural marker found inside a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryKind {
    Chapter,
}

/// A structural marker (e.g. a chapter heading) that fell within a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boundary {
    #[serde(rename = "type")]
    pub kind: BoundaryKind,
    /// Character offset of the marker inside the chunk's `content`.
    pub position: usize,
    /// Heading text without its brackets.
    pub title: String,
}

/// Coarse classification of a chunk's prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    #[default]
    Description,
    Dialogue,
    Action,
}

/// Metadata extracted from a chunk's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub characters: Vec<String>,
    pub scene_hint: Option<String>,
    /// Narrative importance in `0..=10`.
    pub importance: u8,
    pub word_count: usize,
    pub chunk_type: ChunkType,
}

impl Default for ChunkMetadata {
    fn default() -> Self {
        Self {
            characters: Vec::new(),
            scene_hint: None,
            importance: 5,
            word_count: 0,
            chunk_type: ChunkType::Description,
        }
    }
}

/// A semantically bounded slice of source text.
///
/// Chunks are immutable once produced by the chunker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    /// Tail excerpt of the previous chunk; empty only for the first chunk.
    pub prev_context: String,
    pub boundaries: Vec<Boundary>,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Number of characters (not bytes) in `content`.
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }

    /// True if a chapter heading fell within this chunk.
    pub fn has_chapter_boundary(&self) -> bool {
        self.boundaries
            .iter()
            .any(|b| b.kind == BoundaryKind::Chapter)
    }
}

/// Metadata stored alongside an indexed chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub source: String,
    pub chunk_index: usize,
    pub character_mentions: Vec<String>,
    pub scene_type: Option<String>,
    pub importance: u8,
}

/// A chunk as held by the vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub id: String,
    pub content: String,
    pub metadata: DocumentMetadata,
    pub embedding: Vec<f32>,
}

/// An indexed document paired with its similarity to a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub id: String,
    pub content: String,
    pub metadata: DocumentMetadata,
    pub score: f64,
}

impl ScoredDocument {
    pub fn from_document(doc: &IndexedDocument, score: f64) -> Self {
        Self {
            id: doc.id.clone(),
            content: doc.content.clone(),
            metadata: doc.metadata.clone(),
            score,
        }
    }
}
