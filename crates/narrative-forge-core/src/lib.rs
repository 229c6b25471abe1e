//! # Narrative Forge Core
//!
//! Pure logic for Narrative Forge: data models, semantic chunking,
//! embedding trait, vector store abstraction, retrieval index, model
//! router and the shared error taxonomy.
//!
//! This crate performs no filesystem or network I/O. Text generation,
//! network embeddings, persistence and review notification are reached
//! through the traits defined here and implemented by the
//! `narrative-forge` application crate.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`chunk`] | Paragraph/sentence chunker with continuity context |
//! | [`embedding`] | [`Embedder`](embedding::Embedder) trait, placeholder embedder, cosine similarity |
//! | [`store`] | [`VectorStore`](store::VectorStore) trait and in-memory backend |
//! | [`retrieval`] | Top-K retrieval under score and token budgets |
//! | [`router`] | Capability- and cost-aware model routing |
//! | [`error`] | [`Error`] and [`Result`] |

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod retrieval;
pub mod router;
pub mod store;

pub use error::{Error, Result, ValidationError};
