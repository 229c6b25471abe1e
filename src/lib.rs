//! # Narrative Forge
//!
//! Retrieval-grounded story pre-production with a human in the loop.
//!
//! A narrative is chunked and indexed by the core crate
//! (`narrative-forge-core`); this crate wires those services to real
//! providers and runs the four-stage pipeline.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌─────────────┐   ┌──────────────┐
//! │ Narrative │──▶│ Chunk+Index │──▶│   Pipeline   │──▶ JSON files
//! │   text    │   │   (core)    │   │ stage runner │
//! └───────────┘   └─────────────┘   └──────┬───────┘
//!                                          │
//!                       ┌──────────────────┼──────────────┐
//!                       ▼                  ▼              ▼
//!                 ┌───────────┐     ┌────────────┐  ┌──────────┐
//!                 │  Router   │     │ ReviewGate │  │ Reviewer │
//!                 │ (models)  │     │ checkpoints│◀─│ (stdin)  │
//!                 └───────────┘     └────────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`embedding`] | OpenAI and Ollama embedders |
//! | [`llm`] | Chat-completions text generator |
//! | [`review`] | Checkpoints, reviewer decisions, story-bible lock |
//! | [`persistence`] | Optional JSON-file output sink |
//! | [`pipeline`] | Stage orchestration |
//! | [`commands`] | CLI command implementations |

pub mod commands;
pub mod config;
pub mod embedding;
pub mod llm;
pub mod persistence;
pub mod pipeline;
pub mod review;
