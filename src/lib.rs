//! # Knowledge Base Curator
//!
//! Turns a translation bureau's internal documents into a curated,
//! versioned knowledge base of rules, Q&A pairs and searchable chunks.
//!
//! AI extraction never writes to the knowledge base directly. Every
//! extracted item lands in a staging area first, a human verifies or
//! rejects it, and only verified items are committed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────┐   ┌──────────┐
//! │ Document │──▶│  Processing  │──▶│ Staging  │──▶│  Commit  │
//! │  upload  │   │ 3 AI phases  │   │ (review) │   │  engine  │
//! └──────────┘   └──────┬───────┘   └──────────┘   └────┬─────┘
//!                       │ events                        ▼
//!                       ▼                        ┌─────────────┐
//!                 SSE / JSON lines               │  Knowledge  │◀── correction
//!                                                │ rules/QA/   │
//!                                                │   chunks    │──▶ answer/search
//!                                                └─────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and staged payloads |
//! | [`errors`] | Error taxonomy and fatal/transient classification |
//! | [`db`], [`migrate`] | SQLite connection and schema |
//! | [`provider`], [`llm`], [`embedding`] | AI provider abstraction |
//! | [`chunk`] | Paragraph-aware text chunking |
//! | [`documents`] | Uploaded documents and their status |
//! | [`staging`] | Staged extractions and verification |
//! | [`extraction`] | Streaming domain and knowledge extraction |
//! | [`processing`] | Three-phase orchestrator with an event stream |
//! | [`domains`] | Domain tree and domain links |
//! | [`knowledge`] | Rules, Q&A pairs, AI questions, change log |
//! | [`chunk_store`] | Persisted chunks with embeddings |
//! | [`commit`] | Moves verified staged items into the knowledge base |
//! | [`correction`] | Direct add/correct path that bypasses staging |
//! | [`retrieval`] | Cited answers and structured search |
//! | [`server`] | HTTP API |
//! | [`commands`] | CLI command implementations |

pub mod chunk;
pub mod chunk_store;
pub mod commands;
pub mod commit;
pub mod config;
pub mod correction;
pub mod db;
pub mod documents;
pub mod domains;
pub mod embedding;
pub mod errors;
pub mod extraction;
pub mod knowledge;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod processing;
pub mod provider;
pub mod retrieval;
pub mod server;
pub mod staging;
