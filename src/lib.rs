//! # Pollination Station
//!
//! Matches the needs DAOs post with other DAOs that could fulfill them.
//! Descriptions are embedded, compared by cosine similarity, and every
//! candidate above the threshold becomes a "pollen" row with an
//! LLM-written collaboration rationale.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────────┐   ┌──────────┐
//! │  HTTP / CLI  │──▶│ PollinationService │──▶│  Store   │
//! │ server, main │   │  embed + persist   │   │  SQLite  │
//! └──────────────┘   └─────────┬──────────┘   └────▲─────┘
//!                              ▼                   │
//!                    ┌────────────────────┐        │
//!                    │   MatchingEngine   │────────┘
//!                    │ search + rationale │  batch upsert
//!                    └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Error kinds and HTTP status mapping |
//! | [`models`] | DAOs, needs, pollen, and inputs |
//! | [`store`] | Storage trait with SQLite and in-memory backends |
//! | [`embedding`] | Embedding provider abstraction and vector helpers |
//! | [`rationale`] | Collaboration rationale generation |
//! | [`similarity`] | Candidate discovery for a need |
//! | [`matching`] | The pollen matching engine |
//! | [`service`] | DAO and need operations |
//! | [`server`] | HTTP action handlers |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`openai`] | Shared HTTP client for OpenAI-compatible APIs |

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod matching;
pub mod migrate;
pub mod models;
pub mod openai;
pub mod rationale;
pub mod server;
pub mod service;
pub mod similarity;
pub mod store;
