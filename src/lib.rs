//! # Aidkit
//!
//! A local-first assistant engine with an offline knowledge cache.
//!
//! Aidkit keeps a versioned cache of reference entries in SQLite, retrieves
//! the most relevant entries for each user query under a character budget,
//! folds them into the system prompt of a locally-hosted chat model, and
//! records the conversation with debounced, quota-aware persistence.
//! Everything works offline once the cache is seeded; network sources only
//! ever refresh it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌───────────┐
//! │  Sources  │──▶│   Sync    │──▶│  SQLite   │
//! │ seed/HTTP │   │ versioned │   │  entries  │
//! └──────────┘   └───────────┘   └─────┬─────┘
//!                                      │
//!                ┌─────────────────────┤
//!                ▼                     ▼
//!          ┌───────────┐        ┌───────────┐
//!          │ Retrieval │───────▶│ Assistant │◀──▶ history.json
//!          │  (budget) │        └─────┬─────┘
//!          └───────────┘              ▼
//!                               ┌───────────┐
//!                               │  Engine   │──▶ llama-server
//!                               │  worker   │
//!                               └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`store`] | Knowledge cache storage (SQLite and in-memory) |
//! | [`sync`] | Seeding and source refresh |
//! | [`retrieve`] | Budgeted relevance retrieval |
//! | [`history`] | Conversation history with debounced persistence |
//! | [`engine`] | Inference worker lifecycle and streaming chat |
//! | [`assistant`] | End-to-end ask-and-answer orchestration |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`error`] | Error taxonomy |

pub mod assistant;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod history;
pub mod migrate;
pub mod models;
pub mod retrieve;
pub mod store;
pub mod sync;
