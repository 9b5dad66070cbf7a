//! # tailscribe-core
//!
//! Core library for tailscribe - incremental ingestion of Claude Code
//! JSONL transcripts into a chunked conversation model.
//!
//! This library provides:
//! - A byte-offset resumable stream parser and record classifier
//! - Tool call/result pairing and nested subagent attribution
//! - Per-chunk context window attribution across compaction phases
//! - Chunk building and a windowed, diffing conversation view
//! - Per-session orchestration with liveness tracking
//! - An SQLite offset cache, configuration and logging
//!
//! ## Architecture
//!
//! ```text
//! change event ─► Orchestrator ─► stream ─► classify ─► linker/subagents ─► chunks
//!                      │                                                      │
//!                      └────────────── ConversationView::merge ◄──────────────┘
//!                                              │
//!                                  current_window / subscribe
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tailscribe_core::session::{LocalFileSource, Orchestrator, OrchestratorConfig};
//! use tailscribe_core::{Config, SessionId};
//!
//! let config = Config::load().expect("failed to load config");
//! let source = Arc::new(LocalFileSource::new());
//! source.register(SessionId::new("abc"), "/tmp/abc.jsonl");
//!
//! let orch = Orchestrator::new(source, OrchestratorConfig::from_config(&config));
//! orch.open_session(SessionId::new("abc")).expect("failed to open session");
//! let window = orch.current_window(&SessionId::new("abc")).unwrap();
//! println!("{} of {} chunks", window.chunks.len(), window.total);
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::OffsetCache;
pub use error::{Error, Result};
pub use ingest::{load_file, SessionParseState};
pub use session::{ChangeOutcome, Orchestrator, OrchestratorConfig, SessionEvent};
pub use types::*;
pub use view::{ConversationView, MergeDiff, Window};

// Public modules
pub mod config;
pub mod content;
pub mod context;
pub mod db;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod pricing;
pub mod session;
pub mod types;
pub mod view;
