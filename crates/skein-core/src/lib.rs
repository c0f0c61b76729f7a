//! Core types for the skein coordination substrate.
//!
//! skein lets many concurrent agents advance a shared backlog without
//! serializing on one another. Truth lives in flat JSON files — one task per
//! `tasks/{id}.json`, one dependency edge per `deps/{from}--{type}--{to}.json`
//! — so a content-addressed version-control layer can merge concurrent edits
//! file-by-file. A local embedded SQL cache (see `skein-storage`) projects
//! those files into fast "ready work" queries, and a daemon (`skein-daemon`)
//! keeps the projection coherent.
//!
//! This crate holds what everything else agrees on:
//!
//! - [`TaskRecord`] / [`DepRecord`] — the on-disk schema and its filename
//!   contracts
//! - [`SkeinConfig`] — `.skein/config.toml` with tuning knobs
//! - [`Event`] / [`EventBus`] — the observer fan-out
//! - [`Error`] — the unified error type
//!
//! # Example
//!
//! ```rust
//! use skein_core::{parse_dep_filename, DepRecord, TaskRecord};
//! use chrono::Utc;
//!
//! let task = TaskRecord {
//!     id: "sk-1".to_string(),
//!     title: "Wire up the parser".to_string(),
//!     description: None,
//!     kind: "feature".to_string(),
//!     status: "open".to_string(),
//!     priority: 1,
//!     assigned_agent: None,
//!     tags: vec![],
//!     created_at: Utc::now(),
//!     updated_at: Utc::now(),
//!     due_at: None,
//!     defer_until: None,
//! };
//! assert!(task.validate().is_ok());
//! assert_eq!(task.filename(), "sk-1.json");
//!
//! let (from, kind, to) = parse_dep_filename("sk-1--blocks--sk-2.json").unwrap();
//! assert_eq!((from.as_str(), kind.as_str(), to.as_str()), ("sk-1", "blocks", "sk-2"));
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod schema;

pub use config::{PoolSettings, SkeinConfig};
pub use error::{Error, Result};
pub use event::{DepAction, Event, EventBus, TaskAction};
pub use schema::{
    parse_dep_filename, task_id_from_filename, DepRecord, TaskRecord, DEP_SEPARATOR,
    MAX_TITLE_LEN,
};
