//! skein-storage — the embedded query cache and file-to-cache bridge.
//!
//! The files under `tasks/` and `deps/` are the truth; this crate projects
//! them into a libSQL database that answers "what work is ready?" and "what
//! blocks this task?" in well under ten milliseconds with 100+ concurrent
//! readers.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                File System                   │
//! │   tasks/{id}.json   deps/{f}--{t}--{to}.json │
//! └───────────────┬──────────────────────────────┘
//!                 │ read / validate
//! ┌───────────────▼──────────────────────────────┐
//! │                 Syncer                       │
//! │   sync_task · sync_dep · full_sync · export  │
//! └───────────────┬──────────────────────────────┘
//!                 │ upsert / delete / refresh
//! ┌───────────────▼──────────────────────────────┐
//! │            Cache (libSQL, WAL)               │
//! │   tasks · deps · blocked_cache               │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use skein_storage::{Cache, PoolConfig, ReadyOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = Cache::open(".skein/cache.db", PoolConfig::default()).await?;
//! cache.init_schema().await?;
//!
//! let ready = cache.get_ready_tasks(ReadyOptions::default()).await?;
//! println!("{} tasks ready", ready.len());
//! # Ok(())
//! # }
//! ```

pub mod db;
pub mod dep_io;
mod fsio;
pub mod pool;
pub mod sync;
pub mod task_io;

pub use db::{Cache, CacheError, CacheStats, ReadyOptions, Result, TaskFilter};
pub use pool::PoolConfig;
pub use sync::{ExportStats, SyncStats, Syncer};

pub use dep_io::{
    delete_dep_file, find_deps_for_task, read_all_dep_files, read_dep_file, write_dep_file,
};
pub use task_io::{delete_task_file, read_all_task_files, read_task_file, write_task_file};
