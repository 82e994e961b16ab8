//! c3dl Core - reconciliation and transfer engine for CCC congress media.
//!
//! Compares the relive listing and the release feed of a congress against a
//! local collection, plans the downloads, renames and deletes that bring the
//! collection up to date, and runs them with resumable, size-checked transfers.
//!
//! The remote sources are supplied by the caller through [`RemoteCatalog`];
//! this crate never scrapes or parses feeds itself.
//!
//! # Example
//!
//! ```rust,ignore
//! use c3dl_core::{Engine, HttpSource, SyncConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> c3dl_core::Result<()> {
//!     let engine = Engine::new(Arc::new(MyCatalog), Arc::new(HttpSource::new()?));
//!     let report = engine
//!         .run_cycle("/media/ccc".as_ref(), "39c3", &SyncConfig::default())
//!         .await?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod layout;
pub mod lock;
pub mod matcher;
pub mod models;
pub mod planner;
pub mod title;
pub mod transfer;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use config::{MatchConfig, Quality, SyncConfig};
pub use engine::{
    clean_partial, collection_stats, format_size, ActionOutcome, CollectionStats, CycleReport,
    Engine, OutcomeStatus, RemoteCatalog, SubsetStats,
};
pub use error::{FetchError, Result, SyncError, TransferError};
pub use inventory::{scan, Inventory};
pub use layout::CollectionLayout;
pub use lock::InstanceLock;
pub use models::{FileState, LocalFile, MediaFormat, RemoteItem, Source};
pub use planner::{plan, Action, ActionKind, DownloadJob, Operation, Plan, RemoteLists};
pub use transfer::{apply_local, ByteSource, HttpSource, RemoteBody, TransferExecutor, TransferProgress};
