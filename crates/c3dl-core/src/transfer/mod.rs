//! Transfer execution.
//!
//! - [`TransferExecutor`]: resumable downloads with size verification and retry
//! - [`ByteSource`] / [`HttpSource`]: where the bytes come from
//! - [`apply_local`]: idempotent rename and delete

mod executor;
mod progress;
pub mod retry;
mod source;

pub use executor::TransferExecutor;
pub use progress::TransferProgress;
pub use retry::{retry_async, RetryConfig, RetryStats};
pub use source::{ByteSource, HttpSource, RemoteBody};

use crate::error::TransferError;
use crate::planner::Operation;
use std::io::ErrorKind;
use tracing::debug;

/// Apply a local [`Operation::Rename`] or [`Operation::Delete`].
///
/// Both are idempotent so a cycle interrupted halfway can simply be rerun:
/// renaming onto an existing target overwrites it, renaming a missing source
/// whose target exists succeeds, deleting a missing file succeeds.
pub async fn apply_local(operation: &Operation) -> Result<(), TransferError> {
    match operation {
        Operation::Rename { from, to } => match tokio::fs::rename(from, to).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if tokio::fs::try_exists(to).await.unwrap_or(false) {
                    debug!("{} already renamed to {}", from.display(), to.display());
                    Ok(())
                } else {
                    Err(TransferError::io(e, from))
                }
            }
            Err(e) => Err(TransferError::io(e, from)),
        },
        Operation::Delete { path } => match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} already gone", path.display());
                Ok(())
            }
            Err(e) => Err(TransferError::io(e, path)),
        },
        Operation::Skip { .. } => Ok(()),
        Operation::Download(job) => Err(TransferError::io(
            std::io::Error::new(
                ErrorKind::InvalidInput,
                "downloads are run by TransferExecutor::execute",
            ),
            &job.destination,
        )),
    }
}
