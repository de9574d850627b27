//! Durable key-value state and task queue.
//!
//! Both contracts are deliberately narrow: the rest of the crate only ever
//! sees `Arc<dyn StateStore>` and `Arc<dyn Queue>`, so deployments can swap
//! the LMDB backing for a networked store without touching the coordination
//! logic.

mod queue;
mod state;

pub use queue::{Lease, LmdbQueue, Queue, QueuedTask};
pub use state::{LmdbStateStore, StateStore};

use std::path::PathBuf;

use bincode::error::{DecodeError, EncodeError};
use thiserror::Error;

/// Errors emitted by the store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Path(#[from] crate::paths::PathError),
    #[error(transparent)]
    Heed(#[from] Box<heed::Error>),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("failed to open store environment at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: Box<heed::Error>,
    },
    #[error("lease {0} is no longer held")]
    LeaseGone(u64),
}

impl From<heed::Error> for StoreError {
    fn from(e: heed::Error) -> Self {
        StoreError::Heed(Box::new(e))
    }
}

pub(crate) fn current_timestamp_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
