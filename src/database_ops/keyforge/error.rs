use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use super::models::RecordSet;

/// Failure reported by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection lost, pool exhausted, I/O failure: nothing reached the tables.
    #[error("storage unreachable: {0}")]
    Unavailable(String),
    /// The backend executed the statement and refused it (constraint violation, bad data).
    #[error("storage rejected statement: {0}")]
    Rejected(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => StoreError::Rejected(db_err.to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// A non-2xx response or a transport failure for one HTTP attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct FetchError {
    /// `None` when no response was received.
    pub status: Option<u16>,
    pub message: String,
}

impl FetchError {
    /// Transport failures, throttling and server errors may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self.status {
            None => true,
            Some(code) => code == 429 || (500..600).contains(&code),
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "http {code}: {}", self.message),
            None => write!(f, "transport: {}", self.message),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("malformed page: {0}")]
    MalformedPage(String),
    /// The stage/merge step in the failure's [`PipelineStage`] names the set.
    #[error("storage rejected the batch: {message}")]
    MergeConflict { set: RecordSet, message: String },
}

impl SyncError {
    /// Map a store failure that happened while staging or merging `set`.
    pub fn from_store(set: RecordSet, err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => SyncError::StorageUnavailable(msg),
            StoreError::Rejected(message) => SyncError::MergeConflict { set, message },
        }
    }

    /// Map a store failure outside any record set (resume lookup, page transaction).
    pub fn storage(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) | StoreError::Rejected(msg) => {
                SyncError::StorageUnavailable(msg)
            }
        }
    }
}

/// Where in the per-page pipeline a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    ResumePoint,
    Fetch,
    Normalize,
    BeginPage,
    Stage(RecordSet),
    Merge(RecordSet),
    CommitPage,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::ResumePoint => f.write_str("resume-point lookup"),
            PipelineStage::Fetch => f.write_str("fetch"),
            PipelineStage::Normalize => f.write_str("normalize"),
            PipelineStage::BeginPage => f.write_str("begin page transaction"),
            PipelineStage::CommitPage => f.write_str("commit page transaction"),
            PipelineStage::Stage(set) => write!(f, "stage {set}"),
            PipelineStage::Merge(set) => write!(f, "merge {set}"),
        }
    }
}

/// Fatal stop of a run. Pages merged before `page` stay durable.
#[derive(Debug, Error)]
pub struct RunFailure {
    pub run_id: Uuid,
    /// `None` when the run failed before choosing a page.
    pub page: Option<u32>,
    pub stage: PipelineStage,
    #[source]
    pub source: SyncError,
    pub pages_merged: u32,
    pub last_merged_page: Option<u32>,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.page {
            Some(page) => write!(f, "page {page}: {} failed: {}", self.stage, self.source)?,
            None => write!(f, "{} failed: {}", self.stage, self.source)?,
        }
        write!(f, " ({} page(s) merged before stopping)", self.pages_merged)
    }
}
