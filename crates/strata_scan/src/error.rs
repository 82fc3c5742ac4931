//! Error and sentinel types for the scan pipeline.
//!
//! Several variants are control-flow sentinels rather than failures:
//! `LimitReached` unwinds the source cleanly once `limit` rows are out,
//! `SupervisorKill` is a clean external shutdown, and `ClientCancel` is
//! suppressed by the writer instead of being delivered as a terminal error.

use strata_collate::CollateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    /// Internal sentinel: the row limit was reached and the scan stopped
    /// exactly there. Never surfaced to the response writer.
    #[error("row limit reached")]
    LimitReached,

    /// The scanned snapshot was invalidated by a storage rollback.
    #[error("index rollback detected during scan")]
    IndexRollback,

    /// The pipeline supervisor asked for shutdown; clean, not an error to
    /// the caller.
    #[error("scan terminated by supervisor")]
    SupervisorKill,

    /// The client cancelled the request; the writer suppresses this from the
    /// response channel.
    #[error("client cancelled the scan")]
    ClientCancel,

    /// A filter collection carries more component filters than the index has
    /// key components.
    #[error("more ranges than composite elements in the index")]
    MoreRangesThanComponents,

    #[error("collate codec: {0}")]
    Collate(#[from] CollateError),

    #[error("malformed index entry: {0}")]
    Corrupt(&'static str),

    #[error("invalid scan request: {0}")]
    InvalidRequest(String),

    #[error("expression evaluation failed: {0}")]
    Expr(String),

    #[error("storage: {0}")]
    Storage(String),
}

impl ScanError {
    /// True for the variants that end a scan without being a failure.
    pub fn is_clean_shutdown(&self) -> bool {
        matches!(self, ScanError::LimitReached | ScanError::SupervisorKill)
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
