//! Secondary-index scan pipeline.
//!
//! Serves range-scan requests against persisted index snapshots: composite
//! key filtering, DISTINCT dedup, offset/limit paging, projection and
//! streaming group-by/aggregate computation, staged as a
//! source → decoder → writer pipeline with backpressure and cooperative
//! cancellation.
//!
//! The storage engine and the response writer are collaborators behind
//! traits ([`IndexSnapshot`], [`ResponseWriter`]); expression evaluation for
//! group keys and aggregates is an opaque [`ExprEvaluator`] hook.

mod aggr;
mod buffer;
mod cache;
mod entry;
mod error;
mod expr;
mod filter;
mod pipeline;
mod request;
mod source;
mod storage;

pub use buffer::{sec_key_buf_pool, BufLease, BufPool};
pub use cache::EntryCache;
pub use entry::{encode_secondary_entry, same_sec_key, PrimaryEntry, SecondaryEntry};
pub use error::{Result, ScanError};
pub use expr::{EvalEnv, ExprEvaluator, NoopEvaluator};
pub use filter::{apply_filter, filter_scan_row, project_leading_key};
pub use pipeline::{ResponseWriter, ScanPipeline, ScanStats};
pub use request::{
    AggrFuncType, AggrSpec, CompositeElementFilter, FilterCollection, GroupAggr, GroupKeySpec,
    IndexDefn, IndexKey, IndexProjection, Inclusion, PartitionId, ProjGroup, Scan, ScanConfig,
    ScanRequest, ScanType, SCAN_ROLLBACK_ERROR_BATCHSIZE,
};
pub use storage::{scatter, IndexSnapshot, SliceSnapshot};
