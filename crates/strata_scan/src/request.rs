//! Scan request model: ranges, filters, projection, group/aggregate specs
//! and the runtime configuration the pipeline consumes.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, ScanError};
use crate::expr::ExprEvaluator;

/// Rollback poll granularity: the source re-checks the request's rollback
/// flag every this many storage callbacks. Callback-count based by design;
/// wall-time polling would change cancellation semantics on sparse scans.
pub const SCAN_ROLLBACK_ERROR_BATCHSIZE: usize = 1000;

pub type PartitionId = u32;

/// Bound inclusion for one range: `Neither (>, <)`, `Low (>=, <)`,
/// `High (>, <=)`, `Both (>=, <=)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inclusion {
    Neither,
    Low,
    High,
    Both,
}

impl Inclusion {
    pub fn low_inclusive(self) -> bool {
        matches!(self, Inclusion::Low | Inclusion::Both)
    }

    pub fn high_inclusive(self) -> bool {
        matches!(self, Inclusion::High | Inclusion::Both)
    }
}

/// One range endpoint: an encoded collate value, or the unbounded sentinels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexKey {
    /// Below every key; a low bound of `Min` disables the low check.
    Min,
    /// Above every key; a high bound of `Max` disables the high check.
    Max,
    Encoded(Vec<u8>),
}

impl IndexKey {
    pub fn encoded(&self) -> Option<&[u8]> {
        match self {
            IndexKey::Encoded(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Per-component bounds inside a composite-key filter.
#[derive(Clone, Debug)]
pub struct CompositeElementFilter {
    pub low: IndexKey,
    pub high: IndexKey,
    pub inclusion: Inclusion,
}

/// One conjunction of component filters. A row passes a collection when
/// every component satisfies its bounds; collections combine as a
/// disjunction.
#[derive(Clone, Debug, Default)]
pub struct FilterCollection {
    pub composite_filters: Vec<CompositeElementFilter>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanType {
    /// Whole-range scan; no composite filtering.
    FullRange,
    /// Exact-key lookup resolved by storage; no composite filtering.
    PointRange,
    /// Range scan with per-component composite filtering in the source.
    FilterRange,
}

/// One range dimension of a request.
#[derive(Clone, Debug)]
pub struct Scan {
    pub scan_type: ScanType,
    /// Coarse whole-key bounds storage seeks with.
    pub low: IndexKey,
    pub high: IndexKey,
    pub incl: Inclusion,
    /// Composite filtering applied by the source for `FilterRange`.
    pub filters: Vec<FilterCollection>,
}

impl Scan {
    pub fn full_range() -> Self {
        Self {
            scan_type: ScanType::FullRange,
            low: IndexKey::Min,
            high: IndexKey::Max,
            incl: Inclusion::Both,
            filters: Vec::new(),
        }
    }
}

/// Projection slot for group/aggregate output: position into the row's
/// groups (`grp_key`) or aggregates.
#[derive(Clone, Copy, Debug)]
pub struct ProjGroup {
    pub pos: usize,
    pub grp_key: bool,
}

/// Which parts of each entry the caller wants back.
#[derive(Clone, Debug, Default)]
pub struct IndexProjection {
    /// False means entries pass through unprojected.
    pub project_sec_keys: bool,
    /// Keep flag per secondary-key component, in declaration order.
    pub projection_keys: Vec<bool>,
    /// True when every component is suppressed; only the docid tail remains.
    pub entry_keys_empty: bool,
    /// Output layout for group/aggregate rows.
    pub project_group_keys: Vec<ProjGroup>,
}

/// Aggregate function selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggrFuncType {
    Sum,
    Count,
    CountN,
    Min,
    Max,
}

/// One group-by column: a composite position (`key_pos >= 0`), a precomputed
/// constant, or an expression for the evaluator hook.
#[derive(Clone, Debug)]
pub struct GroupKeySpec {
    pub entry_key_id: i32,
    pub key_pos: i32,
    pub expr: Option<String>,
    pub expr_value: Option<Value>,
}

/// One aggregate: function plus the same input addressing as group keys.
#[derive(Clone, Debug)]
pub struct AggrSpec {
    pub aggr_func: AggrFuncType,
    pub entry_key_id: i32,
    pub key_pos: i32,
    pub expr: Option<String>,
    pub expr_value: Option<Value>,
    pub distinct: bool,
}

/// Group-by/aggregate section of a request.
#[derive(Clone)]
pub struct GroupAggr {
    pub group: Vec<GroupKeySpec>,
    pub aggrs: Vec<AggrSpec>,
    /// Index positions expressions depend on; position `sec_exprs.len()`
    /// addresses the document id.
    pub depends_on_index_keys: Vec<usize>,
    /// Cover-variable names, indexed like `depends_on_index_keys`.
    pub index_key_names: Vec<String>,
    pub depends_on_primary_key: bool,
    /// Group columns form a prefix of the index key, so the stream is
    /// already group-sorted and one open row suffices.
    pub is_leading_group: bool,
    pub is_primary: bool,
    /// Some input needs decoded JSON (SUM over a stored component, or any
    /// expression).
    pub need_decode: bool,
    /// Some input addresses a composite position.
    pub need_explode: bool,
    pub evaluator: Option<Arc<dyn ExprEvaluator>>,
}

impl GroupAggr {
    pub fn evaluator(&self) -> Result<&dyn ExprEvaluator> {
        self.evaluator
            .as_deref()
            .ok_or_else(|| ScanError::Expr("request carries expressions but no evaluator".into()))
    }
}

impl std::fmt::Debug for GroupAggr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupAggr")
            .field("group", &self.group)
            .field("aggrs", &self.aggrs)
            .field("is_leading_group", &self.is_leading_group)
            .field("is_primary", &self.is_primary)
            .field("need_decode", &self.need_decode)
            .field("need_explode", &self.need_explode)
            .finish_non_exhaustive()
    }
}

/// Index definition fields the scan consumes.
#[derive(Clone, Debug, Default)]
pub struct IndexDefn {
    /// Declared secondary expressions; fixes the composite arity.
    pub sec_exprs: Vec<String>,
    /// Descending flag per composite position.
    pub desc: Vec<bool>,
    pub is_primary: bool,
}

impl IndexDefn {
    pub fn has_descending(&self) -> bool {
        self.desc.iter().any(|&d| d)
    }
}

/// One client scan request; spans the whole pipeline run.
pub struct ScanRequest {
    pub defn: IndexDefn,
    pub partition_ids: Vec<PartitionId>,
    pub scans: Vec<Scan>,
    pub offset: u64,
    /// Zero means unlimited.
    pub limit: u64,
    pub distinct: bool,
    pub is_primary: bool,
    /// False nulls the docid on secondary rows before delivery.
    pub project_primary_key: bool,
    pub projection: Option<IndexProjection>,
    pub group_aggr: Option<GroupAggr>,
    /// Set by the storage layer when the scanned snapshot rolls back; polled
    /// every `SCAN_ROLLBACK_ERROR_BATCHSIZE` callbacks.
    pub has_rollback: Arc<AtomicBool>,
}

impl ScanRequest {
    pub fn new(defn: IndexDefn, scans: Vec<Scan>) -> Self {
        let is_primary = defn.is_primary;
        Self {
            defn,
            partition_ids: vec![0],
            scans,
            offset: 0,
            limit: 0,
            distinct: false,
            is_primary,
            project_primary_key: true,
            projection: None,
            group_aggr: None,
            has_rollback: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Structural checks the pipeline relies on. Runs once at pipeline
    /// construction so per-entry code can index without re-validating.
    pub fn validate(&self) -> Result<()> {
        if let Some(ga) = &self.group_aggr {
            let proj = self.projection.as_ref().ok_or_else(|| {
                ScanError::InvalidRequest("group/aggregate requests require a projection".into())
            })?;
            if proj.project_group_keys.is_empty() {
                return Err(ScanError::InvalidRequest(
                    "group/aggregate projection has no output slots".into(),
                ));
            }
            for slot in &proj.project_group_keys {
                let bound = if slot.grp_key {
                    ga.group.len()
                } else {
                    ga.aggrs.len()
                };
                if slot.pos >= bound {
                    return Err(ScanError::InvalidRequest(format!(
                        "projection slot {} out of bounds",
                        slot.pos
                    )));
                }
            }
            let arity = self.defn.sec_exprs.len() as i32;
            for pos in ga
                .group
                .iter()
                .map(|g| g.key_pos)
                .chain(ga.aggrs.iter().map(|a| a.key_pos))
            {
                if pos >= arity && !(ga.is_primary && pos == 0) {
                    return Err(ScanError::InvalidRequest(format!(
                        "group/aggregate key position {pos} exceeds index arity {arity}"
                    )));
                }
            }
        }
        if let Some(proj) = &self.projection {
            if proj.project_sec_keys
                && !proj.entry_keys_empty
                && self.group_aggr.is_none()
                && !self.is_primary
                && proj.projection_keys.len() != self.defn.sec_exprs.len()
            {
                return Err(ScanError::InvalidRequest(
                    "projection key flags do not match index arity".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Runtime options the pipeline consumes; deserializable from the embedding
/// service's configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// `AggrResult` row cap for non-leading-group aggregation.
    pub partial_group_buffer_size: usize,
    /// Capacity of each inter-stage channel.
    pub pipeline_queue_size: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            partial_group_buffer_size: 64,
            pipeline_queue_size: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_apply_to_missing_fields() {
        let cfg: ScanConfig = serde_json::from_str(r#"{"pipeline_queue_size": 8}"#).expect("cfg");
        assert_eq!(cfg.pipeline_queue_size, 8);
        assert_eq!(
            cfg.partial_group_buffer_size,
            ScanConfig::default().partial_group_buffer_size
        );
    }

    #[test]
    fn group_aggr_without_projection_is_rejected() {
        let defn = IndexDefn {
            sec_exprs: vec!["`dept`".into()],
            desc: vec![false],
            is_primary: false,
        };
        let mut req = ScanRequest::new(defn, vec![Scan::full_range()]);
        req.group_aggr = Some(GroupAggr {
            group: Vec::new(),
            aggrs: Vec::new(),
            depends_on_index_keys: Vec::new(),
            index_key_names: Vec::new(),
            depends_on_primary_key: false,
            is_leading_group: false,
            is_primary: false,
            need_decode: false,
            need_explode: false,
            evaluator: None,
        });
        assert!(matches!(
            req.validate(),
            Err(ScanError::InvalidRequest(_))
        ));
    }

    #[test]
    fn mismatched_projection_arity_is_rejected() {
        let defn = IndexDefn {
            sec_exprs: vec!["`a`".into(), "`b`".into()],
            desc: vec![false, false],
            is_primary: false,
        };
        let mut req = ScanRequest::new(defn, vec![Scan::full_range()]);
        req.projection = Some(IndexProjection {
            project_sec_keys: true,
            projection_keys: vec![true],
            entry_keys_empty: false,
            project_group_keys: Vec::new(),
        });
        assert!(req.validate().is_err());
    }

    #[test]
    fn descending_flags_detected() {
        let defn = IndexDefn {
            sec_exprs: vec!["`a`".into(), "`b`".into()],
            desc: vec![false, true],
            is_primary: false,
        };
        assert!(defn.has_descending());
    }
}
