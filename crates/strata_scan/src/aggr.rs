//! Streaming group-by/aggregate engine.
//!
//! Group rows accumulate in a bounded buffer (`AggrResult`). With a leading
//! group the input stream is already group-sorted, so a single open row
//! suffices and completed groups flush as soon as the key changes. Otherwise
//! the buffer behaves as a partial-streaming hash group: when full, the
//! oldest open row is stamped for flush and drained by the next caller pull.

use std::collections::HashSet;
use std::time::Instant;

use serde_json::Value;
use strata_collate::{json_cmp, Codec, MIN_BUFFER_SIZE, TERMINATOR, TYPE_MISSING, TYPE_NULL, TYPE_NUMBER};

use crate::cache::EntryCache;
use crate::error::{Result, ScanError};
use crate::expr::EvalEnv;
use crate::filter::{ensure_exploded, ExplodeScratch};
use crate::pipeline::ScanStats;
use crate::request::{AggrFuncType, AggrSpec, GroupAggr, GroupKeySpec, IndexProjection, ScanRequest};

/// Collate encoding of JSON null; the aggregate identity for everything but
/// COUNT, and the Min/Max passthrough sentinel.
pub(crate) const ENCODED_NULL: [u8; 2] = [TYPE_NULL, TERMINATOR];

/// Collate encoding of the number zero; the COUNT/COUNTN identity.
pub(crate) const ENCODED_ZERO: [u8; 3] = [TYPE_NUMBER, b'0', TERMINATOR];

/// One computed group-by discriminator.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum GroupVal {
    /// Encoded bytes of a composite position.
    Raw(Vec<u8>),
    /// Scalar from the expression hook or a precomputed constant.
    Scalar(Value),
}

impl GroupVal {
    fn equals(&self, other: &GroupVal) -> bool {
        match (self, other) {
            (GroupVal::Raw(a), GroupVal::Raw(b)) => a == b,
            (GroupVal::Scalar(a), GroupVal::Scalar(b)) => {
                json_cmp(a, b) == std::cmp::Ordering::Equal
            }
            _ => false,
        }
    }
}

/// One aggregate input, routed by channel: raw encoded bytes for non-SUM
/// stored components, decoded JSON for SUM over stored components,
/// expression values for computed scalars.
#[derive(Clone, Debug)]
pub(crate) enum AggrInput {
    Raw(Vec<u8>),
    Json(Value),
    Obj(Value),
}

impl AggrInput {
    fn is_null_or_missing(&self) -> bool {
        match self {
            AggrInput::Raw(bytes) => {
                bytes.as_slice() == &ENCODED_NULL[..]
                    || bytes.as_slice() == [TYPE_MISSING, TERMINATOR].as_slice()
            }
            AggrInput::Json(v) | AggrInput::Obj(v) => v.is_null(),
        }
    }

    fn is_numeric(&self) -> bool {
        match self {
            AggrInput::Raw(bytes) => bytes.first() == Some(&TYPE_NUMBER),
            AggrInput::Json(v) | AggrInput::Obj(v) => v.is_number(),
        }
    }

    /// Stable byte identity used for DISTINCT tracking.
    fn distinct_key(&self, codec: &Codec) -> Result<Vec<u8>> {
        match self {
            AggrInput::Raw(bytes) => Ok(bytes.clone()),
            AggrInput::Json(v) | AggrInput::Obj(v) => encode_json_value(codec, v),
        }
    }

    fn to_scalar(&self) -> AggrScalar {
        match self {
            AggrInput::Raw(bytes) => AggrScalar::Raw(bytes.clone()),
            AggrInput::Json(v) | AggrInput::Obj(v) => AggrScalar::Val(v.clone()),
        }
    }
}

/// Min/Max running value in whichever channel fed it.
#[derive(Clone, Debug)]
pub(crate) enum AggrScalar {
    Raw(Vec<u8>),
    Val(Value),
}

impl AggrScalar {
    fn cmp(&self, other: &AggrScalar, codec: &Codec) -> Result<std::cmp::Ordering> {
        match (self, other) {
            (AggrScalar::Raw(a), AggrScalar::Raw(b)) => Ok(a.cmp(b)),
            (AggrScalar::Val(a), AggrScalar::Val(b)) => Ok(json_cmp(a, b)),
            // Mixed channels: compare in collate space.
            (a, b) => {
                let a = a.encoded(codec)?;
                let b = b.encoded(codec)?;
                Ok(a.cmp(&b))
            }
        }
    }

    fn encoded(&self, codec: &Codec) -> Result<Vec<u8>> {
        match self {
            AggrScalar::Raw(bytes) => Ok(bytes.clone()),
            AggrScalar::Val(v) => encode_json_value(codec, v),
        }
    }
}

/// One running aggregate accumulator.
#[derive(Debug)]
pub(crate) struct AggrFunc {
    typ: AggrFuncType,
    acc: AggrAcc,
    seen: Option<HashSet<Vec<u8>>>,
}

#[derive(Debug)]
enum AggrAcc {
    Sum { total: f64, all_int: bool },
    Count(u64),
    CountN(u64),
    Min(Option<AggrScalar>),
    Max(Option<AggrScalar>),
}

impl AggrFunc {
    /// Build a zero-state accumulator, rejecting the one channel routing the
    /// request compiler must never produce: SUM over raw encoded bytes.
    pub(crate) fn new(typ: AggrFuncType, input: &AggrInput, distinct: bool) -> Result<Self> {
        if typ == AggrFuncType::Sum && matches!(input, AggrInput::Raw(_)) {
            return Err(ScanError::InvalidRequest(
                "SUM inputs must be routed through the decoded channel".into(),
            ));
        }
        let acc = match typ {
            AggrFuncType::Sum => AggrAcc::Sum {
                total: 0.0,
                all_int: true,
            },
            AggrFuncType::Count => AggrAcc::Count(0),
            AggrFuncType::CountN => AggrAcc::CountN(0),
            AggrFuncType::Min => AggrAcc::Min(None),
            AggrFuncType::Max => AggrAcc::Max(None),
        };
        Ok(Self {
            typ,
            acc,
            seen: distinct.then(HashSet::new),
        })
    }

    pub(crate) fn typ(&self) -> AggrFuncType {
        self.typ
    }

    /// Fold one input into the accumulator.
    pub(crate) fn add(&mut self, input: &AggrInput, codec: &Codec) -> Result<()> {
        if let Some(seen) = &mut self.seen {
            if !seen.insert(input.distinct_key(codec)?) {
                return Ok(());
            }
        }
        match &mut self.acc {
            AggrAcc::Sum { total, all_int } => {
                let v = match input {
                    AggrInput::Json(v) | AggrInput::Obj(v) => v,
                    AggrInput::Raw(_) => {
                        return Err(ScanError::InvalidRequest(
                            "SUM inputs must be routed through the decoded channel".into(),
                        ));
                    }
                };
                if let Value::Number(n) = v {
                    *all_int = *all_int && (n.is_i64() || n.is_u64());
                    *total += n.as_f64().unwrap_or(0.0);
                }
            }
            AggrAcc::Count(n) => {
                if !input.is_null_or_missing() {
                    *n += 1;
                }
            }
            AggrAcc::CountN(n) => {
                if input.is_numeric() {
                    *n += 1;
                }
            }
            AggrAcc::Min(best) => {
                let candidate = input.to_scalar();
                let replace = match best {
                    None => true,
                    Some(current) => candidate.cmp(current, codec)?.is_lt(),
                };
                if replace {
                    *best = Some(candidate);
                }
            }
            AggrAcc::Max(best) => {
                let candidate = input.to_scalar();
                let replace = match best {
                    None => true,
                    Some(current) => candidate.cmp(current, codec)?.is_gt(),
                };
                if replace {
                    *best = Some(candidate);
                }
            }
        }
        Ok(())
    }

    /// Numeric result for SUM/COUNT/COUNTN.
    pub(crate) fn numeric_value(&self) -> Value {
        match &self.acc {
            AggrAcc::Sum { total, all_int } => {
                if *all_int && total.fract() == 0.0 && total.abs() < 9_007_199_254_740_992.0 {
                    Value::from(*total as i64)
                } else {
                    Value::from(*total)
                }
            }
            AggrAcc::Count(n) | AggrAcc::CountN(n) => Value::from(*n),
            _ => Value::Null,
        }
    }

    /// Running scalar for MIN/MAX; `None` when no input arrived.
    pub(crate) fn scalar_value(&self) -> Option<&AggrScalar> {
        match &self.acc {
            AggrAcc::Min(best) | AggrAcc::Max(best) => best.as_ref(),
            _ => None,
        }
    }
}

/// Per-entry computed group keys and aggregate inputs. Retained across
/// entries so cache-valid rows can re-apply the previous computation without
/// rebuilding it.
#[derive(Default)]
pub(crate) struct GroupAggrScratch {
    pub groups: Vec<PendingGroup>,
    pub aggrs: Vec<PendingAggr>,
}

pub(crate) struct PendingGroup {
    pub val: GroupVal,
}

pub(crate) struct PendingAggr {
    pub typ: AggrFuncType,
    pub distinct: bool,
    pub count: usize,
    pub input: AggrInput,
}

/// One in-flight group row.
pub(crate) struct AggrRow {
    pub groups: Vec<GroupVal>,
    pub aggrs: Vec<AggrFunc>,
    pub flush: bool,
}

impl AggrRow {
    fn equal_group(&self, groups: &[PendingGroup]) -> bool {
        self.groups.len() == groups.len()
            && self
                .groups
                .iter()
                .zip(groups.iter())
                .all(|(own, other)| own.equals(&other.val))
    }

    fn add_aggrs(&mut self, aggrs: &[PendingAggr], codec: &Codec) -> Result<()> {
        for (func, pending) in self.aggrs.iter_mut().zip(aggrs.iter()) {
            func.add(&pending.input, codec)?;
            // Collapsed duplicates multiply SUM/COUNT/COUNTN; MIN/MAX are
            // unchanged by repetition.
            let repeats = match pending.typ {
                AggrFuncType::Sum | AggrFuncType::Count | AggrFuncType::CountN => {
                    pending.count.saturating_sub(1)
                }
                AggrFuncType::Min | AggrFuncType::Max => 0,
            };
            for _ in 0..repeats {
                func.add(&pending.input, codec)?;
            }
        }
        Ok(())
    }
}

/// Bounded ordered buffer of in-flight group rows.
pub(crate) struct AggrResult {
    pub rows: Vec<AggrRow>,
    max_rows: usize,
}

impl AggrResult {
    pub(crate) fn new() -> Self {
        Self {
            rows: Vec::new(),
            max_rows: 1,
        }
    }

    pub(crate) fn set_max_rows(&mut self, n: usize) {
        self.max_rows = n.max(1);
    }

    pub(crate) fn mark_all_flush(&mut self) {
        for row in &mut self.rows {
            row.flush = true;
        }
    }

    /// Fold one entry's computed groups/aggregates into the buffer.
    ///
    /// `leading_fast_path` short-circuits the group probe when the stream is
    /// leading-group-sorted and the entry cache proved the key unchanged.
    pub(crate) fn add_new_group(
        &mut self,
        groups: &[PendingGroup],
        aggrs: &[PendingAggr],
        leading_fast_path: bool,
        codec: &Codec,
    ) -> Result<()> {
        if leading_fast_path && self.rows.len() == 1 {
            return self.rows[0].add_aggrs(aggrs, codec);
        }

        for row in &mut self.rows {
            if row.equal_group(groups) {
                return row.add_aggrs(aggrs, codec);
            }
        }

        let mut row = AggrRow {
            groups: groups.iter().map(|g| g.val.clone()).collect(),
            aggrs: aggrs
                .iter()
                .map(|p| AggrFunc::new(p.typ, &p.input, p.distinct))
                .collect::<Result<Vec<_>>>()?,
            flush: false,
        };
        row.add_aggrs(aggrs, codec)?;

        // At capacity the oldest open row is handed to the next caller pull.
        if self.rows.len() >= self.max_rows {
            if let Some(oldest) = self.rows.first_mut() {
                oldest.flush = true;
            }
        }
        self.rows.push(row);
        Ok(())
    }
}

/// Fold the current entry into the aggregate buffer: explode through the
/// cache when needed, compute group keys and aggregate inputs (reusing the
/// previous entry's computation on a cache hit), then insert.
#[allow(clippy::too_many_arguments)]
pub(crate) fn compute_group_aggr(
    codec: &Codec,
    req: &ScanRequest,
    ga: &GroupAggr,
    entry: &[u8],
    docid: Option<&[u8]>,
    count: usize,
    cache: &mut EntryCache,
    explode: &mut ExplodeScratch,
    scratch: &mut GroupAggrScratch,
    aggr_res: &mut AggrResult,
    stats: &ScanStats,
    already_exploded: bool,
) -> Result<()> {
    if !ga.is_primary && ga.need_explode && !already_exploded {
        ensure_exploded(codec, req, entry, ga.need_decode, cache, explode)?;
    }

    let cache_valid = cache.valid();
    if !cache_valid || ga.depends_on_primary_key {
        scratch.groups.clear();
        for spec in &ga.group {
            scratch
                .groups
                .push(compute_group_key(codec, req, ga, spec, entry, docid, cache, stats)?);
        }
        scratch.aggrs.clear();
        for spec in &ga.aggrs {
            scratch
                .aggrs
                .push(compute_aggr_val(codec, req, ga, spec, entry, docid, count, cache, stats)?);
        }
    }

    aggr_res.add_new_group(
        &scratch.groups,
        &scratch.aggrs,
        ga.is_leading_group && cache_valid,
        codec,
    )
}

#[allow(clippy::too_many_arguments)]
fn compute_group_key(
    codec: &Codec,
    req: &ScanRequest,
    ga: &GroupAggr,
    spec: &GroupKeySpec,
    entry: &[u8],
    docid: Option<&[u8]>,
    cache: &mut EntryCache,
    stats: &ScanStats,
) -> Result<PendingGroup> {
    if spec.key_pos >= 0 {
        let raw = if ga.is_primary {
            entry.to_vec()
        } else {
            cache.composite(spec.key_pos as usize)?.to_vec()
        };
        return Ok(PendingGroup {
            val: GroupVal::Raw(raw),
        });
    }
    let scalar = match &spec.expr_value {
        Some(constant) => constant.clone(),
        None => {
            let expr = spec
                .expr
                .as_deref()
                .ok_or_else(|| ScanError::Expr("group key has neither position nor expression".into()))?;
            evaluate_expression(codec, req, ga, expr, docid, cache, stats)?
        }
    };
    Ok(PendingGroup {
        val: GroupVal::Scalar(scalar),
    })
}

#[allow(clippy::too_many_arguments)]
fn compute_aggr_val(
    codec: &Codec,
    req: &ScanRequest,
    ga: &GroupAggr,
    spec: &AggrSpec,
    entry: &[u8],
    docid: Option<&[u8]>,
    count: usize,
    cache: &mut EntryCache,
    stats: &ScanStats,
) -> Result<PendingAggr> {
    let input = if spec.key_pos >= 0 {
        if spec.aggr_func == AggrFuncType::Sum && !ga.is_primary {
            AggrInput::Json(cache.decoded_value(spec.key_pos as usize)?)
        } else if ga.is_primary {
            AggrInput::Raw(entry.to_vec())
        } else {
            AggrInput::Raw(cache.composite(spec.key_pos as usize)?.to_vec())
        }
    } else {
        let scalar = match &spec.expr_value {
            Some(constant) => constant.clone(),
            None => {
                let expr = spec.expr.as_deref().ok_or_else(|| {
                    ScanError::Expr("aggregate has neither position nor expression".into())
                })?;
                evaluate_expression(codec, req, ga, expr, docid, cache, stats)?
            }
        };
        AggrInput::Obj(scalar)
    };
    Ok(PendingAggr {
        typ: spec.aggr_func,
        distinct: spec.distinct,
        count,
        input,
    })
}

/// Call the collaborator's evaluator with indexed columns bound as covers.
fn evaluate_expression(
    _codec: &Codec,
    req: &ScanRequest,
    ga: &GroupAggr,
    expr: &str,
    docid: Option<&[u8]>,
    cache: &mut EntryCache,
    stats: &ScanStats,
) -> Result<Value> {
    let mut env = EvalEnv {
        docid: docid.map(|d| d.to_vec()),
        ..EvalEnv::default()
    };
    let docid_value =
        || Value::String(String::from_utf8_lossy(docid.unwrap_or_default()).into_owned());
    for &ik in &ga.depends_on_index_keys {
        let name = ga
            .index_key_names
            .get(ik)
            .ok_or_else(|| ScanError::Expr(format!("no cover name for index key {ik}")))?;
        let value = if ga.is_primary || ik == req.defn.sec_exprs.len() {
            docid_value()
        } else {
            cache.decoded_value(ik)?
        };
        env.covers.insert(name.clone(), value);
    }

    let started = Instant::now();
    let scalar = ga.evaluator()?.evaluate(expr, &env)?;
    stats.add_expr_eval_time(started.elapsed());
    Ok(scalar)
}

/// Pop the first flushed row and project it into an encoded output array.
/// `Ok(None)` means nothing is ready to emit.
pub(crate) fn project_group_aggr(
    codec: &Codec,
    projection: &IndexProjection,
    aggr_res: &mut AggrResult,
    is_primary: bool,
) -> Result<Option<Vec<u8>>> {
    let Some(at) = aggr_res.rows.iter().position(|row| row.flush) else {
        return Ok(None);
    };
    let row = aggr_res.rows.remove(at);

    let mut parts: Vec<Vec<u8>> = Vec::with_capacity(projection.project_group_keys.len());
    for slot in &projection.project_group_keys {
        if slot.grp_key {
            match &row.groups[slot.pos] {
                GroupVal::Scalar(v) => parts.push(encode_json_value(codec, v)?),
                GroupVal::Raw(bytes) => {
                    if is_primary {
                        // Primary keys are raw docids, not collate values.
                        let s = String::from_utf8_lossy(bytes).into_owned();
                        parts.push(encode_json_value(codec, &Value::String(s))?);
                    } else {
                        parts.push(bytes.clone());
                    }
                }
            }
        } else {
            let func = &row.aggrs[slot.pos];
            match func.typ() {
                AggrFuncType::Sum | AggrFuncType::Count | AggrFuncType::CountN => {
                    parts.push(encode_json_value(codec, &func.numeric_value())?);
                }
                AggrFuncType::Min | AggrFuncType::Max => match func.scalar_value() {
                    None => parts.push(ENCODED_NULL.to_vec()),
                    Some(AggrScalar::Val(v)) => parts.push(encode_json_value(codec, v)?),
                    Some(AggrScalar::Raw(bytes)) => {
                        if is_primary && bytes.as_slice() != &ENCODED_NULL[..] {
                            let s = String::from_utf8_lossy(bytes).into_owned();
                            parts.push(encode_json_value(codec, &Value::String(s))?);
                        } else {
                            parts.push(bytes.clone());
                        }
                    }
                },
            }
        }
    }

    let part_refs: Vec<&[u8]> = parts.iter().map(|p| p.as_slice()).collect();
    let mut out = Vec::new();
    codec.join_array(&part_refs, &mut out)?;
    Ok(Some(out))
}

/// Aggregate identity row for a scan that matched nothing: with no group-by
/// columns COUNT/COUNTN report encoded zero and every other aggregate
/// encoded null; with group-by columns nothing is emitted at all.
pub(crate) fn project_empty_result(
    codec: &Codec,
    projection: &IndexProjection,
    ga: &GroupAggr,
) -> Result<Option<Vec<u8>>> {
    if !ga.group.is_empty() {
        return Ok(None);
    }

    let identities: Vec<&[u8]> = ga
        .aggrs
        .iter()
        .map(|spec| match spec.aggr_func {
            AggrFuncType::Count | AggrFuncType::CountN => &ENCODED_ZERO[..],
            _ => &ENCODED_NULL[..],
        })
        .collect();

    let parts: Vec<&[u8]> = projection
        .project_group_keys
        .iter()
        .map(|slot| identities[slot.pos])
        .collect();

    let mut out = Vec::new();
    codec.join_array(&parts, &mut out)?;
    Ok(Some(out))
}

/// JSON-marshal then collate-encode, the final-value path for computed
/// aggregates and expression group keys.
pub(crate) fn encode_json_value(codec: &Codec, value: &Value) -> Result<Vec<u8>> {
    let text = serde_json::to_vec(value)
        .map_err(|e| ScanError::Expr(format!("aggregate value marshal: {e}")))?;
    let mut out = Vec::with_capacity(3 * text.len() + MIN_BUFFER_SIZE);
    codec.encode_value(value, &mut out)?;
    Ok(out)
}
