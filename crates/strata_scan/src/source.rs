//! Scan source: walks storage callbacks through filtering, dedup, paging,
//! projection and aggregation, emitting finished rows into the pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use strata_collate::Codec;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::aggr::{self, AggrResult, GroupAggrScratch};
use crate::buffer::{sec_key_buf_pool, BufLease};
use crate::cache::EntryCache;
use crate::entry::{same_sec_key, SecondaryEntry};
use crate::error::{Result, ScanError};
use crate::filter::{self, ExplodeScratch};
use crate::pipeline::{PipeRow, ScanStats};
use crate::request::{Scan, ScanConfig, ScanRequest, ScanType, SCAN_ROLLBACK_ERROR_BATCHSIZE};
use crate::storage::{scatter, IndexSnapshot};

pub(crate) struct SourceRunner {
    pub codec: Codec,
    pub req: Arc<ScanRequest>,
    pub cfg: ScanConfig,
    pub stats: Arc<ScanStats>,
    pub kill: Arc<AtomicBool>,
    pub snapshot: Arc<dyn IndexSnapshot>,
    pub tx: mpsc::Sender<PipeRow>,
}

impl SourceRunner {
    /// Blocking stage body. Clean shutdowns (limit, supervisor kill) close
    /// the channel without a message; abnormal errors travel downstream so
    /// the writer can deliver exactly one terminal status.
    pub(crate) fn run(self) {
        let SourceRunner {
            codec,
            req,
            cfg,
            stats,
            kill,
            snapshot,
            tx,
        } = self;

        let snapshots = match snapshot.slice_snapshots(&req.partition_ids) {
            Ok(snapshots) => snapshots,
            Err(err) => {
                warn!(error = %err, "scan source could not open slice snapshots");
                let _ = tx.blocking_send(PipeRow::Fail(err));
                return;
            }
        };

        let mut state = ScanState::new(codec, &req, &stats, &kill, tx.clone());
        if let Some(ga) = &req.group_aggr {
            // Leading-group streams complete one group before the next, so a
            // single open row is enough.
            let cap = if ga.is_leading_group {
                1
            } else {
                cfg.partial_group_buffer_size
            };
            state.aggr_res.set_max_rows(cap);
        }

        let mut outcome: Result<()> = Ok(());
        'scans: for scan in &req.scans {
            let result = scatter(
                &req,
                scan,
                &snapshots,
                &mut |entry| state.handle_entry(scan, entry),
                &cfg,
            );
            if let Err(err) = result {
                outcome = Err(err);
                break 'scans;
            }
        }

        stats.set_cache_hit_pct(state.cache.cache_hit_ratio());

        match outcome {
            Ok(()) => {
                if req.group_aggr.is_some() {
                    if let Err(err) = state.flush_group_aggr() {
                        if !err.is_clean_shutdown() {
                            warn!(error = %err, "group aggregate flush failed");
                            let _ = tx.blocking_send(PipeRow::Fail(err));
                        }
                    }
                }
            }
            Err(err) if err.is_clean_shutdown() => {
                debug!(reason = %err, "scan source stopped");
            }
            Err(err) => {
                warn!(error = %err, "scan source failed");
                let _ = tx.blocking_send(PipeRow::Fail(err));
            }
        }
    }
}

/// Mutable per-run state shared by the per-entry callback and the aggregate
/// flush tail.
struct ScanState<'a> {
    codec: Codec,
    req: &'a ScanRequest,
    stats: &'a ScanStats,
    kill: &'a AtomicBool,
    tx: mpsc::Sender<PipeRow>,
    iter_count: usize,
    curr_offset: u64,
    rows_returned: u64,
    revbuf: BufLease,
    projbuf: BufLease,
    previous_row: BufLease,
    cache: EntryCache,
    explode: ExplodeScratch,
    ga_scratch: GroupAggrScratch,
    aggr_res: AggrResult,
}

impl<'a> ScanState<'a> {
    fn new(
        codec: Codec,
        req: &'a ScanRequest,
        stats: &'a ScanStats,
        kill: &'a AtomicBool,
        tx: mpsc::Sender<PipeRow>,
    ) -> Self {
        let pool = sec_key_buf_pool();
        Self {
            codec,
            req,
            stats,
            kill,
            tx,
            iter_count: 0,
            curr_offset: 0,
            rows_returned: 0,
            revbuf: pool.checkout(),
            projbuf: pool.checkout(),
            previous_row: pool.checkout(),
            cache: EntryCache::new(),
            explode: ExplodeScratch::new(),
            ga_scratch: GroupAggrScratch::default(),
            aggr_res: AggrResult::new(),
        }
    }

    /// Process one raw storage entry. Sentinel errors terminate iteration:
    /// `LimitReached` and `SupervisorKill` cleanly, `IndexRollback` with a
    /// terminal status for the caller.
    fn handle_entry(&mut self, scan: &Scan, raw: &[u8]) -> Result<()> {
        // Polling the rollback flag per batch bounds detection latency
        // without paying an atomic load per row.
        if self.iter_count % SCAN_ROLLBACK_ERROR_BATCHSIZE == 0
            && self.req.has_rollback.load(Ordering::Relaxed)
        {
            return Err(ScanError::IndexRollback);
        }
        self.iter_count += 1;
        if self.kill.load(Ordering::Relaxed) {
            return Err(ScanError::SupervisorKill);
        }
        self.stats.incr_rows_scanned();

        // Storage may return a pointer into its own memory, so descending
        // indexes copy before un-flipping the flagged components.
        let has_desc = self.req.defn.has_descending();
        if has_desc {
            self.revbuf.clear();
            self.revbuf.extend_from_slice(raw);
            self.codec
                .reverse_collate(&mut self.revbuf, &self.req.defn.desc)?;
        }
        let entry: &[u8] = if has_desc { &self.revbuf } else { raw };

        let mut exploded = false;
        if scan.scan_type == ScanType::FilterRange {
            let need_decoded = self
                .req
                .group_aggr
                .as_ref()
                .is_some_and(|ga| ga.need_decode);
            let skip = filter::filter_scan_row2(
                &self.codec,
                self.req,
                scan,
                entry,
                need_decoded,
                &mut self.cache,
                &mut self.explode,
            )?;
            exploded = true;
            if skip {
                return Ok(());
            }
        }

        let mut count = if self.req.is_primary {
            1
        } else {
            SecondaryEntry::new(entry)?.count()?
        };

        if let Some(ga) = &self.req.group_aggr {
            let docid: Option<&[u8]> = if self.req.is_primary {
                Some(entry)
            } else if ga.depends_on_primary_key {
                Some(SecondaryEntry::new(entry)?.doc_id()?)
            } else {
                None
            };
            aggr::compute_group_aggr(
                &self.codec,
                self.req,
                ga,
                entry,
                docid,
                count,
                &mut self.cache,
                &mut self.explode,
                &mut self.ga_scratch,
                &mut self.aggr_res,
                self.stats,
                exploded && !self.req.is_primary,
            )?;
            // The stored multiplier feeds aggregation only; emission below
            // is one row per pull.
            count = 1;
        }

        let mut group_row: Option<Vec<u8>> = None;
        let mut out_entry: &[u8] = entry;
        if let Some(projection) = &self.req.projection {
            if projection.project_sec_keys {
                if self.req.group_aggr.is_some() {
                    match aggr::project_group_aggr(
                        &self.codec,
                        projection,
                        &mut self.aggr_res,
                        self.req.is_primary,
                    )? {
                        Some(row) => group_row = Some(row),
                        // No group row is ready to flush yet.
                        None => return Ok(()),
                    }
                    out_entry = group_row.as_deref().unwrap_or_default();
                } else if !self.req.is_primary {
                    self.projbuf.clear();
                    let cache = exploded.then_some(&self.cache);
                    filter::project_keys(
                        &self.codec,
                        cache,
                        entry,
                        projection,
                        &mut self.projbuf,
                    )?;
                    out_entry = &self.projbuf;
                }
            }
        }

        let check_distinct = self.req.distinct && !self.req.is_primary;
        if check_distinct
            && !self.previous_row.is_empty()
            && same_sec_key(out_entry, &self.previous_row)?
        {
            return Ok(());
        }

        for i in 0..count {
            if self.req.distinct && i > 0 {
                break;
            }
            if self.curr_offset >= self.req.offset {
                self.rows_returned += 1;
                self.stats.incr_rows_returned();
                write_item(&self.tx, out_entry)?;
                if self.req.limit > 0 && self.rows_returned == self.req.limit {
                    return Err(ScanError::LimitReached);
                }
            } else {
                self.curr_offset += 1;
            }
        }

        if check_distinct {
            self.previous_row.clear();
            self.previous_row.extend_from_slice(out_entry);
        }
        Ok(())
    }

    /// After scan exhaustion: flush every buffered group row through the
    /// same offset/limit paging, and emit the aggregate identity row when
    /// nothing at all was returned for a group-less aggregate.
    fn flush_group_aggr(&mut self) -> Result<()> {
        let ga = self
            .req
            .group_aggr
            .as_ref()
            .expect("flush without group aggr");
        let projection = self
            .req
            .projection
            .as_ref()
            .expect("validated: group aggr carries a projection");

        self.aggr_res.mark_all_flush();
        loop {
            let row = aggr::project_group_aggr(
                &self.codec,
                projection,
                &mut self.aggr_res,
                self.req.is_primary,
            )?;
            let Some(row) = row else {
                if self.rows_returned == 0 {
                    if let Some(identity) =
                        aggr::project_empty_result(&self.codec, projection, ga)?
                    {
                        self.rows_returned += 1;
                        self.stats.incr_rows_returned();
                        write_item(&self.tx, &identity)?;
                    }
                }
                return Ok(());
            };

            if self.curr_offset >= self.req.offset {
                self.rows_returned += 1;
                self.stats.incr_rows_returned();
                write_item(&self.tx, &row)?;
                if self.req.limit > 0 && self.rows_returned == self.req.limit {
                    return Ok(());
                }
            } else {
                self.curr_offset += 1;
            }
        }
    }
}

/// Push one finished row downstream; a closed channel means the pipeline is
/// shutting down around us.
fn write_item(tx: &mpsc::Sender<PipeRow>, row: &[u8]) -> Result<()> {
    tx.blocking_send(PipeRow::Entry(row.to_vec()))
        .map_err(|_| ScanError::SupervisorKill)
}
