//! Three-stage scan pipeline: source → decoder → writer.
//!
//! The stages run as cooperating tasks joined by bounded channels, so a slow
//! consumer backpressures the storage walk instead of buffering the scan in
//! memory. The source runs on the blocking pool (storage iteration is
//! synchronous); decoder and writer are async tasks.
//!
//! Termination protocol: an abnormal error travels downstream as a terminal
//! message and the writer delivers exactly one terminal status to the
//! response collaborator. Clean shutdowns (limit reached, supervisor kill)
//! close the channels without a message. Client cancellation is suppressed
//! from the response but still surfaces from [`ScanPipeline::execute`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strata_collate::Codec;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::entry::SecondaryEntry;
use crate::error::{Result, ScanError};
use crate::request::{ScanConfig, ScanRequest};
use crate::source::SourceRunner;
use crate::storage::IndexSnapshot;

/// Response collaborator: receives decoded `(docid, secondary_key)` pairs
/// and at most one terminal error.
pub trait ResponseWriter: Send + 'static {
    fn row(&mut self, docid: Option<&[u8]>, sec_key: &[u8]) -> Result<()>;
    fn error(&mut self, err: &ScanError);
}

/// Source → decoder messages.
pub(crate) enum PipeRow {
    Entry(Vec<u8>),
    Fail(ScanError),
}

/// Decoder → writer messages.
enum DecodedRow {
    Pair {
        sec_key: Vec<u8>,
        docid: Option<Vec<u8>>,
    },
    Fail(ScanError),
}

/// Lock-free counters updated on the scan hot path.
#[derive(Debug, Default)]
pub struct ScanStats {
    rows_scanned: AtomicU64,
    rows_returned: AtomicU64,
    bytes_read: AtomicU64,
    cache_hit_pct: AtomicU64,
    expr_eval_ns: AtomicU64,
}

impl ScanStats {
    pub(crate) fn incr_rows_scanned(&self) {
        self.rows_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_rows_returned(&self) {
        self.rows_returned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn set_cache_hit_pct(&self, pct: u8) {
        self.cache_hit_pct.store(u64::from(pct), Ordering::Relaxed);
    }

    pub(crate) fn add_expr_eval_time(&self, elapsed: Duration) {
        self.expr_eval_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn rows_scanned(&self) -> u64 {
        self.rows_scanned.load(Ordering::Relaxed)
    }

    pub fn rows_returned(&self) -> u64 {
        self.rows_returned.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn cache_hit_ratio(&self) -> u8 {
        self.cache_hit_pct.load(Ordering::Relaxed) as u8
    }

    /// Total time spent inside the expression-evaluation hook.
    pub fn expr_eval_time(&self) -> Duration {
        Duration::from_nanos(self.expr_eval_ns.load(Ordering::Relaxed))
    }
}

/// One scan request's pipeline run.
pub struct ScanPipeline {
    req: Arc<ScanRequest>,
    cfg: ScanConfig,
    snapshot: Arc<dyn IndexSnapshot>,
    writer: Option<Box<dyn ResponseWriter>>,
    stats: Arc<ScanStats>,
    kill: Arc<AtomicBool>,
}

impl ScanPipeline {
    pub fn new(
        req: ScanRequest,
        writer: Box<dyn ResponseWriter>,
        snapshot: Arc<dyn IndexSnapshot>,
        cfg: ScanConfig,
    ) -> Result<Self> {
        req.validate()?;
        Ok(Self {
            req: Arc::new(req),
            cfg,
            snapshot,
            writer: Some(writer),
            stats: Arc::new(ScanStats::default()),
            kill: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Ask the pipeline to shut down cleanly; safe to call while `execute`
    /// runs.
    pub fn cancel(&self) {
        self.kill.store(true, Ordering::Relaxed);
    }

    /// Run the scan to completion. Returns the terminal error the writer
    /// observed, if any; limit-reached and supervisor-kill terminations are
    /// clean and return `Ok`.
    pub async fn execute(&mut self) -> Result<()> {
        let writer = self.writer.take().ok_or_else(|| {
            ScanError::InvalidRequest("scan pipeline already executed".into())
        })?;

        debug!(
            scans = self.req.scans.len(),
            distinct = self.req.distinct,
            group_aggr = self.req.group_aggr.is_some(),
            "starting index scan"
        );

        let (src_tx, src_rx) = mpsc::channel(self.cfg.pipeline_queue_size);
        let (dec_tx, dec_rx) = mpsc::channel(self.cfg.pipeline_queue_size);

        let source = SourceRunner {
            codec: Codec::new(),
            req: Arc::clone(&self.req),
            cfg: self.cfg.clone(),
            stats: Arc::clone(&self.stats),
            kill: Arc::clone(&self.kill),
            snapshot: Arc::clone(&self.snapshot),
            tx: src_tx,
        };
        let source_task = tokio::task::spawn_blocking(move || source.run());
        let decoder_task = tokio::spawn(decode_loop(
            Arc::clone(&self.req),
            Arc::clone(&self.stats),
            src_rx,
            dec_tx,
        ));
        let writer_task = tokio::spawn(write_loop(writer, dec_rx));

        if let Err(err) = source_task.await {
            warn!(error = %err, "scan source task panicked");
        }
        if let Err(err) = decoder_task.await {
            warn!(error = %err, "scan decoder task panicked");
        }
        let terminal = match writer_task.await {
            Ok(terminal) => terminal,
            Err(err) => {
                warn!(error = %err, "scan writer task panicked");
                Some(ScanError::Storage(format!("writer task failed: {err}")))
            }
        };

        debug!(
            rows_scanned = self.stats.rows_scanned(),
            rows_returned = self.stats.rows_returned(),
            bytes_read = self.stats.bytes_read(),
            "index scan finished"
        );

        match terminal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> Arc<ScanStats> {
        Arc::clone(&self.stats)
    }

    pub fn rows_returned(&self) -> u64 {
        self.stats.rows_returned()
    }

    pub fn rows_scanned(&self) -> u64 {
        self.stats.rows_scanned()
    }

    pub fn bytes_read(&self) -> u64 {
        self.stats.bytes_read()
    }

    pub fn cache_hit_ratio(&self) -> u8 {
        self.stats.cache_hit_ratio()
    }
}

/// Decoder stage: split each emitted entry into `(secondary_key, docid)`,
/// or collate-decode group-aggregate rows wholesale, tallying throughput.
async fn decode_loop(
    req: Arc<ScanRequest>,
    stats: Arc<ScanStats>,
    mut rx: mpsc::Receiver<PipeRow>,
    tx: mpsc::Sender<DecodedRow>,
) {
    let codec = Codec::new();
    let mut tmp: Vec<u8> = Vec::new();

    while let Some(item) = rx.recv().await {
        let row = match item {
            PipeRow::Entry(row) => row,
            PipeRow::Fail(err) => {
                let _ = tx.send(DecodedRow::Fail(err)).await;
                return;
            }
        };

        // Worst-case decode expansion of escaped bytes is 3x.
        if row.len() * 3 > tmp.capacity() {
            tmp = Vec::with_capacity(row.len() * 3);
        }
        tmp.clear();

        let decoded = decode_row(&codec, &req, &row, &mut tmp);
        match decoded {
            Ok((sec_key, mut docid)) => {
                stats.add_bytes_read(sec_key.len() + docid.as_ref().map_or(0, Vec::len));
                if !req.is_primary && !req.project_primary_key {
                    docid = None;
                }
                if tx.send(DecodedRow::Pair { sec_key, docid }).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = tx.send(DecodedRow::Fail(err)).await;
                return;
            }
        }
    }
}

fn decode_row(
    codec: &Codec,
    req: &ScanRequest,
    row: &[u8],
    tmp: &mut Vec<u8>,
) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
    if req.group_aggr.is_some() {
        codec.decode(row, tmp)?;
        return Ok((tmp.clone(), None));
    }
    if req.is_primary {
        // The whole entry is the docid; the key position is empty.
        return Ok((Vec::new(), Some(row.to_vec())));
    }
    let entry = SecondaryEntry::new(row)?;
    Ok((
        entry.sec_key()?.to_vec(),
        Some(entry.doc_id()?.to_vec()),
    ))
}

/// Writer stage: deliver decoded pairs to the response collaborator, then
/// exactly one terminal status. Client cancellation is suppressed from the
/// collaborator but reported to the supervisor.
async fn write_loop(
    mut writer: Box<dyn ResponseWriter>,
    mut rx: mpsc::Receiver<DecodedRow>,
) -> Option<ScanError> {
    let mut terminal: Option<ScanError> = None;
    while let Some(item) = rx.recv().await {
        match item {
            DecodedRow::Fail(err) => {
                terminal = Some(err);
                break;
            }
            DecodedRow::Pair { sec_key, docid } => {
                if let Err(err) = writer.row(docid.as_deref(), &sec_key) {
                    terminal = Some(err);
                    break;
                }
            }
        }
    }
    rx.close();

    match &terminal {
        Some(ScanError::ClientCancel) | None => {}
        Some(err) => writer.error(err),
    }
    terminal
}
