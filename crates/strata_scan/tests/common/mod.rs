//! Shared helpers for scan pipeline integration tests: an in-memory
//! snapshot over sorted entries, entry builders, and collecting writers.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use strata_collate::Codec;
use strata_scan::{
    encode_secondary_entry, IndexKey, IndexSnapshot, ResponseWriter, Scan, ScanError, ScanStats,
    SecondaryEntry, SliceSnapshot,
};

/// Collate-encode one JSON value.
pub fn enc(v: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    Codec::new().encode_value(v, &mut out).expect("encode");
    out
}

/// Build a secondary entry from a JSON composite key.
pub fn sec_entry(key: &Value, docid: &str, count: u32) -> Vec<u8> {
    let mut out = Vec::new();
    encode_secondary_entry(&enc(key), docid.as_bytes(), count, &mut out).expect("entry");
    out
}

/// Build a secondary entry stored in descending (bit-flipped) form.
pub fn desc_entry(key: &Value, desc: &[bool], docid: &str) -> Vec<u8> {
    let mut entry = sec_entry(key, docid, 1);
    Codec::new()
        .reverse_collate(&mut entry, desc)
        .expect("reverse collate");
    entry
}

/// In-memory snapshot: one slice per partition, entries in storage order.
pub struct MemSnapshot {
    slices: Vec<Arc<dyn SliceSnapshot>>,
}

impl MemSnapshot {
    pub fn single(entries: Vec<Vec<u8>>, primary: bool) -> Arc<Self> {
        Arc::new(Self {
            slices: vec![Arc::new(MemSlice::new(entries, primary))],
        })
    }

    pub fn sliced(slices: Vec<MemSlice>) -> Arc<Self> {
        Arc::new(Self {
            slices: slices
                .into_iter()
                .map(|s| Arc::new(s) as Arc<dyn SliceSnapshot>)
                .collect(),
        })
    }
}

impl IndexSnapshot for MemSnapshot {
    fn slice_snapshots(
        &self,
        _partitions: &[strata_scan::PartitionId],
    ) -> Result<Vec<Arc<dyn SliceSnapshot>>, ScanError> {
        Ok(self.slices.clone())
    }
}

/// One sorted run of entries, filtered by the scan's coarse key bounds the
/// way a storage engine's range seek would.
pub struct MemSlice {
    entries: Vec<Vec<u8>>,
    primary: bool,
}

impl MemSlice {
    pub fn new(mut entries: Vec<Vec<u8>>, primary: bool) -> Self {
        entries.sort_by(|a, b| key_of(a, primary).cmp(key_of(b, primary)));
        Self { entries, primary }
    }
}

fn key_of(entry: &[u8], primary: bool) -> &[u8] {
    if primary {
        entry
    } else {
        SecondaryEntry::new(entry)
            .and_then(|e| e.sec_key())
            .expect("well-formed test entry")
    }
}

fn in_bounds(key: &[u8], scan: &Scan) -> bool {
    if let IndexKey::Encoded(low) = &scan.low {
        let ok = if scan.incl.low_inclusive() {
            key >= low.as_slice()
        } else {
            key > low.as_slice()
        };
        if !ok {
            return false;
        }
    }
    if let IndexKey::Encoded(high) = &scan.high {
        let ok = if scan.incl.high_inclusive() {
            key <= high.as_slice()
        } else {
            key < high.as_slice()
        };
        if !ok {
            return false;
        }
    }
    true
}

impl SliceSnapshot for MemSlice {
    fn iterate(
        &self,
        scan: &Scan,
        cb: &mut dyn FnMut(&[u8]) -> Result<(), ScanError>,
    ) -> Result<(), ScanError> {
        for entry in &self.entries {
            if in_bounds(key_of(entry, self.primary), scan) {
                cb(entry)?;
            }
        }
        Ok(())
    }
}

/// Everything a test wants to observe from the response side.
#[derive(Default)]
pub struct Captured {
    pub rows: Vec<(Option<Vec<u8>>, Vec<u8>)>,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct WriterHandle(Arc<Mutex<Captured>>);

impl WriterHandle {
    pub fn rows(&self) -> Vec<(Option<Vec<u8>>, Vec<u8>)> {
        self.0.lock().expect("captured").rows.clone()
    }

    pub fn docids(&self) -> Vec<String> {
        self.rows()
            .iter()
            .map(|(docid, _)| {
                String::from_utf8_lossy(docid.as_deref().unwrap_or_default()).into_owned()
            })
            .collect()
    }

    pub fn sec_keys(&self) -> Vec<Vec<u8>> {
        self.rows().iter().map(|(_, sk)| sk.clone()).collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.0.lock().expect("captured").errors.clone()
    }
}

struct CollectingWriter {
    captured: Arc<Mutex<Captured>>,
    /// Return `ClientCancel` from `row` after this many rows, when set.
    cancel_after: Option<usize>,
}

impl ResponseWriter for CollectingWriter {
    fn row(&mut self, docid: Option<&[u8]>, sec_key: &[u8]) -> Result<(), ScanError> {
        let mut captured = self.captured.lock().expect("captured");
        if let Some(limit) = self.cancel_after {
            if captured.rows.len() >= limit {
                return Err(ScanError::ClientCancel);
            }
        }
        captured
            .rows
            .push((docid.map(<[u8]>::to_vec), sec_key.to_vec()));
        Ok(())
    }

    fn error(&mut self, err: &ScanError) {
        self.captured
            .lock()
            .expect("captured")
            .errors
            .push(err.to_string());
    }
}

pub fn collecting_writer() -> (Box<dyn ResponseWriter>, WriterHandle) {
    let captured = Arc::new(Mutex::new(Captured::default()));
    (
        Box::new(CollectingWriter {
            captured: Arc::clone(&captured),
            cancel_after: None,
        }),
        WriterHandle(captured),
    )
}

/// Writer that cancels like a disconnecting client after `n` rows.
pub fn cancelling_writer(n: usize) -> (Box<dyn ResponseWriter>, WriterHandle) {
    let captured = Arc::new(Mutex::new(Captured::default()));
    (
        Box::new(CollectingWriter {
            captured: Arc::clone(&captured),
            cancel_after: Some(n),
        }),
        WriterHandle(captured),
    )
}

/// Run a request against a snapshot with default config, returning the
/// pipeline result, the captured output, and the run's stats.
pub async fn run_scan(
    req: strata_scan::ScanRequest,
    snapshot: Arc<dyn IndexSnapshot>,
) -> (Result<(), ScanError>, WriterHandle, Arc<ScanStats>) {
    let (writer, handle) = collecting_writer();
    let mut pipeline =
        strata_scan::ScanPipeline::new(req, writer, snapshot, strata_scan::ScanConfig::default())
            .expect("pipeline");
    let stats = pipeline.stats();
    let result = pipeline.execute().await;
    (result, handle, stats)
}
