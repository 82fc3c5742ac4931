//! Single-slot memoization of the last exploded entry.
//!
//! Filtering, aggregation and projection all want the exploded form of the
//! current entry; runs of equal secondary keys (array indexes, collapsed
//! duplicates) make re-exploding wasteful. The cache deep-copies on update,
//! so its spans stay valid when the source's transient buffers grow or move.

use serde_json::Value;

use crate::buffer::{sec_key_buf_pool, BufLease};
use crate::entry::same_sec_key;
use crate::error::{Result, ScanError};

pub struct EntryCache {
    entry: Option<BufLease>,
    compbuf: Option<BufLease>,
    decbuf: Option<BufLease>,
    comp_spans: Vec<(usize, usize)>,
    dec_spans: Vec<(usize, usize)>,
    decoded_values: Vec<Option<Value>>,
    valid: bool,
    hit: u64,
    miss: u64,
}

impl Default for EntryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryCache {
    pub fn new() -> Self {
        Self {
            entry: None,
            compbuf: None,
            decbuf: None,
            comp_spans: Vec::new(),
            dec_spans: Vec::new(),
            decoded_values: Vec::new(),
            valid: false,
            hit: 0,
            miss: 0,
        }
    }

    /// Lazily borrow pooled backing buffers. Called once per pipeline run on
    /// first use; primary-index scans never call it.
    pub fn init(&mut self, need_decode: bool) {
        let pool = sec_key_buf_pool();
        self.entry = Some(pool.checkout());
        self.compbuf = Some(pool.checkout());
        if need_decode {
            self.decbuf = Some(pool.checkout());
        }
    }

    pub fn exists(&self) -> bool {
        self.compbuf.is_some()
    }

    /// True iff the cached entry's secondary-key prefix byte-compares equal
    /// to `other`'s.
    pub fn equals_entry(&self, other: &[u8]) -> bool {
        match &self.entry {
            Some(entry) if !entry.is_empty() => same_sec_key(entry, other).unwrap_or(false),
            _ => false,
        }
    }

    /// Copy `entry` and its exploded spans into the cache's own backing
    /// store, detaching them from the caller's transient buffers.
    ///
    /// `comp_spans` are offsets into `entry`; `decoded` pairs a decode buffer
    /// with offsets into it.
    pub fn update(
        &mut self,
        entry: &[u8],
        comp_spans: &[(usize, usize)],
        decoded: Option<(&[u8], &[(usize, usize)])>,
    ) {
        let own = self.entry.as_mut().expect("cache not initialized");
        own.clear();
        own.extend_from_slice(entry);

        let compbuf = self.compbuf.as_mut().expect("cache not initialized");
        compbuf.clear();
        self.comp_spans.clear();
        for &(start, end) in comp_spans {
            let at = compbuf.len();
            compbuf.extend_from_slice(&entry[start..end]);
            self.comp_spans.push((at, compbuf.len()));
        }

        self.dec_spans.clear();
        if let (Some(decbuf), Some((src, spans))) = (self.decbuf.as_mut(), decoded) {
            decbuf.clear();
            for &(start, end) in spans {
                let at = decbuf.len();
                decbuf.extend_from_slice(&src[start..end]);
                self.dec_spans.push((at, decbuf.len()));
            }
        }

        self.decoded_values.clear();
        self.decoded_values.resize(comp_spans.len(), None);
    }

    pub fn num_composites(&self) -> usize {
        self.comp_spans.len()
    }

    /// Encoded bytes of composite component `i`.
    pub fn composite(&self, i: usize) -> Result<&[u8]> {
        let &(start, end) = self
            .comp_spans
            .get(i)
            .ok_or(ScanError::Corrupt("composite position out of bounds"))?;
        Ok(&self.compbuf.as_ref().expect("cache not initialized")[start..end])
    }

    pub fn composite_slices(&self) -> Vec<&[u8]> {
        let compbuf = self.compbuf.as_deref().expect("cache not initialized");
        self.comp_spans
            .iter()
            .map(|&(start, end)| &compbuf[start..end])
            .collect()
    }

    /// Decoded JSON text of component `i`, when the cache was initialized
    /// with decoding enabled.
    pub fn decoded_text(&self, i: usize) -> Option<&[u8]> {
        let decbuf = self.decbuf.as_deref()?;
        let &(start, end) = self.dec_spans.get(i)?;
        Some(&decbuf[start..end])
    }

    /// Parsed JSON value of component `i`, memoized across the filter,
    /// aggregate and projection steps.
    pub fn decoded_value(&mut self, i: usize) -> Result<Value> {
        if let Some(Some(v)) = self.decoded_values.get(i) {
            return Ok(v.clone());
        }
        let text = self
            .decoded_text(i)
            .ok_or(ScanError::Corrupt("no decoded text for composite position"))?;
        let value: Value = serde_json::from_slice(text)
            .map_err(|_| ScanError::Corrupt("cached component is not valid json"))?;
        if let Some(slot) = self.decoded_values.get_mut(i) {
            *slot = Some(value.clone());
        }
        Ok(value)
    }

    /// Record a hit or miss and gate downstream reuse.
    pub fn set_valid(&mut self, valid: bool) {
        if valid {
            self.hit += 1;
        } else {
            self.miss += 1;
        }
        self.valid = valid;
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Integer percentage of lookups that hit; 0 before any lookup.
    pub fn cache_hit_ratio(&self) -> u8 {
        if self.hit + self.miss == 0 {
            return 0;
        }
        ((self.hit * 100) / (self.hit + self.miss)) as u8
    }
}
