//! Composite-key filtering and row projection.
//!
//! Filtering byte-compares exploded key components against encoded range
//! bounds without decoding anything. Filter collections within one scan
//! combine as a disjunction; component filters inside a collection as a
//! conjunction.

use strata_collate::Codec;

use crate::buffer::{sec_key_buf_pool, BufLease};
use crate::cache::EntryCache;
use crate::entry::SecondaryEntry;
use crate::error::{Result, ScanError};
use crate::request::{CompositeElementFilter, IndexKey, IndexProjection, Scan, ScanRequest};

/// Reused explode targets for one pipeline run.
pub(crate) struct ExplodeScratch {
    pub decbuf: BufLease,
    pub ck: Vec<(usize, usize)>,
    pub dk: Vec<(usize, usize)>,
}

impl ExplodeScratch {
    pub fn new() -> Self {
        Self {
            decbuf: sec_key_buf_pool().checkout(),
            ck: Vec::new(),
            dk: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.decbuf.clear();
        self.ck.clear();
        self.dk.clear();
    }
}

/// True iff every component satisfies its corresponding bound under the
/// filter's inclusion variant. `Min`/`Max` sentinels disable the matching
/// check.
pub fn apply_filter(components: &[&[u8]], filters: &[CompositeElementFilter]) -> bool {
    for (ck, filter) in components.iter().zip(filters.iter()) {
        if let IndexKey::Encoded(low) = &filter.low {
            let ok = if filter.inclusion.low_inclusive() {
                *ck >= low.as_slice()
            } else {
                *ck > low.as_slice()
            };
            if !ok {
                return false;
            }
        }
        if let IndexKey::Encoded(high) = &filter.high {
            let ok = if filter.inclusion.high_inclusive() {
                *ck <= high.as_slice()
            } else {
                *ck < high.as_slice()
            };
            if !ok {
                return false;
            }
        }
    }
    true
}

/// Uncached filter evaluation: explode the key and test the scan's filter
/// collections. Returns true when the row must be skipped.
pub fn filter_scan_row(codec: &Codec, scan: &Scan, key: &[u8]) -> Result<bool> {
    let mut spans = Vec::new();
    codec.explode_array(key, &mut spans)?;
    let components: Vec<&[u8]> = spans.iter().map(|&(s, e)| &key[s..e]).collect();
    filter_disjunction(&components, scan)
}

/// Cache-consulting filter evaluation for the hot path. On return the cache
/// holds the current entry's exploded form (non-primary indexes), whether it
/// was reused or freshly computed.
pub(crate) fn filter_scan_row2(
    codec: &Codec,
    req: &ScanRequest,
    scan: &Scan,
    entry: &[u8],
    need_decoded: bool,
    cache: &mut EntryCache,
    scratch: &mut ExplodeScratch,
) -> Result<bool> {
    ensure_exploded(codec, req, entry, need_decoded, cache, scratch)?;

    if req.is_primary {
        let components: Vec<&[u8]> = scratch.ck.iter().map(|&(s, e)| &entry[s..e]).collect();
        filter_disjunction(&components, scan)
    } else {
        let components = cache.composite_slices();
        filter_disjunction(&components, scan)
    }
}

/// Make the current entry's exploded form available: reuse the cache when
/// the key prefix matches, explode and refresh it otherwise. Primary-index
/// entries bypass the cache entirely and land in `scratch`.
pub(crate) fn ensure_exploded(
    codec: &Codec,
    req: &ScanRequest,
    entry: &[u8],
    need_decoded: bool,
    cache: &mut EntryCache,
    scratch: &mut ExplodeScratch,
) -> Result<()> {
    if !req.is_primary && cache.exists() {
        let valid = cache.equals_entry(entry);
        cache.set_valid(valid);
    }

    if req.is_primary || !cache.valid() {
        scratch.clear();
        if need_decoded {
            codec.explode_array2(entry, &mut scratch.decbuf, &mut scratch.ck, &mut scratch.dk)?;
        } else {
            codec.explode_array(entry, &mut scratch.ck)?;
        }
    }

    if !req.is_primary {
        if !cache.exists() {
            cache.init(need_decoded);
        }
        if !cache.valid() {
            let decoded = need_decoded.then(|| (scratch.decbuf.as_slice(), scratch.dk.as_slice()));
            cache.update(entry, &scratch.ck, decoded);
        }
    }
    Ok(())
}

fn filter_disjunction(components: &[&[u8]], scan: &Scan) -> Result<bool> {
    for collection in &scan.filters {
        if collection.composite_filters.len() > components.len() {
            return Err(ScanError::MoreRangesThanComponents);
        }
        if apply_filter(components, &collection.composite_filters) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Non-aggregate projection: keep the flagged key positions, rejoin them and
/// reattach the entry's docid tail. With every component suppressed only the
/// tail is emitted.
pub(crate) fn project_keys(
    codec: &Codec,
    cache: Option<&EntryCache>,
    entry: &[u8],
    projection: &IndexProjection,
    out: &mut Vec<u8>,
) -> Result<()> {
    let key_len = SecondaryEntry::new(entry)?.len_key()?;
    if projection.entry_keys_empty {
        out.extend_from_slice(&entry[key_len..]);
        return Ok(());
    }

    let mut local_spans = Vec::new();
    let components: Vec<&[u8]> = match cache {
        Some(cache) => cache.composite_slices(),
        None => {
            codec.explode_array(entry, &mut local_spans)?;
            local_spans.iter().map(|&(s, e)| &entry[s..e]).collect()
        }
    };

    let keys_to_join: Vec<&[u8]> = components
        .iter()
        .zip(projection.projection_keys.iter())
        .filter(|(_, &keep)| keep)
        .map(|(&ck, _)| ck)
        .collect();
    codec.join_array(&keys_to_join, out)?;
    out.extend_from_slice(&entry[key_len..]);
    Ok(())
}

/// Ordering-group projection keeping only composite position 0, with the
/// docid tail reattached.
pub fn project_leading_key(codec: &Codec, entry: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let key_len = SecondaryEntry::new(entry)?.len_key()?;
    let mut spans = Vec::new();
    codec.explode_array(entry, &mut spans)?;
    let &(start, end) = spans
        .first()
        .ok_or(ScanError::Corrupt("entry has no leading key component"))?;
    codec.join_array(&[&entry[start..end]], out)?;
    out.extend_from_slice(&entry[key_len..]);
    Ok(())
}
