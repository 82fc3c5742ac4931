//! On-disk index entry layouts.
//!
//! ```text
//! primary:   [docid bytes]
//! secondary: [collate-encoded composite key] [docid] [docid_len: u16 LE] [count: u32 LE]
//! ```
//!
//! The secondary layout is parsed back-to-front: the trailing length locates
//! the key/docid split without walking the encoded key. The count suffix is
//! the number of collapsed duplicates and feeds the aggregate multiplier;
//! primary entries always count as one.

use crate::error::{Result, ScanError};

/// Trailing fixed-size region: docid_len (2) + count (4).
const SUFFIX_LEN: usize = 2 + 4;

/// View over one secondary-index entry.
#[derive(Clone, Copy)]
pub struct SecondaryEntry<'a> {
    bytes: &'a [u8],
}

impl<'a> SecondaryEntry<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let entry = Self { bytes };
        entry.len_key()?;
        Ok(entry)
    }

    /// Length of the collate-encoded composite key prefix.
    pub fn len_key(&self) -> Result<usize> {
        if self.bytes.len() < SUFFIX_LEN {
            return Err(ScanError::Corrupt("secondary entry shorter than suffix"));
        }
        let at = self.bytes.len() - SUFFIX_LEN;
        let docid_len = u16::from_le_bytes([self.bytes[at], self.bytes[at + 1]]) as usize;
        at.checked_sub(docid_len)
            .ok_or(ScanError::Corrupt("docid length exceeds entry"))
    }

    /// The collate-encoded composite key bytes.
    pub fn sec_key(&self) -> Result<&'a [u8]> {
        Ok(&self.bytes[..self.len_key()?])
    }

    /// The document id bytes.
    pub fn doc_id(&self) -> Result<&'a [u8]> {
        Ok(&self.bytes[self.len_key()?..self.bytes.len() - SUFFIX_LEN])
    }

    /// Number of collapsed duplicates stored for this key/docid pair.
    pub fn count(&self) -> Result<usize> {
        if self.bytes.len() < SUFFIX_LEN {
            return Err(ScanError::Corrupt("secondary entry shorter than suffix"));
        }
        let at = self.bytes.len() - 4;
        let count = u32::from_le_bytes([
            self.bytes[at],
            self.bytes[at + 1],
            self.bytes[at + 2],
            self.bytes[at + 3],
        ]);
        Ok(count as usize)
    }
}

/// View over one primary-index entry: the key position holds only the docid.
#[derive(Clone, Copy)]
pub struct PrimaryEntry<'a> {
    bytes: &'a [u8],
}

impl<'a> PrimaryEntry<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn doc_id(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn count(&self) -> usize {
        1
    }
}

/// Assemble a secondary entry from its parts, appending to `out`. Used by
/// index-build collaborators and tests.
pub fn encode_secondary_entry(
    encoded_key: &[u8],
    docid: &[u8],
    count: u32,
    out: &mut Vec<u8>,
) -> Result<()> {
    let docid_len =
        u16::try_from(docid.len()).map_err(|_| ScanError::Corrupt("docid longer than u16"))?;
    out.extend_from_slice(encoded_key);
    out.extend_from_slice(docid);
    out.extend_from_slice(&docid_len.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    Ok(())
}

/// True when two entries carry byte-equal secondary-key prefixes. This is the
/// DISTINCT comparison and the entry-cache identity check.
pub fn same_sec_key(a: &[u8], b: &[u8]) -> Result<bool> {
    let ea = SecondaryEntry::new(a)?;
    let eb = SecondaryEntry::new(b)?;
    Ok(ea.sec_key()? == eb.sec_key()?)
}
