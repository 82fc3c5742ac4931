//! Composite-array operations: explode, join, and reverse collation.
//!
//! Explode splits an encoded array into per-element byte spans without
//! decoding, which is what allows the scan layer to byte-compare composite
//! key components against encoded range bounds. Spans are `(start, end)`
//! offsets into the input so callers can re-anchor them against copies.

use crate::{Codec, CollateError, Result, TERMINATOR, TYPE_ARRAY};

impl Codec {
    /// Split an encoded array into element spans, appending `(start, end)`
    /// offset pairs (relative to `code`) to `spans`. Every span covers one
    /// complete encoded element including its terminator. Elements that
    /// consume no bytes are skipped.
    pub fn explode_array(&self, code: &[u8], spans: &mut Vec<(usize, usize)>) -> Result<()> {
        if self.array_len_prefix() {
            return Err(CollateError::LenPrefixUnsupported);
        }
        if code.first() != Some(&TYPE_ARRAY) {
            return Err(CollateError::NotAnArray);
        }
        let mut pos = 1;
        loop {
            let b = *code
                .get(pos)
                .ok_or(CollateError::Corrupt("unterminated array"))?;
            if b == TERMINATOR {
                return Ok(());
            }
            let used = self.scan_one(&code[pos..])?;
            if used > 0 {
                spans.push((pos, pos + used));
            }
            pos += used;
        }
    }

    /// Like [`Codec::explode_array`], but also materializes the decoded JSON
    /// text of each element. Decoded text is appended to `decbuf` with its
    /// `(start, end)` offsets (relative to `decbuf`'s starting length) pushed
    /// to `dec_spans`.
    pub fn explode_array2(
        &self,
        code: &[u8],
        decbuf: &mut Vec<u8>,
        spans: &mut Vec<(usize, usize)>,
        dec_spans: &mut Vec<(usize, usize)>,
    ) -> Result<()> {
        if self.array_len_prefix() {
            return Err(CollateError::LenPrefixUnsupported);
        }
        if code.first() != Some(&TYPE_ARRAY) {
            return Err(CollateError::NotAnArray);
        }
        let mut pos = 1;
        loop {
            let b = *code
                .get(pos)
                .ok_or(CollateError::Corrupt("unterminated array"))?;
            if b == TERMINATOR {
                return Ok(());
            }
            let dec_start = decbuf.len();
            let used = self.decode(&code[pos..], decbuf)?;
            dec_spans.push((dec_start, decbuf.len()));
            if used > 0 {
                spans.push((pos, pos + used));
            }
            pos += used;
        }
    }

    /// Rebuild an encoded array from already-encoded element slices:
    /// `TYPE_ARRAY`, the elements in order, `TERMINATOR`. Appends to `out`.
    pub fn join_array(&self, parts: &[&[u8]], out: &mut Vec<u8>) -> Result<()> {
        if self.array_len_prefix() {
            return Err(CollateError::LenPrefixUnsupported);
        }
        out.push(TYPE_ARRAY);
        for part in parts {
            out.extend_from_slice(part);
        }
        out.push(TERMINATOR);
        Ok(())
    }

    /// Bitwise-invert the encoded bytes of every desc-flagged composite
    /// position, in place. Inverting reverses the byte order of that
    /// position, so storage-ascending iteration reads back as descending.
    ///
    /// The function is an involution: flagged elements already in flipped
    /// (storage) form are recognized by their complemented type tag, walked
    /// through an XOR mask, and flipped back to canonical form. Bytes after
    /// the leading array (an entry's docid tail) are left untouched.
    pub fn reverse_collate(&self, code: &mut [u8], desc: &[bool]) -> Result<()> {
        if self.array_len_prefix() {
            return Err(CollateError::LenPrefixUnsupported);
        }
        if code.first() != Some(&TYPE_ARRAY) {
            return Err(CollateError::NotAnArray);
        }
        let mut pos = 1;
        for &flip in desc {
            let b = *code
                .get(pos)
                .ok_or(CollateError::Corrupt("unterminated array"))?;
            if b == TERMINATOR {
                return Ok(());
            }
            let mask = element_mask(b)?;
            let used = self.scan_one_masked(&code[pos..], mask)?;
            if flip {
                for byte in &mut code[pos..pos + used] {
                    *byte = !*byte;
                }
            }
            pos += used;
        }
        Ok(())
    }
}

/// Orientation of an element from its leading byte: a known type tag means
/// canonical form (mask 0), the complement of one means flipped form
/// (mask 0xFF). Tags and their complements do not overlap, so detection is
/// unambiguous.
fn element_mask(lead: u8) -> Result<u8> {
    if is_type_tag(lead) {
        Ok(0x00)
    } else if is_type_tag(!lead) {
        Ok(0xFF)
    } else {
        Err(CollateError::Corrupt("unknown type tag"))
    }
}

fn is_type_tag(b: u8) -> bool {
    (crate::TYPE_MISSING..=crate::TYPE_OBJ).contains(&b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_cmp;
    use serde_json::{json, Value};

    fn enc(codec: &Codec, v: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        codec.encode_value(v, &mut out).expect("encode");
        out
    }

    fn explode<'a>(codec: &Codec, code: &'a [u8]) -> Vec<&'a [u8]> {
        let mut spans = Vec::new();
        codec.explode_array(code, &mut spans).expect("explode");
        spans.iter().map(|&(s, e)| &code[s..e]).collect()
    }

    #[test]
    fn explode_yields_standalone_element_encodings() {
        let codec = Codec::new();
        let code = enc(&codec, &json!(["us", 7, null]));
        let parts = explode(&codec, &code);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], enc(&codec, &json!("us")).as_slice());
        assert_eq!(parts[1], enc(&codec, &json!(7)).as_slice());
        assert_eq!(parts[2], enc(&codec, &json!(null)).as_slice());
    }

    #[test]
    fn explode_rejects_non_arrays() {
        let codec = Codec::new();
        let code = enc(&codec, &json!("scalar"));
        let mut spans = Vec::new();
        assert!(matches!(
            codec.explode_array(&code, &mut spans),
            Err(CollateError::NotAnArray)
        ));
    }

    #[test]
    fn join_of_exploded_parts_reproduces_the_array() {
        let codec = Codec::new();
        let code = enc(&codec, &json!([1, ["a", 2], {"k": true}]));
        let parts = explode(&codec, &code);
        let mut joined = Vec::new();
        codec.join_array(&parts, &mut joined).expect("join");
        assert_eq!(joined, code);
    }

    #[test]
    fn explode2_materializes_decoded_text() {
        let codec = Codec::new();
        let code = enc(&codec, &json!(["ny", 42]));
        let mut decbuf = Vec::new();
        let mut spans = Vec::new();
        let mut dec_spans = Vec::new();
        codec
            .explode_array2(&code, &mut decbuf, &mut spans, &mut dec_spans)
            .expect("explode2");
        assert_eq!(spans.len(), 2);
        assert_eq!(dec_spans.len(), 2);
        let first = &decbuf[dec_spans[0].0..dec_spans[0].1];
        let second = &decbuf[dec_spans[1].0..dec_spans[1].1];
        assert_eq!(first, br#""ny""#);
        assert_eq!(second, b"42");
    }

    #[test]
    fn reverse_collate_is_an_involution() {
        let codec = Codec::new();
        let canonical = enc(&codec, &json!([3, "mid", true]));
        let desc = [true, false, true];
        let mut flipped = canonical.clone();
        codec.reverse_collate(&mut flipped, &desc).expect("flip");
        assert_ne!(flipped, canonical);
        codec.reverse_collate(&mut flipped, &desc).expect("unflip");
        assert_eq!(flipped, canonical);
    }

    #[test]
    fn flipped_leading_component_reverses_storage_order() {
        let codec = Codec::new();
        let desc = [true];
        let mut flipped: Vec<Vec<u8>> = (1..=3)
            .map(|age| {
                let mut code = enc(&codec, &json!([age]));
                codec.reverse_collate(&mut code, &desc).expect("flip");
                code
            })
            .collect();
        flipped.sort();
        // Storage-ascending over flipped bytes must come back as 3, 2, 1.
        let ages: Vec<Value> = flipped
            .iter_mut()
            .map(|code| {
                codec.reverse_collate(code, &desc).expect("unflip");
                codec.decode_value(code).expect("decode").0
            })
            .map(|v| v.as_array().expect("array")[0].clone())
            .collect();
        assert_eq!(ages, vec![json!(3), json!(2), json!(1)]);
    }

    #[test]
    fn reverse_collate_leaves_trailing_bytes_alone() {
        let codec = Codec::new();
        let mut code = enc(&codec, &json!([5]));
        let key_len = code.len();
        code.extend_from_slice(b"docid-tail");
        codec.reverse_collate(&mut code, &[true]).expect("flip");
        assert_eq!(&code[key_len..], b"docid-tail");
        codec.reverse_collate(&mut code, &[true]).expect("unflip");
        assert_eq!(&code[..key_len], enc(&codec, &json!([5])).as_slice());
    }

    #[test]
    fn element_spans_compare_like_their_values() {
        let codec = Codec::new();
        let low = json!([1, "a"]);
        let high = json!([1, "b"]);
        let lc = enc(&codec, &low);
        let hc = enc(&codec, &high);
        let lp = explode(&codec, &lc);
        let hp = explode(&codec, &hc);
        assert_eq!(lp[0].cmp(&hp[0]), std::cmp::Ordering::Equal);
        assert_eq!(lp[1].cmp(&hp[1]), json_cmp(&json!("a"), &json!("b")));
    }
}
