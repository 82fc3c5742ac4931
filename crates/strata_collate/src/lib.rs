//! Order-preserving binary encoding ("collate encoding") for JSON values.
//!
//! The codec maps JSON values to byte strings whose lexicographic order equals
//! the JSON semantic order: `memcmp(encode(a), encode(b))` has the same sign
//! as `json_cmp(a, b)`. This is what lets the scan layer compare composite
//! index keys and range bounds byte-for-byte without decoding.
//!
//! Wire format: a one-byte type tag, a type-specific body, and a `TERMINATOR`
//! byte (`0x00`) closing every value, scalars included. The tag values are
//! pinned: persisted index entries and remote callers depend on them.

use std::cmp::Ordering;

use serde_json::Value;
use thiserror::Error;

mod array;
mod number;

pub const TYPE_MISSING: u8 = 1;
pub const TYPE_NULL: u8 = 2;
pub const TYPE_FALSE: u8 = 3;
pub const TYPE_TRUE: u8 = 4;
pub const TYPE_NUMBER: u8 = 5;
pub const TYPE_STRING: u8 = 6;
pub const TYPE_ARRAY: u8 = 7;
pub const TYPE_OBJ: u8 = 8;
pub const TERMINATOR: u8 = 0;

/// Escape byte following an interior `0x00` inside string bodies. A
/// `0x00 0x01` pair decodes to a literal zero byte; `0x00 0x00` ends the
/// string (body terminator plus the value terminator every value carries).
/// The pairing keeps `0x00` unambiguous even when the next encoded value
/// starts with `TYPE_MISSING` (`0x01`).
const STRING_ESCAPE: u8 = 1;

/// Slack the caller adds when pre-sizing an encode buffer to
/// `3 * len(json_text) + MIN_BUFFER_SIZE`.
pub const MIN_BUFFER_SIZE: usize = 16;

/// Errors produced by the collate codec.
#[derive(Debug, Error)]
pub enum CollateError {
    #[error("encoded value is not an array")]
    NotAnArray,
    #[error("length-prefixed arrays are unsupported")]
    LenPrefixUnsupported,
    #[error("corrupt collate encoding: {0}")]
    Corrupt(&'static str),
    #[error("number outside the encodable range")]
    NumberRange,
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CollateError>;

/// The collate codec. Stateless apart from the reserved length-prefix flag,
/// so a single instance can be shared freely across scans.
#[derive(Clone, Debug, Default)]
pub struct Codec {
    array_len_prefix: bool,
}

impl Codec {
    pub fn new() -> Self {
        Self {
            array_len_prefix: false,
        }
    }

    /// Reserved mode in which arrays carry a length prefix. Setting it makes
    /// every array operation fail with [`CollateError::LenPrefixUnsupported`];
    /// it exists so request surfaces can reject the mode uniformly.
    pub fn length_prefixed_arrays(&mut self, enable: bool) {
        self.array_len_prefix = enable;
    }

    pub(crate) fn array_len_prefix(&self) -> bool {
        self.array_len_prefix
    }

    /// Encode JSON text into collate form, appending to `out`.
    pub fn encode(&self, json_text: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let value: Value = serde_json::from_slice(json_text)?;
        self.encode_value(&value, out)
    }

    /// Encode a parsed JSON value into collate form, appending to `out`.
    pub fn encode_value(&self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        match value {
            Value::Null => {
                out.push(TYPE_NULL);
                out.push(TERMINATOR);
            }
            Value::Bool(false) => {
                out.push(TYPE_FALSE);
                out.push(TERMINATOR);
            }
            Value::Bool(true) => {
                out.push(TYPE_TRUE);
                out.push(TERMINATOR);
            }
            Value::Number(n) => {
                out.push(TYPE_NUMBER);
                number::encode_number(n, out)?;
                out.push(TERMINATOR);
            }
            Value::String(s) => {
                out.push(TYPE_STRING);
                for &b in s.as_bytes() {
                    out.push(b);
                    if b == TERMINATOR {
                        out.push(STRING_ESCAPE);
                    }
                }
                out.push(TERMINATOR);
                out.push(TERMINATOR);
            }
            Value::Array(items) => {
                if self.array_len_prefix {
                    return Err(CollateError::LenPrefixUnsupported);
                }
                out.push(TYPE_ARRAY);
                for item in items {
                    self.encode_value(item, out)?;
                }
                out.push(TERMINATOR);
            }
            Value::Object(map) => {
                out.push(TYPE_OBJ);
                // serde_json's default map is key-sorted, which is exactly the
                // canonical order the encoding needs.
                for (k, v) in map {
                    self.encode_value(&Value::String(k.clone()), out)?;
                    self.encode_value(v, out)?;
                }
                out.push(TERMINATOR);
            }
        }
        Ok(())
    }

    /// Decode one collate-encoded value back to canonical JSON text,
    /// appending to `out`. Returns the number of encoded bytes consumed.
    pub fn decode(&self, code: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let (value, used) = self.decode_value(code)?;
        serde_json::to_writer(&mut *out, &value)?;
        Ok(used)
    }

    /// Decode one collate-encoded value into a parsed JSON value. Returns the
    /// value and the number of encoded bytes consumed. `TYPE_MISSING` decodes
    /// to JSON null; it never round-trips through `encode_value`.
    pub fn decode_value(&self, code: &[u8]) -> Result<(Value, usize)> {
        if code.is_empty() {
            return Err(CollateError::Corrupt("empty input"));
        }
        match code[0] {
            TYPE_MISSING | TYPE_NULL => {
                expect_terminator(code, 1)?;
                Ok((Value::Null, 2))
            }
            TYPE_FALSE => {
                expect_terminator(code, 1)?;
                Ok((Value::Bool(false), 2))
            }
            TYPE_TRUE => {
                expect_terminator(code, 1)?;
                Ok((Value::Bool(true), 2))
            }
            TYPE_NUMBER => {
                let end = find_terminator(code, 1)?;
                let value = number::decode_number(&code[1..end])?;
                Ok((value, end + 1))
            }
            TYPE_STRING => {
                let mut bytes = Vec::new();
                let mut pos = 1;
                loop {
                    let b = *code
                        .get(pos)
                        .ok_or(CollateError::Corrupt("unterminated string"))?;
                    if b == TERMINATOR {
                        match code.get(pos + 1) {
                            Some(&STRING_ESCAPE) => {
                                bytes.push(TERMINATOR);
                                pos += 2;
                                continue;
                            }
                            Some(&TERMINATOR) => {
                                pos += 2;
                                break;
                            }
                            _ => return Err(CollateError::Corrupt("unterminated string")),
                        }
                    }
                    bytes.push(b);
                    pos += 1;
                }
                let s = String::from_utf8(bytes)
                    .map_err(|_| CollateError::Corrupt("string body is not utf-8"))?;
                Ok((Value::String(s), pos))
            }
            TYPE_ARRAY => {
                if self.array_len_prefix {
                    return Err(CollateError::LenPrefixUnsupported);
                }
                let mut items = Vec::new();
                let mut pos = 1;
                loop {
                    let b = *code
                        .get(pos)
                        .ok_or(CollateError::Corrupt("unterminated array"))?;
                    if b == TERMINATOR {
                        break;
                    }
                    let (item, used) = self.decode_value(&code[pos..])?;
                    items.push(item);
                    pos += used;
                }
                Ok((Value::Array(items), pos + 1))
            }
            TYPE_OBJ => {
                let mut map = serde_json::Map::new();
                let mut pos = 1;
                loop {
                    let b = *code
                        .get(pos)
                        .ok_or(CollateError::Corrupt("unterminated object"))?;
                    if b == TERMINATOR {
                        break;
                    }
                    let (key, used) = self.decode_value(&code[pos..])?;
                    pos += used;
                    let Value::String(key) = key else {
                        return Err(CollateError::Corrupt("object key is not a string"));
                    };
                    let (val, used) = self.decode_value(&code[pos..])?;
                    pos += used;
                    map.insert(key, val);
                }
                Ok((Value::Object(map), pos + 1))
            }
            _ => Err(CollateError::Corrupt("unknown type tag")),
        }
    }

    /// Length in bytes of the first encoded value in `code`, including its
    /// terminator. Walks the encoding without materializing anything.
    pub fn scan_one(&self, code: &[u8]) -> Result<usize> {
        self.scan_one_masked(code, 0)
    }

    /// Like [`Codec::scan_one`] but reads every byte through `b ^ mask`.
    /// With `mask = 0xFF` this walks a bit-flipped (descending-collated)
    /// value without un-flipping it first.
    pub(crate) fn scan_one_masked(&self, code: &[u8], mask: u8) -> Result<usize> {
        let read = |pos: usize| -> Result<u8> {
            code.get(pos)
                .map(|b| b ^ mask)
                .ok_or(CollateError::Corrupt("truncated value"))
        };
        match read(0)? {
            TYPE_MISSING | TYPE_NULL | TYPE_FALSE | TYPE_TRUE => {
                if read(1)? != TERMINATOR {
                    return Err(CollateError::Corrupt("scalar missing terminator"));
                }
                Ok(2)
            }
            TYPE_NUMBER => {
                let mut pos = 1;
                while read(pos)? != TERMINATOR {
                    pos += 1;
                }
                Ok(pos + 1)
            }
            TYPE_STRING => {
                let mut pos = 1;
                loop {
                    if read(pos)? == TERMINATOR {
                        match read(pos + 1)? {
                            STRING_ESCAPE => {
                                pos += 2;
                                continue;
                            }
                            TERMINATOR => return Ok(pos + 2),
                            _ => return Err(CollateError::Corrupt("unterminated string")),
                        }
                    }
                    pos += 1;
                }
            }
            TYPE_ARRAY | TYPE_OBJ => {
                if self.array_len_prefix {
                    return Err(CollateError::LenPrefixUnsupported);
                }
                let mut pos = 1;
                while read(pos)? != TERMINATOR {
                    pos += self.scan_one_masked(&code[pos..], mask)?;
                }
                Ok(pos + 1)
            }
            _ => Err(CollateError::Corrupt("unknown type tag")),
        }
    }
}

fn expect_terminator(code: &[u8], pos: usize) -> Result<()> {
    match code.get(pos) {
        Some(&TERMINATOR) => Ok(()),
        _ => Err(CollateError::Corrupt("scalar missing terminator")),
    }
}

fn find_terminator(code: &[u8], from: usize) -> Result<usize> {
    code[from..]
        .iter()
        .position(|&b| b == TERMINATOR)
        .map(|p| from + p)
        .ok_or(CollateError::Corrupt("unterminated value"))
}

/// JSON semantic comparison, the reference order the encoding preserves:
/// null < false < true < number < string < array < object. Numbers compare
/// numerically, strings byte-wise as UTF-8, arrays element-wise, objects as
/// key-sorted pair sequences.
pub fn json_cmp(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => TYPE_NULL,
            Value::Bool(false) => TYPE_FALSE,
            Value::Bool(true) => TYPE_TRUE,
            Value::Number(_) => TYPE_NUMBER,
            Value::String(_) => TYPE_STRING,
            Value::Array(_) => TYPE_ARRAY,
            Value::Object(_) => TYPE_OBJ,
        }
    }

    match rank(a).cmp(&rank(b)) {
        Ordering::Equal => {}
        unequal => return unequal,
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => cmp_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                match json_cmp(xi, yi) {
                    Ordering::Equal => {}
                    unequal => return unequal,
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                match xk.cmp(yk) {
                    Ordering::Equal => {}
                    unequal => return unequal,
                }
                match json_cmp(xv, yv) {
                    Ordering::Equal => {}
                    unequal => return unequal,
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Numeric comparison with exact integer handling: two integers compare on
/// their i128 values, so distinct integers above 2^53 never collapse to
/// `Equal` the way an f64 comparison would. Integer/float mixes fall back to
/// f64.
fn cmp_numbers(x: &serde_json::Number, y: &serde_json::Number) -> Ordering {
    fn as_i128(n: &serde_json::Number) -> Option<i128> {
        n.as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
    }

    match (as_i128(x), as_i128(y)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => {
            let a = x.as_f64().unwrap_or(f64::NAN);
            let b = y.as_f64().unwrap_or(f64::NAN);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn enc(codec: &Codec, v: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        codec.encode_value(v, &mut out).expect("encode");
        out
    }

    #[test]
    fn scalars_round_trip() {
        let codec = Codec::new();
        for v in [json!(null), json!(false), json!(true)] {
            let code = enc(&codec, &v);
            let (back, used) = codec.decode_value(&code).expect("decode");
            assert_eq!(back, v);
            assert_eq!(used, code.len());
        }
    }

    #[test]
    fn null_and_zero_sentinel_bytes_are_pinned() {
        let codec = Codec::new();
        assert_eq!(enc(&codec, &json!(null)), vec![TYPE_NULL, TERMINATOR]);
        assert_eq!(enc(&codec, &json!(0)), vec![TYPE_NUMBER, b'0', TERMINATOR]);
    }

    #[test]
    fn string_with_interior_zero_round_trips() {
        let codec = Codec::new();
        let v = Value::String("a\u{0}b".to_string());
        let code = enc(&codec, &v);
        // The interior zero is escaped so the double-zero ending stays
        // unambiguous.
        assert_eq!(
            code,
            vec![TYPE_STRING, b'a', 0, 1, b'b', TERMINATOR, TERMINATOR]
        );
        let (back, _) = codec.decode_value(&code).expect("decode");
        assert_eq!(back, v);
    }

    #[test]
    fn type_order_matches_semantic_order() {
        let codec = Codec::new();
        let ladder = [
            json!(null),
            json!(false),
            json!(true),
            json!(-10),
            json!(3.5),
            json!("a"),
            json!([1]),
            json!({"k": 1}),
        ];
        for pair in ladder.windows(2) {
            let a = enc(&codec, &pair[0]);
            let b = enc(&codec, &pair[1]);
            assert!(a < b, "{:?} should sort before {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn large_integers_compare_exactly() {
        let lo = json!(9_007_199_254_740_993_i64); // 2^53 + 1
        let hi = json!(9_007_199_254_740_994_i64); // 2^53 + 2, same f64
        assert_eq!(json_cmp(&lo, &hi), Ordering::Less);
        assert_eq!(json_cmp(&hi, &lo), Ordering::Greater);
        assert_eq!(json_cmp(&lo, &lo), Ordering::Equal);
        assert_eq!(
            json_cmp(&json!(i64::MAX), &json!(u64::MAX)),
            Ordering::Less
        );
        // The byte encoding agrees.
        let codec = Codec::new();
        assert!(enc(&codec, &lo) < enc(&codec, &hi));
    }

    #[test]
    fn object_encoding_is_key_sorted() {
        let codec = Codec::new();
        let a: Value = serde_json::from_str(r#"{"b":1,"a":2}"#).expect("json");
        let b: Value = serde_json::from_str(r#"{"a":2,"b":1}"#).expect("json");
        assert_eq!(enc(&codec, &a), enc(&codec, &b));
    }

    #[test]
    fn nested_array_round_trips_through_text() {
        let codec = Codec::new();
        let v = json!(["us", ["ny", 7], {"zip": "10001"}]);
        let code = enc(&codec, &v);
        let mut text = Vec::new();
        let used = codec.decode(&code, &mut text).expect("decode");
        assert_eq!(used, code.len());
        let back: Value = serde_json::from_slice(&text).expect("json");
        assert_eq!(back, v);
    }

    #[test]
    fn scan_one_spans_whole_values() {
        let codec = Codec::new();
        let v = json!([1, "two", [3, null]]);
        let code = enc(&codec, &v);
        assert_eq!(codec.scan_one(&code).expect("scan"), code.len());
        assert!(matches!(
            codec.scan_one(&code[..code.len() - 1]),
            Err(CollateError::Corrupt(_))
        ));
    }

    #[test]
    fn length_prefixed_mode_is_rejected() {
        let mut codec = Codec::new();
        codec.length_prefixed_arrays(true);
        let mut out = Vec::new();
        assert!(matches!(
            codec.encode_value(&json!([1]), &mut out),
            Err(CollateError::LenPrefixUnsupported)
        ));
    }
}
