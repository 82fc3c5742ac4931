//! Order-preserving number encoding.
//!
//! A finite number is normalized to `± 0.m × 10^e` with mantissa digits `m`
//! carrying no trailing zeros. The encoded body is digit-only ASCII:
//!
//! - zero: the single byte `'0'`,
//! - positive: `'>'`, then `e + EXP_BIAS` as three digits, then `m`,
//! - negative: `'-'`, then `EXP_BIAS - 1 - e` as three digits, then the
//!   9's-complement of `m`, then the `'~'` sentinel.
//!
//! Sign classes order as `'-' < '0' < '>'`. Within positives a larger
//! exponent wins, then mantissa digits compare lexicographically (a shorter
//! mantissa that is a prefix of a longer one is smaller, which matches
//! numeric order because trailing zeros are stripped). Negatives mirror both
//! fields; the trailing `'~'` outranks any digit so that a complemented
//! prefix sorts after its extensions, mirroring the positive case.
//!
//! Integers go through exact digit extraction (no float round-trip) so the
//! full i64/u64 range is preserved.

use serde_json::{Number, Value};

use crate::{CollateError, Result};

const SIGN_NEG: u8 = b'-';
const SIGN_ZERO: u8 = b'0';
const SIGN_POS: u8 = b'>';
const NEG_SENTINEL: u8 = b'~';

/// Bias keeping every f64 exponent (roughly -323..=309) in three digits.
const EXP_BIAS: i32 = 500;

struct Decomposed {
    negative: bool,
    /// Power of ten with the mantissa interpreted as `0.m`.
    exp: i32,
    /// ASCII mantissa digits, no trailing zeros; empty only for zero.
    digits: Vec<u8>,
}

fn decompose(n: &Number) -> Result<Decomposed> {
    if let Some(i) = n.as_i64() {
        return Ok(decompose_digits(i < 0, i.unsigned_abs().to_string()));
    }
    if let Some(u) = n.as_u64() {
        return Ok(decompose_digits(false, u.to_string()));
    }
    let f = n.as_f64().ok_or(CollateError::NumberRange)?;
    if !f.is_finite() {
        return Err(CollateError::NumberRange);
    }
    if f == 0.0 {
        return Ok(Decomposed {
            negative: false,
            exp: 0,
            digits: Vec::new(),
        });
    }
    // "{:e}" renders `d.ddd...e<k>`; v = 0.dddd × 10^(k+1).
    let text = format!("{:e}", f.abs());
    let (mantissa, exp10) = text
        .split_once('e')
        .ok_or(CollateError::Corrupt("unexpected float format"))?;
    let exp10: i32 = exp10
        .parse()
        .map_err(|_| CollateError::Corrupt("unexpected float exponent"))?;
    let mut digits = mantissa.replace('.', "").into_bytes();
    while digits.last() == Some(&b'0') {
        digits.pop();
    }
    Ok(Decomposed {
        negative: f < 0.0,
        exp: exp10 + 1,
        digits,
    })
}

fn decompose_digits(negative: bool, abs_digits: String) -> Decomposed {
    let mut digits = abs_digits.into_bytes();
    let exp = digits.len() as i32;
    while digits.last() == Some(&b'0') {
        digits.pop();
    }
    if digits.is_empty() {
        // The value was zero in some spelling.
        return Decomposed {
            negative: false,
            exp: 0,
            digits,
        };
    }
    Decomposed {
        negative,
        exp,
        digits,
    }
}

fn push_exp(out: &mut Vec<u8>, biased: i32) -> Result<()> {
    if !(0..=999).contains(&biased) {
        return Err(CollateError::NumberRange);
    }
    out.push(b'0' + (biased / 100) as u8);
    out.push(b'0' + (biased / 10 % 10) as u8);
    out.push(b'0' + (biased % 10) as u8);
    Ok(())
}

fn complement(digit: u8) -> u8 {
    b'0' + (9 - (digit - b'0'))
}

pub(crate) fn encode_number(n: &Number, out: &mut Vec<u8>) -> Result<()> {
    let d = decompose(n)?;
    if d.digits.is_empty() {
        out.push(SIGN_ZERO);
        return Ok(());
    }
    if d.negative {
        out.push(SIGN_NEG);
        push_exp(out, EXP_BIAS - 1 - d.exp)?;
        out.extend(d.digits.iter().map(|&dg| complement(dg)));
        out.push(NEG_SENTINEL);
    } else {
        out.push(SIGN_POS);
        push_exp(out, d.exp + EXP_BIAS)?;
        out.extend_from_slice(&d.digits);
    }
    Ok(())
}

/// Decode a number body (the bytes between the type tag and the terminator)
/// back to a JSON number.
pub(crate) fn decode_number(body: &[u8]) -> Result<Value> {
    match body.first() {
        Some(&SIGN_ZERO) if body.len() == 1 => parse_number("0"),
        Some(&SIGN_POS) => {
            let (exp, digits) = split_body(body)?;
            parse_number(&render(false, exp - EXP_BIAS, digits))
        }
        Some(&SIGN_NEG) => {
            let (exp, digits) = split_body(body)?;
            let digits = digits
                .strip_suffix(&[NEG_SENTINEL])
                .ok_or(CollateError::Corrupt("negative number missing sentinel"))?;
            let digits: Vec<u8> = digits.iter().map(|&dg| complement(dg)).collect();
            parse_number(&render(true, EXP_BIAS - 1 - exp, &digits))
        }
        _ => Err(CollateError::Corrupt("malformed number body")),
    }
}

fn split_body(body: &[u8]) -> Result<(i32, &[u8])> {
    if body.len() < 5 {
        return Err(CollateError::Corrupt("number body too short"));
    }
    let mut exp = 0i32;
    for &b in &body[1..4] {
        if !b.is_ascii_digit() {
            return Err(CollateError::Corrupt("malformed number exponent"));
        }
        exp = exp * 10 + i32::from(b - b'0');
    }
    Ok((exp, &body[4..]))
}

/// Render `± 0.digits × 10^e` as canonical JSON number text: plain integer or
/// decimal where compact, scientific notation otherwise.
///
/// Values without fractional digits always render as plain integer text, no
/// matter how wide: serde_json parses integer literals through the exact
/// i64/u64 path, so the full integer range round-trips without passing
/// through f64.
fn render(negative: bool, exp: i32, digits: &[u8]) -> String {
    let n = digits.len() as i32;
    let digits = std::str::from_utf8(digits).unwrap_or_default();
    let body = if exp >= n {
        format!("{}{}", digits, "0".repeat((exp - n) as usize))
    } else if exp >= 1 && exp < n {
        format!("{}.{}", &digits[..exp as usize], &digits[exp as usize..])
    } else if exp <= 0 && exp >= -4 {
        format!("0.{}{}", "0".repeat((-exp) as usize), digits)
    } else if digits.len() == 1 {
        format!("{}e{}", digits, exp - 1)
    } else {
        format!("{}.{}e{}", &digits[..1], &digits[1..], exp - 1)
    };
    if negative {
        format!("-{body}")
    } else {
        body
    }
}

fn parse_number(text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(CollateError::Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cmp::Ordering;

    fn encode(v: &Value) -> Vec<u8> {
        let Value::Number(n) = v else {
            panic!("not a number: {v}")
        };
        let mut out = Vec::new();
        encode_number(n, &mut out).expect("encode");
        out
    }

    #[test]
    fn encoded_order_matches_numeric_order() {
        let ladder = [
            json!(-1.0e10),
            json!(-500),
            json!(-0.55),
            json!(-0.5),
            json!(-0.054),
            json!(0),
            json!(0.001),
            json!(0.5),
            json!(0.55),
            json!(1),
            json!(2),
            json!(10),
            json!(125),
            json!(1250),
            json!(1.0e10),
        ];
        for (i, a) in ladder.iter().enumerate() {
            for b in &ladder[i + 1..] {
                assert_eq!(
                    encode(a).cmp(&encode(b)),
                    Ordering::Less,
                    "{a} should encode below {b}"
                );
            }
        }
    }

    #[test]
    fn numbers_round_trip() {
        for v in [
            json!(0),
            json!(1),
            json!(-1),
            json!(42),
            json!(-300),
            json!(1250),
            json!(0.5),
            json!(-0.5),
            json!(12.5),
            json!(0.001),
            json!(i64::MAX),
            json!(i64::MIN),
            json!(u64::MAX),
        ] {
            let code = encode(&v);
            let back = decode_number(&code).expect("decode");
            // Exact Number equality: a float that merely compares equal to
            // the original integer is still a round-trip failure.
            assert_eq!(back, v, "{v} decoded to {back}");
        }
    }

    #[test]
    fn integers_keep_full_precision() {
        for v in [
            json!(9_007_199_254_740_993_i64), // 2^53 + 1, not f64-exact
            json!(i64::MAX),
            json!(i64::MIN),
            json!(u64::MAX),
        ] {
            let back = decode_number(&encode(&v)).expect("decode");
            assert_eq!(back, v);
            assert!(back.is_i64() || back.is_u64(), "{v} decoded as float");
        }
    }

    #[test]
    fn zero_spellings_collapse() {
        assert_eq!(encode(&json!(0)), encode(&json!(0.0)));
        assert_eq!(encode(&json!(0)), vec![b'0']);
    }

    #[test]
    fn mantissa_prefix_ordering_holds_for_negatives() {
        // -0.55 < -0.5 even though the complemented mantissa of -0.5 is a
        // prefix of -0.55's; the trailing sentinel settles it.
        assert!(encode(&json!(-0.55)) < encode(&json!(-0.5)));
        assert!(encode(&json!(-0.5)) < encode(&json!(-0.45)));
    }
}
