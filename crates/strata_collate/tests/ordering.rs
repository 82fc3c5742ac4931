//! Randomized agreement checks between the byte encoding and the JSON
//! semantic order, plus round-trip coverage over a generated corpus.

use std::cmp::Ordering;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use strata_collate::{json_cmp, Codec};

fn random_scalar(rng: &mut StdRng) -> Value {
    match rng.gen_range(0..6) {
        0 => Value::Null,
        1 => json!(rng.gen_bool(0.5)),
        // Stay within f64-exact integer range so mixed integer/float
        // comparisons in json_cmp stay an exact reference.
        2 => json!(rng.gen_range(-1_000_000_000_i64..1_000_000_000)),
        3 => {
            let mantissa = rng.gen_range(-5_000_000_i64..5_000_000) as f64;
            json!(mantissa / 1000.0)
        }
        4 => {
            let len = rng.gen_range(0..8);
            let s: String = (0..len)
                .map(|_| char::from(rng.gen_range(b'a'..=b'e')))
                .collect();
            json!(s)
        }
        _ => json!(format!("k{}", rng.gen_range(0..100))),
    }
}

fn random_value(rng: &mut StdRng, depth: usize) -> Value {
    if depth == 0 || rng.gen_bool(0.6) {
        return random_scalar(rng);
    }
    if rng.gen_bool(0.7) {
        let len = rng.gen_range(0..4);
        Value::Array((0..len).map(|_| random_value(rng, depth - 1)).collect())
    } else {
        let len = rng.gen_range(0..3);
        let mut map = serde_json::Map::new();
        for _ in 0..len {
            map.insert(
                format!("f{}", rng.gen_range(0..6)),
                random_value(rng, depth - 1),
            );
        }
        Value::Object(map)
    }
}

fn encode(codec: &Codec, v: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    codec.encode_value(v, &mut out).expect("encode");
    out
}

#[test]
fn byte_order_agrees_with_semantic_order() {
    let codec = Codec::new();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let corpus: Vec<Value> = (0..300).map(|_| random_value(&mut rng, 2)).collect();
    let encoded: Vec<Vec<u8>> = corpus.iter().map(|v| encode(&codec, v)).collect();

    for _ in 0..5000 {
        let i = rng.gen_range(0..corpus.len());
        let j = rng.gen_range(0..corpus.len());
        let semantic = json_cmp(&corpus[i], &corpus[j]);
        let bytes = encoded[i].cmp(&encoded[j]);
        if semantic == Ordering::Equal {
            // Distinct spellings of equal values (0 vs 0.0) must still agree.
            assert_eq!(bytes, Ordering::Equal, "{} vs {}", corpus[i], corpus[j]);
        } else {
            assert_eq!(bytes, semantic, "{} vs {}", corpus[i], corpus[j]);
        }
    }
}

#[test]
fn generated_corpus_round_trips() {
    let codec = Codec::new();
    let mut rng = StdRng::seed_from_u64(0xc0ffee);
    for _ in 0..500 {
        let v = random_value(&mut rng, 3);
        let code = encode(&codec, &v);
        let (back, used) = codec.decode_value(&code).expect("decode");
        assert_eq!(used, code.len());
        assert_eq!(
            json_cmp(&back, &v),
            Ordering::Equal,
            "{v} round-tripped to {back}"
        );
    }
}

#[test]
fn exploded_elements_match_standalone_encodings() {
    let codec = Codec::new();
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..200 {
        let len = rng.gen_range(0..5);
        let items: Vec<Value> = (0..len).map(|_| random_value(&mut rng, 1)).collect();
        let array = Value::Array(items.clone());
        let code = encode(&codec, &array);

        let mut spans = Vec::new();
        codec.explode_array(&code, &mut spans).expect("explode");
        assert_eq!(spans.len(), items.len());
        for (span, item) in spans.iter().zip(&items) {
            assert_eq!(&code[span.0..span.1], encode(&codec, item).as_slice());
        }

        let parts: Vec<&[u8]> = spans.iter().map(|&(s, e)| &code[s..e]).collect();
        let mut joined = Vec::new();
        codec.join_array(&parts, &mut joined).expect("join");
        assert_eq!(joined, code);
    }
}
