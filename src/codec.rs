//! Tuple wire codec for ring buffers.
//!
//! A tuple is encoded against its (finished) schema as a null bitmap
//! followed by one field encoding per non-null field, everything packed
//! into little-endian `u32` words. The schema travels out of band (both
//! ends hold the compiled artifact), so the encoding carries no field names
//! or types.

use crate::error::{Result, WeirError};
use crate::schema::TupleSchema;
use crate::value::{ScalarType, Tuple, Value};
use std::net::{Ipv4Addr, Ipv6Addr};

fn corrupt(msg: &str) -> WeirError {
    WeirError::fatal(format!("tuple codec: {msg}"))
}

/// Words needed for the null bitmap of `n` fields.
fn bitmap_words(n: usize) -> usize {
    n.div_ceil(32)
}

fn push_u64(out: &mut Vec<u32>, v: u64) {
    out.push(v as u32);
    out.push((v >> 32) as u32);
}

fn push_u128(out: &mut Vec<u32>, v: u128) {
    for i in 0..4 {
        out.push((v >> (32 * i)) as u32);
    }
}

fn push_str(out: &mut Vec<u32>, s: &str) {
    let bytes = s.as_bytes();
    out.push(bytes.len() as u32);
    for chunk in bytes.chunks(4) {
        let mut w = [0u8; 4];
        w[..chunk.len()].copy_from_slice(chunk);
        out.push(u32::from_le_bytes(w));
    }
}

/// Encode a tuple. Values must already match the schema's scalar types;
/// the caller casts before encoding.
pub fn encode_tuple(schema: &TupleSchema, tuple: &Tuple) -> Result<Vec<u32>> {
    if tuple.len() != schema.len() {
        return Err(corrupt("tuple arity does not match schema"));
    }
    let mut out = vec![0u32; bitmap_words(schema.len())];
    for (i, v) in tuple.iter().enumerate() {
        if v.is_null() {
            out[i / 32] |= 1 << (i % 32);
        }
    }
    for (field, v) in schema.iter().zip(tuple.iter()) {
        if v.is_null() {
            continue;
        }
        let declared = field
            .typ
            .scalar
            .ok_or_else(|| corrupt("schema field without a type"))?;
        if v.type_of() != declared {
            return Err(corrupt("value type does not match schema"));
        }
        match v {
            Value::Null(_) => {}
            Value::Bool(b) => out.push(u32::from(*b)),
            Value::I8(n) => out.push(*n as u32),
            Value::I16(n) => out.push(*n as u32),
            Value::I32(n) => out.push(*n as u32),
            Value::U8(n) => out.push(u32::from(*n)),
            Value::U16(n) => out.push(u32::from(*n)),
            Value::U32(n) => out.push(*n),
            Value::I64(n) => push_u64(&mut out, *n as u64),
            Value::U64(n) => push_u64(&mut out, *n),
            Value::Float(f) => push_u64(&mut out, f.to_bits()),
            Value::I128(n) => push_u128(&mut out, *n as u128),
            Value::U128(n) => push_u128(&mut out, *n),
            Value::Str(s) => push_str(&mut out, s),
            Value::Ip4(a) => out.push(u32::from(*a)),
            Value::Ip6(a) => push_u128(&mut out, u128::from(*a)),
            Value::Cidr4 { addr, prefix } => {
                out.push(u32::from(*addr));
                out.push(u32::from(*prefix));
            }
            Value::Cidr6 { addr, prefix } => {
                push_u128(&mut out, u128::from(*addr));
                out.push(u32::from(*prefix));
            }
        }
    }
    Ok(out)
}

struct Reader<'a> {
    words: &'a [u32],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self) -> Result<u32> {
        let w = *self
            .words
            .get(self.pos)
            .ok_or_else(|| corrupt("message truncated"))?;
        self.pos += 1;
        Ok(w)
    }

    fn take_u64(&mut self) -> Result<u64> {
        let lo = u64::from(self.take()?);
        let hi = u64::from(self.take()?);
        Ok(lo | (hi << 32))
    }

    fn take_u128(&mut self) -> Result<u128> {
        let mut v = 0u128;
        for i in 0..4 {
            v |= u128::from(self.take()?) << (32 * i);
        }
        Ok(v)
    }

    fn take_str(&mut self) -> Result<String> {
        let len = self.take()? as usize;
        let mut bytes = Vec::with_capacity(len);
        let mut remaining = len;
        while remaining > 0 {
            let w = self.take()?.to_le_bytes();
            let n = remaining.min(4);
            bytes.extend_from_slice(&w[..n]);
            remaining -= n;
        }
        String::from_utf8(bytes).map_err(|_| corrupt("string is not valid utf-8"))
    }
}

/// Decode a tuple previously encoded against the same schema.
pub fn decode_tuple(schema: &TupleSchema, words: &[u32]) -> Result<Tuple> {
    let nb = bitmap_words(schema.len());
    if words.len() < nb {
        return Err(corrupt("message shorter than its null bitmap"));
    }
    let bitmap = &words[..nb];
    let mut r = Reader {
        words,
        pos: nb,
    };
    let mut tuple = Vec::with_capacity(schema.len());
    for (i, field) in schema.iter().enumerate() {
        let t = field
            .typ
            .scalar
            .ok_or_else(|| corrupt("schema field without a type"))?;
        if bitmap[i / 32] & (1 << (i % 32)) != 0 {
            tuple.push(Value::Null(t));
            continue;
        }
        let v = match t {
            ScalarType::Bool => Value::Bool(r.take()? != 0),
            ScalarType::I8 => Value::I8(r.take()? as i8),
            ScalarType::I16 => Value::I16(r.take()? as i16),
            ScalarType::I32 => Value::I32(r.take()? as i32),
            ScalarType::U8 => Value::U8(r.take()? as u8),
            ScalarType::U16 => Value::U16(r.take()? as u16),
            ScalarType::U32 => Value::U32(r.take()?),
            ScalarType::I64 => Value::I64(r.take_u64()? as i64),
            ScalarType::U64 => Value::U64(r.take_u64()?),
            ScalarType::Float => Value::Float(f64::from_bits(r.take_u64()?)),
            ScalarType::I128 => Value::I128(r.take_u128()? as i128),
            ScalarType::U128 => Value::U128(r.take_u128()?),
            ScalarType::Str => Value::Str(r.take_str()?),
            ScalarType::Ip4 => Value::Ip4(Ipv4Addr::from(r.take()?)),
            ScalarType::Ip6 => Value::Ip6(Ipv6Addr::from(r.take_u128()?)),
            ScalarType::Cidr4 => Value::Cidr4 {
                addr: Ipv4Addr::from(r.take()?),
                prefix: r.take()? as u8,
            },
            ScalarType::Cidr6 => Value::Cidr6 {
                addr: Ipv6Addr::from(r.take_u128()?),
                prefix: r.take()? as u8,
            },
            ScalarType::Num | ScalarType::Any => {
                return Err(corrupt("abstract type in a finished schema"));
            }
        };
        tuple.push(v);
    }
    Ok(tuple)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ExprType;

    fn schema(fields: &[(&str, ScalarType, bool)]) -> TupleSchema {
        let mut s = TupleSchema::new();
        for (n, t, null) in fields {
            s.push(*n, ExprType::typed(format!("field {n}"), *t, *null))
                .expect("push");
        }
        s.set_finished();
        s
    }

    #[test]
    fn roundtrips_mixed_tuple() {
        let s = schema(&[
            ("flag", ScalarType::Bool, false),
            ("count", ScalarType::U64, false),
            ("name", ScalarType::Str, true),
            ("ratio", ScalarType::Float, false),
            ("src", ScalarType::Ip4, false),
        ]);
        let t = vec![
            Value::Bool(true),
            Value::U64(0xDEAD_BEEF_CAFE),
            Value::Str("hello world".to_string()),
            Value::Float(-0.5),
            Value::Ip4(Ipv4Addr::new(192, 168, 0, 1)),
        ];
        let words = encode_tuple(&s, &t).expect("encode");
        assert_eq!(decode_tuple(&s, &words).expect("decode"), t);
    }

    #[test]
    fn nulls_survive_in_the_bitmap() {
        let s = schema(&[
            ("a", ScalarType::U32, true),
            ("b", ScalarType::Str, true),
            ("c", ScalarType::Float, false),
        ]);
        let t = vec![
            Value::Null(ScalarType::U32),
            Value::Null(ScalarType::Str),
            Value::Float(1.0),
        ];
        let words = encode_tuple(&s, &t).expect("encode");
        // bitmap + 2 float words only
        assert_eq!(words.len(), 3);
        assert_eq!(decode_tuple(&s, &words).expect("decode"), t);
    }

    #[test]
    fn empty_string_takes_one_word() {
        let s = schema(&[("s", ScalarType::Str, false)]);
        let t = vec![Value::Str(String::new())];
        let words = encode_tuple(&s, &t).expect("encode");
        assert_eq!(words.len(), 2); // bitmap + length word
        assert_eq!(decode_tuple(&s, &words).expect("decode"), t);
    }

    #[test]
    fn truncated_message_is_rejected() {
        let s = schema(&[("x", ScalarType::U64, false)]);
        let words = encode_tuple(&s, &vec![Value::U64(42)]).expect("encode");
        assert!(decode_tuple(&s, &words[..words.len() - 1]).is_err());
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        let s = schema(&[("x", ScalarType::U32, false)]);
        assert!(encode_tuple(&s, &vec![]).is_err());
    }
}
