//! Tuple ⇄ ring-buffer-word codec.
//!
//! Ring buffers carry 32-bit words. A tuple is encoded against its
//! schema as a NULL bitmap (one bit per field, one word per 32 fields)
//! followed by each non-NULL field in schema order:
//!
//! - bool, ints up to 32 bits, ip4: one word;
//! - 64-bit ints and floats: two words, little-endian word order;
//! - 128-bit ints and ip6: four words;
//! - cidr4/cidr6: the address plus one prefix word;
//! - strings: a byte-length word, then the bytes padded to a word.
//!
//! The decoder needs the same schema the encoder used; schema identity
//! across a ring buffer is guaranteed by the signature in its file name.

use crate::error::Error;
use crate::Tuple;
use sluice_types::scalar::{ScalarType, ScalarValue};
use sluice_types::schema::TupleSchema;
use std::net::{Ipv4Addr, Ipv6Addr};

pub fn encode_tuple(schema: &TupleSchema, tuple: &Tuple) -> Result<Vec<u32>, Error> {
    debug_assert_eq!(schema.len(), tuple.len());
    let bitmap_words = schema.len().div_ceil(32).max(1);
    let mut words = vec![0u32; bitmap_words];
    for (i, value) in tuple.iter().enumerate() {
        if value.is_null() {
            words[i / 32] |= 1 << (i % 32);
            continue;
        }
        encode_value(value, &mut words)?;
    }
    Ok(words)
}

fn encode_value(value: &ScalarValue, words: &mut Vec<u32>) -> Result<(), Error> {
    match value {
        ScalarValue::Null => unreachable!("nulls are in the bitmap"),
        ScalarValue::Bool(b) => words.push(*b as u32),
        ScalarValue::U8(v) => words.push(*v as u32),
        ScalarValue::U16(v) => words.push(*v as u32),
        ScalarValue::U32(v) => words.push(*v),
        ScalarValue::I8(v) => words.push(*v as u32),
        ScalarValue::I16(v) => words.push(*v as u32),
        ScalarValue::I32(v) => words.push(*v as u32),
        ScalarValue::U64(v) => push64(words, *v),
        ScalarValue::I64(v) => push64(words, *v as u64),
        ScalarValue::Float(v) => push64(words, v.to_bits()),
        ScalarValue::U128(v) => push128(words, *v),
        ScalarValue::I128(v) => push128(words, *v as u128),
        ScalarValue::Ip4(a) => words.push(u32::from(*a)),
        ScalarValue::Ip6(a) => push128(words, u128::from(*a)),
        ScalarValue::Cidr4 { addr, prefix } => {
            words.push(u32::from(*addr));
            words.push(*prefix as u32);
        }
        ScalarValue::Cidr6 { addr, prefix } => {
            push128(words, u128::from(*addr));
            words.push(*prefix as u32);
        }
        ScalarValue::String(s) => {
            let bytes = s.as_bytes();
            if bytes.len() > u32::MAX as usize {
                return Err(Error::fatal("string too large for the wire"));
            }
            words.push(bytes.len() as u32);
            for chunk in bytes.chunks(4) {
                let mut w = [0u8; 4];
                w[..chunk.len()].copy_from_slice(chunk);
                words.push(u32::from_le_bytes(w));
            }
        }
    }
    Ok(())
}

fn push64(words: &mut Vec<u32>, v: u64) {
    words.push(v as u32);
    words.push((v >> 32) as u32);
}

fn push128(words: &mut Vec<u32>, v: u128) {
    for i in 0..4 {
        words.push((v >> (32 * i)) as u32);
    }
}

pub fn decode_tuple(schema: &TupleSchema, words: &[u32]) -> Result<Tuple, Error> {
    let bitmap_words = schema.len().div_ceil(32).max(1);
    if words.len() < bitmap_words {
        return Err(Error::fatal("truncated tuple: missing NULL bitmap"));
    }
    let mut r = Reader {
        words,
        pos: bitmap_words,
    };
    let mut tuple = Vec::with_capacity(schema.len());
    for (i, (name, field)) in schema.iter().enumerate() {
        if words[i / 32] & (1 << (i % 32)) != 0 {
            tuple.push(ScalarValue::Null);
            continue;
        }
        let typ = field.typ.scalar.ok_or_else(|| {
            Error::fatal(format!("field '{name}' has no type on the wire"))
        })?;
        tuple.push(decode_value(typ, &mut r)?);
    }
    Ok(tuple)
}

struct Reader<'a> {
    words: &'a [u32],
    pos: usize,
}

impl Reader<'_> {
    fn word(&mut self) -> Result<u32, Error> {
        let w = self
            .words
            .get(self.pos)
            .copied()
            .ok_or_else(|| Error::fatal("truncated tuple"))?;
        self.pos += 1;
        Ok(w)
    }

    fn u64(&mut self) -> Result<u64, Error> {
        let lo = self.word()? as u64;
        let hi = self.word()? as u64;
        Ok(lo | (hi << 32))
    }

    fn u128(&mut self) -> Result<u128, Error> {
        let mut v = 0u128;
        for i in 0..4 {
            v |= (self.word()? as u128) << (32 * i);
        }
        Ok(v)
    }
}

fn decode_value(typ: ScalarType, r: &mut Reader) -> Result<ScalarValue, Error> {
    Ok(match typ {
        ScalarType::Bool => ScalarValue::Bool(r.word()? != 0),
        ScalarType::U8 => ScalarValue::U8(r.word()? as u8),
        ScalarType::U16 => ScalarValue::U16(r.word()? as u16),
        ScalarType::U32 => ScalarValue::U32(r.word()?),
        ScalarType::I8 => ScalarValue::I8(r.word()? as i8),
        ScalarType::I16 => ScalarValue::I16(r.word()? as i16),
        ScalarType::I32 => ScalarValue::I32(r.word()? as i32),
        ScalarType::U64 => ScalarValue::U64(r.u64()?),
        ScalarType::I64 => ScalarValue::I64(r.u64()? as i64),
        ScalarType::Float => ScalarValue::Float(f64::from_bits(r.u64()?)),
        ScalarType::U128 => ScalarValue::U128(r.u128()?),
        ScalarType::I128 => ScalarValue::I128(r.u128()? as i128),
        ScalarType::Ip4 => ScalarValue::Ip4(Ipv4Addr::from(r.word()?)),
        ScalarType::Ip6 => ScalarValue::Ip6(Ipv6Addr::from(r.u128()?)),
        ScalarType::Cidr4 => {
            let addr = Ipv4Addr::from(r.word()?);
            let prefix = r.word()? as u8;
            ScalarValue::Cidr4 { addr, prefix }
        }
        ScalarType::Cidr6 => {
            let addr = Ipv6Addr::from(r.u128()?);
            let prefix = r.word()? as u8;
            ScalarValue::Cidr6 { addr, prefix }
        }
        ScalarType::String => {
            let len = r.word()? as usize;
            let mut bytes = Vec::with_capacity(len);
            let mut remaining = len;
            while remaining > 0 {
                let w = r.word()?.to_le_bytes();
                let take = remaining.min(4);
                bytes.extend_from_slice(&w[..take]);
                remaining -= take;
            }
            ScalarValue::String(
                String::from_utf8(bytes)
                    .map_err(|_| Error::fatal("invalid UTF-8 on the wire"))?,
            )
        }
        ScalarType::Num | ScalarType::Any => {
            return Err(Error::fatal("abstract type on the wire"))
        }
    })
}

/// Encode the values produced by GROUP BY expressions into a stable key.
pub fn encode_key(values: &[ScalarValue]) -> Vec<u32> {
    let mut words = vec![0u32; values.len().div_ceil(32).max(1)];
    for (i, v) in values.iter().enumerate() {
        if v.is_null() {
            words[i / 32] |= 1 << (i % 32);
        } else {
            encode_value(v, &mut words).expect("key values are small");
        }
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_types::expr::ExprType;
    use sluice_types::schema::Field;

    fn schema(fields: &[(&str, ScalarType, bool)]) -> TupleSchema {
        let mut s = TupleSchema::new();
        for (name, typ, nullable) in fields {
            s.add(
                name,
                Field {
                    rank: None,
                    typ: ExprType::make(*name, Some(*typ), Some(*nullable)),
                },
            )
            .unwrap();
        }
        s.finished = true;
        s
    }

    #[test]
    fn round_trip_mixed_tuple() {
        let s = schema(&[
            ("host", ScalarType::String, false),
            ("time", ScalarType::Float, false),
            ("plugin", ScalarType::String, true),
            ("n", ScalarType::U64, false),
            ("flag", ScalarType::Bool, false),
            ("addr", ScalarType::Ip4, false),
            ("net", ScalarType::Cidr6, false),
            ("big", ScalarType::I128, false),
        ]);
        let t: Tuple = vec![
            ScalarValue::String("box-1".into()),
            ScalarValue::Float(1234.5),
            ScalarValue::Null,
            ScalarValue::U64(u64::MAX - 7),
            ScalarValue::Bool(true),
            ScalarValue::Ip4("192.168.1.2".parse().unwrap()),
            ScalarValue::Cidr6 {
                addr: "fe80::1".parse().unwrap(),
                prefix: 64,
            },
            ScalarValue::I128(-1),
        ];
        let words = encode_tuple(&s, &t).unwrap();
        assert_eq!(decode_tuple(&s, &words).unwrap(), t);
    }

    #[test]
    fn empty_and_all_null_tuples() {
        let s = schema(&[
            ("a", ScalarType::String, true),
            ("b", ScalarType::Float, true),
        ]);
        let t: Tuple = vec![ScalarValue::Null, ScalarValue::Null];
        let words = encode_tuple(&s, &t).unwrap();
        assert_eq!(words.len(), 1); // just the bitmap
        assert_eq!(decode_tuple(&s, &words).unwrap(), t);
    }

    #[test]
    fn string_padding_does_not_leak() {
        let s = schema(&[("s", ScalarType::String, false)]);
        for input in ["", "a", "ab", "abc", "abcd", "abcde"] {
            let t: Tuple = vec![ScalarValue::String(input.into())];
            let words = encode_tuple(&s, &t).unwrap();
            assert_eq!(decode_tuple(&s, &words).unwrap(), t, "{input:?}");
        }
    }

    #[test]
    fn keys_discriminate() {
        let a = encode_key(&[ScalarValue::String("hello".into())]);
        let b = encode_key(&[ScalarValue::String("world".into())]);
        let n = encode_key(&[ScalarValue::Null]);
        assert_ne!(a, b);
        assert_ne!(a, n);
        assert_eq!(a, encode_key(&[ScalarValue::String("hello".into())]));
    }
}
