//! Decoder primitives: extract typed scalars from raw protocol payloads.
//!
//! Every decoder is a small value type bound at init with its offset and
//! flags. Register payloads are sequences of 16-bit words; byte-buffer
//! payloads (PLC tag reads) are addressed by byte offset with explicit
//! little-endian layout.

use byteorder::{ByteOrder, LittleEndian};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::proto::Payload;
use crate::types::{parse_int_literal, DataType, Value};

/// Offset as written in a pull configuration: a plain index, or a string
/// with an optional `=` prefix (absolute register address) and an optional
/// `/bit` suffix.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OffsetSpec {
    Index(i64),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegOffset {
    pub offset: usize,
    pub bit: Option<u8>,
}

impl OffsetSpec {
    /// Resolve against the pull's base register address (`=` offsets are
    /// absolute and get the base subtracted).
    pub fn resolve(&self, base_addr: u16) -> Result<RegOffset> {
        let (offset, bit) = match self {
            OffsetSpec::Index(i) => (*i, None),
            OffsetSpec::Text(s) => {
                let (addr_part, bit) = match s.split_once('/') {
                    Some((a, b)) => (a, Some(parse_int_literal(b)?)),
                    None => (s.as_str(), None),
                };
                let offset = match addr_part.strip_prefix('=') {
                    Some(abs) => parse_int_literal(abs)? - i64::from(base_addr),
                    None => parse_int_literal(addr_part)?,
                };
                (offset, bit)
            }
        };
        if offset < 0 {
            return Err(Error::config(format!("offset is negative: {self:?}")));
        }
        let bit = match bit {
            Some(b) if !(0..16).contains(&b) => {
                return Err(Error::config(format!("bit index out of range: {b}")))
            }
            Some(b) => Some(b as u8),
            None => None,
        };
        Ok(RegOffset {
            offset: offset as usize,
            bit,
        })
    }

    /// Resolve as a plain byte offset (tag payloads have no bit or
    /// absolute forms).
    pub fn resolve_byte(&self) -> Result<usize> {
        let offset = match self {
            OffsetSpec::Index(i) => *i,
            OffsetSpec::Text(s) => parse_int_literal(s)?,
        };
        if offset < 0 {
            return Err(Error::config(format!("offset is negative: {self:?}")));
        }
        Ok(offset as usize)
    }
}

/// A bound extraction from one payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoder {
    /// Single bit of a 16-bit register.
    RegBit { offset: usize, bit: u8 },
    RegU16 { offset: usize },
    RegI16 { offset: usize },
    /// Register pair in `(high16, low16)` order.
    RegU32 { offset: usize },
    RegI32 { offset: usize },
    /// Register pair packed low-word-first as little-endian bytes and read
    /// as an IEEE-754 single: `[lo(r0), hi(r0), lo(r1), hi(r1)]`.
    RegF32 { offset: usize },
    /// One coil / discrete input.
    Flag { offset: usize },
    ByteU8 { offset: usize },
    ByteI8 { offset: usize },
    ByteU16 { offset: usize },
    ByteI16 { offset: usize },
    ByteU32 { offset: usize },
    ByteI32 { offset: usize },
    ByteU64 { offset: usize },
    ByteI64 { offset: usize },
    ByteF32 { offset: usize },
    ByteF64 { offset: usize },
}

impl Decoder {
    pub fn data_type(&self) -> DataType {
        match self {
            Decoder::RegBit { .. } | Decoder::Flag { .. } => DataType::Bit,
            Decoder::RegU16 { .. } | Decoder::ByteU16 { .. } => DataType::UInt16,
            Decoder::RegI16 { .. } | Decoder::ByteI16 { .. } => DataType::Int16,
            Decoder::RegU32 { .. } | Decoder::ByteU32 { .. } => DataType::UInt32,
            Decoder::RegI32 { .. } | Decoder::ByteI32 { .. } => DataType::Int32,
            Decoder::RegF32 { .. } | Decoder::ByteF32 { .. } => DataType::Real32,
            Decoder::ByteU8 { .. } => DataType::UInt8,
            Decoder::ByteI8 { .. } => DataType::Int8,
            Decoder::ByteU64 { .. } => DataType::UInt64,
            Decoder::ByteI64 { .. } => DataType::Int64,
            Decoder::ByteF64 { .. } => DataType::Real64,
        }
    }

    /// Number of registers consumed by a register decoder, or bytes by a
    /// byte decoder; used for init-time range validation.
    pub fn span(&self) -> usize {
        match self {
            Decoder::RegBit { .. }
            | Decoder::RegU16 { .. }
            | Decoder::RegI16 { .. }
            | Decoder::Flag { .. }
            | Decoder::ByteU8 { .. }
            | Decoder::ByteI8 { .. } => 1,
            Decoder::RegU32 { .. }
            | Decoder::RegI32 { .. }
            | Decoder::RegF32 { .. }
            | Decoder::ByteU16 { .. }
            | Decoder::ByteI16 { .. } => 2,
            Decoder::ByteU32 { .. } | Decoder::ByteI32 { .. } | Decoder::ByteF32 { .. } => 4,
            Decoder::ByteU64 { .. } | Decoder::ByteI64 { .. } | Decoder::ByteF64 { .. } => 8,
        }
    }

    pub fn offset(&self) -> usize {
        match self {
            Decoder::RegBit { offset, .. }
            | Decoder::RegU16 { offset }
            | Decoder::RegI16 { offset }
            | Decoder::RegU32 { offset }
            | Decoder::RegI32 { offset }
            | Decoder::RegF32 { offset }
            | Decoder::Flag { offset }
            | Decoder::ByteU8 { offset }
            | Decoder::ByteI8 { offset }
            | Decoder::ByteU16 { offset }
            | Decoder::ByteI16 { offset }
            | Decoder::ByteU32 { offset }
            | Decoder::ByteI32 { offset }
            | Decoder::ByteU64 { offset }
            | Decoder::ByteI64 { offset }
            | Decoder::ByteF32 { offset }
            | Decoder::ByteF64 { offset } => *offset,
        }
    }

    pub fn apply(&self, payload: &Payload) -> Result<Value> {
        match (self, payload) {
            (Decoder::RegBit { offset, bit }, Payload::Registers(regs)) => {
                let reg = reg_at(regs, *offset)?;
                Ok(Value::Bool((reg >> bit) & 1 == 1))
            }
            (Decoder::RegU16 { offset }, Payload::Registers(regs)) => {
                Ok(Value::Int(i64::from(reg_at(regs, *offset)?)))
            }
            (Decoder::RegI16 { offset }, Payload::Registers(regs)) => {
                let mut v = i64::from(reg_at(regs, *offset)?);
                if v > 32767 {
                    v -= 65536;
                }
                Ok(Value::Int(v))
            }
            (Decoder::RegU32 { offset }, Payload::Registers(regs)) => {
                let hi = i64::from(reg_at(regs, *offset)?);
                let lo = i64::from(reg_at(regs, *offset + 1)?);
                Ok(Value::Int(hi * 65536 + lo))
            }
            (Decoder::RegI32 { offset }, Payload::Registers(regs)) => {
                let hi = i64::from(reg_at(regs, *offset)?);
                let lo = i64::from(reg_at(regs, *offset + 1)?);
                let mut v = hi * 65536 + lo;
                if v > 2147483647 {
                    v -= 4294967296;
                }
                Ok(Value::Int(v))
            }
            (Decoder::RegF32 { offset }, Payload::Registers(regs)) => {
                let r0 = reg_at(regs, *offset)?;
                let r1 = reg_at(regs, *offset + 1)?;
                let mut bytes = [0u8; 4];
                LittleEndian::write_u16(&mut bytes[0..2], r0);
                LittleEndian::write_u16(&mut bytes[2..4], r1);
                Ok(Value::Float(f64::from(LittleEndian::read_f32(&bytes))))
            }
            (Decoder::Flag { offset }, Payload::Bits(bits)) => {
                let b = bits.get(*offset).copied().ok_or_else(|| {
                    Error::process(format!("bit offset {offset} out of payload range"))
                })?;
                Ok(Value::Bool(b))
            }
            (Decoder::ByteU8 { offset }, Payload::TagData(buf)) => {
                Ok(Value::Int(i64::from(*byte_at(buf, *offset)?)))
            }
            (Decoder::ByteI8 { offset }, Payload::TagData(buf)) => {
                Ok(Value::Int(i64::from(*byte_at(buf, *offset)? as i8)))
            }
            (Decoder::ByteU16 { offset }, Payload::TagData(buf)) => {
                Ok(Value::Int(i64::from(LittleEndian::read_u16(bytes_at(
                    buf, *offset, 2,
                )?))))
            }
            (Decoder::ByteI16 { offset }, Payload::TagData(buf)) => {
                Ok(Value::Int(i64::from(LittleEndian::read_i16(bytes_at(
                    buf, *offset, 2,
                )?))))
            }
            (Decoder::ByteU32 { offset }, Payload::TagData(buf)) => {
                Ok(Value::Int(i64::from(LittleEndian::read_u32(bytes_at(
                    buf, *offset, 4,
                )?))))
            }
            (Decoder::ByteI32 { offset }, Payload::TagData(buf)) => {
                Ok(Value::Int(i64::from(LittleEndian::read_i32(bytes_at(
                    buf, *offset, 4,
                )?))))
            }
            (Decoder::ByteU64 { offset }, Payload::TagData(buf)) => {
                Ok(Value::UInt(LittleEndian::read_u64(bytes_at(buf, *offset, 8)?)))
            }
            (Decoder::ByteI64 { offset }, Payload::TagData(buf)) => {
                Ok(Value::Int(LittleEndian::read_i64(bytes_at(buf, *offset, 8)?)))
            }
            (Decoder::ByteF32 { offset }, Payload::TagData(buf)) => {
                Ok(Value::Float(f64::from(LittleEndian::read_f32(bytes_at(
                    buf, *offset, 4,
                )?))))
            }
            (Decoder::ByteF64 { offset }, Payload::TagData(buf)) => {
                Ok(Value::Float(LittleEndian::read_f64(bytes_at(buf, *offset, 8)?)))
            }
            _ => Err(Error::process(
                "decoder bound to a different payload kind".to_string(),
            )),
        }
    }
}

fn reg_at(regs: &[u16], offset: usize) -> Result<u16> {
    regs.get(offset).copied().ok_or_else(|| {
        Error::process(format!("register offset {offset} out of payload range"))
    })
}

fn byte_at(buf: &[u8], offset: usize) -> Result<&u8> {
    buf.get(offset)
        .ok_or_else(|| Error::process(format!("byte offset {offset} out of payload range")))
}

fn bytes_at(buf: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    buf.get(offset..offset + len)
        .ok_or_else(|| Error::process(format!("byte offset {offset} out of payload range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regs(v: &[u16]) -> Payload {
        Payload::Registers(v.to_vec())
    }

    #[test]
    fn bit_extraction() {
        let p = regs(&[0x0005]);
        assert_eq!(
            Decoder::RegBit { offset: 0, bit: 0 }.apply(&p).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            Decoder::RegBit { offset: 0, bit: 1 }.apply(&p).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            Decoder::RegBit { offset: 0, bit: 2 }.apply(&p).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn int16_two_complement_recovery() {
        let p = regs(&[0xFFFE]);
        assert_eq!(
            Decoder::RegI16 { offset: 0 }.apply(&p).unwrap(),
            Value::Int(-2)
        );
        assert_eq!(
            Decoder::RegU16 { offset: 0 }.apply(&p).unwrap(),
            Value::Int(65534)
        );
        let p = regs(&[32767]);
        assert_eq!(
            Decoder::RegI16 { offset: 0 }.apply(&p).unwrap(),
            Value::Int(32767)
        );
    }

    #[test]
    fn int32_from_register_pair() {
        let p = regs(&[0xFFFF, 0xFFFE]);
        assert_eq!(
            Decoder::RegI32 { offset: 0 }.apply(&p).unwrap(),
            Value::Int(-2)
        );
        assert_eq!(
            Decoder::RegU32 { offset: 0 }.apply(&p).unwrap(),
            Value::Int(4294967294)
        );
        let p = regs(&[0x0001, 0x0000]);
        assert_eq!(
            Decoder::RegU32 { offset: 0 }.apply(&p).unwrap(),
            Value::Int(65536)
        );
    }

    #[test]
    fn real32_packs_low_word_first() {
        // pi = 0x40490FDB; the low word leads under the documented order.
        let p = regs(&[0x0FDB, 0x4049]);
        let v = Decoder::RegF32 { offset: 0 }.apply(&p).unwrap();
        let expected = f64::from(f32::from_bits(0x40490FDB));
        match v {
            Value::Float(f) => {
                assert!((f - expected).abs() < 1e-12);
                assert!((f - 3.14159).abs() < 1e-4);
            }
            other => panic!("expected float, got {other:?}"),
        }
    }

    #[test]
    fn tag_buffer_accessors() {
        let p = Payload::TagData(vec![0xFE, 0xFF, 0xDB, 0x0F, 0x49, 0x40]);
        assert_eq!(
            Decoder::ByteI16 { offset: 0 }.apply(&p).unwrap(),
            Value::Int(-2)
        );
        assert_eq!(
            Decoder::ByteU8 { offset: 1 }.apply(&p).unwrap(),
            Value::Int(255)
        );
        match (Decoder::ByteF32 { offset: 2 }).apply(&p).unwrap() {
            Value::Float(f) => assert!((f - 3.14159).abs() < 1e-4),
            other => panic!("expected float, got {other:?}"),
        }
    }

    #[test]
    fn int64_accessors() {
        let p = Payload::TagData((-2i64).to_le_bytes().to_vec());
        assert_eq!(
            Decoder::ByteI64 { offset: 0 }.apply(&p).unwrap(),
            Value::Int(-2)
        );
        assert_eq!(
            Decoder::ByteU64 { offset: 0 }.apply(&p).unwrap(),
            Value::UInt(u64::MAX - 1)
        );
    }

    #[test]
    fn out_of_range_offset_errors() {
        let p = regs(&[1]);
        assert!(Decoder::RegU32 { offset: 0 }.apply(&p).is_err());
        assert!(Decoder::RegU16 { offset: 3 }.apply(&p).is_err());
    }

    #[test]
    fn offset_spec_forms() {
        let r = OffsetSpec::Index(2).resolve(1000).unwrap();
        assert_eq!(r, RegOffset { offset: 2, bit: None });

        let r = OffsetSpec::Text("=1002".into()).resolve(1000).unwrap();
        assert_eq!(r, RegOffset { offset: 2, bit: None });

        let r = OffsetSpec::Text("3/2".into()).resolve(1000).unwrap();
        assert_eq!(r, RegOffset { offset: 3, bit: Some(2) });

        let r = OffsetSpec::Text("=0x3EA/15".into()).resolve(1000).unwrap();
        assert_eq!(r, RegOffset { offset: 2, bit: Some(15) });

        assert!(OffsetSpec::Text("=999".into()).resolve(1000).is_err());
        assert!(OffsetSpec::Text("1/16".into()).resolve(0).is_err());
    }
}
