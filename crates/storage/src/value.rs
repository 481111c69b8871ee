use std::cmp::Ordering;

use crate::error::StoreError;
use crate::write_buffer::{ReadBuffer, WriteBuffer};

/// Tagged union over the domain value kinds the engine can store in rows
/// and index keys. The wire encoding uses compact opcodes for the common
/// cases; all opcodes live in the stable 0..139 range and unknown opcodes
/// are treated as corruption.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    /// Milliseconds since the epoch.
    Timestamp(i64),
    Uuid(u128),
    /// Range sentinel ordering below every other value.
    Min,
    /// Range sentinel ordering above every other value.
    Max,
}

const TAG_NULL: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_BYTE: u8 = 3;
const TAG_SHORT: u8 = 4;
const TAG_INT: u8 = 5;
const TAG_LONG: u8 = 6;
const TAG_FLOAT: u8 = 7;
const TAG_DOUBLE: u8 = 8;
const TAG_FLOAT_0: u8 = 9;
const TAG_FLOAT_1: u8 = 10;
const TAG_DOUBLE_0: u8 = 11;
const TAG_DOUBLE_1: u8 = 12;
const TAG_STRING: u8 = 13;
const TAG_BYTES: u8 = 14;
const TAG_ARRAY: u8 = 15;
const TAG_TIMESTAMP: u8 = 16;
const TAG_UUID: u8 = 17;
const TAG_MIN: u8 = 18;
const TAG_MAX: u8 = 19;
const TAG_INT_0: u8 = 32; // 32..=47 encode the ints 0..15
const TAG_LONG_0: u8 = 48; // 48..=55 encode the longs 0..7
const TAG_STRING_0: u8 = 64; // 64..=95 encode strings of 0..=31 bytes
const TAG_BYTES_0: u8 = 96; // 96..=127 encode byte arrays of 0..=31 bytes

impl Value {
    /// Rank used to order values of different kinds; within a kind the
    /// natural order applies.
    fn type_rank(&self) -> u8 {
        match self {
            Value::Min => 0,
            Value::Null => 1,
            Value::Boolean(_) => 2,
            Value::Byte(_) => 3,
            Value::Short(_) => 4,
            Value::Int(_) => 5,
            Value::Long(_) => 6,
            Value::Float(_) => 7,
            Value::Double(_) => 8,
            Value::Timestamp(_) => 9,
            Value::Uuid(_) => 10,
            Value::String(_) => 11,
            Value::Bytes(_) => 12,
            Value::Array(_) => 13,
            Value::Max => 14,
        }
    }

    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Byte(a), Value::Byte(b)) => a.cmp(b),
            (Value::Short(a), Value::Short(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Long(a), Value::Long(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Uuid(a), Value::Uuid(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.compare(y) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    /// Rough in-memory size estimate, used for page split decisions and
    /// cache weights.
    pub fn memory(&self) -> u32 {
        match self {
            Value::Null | Value::Min | Value::Max => 8,
            Value::Boolean(_) | Value::Byte(_) => 16,
            Value::Short(_) | Value::Int(_) | Value::Float(_) => 16,
            Value::Long(_) | Value::Double(_) | Value::Timestamp(_) => 24,
            Value::Uuid(_) => 32,
            Value::String(s) => 24 + s.len() as u32 * 2,
            Value::Bytes(b) => 24 + b.len() as u32,
            Value::Array(values) => {
                24 + values.iter().map(Value::memory).sum::<u32>()
            }
        }
    }

    pub fn write(&self, buf: &mut WriteBuffer) {
        match self {
            Value::Null => buf.put_u8(TAG_NULL),
            Value::Boolean(false) => buf.put_u8(TAG_FALSE),
            Value::Boolean(true) => buf.put_u8(TAG_TRUE),
            Value::Byte(v) => {
                buf.put_u8(TAG_BYTE);
                buf.put_u8(*v as u8);
            }
            Value::Short(v) => {
                buf.put_u8(TAG_SHORT);
                buf.put_u16(*v as u16);
            }
            Value::Int(v) => {
                if (0..16).contains(v) {
                    buf.put_u8(TAG_INT_0 + *v as u8);
                } else {
                    buf.put_u8(TAG_INT);
                    buf.put_var_int(*v);
                }
            }
            Value::Long(v) => {
                if (0..8).contains(v) {
                    buf.put_u8(TAG_LONG_0 + *v as u8);
                } else {
                    buf.put_u8(TAG_LONG);
                    buf.put_var_long(*v);
                }
            }
            Value::Float(v) => {
                if *v == 0.0 && v.is_sign_positive() {
                    buf.put_u8(TAG_FLOAT_0);
                } else if *v == 1.0 {
                    buf.put_u8(TAG_FLOAT_1);
                } else {
                    buf.put_u8(TAG_FLOAT);
                    buf.put_f32(*v);
                }
            }
            Value::Double(v) => {
                if *v == 0.0 && v.is_sign_positive() {
                    buf.put_u8(TAG_DOUBLE_0);
                } else if *v == 1.0 {
                    buf.put_u8(TAG_DOUBLE_1);
                } else {
                    buf.put_u8(TAG_DOUBLE);
                    buf.put_f64(*v);
                }
            }
            Value::String(s) => {
                if s.len() <= 31 {
                    buf.put_u8(TAG_STRING_0 + s.len() as u8);
                    buf.put(s.as_bytes());
                } else {
                    buf.put_u8(TAG_STRING);
                    buf.put_string_data(s);
                }
            }
            Value::Bytes(b) => {
                if b.len() <= 31 {
                    buf.put_u8(TAG_BYTES_0 + b.len() as u8);
                    buf.put(b);
                } else {
                    buf.put_u8(TAG_BYTES);
                    buf.put_var_u64(b.len() as u64);
                    buf.put(b);
                }
            }
            Value::Array(values) => {
                buf.put_u8(TAG_ARRAY);
                buf.put_var_u64(values.len() as u64);
                for value in values {
                    value.write(buf);
                }
            }
            Value::Timestamp(v) => {
                buf.put_u8(TAG_TIMESTAMP);
                buf.put_var_long(*v);
            }
            Value::Uuid(v) => {
                buf.put_u8(TAG_UUID);
                buf.put(&v.to_be_bytes());
            }
            Value::Min => buf.put_u8(TAG_MIN),
            Value::Max => buf.put_u8(TAG_MAX),
        }
    }

    pub fn read(buf: &mut ReadBuffer<'_>) -> Result<Value, StoreError> {
        let tag = buf.read_u8()?;
        let value = match tag {
            TAG_NULL => Value::Null,
            TAG_FALSE => Value::Boolean(false),
            TAG_TRUE => Value::Boolean(true),
            TAG_BYTE => Value::Byte(buf.read_u8()? as i8),
            TAG_SHORT => Value::Short(buf.read_u16()? as i16),
            TAG_INT => Value::Int(buf.read_var_int()?),
            TAG_LONG => Value::Long(buf.read_var_long()?),
            TAG_FLOAT => Value::Float(buf.read_f32()?),
            TAG_DOUBLE => Value::Double(buf.read_f64()?),
            TAG_FLOAT_0 => Value::Float(0.0),
            TAG_FLOAT_1 => Value::Float(1.0),
            TAG_DOUBLE_0 => Value::Double(0.0),
            TAG_DOUBLE_1 => Value::Double(1.0),
            TAG_STRING => Value::String(buf.read_string_data()?),
            TAG_BYTES => {
                let len = buf.read_var_u64()? as usize;
                Value::Bytes(buf.read(len)?.to_vec())
            }
            TAG_ARRAY => {
                let count = buf.read_var_u64()? as usize;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(Value::read(buf)?);
                }
                Value::Array(values)
            }
            TAG_TIMESTAMP => Value::Timestamp(buf.read_var_long()?),
            TAG_UUID => Value::Uuid(u128::from_be_bytes(buf.read(16)?.try_into().unwrap())),
            TAG_MIN => Value::Min,
            TAG_MAX => Value::Max,
            t if (TAG_INT_0..TAG_INT_0 + 16).contains(&t) => Value::Int((t - TAG_INT_0) as i32),
            t if (TAG_LONG_0..TAG_LONG_0 + 8).contains(&t) => Value::Long((t - TAG_LONG_0) as i64),
            t if (TAG_STRING_0..=TAG_STRING_0 + 31).contains(&t) => {
                let len = (t - TAG_STRING_0) as usize;
                let bytes = buf.read(len)?.to_vec();
                Value::String(
                    String::from_utf8(bytes)
                        .map_err(|_| StoreError::file_corrupt("invalid UTF-8 in string value"))?,
                )
            }
            t if (TAG_BYTES_0..=TAG_BYTES_0 + 31).contains(&t) => {
                let len = (t - TAG_BYTES_0) as usize;
                Value::Bytes(buf.read(len)?.to_vec())
            }
            t => {
                return Err(StoreError::file_corrupt(format!(
                    "unknown value opcode {t}"
                )));
            }
        };
        Ok(value)
    }
}
