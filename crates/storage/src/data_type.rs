use std::cmp::Ordering;

use crate::error::StoreError;
use crate::value::Value;
use crate::write_buffer::{ReadBuffer, WriteBuffer};

/// Capability interface for the key and value encodings a map is built on:
/// ordering, memory estimation, and wire codec. Built-in implementations
/// cover the encodings the engine itself needs; callers can bring their own.
pub trait DataType<T>: Send + Sync {
    fn compare(&self, a: &T, b: &T) -> Ordering;

    /// In-memory size estimate in bytes, for page split decisions and
    /// cache weights.
    fn memory(&self, value: &T) -> u32;

    fn write(&self, buf: &mut WriteBuffer, value: &T);

    fn read(&self, buf: &mut ReadBuffer<'_>) -> Result<T, StoreError>;
}

/// Signed 64-bit keys, stored as varlongs.
pub struct LongType;

impl DataType<i64> for LongType {
    fn compare(&self, a: &i64, b: &i64) -> Ordering {
        a.cmp(b)
    }

    fn memory(&self, _value: &i64) -> u32 {
        24
    }

    fn write(&self, buf: &mut WriteBuffer, value: &i64) {
        buf.put_var_long(*value);
    }

    fn read(&self, buf: &mut ReadBuffer<'_>) -> Result<i64, StoreError> {
        buf.read_var_long()
    }
}

/// UTF-8 strings, length-prefixed. The layout and meta maps use this for
/// both keys and values.
pub struct StringType;

impl DataType<String> for StringType {
    fn compare(&self, a: &String, b: &String) -> Ordering {
        a.cmp(b)
    }

    fn memory(&self, value: &String) -> u32 {
        24 + value.len() as u32 * 2
    }

    fn write(&self, buf: &mut WriteBuffer, value: &String) {
        buf.put_string_data(value);
    }

    fn read(&self, buf: &mut ReadBuffer<'_>) -> Result<String, StoreError> {
        buf.read_string_data()
    }
}

/// Opaque byte strings, length-prefixed, ordered lexicographically.
pub struct BytesType;

impl DataType<Vec<u8>> for BytesType {
    fn compare(&self, a: &Vec<u8>, b: &Vec<u8>) -> Ordering {
        a.cmp(b)
    }

    fn memory(&self, value: &Vec<u8>) -> u32 {
        24 + value.len() as u32
    }

    fn write(&self, buf: &mut WriteBuffer, value: &Vec<u8>) {
        buf.put_var_u64(value.len() as u64);
        buf.put(value);
    }

    fn read(&self, buf: &mut ReadBuffer<'_>) -> Result<Vec<u8>, StoreError> {
        let len = buf.read_var_u64()? as usize;
        Ok(buf.read(len)?.to_vec())
    }
}

/// A single tagged [`Value`].
pub struct ValueType;

impl DataType<Value> for ValueType {
    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        a.compare(b)
    }

    fn memory(&self, value: &Value) -> u32 {
        value.memory()
    }

    fn write(&self, buf: &mut WriteBuffer, value: &Value) {
        value.write(buf);
    }

    fn read(&self, buf: &mut ReadBuffer<'_>) -> Result<Value, StoreError> {
        Value::read(buf)
    }
}

/// Value tuples, compared field by field. Composite index keys use this;
/// the `Min`/`Max` sentinels inside a tuple make open-ended range bounds
/// expressible without a separate bound type.
pub struct ValueArrayType;

impl DataType<Vec<Value>> for ValueArrayType {
    fn compare(&self, a: &Vec<Value>, b: &Vec<Value>) -> Ordering {
        for (x, y) in a.iter().zip(b.iter()) {
            match x.compare(y) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        a.len().cmp(&b.len())
    }

    fn memory(&self, value: &Vec<Value>) -> u32 {
        24 + value.iter().map(Value::memory).sum::<u32>()
    }

    fn write(&self, buf: &mut WriteBuffer, value: &Vec<Value>) {
        buf.put_var_u64(value.len() as u64);
        for item in value {
            item.write(buf);
        }
    }

    fn read(&self, buf: &mut ReadBuffer<'_>) -> Result<Vec<Value>, StoreError> {
        let count = buf.read_var_u64()? as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(Value::read(buf)?);
        }
        Ok(values)
    }
}

/// Unsigned 64-bit values stored big-endian; used for page positions and
/// other fixed-width internals.
pub struct U64Type;

impl DataType<u64> for U64Type {
    fn compare(&self, a: &u64, b: &u64) -> Ordering {
        a.cmp(b)
    }

    fn memory(&self, _value: &u64) -> u32 {
        16
    }

    fn write(&self, buf: &mut WriteBuffer, value: &u64) {
        buf.put_u64(*value);
    }

    fn read(&self, buf: &mut ReadBuffer<'_>) -> Result<u64, StoreError> {
        buf.read_u64()
    }
}
