use bytes::{BufMut, BytesMut};

use crate::error::StoreError;

/// A growing byte buffer with positional writes, used to assemble chunks
/// and serialize pages. Variable-length integers use unsigned LEB128 over
/// the raw two's-complement bits, so a negative `i32` always takes 5 bytes
/// and a negative `i64` always takes 10.
pub struct WriteBuffer {
    data: BytesMut,
}

impl WriteBuffer {
    pub fn new() -> Self {
        WriteBuffer {
            data: BytesMut::with_capacity(1024 * 1024),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        WriteBuffer {
            data: BytesMut::with_capacity(capacity),
        }
    }

    pub fn position(&self) -> usize {
        self.data.len()
    }

    pub fn limit(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> BytesMut {
        self.data
    }

    pub fn put(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    pub fn put_u8(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.data.put_u16(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.data.put_u32(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.data.put_u64(value);
    }

    pub fn put_f32(&mut self, value: f32) {
        self.data.put_f32(value);
    }

    pub fn put_f64(&mut self, value: f64) {
        self.data.put_f64(value);
    }

    pub fn put_var_int(&mut self, value: i32) {
        self.put_var_u64(value as u32 as u64);
    }

    pub fn put_var_long(&mut self, value: i64) {
        self.put_var_u64(value as u64);
    }

    pub fn put_var_u64(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.data.put_u8((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
        self.data.put_u8(value as u8);
    }

    /// Write string bytes prefixed by their varint byte length.
    pub fn put_string_data(&mut self, value: &str) {
        self.put_var_u64(value.len() as u64);
        self.data.put_slice(value.as_bytes());
    }

    /// Overwrite previously written bytes in place, for header patching.
    pub fn put_at(&mut self, position: usize, bytes: &[u8]) {
        self.data[position..position + bytes.len()].copy_from_slice(bytes);
    }

    pub fn put_u32_at(&mut self, position: usize, value: u32) {
        self.put_at(position, &value.to_be_bytes());
    }

    pub fn put_u16_at(&mut self, position: usize, value: u16) {
        self.put_at(position, &value.to_be_bytes());
    }

    /// Pad with zero bytes up to the given length.
    pub fn pad_to(&mut self, length: usize) {
        while self.data.len() < length {
            self.data.put_u8(0);
        }
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        WriteBuffer::new()
    }
}

/// Read cursor over a byte slice, the counterpart of [`WriteBuffer`].
pub struct ReadBuffer<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> ReadBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        ReadBuffer { data, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], StoreError> {
        if self.remaining() < len {
            return Err(StoreError::file_corrupt("unexpected end of page data"));
        }
        let slice = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    pub fn read(&mut self, len: usize) -> Result<&'a [u8], StoreError> {
        self.take(len)
    }

    pub fn read_u8(&mut self) -> Result<u8, StoreError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, StoreError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, StoreError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, StoreError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_f32(&mut self) -> Result<f32, StoreError> {
        Ok(f32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_f64(&mut self) -> Result<f64, StoreError> {
        Ok(f64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_var_u64(&mut self) -> Result<u64, StoreError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 64 {
                return Err(StoreError::file_corrupt("varint too long"));
            }
        }
    }

    pub fn read_var_int(&mut self) -> Result<i32, StoreError> {
        Ok(self.read_var_u64()? as u32 as i32)
    }

    pub fn read_var_long(&mut self) -> Result<i64, StoreError> {
        Ok(self.read_var_u64()? as i64)
    }

    pub fn read_string_data(&mut self) -> Result<String, StoreError> {
        let len = self.read_var_u64()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| StoreError::file_corrupt("invalid UTF-8 in string data"))
    }
}
