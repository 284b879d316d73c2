//! # Binary Reader/Writer
//!
//! Primitive encoders used by message payloads.
//!
//! Every multi-byte value is little-endian. Variable-length values
//! (strings, byte blocks, lists, serde values) carry a `u32` length prefix.
//!
//! ## Security
//! - Reads never panic: running past the end of the payload is an error
//! - Declared lengths are checked against the remaining bytes before allocating

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{constants, ProtocolError, Result};

/// Recursive composite-object contract.
///
/// Message types implement this, and so can any nested structure written with
/// [`MessageWriter::write_object`] / [`MessageWriter::write_list`].
pub trait Serializable: Sized {
    /// Write the fields of `self`.
    fn write_to(&self, writer: &mut MessageWriter) -> Result<()>;

    /// Read a value previously written with [`Serializable::write_to`].
    fn read_from(reader: &mut MessageReader<'_>) -> Result<Self>;
}

/// Appends primitives to a growable buffer.
#[derive(Debug, Default)]
pub struct MessageWriter {
    buf: BytesMut,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Write into an existing buffer; bytes already in it are kept.
    pub fn from_buffer(buf: BytesMut) -> Self {
        Self { buf }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> BytesMut {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.buf.put_i8(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.put_u16_le(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buf.put_i16_le(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.put_f32_le(value);
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64_le(value);
    }

    /// Length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Length-prefixed byte block.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        let len = u32::try_from(value.len()).map_err(|_| {
            ProtocolError::SerializeError(format!("block of {} bytes is too long", value.len()))
        })?;
        self.buf.put_u32_le(len);
        self.buf.put_slice(value);
        Ok(())
    }

    /// Nested composite object, written inline without a length prefix.
    pub fn write_object<T: Serializable>(&mut self, value: &T) -> Result<()> {
        value.write_to(self)
    }

    /// Count-prefixed list of composite objects.
    pub fn write_list<T: Serializable>(&mut self, values: &[T]) -> Result<()> {
        let count = u32::try_from(values.len()).map_err(|_| {
            ProtocolError::SerializeError(format!("list of {} items is too long", values.len()))
        })?;
        self.buf.put_u32_le(count);
        for value in values {
            value.write_to(self)?;
        }
        Ok(())
    }

    /// Any serde value, encoded with bincode and length-prefixed.
    pub fn write_value<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let encoded = bincode::serialize(value)?;
        self.write_bytes(&encoded)
    }
}

/// Reads primitives from a borrowed payload.
#[derive(Debug)]
pub struct MessageReader<'a> {
    buf: &'a [u8],
}

impl<'a> MessageReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    fn ensure(&self, needed: usize) -> Result<()> {
        if self.buf.len() < needed {
            return Err(ProtocolError::DeserializeError(format!(
                "{} (needed {needed} bytes, {} left)",
                constants::ERR_UNEXPECTED_EOF,
                self.buf.len()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.ensure(1)?;
        Ok(self.buf.get_i8())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::DeserializeError(format!(
                "invalid bool byte {other:#04x}"
            ))),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.ensure(2)?;
        Ok(self.buf.get_i16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure(8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.ensure(4)?;
        Ok(self.buf.get_f32_le())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.ensure(8)?;
        Ok(self.buf.get_f64_le())
    }

    /// Borrow a length-prefixed byte block without copying.
    pub fn read_slice(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.ensure(len)?;
        let (block, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(block)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        self.read_slice().map(<[u8]>::to_vec)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let block = self.read_slice()?;
        std::str::from_utf8(block)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::DeserializeError(constants::ERR_INVALID_UTF8.into()))
    }

    pub fn read_object<T: Serializable>(&mut self) -> Result<T> {
        T::read_from(self)
    }

    pub fn read_list<T: Serializable>(&mut self) -> Result<Vec<T>> {
        let count = self.read_u32()? as usize;
        // Every item takes at least one byte, so a larger count is a lie.
        self.ensure(count.min(self.buf.len().saturating_add(1)))?;
        let mut items = Vec::with_capacity(count.min(self.buf.len()));
        for _ in 0..count {
            items.push(T::read_from(self)?);
        }
        Ok(items)
    }

    pub fn read_value<T: DeserializeOwned>(&mut self) -> Result<T> {
        let block = self.read_slice()?;
        Ok(bincode::deserialize(block)?)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[derive(Debug, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    impl Serializable for Point {
        fn write_to(&self, writer: &mut MessageWriter) -> Result<()> {
            writer.write_i32(self.x);
            writer.write_i32(self.y);
            Ok(())
        }

        fn read_from(reader: &mut MessageReader<'_>) -> Result<Self> {
            Ok(Self {
                x: reader.read_i32()?,
                y: reader.read_i32()?,
            })
        }
    }

    #[test]
    fn test_primitives_are_little_endian() {
        let mut writer = MessageWriter::new();
        writer.write_u16(0x0102);
        writer.write_u32(0x0304_0506);
        assert_eq!(writer.as_slice(), &[0x02, 0x01, 0x06, 0x05, 0x04, 0x03]);
    }

    #[test]
    fn test_mixed_fields_read_back_in_order() {
        let mut writer = MessageWriter::new();
        writer.write_bool(true);
        writer.write_i64(-42);
        writer.write_f64(1.5);
        writer.write_string("héllo").unwrap();
        writer.write_bytes(&[9, 8, 7]).unwrap();

        let bytes = writer.into_inner();
        let mut reader = MessageReader::new(&bytes);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_i64().unwrap(), -42);
        assert_eq!(reader.read_f64().unwrap(), 1.5);
        assert_eq!(reader.read_string().unwrap(), "héllo");
        assert_eq!(reader.read_bytes().unwrap(), vec![9, 8, 7]);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_nested_objects_and_lists() {
        let points = vec![Point { x: 1, y: 2 }, Point { x: -3, y: 4 }];
        let mut writer = MessageWriter::new();
        writer.write_object(&Point { x: 7, y: 8 }).unwrap();
        writer.write_list(&points).unwrap();

        let bytes = writer.into_inner();
        let mut reader = MessageReader::new(&bytes);
        assert_eq!(reader.read_object::<Point>().unwrap(), Point { x: 7, y: 8 });
        assert_eq!(reader.read_list::<Point>().unwrap(), points);
    }

    #[test]
    fn test_serde_value_roundtrip() {
        let value = (String::from("name"), vec![1u32, 2, 3], Some(9i16));
        let mut writer = MessageWriter::new();
        writer.write_value(&value).unwrap();

        let bytes = writer.into_inner();
        let mut reader = MessageReader::new(&bytes);
        let decoded: (String, Vec<u32>, Option<i16>) = reader.read_value().unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_truncated_read_is_an_error() {
        let mut reader = MessageReader::new(&[0x01, 0x02, 0x03]);
        assert!(matches!(
            reader.read_u32(),
            Err(ProtocolError::DeserializeError(_))
        ));
    }

    #[test]
    fn test_oversized_length_prefix_rejected_before_allocation() {
        let mut writer = MessageWriter::new();
        writer.write_u32(u32::MAX);
        writer.write_u8(1);
        let bytes = writer.into_inner();

        let mut reader = MessageReader::new(&bytes);
        assert!(reader.read_bytes().is_err());

        let mut reader = MessageReader::new(&bytes);
        assert!(reader.read_list::<Point>().is_err());
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut writer = MessageWriter::new();
        writer.write_bytes(&[0xFF, 0xFE]).unwrap();
        let bytes = writer.into_inner();
        let mut reader = MessageReader::new(&bytes);
        assert!(reader.read_string().is_err());
    }

    #[test]
    fn test_invalid_bool_rejected() {
        let mut reader = MessageReader::new(&[2]);
        assert!(reader.read_bool().is_err());
    }
}
