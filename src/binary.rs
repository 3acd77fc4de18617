//! Little-endian binary encoding used by the model format.
//!
//! Strings are length-prefixed: lengths below 255 take one byte, longer
//! strings are marked with 255 followed by a four byte length.

use std::io;

use thiserror::Error;

/// Everything that can go wrong while reading or writing a model.
#[derive(Debug, Error)]
pub enum ModelError {
  #[error("unexpected end of data: wanted {wanted} bytes at offset {offset}, {available} available")]
  Truncated {
    offset: usize,
    wanted: usize,
    available: usize,
  },
  #[error("malformed model data: {0}")]
  Malformed(String),
  #[error("string at offset {0} is not valid UTF-8")]
  InvalidUtf8(usize),
  #[error("unknown model identifier '{0}'")]
  UnknownModel(String),
  #[error("unsupported model format version {0}")]
  UnsupportedVersion(u8),
  #[error("model compression failed: {0}")]
  Compression(String),
  #[error(transparent)]
  Io(#[from] io::Error),
}

impl ModelError {
  pub fn malformed(msg: impl Into<String>) -> Self {
    Self::Malformed(msg.into())
  }
}

const LONG_STRING: u8 = 255;

#[derive(Debug, Default, Clone)]
pub struct BinaryEncoder {
  data: Vec<u8>,
}

impl BinaryEncoder {
  pub fn new() -> Self {
    Self {
      data: Vec::with_capacity(16),
    }
  }

  pub fn add_u8(&mut self, val: u8) {
    self.data.push(val);
  }

  pub fn add_u16(&mut self, val: u16) {
    self.data.extend_from_slice(&val.to_le_bytes());
  }

  pub fn add_u32(&mut self, val: u32) {
    self.data.extend_from_slice(&val.to_le_bytes());
  }

  pub fn add_f32(&mut self, val: f32) {
    self.data.extend_from_slice(&val.to_le_bytes());
  }

  pub fn add_f32s(&mut self, vals: &[f32]) {
    self.data.reserve(vals.len() * 4);
    for val in vals {
      self.add_f32(*val);
    }
  }

  pub fn add_f64(&mut self, val: f64) {
    self.data.extend_from_slice(&val.to_le_bytes());
  }

  pub fn add_str(&mut self, s: &str) {
    let len = s.len();
    if len < LONG_STRING as usize {
      self.data.push(len as u8);
    } else {
      self.data.push(LONG_STRING);
      // model strings are bounded by u32 lengths, same as every other count
      self.add_u32(len as u32);
    }
    self.data.extend_from_slice(s.as_bytes());
  }

  pub fn add_data(&mut self, data: &[u8]) {
    self.data.extend_from_slice(data);
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  pub fn into_bytes(self) -> Vec<u8> {
    self.data
  }
}

/// Reads values back in the order a [`BinaryEncoder`] wrote them. Every read
/// is bounds checked, so a truncated stream surfaces as
/// [`ModelError::Truncated`] instead of a panic.
#[derive(Debug, Clone)]
pub struct BinaryDecoder<'a> {
  data: &'a [u8],
  pos: usize,
}

impl<'a> BinaryDecoder<'a> {
  pub fn new(data: &'a [u8]) -> Self {
    Self { data, pos: 0 }
  }

  pub fn is_end(&self) -> bool {
    self.pos >= self.data.len()
  }

  pub fn tell(&self) -> usize {
    self.pos
  }

  pub fn seek(&mut self, pos: usize) -> Result<(), ModelError> {
    if pos > self.data.len() {
      return Err(ModelError::Truncated {
        offset: pos,
        wanted: 0,
        available: self.data.len(),
      });
    }
    self.pos = pos;
    Ok(())
  }

  pub fn remaining(&self) -> usize {
    self.data.len() - self.pos
  }

  pub fn next_bytes(&mut self, len: usize) -> Result<&'a [u8], ModelError> {
    if len > self.remaining() {
      return Err(ModelError::Truncated {
        offset: self.pos,
        wanted: len,
        available: self.remaining(),
      });
    }
    let bytes = &self.data[self.pos..self.pos + len];
    self.pos += len;
    Ok(bytes)
  }

  fn next_array<const N: usize>(&mut self) -> Result<[u8; N], ModelError> {
    let mut array = [0; N];
    array.copy_from_slice(self.next_bytes(N)?);
    Ok(array)
  }

  pub fn next_u8(&mut self) -> Result<u8, ModelError> {
    Ok(self.next_array::<1>()?[0])
  }

  pub fn next_u16(&mut self) -> Result<u16, ModelError> {
    Ok(u16::from_le_bytes(self.next_array()?))
  }

  pub fn next_u32(&mut self) -> Result<u32, ModelError> {
    Ok(u32::from_le_bytes(self.next_array()?))
  }

  pub fn next_f32(&mut self) -> Result<f32, ModelError> {
    Ok(f32::from_le_bytes(self.next_array()?))
  }

  pub fn next_f64(&mut self) -> Result<f64, ModelError> {
    Ok(f64::from_le_bytes(self.next_array()?))
  }

  /// Reads `count` floats. The length is checked up front so that a corrupt
  /// count cannot trigger a huge allocation.
  pub fn next_f32s(&mut self, count: usize) -> Result<Vec<f32>, ModelError> {
    let len = count.checked_mul(4).ok_or_else(|| ModelError::malformed("float count overflows"))?;
    let bytes = self.next_bytes(len)?;
    Ok(
      bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect(),
    )
  }

  pub fn next_str(&mut self) -> Result<String, ModelError> {
    let mut len = self.next_u8()? as usize;
    if len == LONG_STRING as usize {
      len = self.next_u32()? as usize;
    }
    let offset = self.pos;
    let bytes = self.next_bytes(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ModelError::InvalidUtf8(offset))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn long_strings_use_four_byte_length() {
    let long = "x".repeat(300);
    let mut enc = BinaryEncoder::new();
    enc.add_str("short");
    enc.add_str(&long);
    assert_eq!(enc.len(), 1 + 5 + 1 + 4 + 300);

    let mut dec = BinaryDecoder::new(enc.as_bytes());
    assert_eq!(dec.next_str().unwrap(), "short");
    assert_eq!(dec.next_str().unwrap(), long);
    assert!(dec.is_end());
  }

  #[test]
  fn values_are_little_endian() {
    let mut enc = BinaryEncoder::new();
    enc.add_u16(0x0102);
    enc.add_u32(0x03040506);
    assert_eq!(enc.as_bytes(), &[0x02, 0x01, 0x06, 0x05, 0x04, 0x03]);
  }

  #[test]
  fn truncated_reads_fail() {
    let mut enc = BinaryEncoder::new();
    enc.add_str("abcdef");
    let bytes = enc.into_bytes();

    let mut dec = BinaryDecoder::new(&bytes[..4]);
    assert!(matches!(dec.next_str(), Err(ModelError::Truncated { wanted: 6, .. })));

    let mut dec = BinaryDecoder::new(&[1, 2, 3]);
    assert!(matches!(dec.next_u32(), Err(ModelError::Truncated { .. })));
  }

  #[test]
  fn huge_float_counts_are_rejected_without_allocating() {
    let mut dec = BinaryDecoder::new(&[0; 8]);
    assert!(dec.next_f32s(usize::MAX).is_err());
    assert!(matches!(dec.next_f32s(3), Err(ModelError::Truncated { .. })));
    assert_eq!(dec.next_f32s(2).unwrap(), vec![0.0, 0.0]);
  }

  #[test]
  fn invalid_utf8_is_reported() {
    let mut dec = BinaryDecoder::new(&[2, 0xff, 0xfe]);
    assert!(matches!(dec.next_str(), Err(ModelError::InvalidUtf8(1))));
  }
}
