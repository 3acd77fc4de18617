//! Brotli wrapper around encoded models.
//!
//! A compressed model starts with three little-endian `u32`s: the
//! uncompressed length, the compressed length and a checksum of the two,
//! followed by the brotli stream itself.

use std::io::{Cursor, Read, Write};

use brotli::{CompressorWriter, Decompressor};

use crate::binary::ModelError;

const BUFFER_SIZE: usize = 4096;
const QUALITY: u32 = 9;
const WINDOW_SIZE: u32 = 22;
const HEADER_SIZE: usize = 12;

fn checksum(uncompressed_len: u32, compressed_len: u32) -> u32 {
  uncompressed_len
    .wrapping_mul(19991)
    .wrapping_add(compressed_len.wrapping_mul(199999991))
    .wrapping_add(1234567890)
}

/// Compresses `data` and writes it, header first, to `writer`.
pub fn save<W: Write>(data: &[u8], mut writer: W) -> Result<(), ModelError> {
  let uncompressed_len = u32::try_from(data.len())
    .map_err(|_| ModelError::Compression(format!("model of {} bytes is too large", data.len())))?;

  let mut compressed = Cursor::new(Vec::new());
  {
    let mut compressor = CompressorWriter::new(&mut compressed, BUFFER_SIZE, QUALITY, WINDOW_SIZE);
    compressor
      .write_all(data)
      .map_err(|error| ModelError::Compression(format!("could not compress model: {error}")))?;
  }
  let compressed = compressed.into_inner();
  let compressed_len = u32::try_from(compressed.len())
    .map_err(|_| ModelError::Compression("compressed model is too large".to_string()))?;

  writer.write_all(&uncompressed_len.to_le_bytes())?;
  writer.write_all(&compressed_len.to_le_bytes())?;
  writer.write_all(&checksum(uncompressed_len, compressed_len).to_le_bytes())?;
  writer.write_all(&compressed)?;
  writer.flush()?;
  Ok(())
}

/// Reads a model written by [`save`] and returns its uncompressed bytes.
pub fn load<R: Read>(mut reader: R) -> Result<Vec<u8>, ModelError> {
  let mut header = [0u8; HEADER_SIZE];
  reader
    .read_exact(&mut header)
    .map_err(|error| ModelError::Compression(format!("cannot read header: {error}")))?;
  let field = |i: usize| u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
  let (uncompressed_len, compressed_len, stored_checksum) = (field(0), field(4), field(8));
  if stored_checksum != checksum(uncompressed_len, compressed_len) {
    return Err(ModelError::Compression("header checksum mismatch".to_string()));
  }

  let mut compressed = Vec::new();
  reader.take(compressed_len as u64).read_to_end(&mut compressed)?;
  if compressed.len() != compressed_len as usize {
    return Err(ModelError::Compression(format!(
      "expected {} compressed bytes, found {}",
      compressed_len,
      compressed.len()
    )));
  }

  let mut decompressed = Vec::new();
  {
    let decompressor = Decompressor::new(compressed.as_slice(), BUFFER_SIZE);
    decompressor
      .take(uncompressed_len as u64 + 1)
      .read_to_end(&mut decompressed)
      .map_err(|error| ModelError::Compression(format!("could not decompress model: {error}")))?;
  }
  if decompressed.len() != uncompressed_len as usize {
    return Err(ModelError::Compression(format!(
      "expected {} uncompressed bytes, found {}",
      uncompressed_len,
      decompressed.len()
    )));
  }

  Ok(decompressed)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> Vec<u8> {
    (0..2000u32).flat_map(|i| (i % 17).to_le_bytes()).collect()
  }

  #[test]
  fn compressed_data_loads_back() {
    let data = sample();
    let mut blob = Vec::new();
    save(&data, &mut blob).unwrap();
    assert!(blob.len() < data.len());
    assert_eq!(load(blob.as_slice()).unwrap(), data);
  }

  #[test]
  fn truncated_blob_is_rejected() {
    let mut blob = Vec::new();
    save(&sample(), &mut blob).unwrap();
    blob.truncate(blob.len() - 5);
    assert!(matches!(load(blob.as_slice()), Err(ModelError::Compression(_))));
    assert!(matches!(load(&blob[..7]), Err(ModelError::Compression(_))));
  }

  #[test]
  fn stream_longer_than_its_header_is_rejected() {
    let data = sample();
    let mut compressed = Cursor::new(Vec::new());
    {
      let mut compressor = CompressorWriter::new(&mut compressed, BUFFER_SIZE, QUALITY, WINDOW_SIZE);
      compressor.write_all(&data).unwrap();
    }
    let compressed = compressed.into_inner();
    let (uncompressed_len, compressed_len) = (16u32, compressed.len() as u32);
    let mut blob = Vec::new();
    blob.extend_from_slice(&uncompressed_len.to_le_bytes());
    blob.extend_from_slice(&compressed_len.to_le_bytes());
    blob.extend_from_slice(&checksum(uncompressed_len, compressed_len).to_le_bytes());
    blob.extend_from_slice(&compressed);

    match load(blob.as_slice()) {
      Err(ModelError::Compression(msg)) => assert!(msg.contains("found 17"), "{}", msg),
      other => panic!("unexpected result {:?}", other),
    }
  }

  #[test]
  fn corrupted_header_is_rejected() {
    let mut blob = Vec::new();
    save(&sample(), &mut blob).unwrap();
    blob[0] ^= 0x40;
    assert!(matches!(load(blob.as_slice()), Err(ModelError::Compression(_))));
  }
}
