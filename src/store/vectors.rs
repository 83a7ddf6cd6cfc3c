//! Binary encoding of the embeddings table.
//!
//! File format: embeddings.bin
//!
//! Header (13 bytes):
//! - version: u8 (1)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated):
//! - chunk_id, note_id, model_id: u16 byte length + UTF-8 bytes each
//! - dimensions: u32 (little-endian)
//! - vector: [f32; dimensions] (little-endian)

use std::io::{Cursor, Read, Write};

use super::models::Embedding;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 13;

/// Name of the embeddings file inside the data directory.
pub const EMBEDDINGS_FILE: &str = "embeddings.bin";

#[derive(Debug, thiserror::Error)]
pub enum VectorFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,
}

/// Serialize embeddings into the binary file layout.
pub fn encode<'a, I>(embeddings: I) -> Result<Vec<u8>, VectorFileError>
where
    I: ExactSizeIterator<Item = &'a Embedding>,
{
    let mut out = Vec::with_capacity(HEADER_SIZE);
    write_header(&mut out, embeddings.len() as u64)?;

    for embedding in embeddings {
        write_entry(&mut out, embedding)?;
    }

    Ok(out)
}

/// Parse the binary file layout back into embeddings.
pub fn decode(bytes: &[u8]) -> Result<Vec<Embedding>, VectorFileError> {
    let mut reader = Cursor::new(bytes);
    let entry_count = read_header(&mut reader)?;

    // Cap the preallocation; a corrupted count must not allocate unbounded memory.
    let mut entries = Vec::with_capacity(entry_count.min(4096) as usize);
    for _ in 0..entry_count {
        entries.push(read_entry(&mut reader)?);
    }

    if (reader.position() as usize) != bytes.len() {
        return Err(VectorFileError::InvalidFormat(format!(
            "{} trailing bytes after {entry_count} entries",
            bytes.len() - reader.position() as usize
        )));
    }

    Ok(entries)
}

fn write_header(writer: &mut impl Write, entry_count: u64) -> Result<(), VectorFileError> {
    let mut header_bytes = [0u8; HEADER_SIZE];

    header_bytes[0] = FORMAT_VERSION;
    header_bytes[1..9].copy_from_slice(&entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&header_bytes[0..9]);
    header_bytes[9..13].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&header_bytes)?;
    Ok(())
}

fn read_header(reader: &mut impl Read) -> Result<u64, VectorFileError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;

    let version = header_bytes[0];
    if version > FORMAT_VERSION {
        return Err(VectorFileError::VersionMismatch(version, FORMAT_VERSION));
    }

    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&header_bytes[1..9]);
    let entry_count = u64::from_le_bytes(count_bytes);

    let mut checksum_bytes = [0u8; 4];
    checksum_bytes.copy_from_slice(&header_bytes[9..13]);
    let stored_checksum = u32::from_le_bytes(checksum_bytes);

    if stored_checksum != crc32fast::hash(&header_bytes[0..9]) {
        return Err(VectorFileError::ChecksumMismatch);
    }

    Ok(entry_count)
}

fn write_entry(writer: &mut impl Write, embedding: &Embedding) -> Result<(), VectorFileError> {
    write_str(writer, &embedding.chunk_id)?;
    write_str(writer, &embedding.note_id)?;
    write_str(writer, &embedding.model_id)?;

    writer.write_all(&(embedding.vector.len() as u32).to_le_bytes())?;
    for &value in &embedding.vector {
        writer.write_all(&value.to_le_bytes())?;
    }

    Ok(())
}

fn read_entry(reader: &mut impl Read) -> Result<Embedding, VectorFileError> {
    let chunk_id = read_str(reader)?;
    let note_id = read_str(reader)?;
    let model_id = read_str(reader)?;

    let mut dims_bytes = [0u8; 4];
    reader.read_exact(&mut dims_bytes)?;
    let dimensions = u32::from_le_bytes(dims_bytes) as usize;

    let mut vector = Vec::with_capacity(dimensions.min(8192));
    for _ in 0..dimensions {
        let mut float_bytes = [0u8; 4];
        reader.read_exact(&mut float_bytes)?;
        vector.push(f32::from_le_bytes(float_bytes));
    }

    Ok(Embedding {
        chunk_id,
        note_id,
        model_id,
        vector,
    })
}

fn write_str(writer: &mut impl Write, value: &str) -> Result<(), VectorFileError> {
    let len = u16::try_from(value.len())
        .map_err(|_| VectorFileError::InvalidFormat(format!("identifier too long: {} bytes", value.len())))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

fn read_str(reader: &mut impl Read) -> Result<String, VectorFileError> {
    let mut len_bytes = [0u8; 2];
    reader.read_exact(&mut len_bytes)?;

    let mut buf = vec![0u8; u16::from_le_bytes(len_bytes) as usize];
    reader.read_exact(&mut buf)?;

    String::from_utf8(buf).map_err(|e| VectorFileError::InvalidFormat(e.to_string()))
}
