//! Record framing shared by the WAL and segment files.
//!
//! A file starts with [`MAGIC`] and a version byte. Each record after it is a
//! frame:
//!
//! ```text
//! [version: u8][payload length: u32 LE][payload: JSON][crc32 of payload: u32 LE]
//! ```
//!
//! Payloads are the serde JSON of WAL entries and segment snapshots. A frame
//! cut short reads as `UnexpectedEof`, which callers treat as a torn tail;
//! every other failure is `InvalidData`.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

const CODEC_VERSION: u8 = 1;

/// File signature of gameprofile WAL and segment files.
pub const MAGIC: [u8; 4] = *b"GPRF";

/// Bytes taken by [`MAGIC`] plus the version byte.
pub const HEADER_LEN: u64 = 5;

/// Version byte, length prefix and trailing checksum.
const FRAME_OVERHEAD: usize = 1 + 4 + 4;

/// Payload ceiling, checked on both write and read so a corrupted length
/// prefix cannot trigger a huge allocation.
const MAX_ENTRY_SIZE: usize = 100 * 1024 * 1024;

fn invalid(msg: String) -> IoError {
    IoError::new(ErrorKind::InvalidData, msg)
}

/// Frame `value` for appending to a log or segment.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let payload =
        serde_json::to_vec(value).map_err(|e| invalid(format!("serialization failed: {e}")))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|_| payload.len() <= MAX_ENTRY_SIZE)
        .ok_or_else(|| {
            IoError::new(
                ErrorKind::InvalidInput,
                format!("entry size {} exceeds maximum {MAX_ENTRY_SIZE}", payload.len()),
            )
        })?;

    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    frame.push(CODEC_VERSION);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&checksum(&payload).to_le_bytes());
    Ok(frame)
}

/// Read one frame and return its payload once the checksum matches.
fn read_frame(reader: &mut impl Read) -> IoResult<Vec<u8>> {
    let mut prefix = [0u8; 5];
    reader.read_exact(&mut prefix)?;
    if prefix[0] != CODEC_VERSION {
        return Err(invalid(format!(
            "unsupported codec version: {} (expected {CODEC_VERSION})",
            prefix[0]
        )));
    }

    let len = u32::from_le_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]) as usize;
    if len > MAX_ENTRY_SIZE {
        return Err(invalid(format!("entry size {len} exceeds maximum {MAX_ENTRY_SIZE}")));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let mut trailer = [0u8; 4];
    reader.read_exact(&mut trailer)?;

    let stored = u32::from_le_bytes(trailer);
    let computed = checksum(&payload);
    if stored != computed {
        return Err(invalid(format!(
            "CRC mismatch: stored={stored:08x}, computed={computed:08x} (data corrupted)"
        )));
    }
    Ok(payload)
}

/// Read the next frame from `reader` and deserialize its payload.
///
/// # Errors
/// `UnexpectedEof` when the frame is incomplete; `InvalidData` for a bad
/// version byte, oversized length, checksum mismatch or undecodable JSON.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let payload = read_frame(reader)?;
    serde_json::from_slice(&payload).map_err(|e| invalid(format!("deserialization failed: {e}")))
}

pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])
}

/// Check the file signature and return the header's version byte.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header)?;
    if header[..4] != MAGIC {
        return Err(invalid(format!(
            "not a gameprofile file: expected {MAGIC:?}, got {:?}",
            &header[..4]
        )));
    }
    Ok(header[4])
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
