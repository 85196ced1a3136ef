//! Snapshot segments.
//!
//! A segment is an immutable file holding a full snapshot of every partition
//! as of some WAL sequence. The newest segment is the base state on open; the
//! WAL holds everything committed after it.
//!
//! # Design
//! - Segments are numbered sequentially (`segment_00001.seg`, `segment_00002.seg`)
//! - Each segment contains a file header, a [`SegmentHeader`] and a [`SegmentData`] record
//! - Segments are written to a temp file and renamed into place once synced
//! - Older segments are pruned once a newer one is durable

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::codec;
use super::engine::Partition;

const SEGMENT_EXT: &str = "seg";
const SEGMENT_PREFIX: &str = "segment_";

/// A single segment file.
#[derive(Debug)]
pub struct Segment {
    id: u32,
    path: PathBuf,
    /// Last WAL sequence included in this snapshot.
    pub sequence: u64,
}

impl Segment {
    /// Open an existing segment, reading only its header.
    pub fn open(id: u32, path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let _version = codec::read_header(&mut reader)?;
        let header: SegmentHeader = codec::decode(&mut reader)?;

        Ok(Self {
            id,
            path: path.to_path_buf(),
            sequence: header.sequence,
        })
    }

    /// Get the path to this segment.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot stored in this segment.
    pub fn read_all(&self) -> IoResult<SegmentData> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let _version = codec::read_header(&mut reader)?;
        let _header: SegmentHeader = codec::decode(&mut reader)?;
        codec::decode(&mut reader)
    }
}

/// Segment file header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentHeader {
    /// Last WAL sequence included in this snapshot.
    pub sequence: u64,
    /// Number of keys across all partitions.
    pub entry_count: u64,
    /// When this segment was written.
    pub created_at: DateTime<Utc>,
}

/// Full snapshot of the key-value state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentData {
    pub partitions: BTreeMap<String, Partition>,
}

impl SegmentData {
    /// Get total key count across all partitions.
    pub fn entry_count(&self) -> u64 {
        self.partitions.values().map(|p| p.entries.len() as u64).sum()
    }
}

/// Writes one segment file atomically.
///
/// Uses write-to-temp-then-rename for crash safety.
pub struct SegmentWriter {
    id: u32,
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl SegmentWriter {
    fn new(id: u32, final_path: PathBuf) -> IoResult<Self> {
        let temp_path = final_path.with_extension(format!("{SEGMENT_EXT}.tmp.{}", Uuid::new_v4()));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;

        let mut writer = BufWriter::new(file);
        codec::write_header(&mut writer)?;

        Ok(Self {
            id,
            temp_path: Some(temp_path),
            final_path,
            writer: Some(writer),
        })
    }

    /// Write the snapshot and commit the segment (flush, fsync, rename).
    ///
    /// This is the commit point: once it returns, the segment is durable.
    pub fn finish(mut self, data: &SegmentData, sequence: u64) -> IoResult<Segment> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "writer already consumed"))?;

        let header = SegmentHeader {
            sequence,
            entry_count: data.entry_count(),
            created_at: Utc::now(),
        };
        writer.write_all(&codec::encode(&header)?)?;
        writer.write_all(&codec::encode(data)?)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        let temp_path = self
            .temp_path
            .take()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "temp_path already consumed"))?;
        fs::rename(&temp_path, &self.final_path)?;

        Ok(Segment {
            id: self.id,
            path: self.final_path.clone(),
            sequence,
        })
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        // Best-effort cleanup of temp file if not finished
        self.writer.take();
        if let Some(ref temp_path) = self.temp_path {
            let _ = fs::remove_file(temp_path);
        }
    }
}

/// Manages segment files for a database.
#[derive(Debug)]
pub struct SegmentManager {
    dir: PathBuf,
    segments: Vec<Segment>,
    next_segment_id: u32,
}

impl SegmentManager {
    /// Open or create a segment manager for the given directory.
    ///
    /// # Errors
    /// Fails if a segment file cannot be read; a renamed segment was synced
    /// before the rename, so an unreadable one is real corruption.
    pub fn open(dir: &Path) -> IoResult<Self> {
        fs::create_dir_all(dir)?;

        let mut segments = Vec::new();
        let mut next_segment_id = 1u32;

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };

            // Leftovers from a crash mid-compaction
            if name.contains(".tmp.") {
                debug!(path = %path.display(), "removing stale segment temp file");
                let _ = fs::remove_file(&path);
                continue;
            }

            if path.extension().map_or(true, |e| e != SEGMENT_EXT) {
                continue;
            }

            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|stem| stem.strip_prefix(SEGMENT_PREFIX))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(id) = id {
                next_segment_id = next_segment_id.max(id + 1);
                let segment = Segment::open(id, &path).map_err(|e| {
                    IoError::new(e.kind(), format!("failed to open segment {}: {e}", path.display()))
                })?;
                segments.push(segment);
            }
        }

        segments.sort_by_key(|s| s.id);

        Ok(Self {
            dir: dir.to_path_buf(),
            segments,
            next_segment_id,
        })
    }

    /// Get all segments, oldest first.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Get the newest segment.
    pub fn latest(&self) -> Option<&Segment> {
        self.segments.last()
    }

    /// Get the highest persisted WAL sequence.
    pub fn persisted_sequence(&self) -> u64 {
        self.latest().map_or(0, |s| s.sequence)
    }

    /// Allocate the next segment file and return a writer for it.
    pub fn create_segment_writer(&mut self) -> IoResult<SegmentWriter> {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        let path = self.dir.join(format!("{SEGMENT_PREFIX}{id:05}.{SEGMENT_EXT}"));
        SegmentWriter::new(id, path)
    }

    /// Register a finished segment and delete every older one.
    pub fn install(&mut self, segment: Segment) -> IoResult<()> {
        for old in self.segments.drain(..) {
            fs::remove_file(old.path())?;
        }
        self.segments.push(segment);
        Ok(())
    }

    /// Load the newest snapshot, if any.
    pub fn load_latest(&self) -> IoResult<Option<SegmentData>> {
        self.latest().map(Segment::read_all).transpose()
    }
}
