use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use rkyv::Deserialize;
use tracing::{debug, error, info, warn};

use crate::error::{KairosError, Result};
use crate::model::{LogEntry, Record};

// Frame header: [Length u32 LE][SeaHash u64 LE]
const HEADER_LEN: usize = 12;

/// Append-only record log. Upserts append `Put` frames, deletes append `Tombstone`
/// frames; the live table is whatever replay leaves standing.
#[derive(Debug)]
pub struct Segment {
    pub file_path: PathBuf,
    file: File,
    current_offset: u64,
    strict: bool,
}

/// Result of scanning a segment from the start.
#[derive(Debug, Default)]
pub struct Replay {
    pub entries: Vec<LogEntry>,
    /// Offset of a torn or corrupt trailing frame that was cut off.
    pub truncated_at: Option<u64>,
}

impl Segment {
    /// Opens or creates the log. Safe to call on an existing file.
    pub fn open(path: &Path, strict: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().read(true).append(true).create(true).open(path)?;
        let current_offset = file.metadata()?.len();

        Ok(Self {
            file_path: path.to_path_buf(),
            file,
            current_offset,
            strict,
        })
    }

    pub fn len_bytes(&self) -> u64 {
        self.current_offset
    }

    fn encode(entry: &LogEntry, out: &mut Vec<u8>) -> Result<()> {
        let bytes = rkyv::to_bytes::<_, 4096>(entry)
            .map_err(|e| KairosError::Corrupt { offset: 0, reason: format!("encode: {}", e) })?;
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&seahash::hash(&bytes).to_le_bytes());
        out.extend_from_slice(&bytes);
        Ok(())
    }

    /// Frames every entry and writes them with a single `write_all`.
    pub fn append_batch(&mut self, entries: &[LogEntry]) -> Result<u64> {
        let mut buf = Vec::new();
        for entry in entries {
            Self::encode(entry, &mut buf)?;
        }

        let start = self.write_frames(&buf, |file, bytes| file.write_all(bytes))?;
        debug!(frames = entries.len(), bytes = buf.len(), offset = start, "appended to log");
        Ok(start)
    }

    /// Writes encoded frames at the tail. If the write or the sync fails, the file is cut
    /// back to where it was, so a failed append never leaves a partial frame in front of
    /// later ones.
    fn write_frames<F>(&mut self, buf: &[u8], write: F) -> Result<u64>
    where
        F: FnOnce(&mut File, &[u8]) -> io::Result<()>,
    {
        let start = self.current_offset;
        let written = write(&mut self.file, buf).and_then(|()| if self.strict { self.file.sync_data() } else { Ok(()) });
        if let Err(e) = written {
            warn!(offset = start, error = %e, "log append failed, rolling back");
            if let Err(rollback) = self.file.set_len(start) {
                error!(offset = start, error = %rollback, "could not roll back failed append");
            }
            return Err(e.into());
        }
        self.current_offset += buf.len() as u64;
        Ok(start)
    }

    pub fn append(&mut self, entry: &LogEntry) -> Result<u64> {
        self.append_batch(std::slice::from_ref(entry))
    }

    /// Decodes every frame. A short or corrupt tail (crash mid-append) is cut off so
    /// later appends start from the last good frame.
    pub fn replay(&mut self) -> Result<Replay> {
        let mut replay = Replay::default();
        if self.current_offset == 0 {
            return Ok(replay);
        }

        let mmap = unsafe { Mmap::map(&self.file)? };
        let mut pos = 0usize;
        while pos < mmap.len() {
            match decode_frame(&mmap[pos..], pos as u64) {
                Ok((entry, used)) => {
                    replay.entries.push(entry);
                    pos += used;
                }
                Err(e) => {
                    warn!(offset = pos, error = %e, "discarding torn log tail");
                    replay.truncated_at = Some(pos as u64);
                    break;
                }
            }
        }
        drop(mmap);

        if let Some(cut) = replay.truncated_at {
            self.file.set_len(cut)?;
            self.current_offset = cut;
        }
        Ok(replay)
    }

    /// Replaces the log with one `Put` frame per live record. The new file is written
    /// beside the old one and renamed over it.
    pub fn rewrite<'a, I>(&mut self, live: I) -> Result<u64>
    where
        I: IntoIterator<Item = &'a Record>,
    {
        let tmp_path = self.file_path.with_extension("compacting");
        let mut buf = Vec::new();
        let mut count = 0u64;
        for record in live {
            // rkyv needs an owned entry; records are cloned one at a time
            Self::encode(&LogEntry::Put(record.clone()), &mut buf)?;
            count += 1;
        }

        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&buf)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.file_path)?;

        let before = self.current_offset;
        *self = Segment::open(&self.file_path.clone(), self.strict)?;
        info!(records = count, before_bytes = before, after_bytes = self.current_offset, "log rewritten");
        Ok(count)
    }

    /// Drops every frame.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.current_offset = 0;
        Ok(())
    }
}

fn decode_frame(buf: &[u8], offset: u64) -> Result<(LogEntry, usize)> {
    let corrupt = |reason: String| KairosError::Corrupt { offset, reason };
    if buf.len() < HEADER_LEN {
        return Err(corrupt("short header".into()));
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let mut sum = [0u8; 8];
    sum.copy_from_slice(&buf[4..HEADER_LEN]);
    let checksum = u64::from_le_bytes(sum);

    let body = buf.get(HEADER_LEN..HEADER_LEN + len).ok_or_else(|| corrupt("short body".into()))?;
    if seahash::hash(body) != checksum {
        return Err(corrupt("checksum mismatch".into()));
    }

    // Archived data must be aligned; the mmap slice is not guaranteed to be.
    let mut aligned = rkyv::AlignedVec::with_capacity(len);
    aligned.extend_from_slice(body);
    let archived = rkyv::check_archived_root::<LogEntry>(&aligned).map_err(|e| corrupt(e.to_string()))?;
    let entry: LogEntry = match archived.deserialize(&mut rkyv::Infallible) {
        Ok(entry) => entry,
        Err(never) => match never {},
    };
    Ok((entry, HEADER_LEN + len))
}
