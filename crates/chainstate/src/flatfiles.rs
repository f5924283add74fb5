//! Append-only block files `blkNNNNN.dat`. Each record is framed as network
//! magic, little-endian payload length, payload; the same framing block
//! import reads, so a node's own block files can be imported elsewhere.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const DEFAULT_MAX_FILE_SIZE: u64 = 128 * 1024 * 1024;
pub const FILE_LOCATION_LEN: usize = 16;

const FRAME_HEADER_LEN: u64 = 8;

/// Where a record's frame starts, and its payload length.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileLocation {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl FileLocation {
    pub fn encode(&self) -> [u8; FILE_LOCATION_LEN] {
        let mut out = [0u8; FILE_LOCATION_LEN];
        let (file_id, rest) = out.split_at_mut(4);
        let (offset, len) = rest.split_at_mut(8);
        file_id.copy_from_slice(&self.file_id.to_le_bytes());
        offset.copy_from_slice(&self.offset.to_le_bytes());
        len.copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; FILE_LOCATION_LEN] = bytes.try_into().ok()?;
        let (file_id, rest) = bytes.split_at(4);
        let (offset, len) = rest.split_at(8);
        Some(Self {
            file_id: u32::from_le_bytes(file_id.try_into().ok()?),
            offset: u64::from_le_bytes(offset.try_into().ok()?),
            len: u32::from_le_bytes(len.try_into().ok()?),
        })
    }
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(std::io::Error),
    InvalidLocation,
    /// The frame at a location does not carry this network's magic.
    MagicMismatch { file_id: u32, offset: u64 },
    LengthMismatch { file_id: u32, offset: u64 },
    Poisoned,
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(err) => write!(f, "{err}"),
            FlatFileError::InvalidLocation => write!(f, "invalid block file location"),
            FlatFileError::MagicMismatch { file_id, offset } => {
                write!(f, "bad frame magic in blk{file_id:05}.dat at {offset}")
            }
            FlatFileError::LengthMismatch { file_id, offset } => {
                write!(f, "frame length mismatch in blk{file_id:05}.dat at {offset}")
            }
            FlatFileError::Poisoned => write!(f, "block file lock poisoned"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err)
    }
}

pub struct FlatFileStore {
    dir: PathBuf,
    magic: [u8; 4],
    max_file_size: u64,
    writer: Mutex<AppendState>,
}

struct AppendState {
    file_id: u32,
    len: u64,
    /// Open handle on `file_id`, created on first append.
    handle: Option<File>,
}

impl FlatFileStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        magic: [u8; 4],
        max_file_size: u64,
    ) -> Result<Self, FlatFileError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let (file_id, len) = match last_file(&dir)? {
            Some((file_id, len)) if len >= max_file_size => (file_id + 1, 0),
            Some(last) => last,
            None => (0, 0),
        };
        Ok(Self {
            dir,
            magic,
            max_file_size,
            writer: Mutex::new(AppendState {
                file_id,
                len,
                handle: None,
            }),
        })
    }

    fn writer(&self) -> Result<MutexGuard<'_, AppendState>, FlatFileError> {
        self.writer.lock().map_err(|_| FlatFileError::Poisoned)
    }

    /// Appends one framed record. Bytes written for a block the index never
    /// references are dead space.
    pub fn append(&self, payload: &[u8]) -> Result<FileLocation, FlatFileError> {
        let len = u32::try_from(payload.len()).map_err(|_| FlatFileError::InvalidLocation)?;
        let frame_len = FRAME_HEADER_LEN + u64::from(len);
        let mut writer = self.writer()?;
        let mut file = match writer.handle.take() {
            Some(file) => file,
            None => {
                let file = open_append(&self.file_path(writer.file_id))?;
                // A failed append may have left a partial frame behind.
                writer.len = file.metadata()?.len();
                file
            }
        };
        if writer.len > 0 && writer.len + frame_len > self.max_file_size {
            file.sync_data()?;
            writer.file_id += 1;
            writer.len = 0;
            file = open_append(&self.file_path(writer.file_id))?;
        }

        let location = FileLocation {
            file_id: writer.file_id,
            offset: writer.len,
            len,
        };
        let mut frame = Vec::with_capacity(frame_len as usize);
        frame.extend_from_slice(&self.magic);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(payload);
        file.write_all(&frame)?;
        writer.len += frame_len;
        writer.handle = Some(file);
        Ok(location)
    }

    pub fn read(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        self.read_range(location, 0, location.len)
    }

    /// Reads `len` payload bytes starting `offset` bytes into the record.
    pub fn read_range(
        &self,
        location: FileLocation,
        offset: u32,
        len: u32,
    ) -> Result<Vec<u8>, FlatFileError> {
        let end = offset.checked_add(len).ok_or(FlatFileError::InvalidLocation)?;
        if len == 0 || end > location.len {
            return Err(FlatFileError::InvalidLocation);
        }
        let mut file = File::open(self.file_path(location.file_id))?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        let (magic, stored_len) = header.split_at(4);
        if magic != self.magic {
            return Err(FlatFileError::MagicMismatch {
                file_id: location.file_id,
                offset: location.offset,
            });
        }
        if stored_len != location.len.to_le_bytes() {
            return Err(FlatFileError::LengthMismatch {
                file_id: location.file_id,
                offset: location.offset,
            });
        }
        if offset > 0 {
            file.seek(SeekFrom::Current(i64::from(offset)))?;
        }
        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Forces appended records onto disk.
    pub fn sync(&self) -> Result<(), FlatFileError> {
        let writer = self.writer()?;
        if let Some(file) = writer.handle.as_ref() {
            file.sync_data()?;
        }
        Ok(())
    }

    pub fn file_path(&self, file_id: u32) -> PathBuf {
        self.dir.join(file_name(file_id))
    }
}

fn open_append(path: &Path) -> Result<File, FlatFileError> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn file_name(file_id: u32) -> String {
    format!("blk{file_id:05}.dat")
}

/// Highest consecutively numbered block file and its length.
fn last_file(dir: &Path) -> Result<Option<(u32, u64)>, FlatFileError> {
    let mut last = None;
    for file_id in 0u32.. {
        let path = dir.join(file_name(file_id));
        if !path.exists() {
            break;
        }
        last = Some((file_id, std::fs::metadata(&path)?.len()));
    }
    Ok(last)
}
