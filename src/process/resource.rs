//! The polymorphic IO resources behind a process's descriptor table.
//!
//! One tagged variant per stream kind, dispatched in `read`/`write`/`seek`.
//! A `File` carries a one-shot copy of the file body made at `open` time and
//! serves every later operation from that buffer.

use crate::board;
use crate::kernel::syscall::{SeekKind, SystemCallError};
use alloc::vec::Vec;

/// A sink or source reachable through a file descriptor
pub enum Resource {
    /// Descriptor 0; reads are not wired up yet
    StandardInput,
    /// Descriptor 1, writing through the serial sink
    StandardOutput,
    /// Descriptor 2, also the serial sink
    StandardError,
    /// An open file
    File(FileResource),
}

/// An open file: the buffered body and a cursor
pub struct FileResource {
    /// The file's bytes, read in full at open time
    data: Vec<u8>,
    /// Current position; kept within `0..=data.len()` at rest
    pos: i64,
}

impl FileResource {
    /// Wraps a fully-read file body
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    /// The file length, as seek arithmetic sees it
    fn size(&self) -> i64 {
        self.data.len() as i64
    }
}

impl Resource {
    /// Reads up to `buffer.len()` bytes, returning how many were produced
    pub fn read(&mut self, buffer: &mut [u8]) -> Result<usize, SystemCallError> {
        match self {
            Self::StandardInput => Err(SystemCallError::NotImplemented),
            Self::StandardOutput | Self::StandardError => {
                Err(SystemCallError::InvalidOperation)
            }
            Self::File(file) => {
                let pos = usize::try_from(file.pos)
                    .map_err(|_| SystemCallError::InvalidFilePos)?;
                let remaining = file.data.len().checked_sub(pos)
                    .ok_or(SystemCallError::InvalidFilePos)?;
                let count = usize::min(buffer.len(), remaining);
                buffer[..count].copy_from_slice(&file.data[pos..pos + count]);
                file.pos += count as i64;
                Ok(count)
            }
        }
    }

    /// Writes the buffer, returning how many bytes were consumed
    pub fn write(&mut self, buffer: &[u8]) -> Result<usize, SystemCallError> {
        match self {
            Self::StandardInput => Err(SystemCallError::InvalidOperation),
            Self::StandardOutput | Self::StandardError => {
                board::serial().put_bytes(buffer);
                Ok(buffer.len())
            }
            Self::File(_) => Err(SystemCallError::NotImplemented),
        }
    }

    /// Moves the cursor, returning the new absolute position
    pub fn seek(&mut self, offset: i64, kind: SeekKind) -> Result<i64, SystemCallError> {
        match self {
            Self::StandardInput | Self::StandardOutput | Self::StandardError => {
                Err(SystemCallError::InvalidOperation)
            }
            Self::File(file) => {
                let target = match kind {
                    SeekKind::Absolute => offset,
                    SeekKind::Relative => file.pos + offset,
                    SeekKind::End => file.size() + offset,
                };
                if target < 0 || target > file.size() {
                    return Err(SystemCallError::InvalidFilePos);
                }
                file.pos = target;
                Ok(target)
            }
        }
    }
}
