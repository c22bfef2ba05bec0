//! Scratch buffers for staging entry content during multiplexed writes.
//!
//! Buffers come out of a process-wide pool and must be released back exactly
//! once. Dropping an unreleased buffer still reclaims its storage, but only
//! as a logged backstop; explicit release is the contract.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tempfile::NamedTempFile;

use crate::socket::ReadChannel;

/// Allocates interchangeable scratch buffers.
///
/// Shared process-wide; `allocate` and release may race from unrelated
/// controllers.
pub trait Pool: Send + Sync {
    fn allocate(&self) -> io::Result<Buffer>;

    /// Number of buffers currently allocated and not yet released.
    fn live(&self) -> usize;
}

enum Backing {
    Temp { file: NamedTempFile },
    Memory { data: Vec<u8> },
}

/// One pooled scratch buffer.
///
/// Append-only while staging; any number of independent readers afterwards.
pub struct Buffer {
    backing: Backing,
    len: u64,
    modified: SystemTime,
    live: Arc<AtomicUsize>,
    released: bool,
}

impl Buffer {
    fn new(backing: Backing, live: Arc<AtomicUsize>) -> Buffer {
        live.fetch_add(1, Ordering::SeqCst);
        Buffer {
            backing,
            len: 0,
            modified: SystemTime::now(),
            live,
            released: false,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    /// Open an independent reader over the staged content. May be called any
    /// number of times.
    pub fn reader(&self) -> io::Result<Box<dyn ReadChannel>> {
        match &self.backing {
            Backing::Temp { file } => {
                let mut reopened = File::open(file.path())?;
                reopened.seek(SeekFrom::Start(0))?;
                Ok(Box::new(reopened))
            }
            Backing::Memory { data } => Ok(Box::new(Cursor::new(data.clone()))),
        }
    }

    /// Copy the full staged content into `writer`.
    pub fn copy_into(&self, writer: &mut dyn Write) -> io::Result<u64> {
        let mut reader = self.reader()?;
        io::copy(&mut reader, writer)
    }

    /// Return the buffer to its pool. The one legitimate way to dispose of
    /// a buffer.
    pub fn release(mut self) {
        self.released = true;
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = match &mut self.backing {
            Backing::Temp { file } => file.write(buf)?,
            Backing::Memory { data } => {
                data.extend_from_slice(buf);
                buf.len()
            }
        };
        self.len += written as u64;
        self.modified = SystemTime::now();
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.backing {
            Backing::Temp { file } => file.flush(),
            Backing::Memory { .. } => Ok(()),
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                len = self.len,
                "scratch buffer dropped without release; reclaiming anyway"
            );
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A pool backed by temp files, created in the system temp directory or a
/// directory of the caller's choosing.
pub struct TempPool {
    dir: Option<PathBuf>,
    live: Arc<AtomicUsize>,
}

impl TempPool {
    pub fn new() -> TempPool {
        TempPool {
            dir: None,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn in_dir<P: Into<PathBuf>>(dir: P) -> TempPool {
        TempPool {
            dir: Some(dir.into()),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Default for TempPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool for TempPool {
    fn allocate(&self) -> io::Result<Buffer> {
        let file = match &self.dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        Ok(Buffer::new(Backing::Temp { file }, self.live.clone()))
    }

    fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// A pool backed by plain memory. Handy in tests and for small archives.
pub struct MemoryPool {
    live: Arc<AtomicUsize>,
}

impl MemoryPool {
    pub fn new() -> MemoryPool {
        MemoryPool {
            live: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool for MemoryPool {
    fn allocate(&self) -> io::Result<Buffer> {
        Ok(Buffer::new(
            Backing::Memory { data: vec![] },
            self.live.clone(),
        ))
    }

    fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}
