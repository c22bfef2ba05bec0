//! TAR codec glue.
//!
//! TAR streams are sequential and carry each entry's size in the header, so
//! the input side stages every file into a pool buffer at mount time and the
//! output side reports `needs_length`, letting the multiplexer stage writes
//! until their size is known.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::container::{busy_error, InputContainer, OutputContainer};
use crate::entry::{Access, Entry, EntryKind, Permissions, SizeKind};
use crate::error::corruption;
use crate::path::NodePath;
use crate::pool::Buffer;
use crate::socket::{InputSocket, OutputSocket, OutputStream};

use super::{Driver, DriverContext};

fn perms_to_mode(entry: &Entry) -> u32 {
    match entry.permissions {
        Some(perms) => perms.to_unix_mode(entry.kind == EntryKind::Directory),
        None => match entry.kind {
            EntryKind::Directory => 0o755,
            _ => 0o644,
        },
    }
}

fn mtime_of(entry: &Entry) -> u64 {
    entry
        .time(Access::Write)
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct TarFile {
    entry: Entry,
    buffer: Option<Buffer>,
}

struct TarInputInner {
    files: HashMap<NodePath, TarFile>,
    order: Vec<NodePath>,
}

impl Drop for TarInputInner {
    fn drop(&mut self) {
        for (_, file) in self.files.iter_mut() {
            if let Some(buffer) = file.buffer.take() {
                buffer.release();
            }
        }
    }
}

pub struct TarInputContainer {
    inner: Arc<TarInputInner>,
}

impl TarInputContainer {
    fn read_from(reader: Box<dyn Read + Send>, ctx: &DriverContext) -> io::Result<TarInputContainer> {
        let mut archive = tar::Archive::new(reader);
        let mut files = HashMap::new();
        let mut order = vec![];

        for entry in archive.entries()? {
            let mut entry = entry?;

            let path = {
                let raw_path = entry.path().map_err(corruption)?;
                match NodePath::new_entry(&raw_path) {
                    Ok(path) => path,
                    Err(err) => {
                        tracing::warn!(path = %raw_path.display(), error = %err, "skipping unrepresentable entry");
                        continue;
                    }
                }
            };

            use tar::EntryType;
            let header = entry.header();
            let kind = match header.entry_type() {
                EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                    EntryKind::File
                }
                EntryType::Directory => EntryKind::Directory,
                EntryType::Symlink | EntryType::Link => EntryKind::Symlink,
                _ => EntryKind::Special,
            };
            let storage_size = header.size()?;
            let mtime = header.mtime().ok();
            let mode = header.mode().ok();
            let link_target = header
                .link_name()
                .map_err(corruption)?
                .map(|t| t.to_string_lossy().into_owned());

            let mut node_entry = Entry::new(path.clone(), kind);
            node_entry.set_size(SizeKind::Storage, Some(storage_size));
            if let Some(mtime) = mtime {
                node_entry.set_time(
                    Access::Write,
                    Some(SystemTime::UNIX_EPOCH + Duration::from_secs(mtime)),
                );
            }
            if let Some(mode) = mode {
                node_entry.permissions = Some(Permissions::from_unix_mode(mode));
            }

            let buffer = match kind {
                EntryKind::File => {
                    let mut buffer = ctx.pool.allocate()?;
                    let copied = io::copy(&mut entry, &mut buffer)?;
                    buffer.flush()?;
                    node_entry.set_size(SizeKind::Data, Some(copied));
                    Some(buffer)
                }
                EntryKind::Symlink => {
                    // The link target doubles as the entry's content.
                    let target = link_target.unwrap_or_default();
                    let mut buffer = ctx.pool.allocate()?;
                    buffer.write_all(target.as_bytes())?;
                    buffer.flush()?;
                    node_entry.set_size(SizeKind::Data, Some(target.len() as u64));
                    Some(buffer)
                }
                EntryKind::Directory | EntryKind::Special => {
                    node_entry.set_size(SizeKind::Data, Some(0));
                    None
                }
            };

            if let Some(previous) = files.insert(
                path.clone(),
                TarFile {
                    entry: node_entry,
                    buffer,
                },
            ) {
                // Later occurrences win, as they do on extraction.
                if let Some(buffer) = previous.buffer {
                    buffer.release();
                }
            } else {
                order.push(path);
            }
        }

        Ok(TarInputContainer {
            inner: Arc::new(TarInputInner { files, order }),
        })
    }
}

impl InputContainer for TarInputContainer {
    fn entries(&self) -> Vec<Entry> {
        self.inner
            .order
            .iter()
            .map(|path| self.inner.files[path].entry.clone())
            .collect()
    }

    fn entry(&self, path: &NodePath) -> Option<Entry> {
        self.inner.files.get(path).map(|f| f.entry.clone())
    }

    fn input(&self, path: &NodePath) -> io::Result<Box<dyn InputSocket>> {
        Ok(Box::new(TarInputSocket {
            inner: self.inner.clone(),
            path: path.clone(),
        }))
    }
}

struct TarInputSocket {
    inner: Arc<TarInputInner>,
    path: NodePath,
}

impl InputSocket for TarInputSocket {
    fn target(&self) -> io::Result<Entry> {
        self.inner
            .files
            .get(&self.path)
            .map(|f| f.entry.clone())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no entry at `{}`", self.path),
                )
            })
    }

    fn stream(&self, _peer: Option<&dyn OutputSocket>) -> io::Result<Box<dyn Read + Send>> {
        let file = self.inner.files.get(&self.path).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no entry at `{}`", self.path),
            )
        })?;
        match &file.buffer {
            Some(buffer) => Ok(Box::new(buffer.reader()?)),
            None => Ok(Box::new(io::empty())),
        }
    }
}

/// Delegating writer so `tar::Builder` can sit on a boxed output stream.
struct CommitWriter {
    inner: Option<Box<dyn OutputStream>>,
}

impl Write for CommitWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::other("stream already committed"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

enum TarSink {
    Plain(CommitWriter),
    Gz(GzEncoder<CommitWriter>),
}

impl Write for TarSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TarSink::Plain(w) => w.write(buf),
            TarSink::Gz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TarSink::Plain(w) => w.flush(),
            TarSink::Gz(w) => w.flush(),
        }
    }
}

pub struct TarOutputContainer {
    builder: Option<tar::Builder<TarSink>>,
    current: Option<(Entry, Vec<u8>)>,
}

impl TarOutputContainer {
    fn new(stream: Box<dyn OutputStream>, gzip: bool) -> TarOutputContainer {
        let writer = CommitWriter {
            inner: Some(stream),
        };
        let sink = if gzip {
            TarSink::Gz(GzEncoder::new(writer, flate2::Compression::default()))
        } else {
            TarSink::Plain(writer)
        };
        TarOutputContainer {
            builder: Some(tar::Builder::new(sink)),
            current: None,
        }
    }

    fn builder(&mut self) -> io::Result<&mut tar::Builder<TarSink>> {
        self.builder
            .as_mut()
            .ok_or_else(|| io::Error::other("container already closed"))
    }

    fn header_for(entry: &Entry, size: u64) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_size(size);
        header.set_mtime(mtime_of(entry));
        header.set_mode(perms_to_mode(entry));
        header
    }
}

impl OutputContainer for TarOutputContainer {
    fn needs_length(&self) -> bool {
        true
    }

    fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    fn begin(&mut self, entry: &Entry) -> io::Result<()> {
        if let Some((current, _)) = &self.current {
            return Err(busy_error(&current.path));
        }
        self.current = Some((entry.clone(), vec![]));
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (_, data) = self
            .current
            .as_mut()
            .ok_or_else(|| io::Error::other("no entry mid-write"))?;
        data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn end(&mut self) -> io::Result<()> {
        let (entry, data) = self
            .current
            .take()
            .ok_or_else(|| io::Error::other("no entry mid-write"))?;
        let path = entry.path.to_path_buf();
        match entry.kind {
            EntryKind::Symlink => {
                let target = String::from_utf8(data).map_err(corruption)?;
                let mut header = Self::header_for(&entry, 0);
                header.set_entry_type(tar::EntryType::Symlink);
                self.builder()?.append_link(&mut header, path, target)?;
            }
            _ => {
                let mut header = Self::header_for(&entry, data.len() as u64);
                header.set_entry_type(tar::EntryType::Regular);
                self.builder()?.append_data(&mut header, path, &data[..])?;
            }
        }
        Ok(())
    }

    fn put_meta(&mut self, entry: &Entry) -> io::Result<()> {
        match entry.kind {
            EntryKind::Directory => {
                let mut header = Self::header_for(entry, 0);
                header.set_entry_type(tar::EntryType::Directory);
                let path = format!("{}/", entry.path);
                self.builder()?.append_data(&mut header, path, io::empty())?;
                Ok(())
            }
            _ => {
                tracing::warn!(path = %entry.path, "dropping content-less non-directory entry");
                Ok(())
            }
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if self.current.is_some() {
            return Err(io::Error::other("close with an entry mid-write"));
        }
        let builder = self
            .builder
            .take()
            .ok_or_else(|| io::Error::other("container already closed"))?;
        let sink = builder.into_inner()?;
        let mut writer = match sink {
            TarSink::Plain(writer) => writer,
            TarSink::Gz(encoder) => encoder.finish()?,
        };
        let stream = writer
            .inner
            .take()
            .ok_or_else(|| io::Error::other("stream already committed"))?;
        stream.commit()?;
        Ok(())
    }
}

/// Driver for `.tar` and, with gzip enabled, `.tar.gz`/`.tgz` archives.
pub struct TarDriver {
    gzip: bool,
}

impl TarDriver {
    pub fn new() -> TarDriver {
        TarDriver { gzip: false }
    }

    pub fn gz() -> TarDriver {
        TarDriver { gzip: true }
    }
}

impl Default for TarDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for TarDriver {
    fn input(
        &self,
        socket: &dyn InputSocket,
        ctx: &DriverContext,
    ) -> io::Result<Box<dyn InputContainer>> {
        let stream = socket.stream(None)?;
        let reader: Box<dyn Read + Send> = if self.gzip {
            Box::new(GzDecoder::new(stream))
        } else {
            stream
        };
        Ok(Box::new(TarInputContainer::read_from(reader, ctx)?))
    }

    fn output(
        &self,
        stream: Box<dyn OutputStream>,
        _ctx: &DriverContext,
    ) -> io::Result<Box<dyn OutputContainer>> {
        Ok(Box::new(TarOutputContainer::new(stream, self.gzip)))
    }
}
