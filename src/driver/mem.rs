//! A trivially serializable archive image.
//!
//! The image holds every entry's bytes in memory and round-trips through a
//! flat little-endian encoding with a per-entry CRC32. It is the fixture
//! format of the test suite and the payload format of the sealed driver,
//! not a general-purpose archive codec.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::container::{busy_error, InputContainer, OutputContainer};
use crate::entry::{Access, Entry, EntryKind, Permissions, SizeKind};
use crate::error::corruption;
use crate::path::NodePath;
use crate::socket::{InputSocket, OutputSocket, OutputStream};

use super::{Driver, DriverContext};

const MAGIC: &[u8; 4] = b"AFS1";

fn kind_to_byte(kind: EntryKind) -> u8 {
    match kind {
        EntryKind::File => 0,
        EntryKind::Directory => 1,
        EntryKind::Symlink => 2,
        EntryKind::Special => 3,
    }
}

fn kind_from_byte(byte: u8) -> io::Result<EntryKind> {
    Ok(match byte {
        0 => EntryKind::File,
        1 => EntryKind::Directory,
        2 => EntryKind::Symlink,
        3 => EntryKind::Special,
        other => return Err(corruption(format!("unknown entry kind {other}"))),
    })
}

/// One archive image, fully resident.
#[derive(Default)]
pub struct MemImage {
    pub entries: Vec<(Entry, Vec<u8>)>,
}

impl MemImage {
    pub fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for (entry, data) in &self.entries {
            writer.write_u8(kind_to_byte(entry.kind))?;
            let path = entry.path.as_str().as_bytes();
            writer.write_u16::<LittleEndian>(path.len() as u16)?;
            writer.write_all(path)?;

            let mtime = entry
                .time(Access::Write)
                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(u64::MAX);
            writer.write_u64::<LittleEndian>(mtime)?;

            let perms = entry.permissions.map(perms_to_bits).unwrap_or(u16::MAX);
            writer.write_u16::<LittleEndian>(perms)?;

            writer.write_u64::<LittleEndian>(data.len() as u64)?;
            writer.write_all(data)?;

            let mut hasher = crc32fast::Hasher::new();
            hasher.update(data);
            writer.write_u32::<LittleEndian>(hasher.finalize())?;
        }
        Ok(())
    }

    pub fn decode<R: Read>(reader: &mut R) -> io::Result<MemImage> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(corruption("bad image magic"));
        }

        let count = reader.read_u32::<LittleEndian>()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let kind = kind_from_byte(reader.read_u8()?)?;

            let path_len = reader.read_u16::<LittleEndian>()? as usize;
            let mut path = vec![0u8; path_len];
            reader.read_exact(&mut path)?;
            let path = String::from_utf8(path).map_err(corruption)?;
            let path = NodePath::new(&path).map_err(|e| e.as_io_error())?;

            let mtime = reader.read_u64::<LittleEndian>()?;
            let perms = reader.read_u16::<LittleEndian>()?;

            let data_len = reader.read_u64::<LittleEndian>()?;
            let mut data = vec![0u8; data_len as usize];
            reader.read_exact(&mut data)?;

            let stored_crc = reader.read_u32::<LittleEndian>()?;
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&data);
            if hasher.finalize() != stored_crc {
                return Err(corruption(format!("crc mismatch for `{path}`")));
            }

            let mut entry = Entry::new(path, kind);
            entry.set_size(SizeKind::Data, Some(data.len() as u64));
            entry.set_size(SizeKind::Storage, Some(data.len() as u64));
            if mtime != u64::MAX {
                entry.set_time(
                    Access::Write,
                    Some(SystemTime::UNIX_EPOCH + Duration::from_secs(mtime)),
                );
            }
            if perms != u16::MAX {
                entry.permissions = Some(perms_from_bits(perms));
            }

            entries.push((entry, data));
        }
        Ok(MemImage { entries })
    }
}

fn perms_to_bits(perms: Permissions) -> u16 {
    use crate::entry::{Access::*, Principal::*};
    let mut bits = 0u16;
    let mut shift = 0;
    for access in [Create, Read, Write] {
        for principal in [User, Group, Other] {
            if perms.get(access, principal) {
                bits |= 1 << shift;
            }
            shift += 1;
        }
    }
    bits
}

fn perms_from_bits(bits: u16) -> Permissions {
    use crate::entry::{Access::*, Principal::*};
    let mut perms = Permissions::default();
    let mut shift = 0;
    for access in [Create, Read, Write] {
        for principal in [User, Group, Other] {
            perms.set(access, principal, bits & (1 << shift) != 0);
            shift += 1;
        }
    }
    perms
}

pub struct MemInputContainer {
    image: Arc<MemImage>,
}

impl MemInputContainer {
    pub fn new(image: MemImage) -> MemInputContainer {
        MemInputContainer {
            image: Arc::new(image),
        }
    }
}

impl InputContainer for MemInputContainer {
    fn entries(&self) -> Vec<Entry> {
        self.image.entries.iter().map(|(e, _)| e.clone()).collect()
    }

    fn entry(&self, path: &NodePath) -> Option<Entry> {
        self.image
            .entries
            .iter()
            .rev()
            .find(|(e, _)| &e.path == path)
            .map(|(e, _)| e.clone())
    }

    fn input(&self, path: &NodePath) -> io::Result<Box<dyn InputSocket>> {
        Ok(Box::new(MemInputSocket {
            image: self.image.clone(),
            path: path.clone(),
        }))
    }
}

struct MemInputSocket {
    image: Arc<MemImage>,
    path: NodePath,
}

impl MemInputSocket {
    fn find(&self) -> io::Result<&(Entry, Vec<u8>)> {
        self.image
            .entries
            .iter()
            .rev()
            .find(|(e, _)| e.path == self.path)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no entry at `{}`", self.path),
                )
            })
    }
}

impl InputSocket for MemInputSocket {
    fn target(&self) -> io::Result<Entry> {
        self.find().map(|(e, _)| e.clone())
    }

    fn stream(&self, _peer: Option<&dyn OutputSocket>) -> io::Result<Box<dyn Read + Send>> {
        let (_, data) = self.find()?;
        Ok(Box::new(io::Cursor::new(data.clone())))
    }
}

pub struct MemOutputContainer {
    image: MemImage,
    current: Option<(Entry, Vec<u8>)>,
    sink: Option<Box<dyn OutputStream>>,
    require_length: bool,
}

impl MemOutputContainer {
    pub fn new(sink: Box<dyn OutputStream>) -> MemOutputContainer {
        MemOutputContainer {
            image: MemImage::default(),
            current: None,
            sink: Some(sink),
            require_length: false,
        }
    }

    /// Pretend to be a header-precedes-data format. Lets tests drive the
    /// stage-for-size path without a real such codec.
    pub fn require_length(mut self) -> MemOutputContainer {
        self.require_length = true;
        self
    }
}

impl OutputContainer for MemOutputContainer {
    fn needs_length(&self) -> bool {
        self.require_length
    }

    fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    fn begin(&mut self, entry: &Entry) -> io::Result<()> {
        if let Some((current, _)) = &self.current {
            return Err(busy_error(&current.path));
        }
        if self.require_length && entry.size(SizeKind::Data).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "entry size must be known before its bytes",
            ));
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
        let (mut entry, data) = self
            .current
            .take()
            .ok_or_else(|| io::Error::other("no entry mid-write"))?;
        entry.set_size(SizeKind::Data, Some(data.len() as u64));
        entry.set_size(SizeKind::Storage, Some(data.len() as u64));
        self.image.entries.push((entry, data));
        Ok(())
    }

    fn put_meta(&mut self, entry: &Entry) -> io::Result<()> {
        self.image.entries.push((entry.clone(), vec![]));
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if self.current.is_some() {
            return Err(io::Error::other("close with an entry mid-write"));
        }
        let mut sink = self
            .sink
            .take()
            .ok_or_else(|| io::Error::other("container already closed"))?;
        self.image.encode(&mut sink)?;
        sink.commit()?;
        Ok(())
    }
}

/// Driver for the resident image format.
#[derive(Default)]
pub struct MemDriver {
    require_length: bool,
}

impl MemDriver {
    pub fn new() -> MemDriver {
        MemDriver::default()
    }

    pub fn with_length_required() -> MemDriver {
        MemDriver {
            require_length: true,
        }
    }
}

impl Driver for MemDriver {
    fn input(
        &self,
        socket: &dyn InputSocket,
        _ctx: &DriverContext,
    ) -> io::Result<Box<dyn InputContainer>> {
        let mut reader = socket.stream(None)?;
        let image = MemImage::decode(&mut reader)?;
        Ok(Box::new(MemInputContainer::new(image)))
    }

    fn output(
        &self,
        stream: Box<dyn OutputStream>,
        _ctx: &DriverContext,
    ) -> io::Result<Box<dyn OutputContainer>> {
        let container = MemOutputContainer::new(stream);
        Ok(Box::new(if self.require_length {
            container.require_length()
        } else {
            container
        }))
    }
}
