//! Per-entry content cache between callers and the backing container.
//!
//! A slot is empty, clean (buffer mirrors the backing store and may be
//! dropped) or dirty (buffer is the only authoritative copy and must be
//! flushed before the slot or the backing store goes away). The cache is a
//! passive structure: the owning controller serializes access through its
//! lock and decides when slots flush.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::entry::Entry;
use crate::path::NodePath;
use crate::pool::{Buffer, Pool};
use crate::socket::{OutputStream, ReadChannel};

/// When the backing store learns about a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Writes are mirrored to the backing output socket before the write
    /// call returns; slots come out clean.
    WriteThrough,
    /// Writes land only in the buffer; the slot stays dirty until flushed.
    WriteBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Clean,
    Dirty,
}

struct Slot {
    buffer: Buffer,
    dirty: bool,
}

/// A write in flight into a cache slot, handed out by the controller as the
/// body of an entry output stream. Mirroring to a backing stream, when
/// configured, happens inside `write` itself.
pub struct SlotWriter {
    buffer: Buffer,
    backing: Option<Box<dyn OutputStream>>,
    written: u64,
}

impl Write for SlotWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.buffer.write(buf)?;
        if let Some(backing) = self.backing.as_mut() {
            backing.write_all(&buf[..n])?;
        }
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.buffer.flush()?;
        if let Some(backing) = self.backing.as_mut() {
            backing.flush()?;
        }
        Ok(())
    }
}

impl SlotWriter {
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Walk away from the write: the buffer goes back to the pool and any
    /// mirrored stream is dropped uncommitted.
    pub fn abandon(self) {
        self.buffer.release();
    }
}

pub struct EntryCache {
    slots: HashMap<NodePath, Slot>,
    strategy: Strategy,
    pool: Arc<dyn Pool>,
}

impl EntryCache {
    pub fn new(strategy: Strategy, pool: Arc<dyn Pool>) -> EntryCache {
        EntryCache {
            slots: HashMap::new(),
            strategy,
            pool,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn state(&self, path: &NodePath) -> SlotState {
        match self.slots.get(path) {
            None => SlotState::Empty,
            Some(slot) if slot.dirty => SlotState::Dirty,
            Some(_) => SlotState::Clean,
        }
    }

    /// Open a reader over the cached content, if any. The cache, not the
    /// backing store, is authoritative whenever a slot exists.
    pub fn reader(&self, path: &NodePath) -> Option<io::Result<Box<dyn ReadChannel>>> {
        self.slots.get(path).map(|slot| slot.buffer.reader())
    }

    pub fn data_size(&self, path: &NodePath) -> Option<u64> {
        self.slots.get(path).map(|slot| slot.buffer.len())
    }

    /// Start a write. `backing` is mirrored synchronously under the
    /// write-through strategy and ignored otherwise.
    pub fn writer(&self, backing: Option<Box<dyn OutputStream>>) -> io::Result<SlotWriter> {
        let buffer = self.pool.allocate()?;
        let backing = match self.strategy {
            Strategy::WriteThrough => backing,
            Strategy::WriteBack => {
                // No mirror: the slot will carry the bytes until sync.
                if let Some(stream) = backing {
                    drop(stream);
                }
                None
            }
        };
        Ok(SlotWriter {
            buffer,
            backing,
            written: 0,
        })
    }

    /// Install a finished write as the slot for `path`. Returns the entry
    /// the mirrored backing stream committed to, if there was one.
    pub fn commit_writer(
        &mut self,
        path: &NodePath,
        mut writer: SlotWriter,
    ) -> io::Result<Option<Entry>> {
        writer.buffer.flush()?;
        let committed = match writer.backing {
            Some(backing) => Some(backing.commit()?),
            None => None,
        };
        let dirty = match self.strategy {
            Strategy::WriteThrough => false,
            Strategy::WriteBack => true,
        };
        self.install(path, writer.buffer, dirty);
        Ok(committed)
    }

    fn install(&mut self, path: &NodePath, buffer: Buffer, dirty: bool) {
        if let Some(replaced) = self.slots.insert(path.clone(), Slot { buffer, dirty }) {
            replaced.buffer.release();
        }
    }

    /// Read-through fill: stage the backing content so later reads are
    /// served locally. The slot comes out clean.
    pub fn populate(&mut self, path: &NodePath, reader: &mut dyn Read) -> io::Result<u64> {
        let mut buffer = self.pool.allocate()?;
        let copied = io::copy(reader, &mut buffer)?;
        buffer.flush()?;
        self.install(path, buffer, false);
        Ok(copied)
    }

    /// Duplicate a slot's content under a second path (copy-based rename).
    pub fn copy_slot(&mut self, from: &NodePath, to: &NodePath) -> io::Result<()> {
        let (mut reader, dirty) = match self.slots.get(from) {
            Some(slot) => (slot.buffer.reader()?, slot.dirty),
            None => return Ok(()),
        };
        let mut buffer = self.pool.allocate()?;
        io::copy(&mut reader, &mut buffer)?;
        buffer.flush()?;
        self.install(to, buffer, dirty);
        Ok(())
    }

    pub fn mark_clean(&mut self, path: &NodePath) {
        if let Some(slot) = self.slots.get_mut(path) {
            slot.dirty = false;
        }
    }

    pub fn mark_all_clean(&mut self) {
        for slot in self.slots.values_mut() {
            slot.dirty = false;
        }
    }

    pub fn discard(&mut self, path: &NodePath) {
        if let Some(slot) = self.slots.remove(path) {
            slot.buffer.release();
        }
    }

    /// Drop every slot, dirty or not. The caller decides whether that is
    /// safe.
    pub fn clear(&mut self) {
        for (_, slot) in self.slots.drain() {
            slot.buffer.release();
        }
    }

    pub fn dirty_paths(&self) -> Vec<NodePath> {
        let mut paths: Vec<_> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.dirty)
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        paths
    }

    pub fn cached_paths(&self) -> Vec<NodePath> {
        let mut paths: Vec<_> = self.slots.keys().cloned().collect();
        paths.sort();
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::SizeKind;
    use crate::pool::MemoryPool;
    use crate::socket::OutputStream;
    use std::sync::{Arc, Mutex};

    fn path(s: &str) -> NodePath {
        NodePath::new(s).unwrap()
    }

    fn read_all(cache: &EntryCache, p: &NodePath) -> String {
        let mut out = String::new();
        cache
            .reader(p)
            .unwrap()
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        out
    }

    struct SinkStream(Arc<Mutex<Vec<u8>>>, Vec<u8>);

    impl Write for SinkStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.1.extend_from_slice(buf);
            // Mirrored synchronously: visible before commit.
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl OutputStream for SinkStream {
        fn commit(self: Box<Self>) -> io::Result<Entry> {
            let mut entry = Entry::file(path("sink"));
            entry.set_size(SizeKind::Data, Some(self.1.len() as u64));
            Ok(entry)
        }
    }

    #[test]
    fn write_back_slot_goes_dirty() {
        let mut cache = EntryCache::new(Strategy::WriteBack, Arc::new(MemoryPool::new()));
        let p = path("f");

        let mut writer = cache.writer(None).unwrap();
        writer.write_all(b"write").unwrap();
        cache.commit_writer(&p, writer).unwrap();

        assert_eq!(cache.state(&p), SlotState::Dirty);
        assert_eq!(read_all(&cache, &p), "write");
        assert_eq!(cache.dirty_paths(), vec![p.clone()]);

        cache.mark_clean(&p);
        assert_eq!(cache.state(&p), SlotState::Clean);
        // The buffer stays authoritative after the flush.
        assert_eq!(read_all(&cache, &p), "write");
    }

    #[test]
    fn write_through_mirrors_synchronously() {
        let mut cache = EntryCache::new(Strategy::WriteThrough, Arc::new(MemoryPool::new()));
        let mirror = Arc::new(Mutex::new(vec![]));
        let p = path("f");

        let mut writer = cache
            .writer(Some(Box::new(SinkStream(mirror.clone(), vec![]))))
            .unwrap();
        writer.write_all(b"abc").unwrap();
        assert_eq!(&*mirror.lock().unwrap(), b"abc");

        cache.commit_writer(&p, writer).unwrap();
        assert_eq!(cache.state(&p), SlotState::Clean);
        assert_eq!(read_all(&cache, &p), "abc");
    }

    #[test]
    fn populate_is_clean_and_served_locally() {
        let pool = Arc::new(MemoryPool::new());
        let mut cache = EntryCache::new(Strategy::WriteBack, pool.clone());
        let p = path("r");

        let copied = cache
            .populate(&p, &mut io::Cursor::new(b"backing bytes".to_vec()))
            .unwrap();
        assert_eq!(copied, 13);
        assert_eq!(cache.state(&p), SlotState::Clean);
        assert_eq!(read_all(&cache, &p), "backing bytes");

        cache.discard(&p);
        assert_eq!(cache.state(&p), SlotState::Empty);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn copy_slot_duplicates_content_and_state() {
        let mut cache = EntryCache::new(Strategy::WriteBack, Arc::new(MemoryPool::new()));
        let a = path("a");
        let b = path("b");

        let mut writer = cache.writer(None).unwrap();
        writer.write_all(b"payload").unwrap();
        cache.commit_writer(&a, writer).unwrap();

        cache.copy_slot(&a, &b).unwrap();
        assert_eq!(cache.state(&b), SlotState::Dirty);
        assert_eq!(read_all(&cache, &b), "payload");

        // Copying an empty source is a no-op.
        cache.copy_slot(&path("missing"), &path("c")).unwrap();
        assert_eq!(cache.state(&path("c")), SlotState::Empty);
    }

    #[test]
    fn clear_releases_everything() {
        let pool = Arc::new(MemoryPool::new());
        let mut cache = EntryCache::new(Strategy::WriteBack, pool.clone());
        for name in ["a", "b", "c"] {
            let mut writer = cache.writer(None).unwrap();
            writer.write_all(name.as_bytes()).unwrap();
            cache.commit_writer(&path(name), writer).unwrap();
        }
        assert_eq!(cache.dirty_paths().len(), 3);
        cache.clear();
        assert_eq!(cache.cached_paths().len(), 0);
        assert_eq!(pool.live(), 0);
    }
}
