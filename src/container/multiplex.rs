//! Lifts the single-writer constraint of an output container.
//!
//! While the underlying container is busy, new entry streams are redirected
//! into pool buffers and replayed in FIFO order as soon as the container
//! frees up, and unconditionally when the multiplexer itself is closed. A
//! caller never observes [`BusyError`] through this type.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::entry::{Access, Entry, SizeKind};
use crate::pool::{Buffer, Pool};
use crate::socket::OutputStream;

use super::OutputContainer;

struct Staged {
    entry: Entry,
    buffer: Buffer,
}

struct State {
    container: Box<dyn OutputContainer>,
    queue: VecDeque<Staged>,
    /// A direct stream currently owns the inner writer slot.
    direct_open: bool,
    closed: bool,
}

impl State {
    fn slot_free(&self) -> bool {
        !self.direct_open && !self.container.is_busy()
    }

    /// Replay queued entries while the inner writer slot is free.
    fn drain_ready(&mut self) -> io::Result<()> {
        while self.slot_free() {
            let staged = match self.queue.pop_front() {
                Some(staged) => staged,
                None => break,
            };
            let result = self.replay(&staged);
            staged.buffer.release();
            result?;
        }
        Ok(())
    }

    /// Drain everything, wanted or not. Runs at close so no entry is ever
    /// silently dropped.
    fn drain_all(&mut self) -> io::Result<()> {
        while let Some(staged) = self.queue.pop_front() {
            let result = self.replay(&staged);
            staged.buffer.release();
            result?;
        }
        Ok(())
    }

    fn replay(&mut self, staged: &Staged) -> io::Result<()> {
        self.container.begin(&staged.entry)?;
        let mut reader = staged.buffer.reader()?;
        let mut buf = [0u8; 32 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let mut pos = 0;
            while pos < n {
                pos += self.container.write(&buf[pos..n])?;
            }
        }
        self.container.end()
    }
}

/// Decorator around an [`OutputContainer`] that accepts any number of
/// concurrently open entry streams.
pub struct Multiplexer {
    state: Arc<Mutex<State>>,
    pool: Arc<dyn Pool>,
}

impl Multiplexer {
    pub fn new(container: Box<dyn OutputContainer>, pool: Arc<dyn Pool>) -> Multiplexer {
        Multiplexer {
            state: Arc::new(Mutex::new(State {
                container,
                queue: VecDeque::new(),
                direct_open: false,
                closed: false,
            })),
            pool,
        }
    }

    /// Open an output stream for `entry`. Always succeeds while the
    /// multiplexer is open: contention is absorbed into a staging buffer.
    pub fn output(&self, entry: Entry) -> io::Result<Box<dyn OutputStream>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(io::Error::other("output container already closed"));
        }

        // Queued entries go first, to keep submission order.
        state.drain_ready()?;

        let size_known = entry.size(SizeKind::Data).is_some();
        let must_stage =
            !state.slot_free() || !state.queue.is_empty() || (state.container.needs_length() && !size_known);

        if must_stage {
            let buffer = self.pool.allocate()?;
            Ok(Box::new(StagedStream {
                state: self.state.clone(),
                entry: Some(entry),
                buffer: Some(buffer),
                written: 0,
            }))
        } else {
            state.container.begin(&entry)?;
            state.direct_open = true;
            Ok(Box::new(DirectStream {
                state: self.state.clone(),
                entry: Some(entry),
                written: 0,
            }))
        }
    }

    /// Record a content-less entry immediately.
    pub fn put_meta(&self, entry: &Entry) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(io::Error::other("output container already closed"));
        }
        state.container.put_meta(entry)
    }

    pub fn is_busy(&self) -> bool {
        let state = self.state.lock();
        state.direct_open || state.container.is_busy()
    }

    /// Number of staged entries awaiting replay.
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Drain every queued entry into the inner container and close it.
    pub fn close(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        if state.direct_open {
            // A stream was leaked mid-entry. End it so the drain can run.
            tracing::warn!("direct entry stream still open at container close");
            state.container.end()?;
            state.direct_open = false;
        }
        state.drain_all()?;
        state.closed = true;
        state.container.close()
    }
}

/// A stream writing straight into the inner container's writer slot.
struct DirectStream {
    state: Arc<Mutex<State>>,
    entry: Option<Entry>,
    written: u64,
}

impl Write for DirectStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let n = state.container.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl OutputStream for DirectStream {
    fn commit(mut self: Box<Self>) -> io::Result<Entry> {
        let mut entry = self.entry.take().expect("stream already committed");
        let mut state = self.state.lock();
        state.container.end()?;
        state.direct_open = false;
        entry.set_size(SizeKind::Data, Some(self.written));
        entry.set_time(Access::Write, Some(std::time::SystemTime::now()));
        let drained = state.drain_ready();
        drop(state);
        drained?;
        Ok(entry)
    }
}

impl Drop for DirectStream {
    fn drop(&mut self) {
        if self.entry.is_none() {
            return;
        }
        // The bytes are already in the serialized stream and cannot be
        // taken back; end the entry so the slot frees up.
        tracing::warn!(written = self.written, "entry stream dropped without commit");
        let mut state = self.state.lock();
        let _ = state.container.end();
        state.direct_open = false;
        let _ = state.drain_ready();
    }
}

/// A stream staging into a pool buffer for deferred replay.
struct StagedStream {
    state: Arc<Mutex<State>>,
    entry: Option<Entry>,
    buffer: Option<Buffer>,
    written: u64,
}

impl Write for StagedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let buffer = self.buffer.as_mut().expect("stream already committed");
        let n = buffer.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.buffer.as_mut() {
            Some(buffer) => buffer.flush(),
            None => Ok(()),
        }
    }
}

impl OutputStream for StagedStream {
    fn commit(mut self: Box<Self>) -> io::Result<Entry> {
        let mut entry = self.entry.take().expect("stream already committed");
        let mut buffer = self.buffer.take().expect("stream already committed");
        buffer.flush()?;

        // The size is now known, so header-precedes-data formats can take
        // this entry on replay.
        entry.set_size(SizeKind::Data, Some(self.written));
        entry.set_time(Access::Write, Some(buffer.modified()));

        let mut state = self.state.lock();
        state.queue.push_back(Staged {
            entry: entry.clone(),
            buffer,
        });
        // Replay is deferred unless the slot happens to be free right now;
        // close() picks up whatever is still queued.
        let drained = state.drain_ready();
        drop(state);
        drained?;
        Ok(entry)
    }
}

impl Drop for StagedStream {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            if self.entry.is_some() {
                tracing::warn!(written = self.written, "staged entry stream dropped without commit");
            }
            buffer.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::busy_error;
    use crate::path::NodePath;
    use crate::pool::MemoryPool;

    type Log = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

    /// Minimal single-writer container recording completed entries into a
    /// shared log.
    struct Recorder {
        needs_length: bool,
        current: Option<(Entry, Vec<u8>)>,
        log: Log,
    }

    impl Recorder {
        fn new(needs_length: bool) -> (Recorder, Log) {
            let log: Log = Arc::new(Mutex::new(vec![]));
            (
                Recorder {
                    needs_length,
                    current: None,
                    log: log.clone(),
                },
                log,
            )
        }
    }

    fn names(log: &Log) -> Vec<String> {
        log.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    impl OutputContainer for Recorder {
        fn needs_length(&self) -> bool {
            self.needs_length
        }

        fn is_busy(&self) -> bool {
            self.current.is_some()
        }

        fn begin(&mut self, entry: &Entry) -> io::Result<()> {
            if let Some((current, _)) = &self.current {
                return Err(busy_error(&current.path));
            }
            if self.needs_length && entry.size(SizeKind::Data).is_none() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "size must be known before begin",
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
            let (entry, data) = self
                .current
                .take()
                .ok_or_else(|| io::Error::other("no entry mid-write"))?;
            self.log.lock().push((entry.name().to_string(), data));
            Ok(())
        }

        fn put_meta(&mut self, entry: &Entry) -> io::Result<()> {
            self.log.lock().push((entry.name().to_string(), vec![]));
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn path(s: &str) -> NodePath {
        NodePath::new(s).unwrap()
    }

    fn sized_file(s: &str, len: u64) -> Entry {
        let mut entry = Entry::file(path(s));
        entry.set_size(SizeKind::Data, Some(len));
        entry
    }

    #[test]
    fn single_writer_yields_busy_without_decorator() {
        let (mut recorder, _log) = Recorder::new(false);
        recorder.begin(&Entry::file(path("a"))).unwrap();
        let err = recorder.begin(&Entry::file(path("b"))).unwrap_err();
        assert!(crate::error::is_busy(&err));

        // Recoverable: end the busy entry, retry the same request.
        recorder.end().unwrap();
        recorder.begin(&Entry::file(path("b"))).unwrap();
        recorder.end().unwrap();
    }

    #[test]
    fn busy_never_surfaces_through_multiplexer() {
        let (recorder, log) = Recorder::new(false);
        let mux = Multiplexer::new(Box::new(recorder), Arc::new(MemoryPool::new()));

        let mut first = mux.output(Entry::file(path("a"))).unwrap();
        first.write_all(b"one").unwrap();

        // Inner container is busy with "a"; these stage instead of failing.
        let mut second = mux.output(Entry::file(path("b"))).unwrap();
        second.write_all(b"two").unwrap();
        let mut third = mux.output(Entry::file(path("c"))).unwrap();
        third.write_all(b"three").unwrap();

        second.commit().unwrap();
        third.commit().unwrap();
        assert_eq!(mux.queued(), 2);

        first.commit().unwrap();
        mux.close().unwrap();
        assert_eq!(names(&log), vec!["a", "b", "c"]);
    }

    #[test]
    fn replay_preserves_submission_order() {
        let pool = Arc::new(MemoryPool::new());
        let (recorder, log) = Recorder::new(false);
        let mux = Multiplexer::new(Box::new(recorder), pool.clone());

        let mut direct = mux.output(Entry::file(path("direct"))).unwrap();
        direct.write_all(b"d").unwrap();

        let staged: Vec<_> = (0..4)
            .map(|i| {
                let mut stream = mux.output(Entry::file(path(&format!("queued-{i}")))).unwrap();
                stream.write_all(format!("payload-{i}").as_bytes()).unwrap();
                stream
            })
            .collect();
        for stream in staged {
            stream.commit().unwrap();
        }

        direct.commit().unwrap();
        mux.close().unwrap();
        assert_eq!(pool.live(), 0);
        assert_eq!(
            names(&log),
            vec!["direct", "queued-0", "queued-1", "queued-2", "queued-3"]
        );
    }

    #[test]
    fn unknown_size_stages_even_when_free() {
        let (recorder, log) = Recorder::new(true);
        let mux = Multiplexer::new(Box::new(recorder), Arc::new(MemoryPool::new()));

        // Size unknown, format needs it up front: staged despite a free slot.
        let mut stream = mux.output(Entry::file(path("stored"))).unwrap();
        stream.write_all(b"stored bytes").unwrap();
        stream.commit().unwrap();

        // Size known up front: goes straight through.
        let mut direct = mux.output(sized_file("direct", 2)).unwrap();
        direct.write_all(b"ok").unwrap();
        direct.commit().unwrap();

        mux.close().unwrap();
        assert_eq!(names(&log), vec!["stored", "direct"]);

        let entries = log.lock();
        assert_eq!(entries[0].1, b"stored bytes");
    }

    #[test]
    fn close_drains_everything() {
        let pool = Arc::new(MemoryPool::new());
        let (recorder, log) = Recorder::new(false);
        let mux = Multiplexer::new(Box::new(recorder), pool.clone());

        let mut hog = mux.output(Entry::file(path("hog"))).unwrap();
        hog.write_all(b"hog").unwrap();

        for i in 0..3 {
            let mut stream = mux.output(Entry::file(path(&format!("late-{i}")))).unwrap();
            stream.write_all(b"x").unwrap();
            stream.commit().unwrap();
        }

        // The hog never commits; close must still deliver every entry.
        drop(hog);
        mux.close().unwrap();
        assert_eq!(pool.live(), 0);
        assert_eq!(names(&log), vec!["hog", "late-0", "late-1", "late-2"]);
    }

    #[test]
    fn abandoned_staged_stream_is_dropped_silently() {
        let pool = Arc::new(MemoryPool::new());
        let (recorder, log) = Recorder::new(false);
        let mux = Multiplexer::new(Box::new(recorder), pool.clone());

        let mut hog = mux.output(Entry::file(path("hog"))).unwrap();
        hog.write_all(b"hog").unwrap();

        let mut abandoned = mux.output(Entry::file(path("abandoned"))).unwrap();
        abandoned.write_all(b"gone").unwrap();
        drop(abandoned);

        hog.commit().unwrap();
        mux.close().unwrap();
        assert_eq!(pool.live(), 0);
        assert_eq!(names(&log), vec!["hog"]);
    }
}
