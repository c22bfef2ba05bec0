//! Stateless stream factories bound to a single target entry.
//!
//! A socket never holds an open stream itself: every `stream()` call opens a
//! fresh, independent one, which is what makes socket-level retries and
//! repeated reads safe.

use std::io::{self, Read, Seek, Write};

use crate::entry::Entry;

/// A readable, seekable channel over one entry's content.
pub trait ReadChannel: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadChannel for T {}

/// Factory for input streams over one target entry.
pub trait InputSocket: Send + Sync {
    /// Describe the target entry as currently known.
    fn target(&self) -> io::Result<Entry>;

    /// Open a fresh stream over the target's content.
    ///
    /// The optional peer is the socket on the other side of a copy, so an
    /// implementation can special-case a same-format direct transfer.
    fn stream(&self, peer: Option<&dyn OutputSocket>) -> io::Result<Box<dyn Read + Send>>;

    /// Open a seekable channel over the target's content.
    ///
    /// Not every backing store supports this; the default signals
    /// unsupported.
    fn channel(&self) -> io::Result<Box<dyn ReadChannel>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "seekable channel not supported by this socket",
        ))
    }
}

/// A stream produced by an [`OutputSocket`].
///
/// Written data only becomes visible to the target once `commit` is called;
/// dropping the stream abandons the write and leaves the target as it was.
pub trait OutputStream: Write + Send {
    /// Finish the write, making it visible atomically where the backing
    /// store supports it. Returns the target entry with final sizes and
    /// times filled in.
    fn commit(self: Box<Self>) -> io::Result<Entry>;
}

/// Factory for output streams over one target entry.
pub trait OutputSocket: Send + Sync {
    /// Describe the target entry as currently known.
    fn target(&self) -> io::Result<Entry>;

    /// Open a fresh output stream for the target's content.
    fn stream(&self, peer: Option<&dyn InputSocket>) -> io::Result<Box<dyn OutputStream>>;
}

/// Copy one entry's content to another, supplying each socket as the other's
/// peer so same-format transfers can skip recoding.
pub fn copy(input: &dyn InputSocket, output: &dyn OutputSocket) -> io::Result<Entry> {
    let mut reader = input.stream(Some(output))?;
    let mut writer = output.stream(Some(input))?;
    io::copy(&mut reader, &mut writer)?;
    writer.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Entry, SizeKind};
    use crate::path::NodePath;
    use std::sync::{Arc, Mutex};

    struct BytesInput(Vec<u8>);

    impl InputSocket for BytesInput {
        fn target(&self) -> io::Result<Entry> {
            let mut entry = Entry::file(NodePath::new("in").unwrap());
            entry.set_size(SizeKind::Data, Some(self.0.len() as u64));
            Ok(entry)
        }

        fn stream(&self, _peer: Option<&dyn OutputSocket>) -> io::Result<Box<dyn Read + Send>> {
            Ok(Box::new(io::Cursor::new(self.0.clone())))
        }
    }

    struct SinkOutput(Arc<Mutex<Vec<u8>>>);

    struct SinkStream {
        buf: Vec<u8>,
        sink: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for SinkStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buf.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl OutputStream for SinkStream {
        fn commit(self: Box<Self>) -> io::Result<Entry> {
            let mut entry = Entry::file(NodePath::new("out").unwrap());
            entry.set_size(SizeKind::Data, Some(self.buf.len() as u64));
            *self.sink.lock().unwrap() = self.buf;
            Ok(entry)
        }
    }

    impl OutputSocket for SinkOutput {
        fn target(&self) -> io::Result<Entry> {
            Ok(Entry::file(NodePath::new("out").unwrap()))
        }

        fn stream(&self, _peer: Option<&dyn InputSocket>) -> io::Result<Box<dyn OutputStream>> {
            Ok(Box::new(SinkStream {
                buf: vec![],
                sink: self.0.clone(),
            }))
        }
    }

    #[test]
    fn copy_between_sockets() {
        let sink = Arc::new(Mutex::new(vec![]));
        let input = BytesInput(b"hello".to_vec());
        let output = SinkOutput(sink.clone());

        let entry = copy(&input, &output).unwrap();
        assert_eq!(entry.size(SizeKind::Data), Some(5));
        assert_eq!(&*sink.lock().unwrap(), b"hello");
    }

    #[test]
    fn streams_are_independent() {
        let input = BytesInput(b"abc".to_vec());
        let mut one = input.stream(None).unwrap();
        let mut two = input.stream(None).unwrap();

        let mut buf = String::new();
        one.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "abc");

        buf.clear();
        two.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "abc");
    }

    #[test]
    fn uncommitted_stream_leaves_target_untouched() {
        let sink = Arc::new(Mutex::new(b"old".to_vec()));
        let output = SinkOutput(sink.clone());

        let mut stream = output.stream(None).unwrap();
        stream.write_all(b"new").unwrap();
        drop(stream);

        assert_eq!(&*sink.lock().unwrap(), b"old");
    }

    #[test]
    fn channel_default_is_unsupported() {
        let input = BytesInput(vec![]);
        let err = input.channel().err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
