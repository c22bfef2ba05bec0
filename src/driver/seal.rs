//! Keyed-hash authentication around another driver's image.
//!
//! A sealed image is the inner driver's image followed by a 32-byte keyed
//! BLAKE3 tag over the payload. The tag is verified before a single payload
//! byte reaches the inner codec, so a tampered archive reads like any other
//! unreadable file.

use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::container::{InputContainer, OutputContainer};
use crate::entry::Entry;
use crate::error::corruption;
use crate::key::SecretKey;
use crate::socket::{InputSocket, OutputStream};

use super::{BytesInputSocket, Driver, DriverContext};

const TAG_LEN: usize = 32;

/// Decorates an inner driver with authentication.
pub struct SealDriver {
    inner: Arc<dyn Driver>,
}

impl SealDriver {
    pub fn new(inner: Arc<dyn Driver>) -> SealDriver {
        SealDriver { inner }
    }
}

fn key_from(ctx: &DriverContext) -> io::Result<&SecretKey> {
    ctx.key.as_ref().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::PermissionDenied,
            "sealed archive mounted without a key",
        )
    })
}

impl Driver for SealDriver {
    fn needs_key(&self) -> bool {
        true
    }

    fn input(
        &self,
        socket: &dyn InputSocket,
        ctx: &DriverContext,
    ) -> io::Result<Box<dyn InputContainer>> {
        let key = key_from(ctx)?;

        let mut image = vec![];
        socket.stream(None)?.read_to_end(&mut image)?;
        if image.len() < TAG_LEN {
            return Err(corruption("sealed image shorter than its tag"));
        }
        let payload_len = image.len() - TAG_LEN;
        let expected = blake3::keyed_hash(key.as_bytes(), &image[..payload_len]);
        let tag =
            blake3::Hash::from_bytes(<[u8; TAG_LEN]>::try_from(&image[payload_len..]).unwrap());
        // Hash comparison is constant-time.
        if expected != tag {
            return Err(corruption("sealed archive failed authentication"));
        }

        image.truncate(payload_len);
        let payload_socket = BytesInputSocket {
            entry: socket.target()?,
            bytes: Arc::new(image),
        };
        self.inner.input(&payload_socket, ctx)
    }

    fn output(
        &self,
        stream: Box<dyn OutputStream>,
        ctx: &DriverContext,
    ) -> io::Result<Box<dyn OutputContainer>> {
        let key = key_from(ctx)?;
        let sealed = SealStream {
            inner: Some(stream),
            hasher: blake3::Hasher::new_keyed(key.as_bytes()),
        };
        self.inner.output(Box::new(sealed), ctx)
    }
}

/// Hashes the payload as it streams through and appends the tag at commit.
struct SealStream {
    inner: Option<Box<dyn OutputStream>>,
    hasher: blake3::Hasher,
}

impl Write for SealStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| io::Error::other("stream already committed"))?;
        let n = inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

impl OutputStream for SealStream {
    fn commit(mut self: Box<Self>) -> io::Result<Entry> {
        let mut inner = self
            .inner
            .take()
            .ok_or_else(|| io::Error::other("stream already committed"))?;
        let tag = self.hasher.finalize();
        inner.write_all(tag.as_bytes())?;
        inner.commit()
    }
}
