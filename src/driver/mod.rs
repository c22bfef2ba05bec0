//! Archive format drivers.
//!
//! A driver is the factory for the input/output containers of one archive
//! format. The controller core never touches a codec directly; it asks the
//! driver for containers over sockets it obtained from the parent file
//! system.

use std::io::{self, Read};
use std::sync::Arc;

use crate::container::{InputContainer, OutputContainer};
use crate::entry::Entry;
use crate::key::SecretKey;
use crate::pool::Pool;
use crate::socket::{InputSocket, OutputSocket, OutputStream};

pub mod mem;
#[cfg(feature = "seal")]
pub mod seal;
#[cfg(feature = "tar")]
pub mod tar;

/// Everything a driver may need while building containers.
pub struct DriverContext {
    pub pool: Arc<dyn Pool>,
    /// Key for the mount, present when the driver declared `needs_key`.
    pub key: Option<SecretKey>,
}

pub trait Driver: Send + Sync {
    /// Whether mounting archives of this format requires a key.
    fn needs_key(&self) -> bool {
        false
    }

    /// Build an input container by reading one archive image through
    /// `socket`.
    fn input(
        &self,
        socket: &dyn InputSocket,
        ctx: &DriverContext,
    ) -> io::Result<Box<dyn InputContainer>>;

    /// Build an output container assembling a fresh image into `stream`.
    fn output(
        &self,
        stream: Box<dyn OutputStream>,
        ctx: &DriverContext,
    ) -> io::Result<Box<dyn OutputContainer>>;
}

/// Maps file name suffixes to drivers. Longest suffix wins, so `tar.gz`
/// beats `gz`.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    entries: Vec<(String, Arc<dyn Driver>)>,
}

impl DriverRegistry {
    pub fn new() -> DriverRegistry {
        DriverRegistry::default()
    }

    /// Register a driver for a suffix given without the leading dot.
    pub fn register<S: Into<String>>(&mut self, suffix: S, driver: Arc<dyn Driver>) {
        self.entries.push((suffix.into(), driver));
    }

    /// Find the driver for a file name, if any suffix matches.
    pub fn lookup(&self, file_name: &str) -> Option<Arc<dyn Driver>> {
        self.entries
            .iter()
            .filter(|(suffix, _)| {
                file_name.len() > suffix.len() + 1
                    && file_name.ends_with(suffix.as_str())
                    && file_name.as_bytes()[file_name.len() - suffix.len() - 1] == b'.'
            })
            .max_by_key(|(suffix, _)| suffix.len())
            .map(|(_, driver)| driver.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A socket over an in-memory byte image, used by decorating drivers that
/// must transform the whole image before handing it on.
pub(crate) struct BytesInputSocket {
    pub entry: Entry,
    pub bytes: Arc<Vec<u8>>,
}

impl InputSocket for BytesInputSocket {
    fn target(&self) -> io::Result<Entry> {
        Ok(self.entry.clone())
    }

    fn stream(&self, _peer: Option<&dyn OutputSocket>) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(io::Cursor::new(ArcBytes(self.bytes.clone()))))
    }
}

/// `AsRef<[u8]>` view over shared bytes so a `Cursor` can serve them
/// without copying per stream.
struct ArcBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for ArcBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
