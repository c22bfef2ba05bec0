//! Error taxonomy for the controller core.

use std::io;
use std::path::PathBuf;

use crate::path::NodePath;

/// Errors raised by tree and controller mutation operations.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("no entry at `{path}`")]
    NotFound { path: NodePath },

    #[error("entry already exists at `{path}`")]
    AlreadyExists { path: NodePath },

    #[error("no parent directory for `{path}`")]
    NoSuchParent { path: NodePath },

    #[error("directory `{path}` is not empty")]
    NotEmpty { path: NodePath },

    #[error("cannot create entry of this kind at `{path}`")]
    UnsupportedKind { path: NodePath },

    #[error("access denied for `{path}`")]
    AccessDenied { path: NodePath },

    #[error("file system is mid-sync, retry after it completes")]
    Stale,

    #[error("only one listener may be registered at a time")]
    ListenerCapacityExceeded,

    #[error("I/O failure on `{path}`")]
    Io {
        path: NodePath,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    pub(crate) fn io(path: &NodePath, source: io::Error) -> FsError {
        FsError::Io {
            path: path.clone(),
            source,
        }
    }
}

/// Recoverable contention on a container's single writer slot.
///
/// The same request can be retried once the busy entry's stream is closed;
/// no other state needs resetting.
#[derive(Debug, Clone, thiserror::Error)]
#[error("output container is busy writing `{path}`")]
pub struct BusyError {
    pub path: NodePath,
}

impl From<BusyError> for io::Error {
    fn from(err: BusyError) -> io::Error {
        io::Error::new(io::ErrorKind::WouldBlock, err)
    }
}

/// Check whether an I/O error is the container-busy condition.
pub fn is_busy(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        && err
            .get_ref()
            .map(|inner| inner.is::<BusyError>())
            .unwrap_or(false)
}

/// One non-fatal problem encountered while syncing.
#[derive(Debug, thiserror::Error)]
pub enum SyncIssue {
    #[error("stream for `{path}` was forcibly closed")]
    ForceClosedStream { path: NodePath },

    #[error("entry `{path}` could not be flushed")]
    EntryFlush {
        path: NodePath,
        #[source]
        source: io::Error,
    },
}

/// Outcome of a failed or partially clean `sync`.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The sync committed, but one or more non-fatal issues occurred.
    #[error("sync completed with {} issue(s)", issues.len())]
    Warn { issues: Vec<SyncIssue> },

    /// The sync did not commit. The original archive file is untouched.
    #[error("sync failed, backing file left unchanged")]
    Fail {
        #[source]
        source: io::Error,
        issues: Vec<SyncIssue>,
    },

    /// Open streams were still present, waiting was requested, and the wait
    /// timed out without force-close being enabled.
    #[error("timed out waiting for {open} open stream(s)")]
    Timeout { open: usize },
}

/// Errors from obtaining or validating an archive key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    #[error("no key available for `{mount}`")]
    Unavailable { mount: PathBuf },

    #[error("key prompt cancelled for `{mount}`")]
    Cancelled { mount: PathBuf },
}

impl From<KeyError> for io::Error {
    fn from(err: KeyError) -> io::Error {
        io::Error::new(io::ErrorKind::PermissionDenied, err)
    }
}

/// Map authentication and integrity failures onto an ordinary I/O error so
/// that a tampered archive reads like any unreadable file.
pub(crate) fn corruption<E>(message: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_round_trips_through_io_error() {
        let busy = BusyError {
            path: NodePath::new("a.txt").unwrap(),
        };
        let err: io::Error = busy.into();
        assert!(is_busy(&err));
        assert!(!is_busy(&io::Error::other("nope")));
        assert!(!is_busy(&io::Error::from(io::ErrorKind::WouldBlock)));
    }
}
