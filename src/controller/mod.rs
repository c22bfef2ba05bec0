//! Controllers: one per mount point.
//!
//! A controller exposes the `node`/`input`/`output`/`make`/`unlink`/`sync`
//! contract over one mounted file system and delegates the bytes of its own
//! backing file to the parent controller. The chain terminates at the real
//! file system controller, which has no parent and talks to platform I/O
//! directly.

use std::io;
use std::time::Duration;

use crate::entry::{Access, Entry, EntryKind};
use crate::error::{FsError, SyncError};
use crate::path::NodePath;
use crate::socket::{InputSocket, OutputSocket};
use crate::tree::MakeOptions;

mod archive;
mod file;

pub use archive::{ArchiveController, Phase};
pub use file::FileController;

/// How long `sync` waits for entry streams other threads still hold open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Do not wait at all.
    DontWait,
    /// Wait until every stream closes, however long that takes.
    WaitForever,
    /// Wait at most this long.
    WaitFor(Duration),
}

/// Options for [`Controller::sync`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Discard pending changes instead of committing them.
    pub abort_changes: bool,
    /// Waiting policy for streams still open in other threads.
    pub wait: WaitMode,
    /// After the wait runs out, forcibly disconnect lingering streams
    /// instead of failing the sync.
    pub force_close: bool,
    /// Drop every cache slot once the sync committed.
    pub clear_cache: bool,
}

impl Default for SyncOptions {
    fn default() -> SyncOptions {
        SyncOptions {
            abort_changes: false,
            wait: WaitMode::DontWait,
            force_close: true,
            clear_cache: false,
        }
    }
}

impl SyncOptions {
    pub fn abort() -> SyncOptions {
        SyncOptions {
            abort_changes: true,
            ..Default::default()
        }
    }
}

/// The externally visible contract of a mount point.
pub trait Controller: Send + Sync {
    /// The entry at `path`, or `None` when absent. Fails only on access
    /// failure, not on absence.
    fn node(&self, path: &NodePath) -> io::Result<Option<Entry>>;

    /// Fail if any of the requested access modes is denied.
    fn check_access(&self, path: &NodePath, accesses: &[Access]) -> Result<(), FsError>;

    /// A stateless input socket over the entry's content.
    fn input(&self, path: &NodePath) -> io::Result<Box<dyn InputSocket>>;

    /// A stateless output socket for the entry's content. The template, if
    /// given, seeds the attributes of a newly created entry.
    fn output(&self, path: &NodePath, template: Option<Entry>)
        -> io::Result<Box<dyn OutputSocket>>;

    /// Create a new entry.
    fn make(&self, path: &NodePath, kind: EntryKind, options: &MakeOptions)
        -> Result<(), FsError>;

    /// Remove an entry. Directories must be empty.
    fn unlink(&self, path: &NodePath) -> Result<(), FsError>;

    /// Commit buffered and structural changes to the backing store.
    fn sync(&self, options: &SyncOptions) -> Result<(), SyncError>;
}
