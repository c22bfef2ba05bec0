//! Herein lies the brains of the federated archive file system.
//!
//! Archive files mount as directories, nestably: a [`Context`] resolves
//! paths like `data/backup.tar/docs/readme.txt` into controller chains, one
//! controller per mount point, each writing the bytes of its own archive
//! file through its parent. Use [`Context::builder`] to wire up drivers, a
//! buffer pool and a key provider, then address entries by path.

pub mod cache;
pub mod container;
pub mod controller;
pub mod driver;
mod entry;
mod error;
pub mod key;
mod mount;
pub mod path;
pub mod pool;
mod socket;
pub mod tree;

pub use cache::Strategy;
pub use container::multiplex::Multiplexer;
pub use container::{InputContainer, OutputContainer};
pub use controller::{
    ArchiveController, Controller, FileController, Phase, SyncOptions, WaitMode,
};
pub use driver::{Driver, DriverContext, DriverRegistry};
pub use entry::{Access, Entry, EntryKind, Permissions, Principal, SizeKind};
pub use error::{is_busy, BusyError, FsError, KeyError, SyncError, SyncIssue};
pub use key::{FixedKeyProvider, KeyProvider, KeyRing, SecretKey};
pub use mount::{Context, ContextBuilder};
pub use path::NodePath;
pub use pool::{Buffer, MemoryPool, Pool, TempPool};
pub use socket::{copy, InputSocket, OutputSocket, OutputStream, ReadChannel};
pub use tree::{FileTree, MakeOptions, TreeEvent, TreeListener};
