//! The real file system controller: the root of every federation chain.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::entry::{Access, Entry, EntryKind, Permissions, SizeKind};
use crate::error::{FsError, SyncError};
use crate::path::NodePath;
use crate::socket::{InputSocket, OutputSocket, OutputStream, ReadChannel};
use crate::tree::MakeOptions;

use super::{Controller, SyncOptions};

/// Serves a directory of the platform file system under the controller
/// contract. Has no parent; archive controllers bottom out here.
pub struct FileController {
    root: PathBuf,
}

impl FileController {
    pub fn new<P: Into<PathBuf>>(root: P) -> FileController {
        FileController { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &NodePath) -> PathBuf {
        self.root.join(path.to_path_buf())
    }
}

fn entry_from_metadata(path: &NodePath, meta: &fs::Metadata) -> Entry {
    let kind = if meta.is_dir() {
        EntryKind::Directory
    } else if meta.file_type().is_symlink() {
        EntryKind::Symlink
    } else if meta.is_file() {
        EntryKind::File
    } else {
        EntryKind::Special
    };

    let mut entry = Entry::new(path.clone(), kind);
    entry.set_size(SizeKind::Data, Some(meta.len()));
    entry.set_size(SizeKind::Storage, Some(meta.len()));
    if let Ok(modified) = meta.modified() {
        entry.set_time(Access::Write, Some(modified));
    }
    if let Ok(created) = meta.created() {
        entry.set_time(Access::Create, Some(created));
    }
    if let Ok(accessed) = meta.accessed() {
        entry.set_time(Access::Read, Some(accessed));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        entry.permissions = Some(Permissions::from_unix_mode(meta.permissions().mode()));
    }
    #[cfg(not(unix))]
    {
        if meta.permissions().readonly() {
            let mut perms = Permissions::allow_all();
            for principal in [
                crate::entry::Principal::User,
                crate::entry::Principal::Group,
                crate::entry::Principal::Other,
            ] {
                perms.set(Access::Write, principal, false);
                perms.set(Access::Create, principal, false);
            }
            entry.permissions = Some(perms);
        }
    }

    entry
}

impl Controller for FileController {
    fn node(&self, path: &NodePath) -> io::Result<Option<Entry>> {
        match fs::symlink_metadata(self.resolve(path)) {
            Ok(meta) => Ok(Some(entry_from_metadata(path, &meta))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn check_access(&self, path: &NodePath, accesses: &[Access]) -> Result<(), FsError> {
        let entry = self
            .node(path)
            .map_err(|err| FsError::io(path, err))?
            .ok_or_else(|| FsError::NotFound { path: path.clone() })?;
        for access in accesses {
            if !entry.is_permitted(*access, crate::entry::Principal::User) {
                return Err(FsError::AccessDenied { path: path.clone() });
            }
        }
        Ok(())
    }

    fn input(&self, path: &NodePath) -> io::Result<Box<dyn InputSocket>> {
        Ok(Box::new(FileInputSocket {
            path: path.clone(),
            target: self.resolve(path),
        }))
    }

    fn output(
        &self,
        path: &NodePath,
        template: Option<Entry>,
    ) -> io::Result<Box<dyn OutputSocket>> {
        Ok(Box::new(FileOutputSocket {
            path: path.clone(),
            target: self.resolve(path),
            template,
        }))
    }

    fn make(&self, path: &NodePath, kind: EntryKind, options: &MakeOptions) -> Result<(), FsError> {
        let target = self.resolve(path);
        let result = match kind {
            EntryKind::Directory => {
                if options.create_parents {
                    // create_dir_all tolerates existing directories, which
                    // the contract does not.
                    if target.is_dir() {
                        return Err(FsError::AlreadyExists { path: path.clone() });
                    }
                    fs::create_dir_all(&target)
                } else {
                    fs::create_dir(&target)
                }
            }
            EntryKind::File => {
                if options.create_parents {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent).map_err(|e| FsError::io(path, e))?;
                    }
                }
                OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&target)
                    .map(|_| ())
            }
            EntryKind::Symlink | EntryKind::Special => {
                return Err(FsError::UnsupportedKind { path: path.clone() });
            }
        };

        result.map_err(|err| match err.kind() {
            io::ErrorKind::AlreadyExists => FsError::AlreadyExists { path: path.clone() },
            io::ErrorKind::NotFound => FsError::NoSuchParent { path: path.clone() },
            _ => FsError::io(path, err),
        })
    }

    fn unlink(&self, path: &NodePath) -> Result<(), FsError> {
        let target = self.resolve(path);
        let meta = fs::symlink_metadata(&target).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => FsError::NotFound { path: path.clone() },
            _ => FsError::io(path, err),
        })?;

        if meta.is_dir() {
            let mut children = fs::read_dir(&target).map_err(|e| FsError::io(path, e))?;
            if children.next().is_some() {
                return Err(FsError::NotEmpty { path: path.clone() });
            }
            fs::remove_dir(&target).map_err(|e| FsError::io(path, e))
        } else {
            fs::remove_file(&target).map_err(|e| FsError::io(path, e))
        }
    }

    fn sync(&self, _options: &SyncOptions) -> Result<(), SyncError> {
        // The platform file system is already durable; entry streams commit
        // on their own.
        Ok(())
    }
}

struct FileInputSocket {
    path: NodePath,
    target: PathBuf,
}

impl InputSocket for FileInputSocket {
    fn target(&self) -> io::Result<Entry> {
        let meta = fs::symlink_metadata(&self.target)?;
        Ok(entry_from_metadata(&self.path, &meta))
    }

    fn stream(&self, _peer: Option<&dyn OutputSocket>) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&self.target)?))
    }

    fn channel(&self) -> io::Result<Box<dyn ReadChannel>> {
        Ok(Box::new(File::open(&self.target)?))
    }
}

struct FileOutputSocket {
    path: NodePath,
    target: PathBuf,
    template: Option<Entry>,
}

impl OutputSocket for FileOutputSocket {
    fn target(&self) -> io::Result<Entry> {
        match fs::symlink_metadata(&self.target) {
            Ok(meta) => Ok(entry_from_metadata(&self.path, &meta)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Ok(Entry::file(self.path.clone()))
            }
            Err(err) => Err(err),
        }
    }

    fn stream(&self, _peer: Option<&dyn InputSocket>) -> io::Result<Box<dyn OutputStream>> {
        let dir = self.target.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "target path has no parent")
        })?;
        // The temp file sits next to the target so the final rename stays on
        // one file system and is atomic.
        let temp = NamedTempFile::new_in(dir)?;
        Ok(Box::new(FileOutputStream {
            path: self.path.clone(),
            target: self.target.clone(),
            temp: Some(temp),
            template: self.template.clone(),
            written: 0,
        }))
    }
}

struct FileOutputStream {
    path: NodePath,
    target: PathBuf,
    temp: Option<NamedTempFile>,
    template: Option<Entry>,
    written: u64,
}

impl Write for FileOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let temp = self
            .temp
            .as_mut()
            .ok_or_else(|| io::Error::other("stream already committed"))?;
        let n = temp.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.temp.as_mut() {
            Some(temp) => temp.flush(),
            None => Ok(()),
        }
    }
}

impl OutputStream for FileOutputStream {
    fn commit(mut self: Box<Self>) -> io::Result<Entry> {
        let mut temp = self
            .temp
            .take()
            .ok_or_else(|| io::Error::other("stream already committed"))?;
        temp.flush()?;

        if let Some(write_time) = self.template.as_ref().and_then(|t| t.time(Access::Write)) {
            let _ = temp.as_file().set_modified(write_time);
        }

        // On failure the temp file comes back in the error and is deleted
        // when it drops, before the error surfaces.
        temp.persist(&self.target).map_err(|err| err.error)?;

        let meta = fs::symlink_metadata(&self.target)?;
        Ok(entry_from_metadata(&self.path, &meta))
    }
}

// Dropping an uncommitted stream deletes the temp file via NamedTempFile's
// own drop; the target never changes.
