//! The process-wide context: driver registry, buffer pool, key ring and the
//! controller cache, passed explicitly to whatever needs them.
//!
//! A platform path like `data/backup.tar/docs/readme.txt` is resolved by
//! walking its segments: every non-final segment whose name matches a
//! registered archive suffix becomes a mount point with its own controller,
//! chained to the controller of the file system containing it.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::Strategy;
use crate::controller::{ArchiveController, Controller, FileController, SyncOptions};
use crate::driver::{Driver, DriverRegistry};
use crate::entry::{Entry, EntryKind};
use crate::error::{FsError, SyncError, SyncIssue};
use crate::key::{KeyProvider, KeyRing};
use crate::path::NodePath;
use crate::pool::{Pool, TempPool};
use crate::socket::{InputSocket, OutputSocket};
use crate::tree::MakeOptions;

pub struct ContextBuilder {
    root: PathBuf,
    strategy: Strategy,
    pool: Option<Arc<dyn Pool>>,
    drivers: DriverRegistry,
    key_provider: Option<Arc<dyn KeyProvider>>,
}

impl ContextBuilder {
    pub fn new<P: Into<PathBuf>>(root: P) -> ContextBuilder {
        ContextBuilder {
            root: root.into(),
            strategy: Strategy::WriteBack,
            pool: None,
            drivers: DriverRegistry::new(),
            key_provider: None,
        }
    }

    pub fn strategy(mut self, strategy: Strategy) -> ContextBuilder {
        self.strategy = strategy;
        self
    }

    pub fn pool(mut self, pool: Arc<dyn Pool>) -> ContextBuilder {
        self.pool = Some(pool);
        self
    }

    pub fn driver<S: Into<String>>(mut self, suffix: S, driver: Arc<dyn Driver>) -> ContextBuilder {
        self.drivers.register(suffix, driver);
        self
    }

    pub fn key_provider(mut self, provider: Arc<dyn KeyProvider>) -> ContextBuilder {
        self.key_provider = Some(provider);
        self
    }

    pub fn build(mut self) -> Context {
        #[cfg(feature = "tar")]
        if self.drivers.is_empty() {
            self.drivers
                .register("tar", Arc::new(crate::driver::tar::TarDriver::new()));
            let gz: Arc<dyn Driver> = Arc::new(crate::driver::tar::TarDriver::gz());
            self.drivers.register("tar.gz", gz.clone());
            self.drivers.register("tgz", gz);
        }

        Context {
            file: Arc::new(FileController::new(self.root.clone())),
            root: self.root,
            strategy: self.strategy,
            pool: self.pool.unwrap_or_else(|| Arc::new(TempPool::new())),
            drivers: self.drivers,
            keys: Arc::new(KeyRing::new(self.key_provider)),
            controllers: Mutex::new(HashMap::new()),
        }
    }
}

pub struct Context {
    root: PathBuf,
    file: Arc<FileController>,
    strategy: Strategy,
    pool: Arc<dyn Pool>,
    drivers: DriverRegistry,
    keys: Arc<KeyRing>,
    controllers: Mutex<HashMap<PathBuf, Arc<ArchiveController>>>,
}

impl Context {
    pub fn builder<P: Into<PathBuf>>(root: P) -> ContextBuilder {
        ContextBuilder::new(root)
    }

    pub fn pool(&self) -> &Arc<dyn Pool> {
        &self.pool
    }

    pub fn keys(&self) -> &Arc<KeyRing> {
        &self.keys
    }

    fn controller_at(
        &self,
        mount: PathBuf,
        parent: Arc<dyn Controller>,
        parent_path: NodePath,
        driver: Arc<dyn Driver>,
    ) -> Arc<ArchiveController> {
        let mut controllers = self.controllers.lock();
        controllers
            .entry(mount.clone())
            .or_insert_with(|| {
                ArchiveController::new(
                    mount,
                    parent,
                    parent_path,
                    driver,
                    self.pool.clone(),
                    self.keys.clone(),
                    self.strategy,
                )
            })
            .clone()
    }

    /// Resolve a path into the controller responsible for it plus the path
    /// relative to that controller. The final segment is treated as an
    /// entry, never mounted.
    pub fn resolve<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> io::Result<(Arc<dyn Controller>, NodePath)> {
        let path = NodePath::new(path).map_err(|e| e.as_io_error())?;
        let segments: Vec<String> = path.iter().map(|s| s.to_string()).collect();

        let mut controller: Arc<dyn Controller> = self.file.clone();
        let mut mount = self.root.clone();
        let mut rel = NodePath::ROOT;

        for (index, segment) in segments.iter().enumerate() {
            rel = rel.child(segment);
            let is_last = index + 1 == segments.len();
            if is_last {
                break;
            }
            if let Some(driver) = self.drivers.lookup(segment) {
                mount = mount.join(rel.to_path_buf());
                controller =
                    self.controller_at(mount.clone(), controller, rel.clone(), driver);
                rel = NodePath::ROOT;
            }
        }

        Ok((controller, rel))
    }

    /// The controller for the inside of the archive at `path`, mounting it
    /// if needed.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> io::Result<Arc<ArchiveController>> {
        let (parent, rel) = self.resolve(&path)?;
        let name = rel.filename().to_string();
        let driver = self.drivers.lookup(&name).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no driver for `{name}`"),
            )
        })?;
        let mount = self.root.join(NodePath::new(&path).map_err(|e| e.as_io_error())?.to_path_buf());
        Ok(self.controller_at(mount, parent, rel, driver))
    }

    pub fn node<P: AsRef<Path>>(&self, path: P) -> io::Result<Option<Entry>> {
        let (controller, rel) = self.resolve(path)?;
        controller.node(&rel)
    }

    pub fn input<P: AsRef<Path>>(&self, path: P) -> io::Result<Box<dyn InputSocket>> {
        let (controller, rel) = self.resolve(path)?;
        controller.input(&rel)
    }

    pub fn output<P: AsRef<Path>>(
        &self,
        path: P,
        template: Option<Entry>,
    ) -> io::Result<Box<dyn OutputSocket>> {
        let (controller, rel) = self.resolve(path)?;
        controller.output(&rel, template)
    }

    pub fn make<P: AsRef<Path>>(
        &self,
        path: P,
        kind: EntryKind,
        options: &MakeOptions,
    ) -> Result<(), FsError> {
        let (controller, rel) = self
            .resolve(path)
            .map_err(|e| FsError::io(&NodePath::ROOT, e))?;
        controller.make(&rel, kind, options)
    }

    /// Unlink an entry. Unlinking a mount point's own archive file evicts
    /// its controller (and any nested ones) and invalidates its key.
    pub fn unlink<P: AsRef<Path>>(&self, path: P) -> Result<(), FsError> {
        let (controller, rel) = self
            .resolve(&path)
            .map_err(|e| FsError::io(&NodePath::ROOT, e))?;

        controller.unlink(&rel)?;

        // The backing file is gone: any controller mounted on it (or nested
        // below it) unmounts and loses its cached key.
        let mount = self
            .root
            .join(NodePath::new(&path).map_err(|e| FsError::io(&rel, e.as_io_error()))?.to_path_buf());
        let evicted: Vec<Arc<ArchiveController>> = {
            let mut controllers = self.controllers.lock();
            let keys: Vec<PathBuf> = controllers
                .keys()
                .filter(|k| *k == &mount || k.starts_with(&mount))
                .cloned()
                .collect();
            keys.iter().filter_map(|k| controllers.remove(k)).collect()
        };
        for child in &evicted {
            child.discard();
            self.keys.invalidate(child.mount_point());
        }
        Ok(())
    }

    /// Sync every mounted controller, children before parents, so nested
    /// changes write through before the enclosing archive commits.
    pub fn sync_all(&self, options: &SyncOptions) -> Result<(), SyncError> {
        let mut mounted: Vec<(PathBuf, Arc<ArchiveController>)> = {
            let controllers = self.controllers.lock();
            controllers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        mounted.sort_by_key(|(mount, _)| std::cmp::Reverse(mount.components().count()));

        let mut issues: Vec<SyncIssue> = vec![];
        for (_, controller) in mounted {
            match controller.sync(options) {
                Ok(()) => {}
                Err(SyncError::Warn { issues: more }) => issues.extend(more),
                Err(fatal) => return Err(fatal),
            }
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Warn { issues })
        }
    }

    /// Sync the controllers at and under `path`, then evict them. The next
    /// access remounts from the committed archives.
    pub fn umount<P: AsRef<Path>>(&self, path: P, options: &SyncOptions) -> Result<(), SyncError> {
        let mount = self.root.join(
            NodePath::new(&path)
                .map_err(|e| SyncError::Fail {
                    source: e.as_io_error(),
                    issues: vec![],
                })?
                .to_path_buf(),
        );

        let mut targets: Vec<(PathBuf, Arc<ArchiveController>)> = {
            let controllers = self.controllers.lock();
            controllers
                .iter()
                .filter(|(k, _)| **k == mount || k.starts_with(&mount))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        targets.sort_by_key(|(mount, _)| std::cmp::Reverse(mount.components().count()));

        let mut issues: Vec<SyncIssue> = vec![];
        for (key, controller) in &targets {
            match controller.sync(options) {
                Ok(()) => {}
                Err(SyncError::Warn { issues: more }) => issues.extend(more),
                Err(fatal) => return Err(fatal),
            }
            controller.discard();
            self.controllers.lock().remove(key);
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Warn { issues })
        }
    }

    /// Explicit shutdown: commit everything, then drop the context.
    pub fn close(self) -> Result<(), SyncError> {
        self.sync_all(&SyncOptions::default())
    }
}
