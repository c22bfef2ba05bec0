//! The archive controller: mounts one archive file as a file system.
//!
//! All tree and cache state sits behind one `RwLock` per controller. Entry
//! stream I/O runs outside that lock; streams re-enter it only to commit.
//! The bytes of the archive file itself are read and written through the
//! parent controller, so a controller nested in another archive composes
//! for free.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::cache::{EntryCache, SlotWriter, Strategy};
use crate::container::multiplex::Multiplexer;
use crate::container::InputContainer;
use crate::driver::{Driver, DriverContext};
use crate::entry::{Access, Entry, EntryKind, Principal, SizeKind};
use crate::error::{FsError, SyncError, SyncIssue};
use crate::key::KeyRing;
use crate::path::NodePath;
use crate::pool::Pool;
use crate::socket::{InputSocket, OutputSocket, OutputStream, ReadChannel};
use crate::tree::{FileTree, MakeOptions, TreeEvent, TreeListener};

use super::{Controller, SyncOptions, WaitMode};

/// The controller's claim on the tree's single listener slot.
struct MutationLog {
    mount: PathBuf,
}

impl TreeListener for MutationLog {
    fn before_mutate(&mut self, event: &TreeEvent) {
        tracing::trace!(mount = %self.mount.display(), ?event, "mutating");
    }

    fn after_mutate(&mut self, event: &TreeEvent) {
        tracing::trace!(mount = %self.mount.display(), ?event, "mutated");
    }
}

/// Mount state machine of one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unmounted,
    Clean,
    Dirty,
    Syncing,
}

struct MountState {
    phase: Phase,
    tree: FileTree,
    cache: EntryCache,
    /// Input container over the committed image. Dropped after a sync and
    /// reopened lazily, since the image on disk has changed.
    backing: Option<Box<dyn InputContainer>>,
}

/// Disconnection flag shared with one open entry stream.
struct StreamGate {
    path: NodePath,
    disconnected: AtomicBool,
}

impl StreamGate {
    fn check(&self) -> io::Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                format!("stream for `{}` was disconnected by sync", self.path),
            ));
        }
        Ok(())
    }
}

/// Accounting of entry streams other threads hold open.
#[derive(Default)]
struct StreamRegistry {
    gates: Mutex<Vec<Weak<StreamGate>>>,
    idle: Condvar,
}

impl StreamRegistry {
    fn register(&self, path: NodePath) -> Arc<StreamGate> {
        let gate = Arc::new(StreamGate {
            path,
            disconnected: AtomicBool::new(false),
        });
        self.gates.lock().push(Arc::downgrade(&gate));
        gate
    }

    fn notify_released(&self) {
        let _gates = self.gates.lock();
        self.idle.notify_all();
    }

    fn open_paths(&self) -> Vec<NodePath> {
        let mut gates = self.gates.lock();
        gates.retain(|weak| {
            weak.upgrade()
                .map(|gate| !gate.disconnected.load(Ordering::SeqCst))
                .unwrap_or(false)
        });
        gates
            .iter()
            .filter_map(|weak| weak.upgrade())
            .map(|gate| gate.path.clone())
            .collect()
    }

    /// Wait for every registered stream to close. Returns whether the
    /// registry went idle within the waiting policy.
    fn wait_idle(&self, wait: WaitMode) -> bool {
        let deadline = match wait {
            WaitMode::WaitFor(duration) => Some(Instant::now() + duration),
            _ => None,
        };
        let mut gates = self.gates.lock();
        loop {
            gates.retain(|weak| {
                weak.upgrade()
                    .map(|gate| !gate.disconnected.load(Ordering::SeqCst))
                    .unwrap_or(false)
            });
            if gates.is_empty() {
                return true;
            }
            match wait {
                WaitMode::DontWait => return false,
                WaitMode::WaitForever => {
                    self.idle.wait(&mut gates);
                }
                WaitMode::WaitFor(_) => {
                    let deadline = deadline.expect("deadline set for bounded wait");
                    if self.idle.wait_until(&mut gates, deadline).timed_out() {
                        return false;
                    }
                }
            }
        }
    }

    /// Disconnect every open stream. Further I/O on them errors.
    fn disconnect_all(&self) -> Vec<NodePath> {
        let mut gates = self.gates.lock();
        let mut paths = vec![];
        for weak in gates.iter() {
            if let Some(gate) = weak.upgrade() {
                if !gate.disconnected.swap(true, Ordering::SeqCst) {
                    paths.push(gate.path.clone());
                }
            }
        }
        gates.clear();
        paths
    }
}

fn stale() -> io::Error {
    io::Error::other(FsError::Stale)
}

pub struct ArchiveController {
    me: Weak<ArchiveController>,
    mount: PathBuf,
    parent: Arc<dyn Controller>,
    parent_path: NodePath,
    driver: Arc<dyn Driver>,
    pool: Arc<dyn Pool>,
    keys: Arc<KeyRing>,
    state: RwLock<MountState>,
    streams: StreamRegistry,
}

impl ArchiveController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mount: PathBuf,
        parent: Arc<dyn Controller>,
        parent_path: NodePath,
        driver: Arc<dyn Driver>,
        pool: Arc<dyn Pool>,
        keys: Arc<KeyRing>,
        strategy: Strategy,
    ) -> Arc<ArchiveController> {
        Arc::new_cyclic(|me| ArchiveController {
            me: me.clone(),
            mount,
            parent,
            parent_path,
            driver,
            pool: pool.clone(),
            keys,
            state: RwLock::new(MountState {
                phase: Phase::Unmounted,
                tree: FileTree::new(),
                cache: EntryCache::new(strategy, pool),
                backing: None,
            }),
            streams: StreamRegistry::default(),
        })
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount
    }

    pub fn phase(&self) -> Phase {
        self.state.read().phase
    }

    fn arc(&self) -> Arc<ArchiveController> {
        self.me.upgrade().expect("controller is always behind an Arc")
    }

    fn driver_ctx(&self) -> io::Result<DriverContext> {
        let key = if self.driver.needs_key() {
            Some(self.keys.key_for(&self.mount)?)
        } else {
            None
        };
        Ok(DriverContext {
            pool: self.pool.clone(),
            key,
        })
    }

    /// Populate the tree from the backing archive on first access. A
    /// missing backing file mounts as a fresh empty archive.
    fn ensure_mounted(&self) -> io::Result<()> {
        if self.state.read().phase != Phase::Unmounted {
            return Ok(());
        }
        let mut state = self.state.write();
        if state.phase != Phase::Unmounted {
            return Ok(());
        }

        if self.parent.node(&self.parent_path)?.is_some() {
            let socket = self.parent.input(&self.parent_path)?;
            let container = self.driver.input(socket.as_ref(), &self.driver_ctx()?)?;
            state.tree = FileTree::from_entries(container.entries());
            state.backing = Some(container);
        } else {
            state.tree = FileTree::new();
            state.backing = None;
        }
        state
            .tree
            .register_listener(Box::new(MutationLog {
                mount: self.mount.clone(),
            }))
            .expect("fresh tree has an empty listener slot");
        state.phase = Phase::Clean;
        tracing::debug!(mount = %self.mount.display(), entries = state.tree.len(), "mounted");
        Ok(())
    }

    /// Reopen the input container after a sync dropped it.
    fn remount_backing(&self, state: &mut MountState) -> io::Result<()> {
        if state.backing.is_some() {
            return Ok(());
        }
        if self.parent.node(&self.parent_path)?.is_some() {
            let socket = self.parent.input(&self.parent_path)?;
            state.backing = Some(self.driver.input(socket.as_ref(), &self.driver_ctx()?)?);
        }
        Ok(())
    }

    fn open_reader(&self, path: &NodePath) -> io::Result<Box<dyn Read + Send>> {
        self.ensure_mounted()?;
        let mut state = self.state.write();

        let node = state.tree.resolve(path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no entry at `{path}`"))
        })?;
        let has_content = node
            .kinds()
            .any(|kind| matches!(kind, EntryKind::File | EntryKind::Symlink));

        if state.cache.reader(path).is_none() && has_content {
            // Read through: stage the backing content so the cache becomes
            // authoritative for this entry.
            self.remount_backing(&mut state)?;
            let backed = state
                .backing
                .as_ref()
                .map(|backing| backing.entry(path).is_some())
                .unwrap_or(false);
            if backed {
                let mut reader = state
                    .backing
                    .as_ref()
                    .unwrap()
                    .input(path)?
                    .stream(None)?;
                state.cache.populate(path, &mut reader)?;
            }
        }

        match state.cache.reader(path) {
            Some(reader) => {
                let gate = self.streams.register(path.clone());
                Ok(Box::new(GatedReader {
                    inner: reader?,
                    gate: Some(gate),
                    ctrl: self.arc(),
                }))
            }
            // Directory or a freshly made empty file.
            None => Ok(Box::new(io::empty())),
        }
    }

    fn open_writer(
        &self,
        path: &NodePath,
        template: Option<&Entry>,
    ) -> io::Result<Box<dyn OutputStream>> {
        self.ensure_mounted()?;
        let state = self.state.write();

        match state.tree.resolve(path) {
            Some(node) => {
                if node.is_directory() && node.entry(EntryKind::File).is_none() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("`{path}` is a directory"),
                    ));
                }
            }
            None => {
                let parent = path.parent().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "cannot write the root")
                })?;
                match state.tree.resolve(&parent) {
                    Some(node) if node.is_directory() => {}
                    _ => {
                        return Err(io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("no parent directory for `{path}`"),
                        ));
                    }
                }
            }
        }

        let writer = state.cache.writer(None)?;
        let gate = self.streams.register(path.clone());
        drop(state);

        Ok(Box::new(EntryWriteStream {
            ctrl: self.arc(),
            path: path.clone(),
            template: template.cloned(),
            writer: Some(writer),
            gate: Some(gate),
        }))
    }

    /// Install a committed entry write into cache and tree.
    fn commit_entry_write(
        &self,
        path: &NodePath,
        writer: SlotWriter,
        template: Option<&Entry>,
    ) -> io::Result<Entry> {
        let written = writer.written();
        let mut state = self.state.write();

        state.cache.commit_writer(path, writer)?;

        if !state.tree.contains(path) {
            let options = MakeOptions {
                create_parents: false,
                template: template.cloned(),
            };
            state
                .tree
                .make(path, EntryKind::File, &options)
                .map_err(io::Error::other)?;
        }
        let node = state.tree.resolve_mut(path).expect("entry just ensured");
        if node.entry(EntryKind::File).is_none() {
            node.insert_entry(Entry::file(path.clone()));
        }
        let entry = node.entry_mut(EntryKind::File).expect("file entry ensured");
        entry.set_size(SizeKind::Data, Some(written));
        entry.set_time(Access::Write, Some(SystemTime::now()));
        let entry = entry.clone();

        state.phase = Phase::Dirty;
        Ok(entry)
    }

    /// Structurally copy `from` to `to`, staging content so the copy
    /// survives the source's backing entry going away.
    pub fn copy(&self, from: &NodePath, to: &NodePath) -> Result<(), FsError> {
        self.ensure_mounted().map_err(|e| FsError::io(from, e))?;
        let mut state = self.state.write();

        let subtree: Vec<NodePath> = state
            .tree
            .paths()
            .into_iter()
            .filter(|p| p.starts_with(from))
            .collect();

        state.tree.copy(from, to)?;

        for old_path in subtree {
            let suffix = &old_path.as_str()[from.as_str().len()..];
            let new_path = NodePath::new(format!("{}{}", to.as_str(), suffix))
                .map_err(|e| FsError::io(to, e.as_io_error()))?;

            let has_content = state
                .tree
                .resolve(&old_path)
                .map(|node| {
                    node.kinds()
                        .any(|kind| matches!(kind, EntryKind::File | EntryKind::Symlink))
                })
                .unwrap_or(false);
            if !has_content {
                continue;
            }

            if state.cache.reader(&old_path).is_none() {
                self.remount_backing(&mut state)
                    .map_err(|e| FsError::io(&old_path, e))?;
                let backed = state
                    .backing
                    .as_ref()
                    .map(|backing| backing.entry(&old_path).is_some())
                    .unwrap_or(false);
                if backed {
                    let mut reader = state
                        .backing
                        .as_ref()
                        .unwrap()
                        .input(&old_path)
                        .and_then(|socket| socket.stream(None))
                        .map_err(|e| FsError::io(&old_path, e))?;
                    state
                        .cache
                        .populate(&old_path, &mut reader)
                        .map_err(|e| FsError::io(&old_path, e))?;
                }
            }
            state
                .cache
                .copy_slot(&old_path, &new_path)
                .map_err(|e| FsError::io(&new_path, e))?;
        }

        state.phase = Phase::Dirty;
        Ok(())
    }

    /// Copy-then-unlink rename. The unlink half removes the source subtree
    /// deepest-first.
    pub fn rename(&self, from: &NodePath, to: &NodePath) -> Result<(), FsError> {
        self.copy(from, to)?;

        let mut state = self.state.write();
        let mut subtree: Vec<NodePath> = state
            .tree
            .paths()
            .into_iter()
            .filter(|p| p.starts_with(from))
            .collect();
        subtree.sort_by_key(|p| std::cmp::Reverse(p.depth()));
        for path in subtree {
            state.tree.unlink(&path)?;
            state.cache.discard(&path);
        }
        state.phase = Phase::Dirty;
        Ok(())
    }

    /// Throw away every mounted structure; the next access remounts from
    /// the backing file. Cached keys are the key ring's business.
    pub(crate) fn discard(&self) {
        let mut state = self.state.write();
        state.cache.clear();
        state.backing = None;
        state.tree = FileTree::new();
        state.phase = Phase::Unmounted;
    }

    /// Flush one tree entry into the output container.
    fn flush_entry(
        &self,
        state: &MountState,
        mux: &Multiplexer,
        entry: &Entry,
    ) -> io::Result<()> {
        match entry.kind {
            EntryKind::Directory | EntryKind::Special => mux.put_meta(entry),
            EntryKind::File | EntryKind::Symlink => {
                let mut entry = entry.clone();
                let mut reader: Box<dyn Read + Send> = match state.cache.reader(&entry.path) {
                    Some(reader) => {
                        entry.set_size(SizeKind::Data, state.cache.data_size(&entry.path));
                        Box::new(reader?)
                    }
                    None => {
                        let backed = state
                            .backing
                            .as_ref()
                            .map(|backing| backing.entry(&entry.path).is_some())
                            .unwrap_or(false);
                        if backed {
                            state
                                .backing
                                .as_ref()
                                .unwrap()
                                .input(&entry.path)?
                                .stream(None)?
                        } else {
                            entry.set_size(SizeKind::Data, Some(0));
                            Box::new(io::empty())
                        }
                    }
                };
                let mut stream = mux.output(entry)?;
                io::copy(&mut reader, &mut stream)?;
                stream.commit()?;
                Ok(())
            }
        }
    }

    /// Write the tree's entire entry set as a fresh image through the
    /// parent controller.
    fn commit_state(
        &self,
        state: &mut MountState,
        issues: &mut Vec<SyncIssue>,
    ) -> io::Result<()> {
        let template = self.parent.node(&self.parent_path).ok().flatten();
        let socket = self.parent.output(&self.parent_path, template)?;
        let stream = socket.stream(None)?;
        let container = self.driver.output(stream, &self.driver_ctx()?)?;
        let mux = Multiplexer::new(container, self.pool.clone());

        for entry in state.tree.entries() {
            if entry.path.is_root() {
                continue;
            }
            if let Err(source) = self.flush_entry(state, &mux, &entry) {
                // Independent entries still get their chance; the batch is
                // reported at the end.
                tracing::warn!(path = %entry.path, error = %source, "entry flush failed");
                issues.push(SyncIssue::EntryFlush {
                    path: entry.path.clone(),
                    source,
                });
            }
        }

        // Close drains every staged entry, then commits the image, which
        // for a file-backed archive is the temp-file rename.
        mux.close()
    }
}

impl Controller for ArchiveController {
    fn node(&self, path: &NodePath) -> io::Result<Option<Entry>> {
        self.ensure_mounted()?;
        let state = self.state.read();
        Ok(state.tree.resolve(path).map(|node| node.primary().clone()))
    }

    fn check_access(&self, path: &NodePath, accesses: &[Access]) -> Result<(), FsError> {
        let entry = self
            .node(path)
            .map_err(|e| FsError::io(path, e))?
            .ok_or_else(|| FsError::NotFound { path: path.clone() })?;
        for access in accesses {
            if !entry.is_permitted(*access, Principal::User) {
                return Err(FsError::AccessDenied { path: path.clone() });
            }
        }
        Ok(())
    }

    fn input(&self, path: &NodePath) -> io::Result<Box<dyn InputSocket>> {
        Ok(Box::new(ArchiveInputSocket {
            ctrl: self.arc(),
            path: path.clone(),
        }))
    }

    fn output(
        &self,
        path: &NodePath,
        template: Option<Entry>,
    ) -> io::Result<Box<dyn OutputSocket>> {
        Ok(Box::new(ArchiveOutputSocket {
            ctrl: self.arc(),
            path: path.clone(),
            template,
        }))
    }

    fn make(&self, path: &NodePath, kind: EntryKind, options: &MakeOptions) -> Result<(), FsError> {
        self.ensure_mounted().map_err(|e| FsError::io(path, e))?;
        let mut state = self.state.write();
        state.tree.make(path, kind, options)?;
        state.phase = Phase::Dirty;
        Ok(())
    }

    fn unlink(&self, path: &NodePath) -> Result<(), FsError> {
        self.ensure_mounted().map_err(|e| FsError::io(path, e))?;
        let mut state = self.state.write();
        state.tree.unlink(path)?;
        state.cache.discard(path);
        state.phase = Phase::Dirty;
        Ok(())
    }

    fn sync(&self, options: &SyncOptions) -> Result<(), SyncError> {
        if self.state.read().phase == Phase::Unmounted {
            return Ok(());
        }

        let mut issues: Vec<SyncIssue> = vec![];

        // Wait outside the state lock so in-flight commits can finish.
        let idle = self.streams.wait_idle(options.wait);
        let mut state = self.state.write();

        if state.phase == Phase::Unmounted {
            return Ok(());
        }

        if !idle || !self.streams.open_paths().is_empty() {
            if options.force_close {
                for path in self.streams.disconnect_all() {
                    tracing::warn!(path = %path, "force-closing open stream for sync");
                    issues.push(SyncIssue::ForceClosedStream { path });
                }
            } else {
                return Err(SyncError::Timeout {
                    open: self.streams.open_paths().len(),
                });
            }
        }

        if options.abort_changes {
            state.cache.clear();
            state.backing = None;
            state.tree = FileTree::new();
            state.phase = Phase::Unmounted;
            return finish(issues);
        }

        if state.phase == Phase::Clean {
            if options.clear_cache {
                state.cache.clear();
            }
            return finish(issues);
        }

        state.phase = Phase::Syncing;
        tracing::debug!(mount = %self.mount.display(), "syncing");
        match self.commit_state(&mut state, &mut issues) {
            Ok(()) => {
                state.tree.set_synced();
                state.cache.mark_all_clean();
                if options.clear_cache {
                    state.cache.clear();
                }
                state.backing = None;
                state.phase = Phase::Clean;
                finish(issues)
            }
            Err(source) => {
                // Nothing was renamed over the original; remain dirty so a
                // later sync can retry.
                state.phase = Phase::Dirty;
                Err(SyncError::Fail { source, issues })
            }
        }
    }
}

fn finish(issues: Vec<SyncIssue>) -> Result<(), SyncError> {
    if issues.is_empty() {
        Ok(())
    } else {
        Err(SyncError::Warn { issues })
    }
}

struct ArchiveInputSocket {
    ctrl: Arc<ArchiveController>,
    path: NodePath,
}

impl InputSocket for ArchiveInputSocket {
    fn target(&self) -> io::Result<Entry> {
        self.ctrl.node(&self.path)?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no entry at `{}`", self.path),
            )
        })
    }

    fn stream(&self, _peer: Option<&dyn OutputSocket>) -> io::Result<Box<dyn Read + Send>> {
        self.ctrl.open_reader(&self.path)
    }
}

struct ArchiveOutputSocket {
    ctrl: Arc<ArchiveController>,
    path: NodePath,
    template: Option<Entry>,
}

impl OutputSocket for ArchiveOutputSocket {
    fn target(&self) -> io::Result<Entry> {
        match self.ctrl.node(&self.path)? {
            Some(entry) => Ok(entry),
            None => Ok(Entry::file(self.path.clone())),
        }
    }

    fn stream(&self, _peer: Option<&dyn InputSocket>) -> io::Result<Box<dyn OutputStream>> {
        self.ctrl.open_writer(&self.path, self.template.as_ref())
    }
}

struct GatedReader {
    inner: Box<dyn ReadChannel>,
    gate: Option<Arc<StreamGate>>,
    ctrl: Arc<ArchiveController>,
}

impl Read for GatedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(gate) = &self.gate {
            gate.check()?;
        }
        self.inner.read(buf)
    }
}

impl Drop for GatedReader {
    fn drop(&mut self) {
        self.gate.take();
        self.ctrl.streams.notify_released();
    }
}

struct EntryWriteStream {
    ctrl: Arc<ArchiveController>,
    path: NodePath,
    template: Option<Entry>,
    writer: Option<SlotWriter>,
    gate: Option<Arc<StreamGate>>,
}

impl Write for EntryWriteStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(gate) = &self.gate {
            gate.check()?;
        }
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("stream already committed"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl OutputStream for EntryWriteStream {
    fn commit(mut self: Box<Self>) -> io::Result<Entry> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| io::Error::other("stream already committed"))?;

        if let Some(gate) = &self.gate {
            if gate.disconnected.load(Ordering::SeqCst) {
                writer.abandon();
                return Err(stale());
            }
        }

        let result = self
            .ctrl
            .commit_entry_write(&self.path, writer, self.template.as_ref());
        self.gate.take();
        self.ctrl.streams.notify_released();
        result
    }
}

impl Drop for EntryWriteStream {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            tracing::warn!(path = %self.path, "entry write stream dropped without commit");
            writer.abandon();
        }
        self.gate.take();
        self.ctrl.streams.notify_released();
    }
}

