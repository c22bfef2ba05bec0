//! End-to-end behavior of controller chains over real backing files.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arcfs::driver::mem::MemDriver;
use arcfs::{
    Access, Context, Controller, Entry, EntryKind, FsError, InputSocket, KeyError, KeyProvider,
    MakeOptions, NodePath, OutputSocket, OutputStream, Phase, SecretKey, SizeKind, Strategy,
    SyncError, SyncIssue, SyncOptions, WaitMode,
};

fn trace() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn path(s: &str) -> NodePath {
    NodePath::new(s).unwrap()
}

fn write_entry(controller: &dyn Controller, p: &NodePath, data: &[u8]) -> Entry {
    let socket = controller.output(p, None).unwrap();
    let mut stream = socket.stream(None).unwrap();
    stream.write_all(data).unwrap();
    stream.commit().unwrap()
}

fn read_entry(controller: &dyn Controller, p: &NodePath) -> String {
    let mut out = String::new();
    controller
        .input(p)
        .unwrap()
        .stream(None)
        .unwrap()
        .read_to_string(&mut out)
        .unwrap();
    out
}

#[test]
fn example_scenario_over_tar() {
    trace();
    let dir = tempfile::tempdir().unwrap();

    {
        let ctx = Context::builder(dir.path()).build();
        let archive = ctx.open("store.tar").unwrap();

        archive
            .make(&path("foo"), EntryKind::Directory, &MakeOptions::default())
            .unwrap();
        archive
            .make(&path("foo/bar"), EntryKind::File, &MakeOptions::default())
            .unwrap();
        write_entry(archive.as_ref(), &path("foo/bar"), b"hello");

        assert_eq!(archive.phase(), Phase::Dirty);
        archive.sync(&SyncOptions::default()).unwrap();
        assert_eq!(archive.phase(), Phase::Clean);
    }

    assert!(dir.path().join("store.tar").is_file());

    // Reopen from scratch; only the committed file carries the state now.
    let ctx = Context::builder(dir.path()).build();
    let node = ctx.node("store.tar/foo/bar").unwrap().unwrap();
    assert_eq!(node.kind, EntryKind::File);
    assert_eq!(node.size(SizeKind::Data), Some(5));

    let mut out = String::new();
    ctx.input("store.tar/foo/bar")
        .unwrap()
        .stream(None)
        .unwrap()
        .read_to_string(&mut out)
        .unwrap();
    assert_eq!(out, "hello");
}

#[test]
fn nested_archive_writes_through_parent() {
    trace();
    let dir = tempfile::tempdir().unwrap();

    {
        let ctx = Context::builder(dir.path()).build();
        ctx.make(
            "outer.tar/inner.tar/docs/file.txt",
            EntryKind::File,
            &MakeOptions {
                create_parents: true,
                template: None,
            },
        )
        .unwrap();

        let socket = ctx.output("outer.tar/inner.tar/docs/file.txt", None).unwrap();
        let mut stream = socket.stream(None).unwrap();
        stream.write_all(b"deep").unwrap();
        stream.commit().unwrap();

        ctx.sync_all(&SyncOptions::default()).unwrap();
    }

    let ctx = Context::builder(dir.path()).build();
    let mut out = String::new();
    ctx.input("outer.tar/inner.tar/docs/file.txt")
        .unwrap()
        .stream(None)
        .unwrap()
        .read_to_string(&mut out)
        .unwrap();
    assert_eq!(out, "deep");

    // The inner archive is an ordinary file entry of the outer one.
    let inner = ctx.node("outer.tar/inner.tar").unwrap().unwrap();
    assert_eq!(inner.kind, EntryKind::File);
    assert!(inner.size(SizeKind::Data).unwrap() > 0);
}

/// Parent controller wrapper whose output streams always fail to commit.
struct FailingCommitParent {
    inner: Arc<dyn Controller>,
}

struct FailingCommitSocket {
    inner: Box<dyn OutputSocket>,
}

struct FailingCommitStream {
    inner: Box<dyn OutputStream>,
}

impl Write for FailingCommitStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl OutputStream for FailingCommitStream {
    fn commit(self: Box<Self>) -> io::Result<Entry> {
        // Dropping the inner stream discards its temp file, exactly like a
        // crash before the rename.
        Err(io::Error::other("simulated rename failure"))
    }
}

impl OutputSocket for FailingCommitSocket {
    fn target(&self) -> io::Result<Entry> {
        self.inner.target()
    }
    fn stream(&self, peer: Option<&dyn InputSocket>) -> io::Result<Box<dyn OutputStream>> {
        Ok(Box::new(FailingCommitStream {
            inner: self.inner.stream(peer)?,
        }))
    }
}

impl Controller for FailingCommitParent {
    fn node(&self, path: &NodePath) -> io::Result<Option<Entry>> {
        self.inner.node(path)
    }
    fn check_access(&self, path: &NodePath, accesses: &[Access]) -> Result<(), FsError> {
        self.inner.check_access(path, accesses)
    }
    fn input(&self, path: &NodePath) -> io::Result<Box<dyn InputSocket>> {
        self.inner.input(path)
    }
    fn output(
        &self,
        path: &NodePath,
        template: Option<Entry>,
    ) -> io::Result<Box<dyn OutputSocket>> {
        Ok(Box::new(FailingCommitSocket {
            inner: self.inner.output(path, template)?,
        }))
    }
    fn make(&self, path: &NodePath, kind: EntryKind, options: &MakeOptions) -> Result<(), FsError> {
        self.inner.make(path, kind, options)
    }
    fn unlink(&self, path: &NodePath) -> Result<(), FsError> {
        self.inner.unlink(path)
    }
    fn sync(&self, options: &SyncOptions) -> Result<(), SyncError> {
        self.inner.sync(options)
    }
}

#[test]
fn failed_rename_leaves_original_untouched() {
    trace();
    let dir = tempfile::tempdir().unwrap();

    // Commit version one through a healthy chain.
    {
        let ctx = Context::builder(dir.path())
            .driver("mem", Arc::new(MemDriver::new()))
            .build();
        let archive = ctx.open("a.mem").unwrap();
        archive
            .make(&path("f"), EntryKind::File, &MakeOptions::default())
            .unwrap();
        write_entry(archive.as_ref(), &path("f"), b"version one");
        archive.sync(&SyncOptions::default()).unwrap();
    }
    let committed = std::fs::read(dir.path().join("a.mem")).unwrap();

    // Mutate through a chain whose final rename always fails.
    let parent: Arc<dyn Controller> = Arc::new(FailingCommitParent {
        inner: Arc::new(arcfs::FileController::new(dir.path())),
    });
    let archive = arcfs::ArchiveController::new(
        dir.path().join("a.mem"),
        parent,
        path("a.mem"),
        Arc::new(MemDriver::new()),
        Arc::new(arcfs::TempPool::new()),
        Arc::new(arcfs::KeyRing::new(None)),
        Strategy::WriteBack,
    );
    write_entry(archive.as_ref(), &path("f"), b"version two");

    let err = archive.sync(&SyncOptions::default()).err().unwrap();
    assert!(matches!(err, SyncError::Fail { .. }));
    assert_eq!(archive.phase(), Phase::Dirty);

    // Byte-for-byte the original, and no temp file litter.
    assert_eq!(std::fs::read(dir.path().join("a.mem")).unwrap(), committed);
    let stray: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .filter(|name| name != "a.mem")
        .collect();
    assert!(stray.is_empty(), "unexpected files: {stray:?}");

    // The dirty state is still there; a healthy sync can retry later.
    assert_eq!(read_entry(archive.as_ref(), &path("f")), "version two");
}

#[test]
fn cache_stays_authoritative_after_flush() {
    trace();
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::builder(dir.path())
        .driver("mem", Arc::new(MemDriver::new()))
        .build();

    let archive = ctx.open("a.mem").unwrap();
    archive
        .make(&path("f"), EntryKind::File, &MakeOptions::default())
        .unwrap();
    write_entry(archive.as_ref(), &path("f"), b"write");

    // Read back without flushing: the dirty slot serves it.
    assert_eq!(read_entry(archive.as_ref(), &path("f")), "write");

    archive.sync(&SyncOptions::default()).unwrap();

    // Break the backing store; the clean slot still answers.
    std::fs::write(dir.path().join("a.mem"), b"garbage").unwrap();
    assert_eq!(read_entry(archive.as_ref(), &path("f")), "write");

    // Once the cache is gone, the corruption surfaces on the next read.
    archive
        .sync(&SyncOptions {
            clear_cache: true,
            ..Default::default()
        })
        .unwrap();
    let err = archive
        .input(&path("f"))
        .unwrap()
        .stream(None)
        .err().unwrap();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
}

#[test]
fn force_close_disconnects_lingering_streams() {
    trace();
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::builder(dir.path())
        .driver("mem", Arc::new(MemDriver::new()))
        .build();

    let archive = ctx.open("a.mem").unwrap();
    archive
        .make(&path("f"), EntryKind::File, &MakeOptions::default())
        .unwrap();
    write_entry(archive.as_ref(), &path("f"), b"payload");

    let input = archive.input(&path("f")).unwrap();
    let mut lingering = input.stream(None).unwrap();
    let mut first = [0u8; 3];
    lingering.read_exact(&mut first).unwrap();

    // Without force-close the sync refuses to proceed.
    let err = archive
        .sync(&SyncOptions {
            force_close: false,
            ..Default::default()
        })
        .err().unwrap();
    assert!(matches!(err, SyncError::Timeout { open: 1 }));

    // With it, the sync commits and reports the disconnect.
    let err = archive.sync(&SyncOptions::default()).err().unwrap();
    match err {
        SyncError::Warn { issues } => {
            assert_eq!(issues.len(), 1);
            assert!(matches!(issues[0], SyncIssue::ForceClosedStream { .. }));
        }
        other => panic!("expected warn, got {other:?}"),
    }
    assert_eq!(archive.phase(), Phase::Clean);

    let err = lingering.read(&mut first).err().unwrap();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
}

#[test]
fn bounded_wait_outlasts_a_brief_reader() {
    trace();
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::builder(dir.path())
        .driver("mem", Arc::new(MemDriver::new()))
        .build();

    let archive = ctx.open("a.mem").unwrap();
    archive
        .make(&path("f"), EntryKind::File, &MakeOptions::default())
        .unwrap();
    write_entry(archive.as_ref(), &path("f"), b"payload");

    let input = archive.input(&path("f")).unwrap();
    let stream = input.stream(None).unwrap();
    let reader = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        drop(stream);
    });

    archive
        .sync(&SyncOptions {
            wait: WaitMode::WaitFor(Duration::from_secs(5)),
            force_close: false,
            ..Default::default()
        })
        .unwrap();
    reader.join().unwrap();
}

#[cfg(feature = "seal")]
struct CountingProvider {
    calls: AtomicUsize,
}

#[cfg(feature = "seal")]
impl KeyProvider for CountingProvider {
    fn request_key(&self, _mount: &Path) -> Result<SecretKey, KeyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SecretKey::from_passphrase("open sesame"))
    }
}

#[cfg(feature = "seal")]
#[test]
fn unlinking_the_mount_point_invalidates_its_key() {
    use arcfs::driver::seal::SealDriver;

    trace();
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(CountingProvider {
        calls: AtomicUsize::new(0),
    });
    let ctx = Context::builder(dir.path())
        .driver("vault", Arc::new(SealDriver::new(Arc::new(MemDriver::new()))))
        .key_provider(provider.clone())
        .build();

    {
        let archive = ctx.open("a.vault").unwrap();
        archive
            .make(&path("s"), EntryKind::File, &MakeOptions::default())
            .unwrap();
        write_entry(archive.as_ref(), &path("s"), b"secret");
        archive.sync(&SyncOptions::default()).unwrap();
    }
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    // Remounting reuses the cached key.
    let mut out = String::new();
    ctx.input("a.vault/s")
        .unwrap()
        .stream(None)
        .unwrap()
        .read_to_string(&mut out)
        .unwrap();
    assert_eq!(out, "secret");
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    // Unlinking the archive file drops controller and key.
    ctx.unlink("a.vault").unwrap();
    assert!(ctx.node("a.vault").unwrap().is_none());

    let archive = ctx.open("a.vault").unwrap();
    archive
        .make(&path("s"), EntryKind::File, &MakeOptions::default())
        .unwrap();
    write_entry(archive.as_ref(), &path("s"), b"fresh");
    archive.sync(&SyncOptions::default()).unwrap();
    assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn write_through_strategy_round_trips() {
    trace();
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::builder(dir.path())
        .driver("mem", Arc::new(MemDriver::new()))
        .strategy(Strategy::WriteThrough)
        .build();

    let archive = ctx.open("a.mem").unwrap();
    archive
        .make(&path("f"), EntryKind::File, &MakeOptions::default())
        .unwrap();
    write_entry(archive.as_ref(), &path("f"), b"mirrored");
    archive.sync(&SyncOptions::default()).unwrap();

    let ctx = Context::builder(dir.path())
        .driver("mem", Arc::new(MemDriver::new()))
        .build();
    let mut out = String::new();
    ctx.input("a.mem/f")
        .unwrap()
        .stream(None)
        .unwrap()
        .read_to_string(&mut out)
        .unwrap();
    assert_eq!(out, "mirrored");
}

#[test]
fn abort_changes_discards_pending_state() {
    trace();
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::builder(dir.path())
        .driver("mem", Arc::new(MemDriver::new()))
        .build();

    {
        let archive = ctx.open("a.mem").unwrap();
        archive
            .make(&path("keep"), EntryKind::File, &MakeOptions::default())
            .unwrap();
        write_entry(archive.as_ref(), &path("keep"), b"kept");
        archive.sync(&SyncOptions::default()).unwrap();
    }

    let archive = ctx.open("a.mem").unwrap();
    archive
        .make(&path("drop"), EntryKind::File, &MakeOptions::default())
        .unwrap();
    write_entry(archive.as_ref(), &path("drop"), b"doomed");

    archive.sync(&SyncOptions::abort()).unwrap();
    assert_eq!(archive.phase(), Phase::Unmounted);

    // Remounted state reflects only what was committed.
    assert!(archive.node(&path("drop")).unwrap().is_none());
    assert_eq!(read_entry(archive.as_ref(), &path("keep")), "kept");
}

#[test]
fn rename_moves_content_and_structure() {
    trace();
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::builder(dir.path())
        .driver("mem", Arc::new(MemDriver::new()))
        .build();

    let archive = ctx.open("a.mem").unwrap();
    archive
        .make(&path("d"), EntryKind::Directory, &MakeOptions::default())
        .unwrap();
    archive
        .make(&path("d/f"), EntryKind::File, &MakeOptions::default())
        .unwrap();
    write_entry(archive.as_ref(), &path("d/f"), b"movable");
    archive.sync(&SyncOptions::default()).unwrap();

    // Rename after the content has been committed: the copy must survive
    // the source entry disappearing from the next image.
    archive.rename(&path("d"), &path("e")).unwrap();
    archive.sync(&SyncOptions::default()).unwrap();

    let ctx = Context::builder(dir.path())
        .driver("mem", Arc::new(MemDriver::new()))
        .build();
    assert!(ctx.node("a.mem/d").unwrap().is_none());
    let mut out = String::new();
    ctx.input("a.mem/e/f")
        .unwrap()
        .stream(None)
        .unwrap()
        .read_to_string(&mut out)
        .unwrap();
    assert_eq!(out, "movable");
}

#[test]
fn unlink_taxonomy_through_the_context() {
    trace();
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::builder(dir.path())
        .driver("mem", Arc::new(MemDriver::new()))
        .build();

    let archive = ctx.open("a.mem").unwrap();
    archive
        .make(&path("d"), EntryKind::Directory, &MakeOptions::default())
        .unwrap();
    archive
        .make(&path("d/f"), EntryKind::File, &MakeOptions::default())
        .unwrap();

    assert!(matches!(
        ctx.unlink("a.mem/d").err().unwrap(),
        FsError::NotEmpty { .. }
    ));
    ctx.unlink("a.mem/d/f").unwrap();
    ctx.unlink("a.mem/d").unwrap();
    assert!(matches!(
        ctx.unlink("a.mem/d").err().unwrap(),
        FsError::NotFound { .. }
    ));
}
