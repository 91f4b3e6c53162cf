//! End-to-end scenarios driven through the `Kernel`.
//!
//! Backends are wrapped in a `Probe` that counts calls into the driver, so
//! the tests can see what the caches and the coalescing layer let through.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use kura_kernel::types::{ByteStream, Progress};
use kura_kernel::{
    CopyOutcome, DriverConfig, FileStream, Kernel, KuraConfig, Link, LinkArgs, MemoryBackend,
    Mount, MountId, Object, OpContext, StorageBackend, StorageError, StorageResult, TaskState,
};

// ============================================================================
// Shared test setup
// ============================================================================

/// Counts driver calls and can fail link generation for one path.
struct Probe {
    inner: Arc<MemoryBackend>,
    lists: AtomicUsize,
    links: AtomicUsize,
    delay: Duration,
    broken: Option<String>,
}

impl Probe {
    fn new(inner: Arc<MemoryBackend>) -> Self {
        Self {
            inner,
            lists: AtomicUsize::new(0),
            links: AtomicUsize::new(0),
            delay: Duration::ZERO,
            broken: None,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_broken(mut self, path: &str) -> Self {
        self.broken = Some(path.to_string());
        self
    }

    fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    fn links(&self) -> usize {
        self.links.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for Probe {
    fn config(&self) -> DriverConfig {
        self.inner.config()
    }

    async fn list(&self, cx: &OpContext, path: &str) -> StorageResult<Vec<Object>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.list(cx, path).await
    }

    async fn get(&self, cx: &OpContext, path: &str) -> StorageResult<Object> {
        self.inner.get(cx, path).await
    }

    async fn link(&self, cx: &OpContext, path: &str, args: &LinkArgs) -> StorageResult<Link> {
        self.links.fetch_add(1, Ordering::SeqCst);
        if self.broken.as_deref() == Some(path) {
            return Err(StorageError::not_found(path));
        }
        self.inner.link(cx, path, args).await
    }

    async fn open_link(&self, cx: &OpContext, link: &Link) -> StorageResult<ByteStream> {
        self.inner.open_link(cx, link).await
    }

    async fn make_dir(&self, cx: &OpContext, path: &str) -> StorageResult<()> {
        self.inner.make_dir(cx, path).await
    }

    async fn remove(&self, cx: &OpContext, path: &str) -> StorageResult<()> {
        self.inner.remove(cx, path).await
    }

    async fn move_to(&self, cx: &OpContext, src: &str, dst_dir: &str) -> StorageResult<()> {
        self.inner.move_to(cx, src, dst_dir).await
    }

    async fn rename(&self, cx: &OpContext, src: &str, new_name: &str) -> StorageResult<()> {
        self.inner.rename(cx, src, new_name).await
    }

    async fn copy_to(&self, cx: &OpContext, src: &str, dst_dir: &str) -> StorageResult<()> {
        self.inner.copy_to(cx, src, dst_dir).await
    }

    async fn put(
        &self,
        cx: &OpContext,
        dst_dir: &str,
        stream: FileStream,
        progress: &Progress,
    ) -> StorageResult<()> {
        self.inner.put(cx, dst_dir, stream, progress).await
    }
}

fn seeded(files: &[(&str, &str)]) -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    for (path, data) in files {
        backend.write_file(path, data.as_bytes()).unwrap();
    }
    backend
}

fn kernel_with(src: &str) -> Kernel {
    Kernel::new(&KuraConfig::from_toml(src).unwrap())
}

fn names(objs: &[Object]) -> Vec<&str> {
    let mut names: Vec<&str> = objs.iter().map(|o| o.name.as_str()).collect();
    names.sort();
    names
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn balanced_group_rotates_members() {
    let kernel = Kernel::default();
    kernel
        .mount(Mount::new("a", "/d", seeded(&[])))
        .unwrap();
    kernel
        .mount(Mount::new("b", "/d.balance", seeded(&[])).with_order(1))
        .unwrap();

    let picks: Vec<String> = (0..3)
        .map(|_| kernel.registry().resolve("/d/x").unwrap().mount.id().to_string())
        .collect();
    assert_eq!(picks, vec!["a", "b", "a"]);

    // Members are siblings, never each other's children.
    let root = kernel.fs().list(&OpContext::background(), "/").await.unwrap();
    assert_eq!(names(&root), vec!["d"]);
}

#[tokio::test]
async fn virtual_directories_are_read_only() {
    let kernel = Kernel::default();
    kernel
        .mount(Mount::new("m", "/media/films", seeded(&[("/a.mkv", "x")])))
        .unwrap();
    let cx = OpContext::background();

    let media = kernel.fs().get(&cx, "/media").await.unwrap();
    assert!(media.is_dir);
    assert_eq!(media.name, "media");

    let err = kernel.fs().make_dir(&cx, "/media/new").await.unwrap_err();
    assert!(matches!(err, StorageError::NotSupported(_)));

    let err = kernel.fs().remove(&cx, "/media/films").await.unwrap_err();
    assert!(matches!(err, StorageError::NotSupported(_)));
}

// ============================================================================
// Caching
// ============================================================================

#[tokio::test]
async fn concurrent_listings_share_one_fetch() {
    let kernel = Kernel::default();
    let probe = Arc::new(
        Probe::new(seeded(&[("/dir/a", "1"), ("/dir/b", "2")]))
            .with_delay(Duration::from_millis(20)),
    );
    kernel
        .mount(Mount::new("c", "/c", probe.clone()))
        .unwrap();

    let cx = OpContext::background();
    let results = join_all((0..8).map(|_| kernel.fs().list(&cx, "/c/dir"))).await;

    assert_eq!(probe.lists(), 1);
    for result in results {
        assert_eq!(names(&result.unwrap()), vec!["a", "b"]);
    }
}

#[tokio::test(start_paused = true)]
async fn listing_expires_after_ttl() {
    let kernel = kernel_with("[cache]\nlist_ttl_secs = 60");
    let probe = Arc::new(Probe::new(seeded(&[("/f", "1")])));
    kernel.mount(Mount::new("c", "/c", probe.clone())).unwrap();
    let cx = OpContext::background();

    kernel.fs().list(&cx, "/c").await.unwrap();
    kernel.fs().list(&cx, "/c").await.unwrap();
    assert_eq!(probe.lists(), 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    kernel.fs().list(&cx, "/c").await.unwrap();
    assert_eq!(probe.lists(), 2);

    kernel.fs().list_with(&cx, "/c", true).await.unwrap();
    assert_eq!(probe.lists(), 3);
}

#[tokio::test]
async fn mutations_invalidate_listings() {
    let kernel = Kernel::default();
    let probe = Arc::new(Probe::new(seeded(&[("/docs/a.txt", "a")])));
    kernel.mount(Mount::new("c", "/c", probe.clone())).unwrap();
    let cx = OpContext::background();

    assert_eq!(names(&kernel.fs().list(&cx, "/c/docs").await.unwrap()), vec!["a.txt"]);

    kernel.fs().make_dir(&cx, "/c/docs/new").await.unwrap();
    assert_eq!(
        names(&kernel.fs().list(&cx, "/c/docs").await.unwrap()),
        vec!["a.txt", "new"]
    );
    assert_eq!(probe.lists(), 2);

    kernel.fs().remove(&cx, "/c/docs/a.txt").await.unwrap();
    assert_eq!(names(&kernel.fs().list(&cx, "/c/docs").await.unwrap()), vec!["new"]);

    let missing = kernel.fs().get(&cx, "/c/docs/a.txt").await.unwrap_err();
    assert!(missing.is_not_found());
}

#[tokio::test]
async fn move_copy_rename_refetch_both_parents() {
    let kernel = Kernel::default();
    let probe = Arc::new(Probe::new(seeded(&[
        ("/from/a", "1"),
        ("/from/b", "2"),
        ("/from/c", "3"),
        ("/to/.keep", ""),
    ])));
    kernel.mount(Mount::new("c", "/c", probe.clone())).unwrap();
    let cx = OpContext::background();
    let fs = kernel.fs();

    // Prime both listings, then check each mutation forces two refetches.
    let prime = || async {
        fs.list(&cx, "/c/from").await.unwrap();
        fs.list(&cx, "/c/to").await.unwrap();
    };
    prime().await;
    assert_eq!(probe.lists(), 2);
    prime().await;
    assert_eq!(probe.lists(), 2);

    fs.move_to(&cx, "/c/from/a", "/c/to").await.unwrap();
    assert_eq!(names(&fs.list(&cx, "/c/from").await.unwrap()), vec!["b", "c"]);
    assert_eq!(names(&fs.list(&cx, "/c/to").await.unwrap()), vec![".keep", "a"]);
    assert_eq!(probe.lists(), 4);

    assert!(matches!(
        fs.copy(&cx, "/c/from/b", "/c/to").await.unwrap(),
        CopyOutcome::Done
    ));
    prime().await;
    assert_eq!(probe.lists(), 6);
    assert_eq!(names(&fs.list(&cx, "/c/to").await.unwrap()), vec![".keep", "a", "b"]);

    fs.rename(&cx, "/c/from/c", "d").await.unwrap();
    assert_eq!(names(&fs.list(&cx, "/c/from").await.unwrap()), vec!["b", "d"]);
    assert_eq!(probe.lists(), 7);
}

#[tokio::test]
async fn expiring_links_are_cached() {
    let kernel = Kernel::default();
    let expiring = Arc::new(Probe::new(Arc::new(
        MemoryBackend::new().with_link_expiry(Duration::from_secs(600)),
    )));
    expiring.inner.write_file("/f", "x").unwrap();
    let plain = Arc::new(Probe::new(seeded(&[("/f", "x")])));
    kernel.mount(Mount::new("e", "/e", expiring.clone())).unwrap();
    kernel.mount(Mount::new("p", "/p", plain.clone())).unwrap();
    let cx = OpContext::background();
    let args = LinkArgs::default();

    let (first, obj) = kernel.fs().link(&cx, "/e/f", &args).await.unwrap();
    let (second, _) = kernel.fs().link(&cx, "/e/f", &args).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(obj.size, 1);
    assert_eq!(expiring.links(), 1);

    kernel.fs().link(&cx, "/p/f", &args).await.unwrap();
    kernel.fs().link(&cx, "/p/f", &args).await.unwrap();
    assert_eq!(plain.links(), 2);
}

#[tokio::test]
async fn unmount_drops_cached_state() {
    let kernel = Kernel::default();
    let probe = Arc::new(Probe::new(seeded(&[("/f", "1")])));
    kernel.mount(Mount::new("c", "/c", probe.clone())).unwrap();
    let cx = OpContext::background();

    kernel.fs().list(&cx, "/c").await.unwrap();
    kernel.unmount(&MountId::from("c")).unwrap();
    kernel.mount(Mount::new("c", "/c", probe.clone())).unwrap();
    kernel.fs().list(&cx, "/c").await.unwrap();
    assert_eq!(probe.lists(), 2);
}

// ============================================================================
// Tasks and copies
// ============================================================================

#[tokio::test]
async fn task_lifecycle() {
    let kernel = Kernel::default();
    let tasks = kernel.tasks();

    let ok = tasks.submit("ok", |task| async move {
        task.set_status("working");
        Ok(())
    });
    let bad = tasks.submit("bad", |_| async { Err(StorageError::other("boom")) });

    assert_eq!(ok.wait().await.state, TaskState::Succeeded);
    let failed = bad.wait().await;
    assert_eq!(failed.state, TaskState::Failed);
    assert!(failed.error.is_some());

    let slow = tasks.submit("slow", |task| async move {
        task.token().cancelled().await;
        Err(StorageError::Canceled)
    });
    tasks.cancel(slow.id()).unwrap();
    assert_eq!(slow.wait().await.state, TaskState::Canceled);

    assert_eq!(tasks.clear_succeeded(), 1);
    assert_eq!(tasks.clear_done(), 2);
    assert!(tasks.list().is_empty());
}

#[tokio::test]
async fn cross_mount_copy_fans_out() {
    let kernel = kernel_with("[tasks]\nmax_concurrency = 2");
    let src = Arc::new(
        Probe::new(seeded(&[
            ("/dir/f1", "one"),
            ("/dir/f2", "two"),
            ("/dir/sub/f3", "three"),
        ]))
        .with_broken("/dir/f2"),
    );
    let dst = Arc::new(MemoryBackend::new());
    kernel.mount(Mount::new("src", "/src", src.clone())).unwrap();
    kernel.mount(Mount::new("dst", "/dst", dst.clone())).unwrap();
    let cx = OpContext::background();

    let job = match kernel.fs().copy(&cx, "/src/dir", "/dst").await.unwrap() {
        CopyOutcome::Started(job) => job,
        CopyOutcome::Done => panic!("cross-mount copy completed inline"),
    };
    let summary = job.wait(Duration::from_millis(5)).await;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, summary.total() - 1);
    assert!(!summary.is_success());
    assert_eq!(dst.read_file("/dir/f1").as_deref(), Some(&b"one"[..]));
    assert_eq!(dst.read_file("/dir/sub/f3").as_deref(), Some(&b"three"[..]));
    assert_eq!(dst.read_file("/dir/f2"), None);

    let failures = job.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].description.contains("/dir/f2"));

    // The destination listing reflects the copied tree.
    let listed = kernel.fs().list(&cx, "/dst/dir").await.unwrap();
    assert_eq!(names(&listed), vec!["f1", "sub"]);
}

#[tokio::test]
async fn failed_leaf_does_not_affect_sibling() {
    let kernel = Kernel::default();
    let src = Arc::new(
        Probe::new(seeded(&[
            ("/src/f1", "a".repeat(100).as_str()),
            ("/src/sub/f2", "b".repeat(50).as_str()),
        ]))
        .with_broken("/src/sub/f2"),
    );
    let dst = Arc::new(MemoryBackend::new());
    dst.write_file("/dst/.keep", "").unwrap();
    kernel.mount(Mount::new("s1", "/s1", src)).unwrap();
    kernel.mount(Mount::new("s2", "/s2", dst.clone())).unwrap();

    let CopyOutcome::Started(job) = kernel
        .fs()
        .copy(&OpContext::background(), "/s1/src", "/s2/dst")
        .await
        .unwrap()
    else {
        panic!("expected a copy job");
    };
    job.wait(Duration::from_millis(5)).await;

    // Two file tasks plus the task for `sub`.
    let tasks = job.tasks();
    assert_eq!(tasks.len(), 3);
    let state_of = |suffix: &str| {
        tasks
            .iter()
            .find(|t| t.description.contains(suffix))
            .map(|t| t.state)
    };
    assert_eq!(state_of("(/src/f1)"), Some(TaskState::Succeeded));
    assert_eq!(state_of("(/src/sub/f2)"), Some(TaskState::Failed));
    assert_eq!(dst.read_file("/dst/src/f1").map(|d| d.len()), Some(100));
    assert_eq!(dst.read_file("/dst/src/sub/f2"), None);
}

#[tokio::test]
async fn copy_of_missing_source_fails_up_front() {
    let kernel = Kernel::default();
    kernel.mount(Mount::new("a", "/a", seeded(&[]))).unwrap();
    kernel.mount(Mount::new("b", "/b", seeded(&[]))).unwrap();

    let err = kernel
        .fs()
        .copy(&OpContext::background(), "/a/nope", "/b")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(kernel.tasks().list().is_empty());
}

#[tokio::test]
async fn canceled_copy_stops_queued_work() {
    let kernel = kernel_with("[tasks]\nmax_concurrency = 1");
    let files: Vec<(String, String)> = (0..6)
        .map(|i| (format!("/dir/f{i}"), "data".to_string()))
        .collect();
    let src = Arc::new(MemoryBackend::new());
    for (path, data) in &files {
        src.write_file(path, data.as_bytes()).unwrap();
    }
    let dst = Arc::new(MemoryBackend::new());
    kernel.mount(Mount::new("src", "/src", src)).unwrap();
    kernel.mount(Mount::new("dst", "/dst", dst)).unwrap();

    let CopyOutcome::Started(job) = kernel
        .fs()
        .copy(&OpContext::background(), "/src/dir", "/dst")
        .await
        .unwrap()
    else {
        panic!("expected a copy job");
    };
    job.cancel();
    let summary = job.wait(Duration::from_millis(5)).await;

    assert!(job.is_canceled());
    assert!(summary.is_done());
    assert!(summary.canceled >= 1);
}

#[tokio::test]
async fn upload_as_task() {
    let kernel = Kernel::default();
    let dst = Arc::new(MemoryBackend::new());
    kernel.mount(Mount::new("up", "/up", dst.clone())).unwrap();

    let id = kernel
        .fs()
        .put_as_task("/up", FileStream::from_bytes("note.txt", b"hello".to_vec()))
        .unwrap();

    let task = loop {
        let task = kernel.tasks().get(id).unwrap();
        if task.state.is_terminal() {
            break task;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(dst.read_file("/note.txt").as_deref(), Some(&b"hello"[..]));
}

// ============================================================================
// Local driver
// ============================================================================

#[tokio::test]
async fn local_mount_from_config() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("music")).unwrap();
    std::fs::write(dir.path().join("music/track.mp3"), b"la la").unwrap();

    let config = KuraConfig::from_toml(&format!(
        "[[mounts]]\nid = \"disk\"\npath = \"/disk\"\ndriver = \"local\"\noptions = {{ root = {:?} }}\n",
        dir.path().display().to_string()
    ))
    .unwrap();
    let kernel = Kernel::from_config(&config).await.unwrap();
    let mem = Arc::new(MemoryBackend::new());
    kernel.mount(Mount::new("mem", "/mem", mem.clone())).unwrap();
    let cx = OpContext::background();

    let listed = kernel.fs().list(&cx, "/disk/music").await.unwrap();
    assert_eq!(names(&listed), vec!["track.mp3"]);

    let (link, obj) = kernel
        .fs()
        .link(&cx, "/disk/music/track.mp3", &LinkArgs::default())
        .await
        .unwrap();
    assert!(link.url.starts_with("file://"));
    assert_eq!(obj.size, 5);

    let CopyOutcome::Started(job) = kernel.fs().copy(&cx, "/disk/music", "/mem").await.unwrap()
    else {
        panic!("expected a copy job");
    };
    assert!(job.wait(Duration::from_millis(5)).await.is_success());
    assert_eq!(mem.read_file("/music/track.mp3").as_deref(), Some(&b"la la"[..]));

    // Dot segments never climb above the virtual root.
    assert!(kernel.fs().list(&cx, "/disk/../..").await.is_ok_and(|objs| {
        names(&objs) == vec!["disk", "mem"]
    }));
}
