//! Cross-mount copy, fanned out over the task engine.
//!
//! A directory copy creates its destination directory, lists the source and
//! submits one task per child: file children become file-copy tasks,
//! directory children become directory tasks that repeat the process. Every
//! task is a child of the job's cancellation scope, so canceling the job (or
//! any directory task) reaches everything beneath it. A failing child never
//! affects its siblings; aggregate success is read off the task states.

use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::OpContext;
use crate::error::{StorageError, StorageResult};
use crate::ids::{JobId, TaskId};
use crate::mount::Mount;
use crate::ops::Ops;
use crate::path;
use crate::tasks::{Task, TaskContext, TaskManager, TaskState};
use crate::types::{FileStream, LinkArgs, Object};

/// Minimum time between two progress updates of one transfer.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Fails reads once the token is canceled, so a transfer stops at the next
/// chunk even if the destination backend never checks for cancellation.
struct CancelOnRead<R> {
    inner: R,
    token: CancellationToken,
}

impl<R: AsyncRead + Unpin> AsyncRead for CancelOnRead<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.token.is_cancelled() {
            return Poll::Ready(Err(io::Error::other(StorageError::Canceled)));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Wrap a stream so reading it observes `token`.
pub(crate) fn cancel_on_read(stream: FileStream, token: CancellationToken) -> FileStream {
    stream.map_reader(|inner| Box::pin(CancelOnRead { inner, token }))
}

/// A progress callback that reports into a task's status, rate-limited.
pub(crate) fn throttled_progress(task: TaskContext) -> impl Fn(f64) + Send + Sync {
    let last: Mutex<Option<(Instant, u32)>> = Mutex::new(None);
    move |percentage: f64| {
        let pct = percentage.clamp(0.0, 100.0).round() as u32;
        let now = Instant::now();
        let mut last = last.lock();
        let due = match *last {
            None => true,
            Some((_, prev)) if pct == prev => false,
            Some(_) if pct == 100 => true,
            Some((at, _)) => now.duration_since(at) >= PROGRESS_INTERVAL,
        };
        if due {
            *last = Some((now, pct));
            task.set_status(format!("uploading: {pct}%"));
        }
    }
}

/// Counts of a job's tasks by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CopySummary {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl CopySummary {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.succeeded + self.failed + self.canceled
    }

    /// No task is pending or running.
    pub fn is_done(&self) -> bool {
        self.pending == 0 && self.running == 0
    }

    /// Done, and every task succeeded.
    pub fn is_success(&self) -> bool {
        self.is_done() && self.failed == 0 && self.canceled == 0
    }
}

/// A running cross-mount copy.
#[derive(Clone)]
pub struct CopyJob {
    id: JobId,
    description: String,
    token: CancellationToken,
    tasks: Arc<Mutex<Vec<TaskId>>>,
    manager: TaskManager,
}

impl CopyJob {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Every task spawned so far, at any depth. Grows while directory tasks
    /// fan out.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.lock().clone()
    }

    /// Snapshots of the job's retained tasks.
    ///
    /// Directory tasks record their children before finishing, so a list
    /// that did not grow while the snapshots were taken includes the
    /// children of every terminal task in it.
    pub fn tasks(&self) -> Vec<Task> {
        loop {
            let ids = self.task_ids();
            let tasks: Vec<Task> = ids.iter().filter_map(|id| self.manager.get(*id)).collect();
            if self.tasks.lock().len() == ids.len() {
                return tasks;
            }
        }
    }

    /// Tasks that ended in failure.
    pub fn failures(&self) -> Vec<Task> {
        self.tasks()
            .into_iter()
            .filter(|t| t.state == TaskState::Failed)
            .collect()
    }

    pub fn summary(&self) -> CopySummary {
        let mut summary = CopySummary::default();
        for task in self.tasks() {
            match task.state {
                TaskState::Pending => summary.pending += 1,
                TaskState::Running => summary.running += 1,
                TaskState::Succeeded => summary.succeeded += 1,
                TaskState::Failed => summary.failed += 1,
                TaskState::Canceled => summary.canceled += 1,
            }
        }
        summary
    }

    /// Cancel every task of the job, queued or running.
    pub fn cancel(&self) {
        info!(job = %self.id, "copy job canceled");
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Poll until no task is pending or running.
    ///
    /// A directory task records its children before it finishes, so once
    /// everything known is terminal nothing new can appear.
    pub async fn wait(&self, poll: Duration) -> CopySummary {
        loop {
            let summary = self.summary();
            if summary.is_done() {
                return summary;
            }
            tokio::time::sleep(poll).await;
        }
    }
}

impl std::fmt::Debug for CopyJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyJob")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}

/// Shared state of one copy job, cloned into each of its tasks.
#[derive(Clone)]
struct CopyPlan {
    ops: Arc<Ops>,
    src: Arc<Mount>,
    dst: Arc<Mount>,
    tasks: Arc<Mutex<Vec<TaskId>>>,
}

impl CopyPlan {
    fn describe(&self, src_path: &str, dst_dir: &str) -> String {
        format!(
            "copy [{}]({}) to [{}]({})",
            self.src.group_path(),
            src_path,
            self.dst.group_path(),
            dst_dir
        )
    }

    /// Submit the task for one object, under `parent`.
    fn submit(
        &self,
        manager: &TaskManager,
        parent: &CancellationToken,
        src_path: String,
        obj: Object,
        dst_dir: String,
    ) {
        let description = self.describe(&src_path, &dst_dir);
        let plan = self.clone();
        let handle = if obj.is_dir {
            manager.submit_child(parent, description, move |task| async move {
                plan.copy_dir(&task, &src_path, &obj.name, &dst_dir).await
            })
        } else {
            manager.submit_child(parent, description, move |task| async move {
                plan.copy_file(&task, &src_path, &obj, &dst_dir).await
            })
        };
        self.tasks.lock().push(handle.id());
    }

    /// Create `dst_dir/name` and fan out over the children of `src_path`.
    async fn fan_out(
        &self,
        cx: &OpContext,
        manager: &TaskManager,
        parent: &CancellationToken,
        src_path: &str,
        name: &str,
        dst_dir: &str,
    ) -> StorageResult<usize> {
        let target = path::join(dst_dir, name);
        self.ops.make_dir(cx, &self.dst, &target).await?;

        let children = self.ops.list(cx, &self.src, src_path, false).await?;
        for child in children.iter() {
            cx.check()?;
            self.submit(
                manager,
                parent,
                path::join(src_path, &child.name),
                child.clone(),
                target.clone(),
            );
        }
        Ok(children.len())
    }

    async fn copy_dir(
        &self,
        task: &TaskContext,
        src_path: &str,
        name: &str,
        dst_dir: &str,
    ) -> StorageResult<()> {
        task.set_status("listing");
        let cx = task.op_context();
        let n = self
            .fan_out(&cx, task.manager(), task.token(), src_path, name, dst_dir)
            .await?;
        task.set_status(format!("submitted {n} entries"));
        Ok(())
    }

    async fn copy_file(
        &self,
        task: &TaskContext,
        src_path: &str,
        obj: &Object,
        dst_dir: &str,
    ) -> StorageResult<()> {
        let cx = task.op_context();

        task.set_status("getting link");
        let link = self
            .ops
            .link(&cx, &self.src, src_path, &LinkArgs::default())
            .await?;
        let reader = cx
            .run(self.src.backend().open_link(&cx, &link))
            .await
            .map_err(|e| e.context(format!("failed to open {src_path}")))?;

        let stream = cancel_on_read(
            FileStream::new(obj.name.clone(), obj.size, reader),
            task.token().clone(),
        );
        let progress = throttled_progress(task.clone());
        task.set_status("uploading: 0%");
        self.ops
            .put(&cx, &self.dst, dst_dir, stream, &progress)
            .await?;
        task.set_status("done");
        debug!(src = src_path, dst = dst_dir, bytes = obj.size, "file copied");
        Ok(())
    }
}

/// Starts cross-mount copies on a shared task engine.
#[derive(Clone)]
pub struct CopyOrchestrator {
    ops: Arc<Ops>,
    tasks: TaskManager,
}

impl CopyOrchestrator {
    pub fn new(ops: Arc<Ops>, tasks: TaskManager) -> Self {
        Self { ops, tasks }
    }

    /// Copy `src_path` on `src` into the directory `dst_dir` on `dst`.
    ///
    /// The source is stat'ed up front, so a missing source fails here. For a
    /// directory the destination directory is created and the first level
    /// fanned out before returning; everything else happens in tasks.
    pub async fn copy_between_mounts(
        &self,
        cx: &OpContext,
        src: Arc<Mount>,
        src_path: &str,
        dst: Arc<Mount>,
        dst_dir: &str,
    ) -> StorageResult<CopyJob> {
        let src_path = path::normalize(src_path);
        let dst_dir = path::normalize(dst_dir);
        let plan = CopyPlan {
            ops: Arc::clone(&self.ops),
            src,
            dst,
            tasks: Arc::new(Mutex::new(Vec::new())),
        };

        let obj = self.ops.get(cx, &plan.src, &src_path).await?;
        let job = CopyJob {
            id: JobId::new(),
            description: plan.describe(&src_path, &dst_dir),
            token: CancellationToken::new(),
            tasks: Arc::clone(&plan.tasks),
            manager: self.tasks.clone(),
        };
        info!(job = %job.id, "{}", job.description);

        if obj.is_dir {
            let name = if src_path == "/" {
                path::base_name(plan.src.group_path())
            } else {
                obj.name.clone()
            };
            plan.fan_out(cx, &self.tasks, &job.token, &src_path, &name, &dst_dir)
                .await?;
        } else {
            plan.submit(&self.tasks, &job.token, src_path, obj, dst_dir);
        }
        Ok(job)
    }

    /// Upload a stream into `dst_dir` on `mount` as a tracked task.
    pub fn put_as_task(&self, mount: Arc<Mount>, dst_dir: &str, stream: FileStream) -> TaskId {
        let dst_dir = path::normalize(dst_dir);
        let description = format!(
            "upload {} to [{}]({})",
            stream.name,
            mount.group_path(),
            dst_dir
        );
        let ops = Arc::clone(&self.ops);
        let handle = self.tasks.submit(description, move |task| async move {
            let cx = task.op_context();
            let stream = cancel_on_read(stream, task.token().clone());
            let progress = throttled_progress(task.clone());
            task.set_status("uploading: 0%");
            ops.put(&cx, &mount, &dst_dir, stream, &progress).await?;
            task.set_status("done");
            Ok(())
        });
        handle.id()
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StorageBackend;
    use crate::backends::MemoryBackend;
    use crate::ops::DEFAULT_LIST_TTL;
    use crate::search::SearchSlot;
    use tokio::io::AsyncReadExt;

    fn orchestrator(max: usize) -> CopyOrchestrator {
        let ops = Arc::new(Ops::new(DEFAULT_LIST_TTL, Arc::new(SearchSlot::new())));
        CopyOrchestrator::new(ops, TaskManager::new(max))
    }

    fn mem(id: &str, at: &str) -> (Arc<MemoryBackend>, Arc<Mount>) {
        let backend = Arc::new(MemoryBackend::new());
        let mount = Arc::new(Mount::new(id, at, backend.clone()));
        (backend, mount)
    }

    #[tokio::test]
    async fn test_copy_tree() {
        let orch = orchestrator(2);
        let (s1, src) = mem("s1", "/s1");
        let (s2, dst) = mem("s2", "/s2");
        s1.write_file("/src/f1", vec![1u8; 100]).unwrap();
        s1.write_file("/src/sub/f2", vec![2u8; 50]).unwrap();
        s2.make_dir(&OpContext::background(), "/dst").await.unwrap();

        let job = orch
            .copy_between_mounts(&OpContext::background(), src, "/src", dst, "/dst")
            .await
            .unwrap();
        let summary = job.wait(Duration::from_millis(5)).await;

        assert!(summary.is_success(), "{summary:?}");
        // f1, sub, and f2 beneath it.
        assert_eq!(summary.total(), 3);
        assert_eq!(s2.read_file("/dst/src/f1").unwrap().len(), 100);
        assert_eq!(s2.read_file("/dst/src/sub/f2").unwrap().len(), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_wait_sees_nested_children() {
        for _ in 0..20 {
            let orch = orchestrator(4);
            let (s1, src) = mem("s1", "/s1");
            let (s2, dst) = mem("s2", "/s2");
            s1.write_file("/t/a/b/c/leaf", vec![7u8; 8]).unwrap();
            s1.write_file("/t/a/b/side", vec![7u8; 8]).unwrap();

            let job = orch
                .copy_between_mounts(&OpContext::background(), src, "/t", dst, "/")
                .await
                .unwrap();
            let summary = job.wait(Duration::from_millis(1)).await;

            // a, b, c, side, leaf
            assert_eq!(summary.total(), 5, "{summary:?}");
            assert!(summary.is_success());
            assert!(s2.read_file("/t/a/b/c/leaf").is_some());
        }
    }

    #[tokio::test]
    async fn test_copy_single_file() {
        let orch = orchestrator(1);
        let (s1, src) = mem("s1", "/a");
        let (s2, dst) = mem("s2", "/b");
        s1.write_file("/x.bin", vec![7u8; 10]).unwrap();

        let job = orch
            .copy_between_mounts(&OpContext::background(), src, "/x.bin", dst, "/")
            .await
            .unwrap();
        assert_eq!(job.task_ids().len(), 1);
        assert!(job.wait(Duration::from_millis(5)).await.is_success());

        let task = &job.tasks()[0];
        assert_eq!(task.status, "done");
        assert_eq!(s2.read_file("/x.bin").unwrap(), vec![7u8; 10]);
    }

    #[tokio::test]
    async fn test_missing_source_fails_synchronously() {
        let orch = orchestrator(1);
        let (_s1, src) = mem("s1", "/a");
        let (_s2, dst) = mem("s2", "/b");
        let err = orch
            .copy_between_mounts(&OpContext::background(), src, "/nope", dst, "/")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(orch.tasks().list().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_job_cancels_queued_tasks() {
        let orch = orchestrator(1);
        let (s1, src) = mem("s1", "/a");
        let (_s2, dst) = mem("s2", "/b");
        for i in 0..5 {
            s1.write_file(&format!("/d/f{i}"), vec![0u8; 8]).unwrap();
        }
        let job = orch
            .copy_between_mounts(&OpContext::background(), src, "/d", dst, "/")
            .await
            .unwrap();
        job.cancel();

        let summary = job.wait(Duration::from_millis(5)).await;
        assert!(summary.canceled >= 4, "{summary:?}");
        assert!(!summary.is_success());
    }

    #[tokio::test]
    async fn test_put_as_task() {
        let orch = orchestrator(1);
        let (backend, mount) = mem("m", "/m");
        let id = orch.put_as_task(
            mount,
            "/",
            FileStream::from_bytes("up.txt", b"hello".to_vec()),
        );
        loop {
            let task = orch.tasks().get(id).unwrap();
            if task.state.is_terminal() {
                assert_eq!(task.state, TaskState::Succeeded);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(backend.read_file("/up.txt").unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_cancel_on_read() {
        let token = CancellationToken::new();
        let mut stream = cancel_on_read(
            FileStream::from_bytes("f", vec![1u8; 16]),
            token.clone(),
        );
        let mut buf = [0u8; 4];
        assert_eq!(stream.reader.read(&mut buf).await.unwrap(), 4);
        token.cancel();
        let err = stream.reader.read(&mut buf).await.unwrap_err();
        assert_ne!(err.kind(), io::ErrorKind::Interrupted);
        assert!(StorageError::from(err).is_canceled());
    }
}
