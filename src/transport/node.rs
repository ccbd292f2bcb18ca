//! Execution nodes that serve the remote half of a channel transport.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::channel::{PipeReader, PipeWriter};
use super::TransportError;
use crate::git::{Git, ReceivePack, Repository, UploadPack};

/// Tasks a node can have waiting before `dispatch` has to wait.
const QUEUE_DEPTH: usize = 32;

/// The remote half of a pack exchange.  `input` carries what the local
/// side sends, `output` what the remote engine answers.
#[derive(Debug)]
pub enum PackTask {
    Fetch { input: PipeReader, output: PipeWriter },
    Push { input: PipeReader, output: PipeWriter },
}

/// Somewhere a pack task can run, such as another machine or an isolated
/// worker.
#[async_trait]
pub trait ExecutionNode: Send + Sync {
    fn name(&self) -> &str;

    /// Start `task` against the repository at `path` on this node.  Returns
    /// once the task has started; the exchange itself runs over the task's
    /// pipes.
    async fn dispatch(&self, path: PathBuf, task: PackTask) -> Result<(), TransportError>;
}

/// A repository path, optionally on another node.
#[derive(Clone)]
pub struct RemotePath {
    pub node: Option<Arc<dyn ExecutionNode>>,
    pub path: PathBuf,
}

impl RemotePath {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            node: None,
            path: path.into(),
        }
    }

    pub fn on(node: Arc<dyn ExecutionNode>, path: impl Into<PathBuf>) -> Self {
        Self {
            node: Some(node),
            path: path.into(),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.node.is_some()
    }
}

impl fmt::Debug for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotePath")
            .field("node", &self.node.as_ref().map(|n| n.name().to_string()))
            .field("path", &self.path)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// WorkerNode
// ---------------------------------------------------------------------------

struct Job {
    path: PathBuf,
    task: PackTask,
    started: oneshot::Sender<()>,
}

/// A node backed by a dedicated OS thread with its own single-threaded
/// runtime.  Tasks are queued to the thread and run concurrently there.
pub struct WorkerNode {
    name: String,
    queue: Mutex<Option<mpsc::Sender<Job>>>,
    active: Arc<AtomicUsize>,
}

impl fmt::Debug for WorkerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerNode")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("active_tasks", &self.active_tasks())
            .finish()
    }
}

impl WorkerNode {
    /// Start the worker thread.
    pub fn spawn(name: impl Into<String>, git: Git) -> std::io::Result<Self> {
        let name = name.into();
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let thread_name = format!("node-{name}");
        let node_name = name.clone();
        let active = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&active);
        std::thread::Builder::new().name(thread_name).spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(node = %node_name, error = %e, "cannot start node runtime");
                    return;
                }
            };
            runtime.block_on(serve(node_name, git, rx, counter));
        })?;
        info!(node = %name, "execution node started");
        Ok(Self {
            name,
            queue: Mutex::new(Some(tx)),
            active,
        })
    }

    /// Stop accepting tasks.  Tasks already running finish first.
    pub fn shutdown(&self) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.take().is_some() {
            info!(node = %self.name, "execution node shutting down");
        }
    }

    pub fn is_running(&self) -> bool {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Tasks started on this node that have not finished yet.
    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn dispatch_error(&self, reason: &str) -> TransportError {
        TransportError::Dispatch {
            node: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl ExecutionNode for WorkerNode {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, task), fields(node = %self.name, path = %path.display()))]
    async fn dispatch(&self, path: PathBuf, task: PackTask) -> Result<(), TransportError> {
        let sender = {
            let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.clone()
        }
        .ok_or_else(|| self.dispatch_error("node is shut down"))?;

        let (started, ack) = oneshot::channel();
        sender
            .send(Job {
                path,
                task,
                started,
            })
            .await
            .map_err(|_| self.dispatch_error("node stopped accepting tasks"))?;
        ack.await
            .map_err(|_| self.dispatch_error("task was dropped before it started"))
    }
}

/// Counts a task as active until dropped.
struct ActiveTask(Arc<AtomicUsize>);

impl ActiveTask {
    fn start(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveTask {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The worker thread's main loop.
async fn serve(name: String, git: Git, mut rx: mpsc::Receiver<Job>, active: Arc<AtomicUsize>) {
    let mut running = JoinSet::new();
    while let Some(job) = rx.recv().await {
        while running.try_join_next().is_some() {}
        let git = git.clone();
        // Counted before the start is acknowledged.
        let task = ActiveTask::start(&active);
        running.spawn(async move {
            let _task = task;
            run_job(job, git).await
        });
    }
    debug!(node = %name, pending = running.len(), "queue closed; draining tasks");
    while running.join_next().await.is_some() {}
    info!(node = %name, "execution node stopped");
}

async fn run_job(job: Job, git: Git) {
    let Job {
        path,
        task,
        started,
    } = job;
    let _ = started.send(());
    match task {
        PackTask::Fetch { input, output } => serve_fetch(&path, git, input, output).await,
        PackTask::Push { input, output } => serve_push(&path, git, input, output).await,
    }
}

// The pipes are moved into the engine call, or dropped on the error paths,
// so the local side always sees the stream end.

async fn serve_fetch(path: &Path, git: Git, input: PipeReader, output: PipeWriter) {
    let repository = match Repository::open(path) {
        Ok(repo) => repo,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open repository for fetch");
            return;
        }
    };
    match UploadPack::new(git, repository)
        .upload(input, output, tokio::io::sink())
        .await
    {
        Ok(0) => debug!(path = %path.display(), "remote fetch finished"),
        Ok(code) => warn!(path = %path.display(), code, "remote upload-pack failed"),
        Err(e) => warn!(path = %path.display(), error = %e, "remote fetch failed"),
    }
}

async fn serve_push(path: &Path, git: Git, input: PipeReader, output: PipeWriter) {
    let repository = match Repository::open(path) {
        Ok(repo) => repo,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open repository for push");
            return;
        }
    };
    match ReceivePack::new(git, repository)
        .receive(input, output, tokio::io::sink())
        .await
    {
        Ok(0) => debug!(path = %path.display(), "remote push finished"),
        Ok(code) => warn!(path = %path.display(), code, "remote receive-pack failed"),
        Err(e) => warn!(path = %path.display(), error = %e, "remote push failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::pipe;

    fn task() -> PackTask {
        let (_to_remote, input) = pipe();
        let (output, _from_remote) = pipe();
        PackTask::Fetch { input, output }
    }

    #[tokio::test]
    async fn dispatch_acknowledges_start() {
        let node = WorkerNode::spawn("t1", Git::default()).unwrap();
        assert!(node.is_running());
        // Not a repository: the task starts, then fails on its own.
        node.dispatch(PathBuf::from("/nonexistent/repo"), task())
            .await
            .unwrap();
        for _ in 0..100 {
            if node.active_tasks() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(node.active_tasks(), 0);
        node.shutdown();
    }

    #[tokio::test]
    async fn dispatch_after_shutdown_fails() {
        let node = WorkerNode::spawn("t2", Git::default()).unwrap();
        node.shutdown();
        assert!(!node.is_running());
        let err = node
            .dispatch(PathBuf::from("/tmp"), task())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Dispatch { node, .. } if node == "t2"));
    }

    #[test]
    fn remote_path_locality() {
        assert!(!RemotePath::local("/srv/repo.git").is_remote());
    }
}
