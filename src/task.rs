//! Background tasks with a cancellation token and a one-way event channel
//! back to the UI thread.

use std::{
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::{runtime::Handle, sync::mpsc::UnboundedSender, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{error::Error, model::PlaylistEntry, progress::ProgressUpdate};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one background task. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Something a task reports to the UI thread
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Line for the activity log
    Log(String),
    Progress(ProgressUpdate),
    /// Metadata of the item being downloaded
    Preview {
        title: String,
        thumbnail: Option<String>,
    },
    ItemSucceeded,
    ItemFailed(Error),
    PlaylistLoaded(Vec<PlaylistEntry>),
    PlaylistFailed(Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub task: TaskId,
    pub kind: EventKind,
}

/// Handed to a running job: its identity, its token and the way back.
#[derive(Clone)]
pub struct TaskContext {
    id: TaskId,
    cancel: CancellationToken,
    events: UnboundedSender<Event>,
}

impl TaskContext {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Sends an event unless the task was cancelled. A closed channel means
    /// the UI went away; that is not the job's problem.
    pub fn emit(&self, kind: EventKind) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.events.send(Event { task: self.id, kind });
    }

    pub fn log(&self, message: impl Into<String>) {
        self.emit(EventKind::Log(message.into()));
    }
}

/// Owner side of a spawned task
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawns `job` on `runtime` with a fresh id and token.
    pub fn spawn<F, Fut>(runtime: &Handle, events: UnboundedSender<Event>, job: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = TaskId::next();
        let cancel = CancellationToken::new();
        let ctx = TaskContext {
            id,
            cancel: cancel.clone(),
            events,
        };
        debug!(task = ?id, "spawning background task");
        let join = runtime.spawn(job(ctx));
        Self { id, cancel, join }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Asks the task to stop and returns immediately. A watchdog aborts the
    /// task if it is still running after `grace`.
    pub fn cancel(self, runtime: &Handle, grace: Duration) {
        debug!(task = ?self.id, "cancelling background task");
        self.cancel.cancel();
        let id = self.id;
        let mut join = self.join;
        runtime.spawn(async move {
            if tokio::time::timeout(grace, &mut join).await.is_err() {
                warn!(task = ?id, ?grace, "task ignored cancellation, aborting it");
                join.abort();
            }
        });
    }
}
