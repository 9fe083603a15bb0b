//! UI-thread glue between user actions, background tasks and the session.
//!
//! The controller owns the only mutable session state. Background tasks talk
//! back exclusively through the event channel; events from tasks that are no
//! longer active (superseded loaders, cancelled downloads) are dropped.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::{
    runtime::Handle,
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};
use tracing::{debug, info, trace};

use crate::{
    config::Settings,
    downloader::{Backend, DownloadSpec},
    error::Error,
    job::{self, ItemJob},
    model::{DownloadRequest, DownloadStatus, EntryRow, PlaylistEntry, Quality},
    playlist,
    session::{DownloadSession, FailurePolicy, Step},
    task::{Event, EventKind, TaskHandle},
};

/// Modal message the UI should show
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dialog {
    Warning(String),
    Error(String),
}

/// Title and thumbnail of the item being downloaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub title: String,
    pub thumbnail: Option<String>,
}

/// Everything the UI renders
#[derive(Debug, Default)]
pub struct ViewState {
    pub log: Vec<String>,
    /// 0-100; `None` before the first tick of the current item
    pub percent: Option<u8>,
    pub speed: String,
    pub eta: String,
    pub playlist: Vec<EntryRow>,
    pub is_playlist: bool,
    pub preview: Option<Preview>,
    pub dialog: Option<Dialog>,
    /// Set once a download finished, for the "Open folder" button
    pub finished_folder: Option<PathBuf>,
}

impl ViewState {
    fn reset_progress(&mut self) {
        self.percent = None;
        self.speed = "--".to_string();
        self.eta = "--".to_string();
    }
}

pub struct Controller {
    backend: Arc<dyn Backend>,
    runtime: Handle,
    events_tx: UnboundedSender<Event>,
    events_rx: UnboundedReceiver<Event>,
    session: Option<DownloadSession>,
    download: Option<TaskHandle>,
    loader: Option<TaskHandle>,
    last_url: String,
    delete_partial_on_cancel: bool,
    cancel_grace: Duration,
    pub view: ViewState,
}

impl Controller {
    pub fn new(backend: Arc<dyn Backend>, runtime: Handle, settings: &Settings) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        let mut view = ViewState::default();
        view.reset_progress();
        Self {
            backend,
            runtime,
            events_tx,
            events_rx,
            session: None,
            download: None,
            loader: None,
            last_url: String::new(),
            delete_partial_on_cancel: settings.delete_partial_on_cancel,
            cancel_grace: Duration::from_secs(settings.cancel_grace_secs),
            view,
        }
    }

    /// A session is running
    pub fn is_busy(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_loading_playlist(&self) -> bool {
        self.loader.is_some()
    }

    pub fn log(&mut self, message: impl Into<String>) {
        self.view.log.push(message.into());
    }

    pub fn selected_count(&self) -> usize {
        self.view.playlist.iter().filter(|row| row.selected).count()
    }

    pub fn set_all_selected(&mut self, selected: bool) {
        for row in &mut self.view.playlist {
            row.selected = selected;
        }
    }

    /// Reacts to an edit of the URL field: drops stale playlist state and
    /// starts (or supersedes) a playlist load when the URL looks like one.
    pub fn on_url_changed(&mut self, url: &str) {
        if self.is_busy() {
            return;
        }
        let url = url.trim();
        if url == self.last_url {
            return;
        }
        self.last_url = url.to_string();
        self.view.playlist.clear();
        self.view.is_playlist = false;
        self.cancel_loader();

        if !url.is_empty() && playlist::looks_like_playlist(url) {
            self.start_loader(url.to_string());
        }
    }

    fn start_loader(&mut self, url: String) {
        self.log("Analyzing playlist...");
        let backend = Arc::clone(&self.backend);
        let handle = TaskHandle::spawn(&self.runtime, self.events_tx.clone(), |ctx| {
            playlist::run_loader(backend, url, ctx)
        });
        debug!(task = ?handle.id(), "playlist loader started");
        self.loader = Some(handle);
    }

    fn cancel_loader(&mut self) {
        if let Some(handle) = self.loader.take() {
            debug!(task = ?handle.id(), "superseding playlist loader");
            handle.cancel(&self.runtime, self.cancel_grace);
        }
    }

    /// Starts a batch over the selected playlist entries, or a single
    /// download when no playlist is loaded.
    pub fn start_download(&mut self, url: &str, quality: Quality, destination: PathBuf) {
        if self.is_busy() {
            return;
        }
        let url = url.trim();
        if url.is_empty() {
            self.view.dialog = Some(Dialog::Warning("Please enter a valid URL".to_string()));
            return;
        }

        let session = if self.view.is_playlist && !self.view.playlist.is_empty() {
            let selected: Vec<PlaylistEntry> = self
                .view
                .playlist
                .iter()
                .filter(|row| row.selected)
                .map(|row| row.entry.clone())
                .collect();
            if selected.is_empty() {
                self.view.dialog = Some(Dialog::Warning(
                    "Please select at least one video to download".to_string(),
                ));
                return;
            }
            for row in &mut self.view.playlist {
                row.status = DownloadStatus::Pending;
            }
            DownloadSession::batch(&selected, quality, destination)
        } else {
            self.log("Downloading single video...");
            DownloadSession::single(DownloadRequest {
                url: url.to_string(),
                quality,
                destination,
            })
        };

        info!(items = session.item_count(), %quality, "download session started");
        // a playlist load never runs alongside a download
        self.cancel_loader();
        self.view.finished_folder = None;
        self.view.preview = None;
        self.view.reset_progress();
        self.session = Some(session);

        let step = self.session.as_mut().and_then(DownloadSession::advance);
        if let Some(step) = step {
            self.apply(step);
        }
    }

    /// Stops the running session. The UI goes idle right away; the task is
    /// given a grace period to stop before it is aborted.
    pub fn cancel(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.cancel();
        if let Some(handle) = self.download.take() {
            handle.cancel(&self.runtime, self.cancel_grace);
        }
        info!(index = session.current_index(), "download session cancelled");
        if let Some(index) = session.current_item().and_then(|item| item.playlist_index) {
            self.set_row_status(index, DownloadStatus::Pending);
        }
        self.log("Download cancelled by user");
        self.view.reset_progress();
    }

    /// Resets inputs derived state, log and progress. Ignored while busy.
    pub fn clear(&mut self) {
        if self.is_busy() {
            return;
        }
        self.cancel_loader();
        self.last_url.clear();
        self.view = ViewState::default();
        self.view.reset_progress();
    }

    /// Drains pending events. Returns how many were applied.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            if self.handle_event(event) {
                applied += 1;
            }
        }
        applied
    }

    fn handle_event(&mut self, event: Event) -> bool {
        let is_loader = self.loader.as_ref().is_some_and(|h| h.id() == event.task);
        let is_download = self.download.as_ref().is_some_and(|h| h.id() == event.task);

        if is_loader {
            self.on_loader_event(event.kind);
        } else if is_download {
            self.on_download_event(event.kind);
        } else {
            trace!(task = ?event.task, "dropping event from inactive task");
            return false;
        }
        true
    }

    fn on_loader_event(&mut self, kind: EventKind) {
        match kind {
            EventKind::PlaylistLoaded(entries) => {
                self.loader = None;
                self.log(format!("Playlist detected: {} videos", entries.len()));
                self.view.playlist = entries.into_iter().map(EntryRow::new).collect();
                self.view.is_playlist = true;
            }
            EventKind::PlaylistFailed(err) => {
                self.loader = None;
                self.log(format!("❌ {err}"));
                self.view.is_playlist = false;
            }
            EventKind::Log(line) => self.log(line),
            other => trace!(?other, "unexpected loader event"),
        }
    }

    fn on_download_event(&mut self, kind: EventKind) {
        match kind {
            EventKind::Log(line) => self.log(line),
            EventKind::Progress(update) => {
                // one stream per item; never move the bar backwards
                if self.view.percent.is_none_or(|p| update.percent >= p) {
                    self.view.percent = Some(update.percent);
                }
                self.view.speed = update.speed;
                self.view.eta = update.eta;
            }
            EventKind::Preview { title, thumbnail } => {
                self.view.preview = Some(Preview { title, thumbnail });
            }
            EventKind::ItemSucceeded => {
                self.download = None;
                self.mark_current(DownloadStatus::Done);
                let step = self.session.as_mut().and_then(DownloadSession::item_succeeded);
                if let Some(step) = step {
                    self.apply(step);
                }
            }
            EventKind::ItemFailed(err) => {
                self.download = None;
                let steps = self
                    .session
                    .as_mut()
                    .map(|s| s.item_failed(err))
                    .unwrap_or_default();
                for step in steps {
                    self.apply(step);
                }
            }
            other => trace!(?other, "unexpected download event"),
        }
    }

    fn apply(&mut self, step: Step) {
        match step {
            Step::Start {
                position,
                total,
                item,
            } => {
                let Some(session) = self.session.as_ref() else {
                    return;
                };
                let spec = DownloadSpec::new(&item.url, session.quality(), session.destination());
                let batch = session.policy() == FailurePolicy::ContinuePastFailure;
                if batch {
                    self.log(format!(
                        "Downloading video {}/{}: {}",
                        position + 1,
                        total,
                        item.title
                    ));
                }
                if let Some(index) = item.playlist_index {
                    self.set_row_status(index, DownloadStatus::Downloading);
                }
                self.view.reset_progress();

                let backend = Arc::clone(&self.backend);
                let job = ItemJob {
                    spec,
                    delete_partial_on_cancel: self.delete_partial_on_cancel,
                };
                let handle = TaskHandle::spawn(&self.runtime, self.events_tx.clone(), |ctx| {
                    job::run_item(backend, job, ctx)
                });
                debug!(task = ?handle.id(), position, total, "item download started");
                self.download = Some(handle);
            }
            Step::Skipped(failed) => {
                self.log(format!("❌ Error in '{}': {}", failed.title, failed.error));
                if let Some(index) = failed.playlist_index {
                    self.set_row_status(index, DownloadStatus::Failed(failed.error.to_string()));
                }
            }
            Step::Completed(summary) => {
                let batch = self
                    .session
                    .as_ref()
                    .is_some_and(|s| s.policy() == FailurePolicy::ContinuePastFailure);
                if batch {
                    let mut line =
                        format!("✅ Download complete! {} videos downloaded", summary.succeeded);
                    if !summary.failed.is_empty() {
                        line.push_str(&format!(", {} failed", summary.failed.len()));
                    }
                    self.log(line);
                }
                info!(
                    total = summary.total,
                    succeeded = summary.succeeded,
                    failed = summary.failed.len(),
                    "download session finished"
                );
                self.view.percent = Some(100);
                self.view.finished_folder = self.session.take().map(|s| s.destination().clone());
            }
            Step::Failed(err) => {
                self.fail(err);
            }
        }
    }

    fn fail(&mut self, err: Error) {
        info!(error = %err, "download failed");
        self.session = None;
        self.view.reset_progress();
        self.view.dialog = Some(Dialog::Error(err.to_string()));
    }

    fn mark_current(&mut self, status: DownloadStatus) {
        let index = self
            .session
            .as_ref()
            .and_then(|s| s.current_item())
            .and_then(|item| item.playlist_index);
        if let Some(index) = index {
            self.set_row_status(index, status);
        }
    }

    fn set_row_status(&mut self, index: usize, status: DownloadStatus) {
        if let Some(row) = self.view.playlist.iter_mut().find(|r| r.entry.index == index) {
            row.status = status;
        }
    }

    #[cfg(test)]
    fn events_sender(&self) -> UnboundedSender<Event> {
        self.events_tx.clone()
    }
}
