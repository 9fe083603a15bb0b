//! Background job downloading one session item.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tracing::{debug, info, warn};

use crate::{
    downloader::{Backend, DownloadObserver, DownloadSpec, MetadataMode},
    error::Error,
    progress::{self, ProgressTick},
    task::{EventKind, TaskContext},
};

/// Everything a download job needs besides the backend
#[derive(Debug, Clone)]
pub struct ItemJob {
    pub spec: DownloadSpec,
    /// Remove the partial file when the job is cancelled
    pub delete_partial_on_cancel: bool,
}

/// Forwards backend callbacks into the task's event channel
struct JobObserver {
    ctx: TaskContext,
    partial: Mutex<Option<PathBuf>>,
}

impl JobObserver {
    fn partial_file(&self) -> Option<PathBuf> {
        self.partial.lock().ok().and_then(|p| p.clone())
    }
}

impl DownloadObserver for JobObserver {
    fn on_progress(&self, tick: ProgressTick) {
        if let Some(tmp) = &tick.tmp_filename {
            if let Ok(mut partial) = self.partial.lock() {
                if partial.as_ref() != Some(tmp) {
                    *partial = Some(tmp.clone());
                }
            }
        }
        if let Some(update) = tick.display() {
            self.ctx.emit(EventKind::Progress(update));
        }
    }

    fn on_item_finished(&self, path: PathBuf) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.ctx.log(format!("Downloaded: {name}"));
    }
}

/// Runs one item: metadata first (for the log and the preview), then the
/// transfer. Exactly one of `ItemSucceeded` / `ItemFailed` is emitted unless
/// the job is cancelled.
pub async fn run_item(backend: Arc<dyn Backend>, job: ItemJob, ctx: TaskContext) {
    let url = job.spec.url.clone();
    ctx.log(format!("Starting download of: {url}"));

    match backend
        .extract_metadata(&url, MetadataMode::Single, ctx.token())
        .await
    {
        Ok(info) => {
            let title = info.title.clone().unwrap_or_else(|| "N/A".to_string());
            ctx.log(format!("Title: {title}"));
            ctx.log(format!(
                "Duration: {}",
                progress::format_duration(info.duration_seconds())
            ));
            ctx.emit(EventKind::Preview {
                title,
                thumbnail: info.thumbnail,
            });
        }
        Err(Error::Cancelled) => {
            debug!(task = ?ctx.id(), "cancelled during metadata lookup");
            return;
        }
        Err(err) => {
            ctx.emit(EventKind::ItemFailed(err));
            return;
        }
    }

    let observer = JobObserver {
        ctx: ctx.clone(),
        partial: Mutex::new(None),
    };
    match backend.download(&job.spec, &observer, ctx.token()).await {
        Ok(()) => {
            info!(%url, "item downloaded");
            ctx.emit(EventKind::Progress(progress::ProgressUpdate {
                percent: 100,
                speed: "--".to_string(),
                eta: "--".to_string(),
            }));
            ctx.log("Download complete!");
            ctx.emit(EventKind::ItemSucceeded);
        }
        Err(Error::Cancelled) => {
            info!(%url, "item download cancelled");
            if job.delete_partial_on_cancel {
                if let Some(partial) = observer.partial_file() {
                    remove_partial(&partial).await;
                }
            }
        }
        Err(err) => {
            warn!(%url, error = %err, "item download failed");
            ctx.emit(EventKind::ItemFailed(err));
        }
    }
}

/// Deletes a temp file and the `.ytdl` resume sidecar next to it.
pub async fn remove_partial(tmp: &Path) {
    let mut targets = vec![tmp.to_path_buf()];
    if let Some(name) = tmp.file_name().and_then(|n| n.to_str()) {
        let base = name.strip_suffix(".part").unwrap_or(name);
        targets.push(tmp.with_file_name(format!("{base}.ytdl")));
    }
    for target in targets {
        match tokio::fs::remove_file(&target).await {
            Ok(()) => info!(path = %target.display(), "removed partial download"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %target.display(), error = %err, "could not remove partial download"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        downloader::fake::{FakeBackend, Lookup, Script},
        model::Quality,
        task::{Event, TaskHandle},
    };
    use std::time::Duration;
    use tokio::{
        runtime::Handle,
        sync::mpsc::{UnboundedReceiver, unbounded_channel},
    };

    fn job(url: &str) -> ItemJob {
        ItemJob {
            spec: DownloadSpec::new(url, Quality::P720, Path::new("/dl")),
            delete_partial_on_cancel: true,
        }
    }

    async fn drain(mut rx: UnboundedReceiver<Event>) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.kind);
        }
        kinds
    }

    #[tokio::test]
    async fn successful_item_logs_and_reports_progress() {
        let ticks = vec![
            ProgressTick {
                downloaded_bytes: 50,
                total_bytes: Some(100),
                speed: Some(2048.0),
                eta_seconds: Some(45),
                ..Default::default()
            },
            // unknown total: no update
            ProgressTick {
                downloaded_bytes: 60,
                ..Default::default()
            },
        ];
        let backend: Arc<dyn Backend> =
            Arc::new(FakeBackend::new().download("https://v/1", Script::Succeed(ticks)));
        let (tx, rx) = unbounded_channel();
        TaskHandle::spawn(&Handle::current(), tx, |ctx| run_item(backend, job("https://v/1"), ctx));
        let kinds = drain(rx).await;

        assert_eq!(kinds[0], EventKind::Log("Starting download of: https://v/1".into()));
        assert!(kinds.contains(&EventKind::Log("Title: Title of https://v/1".into())));
        assert!(kinds.contains(&EventKind::Log("Duration: 01:05".into())));
        assert!(kinds.contains(&EventKind::Progress(progress::ProgressUpdate {
            percent: 50,
            speed: "2.0KB/s".into(),
            eta: "45s".into(),
        })));
        let progress_count = kinds
            .iter()
            .filter(|k| matches!(k, EventKind::Progress(_)))
            .count();
        assert_eq!(progress_count, 2);
        assert!(kinds.contains(&EventKind::Log("Downloaded: 1.mp4".into())));
        assert_eq!(kinds.last(), Some(&EventKind::ItemSucceeded));
    }

    #[tokio::test]
    async fn metadata_failure_fails_the_item() {
        let backend: Arc<dyn Backend> = Arc::new(FakeBackend::new().lookup(
            "https://v/404",
            Lookup::Ready(Err(Error::ExtractionFailed("Video unavailable".into()))),
        ));
        let (tx, rx) = unbounded_channel();
        TaskHandle::spawn(&Handle::current(), tx, |ctx| run_item(backend, job("https://v/404"), ctx));
        let kinds = drain(rx).await;
        assert_eq!(
            kinds.last(),
            Some(&EventKind::ItemFailed(Error::ExtractionFailed("Video unavailable".into())))
        );
        assert!(!kinds.contains(&EventKind::ItemSucceeded));
    }

    #[tokio::test]
    async fn cancel_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("Clip.mp4.part");
        let sidecar = dir.path().join("Clip.mp4.ytdl");
        std::fs::write(&part, b"half").unwrap();
        std::fs::write(&sidecar, b"state").unwrap();

        let tick = ProgressTick {
            downloaded_bytes: 4,
            total_bytes: Some(8),
            tmp_filename: Some(part.clone()),
            ..Default::default()
        };
        let backend: Arc<dyn Backend> =
            Arc::new(FakeBackend::new().download("https://v/big", Script::Hang(vec![tick])));
        let (tx, mut rx) = unbounded_channel();
        let handle = TaskHandle::spawn(&Handle::current(), tx, |ctx| {
            run_item(backend, job("https://v/big"), ctx)
        });

        // wait until the transfer reported progress
        loop {
            let event = rx.recv().await.unwrap();
            if matches!(event.kind, EventKind::Progress(_)) {
                break;
            }
        }
        handle.cancel(&Handle::current(), Duration::from_secs(5));
        assert!(rx.recv().await.is_none());
        assert!(!part.exists());
        assert!(!sidecar.exists());
    }

    #[tokio::test]
    async fn remove_partial_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        remove_partial(&dir.path().join("nothing.part")).await;
    }
}
