//! Playlist loading: flat metadata for every entry of a playlist URL.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    downloader::{Backend, MediaInfo, MetadataMode},
    error::{Error, Result},
    model::PlaylistEntry,
    task::{EventKind, TaskContext},
};

const UNTITLED: &str = "Untitled video";
const UNKNOWN_UPLOADER: &str = "Unknown";

/// Whether a URL should trigger a playlist load
pub fn looks_like_playlist(url: &str) -> bool {
    url.to_lowercase().contains("playlist")
}

/// Maps backend metadata to playlist entries. Entries the backend could not
/// resolve are dropped; the remaining ones keep their original position.
pub fn entries_from(info: MediaInfo) -> Result<Vec<PlaylistEntry>> {
    let raw = info.entries.ok_or(Error::NotAPlaylist)?;

    let entries: Vec<PlaylistEntry> = raw
        .into_iter()
        .enumerate()
        .filter_map(|(i, entry)| {
            let entry = entry?;
            let duration_seconds = entry.duration_seconds();
            let url = entry
                .webpage_url
                .filter(|u| !u.is_empty())
                .or(entry.url)
                .unwrap_or_default();
            Some(PlaylistEntry {
                index: i + 1,
                title: entry.title.unwrap_or_else(|| UNTITLED.to_string()),
                duration_seconds,
                url,
                id: entry.id.unwrap_or_default(),
                uploader: entry
                    .uploader
                    .or(entry.channel)
                    .unwrap_or_else(|| UNKNOWN_UPLOADER.to_string()),
            })
        })
        .collect();

    if entries.is_empty() {
        return Err(Error::NotAPlaylist);
    }
    Ok(entries)
}

/// Asks the backend for the playlist behind `url`.
pub async fn load_playlist(
    backend: &dyn Backend,
    url: &str,
    ctx: &TaskContext,
) -> Result<Vec<PlaylistEntry>> {
    let info = backend
        .extract_metadata(url, MetadataMode::Playlist, ctx.token())
        .await?;
    entries_from(info)
}

/// Background job body: loads the playlist and reports the outcome.
pub async fn run_loader(backend: Arc<dyn Backend>, url: String, ctx: TaskContext) {
    debug!(task = ?ctx.id(), %url, "loading playlist");
    match load_playlist(backend.as_ref(), &url, &ctx).await {
        Ok(entries) => {
            info!(count = entries.len(), "playlist loaded");
            ctx.emit(EventKind::PlaylistLoaded(entries));
        }
        Err(Error::Cancelled) => debug!(task = ?ctx.id(), "playlist load superseded"),
        Err(err) => {
            warn!(error = %err, "playlist load failed");
            ctx.emit(EventKind::PlaylistFailed(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{
        RawEntry,
        fake::{FakeBackend, Lookup},
    };
    use crate::task::TaskHandle;
    use tokio::{runtime::Handle, sync::mpsc::unbounded_channel};

    fn raw(id: &str, title: Option<&str>) -> Option<RawEntry> {
        Some(RawEntry {
            id: Some(id.to_string()),
            title: title.map(str::to_string),
            duration: Some(125.0),
            url: Some(format!("https://y/{id}")),
            ..Default::default()
        })
    }

    #[test]
    fn detects_playlist_urls() {
        assert!(looks_like_playlist("https://www.youtube.com/PLAYLIST?list=PL1"));
        assert!(!looks_like_playlist("https://www.youtube.com/watch?v=abc"));
    }

    #[test]
    fn null_entries_are_dropped_and_indices_kept() {
        let info = MediaInfo {
            entries: Some(vec![raw("a", Some("A")), None, raw("c", None)]),
            ..Default::default()
        };
        let entries = entries_from(info).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, 1);
        assert_eq!(entries[1].index, 3);
        assert_eq!(entries[1].title, UNTITLED);
        assert_eq!(entries[1].uploader, UNKNOWN_UPLOADER);
        assert_eq!(entries[0].duration_seconds, Some(125));
        assert_eq!(entries[0].url, "https://y/a");
    }

    #[test]
    fn webpage_url_wins_over_url() {
        let mut entry = raw("a", Some("A")).unwrap();
        entry.webpage_url = Some("https://www.youtube.com/watch?v=a".into());
        let info = MediaInfo {
            entries: Some(vec![Some(entry)]),
            ..Default::default()
        };
        assert_eq!(entries_from(info).unwrap()[0].url, "https://www.youtube.com/watch?v=a");
    }

    #[test]
    fn no_entries_is_not_a_playlist() {
        assert_eq!(entries_from(MediaInfo::default()), Err(Error::NotAPlaylist));
        let all_null = MediaInfo {
            entries: Some(vec![None, None]),
            ..Default::default()
        };
        assert_eq!(entries_from(all_null), Err(Error::NotAPlaylist));
    }

    #[tokio::test]
    async fn loader_reports_backend_failure() {
        let backend: Arc<dyn Backend> = Arc::new(FakeBackend::new().lookup(
            "https://y/playlist?list=bad",
            Lookup::Ready(Err(Error::ExtractionFailed("private".into()))),
        ));
        let (tx, mut rx) = unbounded_channel();
        let url = "https://y/playlist?list=bad".to_string();
        TaskHandle::spawn(&Handle::current(), tx, |ctx| run_loader(backend, url, ctx));
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event.kind,
            EventKind::PlaylistFailed(Error::ExtractionFailed("private".into()))
        );
    }

    #[tokio::test]
    async fn cancelled_loader_stays_silent() {
        let backend: Arc<dyn Backend> =
            Arc::new(FakeBackend::new().lookup("https://y/playlist?list=slow", Lookup::Hang));
        let (tx, mut rx) = unbounded_channel();
        let url = "https://y/playlist?list=slow".to_string();
        let handle = TaskHandle::spawn(&Handle::current(), tx, |ctx| run_loader(backend, url, ctx));
        handle.cancel(&Handle::current(), std::time::Duration::from_secs(1));
        assert!(rx.recv().await.is_none());
    }
}
