//! The extraction/download backend: yt-dlp driven as a subprocess.

use std::{
    collections::VecDeque,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use rust_embed::RustEmbed;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::Settings,
    error::{Error, Result},
    model::Quality,
    progress::{self, BackendLine, ProgressTick},
};

#[derive(RustEmbed)]
#[folder = "assets/"]
pub struct Asset;

/// How many trailing stderr lines are kept for error messages
const STDERR_TAIL: usize = 40;

/// Metadata returned by `--dump-single-json`
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct MediaInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    /// Present for playlists; unavailable items come back as `null`
    #[serde(default)]
    pub entries: Option<Vec<Option<RawEntry>>>,
}

impl MediaInfo {
    pub fn duration_seconds(&self) -> Option<u64> {
        seconds(self.duration)
    }
}

/// One flat playlist entry as yt-dlp reports it
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RawEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub webpage_url: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
}

impl RawEntry {
    pub fn duration_seconds(&self) -> Option<u64> {
        seconds(self.duration)
    }
}

fn seconds(value: Option<f64>) -> Option<u64> {
    value.filter(|d| d.is_finite() && *d >= 0.0).map(|d| d as u64)
}

/// What kind of metadata lookup to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMode {
    /// One video, ignoring any playlist the URL belongs to
    Single,
    /// Flat listing of every playlist entry
    Playlist,
}

/// Everything the backend needs to fetch one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSpec {
    pub url: String,
    pub format_selector: String,
    /// Transcode to mp3 after downloading
    pub extract_audio: bool,
    /// yt-dlp output template, `<dir>/%(title)s.%(ext)s`
    pub output_template: String,
}

impl DownloadSpec {
    pub fn new(url: &str, quality: Quality, destination: &Path) -> Self {
        Self {
            url: url.to_string(),
            format_selector: quality.format_selector().to_string(),
            extract_audio: quality.extracts_audio(),
            output_template: destination.join("%(title)s.%(ext)s").display().to_string(),
        }
    }
}

/// Callbacks invoked while a download runs
pub trait DownloadObserver: Send + Sync {
    fn on_progress(&self, tick: ProgressTick);
    fn on_item_finished(&self, path: PathBuf);
}

/// External collaborator resolving and fetching media
#[async_trait]
pub trait Backend: Send + Sync {
    async fn extract_metadata(
        &self,
        url: &str,
        mode: MetadataMode,
        cancel: &CancellationToken,
    ) -> Result<MediaInfo>;

    async fn download(
        &self,
        spec: &DownloadSpec,
        observer: &dyn DownloadObserver,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// yt-dlp executable plus the flags added to every invocation
#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
    extra_args: Vec<String>,
}

impl YtDlp {
    pub fn new(binary: PathBuf, extra_args: Vec<String>) -> Self {
        Self { binary, extra_args }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let binary = locate_binary(settings.ytdlp_path.as_deref())?;
        info!(binary = %binary.display(), "using yt-dlp");
        Ok(Self::new(binary, settings.backend_args()))
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, err: std::io::Error) -> Error {
        Error::UnexpectedFailure(format!(
            "could not start {}: {err}",
            self.binary.display()
        ))
    }
}

pub fn metadata_args(url: &str, mode: MetadataMode) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--dump-single-json".into(),
        "--no-warnings".into(),
        "--encoding".into(),
        "utf-8".into(),
    ];
    match mode {
        MetadataMode::Single => {
            args.push("--no-playlist".into());
            args.push("--skip-download".into());
        }
        MetadataMode::Playlist => {
            args.push("--flat-playlist".into());
            args.push("--ignore-errors".into());
        }
    }
    args.push(url.to_string());
    args
}

pub fn download_args(spec: &DownloadSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-f".into(),
        spec.format_selector.clone(),
        "-o".into(),
        spec.output_template.clone(),
        "--no-playlist".into(),
        "--newline".into(),
        "--encoding".into(),
        "utf-8".into(),
        "--progress".into(),
        "--progress-template".into(),
        progress::PROGRESS_TEMPLATE.into(),
        "--print".into(),
        progress::FINISHED_TEMPLATE.into(),
    ];
    if spec.extract_audio {
        args.extend([
            "-x".into(),
            "--audio-format".into(),
            "mp3".into(),
            "--audio-quality".into(),
            "192K".into(),
        ]);
    }
    args.push(spec.url.clone());
    args
}

/// Picks the most useful line out of yt-dlp's stderr.
pub fn error_message<'a>(stderr: impl IntoIterator<Item = &'a str>) -> String {
    let lines: Vec<&str> = stderr
        .into_iter()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let line = lines
        .iter()
        .rev()
        .find(|l| l.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .copied()
        .unwrap_or("yt-dlp exited with an error");
    line.strip_prefix("ERROR:").unwrap_or(line).trim().to_string()
}

#[async_trait]
impl Backend for YtDlp {
    async fn extract_metadata(
        &self,
        url: &str,
        mode: MetadataMode,
        cancel: &CancellationToken,
    ) -> Result<MediaInfo> {
        debug!(url, ?mode, "extracting metadata");
        let child = self
            .command()
            .args(metadata_args(url, mode))
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        // dropping the child on cancel kills it
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            output = child.wait_with_output() => output?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = error_message(stderr.lines());
            warn!(url, %message, "metadata extraction failed");
            return Err(Error::ExtractionFailed(message));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    async fn download(
        &self,
        spec: &DownloadSpec,
        observer: &dyn DownloadObserver,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(url = %spec.url, format = %spec.format_selector, "starting yt-dlp download");
        let mut child = self
            .command()
            .args(download_args(spec))
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::UnexpectedFailure("yt-dlp stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::UnexpectedFailure("yt-dlp stderr unavailable".into()))?;
        // raw segments: yt-dlp may print titles in the console code page
        let mut out_lines = BufReader::new(stdout).split(b'\n');
        let mut err_lines = BufReader::new(stderr).split(b'\n');
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL);
        let (mut out_open, mut err_open) = (true, true);

        // progress lands on stderr in quiet mode, so both streams are parsed
        while out_open || err_open {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    info!(url = %spec.url, "yt-dlp download killed");
                    return Err(Error::Cancelled);
                }
                line = out_lines.next_segment(), if out_open => match line? {
                    Some(raw) => {
                        dispatch(&decode_line(&raw), observer);
                    }
                    None => out_open = false,
                },
                line = err_lines.next_segment(), if err_open => match line? {
                    Some(raw) => {
                        let line = decode_line(&raw);
                        if !dispatch(&line, observer) {
                            if tail.len() == STDERR_TAIL {
                                tail.pop_front();
                            }
                            tail.push_back(line);
                        }
                    }
                    None => err_open = false,
                },
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(Error::Cancelled);
            }
            status = child.wait() => status?,
        };

        if status.success() {
            Ok(())
        } else {
            let message = error_message(tail.iter().map(String::as_str));
            warn!(url = %spec.url, %status, %message, "yt-dlp download failed");
            Err(Error::ExtractionFailed(message))
        }
    }
}

/// Decodes one output line, replacing invalid UTF-8 instead of failing.
fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim_end_matches('\r').to_string()
}

/// Routes a recognised line to the observer. Returns false for other output.
fn dispatch(line: &str, observer: &dyn DownloadObserver) -> bool {
    match progress::parse_backend_line(line) {
        Some(BackendLine::Progress(tick)) => observer.on_progress(tick),
        Some(BackendLine::Finished(path)) => observer.on_item_finished(path),
        None => return false,
    }
    true
}

/// Resolves the yt-dlp executable: explicit path, bundled asset, then `PATH`.
pub fn locate_binary(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::UnexpectedFailure(format!(
            "configured yt-dlp not found at {}",
            path.display()
        )));
    }

    let bin = if cfg!(target_os = "windows") { "yt-dlp.exe" } else { "yt-dlp" };
    let Some(data) = Asset::get(bin) else {
        return Ok(PathBuf::from(bin));
    };

    let tmp = std::env::temp_dir().join(bin);
    let up_to_date = std::fs::metadata(&tmp)
        .map(|m| m.len() == data.data.len() as u64)
        .unwrap_or(false);
    if !up_to_date {
        debug!(path = %tmp.display(), "unpacking bundled yt-dlp");
        let mut f = File::create(&tmp)?;
        f.write_all(&data.data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o755))?;
        }
    }
    Ok(tmp)
}

#[cfg(test)]
pub mod fake {
    //! Scripted backend for tests.

    use std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::*;

    /// How a fake download behaves
    #[derive(Debug, Clone)]
    pub enum Script {
        /// Report the ticks, one finished file, then succeed
        Succeed(Vec<ProgressTick>),
        Fail(Error),
        /// Report the ticks, then wait for cancellation
        Hang(Vec<ProgressTick>),
        /// Never finishes, even when cancelled
        Stubborn,
    }

    /// How a fake metadata lookup behaves
    #[derive(Debug, Clone)]
    pub enum Lookup {
        Ready(Result<MediaInfo>),
        /// Waits for cancellation
        Hang,
        /// Waits, then answers
        Delayed(Duration, Result<MediaInfo>),
    }

    #[derive(Default)]
    pub struct FakeBackend {
        lookups: Mutex<HashMap<String, Lookup>>,
        downloads: Mutex<HashMap<String, Script>>,
        started: Mutex<Vec<String>>,
        active: AtomicUsize,
        pub peak_active: AtomicUsize,
    }

    impl FakeBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn lookup(self, url: &str, lookup: Lookup) -> Self {
            self.lookups.lock().unwrap().insert(url.to_string(), lookup);
            self
        }

        pub fn download(self, url: &str, script: Script) -> Self {
            self.downloads.lock().unwrap().insert(url.to_string(), script);
            self
        }

        pub fn started(&self) -> Vec<String> {
            self.started.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn extract_metadata(
            &self,
            url: &str,
            _mode: MetadataMode,
            cancel: &CancellationToken,
        ) -> Result<MediaInfo> {
            let lookup = self.lookups.lock().unwrap().get(url).cloned();
            match lookup {
                None => Ok(MediaInfo {
                    title: Some(format!("Title of {url}")),
                    duration: Some(65.0),
                    ..Default::default()
                }),
                Some(Lookup::Ready(result)) => result,
                Some(Lookup::Hang) => {
                    cancel.cancelled().await;
                    Err(Error::Cancelled)
                }
                Some(Lookup::Delayed(delay, result)) => {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => result,
                    }
                }
            }
        }

        async fn download(
            &self,
            spec: &DownloadSpec,
            observer: &dyn DownloadObserver,
            cancel: &CancellationToken,
        ) -> Result<()> {
            self.started.lock().unwrap().push(spec.url.clone());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_active.fetch_max(now, Ordering::SeqCst);

            let script = self
                .downloads
                .lock()
                .unwrap()
                .get(&spec.url)
                .cloned()
                .unwrap_or(Script::Succeed(Vec::new()));
            let result = match script {
                Script::Succeed(ticks) => {
                    for tick in ticks {
                        observer.on_progress(tick);
                    }
                    observer.on_item_finished(PathBuf::from(format!("{}.mp4", spec.url)));
                    Ok(())
                }
                Script::Fail(err) => Err(err),
                Script::Hang(ticks) => {
                    for tick in ticks {
                        observer.on_progress(tick);
                    }
                    cancel.cancelled().await;
                    Err(Error::Cancelled)
                }
                Script::Stubborn => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            };

            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_args_for_video() {
        let spec = DownloadSpec::new("https://v/1", Quality::P720, Path::new("/dl"));
        let args = download_args(&spec);
        assert_eq!(&args[..4], ["-f", "best[height<=720][vcodec^=avc]", "-o", "/dl/%(title)s.%(ext)s"]);
        assert!(args.contains(&"--no-playlist".to_string()));
        assert!(!args.contains(&"-x".to_string()));
        assert_eq!(args.last().unwrap(), "https://v/1");
    }

    #[test]
    fn download_args_for_mp3() {
        let spec = DownloadSpec::new("https://v/1", Quality::AudioMp3, Path::new("/dl"));
        let args = download_args(&spec);
        assert_eq!(args[1], "bestaudio/best");
        let joined = args.join(" ");
        assert!(joined.contains("-x --audio-format mp3 --audio-quality 192K"));
    }

    #[test]
    fn metadata_args_by_mode() {
        let playlist = metadata_args("u", MetadataMode::Playlist);
        assert!(playlist.contains(&"--flat-playlist".to_string()));
        assert!(playlist.contains(&"--ignore-errors".to_string()));
        let single = metadata_args("u", MetadataMode::Single);
        assert!(single.contains(&"--no-playlist".to_string()));
        assert!(!single.contains(&"--flat-playlist".to_string()));
    }

    #[test]
    fn error_message_prefers_error_lines() {
        let stderr = "WARNING: slow\nERROR: [youtube] abc: Video unavailable\nsome trailer\n";
        assert_eq!(error_message(stderr.lines()), "[youtube] abc: Video unavailable");
        assert_eq!(error_message("just noise".lines()), "just noise");
        assert_eq!(error_message(std::iter::empty()), "yt-dlp exited with an error");
    }

    #[test]
    fn playlist_json_with_null_entries() {
        let json = r#"{
            "title": "Mix",
            "entries": [
                {"id": "a", "title": "First", "duration": 61.0, "url": "https://y/a", "uploader": "Me"},
                null,
                {"id": "c", "url": "https://y/c"}
            ]
        }"#;
        let info: MediaInfo = serde_json::from_str(json).unwrap();
        let entries = info.entries.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[1].is_none());
        assert_eq!(entries[0].as_ref().unwrap().duration_seconds(), Some(61));
    }

    #[test]
    fn missing_configured_binary_is_an_error() {
        let err = locate_binary(Some(Path::new("/definitely/not/here/yt-dlp"))).unwrap_err();
        assert!(matches!(err, Error::UnexpectedFailure(_)));
    }

    #[tokio::test]
    async fn missing_executable_is_unexpected_failure() {
        let backend = YtDlp::new(PathBuf::from("/definitely/not/here/yt-dlp"), Vec::new());
        let err = backend
            .extract_metadata("https://v/1", MetadataMode::Single, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedFailure(_)));
    }

    /// Observer that records everything it is told
    #[derive(Default)]
    struct Recorder {
        ticks: std::sync::Mutex<Vec<ProgressTick>>,
        finished: std::sync::Mutex<Vec<PathBuf>>,
    }

    impl DownloadObserver for Recorder {
        fn on_progress(&self, tick: ProgressTick) {
            self.ticks.lock().unwrap().push(tick);
        }

        fn on_item_finished(&self, path: PathBuf) {
            self.finished.lock().unwrap().push(path);
        }
    }

    /// Runs `body` through `sh` in place of yt-dlp. Going through the shell
    /// avoids exec'ing a freshly written file.
    #[cfg(unix)]
    fn scripted(dir: &tempfile::TempDir, body: &str) -> YtDlp {
        let script = dir.path().join("yt-dlp.sh");
        std::fs::write(&script, body).unwrap();
        YtDlp::new(PathBuf::from("/bin/sh"), vec![script.display().to_string()])
    }

    fn any_spec() -> DownloadSpec {
        DownloadSpec::new("https://v/1", Quality::P360, Path::new("/dl"))
    }

    #[test]
    fn output_is_requested_as_utf8() {
        let args = download_args(&any_spec());
        let pos = args.iter().position(|a| a == "--encoding").unwrap();
        assert_eq!(args[pos + 1], "utf-8");
        assert!(metadata_args("u", MetadataMode::Single).contains(&"--encoding".to_string()));
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        assert_eq!(decode_line(b"WARNING: caf\xe9\r"), "WARNING: caf\u{FFFD}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn progress_and_finished_lines_reach_the_observer() {
        let dir = tempfile::tempdir().unwrap();
        let backend = scripted(
            &dir,
            "echo 'tubegrab-progress:500 1000 NA 100.0 5 /dl/x.mp4.part'\n\
             echo 'tubegrab-progress:750 1000 NA 100.0 2 /dl/x.mp4.part' >&2\n\
             echo '[download] noise'\n\
             echo 'tubegrab-finished:/dl/x.mp4'\n",
        );
        let recorder = Recorder::default();
        backend
            .download(&any_spec(), &recorder, &CancellationToken::new())
            .await
            .unwrap();

        let ticks = recorder.ticks.lock().unwrap();
        let mut downloaded: Vec<u64> = ticks.iter().map(|t| t.downloaded_bytes).collect();
        downloaded.sort_unstable();
        assert_eq!(downloaded, vec![500, 750]);
        assert_eq!(ticks[0].tmp_filename, Some(PathBuf::from("/dl/x.mp4.part")));
        assert_eq!(*recorder.finished.lock().unwrap(), vec![PathBuf::from("/dl/x.mp4")]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_utf8_output_does_not_fail_the_download() {
        let dir = tempfile::tempdir().unwrap();
        let backend = scripted(
            &dir,
            "printf 'WARNING: caf\\351\\n' >&2\n\
             printf 'tubegrab-finished:/dl/caf\\351.mp4\\n'\n\
             exit 0\n",
        );
        let recorder = Recorder::default();
        let result = backend
            .download(&any_spec(), &recorder, &CancellationToken::new())
            .await;
        assert_eq!(result, Ok(()));
        assert_eq!(
            *recorder.finished.lock().unwrap(),
            vec![PathBuf::from("/dl/caf\u{FFFD}.mp4")]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_exit_reports_last_error_line() {
        let dir = tempfile::tempdir().unwrap();
        let backend = scripted(
            &dir,
            "echo 'WARNING: retrying' >&2\n\
             echo 'ERROR: [youtube] abc: Video unavailable' >&2\n\
             echo 'cleanup done' >&2\n\
             exit 1\n",
        );
        let err = backend
            .download(&any_spec(), &Recorder::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::ExtractionFailed("[youtube] abc: Video unavailable".into())
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelling_kills_a_running_download() {
        let dir = tempfile::tempdir().unwrap();
        let backend = scripted(&dir, "echo 'tubegrab-progress:1 10 NA NA NA NA'\nexec sleep 30\n");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = backend.download(&any_spec(), &Recorder::default(), &cancel).await;
        assert_eq!(result, Err(Error::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
