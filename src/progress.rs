//! Progress parsing for yt-dlp output and the human-readable formatters used
//! by the progress row and the activity log.

use std::path::PathBuf;

/// Marker yt-dlp prints in front of every progress tick
pub const PROGRESS_PREFIX: &str = "tubegrab-progress:";
/// Marker yt-dlp prints in front of every finished file path
pub const FINISHED_PREFIX: &str = "tubegrab-finished:";

/// `--progress-template` value. The temp filename goes last since it may
/// contain spaces.
pub const PROGRESS_TEMPLATE: &str = concat!(
    "download:tubegrab-progress:",
    "%(progress.downloaded_bytes)s %(progress.total_bytes)s ",
    "%(progress.total_bytes_estimate)s %(progress.speed)s %(progress.eta)s ",
    "%(progress.tmpfilename)s"
);

/// `--print` value reporting the final path once post-processing is done
pub const FINISHED_TEMPLATE: &str = "after_move:tubegrab-finished:%(filepath)s";

/// Raw numbers from one backend progress callback
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgressTick {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub total_bytes_estimate: Option<u64>,
    /// Bytes per second
    pub speed: Option<f64>,
    pub eta_seconds: Option<u64>,
    /// File the backend is currently writing to
    pub tmp_filename: Option<PathBuf>,
}

impl ProgressTick {
    /// Exact total when known, the estimate otherwise
    pub fn total(&self) -> Option<u64> {
        self.total_bytes
            .filter(|t| *t > 0)
            .or(self.total_bytes_estimate)
            .filter(|t| *t > 0)
    }

    /// Converts the tick into what the progress row shows. `None` when the
    /// total is unknown, in which case nothing is updated for this tick.
    pub fn display(&self) -> Option<ProgressUpdate> {
        let percent = percent(self.downloaded_bytes, self.total()?)?;
        let (speed, eta) = match self.speed.filter(|s| *s > 0.0) {
            Some(bps) => (
                format_bytes_rate(bps),
                self.eta_seconds
                    .filter(|e| *e > 0)
                    .map(format_eta)
                    .unwrap_or_else(|| "N/A".to_string()),
            ),
            None => ("--".to_string(), "--".to_string()),
        };
        Some(ProgressUpdate { percent, speed, eta })
    }
}

/// Formatted progress for one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub percent: u8,
    pub speed: String,
    pub eta: String,
}

/// What a single line of yt-dlp output means to us
#[derive(Debug, Clone, PartialEq)]
pub enum BackendLine {
    Progress(ProgressTick),
    Finished(PathBuf),
}

/// Parses one line printed by yt-dlp with our templates.
pub fn parse_backend_line(line: &str) -> Option<BackendLine> {
    let line = line.trim_end_matches(['\r', '\n']).trim_start();
    if let Some(rest) = line.strip_prefix(FINISHED_PREFIX) {
        let path = rest.trim();
        if path.is_empty() || path == "NA" {
            return None;
        }
        return Some(BackendLine::Finished(PathBuf::from(path)));
    }
    parse_progress_from_line(line).map(BackendLine::Progress)
}

/// Parses a progress-template line into a tick.
pub fn parse_progress_from_line(line: &str) -> Option<ProgressTick> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let mut fields = rest.trim().splitn(6, ' ');

    let downloaded_bytes = number(fields.next()?)?;
    let total_bytes = fields.next().and_then(number);
    let total_bytes_estimate = fields.next().and_then(number);
    let speed = fields.next().and_then(float);
    let eta_seconds = fields.next().and_then(number);
    let tmp_filename = fields
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "NA")
        .map(PathBuf::from);

    Some(ProgressTick {
        downloaded_bytes,
        total_bytes,
        total_bytes_estimate,
        speed,
        eta_seconds,
        tmp_filename,
    })
}

fn float(field: &str) -> Option<f64> {
    field.trim().parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
}

fn number(field: &str) -> Option<u64> {
    float(field).map(|v| v as u64)
}

/// `floor(downloaded / total * 100)`, capped at 100. `None` when the total is 0.
pub fn percent(downloaded_bytes: u64, total_bytes: u64) -> Option<u8> {
    if total_bytes == 0 {
        return None;
    }
    let pct = u128::from(downloaded_bytes) * 100 / u128::from(total_bytes);
    Some(pct.min(100) as u8)
}

/// Formats a transfer rate: `500B/s`, `2.0KB/s`, `1.0MB/s`, `1.5GB/s`.
pub fn format_bytes_rate(bytes_per_second: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let b = bytes_per_second.max(0.0);
    if b < KB {
        format!("{}B/s", b as u64)
    } else if b < MB {
        format!("{:.1}KB/s", b / KB)
    } else if b < GB {
        format!("{:.1}MB/s", b / MB)
    } else {
        format!("{:.1}GB/s", b / GB)
    }
}

/// Formats a remaining time: `45s`, `2m5s`, `1h1m`.
pub fn format_eta(seconds: u64) -> String {
    if seconds < 60 {
        format!("{seconds}s")
    } else if seconds < 3600 {
        format!("{}m{}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h{}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// Formats a media duration as `MM:SS` or `HH:MM:SS`; unknown or zero is `N/A`.
pub fn format_duration(seconds: Option<u64>) -> String {
    let Some(total) = seconds.filter(|s| *s > 0) else {
        return "N/A".to_string();
    };
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}
