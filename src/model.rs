use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Quality choices offered in the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Quality {
    #[default]
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "360p")]
    P360,
    #[serde(rename = "Audio MP3")]
    AudioMp3,
}

impl Quality {
    /// Every option, in the order shown by the quality combo box
    pub const ALL: [Quality; 5] = [
        Quality::P1080,
        Quality::P720,
        Quality::P480,
        Quality::P360,
        Quality::AudioMp3,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Quality::P1080 => "1080p",
            Quality::P720 => "720p",
            Quality::P480 => "480p",
            Quality::P360 => "360p",
            Quality::AudioMp3 => "Audio MP3",
        }
    }

    /// yt-dlp format selector for this quality
    pub fn format_selector(self) -> &'static str {
        match self {
            Quality::P1080 => "best[height<=1080][vcodec^=avc]",
            Quality::P720 => "best[height<=720][vcodec^=avc]",
            Quality::P480 => "best[height<=480][vcodec^=avc]",
            Quality::P360 => "best[height<=360][vcodec^=avc]",
            Quality::AudioMp3 => "bestaudio/best",
        }
    }

    /// Whether the download is transcoded to mp3 after fetching
    pub fn extracts_audio(self) -> bool {
        matches!(self, Quality::AudioMp3)
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What the user asked for when pressing Download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub quality: Quality,
    pub destination: PathBuf,
}

/// One playlist item's metadata snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistEntry {
    /// 1-based position in the playlist as returned by the backend
    pub index: usize,
    pub title: String,
    pub duration_seconds: Option<u64>,
    pub url: String,
    pub id: String,
    pub uploader: String,
}

/// Represents the current state of one entry in the playlist panel
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DownloadStatus {
    /// Not part of a running batch yet
    #[default]
    Pending,
    /// Download is in progress
    Downloading,
    /// Download has completed successfully
    Done,
    /// Download failed and was skipped
    Failed(String),
}

/// Playlist entry as shown in the UI, with its selection checkbox
#[derive(Debug, Clone)]
pub struct EntryRow {
    pub entry: PlaylistEntry,
    pub selected: bool,
    pub status: DownloadStatus,
}

impl EntryRow {
    pub fn new(entry: PlaylistEntry) -> Self {
        Self {
            entry,
            selected: true,
            status: DownloadStatus::Pending,
        }
    }
}
