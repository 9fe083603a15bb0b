//! Persisted user settings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::Quality;

const APP_NAME: &str = "tubegrab";
const CONFIG_NAME: &str = "settings";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Folder downloads are written to
    pub destination: PathBuf,
    /// Last quality picked in the UI
    pub quality: Quality,
    /// Explicit yt-dlp executable; falls back to the bundled one, then `PATH`
    pub ytdlp_path: Option<PathBuf>,
    /// Passed as `--js-runtimes` when set
    pub js_runtime: Option<String>,
    /// Passed as `--remote-components`, one flag per entry
    pub remote_components: Vec<String>,
    /// Remove the half-written file of a cancelled download
    pub delete_partial_on_cancel: bool,
    /// How long a cancelled task may keep running before it is aborted
    pub cancel_grace_secs: u64,
    /// Default tracing filter, overridden by `RUST_LOG`
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            quality: Quality::default(),
            ytdlp_path: None,
            js_runtime: Some("node".to_string()),
            remote_components: vec!["ejs:github".to_string()],
            delete_partial_on_cancel: true,
            cancel_grace_secs: 3,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Loads settings from the platform config directory, creating the file
    /// with defaults on first run.
    pub fn load() -> Result<Self, confy::ConfyError> {
        confy::load::<Settings>(APP_NAME, CONFIG_NAME)
    }

    /// Like [`Settings::load`], but falls back to defaults on failure.
    /// Call after logging is up so the warning is not lost.
    pub fn load_or_default(loaded: Result<Self, confy::ConfyError>) -> Self {
        match loaded {
            Ok(settings) => {
                debug!(destination = %settings.destination.display(), "settings loaded");
                settings
            }
            Err(err) => {
                warn!(error = %err, "could not load settings, using defaults");
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<(), confy::ConfyError> {
        confy::store(APP_NAME, CONFIG_NAME, self)
    }

    /// Extra backend flags derived from the JS runtime settings
    pub fn backend_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(runtime) = self.js_runtime.as_deref().filter(|r| !r.is_empty()) {
            args.push("--js-runtimes".to_string());
            args.push(runtime.to_string());
        }
        for component in &self.remote_components {
            args.push("--remote-components".to_string());
            args.push(component.clone());
        }
        args
    }
}

fn default_destination() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("./downloads"))
}
