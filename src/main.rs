//! Desktop front-end for yt-dlp: single videos and playlists, one at a time

// Persisted user settings
mod config;
// UI-thread glue between actions, tasks and the session
mod controller;
// yt-dlp backend (metadata + downloads)
mod downloader;
// Error types
mod error;
// Background job downloading one item
mod job;
// tracing subscriber setup
mod logging;
// Data models for requests, playlist entries and row status
mod model;
// Playlist loading
mod playlist;
// Progress parsing and human-readable formatting
mod progress;
// Sequential download orchestration
mod session;
// Background tasks with cancellation and event channels
mod task;
// Thumbnail fetching module
mod thumbnail;

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use config::Settings;
use controller::{Controller, Dialog};
use downloader::{Backend, YtDlp};
use model::{DownloadStatus, Quality};

// eframe/egui for GUI application framework
use eframe::{App, Frame, egui};
use egui::{ColorImage, TextureOptions, Visuals};
// OnceCell for single-time runtime initialization
use once_cell::sync::OnceCell;
// FileDialog for folder selection dialogs
use rfd::FileDialog;
use tokio::runtime::Runtime;
use tracing::{info, warn};

// Global Tokio runtime stored in a OnceCell for lazy init
static RUNTIME: OnceCell<Arc<Runtime>> = OnceCell::new();

/// Characters of a playlist title shown in the list
const TITLE_WIDTH: usize = 60;

/// Program entry point: loads settings, starts logging and the runtime, launches the GUI
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let loaded = Settings::load();
    let level = loaded
        .as_ref()
        .map(|s| s.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    logging::init(&level);
    let settings = Settings::load_or_default(loaded);

    // Create a new Tokio runtime and store it globally
    let rt = Arc::new(Runtime::new()?);
    let handle = rt.handle().clone();
    if RUNTIME.set(rt).is_err() {
        return Err("runtime already initialised".into());
    }

    let (backend, backend_warning): (Arc<dyn Backend>, Option<String>) =
        match YtDlp::from_settings(&settings) {
            Ok(ytdlp) => (Arc::new(ytdlp), None),
            Err(err) => {
                warn!(error = %err, "falling back to yt-dlp on PATH");
                let fallback = YtDlp::new(PathBuf::from("yt-dlp"), settings.backend_args());
                (Arc::new(fallback), Some(format!("⚠ {err}; using yt-dlp from PATH")))
            }
        };

    let mut app = DownloaderApp::new(Controller::new(backend, handle, &settings), settings);
    if let Some(line) = backend_warning {
        app.controller.log(line);
    }

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title("YouTube Downloader")
            .with_inner_size([900.0, 700.0]),
        ..Default::default()
    };
    info!("starting UI");
    eframe::run_native(
        "YouTube Downloader",
        options,
        Box::new(|cc| {
            // Use dark theme visuals
            cc.egui_ctx.set_visuals(Visuals::dark());
            Box::new(app)
        }),
    )?;
    Ok(())
}

/// Application state for the GUI
struct DownloaderApp {
    controller: Controller,
    settings: Settings,
    /// Input field for the video or playlist URL
    url_input: String,
    /// Destination folder for downloads
    download_folder: String,
    selected_quality: Quality,
    /// Cancel was pressed; waiting for the user to confirm
    confirm_cancel: bool,
    /// Cached textures for video thumbnails, keyed by thumbnail URL
    thumbnails: HashMap<String, egui::TextureHandle>,
    /// Thumbnail URLs already requested
    requested_thumbnails: HashSet<String>,
    /// Incoming thumbnail fetch results (thumbnail url, image)
    thumbnail_results: Arc<Mutex<Vec<(String, ColorImage)>>>,
}

impl DownloaderApp {
    fn new(controller: Controller, settings: Settings) -> Self {
        Self {
            controller,
            url_input: String::new(),
            download_folder: settings.destination.display().to_string(),
            selected_quality: settings.quality,
            settings,
            confirm_cancel: false,
            thumbnails: HashMap::new(),
            requested_thumbnails: HashSet::new(),
            thumbnail_results: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn start_download(&mut self) {
        let folder = PathBuf::from(self.download_folder.trim());
        self.settings.destination = folder.clone();
        self.settings.quality = self.selected_quality;
        if let Err(err) = self.settings.save() {
            warn!(error = %err, "could not save settings");
        }
        let url = self.url_input.clone();
        self.controller.start_download(&url, self.selected_quality, folder);
    }

    fn clear(&mut self) {
        self.controller.clear();
        self.url_input.clear();
        self.confirm_cancel = false;
    }

    /// Spawns a thumbnail fetch for the current preview, once per URL
    fn request_thumbnail(&mut self, ctx: &egui::Context) {
        let Some(url) = self
            .controller
            .view
            .preview
            .as_ref()
            .and_then(|p| p.thumbnail.clone())
        else {
            return;
        };
        if !self.requested_thumbnails.insert(url.clone()) {
            return;
        }
        let Some(rt) = RUNTIME.get() else {
            return;
        };
        let results = Arc::clone(&self.thumbnail_results);
        let ctx_c = ctx.clone();
        rt.spawn_blocking(move || {
            if let Some(img) = thumbnail::fetch_thumbnail(&url) {
                if let Ok(mut pending) = results.lock() {
                    pending.push((url, img));
                }
                ctx_c.request_repaint();
            }
        });
    }

    /// Moves finished thumbnail fetches into textures
    fn collect_thumbnails(&mut self, ctx: &egui::Context) {
        let Ok(mut pending) = self.thumbnail_results.lock() else {
            return;
        };
        for (url, img) in pending.drain(..) {
            let tex = ctx.load_texture(&url, img, TextureOptions::default());
            self.thumbnails.insert(url, tex);
        }
    }

    fn show_dialogs(&mut self, ctx: &egui::Context) {
        if self.confirm_cancel {
            egui::Window::new("Cancel download")
                .collapsible(false)
                .resizable(false)
                .anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
                .show(ctx, |ui| {
                    ui.label("Are you sure you want to cancel the current download?");
                    ui.horizontal(|ui| {
                        if ui.button("Yes").clicked() {
                            self.controller.cancel();
                            self.confirm_cancel = false;
                        }
                        if ui.button("No").clicked() {
                            self.confirm_cancel = false;
                        }
                    });
                });
        }

        if let Some(dialog) = self.controller.view.dialog.clone() {
            let (title, message) = match dialog {
                Dialog::Warning(message) => ("Warning", message),
                Dialog::Error(message) => ("Download error", message),
            };
            egui::Window::new(title)
                .collapsible(false)
                .resizable(false)
                .anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
                .show(ctx, |ui| {
                    ui.label(message);
                    if ui.button("OK").clicked() {
                        self.controller.view.dialog = None;
                    }
                });
        }
    }

    fn show_options(&mut self, ui: &mut egui::Ui) {
        ui.group(|ui| {
            ui.label("⚙️ Download options");
            egui::Grid::new("options").num_columns(3).show(ui, |ui| {
                // Quality dropdown
                ui.label("🎯 Quality:");
                egui::ComboBox::from_id_source("quality")
                    .selected_text(self.selected_quality.label())
                    .show_ui(ui, |ui| {
                        for q in Quality::ALL {
                            ui.selectable_value(&mut self.selected_quality, q, q.label());
                        }
                    });
                ui.end_row();

                // Folder selection
                ui.label("📁 Save to:");
                ui.text_edit_singleline(&mut self.download_folder);
                if ui.button("📂 Browse…").clicked() {
                    if let Some(folder) = FileDialog::new()
                        .set_directory(&self.download_folder)
                        .pick_folder()
                    {
                        self.download_folder = folder.display().to_string();
                    }
                }
                ui.end_row();
            });
        });
    }

    fn show_playlist(&mut self, ui: &mut egui::Ui, busy: bool) {
        if !self.controller.view.is_playlist {
            return;
        }
        ui.group(|ui| {
            ui.label("📋 Playlist videos");
            ui.horizontal(|ui| {
                ui.add_enabled_ui(!busy, |ui| {
                    if ui.button("✅ Select all").clicked() {
                        self.controller.set_all_selected(true);
                    }
                    if ui.button("❌ Deselect all").clicked() {
                        self.controller.set_all_selected(false);
                    }
                });
                ui.label(
                    egui::RichText::new(format!(
                        "{} videos selected",
                        self.controller.selected_count()
                    ))
                    .strong(),
                );
            });

            egui::ScrollArea::vertical()
                .id_source("playlist")
                .max_height(200.0)
                .auto_shrink([false; 2])
                .show(ui, |ui| {
                    for row in &mut self.controller.view.playlist {
                        let title: String = row.entry.title.chars().take(TITLE_WIDTH).collect();
                        let text = format!(
                            "📹 {:3}. {}... ({})",
                            row.entry.index,
                            title,
                            progress::format_duration(row.entry.duration_seconds)
                        );
                        ui.horizontal(|ui| {
                            ui.add_enabled(!busy, egui::Checkbox::new(&mut row.selected, text))
                                .on_hover_text(format!(
                                    "Uploader: {}\nID: {}",
                                    row.entry.uploader, row.entry.id
                                ));
                            match &row.status {
                                DownloadStatus::Pending => {}
                                DownloadStatus::Downloading => {
                                    ui.label("⬇️");
                                }
                                DownloadStatus::Done => {
                                    ui.label("✅");
                                }
                                DownloadStatus::Failed(message) => {
                                    ui.label("❌").on_hover_text(message.as_str());
                                }
                            }
                        });
                    }
                });
        });
    }

    fn show_progress(&self, ui: &mut egui::Ui, busy: bool) {
        let view = &self.controller.view;
        if let Some(preview) = &view.preview {
            ui.horizontal(|ui| {
                // Show thumbnail if available
                if let Some(tex) = preview
                    .thumbnail
                    .as_ref()
                    .and_then(|url| self.thumbnails.get(url))
                {
                    ui.add(egui::Image::new(tex).max_width(160.0));
                }
                ui.label(egui::RichText::new(&preview.title).strong());
            });
        }

        if busy {
            ui.horizontal(|ui| {
                let fraction = f32::from(view.percent.unwrap_or(0)) / 100.0;
                ui.add(
                    egui::ProgressBar::new(fraction)
                        .show_percentage()
                        .desired_width(400.0),
                );
                ui.label(format!("🚀 Speed: {}", view.speed));
                ui.label(format!("⏱️ ETA: {}", view.eta));
            });
        } else if let Some(folder) = view.finished_folder.clone() {
            ui.horizontal(|ui| {
                ui.add(egui::ProgressBar::new(1.0).show_percentage().desired_width(400.0));
                if ui.button("Open folder").clicked() {
                    open_folder(&folder);
                }
            });
        }
    }
}

/// GUI update loop: called each frame to redraw and handle interactions
impl App for DownloaderApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut Frame) {
        // 1️⃣ Apply everything the background tasks reported
        self.controller.poll();

        // 2️⃣ Thumbnails: start pending fetches, upload finished ones
        self.request_thumbnail(ctx);
        self.collect_thumbnails(ctx);

        let busy = self.controller.is_busy();
        if !busy {
            self.confirm_cancel = false;
        }

        // 3️⃣ Modal windows
        self.show_dialogs(ctx);

        // 4️⃣ Main panel
        egui::CentralPanel::default().show(ctx, |ui| {
            ui.vertical_centered(|ui| ui.heading("📺 YouTube Downloader"));
            ui.add_space(8.0);

            // URL input field; edits may start a playlist load
            ui.group(|ui| {
                ui.label("🔗 Video / playlist URL");
                let response = ui.add_enabled(
                    !busy,
                    egui::TextEdit::singleline(&mut self.url_input)
                        .hint_text("📋 Paste the YouTube URL here...")
                        .desired_width(f32::INFINITY),
                );
                if response.changed() {
                    let url = self.url_input.clone();
                    self.controller.on_url_changed(&url);
                }
                if self.controller.is_loading_playlist() {
                    ui.horizontal(|ui| {
                        ui.spinner();
                        ui.label("Loading playlist…");
                    });
                }
            });

            ui.add_enabled_ui(!busy, |ui| self.show_options(ui));
            self.show_playlist(ui, busy);

            // Action buttons
            ui.horizontal(|ui| {
                if busy {
                    if ui.button("❌ Cancel").clicked() {
                        self.confirm_cancel = true;
                    }
                } else if ui.button("⬇️ Download").clicked() {
                    self.start_download();
                }
                if ui.add_enabled(!busy, egui::Button::new("🧹 Clear")).clicked() {
                    self.clear();
                }
            });

            self.show_progress(ui, busy);

            // Activity log
            ui.group(|ui| {
                ui.label("📋 Activity log");
                egui::ScrollArea::vertical()
                    .id_source("log")
                    .max_height(200.0)
                    .auto_shrink([false; 2])
                    .stick_to_bottom(true)
                    .show(ui, |ui| {
                        for line in &self.controller.view.log {
                            ui.label(line);
                        }
                    });
            });
        });

        // Request periodic repaint for progress updates
        if busy || self.controller.is_loading_playlist() {
            ctx.request_repaint_after(Duration::from_millis(100));
        }
    }
}

/// Opens a folder in the platform file manager
fn open_folder(folder: &Path) {
    let folder = folder.to_path_buf();
    std::thread::spawn(move || {
        #[cfg(target_os = "windows")]
        let result = std::process::Command::new("explorer").arg(&folder).spawn();
        #[cfg(target_os = "macos")]
        let result = std::process::Command::new("open").arg(&folder).spawn();
        #[cfg(all(unix, not(target_os = "macos")))]
        let result = std::process::Command::new("xdg-open").arg(&folder).spawn();
        if let Err(err) = result {
            warn!(folder = %folder.display(), error = %err, "could not open folder");
        }
    });
}
