use eframe::egui::ColorImage;
use tracing::debug;

/// Downloads and decodes the thumbnail the backend reported for a video.
/// Blocking; run it off the UI thread.
pub fn fetch_thumbnail(url: &str) -> Option<ColorImage> {
    let resp = match reqwest::blocking::get(url).and_then(|r| r.error_for_status()) {
        Ok(resp) => resp.bytes().ok()?,
        Err(err) => {
            debug!(%url, error = %err, "thumbnail request failed");
            return None;
        }
    };
    // Load image data into an image::DynamicImage and convert to RGBA8
    let img = match image::load_from_memory(&resp) {
        Ok(img) => img.to_rgba8(),
        Err(err) => {
            debug!(%url, error = %err, "thumbnail could not be decoded");
            return None;
        }
    };
    let size = [img.width() as usize, img.height() as usize];
    Some(ColorImage::from_rgba_unmultiplied(size, &img))
}
