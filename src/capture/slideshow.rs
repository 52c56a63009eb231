//! Still images from a folder presented as a live stream

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use serde::Serialize;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, instrument, warn};

use crate::capture::frame::Frame;
use crate::error::{RelayError, Result};
use crate::pipeline::StreamPipeline;
use crate::SlideshowSource;

const SUPPORTED_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "bmp", "gif", "tiff", "webp"];

/// Re-offer interval while an image is on screen
const REPEAT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlideshowStatus {
    /// 1-based index of the image on screen
    pub current_image: usize,
    pub total_images: usize,
    pub current_file: String,
}

pub struct Slideshow {
    files: Vec<PathBuf>,
    config: SlideshowSource,
}

impl Slideshow {
    /// Collect supported images from the configured folder, sorted by name.
    pub fn load(config: SlideshowSource) -> Result<Self> {
        let folder = &config.folder;
        if !folder.is_dir() {
            return Err(RelayError::Slideshow(format!(
                "image folder {} does not exist",
                folder.display()
            )));
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(folder)? {
            let path = entry?.path();
            let supported = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if supported && path.is_file() {
                files.push(path);
            }
        }
        files.sort();

        if files.is_empty() {
            return Err(RelayError::Slideshow(format!(
                "no supported images in {} (supported: {})",
                folder.display(),
                SUPPORTED_EXTENSIONS.join(", ")
            )));
        }

        info!("Found {} images to stream", files.len());
        Ok(Self { files, config })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Show each image for `display_secs`, then move on. Returns when the
    /// last image has been shown (unless repeating) or the pipeline stops.
    #[instrument(skip_all, fields(stream = %pipeline.name()))]
    pub async fn run(self, pipeline: Arc<StreamPipeline>) -> Result<()> {
        let total = self.files.len();
        let show_for = Duration::from_secs_f64(self.config.display_secs);
        let cancel = pipeline.cancel_token().clone();
        let mut sequence = 0u64;

        info!(
            "Starting image cycle - {} images, {:?} each",
            total, show_for
        );

        loop {
            let mut shown = 0usize;
            for (index, path) in self.files.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Ok(());
                }

                let name = file_name(path);
                info!("Loading image {}/{}: {}", index + 1, total, name);
                pipeline.set_slideshow_status(SlideshowStatus {
                    current_image: index + 1,
                    total_images: total,
                    current_file: name,
                });

                let data = {
                    let path = path.clone();
                    let (width, height, quality) =
                        (self.config.width, self.config.height, self.config.quality);
                    tokio::task::spawn_blocking(move || render(&path, width, height, quality))
                        .await
                };
                let data = match data {
                    Ok(Ok(data)) => data,
                    Ok(Err(e)) => {
                        warn!("Error processing image {}: {}", path.display(), e);
                        continue;
                    }
                    Err(e) => {
                        warn!("Image worker for {} failed: {}", path.display(), e);
                        continue;
                    }
                };

                let shown_until = Instant::now() + show_for;
                let mut tick = interval(REPEAT_INTERVAL);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                while Instant::now() < shown_until {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tick.tick() => {}
                    }
                    sequence += 1;
                    pipeline.publish(Frame::new(data.clone(), sequence));
                }
                shown += 1;
            }

            if shown == 0 {
                return Err(RelayError::Slideshow(format!(
                    "none of the {} images in {} could be decoded",
                    total,
                    self.config.folder.display()
                )));
            }

            if !self.config.repeat {
                break;
            }
        }

        info!("Finished cycling through all images");
        pipeline.set_slideshow_status(SlideshowStatus {
            current_image: total,
            total_images: total,
            current_file: "finished".into(),
        });
        pipeline.mark_inactive();
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Decode, letterbox and JPEG-encode one image.
pub fn render(path: &Path, width: u32, height: u32, quality: u8) -> Result<Bytes> {
    let image = image::open(path)?;
    encode_jpeg(&letterbox(image, width, height), quality)
}

/// Fit `image` inside `width x height` on a black canvas. Images are only
/// ever scaled down, preserving aspect ratio, and centred.
pub fn letterbox(image: DynamicImage, width: u32, height: u32) -> RgbImage {
    let rgb = image.to_rgb8();
    let (w, h) = rgb.dimensions();

    let scale = f64::min(width as f64 / w as f64, height as f64 / h as f64);
    let rgb = if scale < 1.0 {
        let new_w = ((w as f64 * scale) as u32).max(1);
        let new_h = ((h as f64 * scale) as u32).max(1);
        imageops::resize(&rgb, new_w, new_h, FilterType::Lanczos3)
    } else {
        rgb
    };

    let mut canvas = RgbImage::from_pixel(width, height, Rgb([0, 0, 0]));
    let x = (width - rgb.width()) / 2;
    let y = (height - rgb.height()) / 2;
    imageops::overlay(&mut canvas, &rgb, x as i64, y as i64);
    canvas
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Bytes> {
    let mut jpeg = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100));
        encoder.encode_image(image)?;
    }
    Ok(Bytes::from(jpeg))
}
