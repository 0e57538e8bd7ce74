//! Frame sources: decoded video files, cameras and still images.

mod video;
mod writer;

pub use video::VideoReader;
pub use writer::VideoWriter;

use image::RgbImage;
use mime_guess::mime;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Frame rate assumed when a stream does not report a usable one.
pub const DEFAULT_FRAME_RATE: f64 = 10.0;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open media source {location}: {reason}")]
    Open { location: String, reason: String },
    #[error("media source {location} has no video stream")]
    NoVideoStream { location: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Video(PathBuf),
    Image(PathBuf),
    /// Capture device path, e.g. `/dev/video0`.
    Camera(String),
}

impl MediaSource {
    /// Classifies a file by the MIME type guessed from its name; anything that
    /// is not `image/*` is treated as video.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if is_image_path(&path) {
            MediaSource::Image(path)
        } else {
            MediaSource::Video(path)
        }
    }

    /// A bare device index such as `0` maps to `/dev/video0`; anything else is
    /// taken as a device path or URL as-is.
    pub fn camera(device: &str) -> Self {
        let device = device.trim();
        if !device.is_empty() && device.chars().all(|c| c.is_ascii_digit()) {
            MediaSource::Camera(format!("/dev/video{device}"))
        } else {
            MediaSource::Camera(device.to_string())
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, MediaSource::Image(_))
    }

    pub fn location(&self) -> String {
        match self {
            MediaSource::Video(path) | MediaSource::Image(path) => path.display().to_string(),
            MediaSource::Camera(device) => device.clone(),
        }
    }
}

impl fmt::Display for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSource::Video(path) => write!(f, "video {}", path.display()),
            MediaSource::Image(path) => write!(f, "image {}", path.display()),
            MediaSource::Camera(device) => write!(f, "camera {device}"),
        }
    }
}

fn is_image_path(path: &Path) -> bool {
    mime_guess::from_path(path)
        .first()
        .is_some_and(|m| m.type_() == mime::IMAGE)
}

/// An opened source producing RGB frames in order.
pub enum FrameSource {
    Video(Box<VideoReader>),
    Image(Option<RgbImage>),
}

impl FrameSource {
    pub fn open(source: &MediaSource) -> Result<Self, SourceError> {
        match source {
            MediaSource::Image(path) => {
                let image = image::open(path)
                    .map_err(|e| SourceError::Open {
                        location: path.display().to_string(),
                        reason: e.to_string(),
                    })?
                    .to_rgb8();
                info!(%source, width = image.width(), height = image.height(), "Opened still image");
                Ok(FrameSource::Image(Some(image)))
            }
            MediaSource::Video(_) | MediaSource::Camera(_) => {
                let reader = VideoReader::open(&source.location())?;
                info!(
                    %source,
                    width = reader.width(),
                    height = reader.height(),
                    fps = reader.frame_rate(),
                    "Opened video source"
                );
                Ok(FrameSource::Video(Box::new(reader)))
            }
        }
    }

    /// Next decoded frame, or `None` once the source is exhausted.
    pub fn next_frame(&mut self) -> anyhow::Result<Option<RgbImage>> {
        match self {
            FrameSource::Video(reader) => reader.next_frame(),
            FrameSource::Image(image) => {
                let frame = image.take();
                if frame.is_none() {
                    debug!("Still image already emitted");
                }
                Ok(frame)
            }
        }
    }

    pub fn frame_rate(&self) -> f64 {
        match self {
            FrameSource::Video(reader) => reader.frame_rate(),
            FrameSource::Image(_) => DEFAULT_FRAME_RATE,
        }
    }
}
