//! Frame pipeline: read, detect, draw, encode.
//!
//! Each MJPEG stream owns one blocking thread that runs the loop and hands
//! finished multipart chunks to the HTTP body through a small bounded channel.
//! The offline path runs the same loop but writes files instead.

mod offline;
mod pacer;

pub use offline::{OFFLINE_FRAME_RATE, OfflineJob, OfflineSummary, output_path, run_offline};
pub use pacer::FramePacer;

use crate::annotate::{draw_detections, encode_jpeg};
use crate::classes::ClassTable;
use crate::detection::SharedDetector;
use crate::source::{FrameSource, MediaSource, SourceError};
use crate::stream::multipart_chunk;
use anyhow::anyhow;
use async_channel::{Receiver, Sender};
use bytes::Bytes;
use image::RgbImage;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Chunks buffered between the pipeline thread and the response body.
pub const STREAM_CHANNEL_CAPACITY: usize = 2;

/// Receiving end of a running stream. Dropping it stops the pipeline.
pub type MjpegStream = Receiver<Bytes>;

/// Runs detection on a frame and draws the results onto it.
#[derive(Clone)]
pub struct FrameAnnotator {
    detector: SharedDetector,
    classes: Arc<ClassTable>,
}

impl FrameAnnotator {
    pub fn new(detector: SharedDetector, classes: Arc<ClassTable>) -> Self {
        Self { detector, classes }
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    /// Returns the annotated frame and the number of detections drawn.
    pub fn annotate(
        &self,
        mut frame: RgbImage,
        confidence: f32,
    ) -> anyhow::Result<(RgbImage, usize)> {
        let detections = {
            let mut detector = self
                .detector
                .lock()
                .map_err(|_| anyhow!("Detector lock poisoned"))?;
            detector.detect(&frame, confidence)?
        };
        draw_detections(&mut frame, &detections, &self.classes);
        Ok((frame, detections.len()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub confidence: f32,
    pub jpeg_quality: u8,
    /// 0 disables pacing.
    pub max_fps: f64,
}

/// Opens `source` on a blocking thread and starts streaming annotated frames.
///
/// Open failures are returned here, before any chunk exists, so callers can
/// still answer with a proper error status.
pub async fn spawn_stream(
    source: MediaSource,
    annotator: FrameAnnotator,
    settings: StreamSettings,
) -> Result<MjpegStream, SourceError> {
    let (open_tx, open_rx) = oneshot::channel();
    let (chunk_tx, chunk_rx) = async_channel::bounded(STREAM_CHANNEL_CAPACITY);

    tokio::task::spawn_blocking(move || {
        let mut frames = match FrameSource::open(&source) {
            Ok(frames) => {
                let _ = open_tx.send(Ok(()));
                frames
            }
            Err(err) => {
                let _ = open_tx.send(Err(err));
                return;
            }
        };

        let started = Instant::now();
        match stream_frames(&mut frames, &annotator, settings, &chunk_tx) {
            Ok(emitted) => info!(
                %source,
                frames = emitted,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Stream finished"
            ),
            Err(err) => error!(%source, ?err, "Stream aborted"),
        }
    });

    open_rx
        .await
        .map_err(|_| SourceError::Other(anyhow!("Stream worker exited before opening the source")))??;
    Ok(chunk_rx)
}

/// Pushes frames until the source ends or the receiver goes away. Returns the
/// number of chunks sent.
fn stream_frames(
    frames: &mut FrameSource,
    annotator: &FrameAnnotator,
    settings: StreamSettings,
    chunk_tx: &Sender<Bytes>,
) -> anyhow::Result<u64> {
    let mut pacer = FramePacer::new(settings.max_fps);
    let mut frame_index = 0u64;

    while !chunk_tx.is_closed() {
        let Some(frame) = frames.next_frame()? else {
            break;
        };

        let (annotated, detections) = annotator.annotate(frame, settings.confidence)?;
        let jpeg = encode_jpeg(&annotated, settings.jpeg_quality)?;
        debug!(frame_index, detections, bytes = jpeg.len(), "Frame annotated");

        if let Some(pacer) = pacer.as_mut() {
            pacer.wait();
        }
        if chunk_tx.send_blocking(multipart_chunk(&jpeg)).is_err() {
            break;
        }
        frame_index += 1;
    }

    if chunk_tx.is_closed() {
        warn!(frames = frame_index, "Client disconnected, stopping stream");
    }
    Ok(frame_index)
}
