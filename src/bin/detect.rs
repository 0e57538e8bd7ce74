//! Offline detection: annotates a video, camera or image into a file.

use clap::{Parser, ValueEnum};
use detect_stream::detection::{self, YoloDetector, YoloParams};
use detect_stream::{ClassTable, FrameAnnotator, MediaSource, OfflineJob, run_offline};
use ffmpeg_next::{self as ffmpeg};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PredictionType {
    Video,
    Image,
}

#[derive(Debug, Parser)]
#[command(version, about = "Run object detection on a file or camera and save the annotated result")]
struct DetectArgs {
    /// Video or image path, or a camera index such as 0
    #[arg(short, long, default_value = "0")]
    source: String,

    /// Treat the source as a video or an image (guessed from the file name when omitted)
    #[arg(short, long, value_enum)]
    prediction_type: Option<PredictionType>,

    /// ONNX detection model
    #[arg(short, long, default_value = "yolo_assets/Models/yolov8s.onnx")]
    model: PathBuf,

    /// Class names, one per line
    #[arg(short, long, default_value = "yolo_assets/Classes/classes.txt")]
    classes: PathBuf,

    /// Output path without extension; .avi or .jpg is appended
    #[arg(short, long, default_value = "yolo_assets/Detections/output")]
    outdir: PathBuf,

    /// Confidence threshold (default 0.1 for video, 0.5 for images)
    #[arg(long)]
    confidence: Option<f32>,

    /// NMS IoU threshold
    #[arg(long, default_value_t = 0.7)]
    iou_threshold: f32,

    /// Square model input size
    #[arg(long, default_value_t = 640)]
    input_size: u32,

    /// JPEG quality of written images and video frames
    #[arg(long, default_value_t = 95)]
    jpeg_quality: u8,

    /// Stop after this many frames
    #[arg(long)]
    max_frames: Option<u64>,
}

impl DetectArgs {
    fn media_source(&self) -> MediaSource {
        let is_camera_index =
            !self.source.is_empty() && self.source.chars().all(|c| c.is_ascii_digit());
        match self.prediction_type {
            Some(PredictionType::Image) => MediaSource::Image(PathBuf::from(&self.source)),
            _ if is_camera_index => MediaSource::camera(&self.source),
            Some(PredictionType::Video) => MediaSource::Video(PathBuf::from(&self.source)),
            None => MediaSource::from_path(&self.source),
        }
    }

    fn job(&self) -> anyhow::Result<OfflineJob> {
        let source = self.media_source();
        let confidence = self
            .confidence
            .unwrap_or(if source.is_image() { 0.5 } else { 0.1 });
        if !(0.0..=1.0).contains(&confidence) {
            anyhow::bail!("confidence must be within [0, 1], got {confidence}");
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            anyhow::bail!("iou threshold must be within [0, 1], got {}", self.iou_threshold);
        }
        if self.input_size == 0 || self.input_size % 32 != 0 {
            anyhow::bail!(
                "input size must be a positive multiple of 32, got {}",
                self.input_size
            );
        }

        Ok(OfflineJob {
            source,
            outdir: self.outdir.clone(),
            confidence,
            jpeg_quality: self.jpeg_quality.clamp(1, 100),
            max_frames: self.max_frames,
        })
    }
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn main() {
    init_tracing();

    if let Err(err) = start(DetectArgs::parse()) {
        error!(?err, "Detection failed");
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn start(args: DetectArgs) -> anyhow::Result<()> {
    ffmpeg::init()?;
    let job = args.job()?;

    let params = YoloParams {
        input_size: args.input_size,
        iou_threshold: args.iou_threshold,
        ..Default::default()
    };
    let detector = YoloDetector::load(&args.model, params)?;
    let classes = ClassTable::load(&args.classes)?;
    let annotator = FrameAnnotator::new(detection::shared(detector), Arc::new(classes));

    let summary = run_offline(&job, &annotator)?;
    println!(
        "{} ({} frames, {} detections)",
        summary.output.display(),
        summary.frames,
        summary.detections
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> DetectArgs {
        DetectArgs::try_parse_from(std::iter::once("detect").chain(extra.iter().copied())).unwrap()
    }

    #[test]
    fn camera_index_is_the_default_source() {
        let job = args(&[]).job().unwrap();
        assert_eq!(job.source, MediaSource::camera("0"));
        assert_eq!(job.confidence, 0.1);
        assert_eq!(job.outdir, PathBuf::from("yolo_assets/Detections/output"));
    }

    #[test]
    fn image_thresholds_and_forced_types() {
        let job = args(&["--source", "data/board.jpg"]).job().unwrap();
        assert!(job.source.is_image());
        assert_eq!(job.confidence, 0.5);

        let job = args(&["-s", "data/frame.bin", "-p", "image"]).job().unwrap();
        assert_eq!(job.source, MediaSource::Image("data/frame.bin".into()));

        let job = args(&["-s", "data/clip.png", "-p", "video", "--confidence", "0.3"])
            .job()
            .unwrap();
        assert_eq!(job.source, MediaSource::Video("data/clip.png".into()));
        assert_eq!(job.confidence, 0.3);
    }

    #[test]
    fn rejects_invalid_confidence() {
        assert!(args(&["--confidence", "2"]).job().is_err());
    }

    #[test]
    fn rejects_invalid_model_parameters() {
        assert!(args(&["--input-size", "0"]).job().is_err());
        assert!(args(&["--input-size", "100"]).job().is_err());
        assert!(args(&["--iou-threshold", "1.5"]).job().is_err());
        assert!(args(&["--iou-threshold=-0.1"]).job().is_err());
        assert!(args(&["--input-size", "320", "--iou-threshold", "0.5"]).job().is_ok());
    }
}
