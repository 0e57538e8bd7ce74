use anyhow::{Result, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Server configuration, loaded from CLI args and optionally a TOML file.
///
/// Example configuration file content
/// # Detection stream configuration
///
/// listen_on_port = 5000
/// bind_address = "0.0.0.0"
/// workspace = "yolo_assets"
///
/// # Model
/// model_path = "yolo_assets/Models/yolov8s.onnx"
/// class_path = "yolo_assets/Classes/classes.txt"
/// input_size = 640
/// iou_threshold = 0.7
///
/// # Streams
/// webcam = "0"
/// video_confidence = 0.1
/// image_confidence = 0.5
/// jpeg_quality = 85
/// max_stream_fps = 0.0
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Port to listen on
    #[arg(short, long, default_value_t = 5000)]
    #[serde(default = "default_port")]
    pub listen_on_port: u16,

    /// Address to bind
    #[arg(short, long, default_value = "0.0.0.0")]
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Root directory for uploads and detection outputs
    #[arg(short = 'w', long, default_value = "yolo_assets")]
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// ONNX detection model
    #[arg(short, long, default_value = "yolo_assets/Models/yolov8s.onnx")]
    #[serde(default = "default_model_path")]
    pub model_path: String,

    /// Class names, one per line
    #[arg(long, default_value = "yolo_assets/Classes/classes.txt")]
    #[serde(default = "default_class_path")]
    pub class_path: String,

    /// Camera device index or path for /webapp
    #[arg(long, default_value = "0")]
    #[serde(default = "default_webcam")]
    pub webcam: String,

    /// Confidence threshold for video and webcam frames
    #[arg(long, default_value_t = 0.1)]
    #[serde(default = "default_video_confidence")]
    pub video_confidence: f32,

    /// Confidence threshold for still images
    #[arg(long, default_value_t = 0.5)]
    #[serde(default = "default_image_confidence")]
    pub image_confidence: f32,

    /// NMS IoU threshold
    #[arg(long, default_value_t = 0.7)]
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,

    /// Maximum detections kept per frame
    #[arg(long, default_value_t = 300)]
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,

    /// Square model input size
    #[arg(long, default_value_t = 640)]
    #[serde(default = "default_input_size")]
    pub input_size: u32,

    /// JPEG quality of streamed frames (1-100)
    #[arg(long, default_value_t = 85)]
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Frame rate limit per stream (0.0 = disabled)
    #[arg(long, default_value_t = 0.0)]
    #[serde(default = "default_max_stream_fps")]
    pub max_stream_fps: f64,

    /// Upload size limit in MiB
    #[arg(long, default_value_t = 512)]
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,

    /// Inference threads
    #[arg(long, default_value_t = default_intra_threads())]
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,

    /// Configuration file path
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_on_port: default_port(),
            bind_address: default_bind_address(),
            workspace: default_workspace(),
            model_path: default_model_path(),
            class_path: default_class_path(),
            webcam: default_webcam(),
            video_confidence: default_video_confidence(),
            image_confidence: default_image_confidence(),
            iou_threshold: default_iou_threshold(),
            max_detections: default_max_detections(),
            input_size: default_input_size(),
            jpeg_quality: default_jpeg_quality(),
            max_stream_fps: default_max_stream_fps(),
            max_upload_mb: default_max_upload_mb(),
            intra_threads: default_intra_threads(),
            config: None,
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> Result<Self> {
        let mut config = Config::parse();

        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence
    fn merge_with_file(mut self, file_config: Config) -> Self {
        // If CLI value is default, use file value
        if self.listen_on_port == default_port() {
            self.listen_on_port = file_config.listen_on_port;
        }
        if self.bind_address == default_bind_address() {
            self.bind_address = file_config.bind_address;
        }
        if self.workspace == default_workspace() {
            self.workspace = file_config.workspace;
        }
        if self.model_path == default_model_path() {
            self.model_path = file_config.model_path;
        }
        if self.class_path == default_class_path() {
            self.class_path = file_config.class_path;
        }
        if self.webcam == default_webcam() {
            self.webcam = file_config.webcam;
        }
        if self.video_confidence == default_video_confidence() {
            self.video_confidence = file_config.video_confidence;
        }
        if self.image_confidence == default_image_confidence() {
            self.image_confidence = file_config.image_confidence;
        }
        if self.iou_threshold == default_iou_threshold() {
            self.iou_threshold = file_config.iou_threshold;
        }
        if self.max_detections == default_max_detections() {
            self.max_detections = file_config.max_detections;
        }
        if self.input_size == default_input_size() {
            self.input_size = file_config.input_size;
        }
        if self.jpeg_quality == default_jpeg_quality() {
            self.jpeg_quality = file_config.jpeg_quality;
        }
        if self.max_stream_fps == default_max_stream_fps() {
            self.max_stream_fps = file_config.max_stream_fps;
        }
        if self.max_upload_mb == default_max_upload_mb() {
            self.max_upload_mb = file_config.max_upload_mb;
        }
        if self.intra_threads == default_intra_threads() {
            self.intra_threads = file_config.intra_threads;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("video_confidence", self.video_confidence),
            ("image_confidence", self.image_confidence),
            ("iou_threshold", self.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{name} must be within [0, 1], got {value}");
            }
        }

        if !(1..=100).contains(&self.jpeg_quality) {
            bail!("jpeg_quality must be within 1-100, got {}", self.jpeg_quality);
        }
        if self.input_size == 0 || self.input_size % 32 != 0 {
            bail!(
                "input_size must be a positive multiple of 32, got {}",
                self.input_size
            );
        }
        if !(self.max_stream_fps >= 0.0) {
            bail!("max_stream_fps cannot be negative");
        }
        if self.max_upload_mb == 0 {
            bail!("max_upload_mb must be at least 1");
        }
        if self.max_detections == 0 {
            bail!("max_detections must be at least 1");
        }
        if self.intra_threads == 0 {
            bail!("intra_threads must be at least 1");
        }
        if self.workspace.is_empty() {
            bail!("workspace cannot be empty");
        }

        Ok(())
    }

    pub fn workspace_path(&self) -> PathBuf {
        PathBuf::from(&self.workspace)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

// Default value functions
fn default_port() -> u16 {
    5000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_workspace() -> String {
    "yolo_assets".to_string()
}

fn default_model_path() -> String {
    "yolo_assets/Models/yolov8s.onnx".to_string()
}

fn default_class_path() -> String {
    "yolo_assets/Classes/classes.txt".to_string()
}

fn default_webcam() -> String {
    "0".to_string()
}

fn default_video_confidence() -> f32 {
    0.1
}

fn default_image_confidence() -> f32 {
    0.5
}

fn default_iou_threshold() -> f32 {
    0.7
}

fn default_max_detections() -> usize {
    300
}

fn default_input_size() -> u32 {
    640
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_max_stream_fps() -> f64 {
    0.0
}

fn default_max_upload_mb() -> usize {
    512
}

fn default_intra_threads() -> usize {
    num_cpus::get().clamp(1, 16)
}
