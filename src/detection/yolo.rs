//! YOLOv8-style detector on top of ONNX Runtime.
//!
//! Frames are letterboxed into a square input, run through the model, and the
//! raw `[1, 4 + nc, anchors]` output is decoded back into frame coordinates
//! before class-aware NMS.

use super::{BoundingBox, Detection, Detector, non_max_suppression};
use anyhow::{anyhow, bail};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Tensor;
use std::path::Path;
use tracing::{debug, info, trace};

const LETTERBOX_FILL: Rgb<u8> = Rgb([114, 114, 114]);
const BOX_CHANNELS: usize = 4;

#[derive(Debug, Clone)]
pub struct YoloParams {
    pub input_size: u32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    pub intra_threads: usize,
}

impl Default for YoloParams {
    fn default() -> Self {
        Self {
            input_size: 640,
            iou_threshold: 0.7,
            max_detections: 300,
            intra_threads: 4,
        }
    }
}

/// Aspect-preserving resize into a square canvas, plus its inverse for boxes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub size: u32,
    pub scale: f32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub pad_x: u32,
    pub pad_y: u32,
}

impl Letterbox {
    pub fn new(width: u32, height: u32, size: u32) -> Self {
        let scale = (size as f32 / width.max(1) as f32).min(size as f32 / height.max(1) as f32);
        let resized_width = ((width as f32 * scale).round() as u32).clamp(1, size);
        let resized_height = ((height as f32 * scale).round() as u32).clamp(1, size);
        Self {
            size,
            scale,
            resized_width,
            resized_height,
            pad_x: (size - resized_width) / 2,
            pad_y: (size - resized_height) / 2,
        }
    }

    pub fn apply(&self, image: &RgbImage) -> RgbImage {
        let resized = imageops::resize(
            image,
            self.resized_width,
            self.resized_height,
            FilterType::Triangle,
        );
        let mut canvas = RgbImage::from_pixel(self.size, self.size, LETTERBOX_FILL);
        imageops::replace(&mut canvas, &resized, self.pad_x as i64, self.pad_y as i64);
        canvas
    }

    /// Letterboxed frame as an NCHW tensor body, RGB, scaled to `0..=1`.
    pub fn to_tensor(&self, image: &RgbImage) -> Vec<f32> {
        let canvas = self.apply(image);
        let plane = (self.size * self.size) as usize;
        let mut data = vec![0.0f32; plane * 3];
        for (x, y, pixel) in canvas.enumerate_pixels() {
            let idx = (y * self.size + x) as usize;
            data[idx] = pixel[0] as f32 / 255.0;
            data[plane + idx] = pixel[1] as f32 / 255.0;
            data[2 * plane + idx] = pixel[2] as f32 / 255.0;
        }
        data
    }

    /// Maps a box from model input coordinates back to the source frame.
    pub fn to_source(&self, bbox: BoundingBox) -> BoundingBox {
        let pad_x = self.pad_x as f32;
        let pad_y = self.pad_y as f32;
        BoundingBox::new(
            (bbox.x1 - pad_x) / self.scale,
            (bbox.y1 - pad_y) / self.scale,
            (bbox.x2 - pad_x) / self.scale,
            (bbox.y2 - pad_y) / self.scale,
        )
    }
}

/// Decodes a raw YOLO output tensor into candidate detections.
///
/// Accepts `[1, 4 + nc, anchors]` (the YOLOv8 export layout) as well as the
/// transposed `[1, anchors, 4 + nc]`. The smaller of the two trailing dims is
/// taken as the channel axis. No NMS is applied here.
pub fn decode_predictions(
    output: &[f32],
    dims: &[i64],
    letterbox: &Letterbox,
    frame_width: u32,
    frame_height: u32,
    confidence: f32,
) -> anyhow::Result<Vec<Detection>> {
    let (rows, cols) = match dims {
        [1, rows, cols] | [rows, cols] => (*rows as usize, *cols as usize),
        _ => bail!("Unexpected detector output shape: {dims:?}"),
    };
    if rows * cols != output.len() {
        bail!(
            "Detector output holds {} values but shape {dims:?} needs {}",
            output.len(),
            rows * cols
        );
    }

    let channels_first = rows <= cols;
    let (channels, anchors) = if channels_first { (rows, cols) } else { (cols, rows) };
    if channels <= BOX_CHANNELS {
        bail!("Detector output needs at least 5 channels (box + classes), got {channels}");
    }

    let value = |anchor: usize, channel: usize| {
        if channels_first {
            output[channel * anchors + anchor]
        } else {
            output[anchor * channels + channel]
        }
    };

    let mut detections = Vec::new();
    for anchor in 0..anchors {
        let (class_id, score) = (BOX_CHANNELS..channels)
            .map(|channel| (channel - BOX_CHANNELS, value(anchor, channel)))
            .fold((0, f32::NEG_INFINITY), |best, current| {
                if current.1 > best.1 { current } else { best }
            });
        if !score.is_finite() || score < confidence {
            continue;
        }

        let model_box = BoundingBox::from_center(
            value(anchor, 0),
            value(anchor, 1),
            value(anchor, 2),
            value(anchor, 3),
        );
        let bbox = letterbox
            .to_source(model_box)
            .clamp(frame_width as f32, frame_height as f32);
        if bbox.area() <= 0.0 {
            continue;
        }

        detections.push(Detection {
            bbox,
            confidence: score,
            class_id,
        });
    }

    trace!(anchors, candidates = detections.len(), "Decoded detector output");
    Ok(detections)
}

pub struct YoloDetector {
    session: Session,
    input_name: String,
    output_name: String,
    params: YoloParams,
}

impl YoloDetector {
    pub fn load(model_path: &Path, params: YoloParams) -> anyhow::Result<Self> {
        info!(model = %model_path.display(), input_size = params.input_size, "Loading detection model");

        let builder = Session::builder()
            .map_err(|e| anyhow!("ONNX Runtime: Failed to create session builder: {e}"))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!("ONNX Runtime: Failed to set optimization level: {e}"))?
            .with_intra_threads(params.intra_threads)
            .map_err(|e| anyhow!("ONNX Runtime: Failed to set intra threads: {e}"))?;

        #[cfg(feature = "cuda")]
        let builder = builder
            .with_execution_providers([
                ort::execution_providers::CUDAExecutionProvider::default().build(),
            ])
            .map_err(|e| anyhow!("ONNX Runtime: Failed to register CUDA provider: {e}"))?;

        let session = builder.commit_from_file(model_path).map_err(|e| {
            anyhow!(
                "ONNX Runtime: Failed to load model {}: {e}",
                model_path.display()
            )
        })?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| anyhow!("Model {} declares no inputs", model_path.display()))?;
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| anyhow!("Model {} declares no outputs", model_path.display()))?;

        info!(%input_name, %output_name, "Detection model ready");
        Ok(Self {
            session,
            input_name,
            output_name,
            params,
        })
    }
}

impl Detector for YoloDetector {
    fn detect(&mut self, image: &RgbImage, confidence: f32) -> anyhow::Result<Vec<Detection>> {
        let size = self.params.input_size;
        let iou_threshold = self.params.iou_threshold;
        let max_detections = self.params.max_detections;

        let letterbox = Letterbox::new(image.width(), image.height(), size);
        let input = Tensor::from_array((
            [1usize, 3, size as usize, size as usize],
            letterbox.to_tensor(image),
        ))
        .map_err(|e| anyhow!("ONNX Runtime: Failed to build input tensor: {e}"))?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])
            .map_err(|e| anyhow!("ONNX Runtime: Inference failed: {e}"))?;
        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| anyhow!("ONNX Runtime: Failed to read output tensor: {e}"))?;
        let dims: Vec<i64> = shape.iter().copied().collect();

        let candidates = decode_predictions(
            data,
            &dims,
            &letterbox,
            image.width(),
            image.height(),
            confidence,
        )?;
        let detections = non_max_suppression(candidates, iou_threshold, max_detections);
        debug!(count = detections.len(), "Frame inference done");
        Ok(detections)
    }
}
