use super::FrameAnnotator;
use crate::annotate::encode_jpeg;
use crate::source::{FrameSource, MediaSource, VideoWriter};
use anyhow::{Context, bail};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Frame rate of annotated output videos, whatever the source rate.
pub const OFFLINE_FRAME_RATE: i32 = 10;

#[derive(Debug, Clone)]
pub struct OfflineJob {
    pub source: MediaSource,
    /// Output path without extension; `.avi` or `.jpg` is appended.
    pub outdir: PathBuf,
    pub confidence: f32,
    pub jpeg_quality: u8,
    /// Stop after this many frames. Needed for cameras, which never end.
    pub max_frames: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OfflineSummary {
    pub output: PathBuf,
    pub frames: u64,
    pub detections: u64,
}

/// `outdir` with `.avi` (videos, cameras) or `.jpg` (images) appended.
pub fn output_path(outdir: &Path, source: &MediaSource) -> PathBuf {
    let mut name = OsString::from(outdir.as_os_str());
    name.push(if source.is_image() { ".jpg" } else { ".avi" });
    PathBuf::from(name)
}

/// Annotates a whole source into a file. Blocking.
pub fn run_offline(job: &OfflineJob, annotator: &FrameAnnotator) -> anyhow::Result<OfflineSummary> {
    let output = output_path(&job.outdir, &job.source);
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory {}", parent.display()))?;
    }

    let started = Instant::now();
    let mut frames = FrameSource::open(&job.source)?;
    let summary = if job.source.is_image() {
        annotate_image(&mut frames, annotator, job, output)?
    } else {
        annotate_video(&mut frames, annotator, job, output)?
    };

    info!(
        source = %job.source,
        output = %summary.output.display(),
        frames = summary.frames,
        detections = summary.detections,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Offline detection finished"
    );
    Ok(summary)
}

fn annotate_image(
    frames: &mut FrameSource,
    annotator: &FrameAnnotator,
    job: &OfflineJob,
    output: PathBuf,
) -> anyhow::Result<OfflineSummary> {
    let Some(frame) = frames.next_frame()? else {
        bail!("{} produced no image", job.source);
    };
    let (annotated, detections) = annotator.annotate(frame, job.confidence)?;
    let jpeg = encode_jpeg(&annotated, job.jpeg_quality)?;
    std::fs::write(&output, jpeg)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    Ok(OfflineSummary {
        output,
        frames: 1,
        detections: detections as u64,
    })
}

fn annotate_video(
    frames: &mut FrameSource,
    annotator: &FrameAnnotator,
    job: &OfflineJob,
    output: PathBuf,
) -> anyhow::Result<OfflineSummary> {
    let mut writer: Option<VideoWriter> = None;
    let written = write_frames(frames, annotator, job, &output, &mut writer);
    let Some(open_writer) = writer else {
        written?;
        bail!("{} produced no frames", job.source);
    };

    let finished = match written {
        Ok(counts) => open_writer.finish().map(|path| (path, counts)),
        Err(err) => {
            drop(open_writer);
            Err(err)
        }
    };
    match finished {
        Ok((output, (frames, detections))) => Ok(OfflineSummary {
            output,
            frames,
            detections,
        }),
        Err(err) => {
            // A video without its trailer does not play back
            warn!(path = %output.display(), "Removing unfinished output video");
            let _ = std::fs::remove_file(&output);
            Err(err)
        }
    }
}

/// Annotates frames into `writer`, opening it on the first frame. Returns frame and detection counts.
fn write_frames(
    frames: &mut FrameSource,
    annotator: &FrameAnnotator,
    job: &OfflineJob,
    output: &Path,
    writer: &mut Option<VideoWriter>,
) -> anyhow::Result<(u64, u64)> {
    let mut frame_count = 0u64;
    let mut detection_count = 0u64;

    while job.max_frames.is_none_or(|max| frame_count < max) {
        let Some(frame) = frames.next_frame()? else {
            break;
        };
        let (annotated, detections) = annotator.annotate(frame, job.confidence)?;

        // Output size is only known once the first frame is decoded.
        if writer.is_none() {
            match VideoWriter::create(output, annotated.width(), annotated.height(), OFFLINE_FRAME_RATE) {
                Ok(created) => *writer = Some(created),
                Err(err) => {
                    let _ = std::fs::remove_file(output);
                    return Err(err);
                }
            }
        }
        if let Some(writer) = writer.as_mut() {
            writer.write(&annotated)?;
        }

        frame_count += 1;
        detection_count += detections as u64;
        debug!(frame_index = frame_count, detections, "Frame written");
    }

    Ok((frame_count, detection_count))
}
