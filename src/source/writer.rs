use anyhow::{Context, anyhow, bail};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::format::context::Output as OutputContext;
use ffmpeg_next::software::scaling::context::Context as Scaler;
use ffmpeg_next::software::scaling::flag::Flags;
use ffmpeg_next::{Dictionary, Packet, Rational, codec, format, frame};
use image::RgbImage;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

/// MJPEG video file writer. The container is picked from the file extension (`.avi`).
pub struct VideoWriter {
    path: PathBuf,
    octx: OutputContext,
    encoder: codec::encoder::video::Encoder,
    scaler: Scaler,
    stream_index: usize,
    encoder_time_base: Rational,
    width: u32,
    height: u32,
    next_pts: i64,
}

impl VideoWriter {
    pub fn create(path: &Path, width: u32, height: u32, fps: i32) -> anyhow::Result<Self> {
        if width == 0 || height == 0 || fps <= 0 {
            bail!("Invalid output video parameters: {width}x{height} @ {fps} fps");
        }

        let mut octx = format::output(path)
            .map_err(|e| anyhow!("Output: Failed to create {}: {e}", path.display()))?;
        let global_header = octx
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);

        let mjpeg_codec = codec::encoder::find(codec::Id::MJPEG)
            .ok_or_else(|| anyhow!("MJPEG Encoder: Codec not found"))?;
        let mut enc_config = codec::Context::new_with_codec(mjpeg_codec)
            .encoder()
            .video()
            .map_err(|e| anyhow!("MJPEG Encoder: Failed to create config: {e}"))?;

        let time_base = Rational::new(1, fps);
        enc_config.set_width(width);
        enc_config.set_height(height);
        enc_config.set_format(Pixel::YUVJ420P);
        enc_config.set_time_base(time_base);
        enc_config.set_frame_rate(Some(Rational::new(fps, 1)));
        if global_header {
            enc_config.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let encoder = enc_config
            .open_with(Dictionary::new())
            .map_err(|e| anyhow!("MJPEG Encoder: Failed to open: {e}"))?;

        let stream_index = {
            let mut ost = octx.add_stream(mjpeg_codec)?;
            ost.set_parameters(&encoder);
            ost.set_time_base(time_base);
            ost.index()
        };

        octx.write_header()
            .map_err(|e| anyhow!("Output: Failed to write header: {e}"))?;

        let scaler = Scaler::get(
            Pixel::RGB24,
            width,
            height,
            Pixel::YUVJ420P,
            width,
            height,
            Flags::BILINEAR,
        )
        .map_err(|e| anyhow!("Video Scaler: Failed to create: {e}"))?;

        info!(path = %path.display(), width, height, fps, "Output video opened");
        Ok(Self {
            path: path.to_path_buf(),
            octx,
            encoder,
            scaler,
            stream_index,
            encoder_time_base: time_base,
            width,
            height,
            next_pts: 0,
        })
    }

    pub fn write(&mut self, image: &RgbImage) -> anyhow::Result<()> {
        if image.dimensions() != (self.width, self.height) {
            bail!(
                "Frame size {}x{} does not match output {}x{}",
                image.width(),
                image.height(),
                self.width,
                self.height
            );
        }

        let mut rgb = frame::Video::new(Pixel::RGB24, self.width, self.height);
        let stride = rgb.stride(0);
        let row_bytes = self.width as usize * 3;
        let data = rgb.data_mut(0);
        for (y, row) in image.as_raw().chunks_exact(row_bytes).enumerate() {
            data[y * stride..y * stride + row_bytes].copy_from_slice(row);
        }

        let mut yuv = frame::Video::empty();
        self.scaler
            .run(&rgb, &mut yuv)
            .map_err(|e| anyhow!("Video Scaler: Error converting frame: {e}"))?;
        yuv.set_pts(Some(self.next_pts));
        self.next_pts += 1;

        self.encoder
            .send_frame(&yuv)
            .context("MJPEG Encoder: Failed to send frame")?;
        self.drain_packets()
    }

    fn drain_packets(&mut self) -> anyhow::Result<()> {
        let target_time_base = self
            .octx
            .stream(self.stream_index)
            .ok_or_else(|| anyhow!("Failed to get output stream for index {}", self.stream_index))?
            .time_base();

        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, target_time_base);
            trace!(pts = ?packet.pts(), "Writing video packet");
            packet
                .write_interleaved(&mut self.octx)
                .map_err(|e| anyhow!("Output: Error writing interleaved video packet: {e}"))?;
        }
        Ok(())
    }

    /// Flushes the encoder and writes the container trailer.
    pub fn finish(mut self) -> anyhow::Result<PathBuf> {
        debug!(path = %self.path.display(), "Sending EOF to video encoder...");
        self.encoder
            .send_eof()
            .context("MJPEG Encoder: Failed to send EOF")?;
        self.drain_packets()?;
        self.octx
            .write_trailer()
            .map_err(|e| anyhow!("Output: Failed to write trailer: {e}"))?;
        info!(path = %self.path.display(), frames = self.next_pts, "Output video finished");
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FrameSource, MediaSource};
    use image::Rgb;

    #[test]
    fn rejects_invalid_parameters() {
        ffmpeg_next::init().unwrap();
        let dir = tempfile::tempdir().unwrap();
        assert!(VideoWriter::create(&dir.path().join("a.avi"), 0, 10, 10).is_err());
        assert!(VideoWriter::create(&dir.path().join("b.avi"), 10, 10, 0).is_err());
    }

    #[test]
    fn written_video_decodes_back_in_order() {
        ffmpeg_next::init().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.avi");

        let mut writer = VideoWriter::create(&path, 64, 48, 10).unwrap();
        for shade in [0u8, 120, 240] {
            writer
                .write(&RgbImage::from_pixel(64, 48, Rgb([shade, shade, shade])))
                .unwrap();
        }
        assert!(writer.write(&RgbImage::new(32, 32)).is_err());
        writer.finish().unwrap();

        let mut source = FrameSource::open(&MediaSource::from_path(&path)).unwrap();
        let mut shades = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            assert_eq!(frame.dimensions(), (64, 48));
            shades.push(frame.get_pixel(32, 24)[0]);
        }
        assert_eq!(shades.len(), 3);
        assert!(shades.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
