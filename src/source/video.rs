use super::{DEFAULT_FRAME_RATE, SourceError};
use anyhow::{Context, anyhow};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::context::Context as Scaler;
use ffmpeg_next::software::scaling::flag::Flags;
use ffmpeg_next::{Packet, Rational, codec, format, frame, media};
use image::RgbImage;
use tracing::{debug, trace, warn};

// Helper function: checks if a Rational is valid (numerator and denominator are both > 0)
fn is_rational_valid(r: Rational) -> bool {
    r.numerator() > 0 && r.denominator() > 0
}

/// Frame rate of the input stream: `avg_frame_rate`, then `r_frame_rate`, then the default.
fn valid_frame_rate(stream: &ffmpeg_next::Stream) -> f64 {
    let avg_fps = stream.avg_frame_rate();
    if is_rational_valid(avg_fps) {
        return f64::from(avg_fps);
    }

    let r_fps = stream.rate();
    if is_rational_valid(r_fps) {
        debug!(
            "avg_frame_rate {}/{} invalid, using r_frame_rate {}/{}",
            avg_fps.numerator(),
            avg_fps.denominator(),
            r_fps.numerator(),
            r_fps.denominator()
        );
        return f64::from(r_fps);
    }

    warn!("Unable to determine stream frame rate, assuming {DEFAULT_FRAME_RATE}");
    DEFAULT_FRAME_RATE
}

/// Demuxes and decodes the best video stream of a file or capture device into RGB frames.
pub struct VideoReader {
    location: String,
    input: format::context::Input,
    decoder: codec::decoder::Video,
    stream_index: usize,
    scaler: Option<(Scaler, Pixel, u32, u32)>,
    frame_rate: f64,
    eof_sent: bool,
    frames_decoded: u64,
}

impl VideoReader {
    pub fn open(location: &str) -> Result<Self, SourceError> {
        let input = format::input(location).map_err(|e| SourceError::Open {
            location: location.to_string(),
            reason: e.to_string(),
        })?;

        let stream = input
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| SourceError::NoVideoStream {
                location: location.to_string(),
            })?;
        let stream_index = stream.index();
        let frame_rate = valid_frame_rate(&stream);

        let decoder = codec::context::Context::from_parameters(stream.parameters())
            .and_then(|context| context.decoder().video())
            .map_err(|e| SourceError::Open {
                location: location.to_string(),
                reason: format!("Video Decoder: {e}"),
            })?;

        debug!(
            %location,
            stream_index,
            codec = ?decoder.id(),
            format = ?decoder.format(),
            "Video decoder opened"
        );

        Ok(Self {
            location: location.to_string(),
            input,
            decoder,
            stream_index,
            scaler: None,
            frame_rate,
            eof_sent: false,
            frames_decoded: 0,
        })
    }

    pub fn width(&self) -> u32 {
        self.decoder.width()
    }

    pub fn height(&self) -> u32 {
        self.decoder.height()
    }

    pub fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    /// Next frame in decode order; drains the decoder at end of input.
    pub fn next_frame(&mut self) -> anyhow::Result<Option<RgbImage>> {
        let mut decoded = frame::Video::empty();
        loop {
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    self.frames_decoded += 1;
                    trace!(location = %self.location, frame = self.frames_decoded, "Frame decoded");
                    return self.to_rgb(&decoded).map(Some);
                }
                Err(ffmpeg_next::Error::Eof) => {
                    debug!(location = %self.location, frames = self.frames_decoded, "Video decoder fully flushed (EOF received).");
                    return Ok(None);
                }
                Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {}
                Err(e) => {
                    return Err(anyhow!("Video Decoder: Error receiving frame: {e}"));
                }
            }

            if self.eof_sent {
                return Ok(None);
            }
            self.feed_decoder()?;
        }
    }

    /// Sends the next packet of our stream to the decoder, or EOF when the input ends.
    fn feed_decoder(&mut self) -> anyhow::Result<()> {
        let mut packet = Packet::empty();
        loop {
            match packet.read(&mut self.input) {
                Ok(()) if packet.stream() == self.stream_index => {
                    return self
                        .decoder
                        .send_packet(&packet)
                        .context("Video Decoder: Failed to send packet");
                }
                Ok(()) => continue,
                Err(ffmpeg_next::Error::Eof) => {
                    debug!(location = %self.location, "Sending EOF to video decoder...");
                    self.decoder
                        .send_eof()
                        .context("Video Decoder: Failed to send EOF")?;
                    self.eof_sent = true;
                    return Ok(());
                }
                Err(e) => {
                    return Err(anyhow!("Input: Error reading packet: {e}"));
                }
            }
        }
    }

    fn to_rgb(&mut self, decoded: &frame::Video) -> anyhow::Result<RgbImage> {
        let (format, width, height) = (decoded.format(), decoded.width(), decoded.height());
        if width == 0 || height == 0 {
            return Err(anyhow!("Video Decoder: Received an empty frame"));
        }

        // Cameras may renegotiate size or format mid-stream.
        let stale = !matches!(&self.scaler, Some((_, f, w, h)) if *f == format && *w == width && *h == height);
        if stale {
            let scaler = Scaler::get(
                format,
                width,
                height,
                Pixel::RGB24,
                width,
                height,
                Flags::BILINEAR,
            )
            .map_err(|e| anyhow!("Video Scaler: Failed to create: {e}"))?;
            self.scaler = Some((scaler, format, width, height));
        }

        let mut rgb = frame::Video::empty();
        if let Some((scaler, ..)) = self.scaler.as_mut() {
            scaler
                .run(decoded, &mut rgb)
                .map_err(|e| anyhow!("Video Scaler: Error converting frame: {e}"))?;
        }

        frame_to_image(&rgb)
    }
}

/// Copies a packed RGB24 frame into an image, dropping row padding.
fn frame_to_image(rgb: &frame::Video) -> anyhow::Result<RgbImage> {
    let (width, height) = (rgb.width(), rgb.height());
    let stride = rgb.stride(0);
    let row_bytes = width as usize * 3;
    let data = rgb.data(0);

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        let row = data
            .get(start..start + row_bytes)
            .ok_or_else(|| anyhow!("Video Scaler: Frame buffer shorter than expected"))?;
        pixels.extend_from_slice(row);
    }

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| anyhow!("Failed to convert frame into image buffer"))
}
