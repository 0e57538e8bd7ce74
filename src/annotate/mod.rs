pub mod font;

use crate::classes::ClassTable;
use crate::detection::Detection;
use anyhow::anyhow;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

pub const BOX_THICKNESS: i32 = 3;
pub const LABEL_SCALE: u32 = 2;
pub const LABEL_PADDING: u32 = 3;
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// Label shown above a box, e.g. `person (88%)`. The percentage is rounded up.
pub fn label_text(name: &str, confidence: f32) -> String {
    // Round to hundredths of a percent first so 0.87 does not become 88.
    let percent = ((confidence * 10_000.0).round() / 100.0).ceil().max(0.0) as u32;
    format!("{name} ({percent}%)")
}

/// Draws every detection onto `image`: a class-colored box, a filled label
/// background in the same color and white label text.
pub fn draw_detections(image: &mut RgbImage, detections: &[Detection], classes: &ClassTable) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }

    for detection in detections {
        let bbox = detection
            .bbox
            .clamp((width - 1) as f32, (height - 1) as f32);
        let (x1, y1, x2, y2) = (bbox.x1 as i32, bbox.y1 as i32, bbox.x2 as i32, bbox.y2 as i32);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        let color = classes.color(detection.class_id);
        draw_box(image, (x1, y1, x2, y2), color);

        let label = label_text(&classes.name(detection.class_id), detection.confidence);
        draw_label(image, x1, y1, &label, color);
    }
}

fn draw_box(image: &mut RgbImage, (x1, y1, x2, y2): (i32, i32, i32, i32), color: Rgb<u8>) {
    for inset in 0..BOX_THICKNESS {
        let w = x2 - x1 + 1 - 2 * inset;
        let h = y2 - y1 + 1 - 2 * inset;
        if w <= 0 || h <= 0 {
            break;
        }
        let rect = Rect::at(x1 + inset, y1 + inset).of_size(w as u32, h as u32);
        draw_hollow_rect_mut(image, rect, color);
    }
}

fn draw_label(image: &mut RgbImage, x: i32, box_top: i32, label: &str, color: Rgb<u8>) {
    let (text_w, text_h) = font::text_size(label, LABEL_SCALE);
    let bg_w = text_w + 2 * LABEL_PADDING;
    let bg_h = text_h + 2 * LABEL_PADDING;

    // Sits on the box's top edge; moves inside the box when there is no room above.
    let top = if box_top - bg_h as i32 >= 0 {
        box_top - bg_h as i32
    } else {
        box_top
    };

    draw_filled_rect_mut(image, Rect::at(x, top).of_size(bg_w, bg_h), color);
    font::draw_text(
        image,
        x + LABEL_PADDING as i32,
        top + LABEL_PADDING as i32,
        label,
        LABEL_SCALE,
        LABEL_TEXT_COLOR,
    );
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> anyhow::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity((image.width() * image.height()) as usize / 4);
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}
