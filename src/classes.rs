use anyhow::Context;
use image::Rgb;
use std::path::Path;
use tracing::{debug, warn};

const PALETTE_HUE_OFFSET: f64 = 0.01;
const PALETTE_LIGHTNESS: f64 = 0.6;
const PALETTE_SATURATION: f64 = 0.65;
const FALLBACK_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// Reads class names from a text file, one name per line.
///
/// The line index is the class id, so interior blank lines are kept in place.
/// Trailing blank lines are dropped.
pub fn load_class_names(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read class names from {}", path.display()))?;

    let mut names: Vec<String> = content.lines().map(|line| line.trim().to_string()).collect();
    while names.last().is_some_and(|name| name.is_empty()) {
        names.pop();
    }

    if names.is_empty() {
        warn!(path = %path.display(), "Class file contains no names");
    }
    debug!(path = %path.display(), count = names.len(), "Loaded class names");
    Ok(names)
}

/// Evenly spaced hues in HLS space, one color per class.
pub fn color_palette(n: usize) -> Vec<Rgb<u8>> {
    (0..n)
        .map(|i| {
            let hue = (i as f64 / n as f64 + PALETTE_HUE_OFFSET).fract();
            let (r, g, b) = hls_to_rgb(hue, PALETTE_LIGHTNESS, PALETTE_SATURATION);
            Rgb([to_channel(r), to_channel(g), to_channel(b)])
        })
        .collect()
}

fn to_channel(value: f64) -> u8 {
    (value * 255.0).clamp(0.0, 255.0) as u8
}

fn hls_to_rgb(h: f64, l: f64, s: f64) -> (f64, f64, f64) {
    if s == 0.0 {
        return (l, l, l);
    }
    let m2 = if l <= 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let m1 = 2.0 * l - m2;
    (
        hue_component(m1, m2, h + 1.0 / 3.0),
        hue_component(m1, m2, h),
        hue_component(m1, m2, h - 1.0 / 3.0),
    )
}

fn hue_component(m1: f64, m2: f64, hue: f64) -> f64 {
    let hue = hue.rem_euclid(1.0);
    if hue < 1.0 / 6.0 {
        m1 + (m2 - m1) * hue * 6.0
    } else if hue < 0.5 {
        m2
    } else if hue < 2.0 / 3.0 {
        m1 + (m2 - m1) * (2.0 / 3.0 - hue) * 6.0
    } else {
        m1
    }
}

/// Class names paired with their drawing colors.
#[derive(Debug, Clone, Default)]
pub struct ClassTable {
    names: Vec<String>,
    colors: Vec<Rgb<u8>>,
}

impl ClassTable {
    pub fn new(names: Vec<String>) -> Self {
        let colors = color_palette(names.len());
        Self { names, colors }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::new(load_class_names(path)?))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, class_id: usize) -> String {
        match self.names.get(class_id) {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("class {class_id}"),
        }
    }

    pub fn color(&self, class_id: usize) -> Rgb<u8> {
        self.colors.get(class_id).copied().unwrap_or(FALLBACK_COLOR)
    }
}
