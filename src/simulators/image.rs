//! Test image generation for the simulated camera.

use std::f64::consts::TAU;

use rand::Rng;

use crate::camera::{Frame, PixelBuffer};
use crate::error::DeviceResult;
use crate::setting::SettingEnum;

/// Image generation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImagePattern {
    /// Uniform random values between dark and light.
    #[default]
    Noise,
    /// One gradient from the top left to the bottom right corner.
    Gradient,
    /// Sawtooth gradient that rotates a little on every frame.
    Sawtooth,
    /// A single gaussian spot at a random position.
    OneGaussian,
    /// All zeros.
    Black,
    /// Maximum value of the pixel type.
    White,
}

const PATTERNS: [(ImagePattern, &str); 6] = [
    (ImagePattern::Noise, "noise"),
    (ImagePattern::Gradient, "gradient"),
    (ImagePattern::Sawtooth, "sawtooth"),
    (ImagePattern::OneGaussian, "one_gaussian"),
    (ImagePattern::Black, "black"),
    (ImagePattern::White, "white"),
];

impl SettingEnum for ImagePattern {
    fn choices() -> Vec<(i64, String)> {
        PATTERNS
            .iter()
            .enumerate()
            .map(|(i, (_, label))| (i as i64, (*label).to_string()))
            .collect()
    }

    fn index(self) -> i64 {
        PATTERNS
            .iter()
            .position(|(p, _)| *p == self)
            .map_or(0, |i| i as i64)
    }

    fn from_index(index: i64) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| PATTERNS.get(i))
            .map(|(p, _)| *p)
    }
}

/// Pixel type of generated frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelType {
    /// 8 bit unsigned.
    #[default]
    U8,
    /// 16 bit unsigned.
    U16,
    /// 64 bit float.
    Float,
}

impl PixelType {
    fn max(self) -> f64 {
        match self {
            PixelType::U8 => f64::from(u8::MAX),
            PixelType::U16 => f64::from(u16::MAX),
            PixelType::Float => 1.0,
        }
    }

    fn label(self) -> &'static str {
        match self {
            PixelType::U8 => "uint8",
            PixelType::U16 => "uint16",
            PixelType::Float => "float",
        }
    }
}

const PIXEL_TYPES: [PixelType; 3] = [PixelType::U8, PixelType::U16, PixelType::Float];

impl SettingEnum for PixelType {
    fn choices() -> Vec<(i64, String)> {
        PIXEL_TYPES
            .iter()
            .enumerate()
            .map(|(i, t)| (i as i64, t.label().to_string()))
            .collect()
    }

    fn index(self) -> i64 {
        PIXEL_TYPES
            .iter()
            .position(|t| *t == self)
            .map_or(0, |i| i as i64)
    }

    fn from_index(index: i64) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| PIXEL_TYPES.get(i))
            .copied()
    }
}

/// Side of one bit of the frame counter stamp, in pixels.
const STAMP_CELL: usize = 2;
/// Number of bits in the frame counter stamp.
const STAMP_BITS: usize = 16;

/// Generates frames with the selected pattern and pixel type.
#[derive(Debug, Clone)]
pub struct ImageGenerator {
    /// Selected pattern
    pub pattern: ImagePattern,
    /// Selected pixel type
    pub pixel_type: PixelType,
    /// Stamp the frame number into the top left corner.
    pub numbering: bool,
    theta: f64,
}

impl Default for ImageGenerator {
    fn default() -> Self {
        Self {
            pattern: ImagePattern::default(),
            pixel_type: PixelType::default(),
            numbering: true,
            theta: 0.0,
        }
    }
}

impl ImageGenerator {
    /// Generate one `width` x `height` frame with values between `dark` and
    /// `light`.
    pub fn image(
        &mut self,
        width: usize,
        height: usize,
        dark: f64,
        light: f64,
        index: Option<u64>,
    ) -> DeviceResult<Frame> {
        let mut values = self.values(width, height, dark, light);
        if self.numbering {
            if let Some(index) = index {
                stamp(&mut values, width, height, index, light);
            }
        }
        Frame::new(width, height, self.convert(values))
    }

    fn values(&mut self, w: usize, h: usize, dark: f64, light: f64) -> Vec<f64> {
        let mut rng = rand::thread_rng();
        match self.pattern {
            ImagePattern::Black => vec![0.0; w * h],
            ImagePattern::White => vec![self.pixel_type.max(); w * h],
            ImagePattern::Noise => (0..w * h)
                .map(|_| rng.gen_range(dark..=light.max(dark)).floor())
                .collect(),
            ImagePattern::Gradient => {
                let span = ((w + h).saturating_sub(2)).max(1) as f64;
                grid(w, h, |x, y| dark + light * (x + y) / span)
            }
            ImagePattern::OneGaussian => {
                let sigma = 0.01 * w.max(h) as f64;
                let x0 = rng.gen_range(0..w.max(1)) as f64;
                let y0 = rng.gen_range(0..h.max(1)) as f64;
                grid(w, h, |x, y| {
                    let r2 = (x - x0).powi(2) + (y - y0).powi(2);
                    dark + light * (-r2 / (2.0 * sigma * sigma)).exp()
                })
            }
            ImagePattern::Sawtooth => {
                let theta = self.theta;
                self.theta = (self.theta + 0.01 * TAU) % TAU;
                let wrap = (0.1 * w.max(h).saturating_sub(1) as f64).max(1.0);
                grid(w, h, |x, y| {
                    dark + light * (theta.sin() * x + theta.cos() * y).rem_euclid(wrap) / wrap
                })
            }
        }
    }

    fn convert(&self, values: Vec<f64>) -> PixelBuffer {
        match self.pixel_type {
            PixelType::U8 => PixelBuffer::U8(
                values
                    .into_iter()
                    .map(|v| v.clamp(0.0, f64::from(u8::MAX)) as u8)
                    .collect(),
            ),
            PixelType::U16 => PixelBuffer::U16(
                values
                    .into_iter()
                    .map(|v| v.clamp(0.0, f64::from(u16::MAX)) as u16)
                    .collect(),
            ),
            PixelType::Float => PixelBuffer::F64(values),
        }
    }
}

/// Evaluate `f(x, y)` over a row-major grid.
fn grid<F>(w: usize, h: usize, f: F) -> Vec<f64>
where
    F: Fn(f64, f64) -> f64,
{
    (0..h)
        .flat_map(|y| (0..w).map(move |x| (x as f64, y as f64)))
        .map(|(x, y)| f(x, y))
        .collect()
}

/// Write `index` as a row of binary cells, most significant bit first.
fn stamp(values: &mut [f64], width: usize, height: usize, index: u64, light: f64) {
    for bit in 0..STAMP_BITS {
        let on = (index >> (STAMP_BITS - 1 - bit)) & 1 == 1;
        let value = if on { light } else { 0.0 };
        for dy in 0..STAMP_CELL.min(height) {
            for dx in 0..STAMP_CELL {
                let x = bit * STAMP_CELL + dx;
                if x < width {
                    values[dy * width + x] = value;
                }
            }
        }
    }
}

/// Read back a counter written by the numbering stamp. Assumes the stamp was
/// written with a non-zero light level.
pub fn read_stamp(frame: &Frame) -> Option<u64> {
    if frame.width() < STAMP_BITS * STAMP_CELL || frame.height() == 0 {
        return None;
    }
    let mut index = 0u64;
    for bit in 0..STAMP_BITS {
        let value = frame.get(0, bit * STAMP_CELL)?;
        index = (index << 1) | u64::from(value > 0.0);
    }
    Some(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_choices_are_stable() {
        let labels: Vec<String> = ImagePattern::choices().into_iter().map(|(_, l)| l).collect();
        assert_eq!(
            labels,
            ["noise", "gradient", "sawtooth", "one_gaussian", "black", "white"]
        );
        for (i, _) in ImagePattern::choices() {
            assert_eq!(ImagePattern::from_index(i).unwrap().index(), i);
        }
        assert!(ImagePattern::from_index(6).is_none());
    }

    #[test]
    fn test_white_uses_type_maximum() {
        let mut generator = ImageGenerator {
            pattern: ImagePattern::White,
            pixel_type: PixelType::U16,
            numbering: false,
            ..ImageGenerator::default()
        };
        let frame = generator.image(4, 3, 0.0, 255.0, None).unwrap();
        assert_eq!(frame.shape(), (4, 3));
        assert_eq!(frame.get(2, 3), Some(65535.0));
        assert_eq!(frame.pixels().type_name(), "uint16");
    }

    #[test]
    fn test_gradient_spans_dark_to_light() {
        let mut generator = ImageGenerator {
            pattern: ImagePattern::Gradient,
            pixel_type: PixelType::Float,
            numbering: false,
            ..ImageGenerator::default()
        };
        let frame = generator.image(5, 5, 10.0, 100.0, None).unwrap();
        assert_eq!(frame.get(0, 0), Some(10.0));
        assert_eq!(frame.get(4, 4), Some(110.0));
    }

    #[test]
    fn test_stamp_round_trip() {
        let mut generator = ImageGenerator {
            pattern: ImagePattern::Black,
            ..ImageGenerator::default()
        };
        let frame = generator.image(64, 8, 0.0, 200.0, Some(41)).unwrap();
        assert_eq!(read_stamp(&frame), Some(41));
    }

    #[test]
    fn test_noise_stays_in_range() {
        let mut generator = ImageGenerator {
            numbering: false,
            ..ImageGenerator::default()
        };
        let frame = generator.image(16, 16, 5.0, 20.0, None).unwrap();
        let values = frame.pixels().as_f64();
        assert!(values.iter().all(|v| (5.0..=20.0).contains(v)));
    }
}
