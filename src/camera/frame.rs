//! Image frames produced by cameras.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, DeviceResult};

use super::geometry::Transform;

/// Pixel storage in the sensor's native format.
///
/// Sensors usually deliver 8 or 16 bit integers. Keeping them native avoids a
/// fourfold memory blow-up per frame compared to converting everything to `f64`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PixelBuffer {
    /// 8-bit unsigned pixels.
    U8(Vec<u8>),
    /// 16-bit unsigned pixels.
    U16(Vec<u16>),
    /// Floating point pixels, for computed images.
    F64(Vec<f64>),
}

impl PixelBuffer {
    /// Pixels as `f64`, borrowing when already floating point.
    pub fn as_f64(&self) -> Cow<'_, [f64]> {
        match self {
            PixelBuffer::U8(data) => Cow::Owned(data.iter().map(|&v| f64::from(v)).collect()),
            PixelBuffer::U16(data) => Cow::Owned(data.iter().map(|&v| f64::from(v)).collect()),
            PixelBuffer::F64(data) => Cow::Borrowed(data.as_slice()),
        }
    }

    /// Number of pixels.
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len(),
            PixelBuffer::F64(data) => data.len(),
        }
    }

    /// True when there are no pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the pixel data in bytes.
    pub fn memory_bytes(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len() * 2,
            PixelBuffer::F64(data) => data.len() * 8,
        }
    }

    /// Pixel `i` as `f64`.
    pub fn value(&self, i: usize) -> Option<f64> {
        match self {
            PixelBuffer::U8(data) => data.get(i).map(|&v| f64::from(v)),
            PixelBuffer::U16(data) => data.get(i).map(|&v| f64::from(v)),
            PixelBuffer::F64(data) => data.get(i).copied(),
        }
    }

    /// Name of the pixel type.
    pub fn type_name(&self) -> &'static str {
        match self {
            PixelBuffer::U8(_) => "uint8",
            PixelBuffer::U16(_) => "uint16",
            PixelBuffer::F64(_) => "float",
        }
    }

    fn reorder(&self, order: &[usize]) -> PixelBuffer {
        fn pick<T: Copy>(data: &[T], order: &[usize]) -> Vec<T> {
            order.iter().map(|&i| data[i]).collect()
        }
        match self {
            PixelBuffer::U8(data) => PixelBuffer::U8(pick(data, order)),
            PixelBuffer::U16(data) => PixelBuffer::U16(pick(data, order)),
            PixelBuffer::F64(data) => PixelBuffer::F64(pick(data, order)),
        }
    }
}

/// A row-major image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    width: usize,
    height: usize,
    pixels: PixelBuffer,
}

impl Frame {
    /// Frame of `width` columns and `height` rows.
    pub fn new(width: usize, height: usize, pixels: PixelBuffer) -> DeviceResult<Self> {
        if pixels.len() != width * height {
            return Err(DeviceError::InvalidValue {
                name: "frame".into(),
                reason: format!(
                    "{} pixels do not fill {width}x{height}",
                    pixels.len()
                ),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of rows.
    pub fn height(&self) -> usize {
        self.height
    }

    /// `(width, height)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Pixel storage.
    pub fn pixels(&self) -> &PixelBuffer {
        &self.pixels
    }

    /// Consume the frame, keeping the pixels.
    pub fn into_pixels(self) -> PixelBuffer {
        self.pixels
    }

    /// Pixel at `row`, `col`.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.height || col >= self.width {
            return None;
        }
        self.pixels.value(row * self.width + col)
    }

    /// Rotate by 90° counter-clockwise. Width and height swap.
    pub fn rot90(&self) -> Frame {
        let (w, h) = (self.width, self.height);
        let order: Vec<usize> = (0..w)
            .flat_map(|i| (0..h).map(move |j| j * w + (w - 1 - i)))
            .collect();
        Frame {
            width: h,
            height: w,
            pixels: self.pixels.reorder(&order),
        }
    }

    /// Reverse the order of rows.
    pub fn flipud(&self) -> Frame {
        let (w, h) = (self.width, self.height);
        let order: Vec<usize> = (0..h)
            .flat_map(|i| (0..w).map(move |j| (h - 1 - i) * w + j))
            .collect();
        self.with_order(&order)
    }

    /// Reverse the order of columns.
    pub fn fliplr(&self) -> Frame {
        let (w, h) = (self.width, self.height);
        let order: Vec<usize> = (0..h)
            .flat_map(|i| (0..w).map(move |j| i * w + (w - 1 - j)))
            .collect();
        self.with_order(&order)
    }

    fn with_order(&self, order: &[usize]) -> Frame {
        Frame {
            width: self.width,
            height: self.height,
            pixels: self.pixels.reorder(order),
        }
    }

    /// Apply `transform`: rotation first, then the flips.
    pub fn transformed(self, transform: Transform) -> Frame {
        let mut frame = if transform.rot90 { self.rot90() } else { self };
        match (transform.fliplr, transform.flipud) {
            (false, false) => {}
            (false, true) => frame = frame.flipud(),
            (true, false) => frame = frame.fliplr(),
            (true, true) => frame = frame.flipud().fliplr(),
        }
        frame
    }
}
