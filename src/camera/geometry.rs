//! Camera geometry: orientation transforms, binning and regions of interest.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, DeviceResult};
use crate::setting::{FromSettingValue, SettingEnum, SettingValue};

/// Orientation change applied to every frame.
///
/// The rotation is a single 90° counter-clockwise turn applied before the
/// flips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transform {
    /// Mirror columns.
    pub fliplr: bool,
    /// Mirror rows.
    pub flipud: bool,
    /// Rotate by 90°.
    pub rot90: bool,
}

impl Transform {
    /// No change.
    pub const IDENTITY: Transform = Transform::new(false, false, false);

    /// Transform from its three flags.
    pub const fn new(fliplr: bool, flipud: bool, rot90: bool) -> Self {
        Self {
            fliplr,
            flipud,
            rot90,
        }
    }

    /// All eight transforms ordered by index.
    pub fn all() -> impl Iterator<Item = Transform> {
        (0..8).map(Transform::from_bits)
    }

    fn from_bits(bits: u8) -> Self {
        Self::new(bits & 4 != 0, bits & 2 != 0, bits & 1 != 0)
    }

    fn bits(self) -> u8 {
        (self.fliplr as u8) << 2 | (self.flipud as u8) << 1 | self.rot90 as u8
    }

    /// Combine a fixed readout transform with a client transform.
    ///
    /// Each flag is XORed. When both sides rotate, the two 90° turns make a
    /// 180° turn, which is the same as flipping both axes, so the flips are
    /// inverted.
    pub fn combine(readout: Transform, client: Transform) -> Transform {
        let mut combined = Transform::from_bits(readout.bits() ^ client.bits());
        if readout.rot90 && client.rot90 {
            combined.fliplr = !combined.fliplr;
            combined.flipud = !combined.flipud;
        }
        combined
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.fliplr, self.flipud, self.rot90)
    }
}

impl SettingEnum for Transform {
    fn choices() -> Vec<(i64, String)> {
        Transform::all().map(|t| (t.index(), t.to_string())).collect()
    }

    fn index(self) -> i64 {
        i64::from(self.bits())
    }

    fn from_index(index: i64) -> Option<Self> {
        u8::try_from(index)
            .ok()
            .filter(|bits| *bits < 8)
            .map(Transform::from_bits)
    }
}

/// Pixel binning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binning {
    /// Horizontal factor.
    pub h: u32,
    /// Vertical factor.
    pub v: u32,
}

impl Binning {
    /// Binning with the given factors.
    pub const fn new(h: u32, v: u32) -> Self {
        Self { h, v }
    }

    /// Horizontal and vertical swapped.
    pub fn transposed(self) -> Self {
        Self::new(self.v, self.h)
    }
}

impl Default for Binning {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

/// Rectangular region of the sensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Roi {
    /// Column offset.
    pub left: u32,
    /// Row offset.
    pub top: u32,
    /// Width in pixels; `0` means the rest of the sensor.
    pub width: u32,
    /// Height in pixels; `0` means the rest of the sensor.
    pub height: u32,
}

impl Roi {
    /// Region from offset and size.
    pub const fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Rows and columns swapped.
    pub fn transposed(self) -> Self {
        Self::new(self.top, self.left, self.height, self.width)
    }
}

impl From<Roi> for SettingValue {
    fn from(roi: Roi) -> Self {
        SettingValue::Tuple(vec![
            roi.left.into(),
            roi.top.into(),
            roi.width.into(),
            roi.height.into(),
        ])
    }
}

impl From<Binning> for SettingValue {
    fn from(binning: Binning) -> Self {
        SettingValue::Tuple(vec![binning.h.into(), binning.v.into()])
    }
}

fn tuple_of<const N: usize>(setting: &str, value: SettingValue) -> DeviceResult<[u32; N]> {
    let invalid = |reason: String| DeviceError::InvalidValue {
        name: setting.to_string(),
        reason,
    };
    let items = value
        .as_tuple()
        .ok_or_else(|| invalid(format!("expected a tuple of {N}, got {value}")))?;
    if items.len() != N {
        return Err(invalid(format!("expected {N} elements, got {}", items.len())));
    }
    let mut out = [0u32; N];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = u32::from_setting_value(setting, item.clone())?;
    }
    Ok(out)
}

impl FromSettingValue for Roi {
    fn from_setting_value(setting: &str, value: SettingValue) -> DeviceResult<Self> {
        let [left, top, width, height] = tuple_of::<4>(setting, value)?;
        Ok(Roi::new(left, top, width, height))
    }
}

impl FromSettingValue for Binning {
    fn from_setting_value(setting: &str, value: SettingValue) -> DeviceResult<Self> {
        let [h, v] = tuple_of::<2>(setting, value)?;
        Ok(Binning::new(h, v))
    }
}
