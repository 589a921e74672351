//! Per-frame nozzle intensity vectors
//!
//! A [`FrameVector`] holds one value per nozzle, indexed by nozzle number.
//! Pattern outputs are summed element-wise and clamped to `[-1.0, 1.0]`
//! before they reach the actuation driver.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::ops::{Index, IndexMut};

/// Number of physical nozzles driven by the installation
pub const NOZZLE_COUNT: usize = 36;

/// Fixed-length intensity vector, one entry per nozzle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameVector([f64; NOZZLE_COUNT]);

impl FrameVector {
    /// All nozzles at 0.0
    pub fn zero() -> Self {
        Self([0.0; NOZZLE_COUNT])
    }

    /// All nozzles at the same value
    pub fn uniform(value: f64) -> Self {
        Self([value; NOZZLE_COUNT])
    }

    pub fn from_array(values: [f64; NOZZLE_COUNT]) -> Self {
        Self(values)
    }

    /// Build from a slice, failing unless it has exactly [`NOZZLE_COUNT`] entries
    pub fn from_slice(values: &[f64]) -> Option<Self> {
        let array: [f64; NOZZLE_COUNT] = values.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, f64> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        NOZZLE_COUNT
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// True if every value is a finite number
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }

    /// Element-wise add, unclamped
    pub fn accumulate(&mut self, other: &FrameVector) {
        for (acc, v) in self.0.iter_mut().zip(other.0.iter()) {
            *acc += v;
        }
    }

    /// Clamp every value into `[-1.0, 1.0]`
    pub fn clamped(mut self) -> Self {
        for v in self.0.iter_mut() {
            *v = v.clamp(-1.0, 1.0);
        }
        self
    }

    pub fn min(&self) -> f64 {
        self.0.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.0.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }
}

impl Default for FrameVector {
    fn default() -> Self {
        Self::zero()
    }
}

impl Index<usize> for FrameVector {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.0[index]
    }
}

impl IndexMut<usize> for FrameVector {
    fn index_mut(&mut self, index: usize) -> &mut f64 {
        &mut self.0[index]
    }
}

// serde only derives arrays up to 32 elements, so go through a sequence
impl Serialize for FrameVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.as_slice().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FrameVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let values = Vec::<f64>::deserialize(deserializer)?;
        FrameVector::from_slice(&values).ok_or_else(|| {
            D::Error::custom(format!(
                "expected {} nozzle values, got {}",
                NOZZLE_COUNT,
                values.len()
            ))
        })
    }
}

/// Sum the given frames element-wise and clamp the result to `[-1.0, 1.0]`.
///
/// An empty input yields the zero vector.
pub fn aggregate<'a, I>(frames: I) -> FrameVector
where
    I: IntoIterator<Item = &'a FrameVector>,
{
    let mut sum = FrameVector::zero();
    for frame in frames {
        sum.accumulate(frame);
    }
    sum.clamped()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_empty_is_zero() {
        let result = aggregate(std::iter::empty());
        assert_eq!(result, FrameVector::zero());
    }

    #[test]
    fn test_aggregate_sums_then_clamps() {
        let mut a = FrameVector::zero();
        let mut b = FrameVector::zero();
        a[0] = 0.75;
        b[0] = 0.75;
        a[1] = -0.25;
        b[1] = 0.5;
        a[2] = -0.9;
        b[2] = -0.9;

        let result = aggregate([&a, &b]);
        assert_eq!(result[0], 1.0);
        assert!((result[1] - 0.25).abs() < 1e-12);
        assert_eq!(result[2], -1.0);
        assert!(result.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        assert!(FrameVector::from_slice(&[0.0; 35]).is_none());
        assert!(FrameVector::from_slice(&[0.0; 37]).is_none());
        assert!(FrameVector::from_slice(&[0.5; NOZZLE_COUNT]).is_some());
    }

    #[test]
    fn test_json_is_flat_array() {
        let frame = FrameVector::uniform(0.5);
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.starts_with('['));
        let values: Vec<f64> = serde_json::from_str(&json).unwrap();
        assert_eq!(values.len(), NOZZLE_COUNT);
    }

    #[test]
    fn test_json_rejects_short_array() {
        let result: Result<FrameVector, _> = serde_json::from_str("[0.0, 1.0]");
        assert!(result.is_err());
    }

    #[test]
    fn test_min_max() {
        let mut frame = FrameVector::zero();
        frame[4] = -0.3;
        frame[30] = 0.8;
        assert_eq!(frame.min(), -0.3);
        assert_eq!(frame.max(), 0.8);
    }
}
