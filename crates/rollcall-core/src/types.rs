use serde::{Deserialize, Serialize};
use std::fmt;

use crate::vector::{self, VectorError};

/// Length of the descriptors produced by the external face-descriptor model.
pub const DESCRIPTOR_DIM: usize = 128;

/// Opaque identity key (typically a user id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Immutable face descriptor.
///
/// Construction rejects empty vectors and NaN/Inf values; the length is only
/// checked against [`DESCRIPTOR_DIM`] at the storage boundary so tests and
/// tooling can work with short vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Result<Self, VectorError> {
        if values.is_empty() {
            return Err(VectorError::Empty);
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(VectorError::NonFinite);
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance to another descriptor.
    pub fn distance(&self, other: &Descriptor) -> Result<f32, VectorError> {
        vector::euclidean_distance(&self.values, &other.values)
    }

    /// `1 - distance`, the similarity scale used by clustering.
    pub fn similarity(&self, other: &Descriptor) -> Result<f32, VectorError> {
        vector::similarity(&self.values, &other.values)
    }
}

impl TryFrom<Vec<f32>> for Descriptor {
    type Error = VectorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Descriptor::new(values)
    }
}

impl From<Descriptor> for Vec<f32> {
    fn from(d: Descriptor) -> Self {
        d.values
    }
}

impl AsRef<[f32]> for Descriptor {
    fn as_ref(&self) -> &[f32] {
        &self.values
    }
}

/// Axis-aligned face bounding box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Distance between the two box centres.
    pub fn center_distance(&self, other: &BoundingBox) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }

    /// Intersection over union, 0.0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 { inter / union } else { 0.0 }
    }
}

/// Facial landmarks in the 68-point iBUG layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Landmarks {
    pub points: Vec<(f32, f32)>,
}

const NOSE_TIP: usize = 30;
const LEFT_EYE: std::ops::Range<usize> = 36..42;
const RIGHT_EYE: std::ops::Range<usize> = 42..48;

impl Landmarks {
    pub fn new(points: Vec<(f32, f32)>) -> Self {
        Self { points }
    }

    /// Six contour points of the subject's left eye, `None` for short layouts.
    pub fn left_eye(&self) -> Option<&[(f32, f32)]> {
        self.points.get(LEFT_EYE)
    }

    pub fn right_eye(&self) -> Option<&[(f32, f32)]> {
        self.points.get(RIGHT_EYE)
    }

    pub fn nose_tip(&self) -> Option<(f32, f32)> {
        self.points.get(NOSE_TIP).copied()
    }
}

/// Expression probabilities reported by the external detector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Expressions {
    pub neutral: f32,
    pub happy: f32,
    pub sad: f32,
    pub angry: f32,
    pub fearful: f32,
    pub disgusted: f32,
    pub surprised: f32,
}

/// One face reported by the detector for a single frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub bounding_box: BoundingBox,
    pub descriptor: Descriptor,
    #[serde(default)]
    pub landmarks: Option<Landmarks>,
    #[serde(default)]
    pub expressions: Option<Expressions>,
}
