use serde::{Deserialize, Serialize};

/// A 2D point in frame pixel space.
pub type Point = (f32, f32);

/// Axis-aligned face box in pixel space (`x1 < x2`, `y1 < y2`).
///
/// Serialized as `[x1, y1, x2, y2]`, the layout detection models emit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn center(&self) -> Point {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [f32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// Eye landmark as reported by the detector: either a single centre point or
/// a 6-point contour (corner, two upper lids, corner, two lower lids).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EyeLandmark {
    Point(Point),
    Contour([Point; 6]),
}

impl EyeLandmark {
    /// Reference point used for gaze and head-pose ratios.
    ///
    /// For contours this is the first contour point.
    pub fn anchor(&self) -> Point {
        match self {
            EyeLandmark::Point(p) => *p,
            EyeLandmark::Contour(points) => points[0],
        }
    }

    pub fn contour(&self) -> Option<&[Point; 6]> {
        match self {
            EyeLandmark::Point(_) => None,
            EyeLandmark::Contour(points) => Some(points),
        }
    }
}

/// Minimum landmark set the kiosk needs from a detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmarks {
    pub left_eye: EyeLandmark,
    pub right_eye: EyeLandmark,
    pub nose: Point,
}

/// One face reported by the detector for a single frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    /// Detector-assigned identifier, unique within the frame (e.g. "face_1").
    #[serde(default)]
    pub id: String,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub landmarks: Landmarks,
}

/// Face embedding vector (512-dimensional for the reference model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// True when the vector is non-empty and contains no NaN/Inf.
    pub fn is_valid(&self) -> bool {
        !self.values.is_empty() && self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance between two embeddings, `None` when their
    /// dimensions differ.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f32> {
        if self.dim() != other.dim() {
            return None;
        }
        let sum = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>();
        Some(sum.sqrt())
    }
}

/// An enrolled user: stable hashed key, display name and centroid embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct UserTemplate {
    pub key: String,
    pub name: String,
    pub embedding: Embedding,
}
