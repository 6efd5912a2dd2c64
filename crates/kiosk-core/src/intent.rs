//! Intent gating: decides whether a detected face is deliberately presented
//! to the kiosk rather than belonging to someone walking past.
//!
//! Four gates run in a fixed order and the first failure wins:
//! detection confidence, region of interest, face size and gaze.

use crate::types::{BoundingBox, DetectedFace, Landmarks};
use std::fmt;

/// Vertical band of the frame (as fractions of height) a face centre must fall in.
const ROI_TOP: f32 = 0.2;
const ROI_BOTTOM: f32 = 0.8;

/// Thresholds for the intent gates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntentConfig {
    /// Minimum detector confidence.
    pub min_confidence: f32,
    /// Minimum face box width in pixels (distance proxy).
    pub min_face_width: f32,
    /// Fraction of frame width covered by the horizontally centred ROI.
    pub roi_center_pct: f32,
    /// Exclusive lower bound of the accepted nose ratio.
    pub gaze_low: f32,
    /// Exclusive upper bound of the accepted nose ratio.
    pub gaze_high: f32,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.90,
            min_face_width: 80.0,
            roi_center_pct: 0.40,
            gaze_low: 0.35,
            gaze_high: 0.65,
        }
    }
}

/// Outcome of the intent gates. Closed set so a UI can localize it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentReason {
    Verified,
    LowConfidence,
    OutsideRoi,
    TooFar,
    NotFacingCamera,
    AngleError,
}

impl IntentReason {
    /// Short on-screen status string.
    pub fn status_text(&self) -> &'static str {
        match self {
            IntentReason::Verified => "Verified",
            IntentReason::LowConfidence => "Low Conf",
            IntentReason::OutsideRoi => "Step in Box",
            IntentReason::TooFar => "Come Closer",
            IntentReason::NotFacingCamera => "Look Straight",
            IntentReason::AngleError => "Angle Err",
        }
    }
}

impl fmt::Display for IntentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status_text())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntentVerdict {
    pub accepted: bool,
    pub reason: IntentReason,
}

impl IntentVerdict {
    fn reject(reason: IntentReason) -> Self {
        Self {
            accepted: false,
            reason,
        }
    }

    fn accept() -> Self {
        Self {
            accepted: true,
            reason: IntentReason::Verified,
        }
    }
}

/// Stateless intent verifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntentVerifier {
    config: IntentConfig,
}

impl IntentVerifier {
    pub fn new(config: IntentConfig) -> Self {
        Self { config }
    }

    /// The guide rectangle a face centre must fall strictly inside.
    pub fn roi_rect(&self, frame_width: u32, frame_height: u32) -> BoundingBox {
        let w = frame_width as f32;
        let h = frame_height as f32;
        let half = self.config.roi_center_pct / 2.0;
        BoundingBox::new(w * (0.5 - half), h * ROI_TOP, w * (0.5 + half), h * ROI_BOTTOM)
    }

    /// Run the gates against one face.
    pub fn verify(&self, face: &DetectedFace, frame_width: u32, frame_height: u32) -> IntentVerdict {
        if face.confidence < self.config.min_confidence {
            return IntentVerdict::reject(IntentReason::LowConfidence);
        }

        let roi = self.roi_rect(frame_width, frame_height);
        let (cx, cy) = face.bbox.center();
        let inside = roi.x1 < cx && cx < roi.x2 && roi.y1 < cy && cy < roi.y2;
        if !inside {
            return IntentVerdict::reject(IntentReason::OutsideRoi);
        }

        if face.bbox.width() < self.config.min_face_width {
            return IntentVerdict::reject(IntentReason::TooFar);
        }

        let Some(ratio) = nose_ratio(&face.landmarks) else {
            return IntentVerdict::reject(IntentReason::AngleError);
        };

        // Boundaries fail; a NaN ratio fails too.
        if !(ratio > self.config.gaze_low && ratio < self.config.gaze_high) {
            tracing::trace!(ratio, "gaze outside accepted band");
            return IntentVerdict::reject(IntentReason::NotFacingCamera);
        }

        IntentVerdict::accept()
    }
}

/// Horizontal position of the nose between the eye anchors:
/// 0.0 at the left eye, 1.0 at the right eye.
///
/// Returns `None` when the anchors share an x coordinate.
pub fn nose_ratio(landmarks: &Landmarks) -> Option<f32> {
    let left = landmarks.left_eye.anchor().0;
    let right = landmarks.right_eye.anchor().0;
    let eye_dist = right - left;
    if eye_dist == 0.0 {
        return None;
    }
    Some((landmarks.nose.0 - left) / eye_dist)
}
