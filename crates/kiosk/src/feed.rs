//! JSON-lines frame feed.
//!
//! Detection and embedding run in an external model process that writes one
//! JSON object per captured frame:
//!
//! ```json
//! {"width": 640, "height": 480, "faces": [
//!   {"id": "face_1", "confidence": 0.98, "box": [260, 170, 380, 310],
//!    "landmarks": {"left_eye": [290, 220], "right_eye": [350, 220], "nose": [320, 250]},
//!    "embedding": [0.012, -0.034, ...]}
//! ]}
//! ```
//!
//! Eyes may also be given as 6-point contours. `embedding` is omitted or null
//! when the crop could not be embedded.

use anyhow::Result;
use kiosk_core::{DetectedFace, Embedding};
use serde::{Deserialize, Serialize};
use std::io::BufRead;

use crate::engine::{FaceDetector, FaceEmbedder, Frame, FrameSource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedFace {
    #[serde(flatten)]
    pub face: DetectedFace,
    #[serde(default)]
    pub embedding: Option<Embedding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedFrame {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub faces: Vec<FeedFace>,
}

impl Frame for FeedFrame {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

/// Reads frames line by line. Blank and malformed lines are skipped.
pub struct JsonlFeed<R> {
    reader: R,
    line_no: usize,
}

impl<R: BufRead> JsonlFeed<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, line_no: 0 }
    }
}

impl<R: BufRead> FrameSource for JsonlFeed<R> {
    type Frame = FeedFrame;

    fn next_frame(&mut self) -> Result<Option<FeedFrame>> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<FeedFrame>(trimmed) {
                Ok(mut frame) => {
                    for (i, f) in frame.faces.iter_mut().enumerate() {
                        if f.face.id.is_empty() {
                            f.face.id = format!("face_{}", i + 1);
                        }
                    }
                    return Ok(Some(frame));
                }
                Err(e) => {
                    tracing::warn!(line = self.line_no, error = %e, "skipping malformed frame");
                }
            }
        }
    }
}

/// Detector over detections already present in the feed.
pub struct FeedDetector;

impl FaceDetector for FeedDetector {
    type Frame = FeedFrame;

    fn detect(&mut self, frame: &FeedFrame) -> Result<Vec<DetectedFace>> {
        Ok(frame.faces.iter().map(|f| f.face.clone()).collect())
    }
}

/// Embedder over embeddings already present in the feed.
pub struct FeedEmbedder;

impl FaceEmbedder for FeedEmbedder {
    type Frame = FeedFrame;

    fn embed(&mut self, frame: &FeedFrame, face: &DetectedFace) -> Result<Option<Embedding>> {
        let embedding = frame
            .faces
            .iter()
            .find(|f| f.face.id == face.id)
            .and_then(|f| f.embedding.clone())
            .filter(Embedding::is_valid);
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiosk_core::EyeLandmark;

    const FRAME: &str = r#"{"width": 640, "height": 480, "faces": [
        {"confidence": 0.98, "box": [260, 170, 380, 310],
         "landmarks": {"left_eye": [290, 220], "right_eye": [350, 220], "nose": [320, 250]},
         "embedding": [0.5, -0.5]},
        {"id": "b", "confidence": 0.91, "box": [10, 10, 50, 50],
         "landmarks": {"left_eye": [[15, 20], [17, 18], [19, 18], [21, 20], [19, 22], [17, 22]],
                       "right_eye": [35, 20], "nose": [25, 30]}}
    ]}"#;

    fn one_line(json: &str) -> String {
        json.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_parses_frame_and_assigns_ids() {
        let input = format!("{}\n", one_line(FRAME));
        let mut feed = JsonlFeed::new(input.as_bytes());
        let frame = feed.next_frame().unwrap().unwrap();

        assert_eq!((frame.width(), frame.height()), (640, 480));
        assert_eq!(frame.faces.len(), 2);
        assert_eq!(frame.faces[0].face.id, "face_1");
        assert_eq!(frame.faces[1].face.id, "b");
        assert_eq!(frame.faces[0].face.bbox.x2, 380.0);
        assert!(matches!(frame.faces[1].face.landmarks.left_eye, EyeLandmark::Contour(_)));
        assert!(matches!(frame.faces[1].face.landmarks.right_eye, EyeLandmark::Point(_)));
        assert!(frame.faces[1].embedding.is_none());

        assert!(feed.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_skips_blank_and_malformed_lines() {
        let input = format!("\n{{not json\n{}\n", r#"{"width": 320, "height": 240}"#);
        let mut feed = JsonlFeed::new(input.as_bytes());
        let frame = feed.next_frame().unwrap().unwrap();
        assert_eq!(frame.width, 320);
        assert!(frame.faces.is_empty());
        assert!(feed.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_embedder_matches_by_id() {
        let input = format!("{}\n", one_line(FRAME));
        let frame = JsonlFeed::new(input.as_bytes()).next_frame().unwrap().unwrap();
        let faces = FeedDetector.detect(&frame).unwrap();

        let first = FeedEmbedder.embed(&frame, &faces[0]).unwrap();
        assert_eq!(first, Some(Embedding::new(vec![0.5, -0.5])));
        assert_eq!(FeedEmbedder.embed(&frame, &faces[1]).unwrap(), None);
    }
}
