//! Decision logic for a face attendance kiosk.
//!
//! Detection and embedding models are external; this crate only consumes
//! their outputs: intent gating of detected faces, nearest-centroid
//! identification, name-hash keys and the optional liveness challenge.

pub mod intent;
pub mod keys;
pub mod liveness;
pub mod matcher;
pub mod types;

pub use intent::{IntentConfig, IntentReason, IntentVerdict, IntentVerifier};
pub use keys::{HashAlgorithm, KeyError};
pub use liveness::{Challenge, ChallengeState, LivenessChallenge, LivenessConfig};
pub use matcher::{EuclideanMatcher, Identification, Identity, Matcher, NO_MATCH_DISTANCE, UNKNOWN_LABEL};
pub use types::{BoundingBox, DetectedFace, Embedding, EyeLandmark, Landmarks, Point, UserTemplate};
