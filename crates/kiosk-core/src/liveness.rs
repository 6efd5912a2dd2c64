//! Active liveness via randomized challenges.
//!
//! A printed photograph cannot blink or turn its head on request. Each
//! session picks one challenge at random and evaluates landmarks frame by
//! frame until the subject performs it, the timeout expires or too many
//! frames miss.
//!
//! The kiosk ships with this gate switched off; it slots in between
//! identification and the punch commit when enabled.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs, static images on a screen.
//! - **Does not block:** Video replay of someone performing the challenge,
//!   3D masks.

use rand::Rng;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::intent::nose_ratio;
use crate::types::{Landmarks, Point};

/// Eye aspect ratio reported when it cannot be measured (eye treated as open).
const OPEN_EYE_FALLBACK_EAR: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Challenge {
    Blink,
    LookLeft,
    LookRight,
}

impl Challenge {
    pub const ALL: [Challenge; 3] = [Challenge::Blink, Challenge::LookLeft, Challenge::LookRight];

    /// On-screen prompt.
    pub fn prompt(&self) -> &'static str {
        match self {
            Challenge::Blink => "Blink",
            Challenge::LookLeft => "Look Left",
            Challenge::LookRight => "Look Right",
        }
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prompt())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    Idle,
    Challenging,
    Passed,
    Failed,
}

/// Head direction derived from the nose ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadPose {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessConfig {
    /// Time allowed to complete a challenge.
    pub timeout: Duration,
    /// Mean EAR below which the eyes count as closed.
    pub blink_ear_threshold: f32,
    /// Sliding window length (frames) for blink detection.
    pub blink_frames: usize,
    /// Nose ratio deviation from 0.5 that counts as a head turn.
    pub head_pose_threshold: f32,
    /// Missed frames tolerated before the challenge fails.
    pub max_attempts: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            blink_ear_threshold: 0.25,
            blink_frames: 3,
            head_pose_threshold: 0.5,
            max_attempts: 5,
        }
    }
}

/// Per-session challenge state machine.
#[derive(Debug)]
pub struct LivenessChallenge {
    config: LivenessConfig,
    state: ChallengeState,
    challenge: Option<Challenge>,
    started_at: Option<Instant>,
    attempts: u32,
    blink_history: VecDeque<bool>,
}

impl LivenessChallenge {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            state: ChallengeState::Idle,
            challenge: None,
            started_at: None,
            attempts: 0,
            blink_history: VecDeque::with_capacity(config.blink_frames),
        }
    }

    pub fn state(&self) -> ChallengeState {
        self.state
    }

    pub fn challenge(&self) -> Option<Challenge> {
        self.challenge
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Pick a challenge uniformly at random and start the clock.
    pub fn start_challenge(&mut self) -> Challenge {
        self.start_challenge_at(Instant::now())
    }

    /// Pick a challenge uniformly at random, started at `now`.
    pub fn start_challenge_at(&mut self, now: Instant) -> Challenge {
        let idx = rand::thread_rng().gen_range(0..Challenge::ALL.len());
        let challenge = Challenge::ALL[idx];
        self.start_with(challenge, now);
        challenge
    }

    /// Start a specific challenge at `now`.
    pub fn start_with(&mut self, challenge: Challenge, now: Instant) {
        self.state = ChallengeState::Challenging;
        self.challenge = Some(challenge);
        self.started_at = Some(now);
        self.attempts = 0;
        self.blink_history.clear();
        tracing::debug!(%challenge, "liveness challenge started");
    }

    pub fn verify_challenge(&mut self, landmarks: &Landmarks) -> ChallengeState {
        self.verify_challenge_at(landmarks, Instant::now())
    }

    /// Evaluate one frame of landmarks against the active challenge.
    pub fn verify_challenge_at(&mut self, landmarks: &Landmarks, now: Instant) -> ChallengeState {
        if self.state != ChallengeState::Challenging {
            return self.state;
        }
        let (Some(challenge), Some(started_at)) = (self.challenge, self.started_at) else {
            return self.state;
        };

        if now.saturating_duration_since(started_at) > self.config.timeout {
            tracing::info!(%challenge, "liveness challenge timed out");
            self.state = ChallengeState::Failed;
            return self.state;
        }

        let performed = match challenge {
            Challenge::Blink => self.observe_blink(landmarks),
            Challenge::LookLeft => {
                head_pose(landmarks, self.config.head_pose_threshold) == HeadPose::Left
            }
            Challenge::LookRight => {
                head_pose(landmarks, self.config.head_pose_threshold) == HeadPose::Right
            }
        };

        if performed {
            tracing::info!(%challenge, "liveness challenge passed");
            self.state = ChallengeState::Passed;
            return self.state;
        }

        self.attempts += 1;
        if self.attempts >= self.config.max_attempts {
            tracing::warn!(
                %challenge,
                attempts = self.attempts,
                "liveness challenge failed: attempt limit reached"
            );
            self.state = ChallengeState::Failed;
        }
        self.state
    }

    pub fn reset(&mut self) {
        self.state = ChallengeState::Idle;
        self.challenge = None;
        self.started_at = None;
        self.attempts = 0;
        self.blink_history.clear();
    }

    /// Push this frame's eye state; a blink is a window holding both closed
    /// and open frames.
    fn observe_blink(&mut self, landmarks: &Landmarks) -> bool {
        let window = self.config.blink_frames.max(1);
        let closed = mean_eye_aspect_ratio(landmarks) < self.config.blink_ear_threshold;

        if self.blink_history.len() == window {
            self.blink_history.pop_front();
        }
        self.blink_history.push_back(closed);

        if self.blink_history.len() < window {
            return false;
        }
        let has_closed = self.blink_history.iter().any(|&c| c);
        let has_open = self.blink_history.iter().any(|&c| !c);
        has_closed && has_open
    }
}

/// Eye aspect ratio of a 6-point contour:
/// `(|p1 - p5| + |p2 - p4|) / (2 * |p0 - p3|)`.
///
/// Open eyes sit around 0.4–0.5, closed eyes around 0.1–0.2.
pub fn eye_aspect_ratio(contour: &[Point; 6]) -> f32 {
    let vertical_1 = distance(contour[1], contour[5]);
    let vertical_2 = distance(contour[2], contour[4]);
    let horizontal = distance(contour[0], contour[3]);
    if horizontal > 0.0 {
        (vertical_1 + vertical_2) / (2.0 * horizontal)
    } else {
        OPEN_EYE_FALLBACK_EAR
    }
}

/// Mean EAR of both eyes. Eyes given as single points read as open.
pub fn mean_eye_aspect_ratio(landmarks: &Landmarks) -> f32 {
    let ear = |eye: &crate::types::EyeLandmark| {
        eye.contour()
            .map(eye_aspect_ratio)
            .unwrap_or(OPEN_EYE_FALLBACK_EAR)
    };
    (ear(&landmarks.left_eye) + ear(&landmarks.right_eye)) / 2.0
}

/// Classify head direction from the nose ratio. Degenerate eye geometry reads
/// as centred.
pub fn head_pose(landmarks: &Landmarks, threshold: f32) -> HeadPose {
    match nose_ratio(landmarks) {
        Some(ratio) if ratio < 0.5 - threshold => HeadPose::Left,
        Some(ratio) if ratio > 0.5 + threshold => HeadPose::Right,
        _ => HeadPose::Center,
    }
}

fn distance(a: Point, b: Point) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EyeLandmark;

    /// Eye contour with corners 20 px apart and the given lid opening.
    fn eye(x: f32, opening: f32) -> EyeLandmark {
        let half = opening / 2.0;
        EyeLandmark::Contour([
            (x, 50.0),
            (x + 7.0, 50.0 - half),
            (x + 13.0, 50.0 - half),
            (x + 20.0, 50.0),
            (x + 13.0, 50.0 + half),
            (x + 7.0, 50.0 + half),
        ])
    }

    /// Landmarks with both eyes open (`opening` 10 => EAR 0.5) or closed
    /// (`opening` 2 => EAR 0.1), nose at `nose_x`.
    fn landmarks(opening: f32, nose_x: f32) -> Landmarks {
        Landmarks {
            left_eye: eye(100.0, opening),
            right_eye: eye(140.0, opening),
            nose: (nose_x, 70.0),
        }
    }

    fn open() -> Landmarks {
        landmarks(10.0, 120.0)
    }

    fn closed() -> Landmarks {
        landmarks(2.0, 120.0)
    }

    fn started(challenge: Challenge, config: LivenessConfig) -> (LivenessChallenge, Instant) {
        let mut lc = LivenessChallenge::new(config);
        let t0 = Instant::now();
        lc.start_with(challenge, t0);
        (lc, t0)
    }

    #[test]
    fn test_eye_aspect_ratio() {
        let open_contour = eye(0.0, 10.0);
        let closed_contour = eye(0.0, 2.0);
        assert!((eye_aspect_ratio(open_contour.contour().unwrap()) - 0.5).abs() < 1e-6);
        assert!((eye_aspect_ratio(closed_contour.contour().unwrap()) - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_point_eyes_read_open() {
        let lm = Landmarks {
            left_eye: EyeLandmark::Point((100.0, 50.0)),
            right_eye: EyeLandmark::Point((140.0, 50.0)),
            nose: (120.0, 70.0),
        };
        assert_eq!(mean_eye_aspect_ratio(&lm), OPEN_EYE_FALLBACK_EAR);
    }

    #[test]
    fn test_head_pose() {
        // Eye anchors at x=100 and x=140: ratio = (nose - 100) / 40.
        assert_eq!(head_pose(&landmarks(10.0, 120.0), 0.3), HeadPose::Center);
        assert_eq!(head_pose(&landmarks(10.0, 104.0), 0.3), HeadPose::Left);
        assert_eq!(head_pose(&landmarks(10.0, 136.0), 0.3), HeadPose::Right);
    }

    #[test]
    fn test_start_challenge_is_one_of_three() {
        let mut lc = LivenessChallenge::new(LivenessConfig::default());
        assert_eq!(lc.state(), ChallengeState::Idle);
        let challenge = lc.start_challenge();
        assert!(Challenge::ALL.contains(&challenge));
        assert_eq!(lc.state(), ChallengeState::Challenging);
        assert_eq!(lc.challenge(), Some(challenge));
        assert_eq!(lc.attempts(), 0);
    }

    #[test]
    fn test_verify_when_idle_is_noop() {
        let mut lc = LivenessChallenge::new(LivenessConfig::default());
        assert_eq!(lc.verify_challenge(&open()), ChallengeState::Idle);
        assert_eq!(lc.attempts(), 0);
    }

    #[test]
    fn test_blink_passes() {
        let (mut lc, t0) = started(Challenge::Blink, LivenessConfig::default());
        assert_eq!(lc.verify_challenge_at(&open(), t0), ChallengeState::Challenging);
        assert_eq!(lc.verify_challenge_at(&closed(), t0), ChallengeState::Challenging);
        assert_eq!(lc.verify_challenge_at(&open(), t0), ChallengeState::Passed);
    }

    #[test]
    fn test_steady_open_eyes_fail_after_max_attempts() {
        let (mut lc, t0) = started(Challenge::Blink, LivenessConfig::default());
        for _ in 0..4 {
            assert_eq!(lc.verify_challenge_at(&open(), t0), ChallengeState::Challenging);
        }
        assert_eq!(lc.verify_challenge_at(&open(), t0), ChallengeState::Failed);
        assert_eq!(lc.attempts(), 5);
    }

    #[test]
    fn test_look_left_and_right() {
        let config = LivenessConfig {
            head_pose_threshold: 0.3,
            ..LivenessConfig::default()
        };
        let (mut lc, t0) = started(Challenge::LookLeft, config);
        assert_eq!(lc.verify_challenge_at(&landmarks(10.0, 136.0), t0), ChallengeState::Challenging);
        assert_eq!(lc.verify_challenge_at(&landmarks(10.0, 104.0), t0), ChallengeState::Passed);

        let (mut lc, t0) = started(Challenge::LookRight, config);
        assert_eq!(lc.verify_challenge_at(&landmarks(10.0, 136.0), t0), ChallengeState::Passed);
    }

    #[test]
    fn test_timeout_fails() {
        let (mut lc, t0) = started(Challenge::LookLeft, LivenessConfig::default());
        let late = t0 + Duration::from_secs(6);
        assert_eq!(lc.verify_challenge_at(&open(), late), ChallengeState::Failed);
    }

    #[test]
    fn test_terminal_states_are_sticky_until_reset() {
        let (mut lc, t0) = started(Challenge::LookLeft, LivenessConfig::default());
        let late = t0 + Duration::from_secs(6);
        lc.verify_challenge_at(&open(), late);
        assert_eq!(lc.verify_challenge_at(&open(), t0), ChallengeState::Failed);

        lc.reset();
        assert_eq!(lc.state(), ChallengeState::Idle);
        assert_eq!(lc.challenge(), None);
        assert_eq!(lc.attempts(), 0);
    }
}
