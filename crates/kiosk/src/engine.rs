use anyhow::{bail, Result};
use chrono::{Local, NaiveDateTime};
use kiosk_core::{
    BoundingBox, Challenge, ChallengeState, DetectedFace, Embedding, EuclideanMatcher, Identity,
    IntentReason, IntentVerifier, Landmarks, LivenessChallenge, LivenessConfig, Matcher,
    UserTemplate,
};

use std::time::Instant;

use crate::attendance::{AttendanceTracker, PunchAction, PunchOutcome};
use crate::enroll::{self, SampleBurst};
use crate::store::TemplateStore;

/// A captured frame. Pixel data stays with the external collaborators.
pub trait Frame {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
}

/// Camera capture. `Ok(None)` ends the loop.
pub trait FrameSource {
    type Frame: Frame;
    fn next_frame(&mut self) -> Result<Option<Self::Frame>>;
}

/// Face detection model.
pub trait FaceDetector {
    type Frame: Frame;
    fn detect(&mut self, frame: &Self::Frame) -> Result<Vec<DetectedFace>>;
}

/// Embedding model. `Ok(None)` when the aligned crop is unusable.
pub trait FaceEmbedder {
    type Frame: Frame;
    fn embed(&mut self, frame: &Self::Frame, face: &DetectedFace) -> Result<Option<Embedding>>;
}

/// What happened to one face during a tick. Closed set for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum FaceStatus {
    Rejected(IntentReason),
    NoEmbedding,
    Unknown { distance: f32 },
    Punched { name: String, action: PunchAction },
    Wait { name: String, remaining_secs: u64 },
    Challenge { name: String, challenge: Challenge },
    LivenessFailed { name: String },
    PunchFailed { name: String },
    Sampled { count: usize, target: usize },
    Skipped,
}

impl FaceStatus {
    /// Short on-screen status string.
    pub fn status_text(&self) -> String {
        match self {
            FaceStatus::Rejected(reason) => reason.status_text().to_string(),
            FaceStatus::NoEmbedding => "No Face Crop".to_string(),
            FaceStatus::Unknown { .. } => kiosk_core::UNKNOWN_LABEL.to_string(),
            FaceStatus::Punched { name, action } => format!("{name}: {action}"),
            FaceStatus::Wait { name, remaining_secs } => format!("{name}: Wait {remaining_secs}s"),
            FaceStatus::Challenge { name, challenge } => format!("{name}: {challenge}"),
            FaceStatus::LivenessFailed { name } => format!("{name}: Liveness Failed"),
            FaceStatus::PunchFailed { name } => format!("{name}: Log Error"),
            FaceStatus::Sampled { count, target } => format!("Captured {count}/{target}"),
            FaceStatus::Skipped => "One at a time".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceReport {
    pub face_id: String,
    pub bbox: BoundingBox,
    pub status: FaceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Pass,
    Pending(Challenge),
    Fail,
}

/// The instant a tick runs at: wall-clock time for the attendance log and
/// cooldown, monotonic time for the liveness timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickTime {
    pub wall: NaiveDateTime,
    pub mono: Instant,
}

impl TickTime {
    pub fn now() -> Self {
        Self {
            wall: Local::now().naive_local(),
            mono: Instant::now(),
        }
    }
}

/// Liveness check inserted between identification and the punch commit.
///
/// One challenge runs at a time, bound to the identified subject; a different
/// subject restarts it.
pub struct LivenessGate {
    challenge: LivenessChallenge,
    subject: Option<String>,
}

impl LivenessGate {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            challenge: LivenessChallenge::new(config),
            subject: None,
        }
    }

    pub fn check(&mut self, name: &str, landmarks: &Landmarks, now: Instant) -> GateDecision {
        if self.subject.as_deref() != Some(name) || self.challenge.state() == ChallengeState::Idle {
            self.challenge.reset();
            let challenge = self.challenge.start_challenge_at(now);
            self.subject = Some(name.to_string());
            tracing::info!(name, %challenge, "liveness challenge issued");
        }

        match self.challenge.verify_challenge_at(landmarks, now) {
            ChallengeState::Passed => {
                self.clear();
                GateDecision::Pass
            }
            ChallengeState::Challenging => match self.challenge.challenge() {
                Some(challenge) => GateDecision::Pending(challenge),
                None => GateDecision::Fail,
            },
            ChallengeState::Failed | ChallengeState::Idle => {
                self.clear();
                GateDecision::Fail
            }
        }
    }

    fn clear(&mut self) {
        self.challenge.reset();
        self.subject = None;
    }
}

/// Frame-at-a-time pipeline: detect, gate intent, embed, then identify and
/// punch (attendance) or collect samples (registration).
pub struct Kiosk<D, E> {
    detector: D,
    embedder: E,
    verifier: IntentVerifier,
    threshold: f32,
    liveness: Option<LivenessGate>,
}

impl<F, D, E> Kiosk<D, E>
where
    F: Frame,
    D: FaceDetector<Frame = F>,
    E: FaceEmbedder<Frame = F>,
{
    pub fn new(detector: D, embedder: E, verifier: IntentVerifier, threshold: f32) -> Self {
        Self {
            detector,
            embedder,
            verifier,
            threshold,
            liveness: None,
        }
    }

    /// Require a liveness challenge before each punch.
    pub fn with_liveness(mut self, config: LivenessConfig) -> Self {
        self.liveness = Some(LivenessGate::new(config));
        self
    }

    fn embed_face(&mut self, frame: &F, face: &DetectedFace) -> Option<Embedding> {
        match self.embedder.embed(frame, face) {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::warn!(face = %face.id, error = %e, "embedding failed, skipping face");
                None
            }
        }
    }

    /// One attendance tick at `now`.
    pub fn attendance_tick(
        &mut self,
        frame: &F,
        store: &TemplateStore,
        tracker: &mut AttendanceTracker,
        now: TickTime,
    ) -> Result<Vec<FaceReport>> {
        let faces = self.detector.detect(frame)?;
        let mut reports = Vec::with_capacity(faces.len());

        for face in faces {
            let status = self.attendance_status(frame, &face, store, tracker, now);
            reports.push(FaceReport {
                face_id: face.id,
                bbox: face.bbox,
                status,
            });
        }
        Ok(reports)
    }

    fn attendance_status(
        &mut self,
        frame: &F,
        face: &DetectedFace,
        store: &TemplateStore,
        tracker: &mut AttendanceTracker,
        now: TickTime,
    ) -> FaceStatus {
        let verdict = self.verifier.verify(face, frame.width(), frame.height());
        if !verdict.accepted {
            return FaceStatus::Rejected(verdict.reason);
        }

        let Some(embedding) = self.embed_face(frame, face) else {
            return FaceStatus::NoEmbedding;
        };

        let identification = EuclideanMatcher.identify(&embedding, store.templates(), self.threshold);
        let Identity::Known { name, .. } = identification.identity else {
            tracing::debug!(distance = identification.distance, "face not recognized");
            return FaceStatus::Unknown {
                distance: identification.distance,
            };
        };

        if let Some(remaining_secs) = tracker.cooldown_remaining_at(&name, now.wall) {
            return FaceStatus::Wait {
                name,
                remaining_secs,
            };
        }

        if let Some(gate) = self.liveness.as_mut() {
            match gate.check(&name, &face.landmarks, now.mono) {
                GateDecision::Pass => {}
                GateDecision::Pending(challenge) => return FaceStatus::Challenge { name, challenge },
                GateDecision::Fail => return FaceStatus::LivenessFailed { name },
            }
        }

        match tracker.process_punch_at(&name, now.wall) {
            Ok(PunchOutcome::Success(action)) => FaceStatus::Punched { name, action },
            Ok(PunchOutcome::Wait { remaining_secs }) => FaceStatus::Wait {
                name,
                remaining_secs,
            },
            Err(e) => {
                tracing::error!(name, error = %e, "punch failed");
                FaceStatus::PunchFailed { name }
            }
        }
    }

    /// One registration tick: the first accepted face with an embedding
    /// contributes a sample.
    pub fn enrollment_tick(&mut self, frame: &F, burst: &mut SampleBurst) -> Result<Vec<FaceReport>> {
        let faces = self.detector.detect(frame)?;
        let mut reports = Vec::with_capacity(faces.len());
        let mut sampled = false;

        for face in faces {
            let verdict = self.verifier.verify(&face, frame.width(), frame.height());
            let status = if !verdict.accepted {
                FaceStatus::Rejected(verdict.reason)
            } else if sampled || burst.is_complete() {
                FaceStatus::Skipped
            } else {
                match self.embed_face(frame, &face) {
                    Some(embedding) => {
                        burst.push(embedding);
                        sampled = true;
                        FaceStatus::Sampled {
                            count: burst.len(),
                            target: burst.target(),
                        }
                    }
                    None => FaceStatus::NoEmbedding,
                }
            };
            reports.push(FaceReport {
                face_id: face.id,
                bbox: face.bbox,
                status,
            });
        }
        Ok(reports)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: usize,
    pub punches: usize,
}

/// Attendance loop until the source is exhausted.
pub fn run_attendance<S, D, E>(
    source: &mut S,
    kiosk: &mut Kiosk<D, E>,
    store: &TemplateStore,
    tracker: &mut AttendanceTracker,
    mut on_report: impl FnMut(&FaceReport),
) -> Result<RunSummary>
where
    S: FrameSource,
    D: FaceDetector<Frame = S::Frame>,
    E: FaceEmbedder<Frame = S::Frame>,
{
    let mut summary = RunSummary::default();
    while let Some(frame) = source.next_frame()? {
        summary.frames += 1;
        let reports = kiosk.attendance_tick(&frame, store, tracker, TickTime::now())?;
        for report in &reports {
            if matches!(report.status, FaceStatus::Punched { .. }) {
                summary.punches += 1;
            }
            on_report(report);
        }
    }
    tracing::info!(frames = summary.frames, punches = summary.punches, "attendance loop finished");
    Ok(summary)
}

/// Registration loop: refuse duplicate names before capturing, gather the
/// burst, then enroll.
pub fn run_registration<S, D, E>(
    source: &mut S,
    kiosk: &mut Kiosk<D, E>,
    store: &mut TemplateStore,
    name: &str,
    samples: usize,
    mut on_report: impl FnMut(&FaceReport),
) -> Result<UserTemplate>
where
    S: FrameSource,
    D: FaceDetector<Frame = S::Frame>,
    E: FaceEmbedder<Frame = S::Frame>,
{
    enroll::check_available(store, name)?;

    let mut burst = SampleBurst::new(samples);
    while !burst.is_complete() {
        let Some(frame) = source.next_frame()? else {
            bail!(
                "frame source ended after {}/{} samples for '{name}'",
                burst.len(),
                burst.target()
            );
        };
        for report in kiosk.enrollment_tick(&frame, &mut burst)? {
            on_report(&report);
        }
    }

    Ok(enroll::enroll(store, name, burst.samples())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enroll::EnrollError;
    use crate::feed::{FeedDetector, FeedEmbedder, FeedFace, FeedFrame};
    use chrono::NaiveDate;
    use kiosk_core::{EyeLandmark, HashAlgorithm, IntentConfig};
    use std::path::Path;
    use std::sync::OnceLock;
    use std::time::Duration;

    /// Replays a fixed list of frames.
    struct Frames(std::vec::IntoIter<FeedFrame>);

    impl FrameSource for Frames {
        type Frame = FeedFrame;

        fn next_frame(&mut self) -> Result<Option<FeedFrame>> {
            Ok(self.0.next())
        }
    }

    fn face(id: &str, embedding: Option<Vec<f32>>) -> FeedFace {
        FeedFace {
            face: DetectedFace {
                id: id.into(),
                confidence: 0.99,
                bbox: BoundingBox::new(260.0, 170.0, 380.0, 310.0),
                landmarks: Landmarks {
                    left_eye: EyeLandmark::Point((290.0, 220.0)),
                    right_eye: EyeLandmark::Point((350.0, 220.0)),
                    nose: (320.0, 250.0),
                },
            },
            embedding: embedding.map(Embedding::new),
        }
    }

    fn frame(faces: Vec<FeedFace>) -> FeedFrame {
        FeedFrame {
            width: 640,
            height: 480,
            faces,
        }
    }

    fn kiosk() -> Kiosk<FeedDetector, FeedEmbedder> {
        Kiosk::new(
            FeedDetector,
            FeedEmbedder,
            IntentVerifier::new(IntentConfig::default()),
            0.6,
        )
    }

    /// Tick time on 2026-03-02; the monotonic clock advances with the wall clock.
    fn at(h: u32, m: u32, s: u32) -> TickTime {
        static MIDNIGHT: OnceLock<Instant> = OnceLock::new();
        let midnight = *MIDNIGHT.get_or_init(Instant::now);
        TickTime {
            wall: NaiveDate::from_ymd_opt(2026, 3, 2)
                .unwrap()
                .and_hms_opt(h, m, s)
                .unwrap(),
            mono: midnight + Duration::from_secs(u64::from(h * 3600 + m * 60 + s)),
        }
    }

    fn setup(dir: &Path) -> (TemplateStore, AttendanceTracker) {
        let mut store = TemplateStore::empty(&dir.join("face_db.json"), HashAlgorithm::Sha256);
        enroll::enroll(&mut store, "Alice", &[Embedding::new(vec![1.0, 0.0])]).unwrap();
        let tracker =
            AttendanceTracker::open(&dir.join("attendance_log.csv"), Duration::from_secs(60)).unwrap();
        (store, tracker)
    }

    #[test]
    fn test_attendance_tick_punches_known_face() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut tracker) = setup(dir.path());
        let mut k = kiosk();

        let f = frame(vec![face("a", Some(vec![1.0, 0.1]))]);
        let reports = k.attendance_tick(&f, &store, &mut tracker, at(9, 0, 0)).unwrap();
        assert_eq!(
            reports[0].status,
            FaceStatus::Punched {
                name: "Alice".into(),
                action: PunchAction::PunchIn
            }
        );
        assert_eq!(reports[0].status.status_text(), "Alice: PUNCH IN");

        let reports = k.attendance_tick(&f, &store, &mut tracker, at(9, 0, 30)).unwrap();
        assert_eq!(
            reports[0].status,
            FaceStatus::Wait {
                name: "Alice".into(),
                remaining_secs: 30
            }
        );
    }

    #[test]
    fn test_attendance_tick_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut tracker) = setup(dir.path());
        let mut k = kiosk();

        let mut far = face("far", Some(vec![1.0, 0.0]));
        far.face.confidence = 0.5;
        let f = frame(vec![
            far,
            face("stranger", Some(vec![-1.0, 0.0])),
            face("blank", None),
        ]);
        let reports = k.attendance_tick(&f, &store, &mut tracker, at(9, 0, 0)).unwrap();

        assert_eq!(reports[0].status, FaceStatus::Rejected(IntentReason::LowConfidence));
        assert!(matches!(reports[1].status, FaceStatus::Unknown { distance } if (distance - 2.0).abs() < 1e-6));
        assert_eq!(reports[1].status.status_text(), "Unknown");
        assert_eq!(reports[2].status, FaceStatus::NoEmbedding);
        assert!(tracker.log().read_records().unwrap().is_empty());
    }

    #[test]
    fn test_liveness_gate_holds_punch() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut tracker) = setup(dir.path());
        let mut k = kiosk().with_liveness(LivenessConfig::default());

        // A still face with point eyes never blinks or turns; default pose
        // threshold 0.5 needs the nose outside the eyes.
        let f = frame(vec![face("a", Some(vec![1.0, 0.0]))]);
        let reports = k.attendance_tick(&f, &store, &mut tracker, at(9, 0, 0)).unwrap();
        assert!(matches!(reports[0].status, FaceStatus::Challenge { .. }));
        assert!(tracker.log().read_records().unwrap().is_empty());
    }

    #[test]
    fn test_liveness_timeout_uses_tick_clock() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut tracker) = setup(dir.path());
        let mut k = kiosk().with_liveness(LivenessConfig::default());
        let f = frame(vec![face("a", Some(vec![1.0, 0.0]))]);

        let reports = k.attendance_tick(&f, &store, &mut tracker, at(9, 0, 0)).unwrap();
        assert!(matches!(reports[0].status, FaceStatus::Challenge { .. }));

        // Default timeout is 5 s.
        let reports = k.attendance_tick(&f, &store, &mut tracker, at(9, 0, 6)).unwrap();
        assert_eq!(
            reports[0].status,
            FaceStatus::LivenessFailed {
                name: "Alice".into()
            }
        );

        // The next sighting starts a fresh challenge.
        let reports = k.attendance_tick(&f, &store, &mut tracker, at(9, 0, 7)).unwrap();
        assert!(matches!(reports[0].status, FaceStatus::Challenge { .. }));
        assert!(tracker.log().read_records().unwrap().is_empty());
    }

    #[test]
    fn test_short_embedding_is_not_identified() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TemplateStore::empty(&dir.path().join("face_db.json"), HashAlgorithm::Sha256);
        let mut enrolled = vec![0.0; 512];
        enrolled[0] = 1.0;
        enrolled[300] = 5.0;
        enroll::enroll(&mut store, "Alice", &[Embedding::new(enrolled)]).unwrap();
        let mut tracker =
            AttendanceTracker::open(&dir.path().join("attendance_log.csv"), Duration::from_secs(60))
                .unwrap();
        let mut k = kiosk();

        let f = frame(vec![face("a", Some(vec![1.0]))]);
        let reports = k.attendance_tick(&f, &store, &mut tracker, at(9, 0, 0)).unwrap();
        assert!(matches!(reports[0].status, FaceStatus::Unknown { .. }));
        assert!(tracker.log().read_records().unwrap().is_empty());
    }

    #[test]
    fn test_registration_collects_burst_and_enrolls() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TemplateStore::empty(&dir.path().join("face_db.json"), HashAlgorithm::Sha256);
        let mut k = kiosk();

        let mut turned = face("x", Some(vec![9.0, 9.0]));
        turned.face.landmarks.nose = (292.0, 250.0);
        let mut source = Frames(
            vec![
                frame(vec![face("a", Some(vec![0.0, 2.0])), face("b", Some(vec![5.0, 5.0]))]),
                frame(vec![turned]),
                frame(vec![face("a", Some(vec![2.0, 0.0]))]),
                frame(vec![face("a", Some(vec![7.0, 7.0]))]),
            ]
            .into_iter(),
        );

        let mut statuses = Vec::new();
        let template = run_registration(&mut source, &mut k, &mut store, "Bob", 2, |r| {
            statuses.push(r.status.clone())
        })
        .unwrap();

        assert_eq!(template.embedding.values, vec![1.0, 1.0]);
        assert!(store.name_exists("Bob"));
        assert_eq!(
            statuses,
            vec![
                FaceStatus::Sampled { count: 1, target: 2 },
                FaceStatus::Skipped,
                FaceStatus::Rejected(IntentReason::NotFacingCamera),
                FaceStatus::Sampled { count: 2, target: 2 },
            ]
        );
    }

    #[test]
    fn test_registration_fails_fast_on_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = setup(dir.path());
        let mut k = kiosk();
        let mut source = Frames(vec![frame(vec![face("a", Some(vec![1.0, 0.0]))])].into_iter());

        let err = run_registration(&mut source, &mut k, &mut store, "Alice", 1, |_| {}).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EnrollError>(),
            Some(EnrollError::DuplicateName(_))
        ));
        // No frame was consumed.
        assert!(source.next_frame().unwrap().is_some());
    }

    #[test]
    fn test_registration_errors_when_source_ends() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TemplateStore::empty(&dir.path().join("face_db.json"), HashAlgorithm::Sha256);
        let mut k = kiosk();
        let mut source = Frames(vec![frame(vec![face("a", Some(vec![1.0, 0.0]))])].into_iter());

        assert!(run_registration(&mut source, &mut k, &mut store, "Bob", 3, |_| {}).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_run_attendance_counts_punches() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut tracker) = setup(dir.path());
        let mut k = kiosk();
        let mut source = Frames(
            vec![
                frame(vec![face("a", Some(vec![1.0, 0.0]))]),
                frame(vec![]),
                frame(vec![face("a", Some(vec![1.0, 0.0]))]),
            ]
            .into_iter(),
        );

        let mut seen = 0;
        let summary = run_attendance(&mut source, &mut k, &store, &mut tracker, |_| seen += 1).unwrap();
        assert_eq!(summary, RunSummary { frames: 3, punches: 1 });
        assert_eq!(seen, 2);
    }
}
