use anyhow::{Context, Result};
use kiosk_core::{HashAlgorithm, IntentConfig, LivenessConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Kiosk configuration.
///
/// Defaults can be overridden by a TOML file named in `KIOSK_CONFIG`, and
/// `KIOSK_*` environment variables override both.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Camera index handed to the capture process.
    pub camera_index: u32,
    /// Capture frame width in pixels.
    pub frame_width: u32,
    /// Capture frame height in pixels.
    pub frame_height: u32,
    /// Directory holding the template store and the attendance log.
    pub data_dir: PathBuf,
    /// Template store file (default: `{data_dir}/face_db.json`).
    pub store_path: Option<PathBuf>,
    /// Attendance log file (default: `{data_dir}/attendance_log.csv`).
    pub log_path: Option<PathBuf>,
    /// Detection confidence floor.
    pub min_confidence: f32,
    /// Minimum face box width in pixels.
    pub min_face_width: f32,
    /// Fraction of frame width covered by the guide box.
    pub roi_center_pct: f32,
    /// Nose ratio lower bound (exclusive).
    pub gaze_low: f32,
    /// Nose ratio upper bound (exclusive).
    pub gaze_high: f32,
    /// Maximum Euclidean distance for a positive match. Lower = stricter.
    pub recognition_threshold: f32,
    /// Minimum seconds between two accepted punches by the same user.
    pub cooldown_secs: u64,
    /// Digest used to derive user keys from names.
    pub hash_algorithm: String,
    /// Samples averaged into one enrolled template.
    pub samples_per_enroll: usize,
    /// Whether the liveness challenge gates each punch.
    pub liveness_enabled: bool,
    /// Seconds allowed to complete a liveness challenge.
    pub liveness_timeout_secs: u64,
    /// Eye aspect ratio below which eyes count as closed.
    pub blink_ear_threshold: f32,
    /// Frames in the blink detection window.
    pub blink_frames: usize,
    /// Nose ratio deviation that counts as a head turn.
    pub head_pose_threshold: f32,
    /// Missed frames before a liveness challenge fails.
    pub liveness_max_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        let intent = IntentConfig::default();
        let liveness = LivenessConfig::default();
        Self {
            camera_index: 0,
            frame_width: 640,
            frame_height: 480,
            data_dir: default_data_dir(),
            store_path: None,
            log_path: None,
            min_confidence: intent.min_confidence,
            min_face_width: intent.min_face_width,
            roi_center_pct: intent.roi_center_pct,
            gaze_low: intent.gaze_low,
            gaze_high: intent.gaze_high,
            recognition_threshold: 0.60,
            cooldown_secs: 60,
            hash_algorithm: HashAlgorithm::default().to_string(),
            samples_per_enroll: 5,
            liveness_enabled: false,
            liveness_timeout_secs: liveness.timeout.as_secs(),
            blink_ear_threshold: liveness.blink_ear_threshold,
            blink_frames: liveness.blink_frames,
            head_pose_threshold: liveness.head_pose_threshold,
            liveness_max_attempts: liveness.max_attempts,
        }
    }
}

impl Config {
    /// Load the optional TOML file, then apply `KIOSK_*` environment overrides.
    pub fn from_env() -> Result<Self> {
        let base = match std::env::var("KIOSK_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        let config = base.with_env_overrides();
        config.hash()?;
        Ok(config)
    }

    /// Parse a TOML config file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    fn with_env_overrides(self) -> Self {
        Self {
            camera_index: env_parse("KIOSK_CAMERA_INDEX", self.camera_index),
            frame_width: env_parse("KIOSK_FRAME_WIDTH", self.frame_width),
            frame_height: env_parse("KIOSK_FRAME_HEIGHT", self.frame_height),
            data_dir: std::env::var("KIOSK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(self.data_dir),
            store_path: std::env::var("KIOSK_STORE_PATH")
                .map(PathBuf::from)
                .ok()
                .or(self.store_path),
            log_path: std::env::var("KIOSK_LOG_PATH")
                .map(PathBuf::from)
                .ok()
                .or(self.log_path),
            min_confidence: env_parse("KIOSK_MIN_CONFIDENCE", self.min_confidence),
            min_face_width: env_parse("KIOSK_MIN_FACE_WIDTH", self.min_face_width),
            roi_center_pct: env_parse("KIOSK_ROI_CENTER_PCT", self.roi_center_pct),
            gaze_low: env_parse("KIOSK_GAZE_LOW", self.gaze_low),
            gaze_high: env_parse("KIOSK_GAZE_HIGH", self.gaze_high),
            recognition_threshold: env_parse(
                "KIOSK_RECOGNITION_THRESHOLD",
                self.recognition_threshold,
            ),
            cooldown_secs: env_parse("KIOSK_COOLDOWN_SECS", self.cooldown_secs),
            hash_algorithm: std::env::var("KIOSK_HASH_ALGORITHM")
                .or_else(|_| std::env::var("HASH_ALGORITHM"))
                .unwrap_or(self.hash_algorithm),
            samples_per_enroll: env_parse("KIOSK_SAMPLES_PER_ENROLL", self.samples_per_enroll),
            liveness_enabled: std::env::var("KIOSK_LIVENESS_ENABLED")
                .map(|v| v != "0")
                .unwrap_or(self.liveness_enabled),
            liveness_timeout_secs: env_parse(
                "KIOSK_LIVENESS_TIMEOUT_SECS",
                self.liveness_timeout_secs,
            ),
            blink_ear_threshold: env_parse("KIOSK_BLINK_EAR_THRESHOLD", self.blink_ear_threshold),
            blink_frames: env_parse("KIOSK_BLINK_FRAMES", self.blink_frames),
            head_pose_threshold: env_parse("KIOSK_HEAD_POSE_THRESHOLD", self.head_pose_threshold),
            liveness_max_attempts: env_parse(
                "KIOSK_LIVENESS_MAX_ATTEMPTS",
                self.liveness_max_attempts,
            ),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("face_db.json"))
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("attendance_log.csv"))
    }

    pub fn hash(&self) -> Result<HashAlgorithm> {
        Ok(self.hash_algorithm.parse()?)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn intent(&self) -> IntentConfig {
        IntentConfig {
            min_confidence: self.min_confidence,
            min_face_width: self.min_face_width,
            roi_center_pct: self.roi_center_pct,
            gaze_low: self.gaze_low,
            gaze_high: self.gaze_high,
        }
    }

    pub fn liveness(&self) -> LivenessConfig {
        LivenessConfig {
            timeout: Duration::from_secs(self.liveness_timeout_secs),
            blink_ear_threshold: self.blink_ear_threshold,
            blink_frames: self.blink_frames,
            head_pose_threshold: self.head_pose_threshold,
            max_attempts: self.liveness_max_attempts,
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("kiosk")
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
