//! Per-user IN/OUT attendance state with a cooldown, backed by a CSV log
//! holding one row per user per day.

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";

/// Column names, in order.
pub const LOG_HEADER: [&str; 4] = ["Name", "Date", "Punch In Time", "Punch Out Time"];

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("attendance log I/O error: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("attendance log format error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchAction {
    PunchIn,
    PunchOut,
}

impl PunchAction {
    fn resulting_phase(self) -> Phase {
        match self {
            PunchAction::PunchIn => Phase::In,
            PunchAction::PunchOut => Phase::Out,
        }
    }
}

impl fmt::Display for PunchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PunchAction::PunchIn => "PUNCH IN",
            PunchAction::PunchOut => "PUNCH OUT",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchOutcome {
    Success(PunchAction),
    Wait { remaining_secs: u64 },
}

impl PunchOutcome {
    /// Short on-screen status string.
    pub fn status_text(&self) -> String {
        match self {
            PunchOutcome::Success(action) => action.to_string(),
            PunchOutcome::Wait { remaining_secs } => format!("Wait {remaining_secs}s"),
        }
    }
}

/// One row of the attendance log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Punch In Time")]
    pub punch_in: Option<String>,
    #[serde(rename = "Punch Out Time")]
    pub punch_out: Option<String>,
}

impl AttendanceRecord {
    fn has_punch_out(&self) -> bool {
        self.punch_out.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    fn has_punch_in(&self) -> bool {
        self.punch_in.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

/// The CSV file itself. Every update reads, patches and rewrites the whole file.
#[derive(Debug, Clone)]
pub struct AttendanceLog {
    path: PathBuf,
}

impl AttendanceLog {
    /// Open the log, creating it with just a header row if absent.
    pub fn open(path: &Path) -> Result<Self, AttendanceError> {
        let log = Self {
            path: path.to_path_buf(),
        };
        if !path.exists() {
            log.write_records(&[])?;
            tracing::info!(path = %path.display(), "created attendance log");
        }
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows may stop short; missing punch columns read as empty.
    pub fn read_records(&self) -> Result<Vec<AttendanceRecord>, AttendanceError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&self.path)?;
        let records = reader
            .deserialize()
            .collect::<Result<Vec<AttendanceRecord>, _>>()?;
        Ok(records)
    }

    /// Rewrite the whole log via a temp file and rename.
    pub fn write_records(&self, records: &[AttendanceRecord]) -> Result<(), AttendanceError> {
        let io_err = |source| AttendanceError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let tmp_path = self.path.with_extension("csv.part");
        let file = std::fs::File::create(&tmp_path).map_err(io_err)?;
        write_csv(file, records)?;
        std::fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        Ok(())
    }

    /// Write the header and every row to `out` as CSV.
    pub fn export<W: Write>(&self, out: W) -> Result<(), AttendanceError> {
        let records = self.read_records()?;
        write_csv(out, &records)
    }

    /// Apply one punch to the (name, date) row of `at`.
    ///
    /// A punch-in keeps the day's first arrival time and clears any punch-out,
    /// so the row always reflects the current phase. A punch-out records the
    /// latest departure. Missing rows are created in both cases.
    pub fn record_punch(
        &self,
        name: &str,
        at: NaiveDateTime,
        action: PunchAction,
    ) -> Result<(), AttendanceError> {
        let mut records = self.read_records()?;
        let date = at.format(DATE_FORMAT).to_string();
        let time = at.format(TIME_FORMAT).to_string();

        let idx = match records.iter().position(|r| r.name == name && r.date == date) {
            Some(idx) => idx,
            None => {
                records.push(AttendanceRecord {
                    name: name.to_string(),
                    date: date.clone(),
                    punch_in: None,
                    punch_out: None,
                });
                records.len() - 1
            }
        };

        let row = &mut records[idx];
        match action {
            PunchAction::PunchIn => {
                if !row.has_punch_in() {
                    row.punch_in = Some(time);
                }
                row.punch_out = None;
            }
            PunchAction::PunchOut => row.punch_out = Some(time),
        }

        self.write_records(&records)?;
        tracing::info!(name, %date, %action, "attendance logged");
        Ok(())
    }
}

fn write_csv<W: Write>(out: W, records: &[AttendanceRecord]) -> Result<(), AttendanceError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(out);
    writer.write_record(LOG_HEADER)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush().map_err(|e| AttendanceError::Csv(e.into()))?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct UserState {
    phase: Phase,
    /// `None` means outside any cooldown window.
    last_action: Option<NaiveDateTime>,
}

impl Default for UserState {
    fn default() -> Self {
        Self {
            phase: Phase::Out,
            last_action: None,
        }
    }
}

/// Attendance state machine: one OUT/IN phase per user plus the cooldown.
pub struct AttendanceTracker {
    log: AttendanceLog,
    cooldown: Duration,
    users: HashMap<String, UserState>,
}

impl AttendanceTracker {
    /// Open the log and rebuild each user's phase from their most recent row.
    ///
    /// The last-action instant is not recovered, so nobody is held in cooldown
    /// right after a restart. A log that cannot be parsed is an error: every
    /// later punch would have to rewrite it.
    pub fn open(log_path: &Path, cooldown: Duration) -> Result<Self, AttendanceError> {
        let log = AttendanceLog::open(log_path)?;
        let records = log.read_records().map_err(|e| {
            tracing::error!(path = %log_path.display(), error = %e, "attendance log unreadable");
            e
        })?;
        let users = replay(&records);
        tracing::info!(users = users.len(), cooldown_secs = cooldown.as_secs(), "attendance state restored");
        Ok(Self {
            log,
            cooldown,
            users,
        })
    }

    pub fn log(&self) -> &AttendanceLog {
        &self.log
    }

    /// Current phase; users never seen are OUT.
    pub fn phase(&self, name: &str) -> Phase {
        self.users.get(name).copied().unwrap_or_default().phase
    }

    /// Whole seconds (rounded up) until `name` may punch again, if blocked.
    pub fn cooldown_remaining_at(&self, name: &str, now: NaiveDateTime) -> Option<u64> {
        let last = self.users.get(name)?.last_action?;
        let cooldown_ms = i64::try_from(self.cooldown.as_millis()).unwrap_or(i64::MAX);
        let elapsed_ms = (now - last).num_milliseconds();
        if elapsed_ms >= cooldown_ms {
            return None;
        }
        let remaining_ms = (cooldown_ms - elapsed_ms).min(cooldown_ms);
        Some(((remaining_ms + 999) / 1000).max(1) as u64)
    }

    pub fn process_punch(&mut self, name: &str) -> Result<PunchOutcome, AttendanceError> {
        self.process_punch_at(name, Local::now().naive_local())
    }

    /// Attempt a punch for `name` at `now`.
    ///
    /// The log is written before the in-memory state changes; if the write
    /// fails the error is returned and the user's state is untouched.
    pub fn process_punch_at(
        &mut self,
        name: &str,
        now: NaiveDateTime,
    ) -> Result<PunchOutcome, AttendanceError> {
        if let Some(remaining_secs) = self.cooldown_remaining_at(name, now) {
            tracing::debug!(name, remaining_secs, "punch ignored: cooldown");
            return Ok(PunchOutcome::Wait { remaining_secs });
        }

        let action = match self.phase(name) {
            Phase::Out => PunchAction::PunchIn,
            Phase::In => PunchAction::PunchOut,
        };

        self.log.record_punch(name, now, action)?;

        self.users.insert(
            name.to_string(),
            UserState {
                phase: action.resulting_phase(),
                last_action: Some(now),
            },
        );
        Ok(PunchOutcome::Success(action))
    }
}

/// Seed phases from the most recent row per user (latest date; later rows
/// win ties).
fn replay(records: &[AttendanceRecord]) -> HashMap<String, UserState> {
    let mut latest: HashMap<&str, &AttendanceRecord> = HashMap::new();
    for record in records {
        match latest.get(record.name.as_str()) {
            Some(prev) if prev.date > record.date => {}
            _ => {
                latest.insert(record.name.as_str(), record);
            }
        }
    }

    latest
        .into_iter()
        .map(|(name, record)| {
            let phase = if record.has_punch_out() {
                Phase::Out
            } else {
                Phase::In
            };
            (
                name.to_string(),
                UserState {
                    phase,
                    last_action: None,
                },
            )
        })
        .collect()
}
