use crate::error::ScanError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(pub u64);

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ScanId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ScanId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn is_active(self) -> bool {
        matches!(self, ScanStatus::Queued | ScanStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Queued => "queued",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Insert payload for a new scan. The store assigns the id and start time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewScan {
    pub name: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: ScanId,
    pub name: String,
    pub target: String,
    pub status: ScanStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub report_path: Option<PathBuf>,
}

/// A lifecycle edge. `ScanRecord::apply` is the only place status changes, so
/// `end_time` is set exactly when the status is terminal and `report_path`
/// exactly when it is `completed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Start,
    Complete { report_path: PathBuf },
    Fail,
    Cancel,
}

impl Transition {
    pub fn action(&self) -> &'static str {
        match self {
            Transition::Start => "start",
            Transition::Complete { .. } => "complete",
            Transition::Fail => "fail",
            Transition::Cancel => "cancel",
        }
    }

    fn allowed_from(&self, status: ScanStatus) -> bool {
        match self {
            Transition::Start => status == ScanStatus::Queued,
            Transition::Complete { .. } => status == ScanStatus::Running,
            Transition::Fail | Transition::Cancel => status.is_active(),
        }
    }
}

impl ScanRecord {
    pub fn queued(id: ScanId, scan: NewScan, start_time: OffsetDateTime) -> Self {
        Self {
            id,
            name: scan.name,
            target: scan.target,
            status: ScanStatus::Queued,
            start_time,
            end_time: None,
            report_path: None,
        }
    }

    pub fn apply(&mut self, transition: Transition, at: OffsetDateTime) -> Result<(), ScanError> {
        if !transition.allowed_from(self.status) {
            return Err(ScanError::InvalidTransition {
                id: self.id,
                from: self.status,
                action: transition.action(),
            });
        }

        match transition {
            Transition::Start => {
                self.status = ScanStatus::Running;
            }
            Transition::Complete { report_path } => {
                self.status = ScanStatus::Completed;
                self.end_time = Some(at);
                self.report_path = Some(report_path);
            }
            Transition::Fail => {
                self.status = ScanStatus::Failed;
                self.end_time = Some(at);
            }
            Transition::Cancel => {
                self.status = ScanStatus::Cancelled;
                self.end_time = Some(at);
            }
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn duration(&self) -> Option<time::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }

    pub fn snapshot(&self) -> ScanStatusSnapshot {
        ScanStatusSnapshot {
            id: self.id,
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanStatusSnapshot {
    pub id: ScanId,
    pub status: ScanStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
}
