//! Attendance vocabulary: actions, time-of-day periods and recorded events.

use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid attendance action {0:?} (expected \"check_in\" or \"check_out\")")]
pub struct InvalidAction(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceAction {
    CheckIn,
    CheckOut,
}

impl AttendanceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckIn => "check_in",
            Self::CheckOut => "check_out",
        }
    }
}

impl FromStr for AttendanceAction {
    type Err = InvalidAction;

    /// Strict parse: anything but the two canonical values is rejected.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "check_in" => Ok(Self::CheckIn),
            "check_out" => Ok(Self::CheckOut),
            other => Err(InvalidAction(other.to_string())),
        }
    }
}

impl fmt::Display for AttendanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named interval of the day, derived from an event's local hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimePeriod {
    /// [06:00, 12:00)
    Morning,
    /// [12:00, 13:00)
    Noon,
    /// [13:00, 18:00)
    Afternoon,
    /// [18:00, 06:00), night included
    Evening,
}

impl TimePeriod {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            6..=11 => Self::Morning,
            12 => Self::Noon,
            13..=17 => Self::Afternoon,
            _ => Self::Evening,
        }
    }

    pub fn from_timestamp(timestamp: &NaiveDateTime) -> Self {
        Self::from_hour(timestamp.hour())
    }

    /// Storage key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Morning => "morning",
            Self::Noon => "noon",
            Self::Afternoon => "afternoon",
            Self::Evening => "evening",
        }
    }

    /// Thai display label shown to staff.
    pub fn label_th(&self) -> &'static str {
        match self {
            Self::Morning => "เช้า",
            Self::Noon => "กลางวัน",
            Self::Afternoon => "บ่าย",
            Self::Evening => "เย็น/ค่ำ",
        }
    }
}

impl FromStr for TimePeriod {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "morning" => Ok(Self::Morning),
            "noon" => Ok(Self::Noon),
            "afternoon" => Ok(Self::Afternoon),
            "evening" => Ok(Self::Evening),
            other => Err(format!("unknown time period: {other}")),
        }
    }
}

/// One persisted check-in or check-out. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEvent {
    pub identity: String,
    pub action: AttendanceAction,
    pub score: f32,
    pub period: TimePeriod,
    /// Server-assigned local time.
    pub timestamp: NaiveDateTime,
}

/// Most recent action recorded for an identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LastAction {
    pub action: AttendanceAction,
    pub timestamp: NaiveDateTime,
}
