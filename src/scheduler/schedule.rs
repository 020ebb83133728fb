use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid time of day '{0}', expected HH:MM")]
    InvalidTime(String),
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("failed to spawn scheduler worker: {0}")]
    Spawn(String),
}

/// A wall-clock time of day in UTC at which a job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyTime {
    hour: u32,
    minute: u32,
}

pub const DEFAULT_SETTLEMENT_TIME: DailyTime = DailyTime { hour: 23, minute: 30 };
pub const DEFAULT_REMINDER_TIME: DailyTime = DailyTime { hour: 9, minute: 0 };

impl DailyTime {
    pub fn new(hour: u32, minute: u32) -> Result<Self, ScheduleError> {
        if hour > 23 || minute > 59 {
            return Err(ScheduleError::InvalidTime(format!("{hour:02}:{minute:02}")));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    /// The first firing strictly after `after`.
    ///
    /// ```
    /// use chrono::{TimeZone, Utc};
    /// use settlement_engine::scheduler::DailyTime;
    ///
    /// let at = "23:30".parse::<DailyTime>().unwrap();
    /// let noon = Utc.with_ymd_and_hms(2024, 9, 15, 12, 0, 0).unwrap();
    /// assert_eq!(at.next_run(noon), Utc.with_ymd_and_hms(2024, 9, 15, 23, 30, 0).unwrap());
    /// ```
    pub fn next_run(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let time = NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN);
        let today = Utc.from_utc_datetime(&after.date_naive().and_time(time));
        if today > after {
            today
        } else {
            today + Duration::days(1)
        }
    }
}

impl FromStr for DailyTime {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ScheduleError::InvalidTime(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(invalid)?;
        let hour = h.parse().map_err(|_| invalid())?;
        let minute = m.parse().map_err(|_| invalid())?;
        Self::new(hour, minute).map_err(|_| invalid())
    }
}

impl fmt::Display for DailyTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}
