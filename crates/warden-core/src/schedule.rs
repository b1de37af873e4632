use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

const DEFAULT_ONCE_DELAY_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleType {
    Once,
    Interval,
    Cron,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Interval => "interval",
            Self::Cron => "cron",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ScheduleError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(Self::Once),
            "interval" => Ok(Self::Interval),
            "cron" => Ok(Self::Cron),
            other => Err(ScheduleError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("unknown schedule type '{0}' (expected once, interval or cron)")]
    UnknownType(String),
    #[error("interval must be a positive number of seconds, got '{0}'")]
    InvalidInterval(String),
    #[error("once schedule must be an RFC 3339 time or a delay in seconds, got '{0}'")]
    InvalidOnce(String),
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
}

/// A parsed job schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
    inner: Inner,
}

#[derive(Debug, Clone)]
enum Inner {
    OnceAt(i64),
    OnceAfter(i64),
    Interval(i64),
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    pub fn parse(kind: ScheduleType, value: &str) -> Result<Self, ScheduleError> {
        let raw = value.trim();
        let inner = match kind {
            ScheduleType::Interval => {
                let secs: f64 = raw
                    .parse()
                    .map_err(|_| ScheduleError::InvalidInterval(raw.to_string()))?;
                let millis = (secs * 1000.0).round();
                // Sub-millisecond values would round to a job that is due on every tick.
                if !millis.is_finite() || millis < 1.0 {
                    return Err(ScheduleError::InvalidInterval(raw.to_string()));
                }
                Inner::Interval(millis as i64)
            }
            ScheduleType::Once => {
                if raw.is_empty() {
                    Inner::OnceAfter(DEFAULT_ONCE_DELAY_MS)
                } else if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
                    Inner::OnceAt(at.timestamp_millis())
                } else {
                    match raw.parse::<f64>() {
                        Ok(secs) if secs.is_finite() && secs >= 0.0 => {
                            Inner::OnceAfter((secs * 1000.0).round() as i64)
                        }
                        _ => return Err(ScheduleError::InvalidOnce(raw.to_string())),
                    }
                }
            }
            ScheduleType::Cron => {
                // Accept classic five-field crontab lines by pinning seconds to zero.
                let expr = if raw.split_whitespace().count() == 5 {
                    format!("0 {raw}")
                } else {
                    raw.to_string()
                };
                let schedule =
                    cron::Schedule::from_str(&expr).map_err(|err| ScheduleError::InvalidCron {
                        expr: raw.to_string(),
                        reason: err.to_string(),
                    })?;
                Inner::Cron(Box::new(schedule))
            }
        };
        Ok(Self { inner })
    }

    pub fn kind(&self) -> ScheduleType {
        match &self.inner {
            Inner::OnceAt(_) | Inner::OnceAfter(_) => ScheduleType::Once,
            Inner::Interval(_) => ScheduleType::Interval,
            Inner::Cron(_) => ScheduleType::Cron,
        }
    }

    /// When a freshly added job first becomes due.
    pub fn first_run_at(&self, now_ms: i64) -> Option<i64> {
        match &self.inner {
            Inner::OnceAt(at) => Some(*at),
            Inner::OnceAfter(delay) => Some(now_ms.saturating_add(*delay)),
            Inner::Interval(every_ms) => Some(now_ms.saturating_add(*every_ms)),
            Inner::Cron(schedule) => next_fire_after(schedule, now_ms),
        }
    }

    /// Next due time after a run completed at `completed_ms`; `None` disables the job.
    pub fn next_run_after(&self, completed_ms: i64) -> Option<i64> {
        match &self.inner {
            Inner::OnceAt(_) | Inner::OnceAfter(_) => None,
            Inner::Interval(every_ms) => Some(completed_ms.saturating_add(*every_ms)),
            Inner::Cron(schedule) => next_fire_after(schedule, completed_ms),
        }
    }
}

fn next_fire_after(schedule: &cron::Schedule, after_ms: i64) -> Option<i64> {
    let after: DateTime<Utc> = DateTime::from_timestamp_millis(after_ms)?;
    schedule
        .after(&after)
        .next()
        .map(|at| at.timestamp_millis())
}
