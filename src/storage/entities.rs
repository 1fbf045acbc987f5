use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a user as assigned by the chat network.
pub type UserId = i64;

/// How often progress notifications should be delivered to a user.
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotifyFreq {
    Hour,
    #[default]
    Day,
    Week,
    Off,
}

impl NotifyFreq {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "off" => Some(Self::Off),
            _ => None,
        }
    }

    /// Delay between two notifications. [NotifyFreq::Off] has no interval.
    pub fn interval(&self) -> Option<std::time::Duration> {
        let seconds = match self {
            Self::Hour => 60 * 60,
            Self::Day => 60 * 60 * 24,
            Self::Week => 60 * 60 * 24 * 7,
            Self::Off => return None,
        };
        Some(std::time::Duration::from_secs(seconds))
    }
}

/// Settings and accumulated progress of a single user.
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct UserProfileEntity {
    /// Hourly rate the user earns.
    pub rate: f64,
    /// Earnings target the user is working towards.
    pub goal: f64,
    #[serde(default)]
    pub earned: f64,
    #[serde(default)]
    pub notify: NotifyFreq,
}

/// A single committed chunk of worked time.
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct TimeRecordEntity {
    pub minutes: u32,
    pub earnings: f64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub logged_at: DateTime<Utc>,
}

/// Derived view of how far along a user is towards their goal.
#[derive(PartialEq, Debug, Clone)]
pub struct ProgressSnapshot {
    pub goal: f64,
    pub earned: f64,
    /// Whole percents, clamped to 100.
    pub percent: u8,
    /// Hours left to work at the current rate. Never negative.
    pub hours_left: f64,
}

impl UserProfileEntity {
    pub fn progress(&self) -> ProgressSnapshot {
        let percent = if self.goal > 0. {
            u8::min(100, (self.earned / self.goal * 100.) as u8)
        } else {
            0
        };
        let hours_left = if self.rate > 0. {
            f64::max(0., (self.goal - self.earned) / self.rate)
        } else {
            0.
        };
        ProgressSnapshot {
            goal: self.goal,
            earned: self.earned,
            percent,
            hours_left,
        }
    }
}
