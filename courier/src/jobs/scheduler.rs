use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

use super::JobError;

/// Serde-friendly wrapper around [`cron::Schedule`], used for recurring jobs.
///
/// Accepts the 6/7-field format of the `cron` crate as well as the classic
/// 5-field form, which runs at second zero:
/// ```text
/// [sec]   min   hour   day_of_month   month   day_of_week   [year]
/// ```
#[derive(Debug, Clone)]
pub struct Schedule(cron::Schedule);

impl Schedule {
    /// The next occurrence strictly after `after`.
    pub fn next_after(&self, after: OffsetDateTime) -> Option<OffsetDateTime> {
        let after = DateTime::<Utc>::from_timestamp(after.unix_timestamp(), after.nanosecond())?;
        let next = self.0.after(&after).next()?;
        OffsetDateTime::from_unix_timestamp_nanos(next.timestamp_nanos_opt()? as i128).ok()
    }

    pub fn pattern(&self) -> String {
        self.0.to_string()
    }
}

impl FromStr for Schedule {
    type Err = JobError;

    fn from_str(pattern: &str) -> Result<Self, Self::Err> {
        let pattern = pattern.trim();
        let expanded = if pattern.split_whitespace().count() == 5 {
            format!("0 {pattern}")
        } else {
            pattern.to_string()
        };

        let schedule = cron::Schedule::from_str(&expanded)
            .map_err(|e| JobError::InvalidCron(format!("{pattern}: {e}")))?;

        match schedule.upcoming(Utc).next() {
            Some(next) => tracing::debug!("Cron schedule '{}'. Next occurrence: {}", pattern, next),
            None => {
                tracing::warn!("Cron schedule '{}' will never fire", pattern);
                return Err(JobError::InvalidCron(format!("{pattern}: never fires")));
            }
        }

        Ok(Self(schedule))
    }
}

impl TryFrom<&str> for Schedule {
    type Error = JobError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_string() == other.0.to_string()
    }
}

impl Serialize for Schedule {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Schedule {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl std::ops::Deref for Schedule {
    type Target = cron::Schedule;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn five_field_patterns_run_at_second_zero() {
        let schedule: Schedule = "30 9 * * *".parse().unwrap();
        let next = schedule
            .next_after(datetime!(2024-03-01 08:00:00 UTC))
            .unwrap();
        assert_eq!(next, datetime!(2024-03-01 09:30:00 UTC));

        let after = schedule.next_after(next).unwrap();
        assert_eq!(after, datetime!(2024-03-02 09:30:00 UTC));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            "every tuesday".parse::<Schedule>(),
            Err(JobError::InvalidCron(_))
        ));
    }

    #[test]
    fn serde_uses_pattern_string() {
        let schedule: Schedule = "0 0 12 * * *".parse().unwrap();
        let json = serde_json::to_string(&schedule).unwrap();
        let back: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schedule);
    }
}
