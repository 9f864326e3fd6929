use ::time::OffsetDateTime;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::Display;
use std::ops::{Deref, Neg};
use std::str::FromStr;
use std::time::Duration;

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    cyborgtime::parse_duration(s).map_err(|e| format!("Invalid duration: {e}"))
}

/// A duration written in human-readable form in the configuration file, e.g. `30s` or `1d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedDuration {
    inner: Duration,
}

impl From<Duration> for ParsedDuration {
    fn from(inner: Duration) -> Self {
        ParsedDuration { inner }
    }
}

impl From<u64> for ParsedDuration {
    fn from(seconds: u64) -> Self {
        Duration::from_secs(seconds).into()
    }
}

impl Deref for ParsedDuration {
    type Target = Duration;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl FromStr for ParsedDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(ParsedDuration::from)
    }
}

impl Display for ParsedDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Largest unit that represents the duration exactly, so the value parses back unchanged
        let seconds = self.inner.as_secs();
        let (value, unit) = [(86400, "d"), (3600, "h"), (60, "m")]
            .into_iter()
            .find(|(unit_seconds, _)| seconds > 0 && seconds % unit_seconds == 0)
            .map_or((seconds, "s"), |(unit_seconds, unit)| {
                (seconds / unit_seconds, unit)
            });
        write!(f, "{value}{unit}")
    }
}

impl Serialize for ParsedDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ParsedDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Current time as unix milliseconds, the resolution of all stored timestamps.
pub fn now_millis() -> i64 {
    datetime_to_millis(OffsetDateTime::now_utc())
}

pub fn datetime_to_millis(datetime: OffsetDateTime) -> i64 {
    i64::try_from(datetime.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

/// Humanized distance between `millis` and now, e.g. `"in 3 days"` or `"2 hours ago"`.
pub fn humanize_relative_millis(millis: i64) -> String {
    let delta = time::Duration::milliseconds(millis.saturating_sub(now_millis()));
    let humanized = humanize_duration(delta);
    if delta.is_negative() {
        format!("{humanized} ago")
    } else {
        format!("in {humanized}")
    }
}

pub fn humanize_duration(mut duration: time::Duration) -> String {
    const SECONDS_IN_MINUTE: i64 = 60;
    const SECONDS_IN_HOUR: i64 = 3600;
    const SECONDS_IN_DAY: i64 = 86400;
    const SECONDS_IN_MONTH: i64 = 2_630_016; // Approximation (30.44 days)
    const SECONDS_IN_YEAR: i64 = 31_557_600; // Approximation (365.25 days)

    if duration.is_negative() {
        duration = duration.neg();
    }

    let mut remaining_seconds = duration.whole_seconds();

    let years = remaining_seconds / SECONDS_IN_YEAR;
    remaining_seconds %= SECONDS_IN_YEAR;
    let months = remaining_seconds / SECONDS_IN_MONTH;
    remaining_seconds %= SECONDS_IN_MONTH;
    let days = remaining_seconds / SECONDS_IN_DAY;
    remaining_seconds %= SECONDS_IN_DAY;
    let hours = remaining_seconds / SECONDS_IN_HOUR;
    remaining_seconds %= SECONDS_IN_HOUR;
    let minutes = remaining_seconds / SECONDS_IN_MINUTE;
    remaining_seconds %= SECONDS_IN_MINUTE;
    let seconds = remaining_seconds;

    let mut components = Vec::new();
    if years > 0 {
        components.push(format!(
            "{} year{}",
            years,
            if years > 1 { "s" } else { "" }
        ));
    }
    if months > 0 {
        components.push(format!(
            "{} month{}",
            months,
            if months > 1 { "s" } else { "" }
        ));
    }
    if days > 0 {
        components.push(format!("{} day{}", days, if days > 1 { "s" } else { "" }));
    }
    if hours > 0 {
        components.push(format!(
            "{} hour{}",
            hours,
            if hours > 1 { "s" } else { "" }
        ));
    }
    if minutes > 0 {
        components.push(format!(
            "{} minute{}",
            minutes,
            if minutes > 1 { "s" } else { "" }
        ));
    }
    if seconds > 0 || components.is_empty() {
        components.push(format!(
            "{} second{}",
            seconds,
            if seconds == 1 { "" } else { "s" }
        ));
    }

    components.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use time::macros::datetime;

    #[rstest]
    #[case(time::Duration::ZERO, "0 seconds")]
    #[case(std::time::Duration::from_secs(60).try_into().unwrap(), "1 minute")]
    #[case(std::time::Duration::from_secs(61).try_into().unwrap(), "1 minute, 1 second")]
    #[case(std::time::Duration::from_secs(60 * 60).try_into().unwrap(), "1 hour")]
    #[case(std::time::Duration::from_secs(60 * 60 * 24).try_into().unwrap(), "1 day")]
    #[case(std::time::Duration::from_secs_f64(60f64 * 60f64 * 24f64 * 30.44).try_into().unwrap(), "1 month")]
    #[case(std::time::Duration::from_secs_f64(60f64 * 60f64 * 24f64 * 365.25).try_into().unwrap(), "1 year")]
    #[case(std::time::Duration::from_nanos(1).try_into().unwrap(), "0 seconds")]
    #[case(std::time::Duration::from_secs_f64(62.321).try_into().unwrap(), "1 minute, 2 seconds")]
    #[case(std::time::Duration::from_secs_f64(60f64 * 60f64 * 24f64 * 90f64 * 1.1111).try_into().unwrap(), "3 months, 8 days, 16 hours, 17 minutes, 45 seconds")]
    fn test_humanize_duration(#[case] test_value: time::Duration, #[case] expected: &str) {
        let humanized = humanize_duration(test_value);
        assert_eq!(humanized, expected);
    }

    #[rstest]
    #[case("30s", Duration::from_secs(30))]
    #[case("1h", Duration::from_secs(3600))]
    #[case("1d", Duration::from_secs(86400))]
    #[case("2m", Duration::from_secs(120))]
    fn test_parsed_duration_from_str(#[case] input: &str, #[case] expected: Duration) {
        let parsed: ParsedDuration = input.parse().unwrap();
        assert_eq!(*parsed, expected);
    }

    #[test]
    fn test_parsed_duration_rejects_garbage() {
        assert!("soon".parse::<ParsedDuration>().is_err());
    }

    #[test]
    fn test_parsed_duration_display_parses_back() {
        let original = ParsedDuration::from(Duration::from_secs(86400 + 90));
        let reparsed: ParsedDuration = original.to_string().parse().unwrap();
        assert_eq!(original, reparsed);
    }

    #[rstest]
    #[case(Duration::from_secs(86400), "1d")]
    #[case(Duration::from_secs(3600), "1h")]
    #[case(Duration::from_secs(120), "2m")]
    #[case(Duration::from_secs(90), "90s")]
    #[case(Duration::ZERO, "0s")]
    fn test_parsed_duration_display(#[case] duration: Duration, #[case] expected: &str) {
        assert_eq!(ParsedDuration::from(duration).to_string(), expected);
    }

    #[test]
    fn test_millis_conversion() {
        let datetime = datetime!(2025-03-21 16:57:27.123 UTC);
        let millis = datetime_to_millis(datetime);
        assert_eq!(millis, 1_742_576_247_123);
    }
}
