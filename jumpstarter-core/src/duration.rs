//! Go-format durations as used in lease specs and policy rules.
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, time};

/// A duration serialized in the format accepted by Go's
/// `time.ParseDuration()`, e.g. `"30m"`, `"1h30m"`, `"500ms"`.
///
/// Lease durations are always non-negative, so this is a thin wrapper around
/// [`std::time::Duration`] that only adds the wire format.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Duration(time::Duration);

/// Errors returned by the [`FromStr`] implementation for [`Duration`].
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    /// An invalid or missing unit. Units must be one of 'ns', 'us', 'ms',
    /// 's', 'm', or 'h'.
    #[error("invalid or missing unit: expected one of 'ns', 'us', 'ms', 's', 'm', or 'h'")]
    InvalidUnit,

    /// Negative durations are not meaningful for leases.
    #[error("negative durations are not supported")]
    Negative,

    /// The number associated with a given unit was invalid.
    #[error("invalid floating-point number: {}", .0)]
    NotANumber(#[from] std::num::ParseFloatError),
}

impl Duration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(time::Duration::from_secs(secs))
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(time::Duration::from_millis(millis))
    }

    pub fn as_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.0).unwrap_or(chrono::Duration::MAX)
    }
}

impl From<time::Duration> for Duration {
    fn from(duration: time::Duration) -> Self {
        Self(duration)
    }
}

impl From<Duration> for time::Duration {
    fn from(Duration(duration): Duration) -> Self {
        duration
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_zero() {
            return f.write_str("0s");
        }
        let mut secs = self.0.as_secs();
        let millis = self.0.subsec_millis();
        let hours = secs / 3600;
        secs %= 3600;
        let minutes = secs / 60;
        secs %= 60;
        if hours > 0 {
            write!(f, "{hours}h")?;
        }
        if minutes > 0 {
            write!(f, "{minutes}m")?;
        }
        if secs > 0 {
            write!(f, "{secs}s")?;
        }
        if millis > 0 {
            write!(f, "{millis}ms")?;
        }
        Ok(())
    }
}

impl FromStr for Duration {
    type Err = ParseError;

    fn from_str(mut s: &str) -> Result<Self, Self::Err> {
        // Same grammar as Go's time.ParseDuration, minus the sign.
        const MINUTE: time::Duration = time::Duration::from_secs(60);

        if s.starts_with('-') {
            return Err(ParseError::Negative);
        }
        s = s.trim_start_matches('+');

        let mut total = time::Duration::from_secs(0);
        while !s.is_empty() && s != "0" {
            let unit_start = s.find(|c: char| c.is_alphabetic()).ok_or(ParseError::InvalidUnit)?;

            let (val, rest) = s.split_at(unit_start);
            let val = val.parse::<f64>()?;
            let unit = if let Some(next_numeric_start) = rest.find(|c: char| !c.is_alphabetic()) {
                let (unit, rest) = rest.split_at(next_numeric_start);
                s = rest;
                unit
            } else {
                s = "";
                rest
            };

            let base = match unit {
                "ns" => time::Duration::from_nanos(1),
                "us" | "\u{00b5}s" | "\u{03bc}s" => time::Duration::from_micros(1),
                "ms" => time::Duration::from_millis(1),
                "s" => time::Duration::from_secs(1),
                "m" => MINUTE,
                "h" => MINUTE * 60,
                _ => return Err(ParseError::InvalidUnit),
            };

            total += base.mul_f64(val);
        }

        Ok(Duration(total))
    }
}

impl Serialize for Duration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;
        impl de::Visitor<'_> for Visitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string in Go `time.Duration` format")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value.parse::<Duration>().map_err(de::Error::custom)
            }
        }
        deserializer.deserialize_str(Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_go_durations() {
        for (s, expected) in [
            ("0", time::Duration::ZERO),
            ("0s", time::Duration::ZERO),
            ("500ms", time::Duration::from_millis(500)),
            ("2s", time::Duration::from_secs(2)),
            ("30m", time::Duration::from_secs(30 * 60)),
            ("1h30m", time::Duration::from_secs(90 * 60)),
            ("1.5h", time::Duration::from_secs(90 * 60)),
        ] {
            assert_eq!(s.parse::<Duration>().unwrap(), Duration(expected), "{s}");
        }
    }

    #[test]
    fn rejects_bad_durations() {
        assert_eq!("-5m".parse::<Duration>(), Err(ParseError::Negative));
        assert_eq!("5".parse::<Duration>(), Err(ParseError::InvalidUnit));
        assert_eq!("5fortnights".parse::<Duration>(), Err(ParseError::InvalidUnit));
    }

    #[test]
    fn displays_compound_durations() {
        assert_eq!(Duration::from_secs(0).to_string(), "0s");
        assert_eq!(Duration::from_millis(500).to_string(), "500ms");
        assert_eq!(Duration::from_secs(5400).to_string(), "1h30m");
        assert_eq!(Duration::from_millis(2500).to_string(), "2s500ms");
    }

    #[test]
    fn serde_roundtrip() {
        let d: Duration = serde_json::from_str("\"30m\"").unwrap();
        assert_eq!(d, Duration::from_secs(1800));
        assert_eq!(serde_json::to_string(&d).unwrap(), "\"30m\"");
    }
}
