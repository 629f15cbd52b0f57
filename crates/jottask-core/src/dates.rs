//! Calendar date and clock time helpers.
//!
//! Dates are stored and exchanged as `YYYY-MM-DD`, clock times as `HH:MM:SS`.
//! Timestamps use RFC 3339 through `time::serde::rfc3339`.

use time::macros::{format_description, time};
use time::{Date, Time};

use crate::CoreError;

/// Due time applied to dated tasks that carry no explicit time.
pub const DEFAULT_DUE_TIME: Time = time!(9:00);

/// Default delivery time for the daily summary email.
pub const DEFAULT_SUMMARY_TIME: Time = time!(8:00);

#[must_use]
pub fn format_date(value: Date) -> String {
    let format = format_description!("[year]-[month]-[day]");
    value.format(&format).unwrap_or_else(|_| value.to_string())
}

/// Parse a `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns a validation error when the value is not a valid date.
pub fn parse_date(raw: &str) -> Result<Date, CoreError> {
    let format = format_description!("[year]-[month]-[day]");
    Date::parse(raw.trim(), &format)
        .map_err(|err| CoreError::Validation(format!("invalid date `{raw}`: {err}")))
}

#[must_use]
pub fn format_clock(value: Time) -> String {
    let format = format_description!("[hour]:[minute]:[second]");
    value.format(&format).unwrap_or_else(|_| value.to_string())
}

/// Parse an `HH:MM:SS` or `HH:MM` clock time.
///
/// # Errors
/// Returns a validation error when the value matches neither layout.
pub fn parse_clock(raw: &str) -> Result<Time, CoreError> {
    let trimmed = raw.trim();
    let with_seconds = format_description!("[hour]:[minute]:[second]");
    if let Ok(parsed) = Time::parse(trimmed, &with_seconds) {
        return Ok(parsed);
    }
    let without_seconds = format_description!("[hour]:[minute]");
    Time::parse(trimmed, &without_seconds)
        .map_err(|err| CoreError::Validation(format!("invalid time `{raw}`: {err}")))
}

pub mod iso_date {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    /// # Errors
    /// Propagates serializer failures.
    pub fn serialize<S: Serializer>(value: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_date(*value))
    }

    /// # Errors
    /// Fails when the input is not a `YYYY-MM-DD` string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_date(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::Date;

        /// # Errors
        /// Propagates serializer failures.
        pub fn serialize<S: Serializer>(
            value: &Option<Date>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(date) => serializer.serialize_some(&super::super::format_date(*date)),
                None => serializer.serialize_none(),
            }
        }

        /// # Errors
        /// Fails when a present value is not a `YYYY-MM-DD` string.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Date>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.map(|value| super::super::parse_date(&value))
                .transpose()
                .map_err(serde::de::Error::custom)
        }
    }
}

pub mod clock_time {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Time;

    /// # Errors
    /// Propagates serializer failures.
    pub fn serialize<S: Serializer>(value: &Time, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_clock(*value))
    }

    /// # Errors
    /// Fails when the input is not an `HH:MM[:SS]` string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Time, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_clock(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::Time;

        /// # Errors
        /// Propagates serializer failures.
        pub fn serialize<S: Serializer>(
            value: &Option<Time>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(clock) => serializer.serialize_some(&super::super::format_clock(*clock)),
                None => serializer.serialize_none(),
            }
        }

        /// # Errors
        /// Fails when a present value is not an `HH:MM[:SS]` string.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Time>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.map(|value| super::super::parse_clock(&value))
                .transpose()
                .map_err(serde::de::Error::custom)
        }
    }
}
