//! Millisecond timestamps.
//!
//! Entities carry timestamps as integer milliseconds since the Unix epoch. On
//! the wire they travel as ISO-8601 UTC strings; integer milliseconds are
//! accepted on input as well.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use std::fmt;

pub type Millis = i64;

pub fn now_millis() -> Millis {
    Utc::now().timestamp_millis()
}

/// Next modification time for an entity whose previous one was `previous`.
///
/// Strictly greater than `previous` even if the wall clock stalled or went
/// backwards.
pub fn next_modified(previous: Millis) -> Millis {
    now_millis().max(previous.saturating_add(1))
}

/// Whether `millis` maps to a calendar instant and so survives the ISO
/// rendering unchanged.
pub fn is_representable(millis: Millis) -> bool {
    Utc.timestamp_millis_opt(millis).single().is_some()
}

pub fn to_iso(millis: Millis) -> String {
    match Utc.timestamp_millis_opt(millis).single() {
        Some(value) => value.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => DateTime::<Utc>::UNIX_EPOCH.to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

pub fn parse_iso(input: &str) -> Option<Millis> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(value.with_timezone(&Utc).timestamp_millis());
    }

    trimmed.parse::<i64>().ok().filter(|value| is_representable(*value))
}

fn in_range<E: de::Error>(value: Millis) -> Result<Millis, E> {
    if is_representable(value) {
        Ok(value)
    } else {
        Err(E::custom(format!("timestamp {value} out of range")))
    }
}

struct MillisVisitor;

impl<'de> Visitor<'de> for MillisVisitor {
    type Value = Millis;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an ISO-8601 timestamp or integer milliseconds")
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
        in_range(value)
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
        i64::try_from(value)
            .map_err(|_| E::custom("timestamp out of range"))
            .and_then(in_range)
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<Self::Value, E> {
        if value.is_finite() {
            in_range(value.trunc() as i64)
        } else {
            Err(E::custom("timestamp must be finite"))
        }
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
        parse_iso(value).ok_or_else(|| E::custom(format!("invalid timestamp '{value}'")))
    }
}

/// `#[serde(with = "t8d_core::time::iso")]` for required timestamps.
pub mod iso {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Millis, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&to_iso(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Millis, D::Error> {
        deserializer.deserialize_any(MillisVisitor)
    }
}

/// `#[serde(with = "t8d_core::time::iso_opt")]` for nullable timestamps.
pub mod iso_opt {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<Millis>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_str(&to_iso(*value)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Millis>, D::Error> {
        struct OptionVisitor;

        impl<'de> Visitor<'de> for OptionVisitor {
            type Value = Option<Millis>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("null, an ISO-8601 timestamp or integer milliseconds")
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }

            fn visit_some<D: Deserializer<'de>>(
                self,
                deserializer: D,
            ) -> Result<Self::Value, D::Error> {
                deserializer.deserialize_any(MillisVisitor).map(Some)
            }
        }

        deserializer.deserialize_option(OptionVisitor)
    }
}
