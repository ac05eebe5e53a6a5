//! Serde helpers for `Duration` fields written as (fractional) seconds.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Longest accepted duration: 100 years. Deadlines are computed as
/// `Instant + Duration`, which panics on overflow.
pub const MAX_SECONDS: f64 = 100.0 * 365.0 * 86_400.0;

pub fn parse(secs: f64) -> Result<Duration, String> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("{secs} is not a non-negative number of seconds"));
    }
    if secs > MAX_SECONDS {
        return Err(format!("{secs} seconds exceeds the limit of {MAX_SECONDS} (100 years)"));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_f64(d.as_secs_f64())
}

pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(d)?;
    parse(secs).map_err(D::Error::custom)
}

pub mod option {
    use super::*;

    pub fn serialize<S>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match d {
            Some(dur) => s.serialize_some(&dur.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<f64> = Option::deserialize(d)?;
        opt.map(parse).transpose().map_err(D::Error::custom)
    }
}
