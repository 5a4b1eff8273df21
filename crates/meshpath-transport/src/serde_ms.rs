//! Serialize a [`Duration`] as integer milliseconds.
//!
//! Use with `#[serde(with = "meshpath_transport::serde_ms")]`.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Serialize as milliseconds.
///
/// # Errors
///
/// Propagates the serializer's error.
pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

/// Deserialize from milliseconds.
///
/// # Errors
///
/// Propagates the deserializer's error.
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}
