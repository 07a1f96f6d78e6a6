//! Raw observation events: what the mutation tap and size probe record.
//!
//! Timestamps are offsets from the owning session's epoch so a recording
//! can be replayed through the classifier without any wall-clock context.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Kind of structural or attribute change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    NodeAdded,
    NodeRemoved,
    AttributeChanged,
}

impl MutationKind {
    /// True for added/removed (structural) mutations.
    #[must_use]
    pub fn is_structural(self) -> bool {
        matches!(self, Self::NodeAdded | Self::NodeRemoved)
    }

    /// The structural kind that undoes this one.
    #[must_use]
    pub fn opposite(self) -> Option<Self> {
        match self {
            Self::NodeAdded => Some(Self::NodeRemoved),
            Self::NodeRemoved => Some(Self::NodeAdded),
            Self::AttributeChanged => None,
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeAdded => write!(f, "added"),
            Self::NodeRemoved => write!(f, "removed"),
            Self::AttributeChanged => write!(f, "attr"),
        }
    }
}

/// How trustworthy an element key is across re-creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPrecision {
    /// Derived from a domain id attribute; survives element re-creation.
    #[default]
    Stable,
    /// Derived from the element's position in the tree.
    Structural,
}

/// A single observed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEvent {
    /// Arrival sequence number within the session.
    pub seq: u64,
    /// Offset from session start.
    #[serde(rename = "timestamp_ms", with = "duration_ms")]
    pub timestamp: Duration,
    pub kind: MutationKind,
    pub target_key: String,
    #[serde(default)]
    pub key_precision: KeyPrecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
}

impl MutationEvent {
    /// Structural event for `key`.
    #[must_use]
    pub fn node(seq: u64, timestamp: Duration, kind: MutationKind, key: impl Into<String>) -> Self {
        Self {
            seq,
            timestamp,
            kind,
            target_key: key.into(),
            key_precision: KeyPrecision::Stable,
            attribute: None,
            old_value: None,
            new_value: None,
        }
    }

    /// Attribute change on `key`.
    #[must_use]
    pub fn attribute(
        seq: u64,
        timestamp: Duration,
        key: impl Into<String>,
        attribute: impl Into<String>,
        old_value: Option<String>,
        new_value: Option<String>,
    ) -> Self {
        Self {
            seq,
            timestamp,
            kind: MutationKind::AttributeChanged,
            target_key: key.into(),
            key_precision: KeyPrecision::Stable,
            attribute: Some(attribute.into()),
            old_value,
            new_value,
        }
    }

    /// Whether an attribute event actually changed the value.
    #[must_use]
    pub fn changes_value(&self) -> bool {
        self.kind == MutationKind::AttributeChanged && self.old_value != self.new_value
    }
}

/// Geometry of one tracked element at one probe tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeSample {
    #[serde(rename = "timestamp_ms", with = "duration_ms")]
    pub timestamp: Duration,
    pub element_key: String,
    pub width: f64,
    pub height: f64,
}

impl SizeSample {
    #[must_use]
    pub fn new(timestamp: Duration, key: impl Into<String>, width: f64, height: f64) -> Self {
        Self {
            timestamp,
            element_key: key.into(),
            width,
            height,
        }
    }
}

/// Serialize a `Duration` as fractional milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_nanos() as f64 / 1_000_000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(deserializer)?;
        if !ms.is_finite() || ms < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "duration must be a non-negative number of milliseconds, got {ms}"
            )));
        }
        Ok(Duration::from_nanos((ms * 1_000_000.0).round() as u64))
    }
}
