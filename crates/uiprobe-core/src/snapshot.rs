//! Point-in-time entity snapshots shared by both sides of a consistency check.
//!
//! A snapshot is a set of panes, windows and groups. Order is irrelevant;
//! [`Snapshot::normalized`] sorts by id so two snapshots can be diffed
//! deterministically.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Pane,
    Window,
    Group,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pane => write!(f, "pane"),
            Self::Window => write!(f, "window"),
            Self::Group => write!(f, "group"),
        }
    }
}

/// Position and size in terminal cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Geometry {
    #[serde(deserialize_with = "cell")]
    pub x: i64,
    #[serde(deserialize_with = "cell")]
    pub y: i64,
    #[serde(deserialize_with = "cell")]
    pub width: i64,
    #[serde(deserialize_with = "cell")]
    pub height: i64,
}

impl Geometry {
    #[must_use]
    pub fn new(x: i64, y: i64, width: i64, height: i64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Accept integers, floats (rounded) and numeric strings.
fn cell<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
    }
    let value = match Raw::deserialize(deserializer)? {
        Raw::Int(v) => return Ok(v),
        Raw::Float(v) => v,
        Raw::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom(format!("not a cell count: {s:?}")))?,
    };
    coerce_cell(value).ok_or_else(|| serde::de::Error::custom(format!("not a cell count: {value}")))
}

/// Round a possibly fractional cell count to an integer.
#[must_use]
pub fn coerce_cell(value: f64) -> Option<i64> {
    value.is_finite().then(|| value.round() as i64)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_digest: Option<String>,
}

impl Entity {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            id: id.into(),
            kind,
            parent: None,
            geometry: None,
            active: false,
            content_digest: None,
        }
    }

    #[must_use]
    pub fn pane(id: impl Into<String>) -> Self {
        Self::new(id, EntityKind::Pane)
    }

    #[must_use]
    pub fn window(id: impl Into<String>) -> Self {
        Self::new(id, EntityKind::Window)
    }

    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    #[must_use]
    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    #[must_use]
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    #[must_use]
    pub fn with_content(mut self, text: &str) -> Self {
        self.content_digest = Some(content_digest(text));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub entities: Vec<Entity>,
}

impl Snapshot {
    #[must_use]
    pub fn new(entities: Vec<Entity>) -> Self {
        Self { entities }
    }

    /// Entities stably sorted by id.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.entities.sort_by(|a, b| a.id.cmp(&b.id));
        self
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }

    /// The active entity under `parent` (`None` for top-level entities).
    #[must_use]
    pub fn active_in(&self, parent: Option<&str>) -> Option<&Entity> {
        self.entities
            .iter()
            .find(|e| e.active && e.parent.as_deref() == parent)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// SHA-256 of pane text with trailing whitespace and trailing blank lines
/// removed, hex encoded.
#[must_use]
pub fn content_digest(text: &str) -> String {
    let mut lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    let mut hasher = Sha256::new();
    hasher.update(lines.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

/// A source of snapshots.
pub trait Snapshotter: Send + Sync {
    fn capture(&self) -> impl Future<Output = Result<Snapshot>> + Send;
}

impl<T: Snapshotter + ?Sized> Snapshotter for std::sync::Arc<T> {
    fn capture(&self) -> impl Future<Output = Result<Snapshot>> + Send {
        (**self).capture()
    }
}

/// Snapshot read from a JSON file on every capture.
///
/// Lets an external driver (a browser harness dumping the rendered state)
/// feed the oracle; each retry re-reads the file.
#[derive(Debug, Clone)]
pub struct JsonFileSnapshotter {
    path: PathBuf,
}

impl JsonFileSnapshotter {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Snapshotter for JsonFileSnapshotter {
    async fn capture(&self) -> Result<Snapshot> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {e}", self.path.display()),
            ))
        })?;
        Snapshot::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_coerces_numbers_and_strings() {
        let g: Geometry =
            serde_json::from_str(r#"{"x": 0, "y": "3", "width": 79.6, "height": " 24 "}"#).unwrap();
        assert_eq!(g, Geometry::new(0, 3, 80, 24));
        assert!(serde_json::from_str::<Geometry>(r#"{"x": "a", "y": 0, "width": 1, "height": 1}"#).is_err());
    }

    #[test]
    fn normalized_sorts_by_id() {
        let snap = Snapshot::new(vec![Entity::pane("%2"), Entity::pane("%0"), Entity::window("@0")])
            .normalized();
        let ids: Vec<_> = snap.entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["%0", "%2", "@0"]);
    }

    #[test]
    fn active_in_uses_parent_scope() {
        let snap = Snapshot::new(vec![
            Entity::window("@0").with_active(true),
            Entity::pane("%0").with_parent("@0"),
            Entity::pane("%1").with_parent("@0").with_active(true),
        ]);
        assert_eq!(snap.active_in(Some("@0")).map(|e| e.id.as_str()), Some("%1"));
        assert_eq!(snap.active_in(None).map(|e| e.id.as_str()), Some("@0"));
        assert!(snap.active_in(Some("@9")).is_none());
    }

    #[test]
    fn digest_ignores_trailing_blank_space() {
        assert_eq!(content_digest("$ ls\nfoo  \n\n\n"), content_digest("$ ls\nfoo"));
        assert_ne!(content_digest("a"), content_digest("b"));
        assert_eq!(content_digest("").len(), 64);
    }

    #[test]
    fn entity_json_omits_empty_fields() {
        let json = serde_json::to_value(Entity::pane("%0")).unwrap();
        assert_eq!(json["kind"], "pane");
        assert!(json.get("geometry").is_none());
        let back: Entity = serde_json::from_str(r#"{"id": "%0", "kind": "pane"}"#).unwrap();
        assert!(!back.active);
    }

    #[tokio::test]
    async fn file_snapshotter_rereads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rendered.json");
        std::fs::write(&path, r#"{"entities": []}"#).unwrap();
        let source = JsonFileSnapshotter::new(&path);
        assert!(source.capture().await.unwrap().is_empty());
        std::fs::write(&path, r#"{"entities": [{"id": "%0", "kind": "pane"}]}"#).unwrap();
        assert_eq!(source.capture().await.unwrap().len(), 1);

        let missing = JsonFileSnapshotter::new(dir.path().join("nope.json"));
        assert!(matches!(missing.capture().await, Err(Error::Io(_))));
    }
}
