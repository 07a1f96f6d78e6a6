//! Rendered-side snapshot: the same entity shape as the tmux snapshot, read
//! from the rendered tree.
//!
//! Entity ids come from data attributes the UI stamps on its elements
//! (`data-pane-id="%3"`, `data-window-id="@1"`), so both snapshots share one
//! id space. Geometry is read either from cell attributes or from bounding
//! rects divided by the cell size, relative to the scope's origin.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dom::{Element, Rect, RenderedTree};
use crate::error::Result;
use crate::selector::Selector;
use crate::snapshot::{Entity, EntityKind, Geometry, Snapshot, Snapshotter, coerce_cell, content_digest};

/// Where pane geometry comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GeometryMode {
    /// Cell coordinates stamped on the element.
    Attributes {
        x: String,
        y: String,
        width: String,
        height: String,
    },
    /// Bounding rect in pixels divided by the cell size.
    Rect { cell_width: f64, cell_height: f64 },
}

impl Default for GeometryMode {
    fn default() -> Self {
        Self::Attributes {
            x: "data-x".into(),
            y: "data-y".into(),
            width: "data-cols".into(),
            height: "data-rows".into(),
        }
    }
}

/// DOM conventions of the rendering application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomSnapshotConfig {
    pub scope: String,
    pub pane_selector: String,
    pub pane_id_attribute: String,
    pub window_selector: String,
    pub window_id_attribute: String,
    pub group_selector: String,
    pub group_id_attribute: String,
    pub group_parent_attribute: String,
    pub active_class: String,
    pub active_attribute: String,
    pub geometry: GeometryMode,
    /// Digest pane text for the `content` comparison.
    pub content: bool,
}

impl Default for DomSnapshotConfig {
    fn default() -> Self {
        Self {
            scope: "body".into(),
            pane_selector: "[data-pane-id]".into(),
            pane_id_attribute: "data-pane-id".into(),
            window_selector: "[data-window-id]".into(),
            window_id_attribute: "data-window-id".into(),
            group_selector: "[data-group-id]".into(),
            group_id_attribute: "data-group-id".into(),
            group_parent_attribute: "data-parent-pane".into(),
            active_class: "active".into(),
            active_attribute: "data-active".into(),
            geometry: GeometryMode::default(),
            content: false,
        }
    }
}

/// Captures the rendered snapshot from a [`RenderedTree`].
#[derive(Debug)]
pub struct DomSnapshotter<T: ?Sized> {
    tree: Arc<T>,
    scope: Selector,
    panes: Selector,
    windows: Selector,
    groups: Selector,
    config: DomSnapshotConfig,
}

impl<T: RenderedTree + ?Sized> DomSnapshotter<T> {
    pub fn new(tree: Arc<T>, config: DomSnapshotConfig) -> Result<Self> {
        Ok(Self {
            tree,
            scope: config.scope.parse()?,
            panes: config.pane_selector.parse()?,
            windows: config.window_selector.parse()?,
            groups: config.group_selector.parse()?,
            config,
        })
    }

    fn is_active(&self, element: &Element) -> bool {
        element.node.has_class(&self.config.active_class)
            || element.attr(&self.config.active_attribute) == Some("true")
    }

    fn geometry(&self, element: &Element, origin: Rect) -> Option<Geometry> {
        match &self.config.geometry {
            GeometryMode::Attributes {
                x,
                y,
                width,
                height,
            } => {
                let read = |name: &str| -> Option<i64> {
                    coerce_cell(element.attr(name)?.trim().parse::<f64>().ok()?)
                };
                Some(Geometry::new(read(x)?, read(y)?, read(width)?, read(height)?))
            }
            GeometryMode::Rect {
                cell_width,
                cell_height,
            } => {
                if *cell_width <= 0.0 || *cell_height <= 0.0 {
                    return None;
                }
                let rect = element.rect?;
                Some(Geometry::new(
                    coerce_cell((rect.x - origin.x) / cell_width)?,
                    coerce_cell((rect.y - origin.y) / cell_height)?,
                    coerce_cell(rect.width / cell_width)?,
                    coerce_cell(rect.height / cell_height)?,
                ))
            }
        }
    }

    async fn scope_origin(&self) -> Result<Rect> {
        if !matches!(self.config.geometry, GeometryMode::Rect { .. }) {
            return Ok(Rect::default());
        }
        let roots = self.tree.query(None, &self.scope).await?;
        Ok(roots
            .first()
            .and_then(|root| root.rect)
            .unwrap_or_default())
    }

    async fn capture_snapshot(&self) -> Result<Snapshot> {
        let origin = self.scope_origin().await?;
        let scope = Some(&self.scope);
        let windows = self.tree.query(scope, &self.windows).await?;
        let panes = self.tree.query(scope, &self.panes).await?;
        let groups = self.tree.query(scope, &self.groups).await?;

        let mut seen = HashSet::new();
        let mut entities = Vec::new();
        let mut push = |entity: Entity| {
            if seen.insert(entity.id.clone()) {
                entities.push(entity);
            } else {
                warn!(id = %entity.id, "duplicate rendered entity ignored");
            }
        };

        for element in &windows {
            if self.panes.matches(element.as_ref()) {
                continue;
            }
            let Some(id) = element.attr(&self.config.window_id_attribute) else {
                continue;
            };
            push(Entity::new(id, EntityKind::Window).with_active(self.is_active(element)));
        }

        for element in &panes {
            let Some(id) = element.attr(&self.config.pane_id_attribute) else {
                continue;
            };
            let mut entity = Entity::pane(id).with_active(self.is_active(element));
            entity.parent = element
                .inherited_attr(&self.config.window_id_attribute)
                .map(str::to_string);
            entity.geometry = self.geometry(element, origin);
            if self.config.content {
                entity.content_digest = element.text.as_deref().map(content_digest);
            }
            push(entity);
        }

        for element in &groups {
            let Some(id) = element.attr(&self.config.group_id_attribute) else {
                continue;
            };
            let mut entity = Entity::new(id, EntityKind::Group).with_active(self.is_active(element));
            entity.parent = element
                .attr(&self.config.group_parent_attribute)
                .map(str::to_string);
            push(entity);
        }

        debug!(entities = entities.len(), "captured rendered snapshot");
        Ok(Snapshot::new(entities))
    }
}

impl<T: RenderedTree + ?Sized> Snapshotter for DomSnapshotter<T> {
    fn capture(&self) -> impl std::future::Future<Output = Result<Snapshot>> + Send {
        self.capture_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_tree::MemoryTree;

    fn layout(tree: &MemoryTree) {
        let tabs = tree.append(tree.root(), "nav", [("class", "tabs")]).unwrap();
        tree.append(tabs, "button", [("data-window-id", "@0"), ("class", "tab active")])
            .unwrap();
        tree.append(tabs, "button", [("data-window-id", "@1"), ("class", "tab")])
            .unwrap();
        let win = tree
            .append(tree.root(), "div", [("class", "window"), ("data-window-id", "@0")])
            .unwrap();
        tree.append(
            win,
            "div",
            [
                ("data-pane-id", "%0"),
                ("data-x", "0"),
                ("data-y", "0"),
                ("data-cols", "80"),
                ("data-rows", "24"),
                ("data-active", "true"),
            ],
        )
        .unwrap();
        tree.append(
            win,
            "div",
            [
                ("data-pane-id", "%1"),
                ("data-x", "81"),
                ("data-y", "0"),
                ("data-cols", "79"),
                ("data-rows", "24"),
            ],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn reads_windows_panes_and_active_markers() {
        let tree = Arc::new(MemoryTree::new());
        layout(&tree);
        let snap = DomSnapshotter::new(Arc::clone(&tree), DomSnapshotConfig::default())
            .unwrap()
            .capture()
            .await
            .unwrap();

        // The window container shares its id with the tab; first one wins.
        assert_eq!(snap.len(), 4);
        assert!(snap.get("@0").unwrap().active);
        assert!(!snap.get("@1").unwrap().active);
        let pane = snap.get("%1").unwrap();
        assert_eq!(pane.parent.as_deref(), Some("@0"));
        assert_eq!(pane.geometry, Some(Geometry::new(81, 0, 79, 24)));
        assert!(snap.get("%0").unwrap().active);
        assert_eq!(snap.active_in(Some("@0")).map(|e| e.id.as_str()), Some("%0"));
    }

    #[tokio::test]
    async fn rect_geometry_is_relative_to_scope() {
        let tree = Arc::new(MemoryTree::new());
        let app = tree.append(tree.root(), "main", [("id", "app")]).unwrap();
        tree.set_rect(app, Rect::new(10.0, 40.0, 1000.0, 800.0)).unwrap();
        let pane = tree.append(app, "div", [("data-pane-id", "%0")]).unwrap();
        tree.set_rect(pane, Rect::new(10.0 + 81.0 * 8.0, 40.0, 79.0 * 8.0, 24.0 * 16.0))
            .unwrap();

        let config = DomSnapshotConfig {
            scope: "#app".into(),
            geometry: GeometryMode::Rect {
                cell_width: 8.0,
                cell_height: 16.0,
            },
            ..DomSnapshotConfig::default()
        };
        let snap = DomSnapshotter::new(Arc::clone(&tree), config)
            .unwrap()
            .capture()
            .await
            .unwrap();
        assert_eq!(
            snap.get("%0").unwrap().geometry,
            Some(Geometry::new(81, 0, 79, 24))
        );
    }

    #[tokio::test]
    async fn missing_geometry_attributes_leave_geometry_empty() {
        let tree = Arc::new(MemoryTree::new());
        tree.append(tree.root(), "div", [("data-pane-id", "%0"), ("data-x", "1")])
            .unwrap();
        let snap = DomSnapshotter::new(Arc::clone(&tree), DomSnapshotConfig::default())
            .unwrap()
            .capture()
            .await
            .unwrap();
        assert_eq!(snap.get("%0").unwrap().geometry, None);
    }

    #[tokio::test]
    async fn groups_and_content() {
        let tree = Arc::new(MemoryTree::new());
        let pane = tree.append(tree.root(), "div", [("data-pane-id", "%2")]).unwrap();
        tree.set_text(pane, "$ echo hi\nhi\n\n").unwrap();
        tree.append(
            tree.root(),
            "div",
            [("data-group-id", "@5"), ("data-parent-pane", "%2")],
        )
        .unwrap();
        let config = DomSnapshotConfig {
            content: true,
            ..DomSnapshotConfig::default()
        };
        let snap = DomSnapshotter::new(Arc::clone(&tree), config)
            .unwrap()
            .capture()
            .await
            .unwrap();
        assert_eq!(
            snap.get("%2").unwrap().content_digest,
            Some(content_digest("$ echo hi\nhi"))
        );
        let group = snap.get("@5").unwrap();
        assert_eq!(group.kind, EntityKind::Group);
        assert_eq!(group.parent.as_deref(), Some("%2"));
    }

    #[test]
    fn invalid_selector_in_config_is_rejected() {
        let config = DomSnapshotConfig {
            pane_selector: "div >".into(),
            ..DomSnapshotConfig::default()
        };
        assert!(DomSnapshotter::new(Arc::new(MemoryTree::new()), config).is_err());
    }

    #[test]
    fn geometry_mode_toml_shape() {
        let config: DomSnapshotConfig =
            toml::from_str("[geometry]\nmode = \"rect\"\ncell_width = 9.0\ncell_height = 18.0\n")
                .unwrap();
        assert_eq!(
            config.geometry,
            GeometryMode::Rect {
                cell_width: 9.0,
                cell_height: 18.0
            }
        );
        assert_eq!(config.pane_selector, "[data-pane-id]");
    }
}
