//! Rendered-tree abstractions.
//!
//! The detector never talks to a browser directly. It consumes two
//! capabilities:
//!
//! - [`RenderedTree`]: a scoped query surface returning elements with their
//!   attributes, ancestry, bounding geometry and text.
//! - [`MutationSource`]: a subscription primitive delivering batched
//!   structural/attribute change records for a subtree.
//!
//! An in-page observer, a remote-debugging transport, or the in-process
//! [`MemoryTree`](crate::memory_tree::MemoryTree) can all implement them.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::Result;
use crate::events::KeyPrecision;
use crate::selector::{IgnoreList, Selector};

/// Bounding box in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    #[must_use]
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// One node of the rendered tree, without its relatives.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Node {
    /// Lowercase tag name.
    pub tag: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Position among the parent's element children.
    #[serde(default)]
    pub index: usize,
}

impl Node {
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into().to_ascii_lowercase(),
            attributes: BTreeMap::new(),
            index: 0,
        }
    }

    #[must_use]
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or("").split_ascii_whitespace()
    }

    #[must_use]
    pub fn has_class(&self, class: &str) -> bool {
        self.classes().any(|c| c == class)
    }
}

/// Borrowed view of a node plus its ancestor chain (nearest first).
#[derive(Debug, Clone, Copy)]
pub struct ElementRef<'a> {
    pub node: &'a Node,
    pub ancestors: &'a [Node],
}

impl<'a> ElementRef<'a> {
    #[must_use]
    pub fn new(node: &'a Node, ancestors: &'a [Node]) -> Self {
        Self { node, ancestors }
    }

    #[must_use]
    pub fn parent(&self) -> Option<ElementRef<'a>> {
        let (parent, rest) = self.ancestors.split_first()?;
        Some(ElementRef::new(parent, rest))
    }

    /// This element followed by each ancestor, nearest first.
    pub fn self_and_ancestors(&self) -> impl Iterator<Item = ElementRef<'a>> {
        std::iter::successors(Some(*self), ElementRef::parent)
    }

    /// `tag:index` segments from the outermost ancestor down to this node.
    #[must_use]
    pub fn structural_path(&self) -> String {
        let mut segments: Vec<String> = self
            .self_and_ancestors()
            .map(|el| format!("{}:{}", el.node.tag, el.node.index))
            .collect();
        segments.reverse();
        segments.join(">")
    }
}

/// A fully described element as returned by a query or a mutation record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Element {
    pub node: Node,
    /// Ancestor chain, nearest first.
    #[serde(default)]
    pub ancestors: Vec<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rect: Option<Rect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Element {
    #[must_use]
    pub fn new(node: Node, ancestors: Vec<Node>) -> Self {
        Self {
            node,
            ancestors,
            rect: None,
            text: None,
        }
    }

    #[must_use]
    pub fn with_rect(mut self, rect: Rect) -> Self {
        self.rect = Some(rect);
        self
    }

    #[must_use]
    pub fn as_ref(&self) -> ElementRef<'_> {
        ElementRef::new(&self.node, &self.ancestors)
    }

    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.node.attr(name)
    }

    /// First value of `name` on this element or its nearest ancestor.
    #[must_use]
    pub fn inherited_attr(&self, name: &str) -> Option<&str> {
        std::iter::once(&self.node)
            .chain(self.ancestors.iter())
            .find_map(|n| n.attr(name))
    }
}

/// One change record, shaped after the browser's native mutation records.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationRecord {
    /// Children were added to and/or removed from `parent`.
    ChildList {
        parent: Element,
        added: Vec<Element>,
        removed: Vec<Element>,
    },
    /// An attribute on `target` was set or removed.
    Attribute {
        target: Element,
        name: String,
        old_value: Option<String>,
        new_value: Option<String>,
    },
}

/// Records delivered together in one callback.
#[derive(Debug, Clone)]
pub struct MutationBatch {
    pub observed_at: Instant,
    pub records: Vec<MutationRecord>,
}

/// Callback receiving mutation batches.
pub type MutationSink = Arc<dyn Fn(MutationBatch) + Send + Sync>;

/// What a subscriber wants to observe.
#[derive(Clone)]
pub struct SubscribeRequest {
    /// Root of the observed subtree.
    pub scope: Selector,
    /// Sources may prune these at origin; the tap filters again regardless.
    pub ignore: IgnoreList,
}

impl fmt::Debug for SubscribeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeRequest")
            .field("scope", &self.scope)
            .field("ignore", &self.ignore)
            .finish()
    }
}

/// Guard for an active subscription. Dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    #[must_use]
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Subscription with nothing to detach.
    #[must_use]
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Detach now. Calling twice is a no-op.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Capability to subscribe to subtree changes.
pub trait MutationSource: Send + Sync {
    /// Start delivering batches for `request.scope` to `sink`.
    fn subscribe(&self, request: SubscribeRequest, sink: MutationSink) -> Result<Subscription>;
}

/// Scoped query surface over the rendered tree.
pub trait RenderedTree: Send + Sync {
    /// Elements matching `selector`, restricted to the subtree(s) matching
    /// `scope` when given, in document order.
    ///
    /// An empty result is not an error. `Err` means the tree itself could
    /// not be reached.
    fn query(
        &self,
        scope: Option<&Selector>,
        selector: &Selector,
    ) -> impl Future<Output = Result<Vec<Element>>> + Send;
}

impl<T: MutationSource + ?Sized> MutationSource for Arc<T> {
    fn subscribe(&self, request: SubscribeRequest, sink: MutationSink) -> Result<Subscription> {
        (**self).subscribe(request, sink)
    }
}

impl<T: RenderedTree + ?Sized> RenderedTree for Arc<T> {
    fn query(
        &self,
        scope: Option<&Selector>,
        selector: &Selector,
    ) -> impl Future<Output = Result<Vec<Element>>> + Send {
        (**self).query(scope, selector)
    }
}

/// A derived element identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementKey {
    pub key: String,
    pub precision: KeyPrecision,
}

/// Ordered list of id-carrying attributes used to derive element keys.
///
/// The first attribute present on the element wins; without any of them the
/// key falls back to the structural path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyStrategy {
    pub attributes: Vec<String>,
}

impl Default for KeyStrategy {
    fn default() -> Self {
        Self {
            attributes: [
                "data-pane-id",
                "data-window-id",
                "data-group-id",
                "data-testid",
                "id",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl KeyStrategy {
    #[must_use]
    pub fn new<I, S>(attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            attributes: attributes.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn key_for(&self, element: ElementRef<'_>) -> ElementKey {
        for name in &self.attributes {
            if let Some(value) = element.node.attr(name) {
                if !value.is_empty() {
                    return ElementKey {
                        key: format!("{}:{value}", element.node.tag),
                        precision: KeyPrecision::Stable,
                    };
                }
            }
        }
        ElementKey {
            key: element.structural_path(),
            precision: KeyPrecision::Structural,
        }
    }
}
