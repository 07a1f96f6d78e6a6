//! In-process rendered tree.
//!
//! `MemoryTree` implements both [`RenderedTree`] and [`MutationSource`]. It
//! backs recordings driven from Rust, the integration tests, and replays of
//! captured page states. Every structural or attribute change is delivered to
//! subscribers as a [`MutationBatch`]; changes made inside [`MemoryTree::batch`]
//! arrive together in one batch, as a browser observer would deliver them.

use std::collections::BTreeMap;
use std::fmt;
use std::future::{Future, ready};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::time::Instant;
use tracing::trace;

use crate::dom::{
    Element, MutationBatch, MutationRecord, MutationSink, MutationSource, Node, Rect,
    RenderedTree, SubscribeRequest, Subscription,
};
use crate::error::{Error, Result, UnavailableError};
use crate::selector::Selector;

/// Handle to a node in a [`MemoryTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct TreeNode {
    tag: String,
    attributes: BTreeMap<String, String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    rect: Option<Rect>,
    text: Option<String>,
    attached: bool,
}

impl TreeNode {
    fn new(tag: &str, parent: Option<NodeId>) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attributes: BTreeMap::new(),
            parent,
            children: Vec::new(),
            rect: None,
            text: None,
            attached: true,
        }
    }
}

struct Subscriber {
    id: u64,
    request: SubscribeRequest,
    sink: MutationSink,
}

struct TreeState {
    nodes: Vec<TreeNode>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    reachable: bool,
    pending: Option<Vec<MutationRecord>>,
}

impl TreeState {
    fn node(&self, id: NodeId) -> Result<&TreeNode> {
        self.nodes
            .get(id.0)
            .filter(|n| n.attached)
            .ok_or_else(|| Error::Runtime(format!("{id} is not attached to the tree")))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut TreeNode> {
        self.nodes
            .get_mut(id.0)
            .filter(|n| n.attached)
            .ok_or_else(|| Error::Runtime(format!("{id} is not attached to the tree")))
    }

    fn plain(&self, id: NodeId) -> Node {
        let node = &self.nodes[id.0];
        let index = node
            .parent
            .and_then(|p| self.nodes[p.0].children.iter().position(|c| *c == id))
            .unwrap_or(0);
        Node {
            tag: node.tag.clone(),
            attributes: node.attributes.clone(),
            index,
        }
    }

    fn element(&self, id: NodeId) -> Element {
        let mut ancestors = Vec::new();
        let mut current = self.nodes[id.0].parent;
        while let Some(parent) = current {
            ancestors.push(self.plain(parent));
            current = self.nodes[parent.0].parent;
        }
        let node = &self.nodes[id.0];
        Element {
            node: self.plain(id),
            ancestors,
            rect: node.rect,
            text: node.text.clone(),
        }
    }

    fn document_order(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![NodeId(0)];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id.0].children.iter().rev().copied());
        }
        order
    }

    fn detach_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = &mut self.nodes[current.0];
            node.attached = false;
            stack.extend(node.children.iter().copied());
        }
    }
}

/// Thread-safe in-memory element tree rooted at `<body>`.
#[derive(Clone)]
pub struct MemoryTree {
    inner: Arc<Mutex<TreeState>>,
}

impl Default for MemoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryTree")
            .field("nodes", &state.nodes.iter().filter(|n| n.attached).count())
            .field("subscribers", &state.subscribers.len())
            .field("reachable", &state.reachable)
            .finish()
    }
}

impl MemoryTree {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TreeState {
                nodes: vec![TreeNode::new("body", None)],
                subscribers: Vec::new(),
                next_subscriber: 0,
                reachable: true,
                pending: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TreeState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The `<body>` node.
    #[must_use]
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Append a new element as the last child of `parent`.
    pub fn append<I, K, V>(&self, parent: NodeId, tag: &str, attributes: I) -> Result<NodeId>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut state = self.lock();
        state.node(parent)?;
        let id = NodeId(state.nodes.len());
        let mut node = TreeNode::new(tag, Some(parent));
        node.attributes = attributes
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        state.nodes.push(node);
        state.node_mut(parent)?.children.push(id);
        let record = MutationRecord::ChildList {
            parent: state.element(parent),
            added: vec![state.element(id)],
            removed: Vec::new(),
        };
        self.emit(state, record);
        Ok(id)
    }

    /// Detach `id` and its subtree.
    pub fn remove(&self, id: NodeId) -> Result<()> {
        let mut state = self.lock();
        let parent = state
            .node(id)?
            .parent
            .ok_or_else(|| Error::Runtime("the root node cannot be removed".into()))?;
        let removed = state.element(id);
        state.node_mut(parent)?.children.retain(|c| *c != id);
        state.detach_subtree(id);
        let record = MutationRecord::ChildList {
            parent: state.element(parent),
            added: Vec::new(),
            removed: vec![removed],
        };
        self.emit(state, record);
        Ok(())
    }

    pub fn set_attribute(&self, id: NodeId, name: &str, value: impl Into<String>) -> Result<()> {
        let mut state = self.lock();
        let value = value.into();
        let old_value = state
            .node_mut(id)?
            .attributes
            .insert(name.to_string(), value.clone());
        let record = MutationRecord::Attribute {
            target: state.element(id),
            name: name.to_string(),
            old_value,
            new_value: Some(value),
        };
        self.emit(state, record);
        Ok(())
    }

    pub fn remove_attribute(&self, id: NodeId, name: &str) -> Result<()> {
        let mut state = self.lock();
        let Some(old_value) = state.node_mut(id)?.attributes.remove(name) else {
            return Ok(());
        };
        let record = MutationRecord::Attribute {
            target: state.element(id),
            name: name.to_string(),
            old_value: Some(old_value),
            new_value: None,
        };
        self.emit(state, record);
        Ok(())
    }

    /// Update layout geometry. Layout changes produce no mutation record.
    pub fn set_rect(&self, id: NodeId, rect: Rect) -> Result<()> {
        self.lock().node_mut(id)?.rect = Some(rect);
        Ok(())
    }

    pub fn set_text(&self, id: NodeId, text: impl Into<String>) -> Result<()> {
        self.lock().node_mut(id)?.text = Some(text.into());
        Ok(())
    }

    /// Run `f` and deliver every change it makes as one batch.
    pub fn batch<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        let outermost = {
            let mut state = self.lock();
            if state.pending.is_some() {
                false
            } else {
                state.pending = Some(Vec::new());
                true
            }
        };
        let out = f(self);
        if outermost {
            let mut state = self.lock();
            let records = state.pending.take().unwrap_or_default();
            self.dispatch(state, records);
        }
        out
    }

    /// Simulate the page becoming unreachable (or reachable again).
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Current view of an attached node.
    #[must_use]
    pub fn element(&self, id: NodeId) -> Option<Element> {
        let state = self.lock();
        state.node(id).ok()?;
        Some(state.element(id))
    }

    /// First attached node matching `selector`, in document order.
    #[must_use]
    pub fn find(&self, selector: &Selector) -> Option<NodeId> {
        let state = self.lock();
        state
            .document_order()
            .into_iter()
            .find(|id| selector.matches(state.element(*id).as_ref()))
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn emit(&self, mut state: MutexGuard<'_, TreeState>, record: MutationRecord) {
        if let Some(pending) = state.pending.as_mut() {
            pending.push(record);
            return;
        }
        self.dispatch(state, vec![record]);
    }

    fn dispatch(&self, state: MutexGuard<'_, TreeState>, records: Vec<MutationRecord>) {
        if records.is_empty() {
            return;
        }
        let deliveries: Vec<(MutationSink, Vec<MutationRecord>)> = state
            .subscribers
            .iter()
            .filter_map(|sub| {
                let scoped: Vec<MutationRecord> = records
                    .iter()
                    .filter(|r| in_scope(&sub.request.scope, r))
                    .cloned()
                    .collect();
                (!scoped.is_empty()).then(|| (Arc::clone(&sub.sink), scoped))
            })
            .collect();
        drop(state);

        let observed_at = Instant::now();
        for (sink, records) in deliveries {
            trace!(records = records.len(), "delivering mutation batch");
            sink(MutationBatch {
                observed_at,
                records,
            });
        }
    }

    fn query_now(&self, scope: Option<&Selector>, selector: &Selector) -> Result<Vec<Element>> {
        let state = self.lock();
        if !state.reachable {
            return Err(UnavailableError::TreeUnreachable("memory tree marked unreachable".into()).into());
        }
        Ok(state
            .document_order()
            .into_iter()
            .map(|id| state.element(id))
            .filter(|el| {
                let view = el.as_ref();
                selector.matches(view)
                    && scope.is_none_or(|s| view.parent().is_some_and(|p| s.matches_within(p)))
            })
            .collect())
    }
}

fn in_scope(scope: &Selector, record: &MutationRecord) -> bool {
    let anchor = match record {
        MutationRecord::ChildList { parent, .. } => parent,
        MutationRecord::Attribute { target, .. } => target,
    };
    scope.matches_within(anchor.as_ref())
}

impl MutationSource for MemoryTree {
    fn subscribe(&self, request: SubscribeRequest, sink: MutationSink) -> Result<Subscription> {
        let mut state = self.lock();
        if !state.reachable {
            return Err(UnavailableError::TreeUnreachable("memory tree marked unreachable".into()).into());
        }
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.push(Subscriber { id, request, sink });
        drop(state);

        let weak: Weak<Mutex<TreeState>> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .subscribers
                    .retain(|s| s.id != id);
            }
        }))
    }
}

impl RenderedTree for MemoryTree {
    fn query(
        &self,
        scope: Option<&Selector>,
        selector: &Selector,
    ) -> impl Future<Output = Result<Vec<Element>>> + Send {
        ready(self.query_now(scope, selector))
    }
}
