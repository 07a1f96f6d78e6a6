//! Mutation tap: buffers structural and attribute changes for a subtree.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::time::Instant;
use tracing::debug;

use crate::dom::{
    Element, KeyStrategy, MutationBatch, MutationRecord, MutationSource, SubscribeRequest,
    Subscription,
};
use crate::error::Result;
use crate::events::{MutationEvent, MutationKind};
use crate::selector::{IgnoreList, Selector};

/// What the tap observes and how it names elements.
#[derive(Debug, Clone)]
pub struct TapConfig {
    pub scope: Selector,
    pub ignore: IgnoreList,
    pub keys: KeyStrategy,
}

struct TapShared {
    epoch: Instant,
    ignore: IgnoreList,
    keys: KeyStrategy,
    stopped: AtomicBool,
    buffer: Mutex<Vec<MutationEvent>>,
}

impl TapShared {
    fn intake(&self, batch: MutationBatch) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let timestamp = batch.observed_at.saturating_duration_since(self.epoch);
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        // Re-check under the lock so nothing lands after stop() drained.
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        for record in batch.records {
            match record {
                MutationRecord::ChildList {
                    parent,
                    added,
                    removed,
                } => {
                    if self.ignore.ignores(parent.as_ref()) {
                        continue;
                    }
                    let changes = removed
                        .iter()
                        .map(|el| (MutationKind::NodeRemoved, el))
                        .chain(added.iter().map(|el| (MutationKind::NodeAdded, el)));
                    for (kind, element) in changes {
                        if let Some(event) = self.node_event(&buffer, timestamp, kind, element) {
                            buffer.push(event);
                        }
                    }
                }
                MutationRecord::Attribute {
                    target,
                    name,
                    old_value,
                    new_value,
                } => {
                    if self.ignore.ignores(target.as_ref()) {
                        continue;
                    }
                    let key = self.keys.key_for(target.as_ref());
                    let mut event = MutationEvent::attribute(
                        buffer.len() as u64,
                        timestamp,
                        key.key,
                        name,
                        old_value,
                        new_value,
                    );
                    event.key_precision = key.precision;
                    buffer.push(event);
                }
            }
        }
    }

    fn node_event(
        &self,
        buffer: &[MutationEvent],
        timestamp: std::time::Duration,
        kind: MutationKind,
        element: &Element,
    ) -> Option<MutationEvent> {
        if self.ignore.ignores(element.as_ref()) {
            return None;
        }
        let key = self.keys.key_for(element.as_ref());
        let mut event = MutationEvent::node(buffer.len() as u64, timestamp, kind, key.key);
        event.key_precision = key.precision;
        Some(event)
    }
}

/// Live subscription that turns mutation records into [`MutationEvent`]s.
///
/// Ignored elements, and everything nested under them, never reach the
/// buffer. Events keep arrival order; every record of one delivery shares the
/// delivery's timestamp.
pub struct MutationTap {
    shared: Arc<TapShared>,
    subscription: Option<Subscription>,
}

impl MutationTap {
    pub fn start<S>(source: &S, config: TapConfig, epoch: Instant) -> Result<Self>
    where
        S: MutationSource + ?Sized,
    {
        let shared = Arc::new(TapShared {
            epoch,
            ignore: config.ignore.clone(),
            keys: config.keys,
            stopped: AtomicBool::new(false),
            buffer: Mutex::new(Vec::new()),
        });
        let sink_shared = Arc::clone(&shared);
        let subscription = source.subscribe(
            SubscribeRequest {
                scope: config.scope.clone(),
                ignore: config.ignore,
            },
            Arc::new(move |batch: MutationBatch| sink_shared.intake(batch)),
        )?;
        debug!(scope = %config.scope, "mutation tap started");
        Ok(Self {
            shared,
            subscription: Some(subscription),
        })
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::Acquire)
    }

    /// Stop buffering and return the events in arrival order.
    ///
    /// A second call returns an empty vector.
    pub fn stop(&mut self) -> Vec<MutationEvent> {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        let events = mem::take(
            &mut *self
                .shared
                .buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        debug!(events = events.len(), "mutation tap stopped");
        events
    }
}

impl Drop for MutationTap {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for MutationTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationTap")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
