//! Size probe: fixed-rate geometry sampling of tracked elements.
//!
//! Sampling is independent of the mutation stream. A layout change that
//! produces no mutation record (a CSS transition, a flex reflow) still shows
//! up here.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::dom::{KeyStrategy, RenderedTree};
use crate::error::{Error, Result};
use crate::events::SizeSample;
use crate::selector::{IgnoreList, Selector};

/// Default tick, roughly one frame at 60 Hz.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub scope: Option<Selector>,
    pub tracked: Selector,
    pub interval: Duration,
    pub keys: KeyStrategy,
    pub ignore: IgnoreList,
}

struct ProbeShared {
    stopped: AtomicBool,
    samples: Mutex<Vec<SizeSample>>,
}

/// Periodic geometry sampler running as one tokio task.
pub struct SizeProbe {
    shared: Arc<ProbeShared>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SizeProbe {
    /// Spawn the sampling task on the current tokio runtime.
    pub fn start<T>(tree: Arc<T>, config: ProbeConfig, epoch: Instant) -> Result<Self>
    where
        T: RenderedTree + ?Sized + 'static,
    {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Runtime(format!("size probe needs a tokio runtime: {e}")))?;
        if config.interval.is_zero() {
            return Err(Error::Runtime("size probe interval must be non-zero".into()));
        }

        let shared = Arc::new(ProbeShared {
            stopped: AtomicBool::new(false),
            samples: Mutex::new(Vec::new()),
        });
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task_shared = Arc::clone(&shared);
        debug!(
            tracked = %config.tracked,
            interval_ms = config.interval.as_millis() as u64,
            "size probe started"
        );

        let task = runtime.spawn(async move {
            let ProbeConfig {
                scope,
                tracked,
                interval,
                keys,
                ignore,
            } = config;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                let queried = tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    queried = tree.query(scope.as_ref(), &tracked) => queried,
                };
                let timestamp = Instant::now().saturating_duration_since(epoch);
                let elements = match queried {
                    Ok(elements) => elements,
                    Err(err) => {
                        debug!(error = %err, "size probe tick skipped");
                        continue;
                    }
                };

                let mut samples = task_shared
                    .samples
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if task_shared.stopped.load(Ordering::Acquire) {
                    break;
                }
                for element in &elements {
                    let Some(rect) = element.rect else { continue };
                    if ignore.ignores(element.as_ref()) {
                        continue;
                    }
                    let key = keys.key_for(element.as_ref());
                    samples.push(SizeSample::new(timestamp, key.key, rect.width, rect.height));
                }
            }
        });

        Ok(Self {
            shared,
            stop_tx,
            task: Some(task),
        })
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::Acquire)
    }

    /// Cancel sampling and return everything collected so far.
    ///
    /// Never waits on a pending tick. A second call returns an empty vector.
    pub fn stop(&mut self) -> Vec<SizeSample> {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let samples = mem::take(
            &mut *self
                .shared
                .samples
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        debug!(samples = samples.len(), "size probe stopped");
        samples
    }
}

impl Drop for SizeProbe {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SizeProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeProbe")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::Rect;
    use crate::memory_tree::MemoryTree;

    fn config() -> ProbeConfig {
        ProbeConfig {
            scope: None,
            tracked: "[data-pane-id]".parse().unwrap(),
            interval: DEFAULT_SAMPLE_INTERVAL,
            keys: KeyStrategy::default(),
            ignore: IgnoreList::new(),
        }
    }

    #[test]
    fn start_without_runtime_errors() {
        let tree = Arc::new(MemoryTree::new());
        let err = SizeProbe::start(tree, config(), Instant::now()).unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn samples_at_fixed_rate() {
        let tree = Arc::new(MemoryTree::new());
        let pane = tree
            .append(tree.root(), "div", [("data-pane-id", "%0")])
            .unwrap();
        tree.set_rect(pane, Rect::new(0.0, 0.0, 640.0, 480.0)).unwrap();

        let mut probe = SizeProbe::start(Arc::clone(&tree), config(), Instant::now()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let samples = probe.stop();

        assert!(samples.len() >= 3, "got {} samples", samples.len());
        assert!(samples.iter().all(|s| s.element_key == "div:%0"));
        assert!(samples.iter().all(|s| (s.width - 640.0).abs() < f64::EPSILON));
        assert!(samples.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(probe.stop().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_element_is_omitted_from_tick() {
        let tree = Arc::new(MemoryTree::new());
        let a = tree
            .append(tree.root(), "div", [("data-pane-id", "%0")])
            .unwrap();
        let b = tree
            .append(tree.root(), "div", [("data-pane-id", "%1")])
            .unwrap();
        tree.set_rect(a, Rect::new(0.0, 0.0, 10.0, 10.0)).unwrap();
        tree.set_rect(b, Rect::new(10.0, 0.0, 10.0, 10.0)).unwrap();

        let mut probe = SizeProbe::start(Arc::clone(&tree), config(), Instant::now()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tree.remove(b).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let samples = probe.stop();

        let late_b = samples
            .iter()
            .filter(|s| s.element_key == "div:%1" && s.timestamp > Duration::from_millis(20))
            .count();
        assert_eq!(late_b, 0);
        assert!(samples
            .iter()
            .any(|s| s.element_key == "div:%0" && s.timestamp > Duration::from_millis(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_tree_degrades_to_no_data() {
        let tree = Arc::new(MemoryTree::new());
        let pane = tree
            .append(tree.root(), "div", [("data-pane-id", "%0")])
            .unwrap();
        tree.set_rect(pane, Rect::new(0.0, 0.0, 1.0, 1.0)).unwrap();
        tree.set_reachable(false);

        let mut probe = SizeProbe::start(Arc::clone(&tree), config(), Instant::now()).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(probe.stop().is_empty());
    }
}
