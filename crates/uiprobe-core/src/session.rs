//! Glitch session: one start/stop observation window.
//!
//! A session composes a [`MutationTap`] and a [`SizeProbe`] under a shared
//! epoch, then classifies both timelines when stopped.
//!
//! ```ignore
//! let mut session = GlitchSession::new(Arc::clone(&tree), Arc::clone(&tree));
//! session.start(GlitchOptions::new().with_size_jump_threshold(40.0))?;
//! split_pane().await;
//! let report = session.stop();
//! report.check(&GlitchBudget::default())?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::classifier::{GlitchReport, GlitchThresholds, classify};
use crate::config::GlitchConfig;
use crate::dom::{KeyStrategy, MutationSource, RenderedTree};
use crate::error::{Result, SelectorError};
use crate::mutation_tap::{MutationTap, TapConfig};
use crate::selector::{IgnoreList, Selector};
use crate::size_probe::{DEFAULT_SAMPLE_INTERVAL, ProbeConfig, SizeProbe};

/// Per-operation observation options.
#[derive(Debug, Clone)]
pub struct GlitchOptions {
    /// Root of the observed subtree.
    pub scope: Selector,
    pub ignore: IgnoreList,
    /// Elements whose geometry is sampled.
    pub tracked: Selector,
    pub sample_interval: Duration,
    pub thresholds: GlitchThresholds,
    pub keys: KeyStrategy,
}

impl Default for GlitchOptions {
    fn default() -> Self {
        Self {
            scope: Selector::tag("body"),
            ignore: IgnoreList::new(),
            tracked: Selector::has_attribute("data-pane-id"),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            thresholds: GlitchThresholds::default(),
            keys: KeyStrategy::default(),
        }
    }
}

impl GlitchOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build options from the `[glitch]` config section.
    pub fn from_config(config: &GlitchConfig) -> Result<Self> {
        Ok(Self {
            scope: config.scope.parse()?,
            ignore: IgnoreList::from_selectors(&config.ignore)?,
            tracked: config.tracked.parse()?,
            sample_interval: Duration::from_millis(config.sample_interval_ms),
            thresholds: config.thresholds.clone(),
            keys: KeyStrategy::new(config.key_attributes.iter().cloned()),
        })
    }

    #[must_use]
    pub fn with_scope(mut self, scope: Selector) -> Self {
        self.scope = scope;
        self
    }

    /// Add ignore selectors on top of the current list.
    pub fn with_ignore_selectors<I, S>(mut self, selectors: I) -> std::result::Result<Self, SelectorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ignore = self.ignore.extend(IgnoreList::from_selectors(selectors)?);
        Ok(self)
    }

    #[must_use]
    pub fn with_ignore(mut self, ignore: IgnoreList) -> Self {
        self.ignore = self.ignore.extend(ignore);
        self
    }

    /// Per-operation size jump threshold in pixels.
    #[must_use]
    pub fn with_size_jump_threshold(mut self, px: f64) -> Self {
        self.thresholds.size_jump_px = px;
        self
    }

    #[must_use]
    pub fn with_tracked(mut self, tracked: Selector) -> Self {
        self.tracked = tracked;
        self
    }

    #[must_use]
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    #[must_use]
    pub fn with_thresholds(mut self, thresholds: GlitchThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    #[must_use]
    pub fn with_keys(mut self, keys: KeyStrategy) -> Self {
        self.keys = keys;
        self
    }
}

struct ActiveRun {
    tap: MutationTap,
    probe: SizeProbe,
    started: Instant,
    thresholds: GlitchThresholds,
}

/// Lifecycle wrapper over the tap and the probe.
pub struct GlitchSession<S: ?Sized, T: ?Sized> {
    source: Arc<S>,
    tree: Arc<T>,
    active: Option<ActiveRun>,
    last_thresholds: GlitchThresholds,
}

impl<S, T> GlitchSession<S, T>
where
    S: MutationSource + ?Sized,
    T: RenderedTree + ?Sized + 'static,
{
    /// Create an idle session.
    pub fn new(source: Arc<S>, tree: Arc<T>) -> Self {
        Self {
            source,
            tree,
            active: None,
            last_thresholds: GlitchThresholds::default(),
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Begin observing. A run already in progress is stopped and discarded.
    pub fn start(&mut self, options: GlitchOptions) -> Result<()> {
        if let Some(previous) = self.active.take() {
            warn!("glitch session restarted while running; discarding previous window");
            drop(previous);
        }
        let GlitchOptions {
            scope,
            ignore,
            tracked,
            sample_interval,
            thresholds,
            keys,
        } = options;

        let epoch = Instant::now();
        let tap = MutationTap::start(
            &*self.source,
            TapConfig {
                scope: scope.clone(),
                ignore: ignore.clone(),
                keys: keys.clone(),
            },
            epoch,
        )?;
        let probe = SizeProbe::start(
            Arc::clone(&self.tree),
            ProbeConfig {
                scope: Some(scope.clone()),
                tracked,
                interval: sample_interval,
                keys,
                ignore,
            },
            epoch,
        )?;
        info!(scope = %scope, "glitch session started");
        self.last_thresholds = thresholds.clone();
        self.active = Some(ActiveRun {
            tap,
            probe,
            started: epoch,
            thresholds,
        });
        Ok(())
    }

    /// Tear down and classify. Never fails; an idle session yields an empty
    /// report with zero duration.
    pub fn stop(&mut self) -> GlitchReport {
        let Some(mut run) = self.active.take() else {
            return GlitchReport::empty(self.last_thresholds.clone());
        };
        let mutations = run.tap.stop();
        let samples = run.probe.stop();
        let duration = run.started.elapsed();
        let report = classify(mutations, samples, &run.thresholds, duration);
        let s = &report.summary;
        info!(
            node_flickers = s.node_flickers,
            attr_churn_events = s.attr_churn_events,
            size_jumps = s.size_jumps,
            elapsed_ms = duration.as_millis() as u64,
            "glitch session stopped"
        );
        report
    }

    /// Run `operation` inside one observation window.
    pub async fn observe<F, Fut, R>(
        &mut self,
        options: GlitchOptions,
        operation: F,
    ) -> Result<(R, GlitchReport)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        self.start(options)?;
        let out = operation().await;
        Ok((out, self.stop()))
    }
}

impl<S: ?Sized, T: ?Sized> std::fmt::Debug for GlitchSession<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlitchSession")
            .field("active", &self.active.is_some())
            .finish_non_exhaustive()
    }
}
