//! Consistency oracle: tmux state vs rendered state.
//!
//! Both sides are normalized and diffed field by field. The rendered side is
//! expected to lag behind tmux, so a mismatch triggers re-captures of the
//! rendered side with backoff until the timeout. Only a mismatch that is
//! still present when time runs out is reported.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::ConsistencyConfig;
use crate::error::{Error, Result, UnavailableError};
use crate::events::duration_ms;
use crate::retry::RetryPolicy;
use crate::snapshot::{Entity, Snapshot, Snapshotter};

/// Placeholder value for an absent field.
const NONE: &str = "none";

// =============================================================================
// Results
// =============================================================================

/// One field that differs between the two sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub entity_id: String,
    /// `presence`, `kind`, `parent`, `x`, `y`, `width`, `height`, `active` or `content`.
    pub field: String,
    pub authoritative_value: String,
    pub rendered_value: String,
}

impl Mismatch {
    #[must_use]
    pub fn new(
        entity_id: impl Into<String>,
        field: impl Into<String>,
        authoritative_value: impl Into<String>,
        rendered_value: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            field: field.into(),
            authoritative_value: authoritative_value.into(),
            rendered_value: rendered_value.into(),
        }
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: tmux={} rendered={}",
            self.entity_id, self.field, self.authoritative_value, self.rendered_value
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyResult {
    #[serde(rename = "match")]
    pub is_match: bool,
    pub authoritative_count: usize,
    pub rendered_count: usize,
    pub mismatches: Vec<Mismatch>,
    /// Rendered-side captures performed.
    pub attempts: u32,
    #[serde(rename = "elapsed_ms", with = "duration_ms")]
    pub elapsed: Duration,
}

impl ConsistencyResult {
    /// Turn a persisting mismatch into [`Error::Mismatch`].
    pub fn ensure_match(self) -> Result<Self> {
        if self.is_match {
            Ok(self)
        } else {
            Err(Error::Mismatch {
                mismatches: self.mismatches,
                attempts: self.attempts,
            })
        }
    }
}

// =============================================================================
// Options
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CompareOptions {
    /// Total budget for every capture and retry of one comparison.
    pub timeout: Duration,
    /// Spacing of rendered-side re-captures.
    pub poll: RetryPolicy,
    pub compare_content: bool,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            poll: RetryPolicy::propagation_poll(),
            compare_content: false,
        }
    }
}

impl CompareOptions {
    #[must_use]
    pub fn from_config(config: &ConsistencyConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            poll: RetryPolicy::new(
                Duration::from_millis(config.poll_initial_ms),
                Duration::from_millis(config.poll_max_ms),
                config.poll_backoff,
                0.1,
                None,
            ),
            compare_content: config.compare_content,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_poll(mut self, poll: RetryPolicy) -> Self {
        self.poll = poll;
        self
    }

    #[must_use]
    pub fn with_content(mut self, compare: bool) -> Self {
        self.compare_content = compare;
        self
    }
}

// =============================================================================
// Oracle
// =============================================================================

/// Stateless comparison entry points.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsistencyOracle;

impl ConsistencyOracle {
    /// Field-by-field diff of two snapshots, ordered by entity id.
    ///
    /// An entity present on one side only yields a single `presence`
    /// mismatch. Geometry is compared when tmux reports it; content only when
    /// `compare_content` is set.
    #[must_use]
    pub fn diff(authoritative: &Snapshot, rendered: &Snapshot, compare_content: bool) -> Vec<Mismatch> {
        let auth = index(authoritative);
        let rend = index(rendered);
        let mut ids: Vec<&str> = auth.keys().chain(rend.keys()).copied().collect();
        ids.sort_unstable();
        ids.dedup();

        let mut out = Vec::new();
        for id in ids {
            match (auth.get(id), rend.get(id)) {
                (Some(a), Some(r)) => diff_entity(a, r, compare_content, &mut out),
                (Some(_), None) => out.push(Mismatch::new(id, "presence", "present", "missing")),
                (None, Some(_)) => out.push(Mismatch::new(id, "presence", "missing", "present")),
                (None, None) => {}
            }
        }
        out
    }

    /// Compare a fixed authoritative snapshot against a rendered source,
    /// re-capturing the rendered side until it matches or `timeout` elapses.
    pub async fn compare<R>(
        authoritative: &Snapshot,
        rendered: &R,
        options: &CompareOptions,
    ) -> Result<ConsistencyResult>
    where
        R: Snapshotter + ?Sized,
    {
        let start = Instant::now();
        compare_until(authoritative, rendered, options, start, start + options.timeout).await
    }

    /// Capture both sides and compare, all under one timeout.
    #[instrument(skip_all, fields(timeout_ms = options.timeout.as_millis() as u64))]
    pub async fn check<A, R>(
        authoritative: &A,
        rendered: &R,
        options: &CompareOptions,
    ) -> Result<ConsistencyResult>
    where
        A: Snapshotter + ?Sized,
        R: Snapshotter + ?Sized,
    {
        let start = Instant::now();
        let deadline = start + options.timeout;
        let snapshot = tokio::time::timeout_at(deadline, authoritative.capture())
            .await
            .map_err(|_| timeout_error("authoritative state", options.timeout))??;
        compare_until(&snapshot, rendered, options, start, deadline).await
    }
}

fn index(snapshot: &Snapshot) -> BTreeMap<&str, &Entity> {
    let mut map = BTreeMap::new();
    for entity in &snapshot.entities {
        // First occurrence wins, matching Snapshot::get.
        map.entry(entity.id.as_str()).or_insert(entity);
    }
    map
}

fn opt(value: Option<&str>) -> String {
    value.unwrap_or(NONE).to_string()
}

fn diff_entity(a: &Entity, r: &Entity, compare_content: bool, out: &mut Vec<Mismatch>) {
    let id = a.id.as_str();
    if a.kind != r.kind {
        out.push(Mismatch::new(id, "kind", a.kind.to_string(), r.kind.to_string()));
    }
    if a.parent != r.parent {
        out.push(Mismatch::new(
            id,
            "parent",
            opt(a.parent.as_deref()),
            opt(r.parent.as_deref()),
        ));
    }
    if let Some(ag) = a.geometry {
        let axes = [
            ("x", ag.x, r.geometry.map(|g| g.x)),
            ("y", ag.y, r.geometry.map(|g| g.y)),
            ("width", ag.width, r.geometry.map(|g| g.width)),
            ("height", ag.height, r.geometry.map(|g| g.height)),
        ];
        for (field, want, got) in axes {
            if got != Some(want) {
                out.push(Mismatch::new(
                    id,
                    field,
                    want.to_string(),
                    got.map_or_else(|| NONE.to_string(), |v| v.to_string()),
                ));
            }
        }
    }
    if a.active != r.active {
        out.push(Mismatch::new(id, "active", a.active.to_string(), r.active.to_string()));
    }
    if compare_content && a.content_digest.is_some() && a.content_digest != r.content_digest {
        out.push(Mismatch::new(
            id,
            "content",
            opt(a.content_digest.as_deref()),
            opt(r.content_digest.as_deref()),
        ));
    }
}

fn timeout_error(source_name: &str, timeout: Duration) -> Error {
    UnavailableError::Timeout {
        source_name: source_name.to_string(),
        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    }
    .into()
}

async fn compare_until<R>(
    authoritative: &Snapshot,
    rendered: &R,
    options: &CompareOptions,
    start: Instant,
    deadline: Instant,
) -> Result<ConsistencyResult>
where
    R: Snapshotter + ?Sized,
{
    let authoritative = authoritative.clone().normalized();
    let mut attempts = 0u32;
    let mut last: Option<ConsistencyResult> = None;
    let mut last_read_error: Option<Error> = None;

    // At least one capture runs even when the deadline has already passed.
    loop {
        let Ok(captured) = tokio::time::timeout_at(deadline, rendered.capture()).await else {
            debug!(attempts, "rendered capture still pending at deadline");
            break;
        };
        attempts += 1;
        let snapshot = match captured {
            Ok(snapshot) => snapshot.normalized(),
            Err(err) if is_partial_read(&err) => {
                debug!(attempt = attempts, error = %err, "rendered state not readable yet");
                last_read_error = Some(err);
                if poll_exhausted(options, attempts, deadline) {
                    break;
                }
                let delay = options.poll.delay_for_attempt(attempts - 1);
                tokio::time::sleep_until(deadline.min(Instant::now() + delay)).await;
                continue;
            }
            Err(err) => return Err(err),
        };

        let mismatches = ConsistencyOracle::diff(&authoritative, &snapshot, options.compare_content);
        let result = ConsistencyResult {
            is_match: mismatches.is_empty(),
            authoritative_count: authoritative.len(),
            rendered_count: snapshot.len(),
            mismatches,
            attempts,
            elapsed: start.elapsed(),
        };
        if result.is_match {
            info!(
                attempt = attempts,
                elapsed_ms = result.elapsed.as_millis() as u64,
                "rendered state consistent"
            );
            return Ok(result);
        }
        debug!(
            attempt = attempts,
            mismatches = result.mismatches.len(),
            "rendered state behind tmux"
        );
        last = Some(result);

        if poll_exhausted(options, attempts, deadline) {
            break;
        }
        let delay = options.poll.delay_for_attempt(attempts - 1);
        tokio::time::sleep_until(deadline.min(Instant::now() + delay)).await;
    }

    match (last, last_read_error) {
        (Some(mut result), _) => {
            result.attempts = attempts;
            result.elapsed = start.elapsed();
            warn!(
                attempts = result.attempts,
                mismatches = result.mismatches.len(),
                elapsed_ms = result.elapsed.as_millis() as u64,
                "rendered state did not converge"
            );
            Ok(result)
        }
        (None, Some(err)) => {
            warn!(attempts, error = %err, "rendered state never became readable");
            Err(err)
        }
        (None, None) => Err(timeout_error("rendered tree", options.timeout)),
    }
}

/// A rendered dump that is missing or half-written while its producer
/// rewrites it.
fn is_partial_read(err: &Error) -> bool {
    matches!(err, Error::Io(_) | Error::Json(_))
}

fn poll_exhausted(options: &CompareOptions, attempts: u32, deadline: Instant) -> bool {
    options.poll.max_attempts.is_some_and(|max| attempts >= max) || Instant::now() >= deadline
}
