//! Glitch classification over recorded mutation and size timelines.
//!
//! [`classify`] is a pure function: the same recording and thresholds always
//! produce the same report, so a captured [`Recording`] can be replayed
//! offline with different thresholds.
//!
//! Three rules are applied:
//!
//! - **Node flicker**: per element key, two consecutive structural events of
//!   opposite kind (added then removed, or removed then added) no more than
//!   `flicker_window` apart. A matched pair is consumed, so a run of
//!   add/remove/add/remove yields two flickers, not three.
//! - **Attribute churn**: per element key and attribute, more than
//!   `churn_max_changes` real value changes within `churn_window` of the
//!   earliest unflagged change. Scanning resumes after the flagged window.
//! - **Size jump**: per element key, temporally adjacent samples whose delta
//!   strictly exceeds `size_jump_px`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Error, Result};
use crate::events::{MutationEvent, MutationKind, SizeSample, duration_ms};
use crate::timeline::{format_summary, format_timeline};

// =============================================================================
// Thresholds
// =============================================================================

/// How two size samples are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeMetric {
    /// Largest of the width and height deltas.
    #[default]
    PerAxis,
    /// Length of the (width, height) delta vector.
    Euclidean,
}

impl SizeMetric {
    #[must_use]
    pub fn delta(self, before: &SizeSample, after: &SizeSample) -> f64 {
        let dw = (after.width - before.width).abs();
        let dh = (after.height - before.height).abs();
        match self {
            Self::PerAxis => dw.max(dh),
            Self::Euclidean => dw.hypot(dh),
        }
    }
}

impl fmt::Display for SizeMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerAxis => write!(f, "per_axis"),
            Self::Euclidean => write!(f, "euclidean"),
        }
    }
}

/// Classification thresholds. All of them are data, never constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlitchThresholds {
    #[serde(rename = "flicker_window_ms", with = "duration_ms")]
    pub flicker_window: Duration,
    #[serde(rename = "churn_window_ms", with = "duration_ms")]
    pub churn_window: Duration,
    pub churn_max_changes: usize,
    pub size_jump_px: f64,
    pub size_metric: SizeMetric,
}

impl Default for GlitchThresholds {
    fn default() -> Self {
        Self {
            flicker_window: Duration::from_millis(100),
            churn_window: Duration::from_millis(200),
            churn_max_changes: 2,
            size_jump_px: 20.0,
            size_metric: SizeMetric::PerAxis,
        }
    }
}

impl GlitchThresholds {
    #[must_use]
    pub fn with_size_jump_px(mut self, px: f64) -> Self {
        self.size_jump_px = px;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !self.size_jump_px.is_finite() || self.size_jump_px < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "size_jump_px must be a non-negative number, got {}",
                self.size_jump_px
            )));
        }
        Ok(())
    }
}

/// Maximum glitch counts a caller tolerates before `check` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlitchBudget {
    pub node_flickers: usize,
    pub attr_churn_events: usize,
    pub size_jumps: usize,
}

// =============================================================================
// Report types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedNodeEvent {
    #[serde(flatten)]
    pub event: MutationEvent,
    /// Part of a counted flicker pair.
    pub flicker: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedAttrEvent {
    #[serde(flatten)]
    pub event: MutationEvent,
    /// Part of a counted churn window.
    pub churn: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedSizeEvent {
    #[serde(flatten)]
    pub sample: SizeSample,
    /// This sample jumped relative to the previous one for the same key.
    pub jump: bool,
    /// Delta from the previous sample for the same key, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_px: Option<f64>,
}

/// One counted glitch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GlitchFinding {
    NodeFlicker {
        target_key: String,
        /// Kind of the first event of the pair.
        first: MutationKind,
        #[serde(rename = "at_ms", with = "duration_ms")]
        at: Duration,
        #[serde(rename = "gap_ms", with = "duration_ms")]
        gap: Duration,
    },
    AttributeChurn {
        target_key: String,
        attribute: String,
        changes: usize,
        #[serde(rename = "at_ms", with = "duration_ms")]
        at: Duration,
        #[serde(rename = "span_ms", with = "duration_ms")]
        span: Duration,
    },
    SizeJump {
        element_key: String,
        #[serde(rename = "at_ms", with = "duration_ms")]
        at: Duration,
        from: (f64, f64),
        to: (f64, f64),
        delta_px: f64,
    },
}

impl GlitchFinding {
    /// When the finding starts.
    #[must_use]
    pub fn at(&self) -> Duration {
        match self {
            Self::NodeFlicker { at, .. }
            | Self::AttributeChurn { at, .. }
            | Self::SizeJump { at, .. } => *at,
        }
    }
}

impl fmt::Display for GlitchFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeFlicker {
                target_key,
                first,
                at,
                gap,
            } => {
                let then = first.opposite().unwrap_or(*first);
                write!(
                    f,
                    "flicker {target_key}: {first} then {then} {}ms apart at +{}ms",
                    gap.as_millis(),
                    at.as_millis()
                )
            }
            Self::AttributeChurn {
                target_key,
                attribute,
                changes,
                at,
                span,
            } => write!(
                f,
                "churn {target_key} [{attribute}]: {changes} changes in {}ms at +{}ms",
                span.as_millis(),
                at.as_millis()
            ),
            Self::SizeJump {
                element_key,
                at,
                from,
                to,
                delta_px,
            } => write!(
                f,
                "size jump {element_key}: {}x{} -> {}x{} ({delta_px:.1}px) at +{}ms",
                from.0,
                from.1,
                to.0,
                to.1,
                at.as_millis()
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GlitchSummary {
    pub node_flickers: usize,
    pub attr_churn_events: usize,
    pub size_jumps: usize,
    pub total_node_mutations: usize,
    pub total_attribute_mutations: usize,
    pub total_size_samples: usize,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
}

/// Classified observation window. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlitchReport {
    pub summary: GlitchSummary,
    pub nodes: Vec<TaggedNodeEvent>,
    pub attributes: Vec<TaggedAttrEvent>,
    pub sizes: Vec<TaggedSizeEvent>,
    pub findings: Vec<GlitchFinding>,
    pub thresholds: GlitchThresholds,
}

impl GlitchReport {
    /// Report for a window with no observations.
    #[must_use]
    pub fn empty(thresholds: GlitchThresholds) -> Self {
        classify(Vec::new(), Vec::new(), &thresholds, Duration::ZERO)
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Raw input that reproduces this report.
    #[must_use]
    pub fn recording(&self) -> Recording {
        let mut mutations: Vec<MutationEvent> = self
            .nodes
            .iter()
            .map(|n| n.event.clone())
            .chain(self.attributes.iter().map(|a| a.event.clone()))
            .collect();
        mutations.sort_by_key(|e| e.seq);
        Recording {
            mutations,
            sizes: self.sizes.iter().map(|s| s.sample.clone()).collect(),
            duration: self.summary.duration,
        }
    }

    /// Fail with [`Error::Instability`] when any counter exceeds `budget`.
    pub fn check(&self, budget: &GlitchBudget) -> Result<()> {
        let s = &self.summary;
        if s.node_flickers > budget.node_flickers
            || s.attr_churn_events > budget.attr_churn_events
            || s.size_jumps > budget.size_jumps
        {
            return Err(Error::Instability {
                summary: format_summary(self),
                timeline: format_timeline(self),
            });
        }
        Ok(())
    }
}

/// Serializable classifier input.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Recording {
    #[serde(default)]
    pub mutations: Vec<MutationEvent>,
    #[serde(default)]
    pub sizes: Vec<SizeSample>,
    #[serde(default, rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
}

// =============================================================================
// Classification
// =============================================================================

/// Classify a replayed recording.
#[must_use]
pub fn classify_recording(recording: &Recording, thresholds: &GlitchThresholds) -> GlitchReport {
    classify(
        recording.mutations.clone(),
        recording.sizes.clone(),
        thresholds,
        recording.duration,
    )
}

/// Apply the flicker, churn and size-jump rules.
///
/// `duration` is the observation wall time supplied by the caller; it is
/// reported as-is, even for empty input.
#[must_use]
pub fn classify(
    mutations: Vec<MutationEvent>,
    sizes: Vec<SizeSample>,
    thresholds: &GlitchThresholds,
    duration: Duration,
) -> GlitchReport {
    let (structural, attributes): (Vec<_>, Vec<_>) =
        mutations.into_iter().partition(|e| e.kind.is_structural());

    let mut findings = Vec::new();
    let nodes = tag_flickers(structural, thresholds.flicker_window, &mut findings);
    let node_flickers = findings.len();
    let attributes = tag_churn(
        attributes,
        thresholds.churn_window,
        thresholds.churn_max_changes,
        &mut findings,
    );
    let attr_churn_events = findings.len() - node_flickers;
    let sizes = tag_size_jumps(
        sizes,
        thresholds.size_jump_px,
        thresholds.size_metric,
        &mut findings,
    );
    let size_jumps = findings.len() - node_flickers - attr_churn_events;
    findings.sort_by_key(GlitchFinding::at);

    GlitchReport {
        summary: GlitchSummary {
            node_flickers,
            attr_churn_events,
            size_jumps,
            total_node_mutations: nodes.len(),
            total_attribute_mutations: attributes.len(),
            total_size_samples: sizes.len(),
            duration,
        },
        nodes,
        attributes,
        sizes,
        findings,
        thresholds: thresholds.clone(),
    }
}

/// Indices of `items` grouped by key, each group sorted by `order(index)`.
fn group_by<'a, T, K>(
    items: &'a [T],
    key: impl Fn(&'a T) -> K,
    order: impl Fn(usize) -> (Duration, u64),
) -> Vec<Vec<usize>>
where
    K: Ord,
{
    let mut groups: BTreeMap<K, Vec<usize>> = BTreeMap::new();
    for (idx, item) in items.iter().enumerate() {
        groups.entry(key(item)).or_default().push(idx);
    }
    groups
        .into_values()
        .map(|mut idxs| {
            idxs.sort_by_key(|&i| order(i));
            idxs
        })
        .collect()
}

fn tag_flickers(
    events: Vec<MutationEvent>,
    window: Duration,
    findings: &mut Vec<GlitchFinding>,
) -> Vec<TaggedNodeEvent> {
    let mut flagged = vec![false; events.len()];
    let order = |i: usize| (events[i].timestamp, events[i].seq);
    for idxs in group_by(&events, |e| e.target_key.as_str(), order) {
        let mut i = 0;
        while i + 1 < idxs.len() {
            let (a, b) = (&events[idxs[i]], &events[idxs[i + 1]]);
            let gap = b.timestamp.saturating_sub(a.timestamp);
            if a.kind.opposite() == Some(b.kind) && gap <= window {
                flagged[idxs[i]] = true;
                flagged[idxs[i + 1]] = true;
                findings.push(GlitchFinding::NodeFlicker {
                    target_key: a.target_key.clone(),
                    first: a.kind,
                    at: a.timestamp,
                    gap,
                });
                i += 2;
            } else {
                i += 1;
            }
        }
    }
    events
        .into_iter()
        .zip(flagged)
        .map(|(event, flicker)| TaggedNodeEvent { event, flicker })
        .collect()
}

fn tag_churn(
    events: Vec<MutationEvent>,
    window: Duration,
    max_changes: usize,
    findings: &mut Vec<GlitchFinding>,
) -> Vec<TaggedAttrEvent> {
    let mut flagged = vec![false; events.len()];
    let changes: Vec<usize> = (0..events.len())
        .filter(|&i| events[i].changes_value())
        .collect();
    let groups = group_by(
        &changes,
        |&i| {
            (
                events[i].target_key.as_str(),
                events[i].attribute.as_deref().unwrap_or(""),
            )
        },
        |g| (events[changes[g]].timestamp, events[changes[g]].seq),
    );
    for group in groups {
        let idxs: Vec<usize> = group.into_iter().map(|g| changes[g]).collect();
        let mut i = 0;
        while i < idxs.len() {
            let start = events[idxs[i]].timestamp;
            let mut j = i;
            while j + 1 < idxs.len()
                && events[idxs[j + 1]].timestamp.saturating_sub(start) <= window
            {
                j += 1;
            }
            let count = j - i + 1;
            if count > max_changes {
                for &idx in &idxs[i..=j] {
                    flagged[idx] = true;
                }
                let first = &events[idxs[i]];
                findings.push(GlitchFinding::AttributeChurn {
                    target_key: first.target_key.clone(),
                    attribute: first.attribute.clone().unwrap_or_default(),
                    changes: count,
                    at: start,
                    span: events[idxs[j]].timestamp.saturating_sub(start),
                });
                i = j + 1;
            } else {
                i += 1;
            }
        }
    }
    events
        .into_iter()
        .zip(flagged)
        .map(|(event, churn)| TaggedAttrEvent { event, churn })
        .collect()
}

fn tag_size_jumps(
    samples: Vec<SizeSample>,
    threshold: f64,
    metric: SizeMetric,
    findings: &mut Vec<GlitchFinding>,
) -> Vec<TaggedSizeEvent> {
    let mut tags: Vec<(bool, Option<f64>)> = vec![(false, None); samples.len()];
    // Samples carry no sequence number; ties keep recording order.
    let order = |i: usize| (samples[i].timestamp, i as u64);
    for idxs in group_by(&samples, |s| s.element_key.as_str(), order) {
        for pair in idxs.windows(2) {
            let (before, after) = (&samples[pair[0]], &samples[pair[1]]);
            let delta = metric.delta(before, after);
            let jump = delta > threshold;
            tags[pair[1]] = (jump, Some(delta));
            if jump {
                findings.push(GlitchFinding::SizeJump {
                    element_key: after.element_key.clone(),
                    at: after.timestamp,
                    from: (before.width, before.height),
                    to: (after.width, after.height),
                    delta_px: delta,
                });
            }
        }
    }
    samples
        .into_iter()
        .zip(tags)
        .map(|(sample, (jump, delta_px))| TaggedSizeEvent {
            sample,
            jump,
            delta_px,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn node(seq: u64, at: u64, kind: MutationKind, key: &str) -> MutationEvent {
        MutationEvent::node(seq, ms(at), kind, key)
    }

    fn attr(seq: u64, at: u64, key: &str, old: &str, new: &str) -> MutationEvent {
        MutationEvent::attribute(seq, ms(at), key, "class", Some(old.into()), Some(new.into()))
    }

    fn size(at: u64, key: &str, w: f64, h: f64) -> SizeSample {
        SizeSample::new(ms(at), key, w, h)
    }

    #[test]
    fn empty_input_reports_supplied_duration() {
        let report = classify(vec![], vec![], &GlitchThresholds::default(), ms(1234));
        assert_eq!(report.summary.node_flickers, 0);
        assert_eq!(report.summary.attr_churn_events, 0);
        assert_eq!(report.summary.size_jumps, 0);
        assert_eq!(report.summary.duration, ms(1234));
        assert!(report.is_clean());
    }

    #[test]
    fn flicker_inside_window_counts() {
        let events = vec![
            node(0, 0, MutationKind::NodeAdded, "pane"),
            node(1, 50, MutationKind::NodeRemoved, "pane"),
        ];
        let report = classify(events, vec![], &GlitchThresholds::default(), ms(100));
        assert_eq!(report.summary.node_flickers, 1);
        assert!(report.nodes.iter().all(|n| n.flicker));
    }

    #[test]
    fn flicker_outside_window_does_not_count() {
        let events = vec![
            node(0, 0, MutationKind::NodeAdded, "pane"),
            node(1, 150, MutationKind::NodeRemoved, "pane"),
        ];
        let report = classify(events, vec![], &GlitchThresholds::default(), ms(200));
        assert_eq!(report.summary.node_flickers, 0);
        assert_eq!(report.summary.total_node_mutations, 2);
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let events = vec![
            node(0, 0, MutationKind::NodeRemoved, "pane"),
            node(1, 100, MutationKind::NodeAdded, "pane"),
        ];
        let report = classify(events, vec![], &GlitchThresholds::default(), ms(100));
        assert_eq!(report.summary.node_flickers, 1);
    }

    #[test]
    fn matched_pairs_are_consumed() {
        let events = vec![
            node(0, 0, MutationKind::NodeAdded, "pane"),
            node(1, 10, MutationKind::NodeRemoved, "pane"),
            node(2, 20, MutationKind::NodeAdded, "pane"),
        ];
        let report = classify(events, vec![], &GlitchThresholds::default(), ms(30));
        assert_eq!(report.summary.node_flickers, 1);
        assert!(!report.nodes[2].flicker);
    }

    #[test]
    fn flicker_is_per_key() {
        let events = vec![
            node(0, 0, MutationKind::NodeAdded, "a"),
            node(1, 10, MutationKind::NodeRemoved, "b"),
        ];
        let report = classify(events, vec![], &GlitchThresholds::default(), ms(30));
        assert_eq!(report.summary.node_flickers, 0);
    }

    #[test]
    fn churn_needs_more_than_max_changes() {
        let two = vec![attr(0, 0, "tab", "a", "b"), attr(1, 50, "tab", "b", "a")];
        let report = classify(two, vec![], &GlitchThresholds::default(), ms(100));
        assert_eq!(report.summary.attr_churn_events, 0);

        let three = vec![
            attr(0, 0, "tab", "a", "b"),
            attr(1, 50, "tab", "b", "a"),
            attr(2, 100, "tab", "a", "b"),
        ];
        let report = classify(three, vec![], &GlitchThresholds::default(), ms(100));
        assert_eq!(report.summary.attr_churn_events, 1);
        assert!(report.attributes.iter().all(|a| a.churn));
    }

    #[test]
    fn churn_window_is_not_reflagged() {
        let events: Vec<_> = (0..6)
            .map(|i| {
                let (old, new) = if i % 2 == 0 { ("a", "b") } else { ("b", "a") };
                attr(i, i * 30, "tab", old, new)
            })
            .collect();
        let report = classify(events, vec![], &GlitchThresholds::default(), ms(200));
        // All six changes fall within 200ms of the first.
        assert_eq!(report.summary.attr_churn_events, 1);
    }

    #[test]
    fn unchanged_values_do_not_churn() {
        let events: Vec<_> = (0..5).map(|i| attr(i, i * 10, "tab", "a", "a")).collect();
        let report = classify(events, vec![], &GlitchThresholds::default(), ms(100));
        assert_eq!(report.summary.attr_churn_events, 0);
        assert_eq!(report.summary.total_attribute_mutations, 5);
    }

    #[test]
    fn size_jump_strictly_exceeds_threshold() {
        let samples = vec![size(0, "p", 100.0, 50.0), size(16, "p", 125.0, 50.0)];
        let strict = classify(
            vec![],
            samples.clone(),
            &GlitchThresholds::default(),
            ms(32),
        );
        assert_eq!(strict.summary.size_jumps, 1);
        assert!(strict.sizes[1].jump);
        assert!(!strict.sizes[0].jump);

        let loose = classify(
            vec![],
            samples.clone(),
            &GlitchThresholds::default().with_size_jump_px(30.0),
            ms(32),
        );
        assert_eq!(loose.summary.size_jumps, 0);

        let exact = classify(
            vec![],
            samples,
            &GlitchThresholds::default().with_size_jump_px(25.0),
            ms(32),
        );
        assert_eq!(exact.summary.size_jumps, 0);
    }

    #[test]
    fn euclidean_metric_combines_axes() {
        let samples = vec![size(0, "p", 100.0, 100.0), size(16, "p", 115.0, 115.0)];
        let per_axis = classify(vec![], samples.clone(), &GlitchThresholds::default(), ms(16));
        assert_eq!(per_axis.summary.size_jumps, 0);
        let thresholds = GlitchThresholds {
            size_metric: SizeMetric::Euclidean,
            ..GlitchThresholds::default()
        };
        let euclid = classify(vec![], samples, &thresholds, ms(16));
        assert_eq!(euclid.summary.size_jumps, 1);
    }

    #[test]
    fn size_jumps_compare_same_key_only() {
        let samples = vec![
            size(0, "a", 100.0, 100.0),
            size(0, "b", 500.0, 500.0),
            size(16, "a", 101.0, 100.0),
            size(16, "b", 500.0, 501.0),
        ];
        let report = classify(vec![], samples, &GlitchThresholds::default(), ms(16));
        assert_eq!(report.summary.size_jumps, 0);
    }

    #[test]
    fn check_respects_budget() {
        let events = vec![
            node(0, 0, MutationKind::NodeAdded, "pane"),
            node(1, 50, MutationKind::NodeRemoved, "pane"),
        ];
        let report = classify(events, vec![], &GlitchThresholds::default(), ms(100));
        let err = report.check(&GlitchBudget::default()).unwrap_err();
        match err {
            Error::Instability { timeline, .. } => assert!(timeline.contains("pane")),
            other => panic!("unexpected {other:?}"),
        }
        let lenient = GlitchBudget {
            node_flickers: 1,
            ..GlitchBudget::default()
        };
        assert!(report.check(&lenient).is_ok());
    }

    #[test]
    fn report_replays_to_same_report() {
        let events = vec![
            node(0, 0, MutationKind::NodeAdded, "pane"),
            attr(1, 5, "pane", "", "active"),
            node(2, 50, MutationKind::NodeRemoved, "pane"),
        ];
        let samples = vec![size(0, "pane", 10.0, 10.0), size(16, "pane", 80.0, 10.0)];
        let thresholds = GlitchThresholds::default();
        let report = classify(events, samples, &thresholds, ms(64));
        let replayed = classify_recording(&report.recording(), &thresholds);
        assert_eq!(replayed, report);

        let json = serde_json::to_string(&report).unwrap();
        let back: GlitchReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.summary, report.summary);
        assert_eq!(back.findings.len(), 2);
    }

    #[test]
    fn thresholds_deserialize_with_defaults() {
        let t: GlitchThresholds = serde_json::from_str(r#"{"size_jump_px": 5}"#).unwrap();
        assert!((t.size_jump_px - 5.0).abs() < f64::EPSILON);
        assert_eq!(t.flicker_window, ms(100));
        assert!(GlitchThresholds::default().with_size_jump_px(-1.0).validate().is_err());
    }
}
