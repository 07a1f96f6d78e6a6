//! Property-based tests for the glitch classifier.
//!
//! Covers counter/tag agreement, order independence, threshold monotonicity,
//! churn window disjointness, replay of a report's recording, and the
//! timeline formatter's empty-output contract.

use std::time::Duration;

use proptest::prelude::*;

use uiprobe_core::classifier::{GlitchFinding, GlitchThresholds, classify, classify_recording};
use uiprobe_core::events::{MutationEvent, MutationKind, SizeSample};
use uiprobe_core::timeline::format_timeline;

// =============================================================================
// Strategies
// =============================================================================

/// A handful of keys so collisions (and therefore glitches) are common.
fn arb_key() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("div:%0".to_string()),
        Just("div:%1".to_string()),
        Just("button:@0".to_string()),
        Just("body:0>div:3".to_string()),
    ]
}

fn arb_ms() -> impl Strategy<Value = Duration> {
    (0u64..1_000).prop_map(Duration::from_millis)
}

fn arb_value() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        1 => Just(None),
        4 => prop_oneof![Just("a"), Just("b"), Just("c")].prop_map(|s| Some(s.to_string())),
    ]
}

fn arb_raw_event() -> impl Strategy<Value = (Duration, String, u8, Option<String>, Option<String>)> {
    (arb_ms(), arb_key(), 0u8..3, arb_value(), arb_value())
}

/// Events with unique, arrival-ordered sequence numbers.
fn arb_mutations() -> impl Strategy<Value = Vec<MutationEvent>> {
    prop::collection::vec(arb_raw_event(), 0..60).prop_map(|raw| {
        raw.into_iter()
            .enumerate()
            .map(|(seq, (ts, key, kind, old, new))| {
                let seq = seq as u64;
                match kind {
                    0 => MutationEvent::node(seq, ts, MutationKind::NodeAdded, key),
                    1 => MutationEvent::node(seq, ts, MutationKind::NodeRemoved, key),
                    _ => MutationEvent::attribute(seq, ts, key, "class", old, new),
                }
            })
            .collect()
    })
}

fn arb_sizes() -> impl Strategy<Value = Vec<SizeSample>> {
    prop::collection::vec(
        (0u64..64, arb_key(), 0u32..80, 0u32..40),
        0..40,
    )
    .prop_map(|raw| {
        raw.into_iter()
            .map(|(tick, key, cols, rows)| {
                SizeSample::new(
                    Duration::from_millis(tick * 16),
                    key,
                    f64::from(cols) * 8.0,
                    f64::from(rows) * 16.0,
                )
            })
            .collect()
    })
}

fn arb_thresholds() -> impl Strategy<Value = GlitchThresholds> {
    (10u64..300, 10u64..400, 1usize..5, 0u32..200).prop_map(|(flicker, churn, max, px)| {
        GlitchThresholds {
            flicker_window: Duration::from_millis(flicker),
            churn_window: Duration::from_millis(churn),
            churn_max_changes: max,
            size_jump_px: f64::from(px),
            ..GlitchThresholds::default()
        }
    })
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn totals_match_input(
        mutations in arb_mutations(),
        sizes in arb_sizes(),
        thresholds in arb_thresholds(),
        ms in 0u64..10_000,
    ) {
        let structural = mutations.iter().filter(|e| e.kind.is_structural()).count();
        let n_mut = mutations.len();
        let n_sizes = sizes.len();
        let report = classify(mutations, sizes, &thresholds, Duration::from_millis(ms));
        let s = &report.summary;
        prop_assert_eq!(s.total_node_mutations, structural);
        prop_assert_eq!(s.total_node_mutations + s.total_attribute_mutations, n_mut);
        prop_assert_eq!(s.total_size_samples, n_sizes);
        prop_assert_eq!(s.duration, Duration::from_millis(ms));
        prop_assert_eq!(
            s.node_flickers + s.attr_churn_events + s.size_jumps,
            report.findings.len()
        );
    }

    #[test]
    fn every_flicker_flags_exactly_two_events(
        mutations in arb_mutations(),
        thresholds in arb_thresholds(),
    ) {
        let report = classify(mutations, Vec::new(), &thresholds, Duration::ZERO);
        let flagged = report.nodes.iter().filter(|n| n.flicker).count();
        prop_assert_eq!(flagged, 2 * report.summary.node_flickers);
        for finding in &report.findings {
            if let GlitchFinding::NodeFlicker { gap, .. } = finding {
                prop_assert!(*gap <= thresholds.flicker_window);
            }
        }
    }

    #[test]
    fn churn_windows_are_disjoint_and_over_limit(
        mutations in arb_mutations(),
        thresholds in arb_thresholds(),
    ) {
        let report = classify(mutations, Vec::new(), &thresholds, Duration::ZERO);
        let mut counted = 0;
        for finding in &report.findings {
            if let GlitchFinding::AttributeChurn { changes, span, .. } = finding {
                prop_assert!(*changes > thresholds.churn_max_changes);
                prop_assert!(*span <= thresholds.churn_window);
                counted += changes;
            }
        }
        let flagged = report.attributes.iter().filter(|a| a.churn).count();
        prop_assert_eq!(flagged, counted);
        prop_assert!(report.attributes.iter().filter(|a| a.churn).all(|a| a.event.changes_value()));
    }

    #[test]
    fn arrival_order_does_not_change_verdict(
        (mutations, shuffled) in arb_mutations().prop_flat_map(|m| {
            let original = m.clone();
            (Just(original), Just(m).prop_shuffle())
        }),
        thresholds in arb_thresholds(),
    ) {
        let a = classify(mutations, Vec::new(), &thresholds, Duration::ZERO);
        let b = classify(shuffled, Vec::new(), &thresholds, Duration::ZERO);
        prop_assert_eq!(a.summary, b.summary);
        prop_assert_eq!(a.findings, b.findings);
    }

    #[test]
    fn higher_size_threshold_never_adds_jumps(
        sizes in arb_sizes(),
        low in 0u32..100,
        extra in 0u32..100,
    ) {
        let lo = GlitchThresholds::default().with_size_jump_px(f64::from(low));
        let hi = GlitchThresholds::default().with_size_jump_px(f64::from(low + extra));
        let a = classify(Vec::new(), sizes.clone(), &lo, Duration::ZERO);
        let b = classify(Vec::new(), sizes, &hi, Duration::ZERO);
        prop_assert!(b.summary.size_jumps <= a.summary.size_jumps);
    }

    #[test]
    fn report_recording_replays_to_same_report(
        mutations in arb_mutations(),
        sizes in arb_sizes(),
        thresholds in arb_thresholds(),
    ) {
        let report = classify(mutations, sizes, &thresholds, Duration::from_millis(500));
        let replayed = classify_recording(&report.recording(), &thresholds);
        prop_assert_eq!(replayed.summary, report.summary);
        prop_assert_eq!(replayed.findings, report.findings);
    }

    #[test]
    fn findings_are_chronological(
        mutations in arb_mutations(),
        sizes in arb_sizes(),
        thresholds in arb_thresholds(),
    ) {
        let report = classify(mutations, sizes, &thresholds, Duration::ZERO);
        prop_assert!(report.findings.windows(2).all(|w| w[0].at() <= w[1].at()));
    }

    #[test]
    fn timeline_empty_only_without_mutations(
        mutations in arb_mutations(),
        sizes in arb_sizes(),
    ) {
        let empty = mutations.is_empty();
        let report = classify(mutations, sizes, &GlitchThresholds::default(), Duration::ZERO);
        prop_assert_eq!(format_timeline(&report).is_empty(), empty);
    }
}
