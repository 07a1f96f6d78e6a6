//! Human-readable rendering of a classified report.
//!
//! Node and attribute events are merged into one chronological sequence with
//! `+Nms` offsets. Events that took part in a finding are marked. Size samples
//! are not listed; size jumps appear in the summary's finding list.

use std::fmt::{self, Write};

use crate::classifier::GlitchReport;
use crate::events::MutationEvent;

enum Marker {
    None,
    Flicker,
    Churn,
}

/// Render the timeline. Returns an empty string when there are no events.
#[must_use]
pub fn format_timeline(report: &GlitchReport) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_timeline(report, &mut out);
    out
}

/// Write the timeline into `out`, surfacing writer failures.
pub fn write_timeline<W: Write>(report: &GlitchReport, out: &mut W) -> fmt::Result {
    let mut entries: Vec<(&MutationEvent, Marker)> = report
        .nodes
        .iter()
        .map(|n| {
            let marker = if n.flicker {
                Marker::Flicker
            } else {
                Marker::None
            };
            (&n.event, marker)
        })
        .chain(report.attributes.iter().map(|a| {
            let marker = if a.churn { Marker::Churn } else { Marker::None };
            (&a.event, marker)
        }))
        .collect();
    entries.sort_by_key(|(e, _)| (e.timestamp, e.seq));

    for (event, marker) in entries {
        write!(
            out,
            "+{:>5}ms  {:<7}  {}",
            event.timestamp.as_millis(),
            event.kind.to_string(),
            event.target_key
        )?;
        if let Some(attribute) = &event.attribute {
            write!(
                out,
                " {attribute}: {} -> {}",
                quoted(event.old_value.as_deref()),
                quoted(event.new_value.as_deref())
            )?;
        }
        match marker {
            Marker::None => {}
            Marker::Flicker => out.write_str("  <-- flicker")?,
            Marker::Churn => out.write_str("  <-- churn")?,
        }
        out.write_char('\n')?;
    }
    Ok(())
}

fn quoted(value: Option<&str>) -> String {
    value.map_or_else(|| "(none)".to_string(), |v| format!("{v:?}"))
}

/// Counters plus one line per finding.
#[must_use]
pub fn format_summary(report: &GlitchReport) -> String {
    let s = &report.summary;
    let mut out = format!(
        "{} node flicker(s), {} attribute churn event(s), {} size jump(s) in {}ms \
         ({} node mutations, {} attribute mutations, {} size samples)",
        s.node_flickers,
        s.attr_churn_events,
        s.size_jumps,
        s.duration.as_millis(),
        s.total_node_mutations,
        s.total_attribute_mutations,
        s.total_size_samples,
    );
    for finding in &report.findings {
        let _ = write!(out, "\n  - {finding}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{GlitchThresholds, classify};
    use crate::events::{MutationKind, SizeSample};
    use std::time::Duration;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn empty_report_renders_nothing() {
        let report = GlitchReport::empty(GlitchThresholds::default());
        assert_eq!(format_timeline(&report), "");
    }

    #[test]
    fn events_render_chronologically_with_markers() {
        let mutations = vec![
            MutationEvent::attribute(
                2,
                ms(70),
                "div:%1",
                "class",
                Some("pane".into()),
                Some("pane active".into()),
            ),
            MutationEvent::node(0, ms(0), MutationKind::NodeAdded, "div:%0"),
            MutationEvent::node(1, ms(50), MutationKind::NodeRemoved, "div:%0"),
        ];
        let report = classify(mutations, vec![], &GlitchThresholds::default(), ms(80));
        let text = format_timeline(&report);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("+    0ms"));
        assert!(lines[0].contains("added"));
        assert!(lines[0].ends_with("<-- flicker"));
        assert!(lines[1].contains("+   50ms"));
        assert!(lines[2].contains("class: \"pane\" -> \"pane active\""));
        assert!(!lines[2].contains("<--"));
    }

    #[test]
    fn size_samples_stay_out_of_timeline() {
        let sizes = vec![
            SizeSample::new(ms(0), "p", 10.0, 10.0),
            SizeSample::new(ms(16), "p", 90.0, 10.0),
        ];
        let report = classify(vec![], sizes, &GlitchThresholds::default(), ms(16));
        assert_eq!(format_timeline(&report), "");
        let summary = format_summary(&report);
        assert!(summary.starts_with("0 node flicker(s), 0 attribute churn event(s), 1 size jump(s)"));
        assert!(summary.contains("size jump p: 10x10 -> 90x10"));
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write_str(&mut self, _: &str) -> fmt::Result {
            Err(fmt::Error)
        }
    }

    #[test]
    fn writer_failure_is_surfaced() {
        let mutations = vec![MutationEvent::node(0, ms(0), MutationKind::NodeAdded, "x")];
        let report = classify(mutations, vec![], &GlitchThresholds::default(), ms(1));
        assert!(write_timeline(&report, &mut FailingWriter).is_err());
        let empty = GlitchReport::empty(GlitchThresholds::default());
        assert!(write_timeline(&empty, &mut FailingWriter).is_ok());
    }
}
