#![no_main]

use libfuzzer_sys::fuzz_target;
use uiprobe_core::classifier::{GlitchThresholds, classify_recording};
use uiprobe_core::timeline::{format_summary, format_timeline};
use uiprobe_core::Recording;

fuzz_target!(|data: &[u8]| {
    let Ok(recording) = serde_json::from_slice::<Recording>(data) else {
        return;
    };
    let report = classify_recording(&recording, &GlitchThresholds::default());
    let s = &report.summary;
    assert_eq!(
        s.node_flickers + s.attr_churn_events + s.size_jumps,
        report.findings.len()
    );
    let _ = format_timeline(&report);
    let _ = format_summary(&report);
});
