#![no_main]

use libfuzzer_sys::fuzz_target;
use uiprobe_core::selector::Selector;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(selector) = Selector::parse(input) else {
        return;
    };
    // A parsed selector keeps its source text and reparses.
    assert_eq!(selector.as_str(), input.trim());
    assert!(Selector::parse(selector.as_str()).is_ok());
});
