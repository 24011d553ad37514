//! Fuzz target for menu file parsing and re-rendering.
//!
//! Arbitrary input must never panic, and any text that parses must survive
//! an edit-and-save cycle: the rendered text reads back as the edited menu.

#![no_main]

use libfuzzer_sys::fuzz_target;
use trayrunner::store::{self, FormatState};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok((config, state)) = store::parse_document(text.to_string()) else {
        return;
    };

    let (canonical, _) = store::render_text(&config, &FormatState::default());
    assert_eq!(store::parse(&canonical).ok().as_ref(), Some(&config));

    let mut edited = config.clone();
    if edited.items.pop().is_none() {
        return;
    }
    let (rendered, _) = store::render_text(&edited, &state);
    assert_eq!(store::parse(&rendered).ok().as_ref(), Some(&edited));
});
