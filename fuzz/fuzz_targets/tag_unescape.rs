//! Fuzz target for tag value escaping
//!
//! Checks that unescaping never panics and that escape/unescape is a
//! faithful round trip for arbitrary values.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::str;

use slirc_client::command::tags::{escape_tag_value_string, unescape_tag_value};

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = str::from_utf8(data) {
        // Unescape accepts anything.
        let _ = unescape_tag_value(input);

        // Escaping then unescaping restores the original.
        let escaped = escape_tag_value_string(input);
        assert_eq!(unescape_tag_value(&escaped), input);
    }
});
