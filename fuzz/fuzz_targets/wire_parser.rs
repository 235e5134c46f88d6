//! Fuzz target for IRC wire parsing
//!
//! Feeds the command parser randomly generated lines and ensures it never
//! panics, and that anything it accepts survives a serialize/reparse
//! round trip.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::str;

use slirc_client::{Command, CommandKind};

fuzz_target!(|data: &[u8]| {
    // Only fuzz valid UTF-8 strings to focus on protocol-level issues
    if let Ok(input) = str::from_utf8(data) {
        if input.is_empty() || input.len() > 4096 {
            return;
        }

        for kind in [CommandKind::Server, CommandKind::Client, CommandKind::Bot] {
            if let Ok(cmd) = Command::parse(kind, input) {
                // Accepted input must round-trip.
                let reparsed =
                    Command::parse(kind, &cmd.to_wire()).expect("serialized form must reparse");
                assert_eq!(reparsed, cmd);
            }
        }
    }
});
