//! Integration tests for command parsing and serialization
//!
//! These tests verify that wire lines can be parsed into commands and
//! serialized back to equivalent lines, and that the construction budgets
//! hold at their boundaries.

use slirc_client::{Command, CommandKind, CommandOptions, Error};

fn round_trip(original: &str) {
    let command = Command::parse(CommandKind::Server, original).expect("failed to parse");
    let serialized = command.to_wire();
    let reparsed = Command::parse(CommandKind::Server, &serialized).expect("failed to reparse");
    assert_eq!(command, reparsed, "round trip of {:?}", original);
}

#[test]
fn test_round_trip_simple() {
    round_trip("PING :irc.example.com");
}

#[test]
fn test_round_trip_with_source() {
    round_trip(":nick!user@host PRIVMSG #channel :Hello, world!");
}

#[test]
fn test_round_trip_with_tags() {
    round_trip("@time=2023-01-01T00:00:00.000Z;msgid=abc123 :nick!user@host PRIVMSG #channel :Tagged message");
}

#[test]
fn test_round_trip_numeric() {
    round_trip(":server 001 nickname :Welcome to the IRC Network");
}

#[test]
fn test_round_trip_escaped_tags() {
    round_trip("@+draft/reply=abc\\s123;note=semi\\:colon :nick TAGMSG #chan");
}

#[test]
fn test_seed_scenario_parse() {
    // The command part must round-trip byte-for-byte; the tag set must be
    // equal (key order on the wire is unspecified).
    let line = "@time=2024-01-01T00:00:00.000Z;+draft/reply=abc\\s123 :nick!user@host PRIVMSG #chan :hello world";
    let cmd = Command::parse(CommandKind::Server, line).unwrap();

    assert_eq!(cmd.source(), Some("nick!user@host"));
    assert_eq!(cmd.verb(), "PRIVMSG");
    assert_eq!(cmd.args(), &["#chan", "hello world"]);
    assert!(cmd.has_trailing());
    assert_eq!(cmd.tag("time"), Some(Some("2024-01-01T00:00:00.000Z")));
    assert_eq!(cmd.tag("+draft/reply"), Some(Some("abc 123")));

    assert_eq!(
        cmd.command_part(),
        ":nick!user@host PRIVMSG #chan :hello world"
    );
    let reparsed = Command::parse(CommandKind::Server, &cmd.to_wire()).unwrap();
    assert_eq!(reparsed.tags(), cmd.tags());
}

#[test]
fn test_command_part_budget_boundary() {
    let options = CommandOptions::default();
    let budget = options.line_length() - 2;
    let overhead = "PRIVMSG #channel :".len();

    let exact = "x".repeat(budget - overhead - 2) + " y";
    let cmd = Command::client("PRIVMSG")
        .arg("#channel")
        .arg(exact)
        .build(&options)
        .expect("exactly at budget must succeed");
    assert_eq!(cmd.command_part().len(), budget);

    let over = "x".repeat(budget - overhead - 1) + " y";
    let err = Command::client("PRIVMSG")
        .arg("#channel")
        .arg(over)
        .build(&options)
        .unwrap_err();
    assert!(matches!(err, Error::CommandTooLong { part: "command", .. }));
}

#[test]
fn test_raised_line_budget() {
    let options = CommandOptions::new().with_line_length(1024).unwrap();
    let body = "x".repeat(800);
    let cmd = Command::client("PRIVMSG")
        .arg("#c")
        .arg(format!("{} tail", body))
        .build(&options)
        .unwrap();
    assert!(cmd.command_part().len() <= 1022);
}

#[test]
fn test_budget_floors_rejected() {
    assert!(matches!(
        CommandOptions::new().with_line_length(511),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        CommandOptions::new().with_client_tag_length(100),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        CommandOptions::new().with_server_tag_length(512),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_client_vs_server_tag_budget() {
    let options = CommandOptions::default();
    let value = "v".repeat(6000);

    let err = Command::builder(CommandKind::Client, "TAGMSG")
        .arg("#c")
        .tag("k", Some(value.clone()))
        .build(&options)
        .unwrap_err();
    assert!(matches!(err, Error::CommandTooLong { part: "tags", .. }));

    Command::builder(CommandKind::Server, "TAGMSG")
        .arg("#c")
        .tag("k", Some(value))
        .build(&options)
        .expect("server budget is 8191");
}

#[test]
fn test_invalid_lines_rejected() {
    for line in [
        "",
        "   ",
        "@tags-only",
        ":source-only",
        "1234 too many digits",
        "12 #c",
        "VERB-WITH-DASH x",
        "@=novalue PING",
        "@bad_key=x PING",
    ] {
        assert!(
            Command::parse(CommandKind::Server, line).is_err(),
            "{:?} should fail",
            line
        );
    }
}

#[test]
fn test_trailing_only_at_end() {
    let err = Command::client("PRIVMSG")
        .arg("has space")
        .arg("#c")
        .build(&CommandOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let err = Command::client("PRIVMSG")
        .arg("")
        .arg("#c")
        .build(&CommandOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}
