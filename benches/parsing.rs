//! Benchmarks for IRC command parsing and serialization.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use slirc_client::{Command, CommandKind};

/// Simple PING message
const SIMPLE_MESSAGE: &str = "PING :irc.example.com";

/// Message with source prefix
const PREFIX_MESSAGE: &str = ":nick!user@host PRIVMSG #channel :Hello, world!";

/// Message with IRCv3 tags
const TAGGED_MESSAGE: &str = "@time=2023-01-01T00:00:00.000Z;msgid=abc123;+example/tag=value :nick!user@host PRIVMSG #channel :Hello with tags!";

/// Complex message with escaped tags
const COMPLEX_TAGS: &str = "@time=2023-01-01T12:00:00Z;msgid=msg-12345;+draft/reply=parent\\sid;batch=batch001;account=username :nick!user@host.example.com PRIVMSG #long-channel-name :This is a longer message with more content to parse";

/// Numeric response
const NUMERIC_RESPONSE: &str = ":irc.server.net 001 nickname :Welcome to the IRC Network nickname!user@host";

fn benchmark_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("Command Parsing");

    for (name, line) in [
        ("simple_ping", SIMPLE_MESSAGE),
        ("with_prefix", PREFIX_MESSAGE),
        ("with_tags", TAGGED_MESSAGE),
        ("complex_tags", COMPLEX_TAGS),
        ("numeric", NUMERIC_RESPONSE),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let cmd = Command::parse(CommandKind::Server, black_box(line)).unwrap();
                black_box(cmd)
            })
        });
    }

    group.finish();
}

fn benchmark_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("Command Serialization");

    let parsed: Vec<(&str, Command)> = [
        ("simple_ping", SIMPLE_MESSAGE),
        ("with_prefix", PREFIX_MESSAGE),
        ("with_tags", TAGGED_MESSAGE),
    ]
    .into_iter()
    .map(|(name, line)| (name, Command::parse(CommandKind::Server, line).unwrap()))
    .collect();

    for (name, cmd) in parsed {
        group.bench_function(name, |b| {
            b.iter(|| black_box(black_box(&cmd).to_wire()))
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_parsing, benchmark_serialization);
criterion_main!(benches);
