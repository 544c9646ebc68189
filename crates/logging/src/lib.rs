// Copyright (c) 2025 The domon Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io::Write;
use std::process;

use slog::{o, Drain, Level, Logger};

const DEFAULT_SUBSYSTEM: &str = "root";

// Creates a logger which prints output as JSON records to the specified
// writer.
//
// Note: the returned guard must be kept alive for the lifetime of the
// logger; dropping it flushes and shuts down the asynchronous drain.
pub fn create_logger<W>(
    name: &str,
    source: &str,
    level: Level,
    writer: W,
) -> (Logger, slog_async::AsyncGuard)
where
    W: Write + Send + Sync + 'static,
{
    let json_drain = slog_json::Json::new(writer)
        .add_default_keys()
        .build()
        .fuse();

    // Allow runtime filtering of records by log level
    let filter_drain = json_drain.filter_level(level).fuse();

    // Ensure the logger is thread-safe
    let (async_drain, guard) = slog_async::Async::new(filter_drain)
        .thread_name("domon-logger".into())
        .build_with_guard();

    // Add some "standard" fields
    let logger = Logger::root(
        async_drain.fuse(),
        o!("version" => env!("CARGO_PKG_VERSION"),
            "subsystem" => DEFAULT_SUBSYSTEM,
            "pid" => process::id().to_string(),
            "name" => name.to_string(),
            "source" => source.to_string()),
    );

    (logger, guard)
}

// Creates a logger that writes human-readable records to stderr, used when
// the orchestrator stays in the foreground.
pub fn create_term_logger(level: Level) -> (Logger, slog_async::AsyncGuard) {
    let term_drain = slog_term::term_compact().filter_level(level).fuse();

    let (async_drain, guard) = slog_async::Async::new(term_drain)
        .thread_name("domon-logger".into())
        .build_with_guard();

    let logger = Logger::root(async_drain.fuse(), o!("subsystem" => DEFAULT_SUBSYSTEM));

    (logger, guard)
}

// Map between a level string and a slog log level.
const LEVEL_NAMES: &[(&str, Level)] = &[
    ("critical", Level::Critical),
    ("error", Level::Error),
    ("warn", Level::Warning),
    ("info", Level::Info),
    ("debug", Level::Debug),
    ("trace", Level::Trace),
];

pub const DEFAULT_LEVEL: Level = Level::Info;

pub fn get_log_levels() -> Vec<&'static str> {
    LEVEL_NAMES.iter().map(|(name, _)| *name).collect()
}

pub fn level_name_to_slog_level(name: &str) -> Result<Level, String> {
    for (n, level) in LEVEL_NAMES {
        if *n == name {
            return Ok(*level);
        }
    }

    Err(format!("invalid log level name: {:?}", name))
}

pub fn slog_level_to_level_name(level: Level) -> Result<&'static str, String> {
    for (name, l) in LEVEL_NAMES {
        if *l == level {
            return Ok(name);
        }
    }

    Err(format!("invalid slog level: {:?}", level))
}
