// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Minimal `log` backend printing `[YYYY-MM-DD HH:MM:SS] message` lines with
//! the timestamp colored by level.

use colored::{ColoredString, Colorize};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::io::Write;
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;

pub const LOG_LEVEL_ENV: &str = "DD_LOG_LEVEL";

const TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

struct TimestampLogger {
    level: LevelFilter,
}

impl Log for TimestampLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let line = format_line(record.level(), now, &record.args().to_string());
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{line}");
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }
}

/// Installs the logger. `DD_LOG_LEVEL` wins over `default_level` when it
/// holds a valid level name.
pub fn init(default_level: LevelFilter) -> Result<(), SetLoggerError> {
    let level = level_from_env(std::env::var(LOG_LEVEL_ENV).ok().as_deref()).unwrap_or(default_level);
    log::set_boxed_logger(Box::new(TimestampLogger { level }))?;
    log::set_max_level(level);
    Ok(())
}

fn level_from_env(value: Option<&str>) -> Option<LevelFilter> {
    value.and_then(|v| v.trim().parse().ok())
}

fn format_line(level: Level, at: OffsetDateTime, message: &str) -> String {
    let stamp = at
        .format(TIMESTAMP_FORMAT)
        .unwrap_or_else(|_| at.unix_timestamp().to_string());
    format!("{} {message}", colorize(level, format!("[{stamp}]")))
}

fn colorize(level: Level, text: String) -> ColoredString {
    match level {
        Level::Error => text.red(),
        Level::Warn => text.yellow(),
        Level::Info => text.green(),
        Level::Debug | Level::Trace => text.blue(),
    }
}
