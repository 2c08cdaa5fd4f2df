// Copyright (C) 2023 Ant Group CO., Ltd. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::io::Write;

use log::{self, Level, LevelFilter, Log, Metadata, Record};

static LOGGER: SimpleLogger = SimpleLogger;

/// Install the logger. Later calls only adjust the level.
pub fn init(level: LevelFilter) {
    // Another logger may already be installed by the embedding program.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

pub fn init_from_env() {
    init(level_from_str(std::env::var("LOG").ok().as_deref()));
}

fn level_from_str(level: Option<&str>) -> LevelFilter {
    match level {
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("info") => LevelFilter::Info,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

/// Add escape sequence to print with color in Linux console
macro_rules! with_color {
    ($args: ident, $color_code: ident) => {{
        format_args!("\u{1B}[{}m{}\u{1B}[0m", $color_code as u8, $args)
    }};
}

fn print_in_color(args: fmt::Arguments, color_code: u8) {
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = out.write_fmt(with_color!(args, color_code));
}

struct SimpleLogger;

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let thread = std::thread::current();
        print_in_color(
            format_args!(
                "[{}][{}] {}\n",
                record.level(),
                thread.name().unwrap_or("-"),
                record.args(),
            ),
            level_to_color_code(record.level()),
        );
    }

    fn flush(&self) {}
}

fn level_to_color_code(level: Level) -> u8 {
    match level {
        Level::Error => 31, // Red
        Level::Warn => 93,  // BrightYellow
        Level::Info => 34,  // Blue
        Level::Debug => 32, // Green
        Level::Trace => 90, // BrightBlack
    }
}

/// Debug message prefixed with the enclave identity.
#[macro_export]
macro_rules! encl_dbg {
    ($encl: expr, $($arg:tt)*) => {
        log::debug!("[sgx:{:#x}] [{:#x}:{:#x}] {}", $encl.id(), $encl.base(),
            $encl.base() + $encl.size(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! encl_info {
    ($encl: expr, $($arg:tt)*) => {
        log::info!("[sgx:{:#x}] [{:#x}:{:#x}] {}", $encl.id(), $encl.base(),
            $encl.base() + $encl.size(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! encl_warn {
    ($encl: expr, $($arg:tt)*) => {
        log::warn!("[sgx:{:#x}] [{:#x}:{:#x}] {}", $encl.id(), $encl.base(),
            $encl.base() + $encl.size(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! encl_err {
    ($encl: expr, $($arg:tt)*) => {
        log::error!("[sgx:{:#x}] [{:#x}:{:#x}] {}", $encl.id(), $encl.base(),
            $encl.base() + $encl.size(), format_args!($($arg)*))
    };
}
