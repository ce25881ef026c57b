// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Log records go to stderr so they never interleave with the transcript on stdout.

use std::io::Write;

use anstyle::{AnsiColor, Color, Style};
use env_logger::Target;
use log::{Level, log_enabled};

pub fn init(verbosity: u8) {
    let mut builder = env_logger::Builder::new();

    builder
        .target(Target::Stderr)
        .format_indent(Some(12))
        .filter(None, verbosity_level(verbosity).to_level_filter())
        // `RUST_LOG` refines the level chosen on the command line
        .parse_default_env()
        .format(|f, record| {
            let style = f.default_level_style(record.level()).bold();

            if let Some(pid) = record.key_values().get("pid".into()) {
                let style = style.fg_color(Some(Color::Ansi(AnsiColor::Green)));

                write!(f, "{style}{:>12}{style:#} ", format!("[{pid}]"))?;
            } else {
                write!(
                    f,
                    "{style}{:>12}{style:#} ",
                    prettyprint_level(record.level())
                )?;
            }

            if log_enabled!(Level::Debug) {
                let style = Style::new().fg_color(Some(Color::Ansi(AnsiColor::BrightBlack)));

                write!(f, "{style}[{}]{style:#} ", record.target())?;
            }

            writeln!(f, "{}", record.args())
        })
        .init();
}

/// This maps the occurrence of `--verbose` flags to the correct log level
fn verbosity_level(num: u8) -> Level {
    match num {
        0 => Level::Info,
        1 => Level::Debug,
        2.. => Level::Trace,
    }
}

/// The default string representation for `Level` is all uppercaps which doesn't mix well with the
/// process ids printed by the fork scenario.
fn prettyprint_level(lvl: Level) -> &'static str {
    match lvl {
        Level::Error => "Error",
        Level::Warn => "Warn",
        Level::Info => "Info",
        Level::Debug => "Debug",
        Level::Trace => "Trace",
    }
}
