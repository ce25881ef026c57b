// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod cmds;
mod config;
mod logger;
mod region;
mod session;
mod util;

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueHint};
use pagewalk_core::DumpFilter;

pub type Result<T> = color_eyre::Result<T>;

/// Helper for passing VERSION to opt.
/// If `CARGO_VERSION_INFO` is set, use it, otherwise use `CARGO_PKG_VERSION`.
fn version() -> &'static str {
    option_env!("CARGO_VERSION_INFO").unwrap_or(env!("CARGO_PKG_VERSION"))
}

/// Translates virtual addresses of this process to physical addresses by walking the page
/// tables in software.
///
/// Requires the `cr3` kernel module, which exposes the `/proc/cr3` and `/proc/page_reader`
/// files.
#[derive(Debug, Parser)]
#[clap(version = version())]
struct Pagewalk {
    #[clap(subcommand)]
    cmd: Option<Cmd>,
    #[clap(flatten)]
    options: Options,
}

#[derive(Debug, Parser)]
pub struct Options {
    /// Path to a TOML configuration file
    #[clap(short, long, global = true, env = "PAGEWALK_CONFIG", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// File holding the control register record [default: /proc/cr3]
    #[clap(long, global = true, env = "PAGEWALK_CR3", value_hint = ValueHint::FilePath)]
    cr3: Option<PathBuf>,

    /// File giving read access to physical memory [default: /proc/page_reader]
    #[clap(long, global = true, env = "PAGEWALK_PHYS_MEM", value_hint = ValueHint::FilePath)]
    phys_mem: Option<PathBuf>,

    /// Which entries of every consulted table to print: `present` or `non-zero`
    #[clap(long, global = true)]
    dump: Option<DumpFilter>,

    /// Enables verbose logging
    #[clap(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Translate the address of a buffer owned by this process (the default)
    Buffer(cmds::buffer::Cmd),
    /// Translate explicit virtual addresses
    Translate(cmds::translate::Cmd),
    /// Observe copy-on-write: translate the same address before and after a fork, and after the
    /// child wrote to it
    Fork(cmds::fork::Cmd),
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let pagewalk = Pagewalk::parse();

    logger::init(pagewalk.options.verbose);

    let config = config::Config::load(pagewalk.options.config.as_deref())?;
    log::debug!("{config:?}");

    match pagewalk
        .cmd
        .unwrap_or_else(|| Cmd::Buffer(cmds::buffer::Cmd::default()))
    {
        Cmd::Buffer(cmd) => cmd.run(&config.resolve(&pagewalk.options, DumpFilter::Present)),
        Cmd::Translate(cmd) => cmd.run(&config.resolve(&pagewalk.options, DumpFilter::Present)),
        Cmd::Fork(cmd) => cmd.run(&config.resolve(&pagewalk.options, DumpFilter::NonZero)),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Pagewalk::command().debug_assert();
    }

    #[test]
    fn default_command() {
        let pagewalk = Pagewalk::try_parse_from(["pagewalk"]).unwrap();
        assert!(pagewalk.cmd.is_none());
        assert_eq!(pagewalk.options.verbose, 0);
    }

    #[test]
    fn global_options_after_subcommand() {
        let pagewalk = Pagewalk::try_parse_from([
            "pagewalk",
            "translate",
            "--dump",
            "non-zero",
            "-vv",
            "0x401000",
            "7ffe1c3a5000",
        ])
        .unwrap();

        assert_eq!(pagewalk.options.dump, Some(DumpFilter::NonZero));
        assert_eq!(pagewalk.options.verbose, 2);
        let Some(Cmd::Translate(cmd)) = pagewalk.cmd else {
            panic!("expected translate command");
        };
        assert_eq!(cmd.addresses().len(), 2);
    }

    #[test]
    fn reject_unknown_dump_filter() {
        assert!(Pagewalk::try_parse_from(["pagewalk", "--dump", "everything"]).is_err());
    }

    #[test]
    fn translate_requires_address() {
        assert!(Pagewalk::try_parse_from(["pagewalk", "translate"]).is_err());
        assert!(Pagewalk::try_parse_from(["pagewalk", "translate", "0xnope"]).is_err());
    }
}
