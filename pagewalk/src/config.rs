// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::Help;
use color_eyre::eyre::Context;
use pagewalk_core::DumpFilter;
use pagewalk_core::procfs::{DEFAULT_CONTROL_REGISTERS_PATH, DEFAULT_PHYSICAL_MEMORY_PATH};
use serde::Deserialize;

use crate::Options;

const DEFAULT_CHILD_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_PARENT_DELAY: Duration = Duration::from_secs(3);

/// The optional configuration file.
///
/// ```toml
/// cr3-path = "/proc/cr3"
/// phys-mem-path = "/proc/page_reader"
/// dump = "non-zero"
///
/// [fork]
/// child-delay = 1
/// parent-delay = 3
/// ```
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub cr3_path: Option<PathBuf>,
    pub phys_mem_path: Option<PathBuf>,
    pub dump: Option<DumpFilter>,
    #[serde(default)]
    pub fork: ForkConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ForkConfig {
    /// In seconds.
    pub child_delay: Option<u64>,
    /// In seconds.
    pub parent_delay: Option<u64>,
}

/// Everything a command needs to know, after merging the command line, the configuration file
/// and the built-in defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub cr3_path: PathBuf,
    pub phys_mem_path: PathBuf,
    pub dump: DumpFilter,
    pub child_delay: Duration,
    pub parent_delay: Duration,
}

impl Config {
    /// Loads the configuration file at `path`, or returns the empty configuration if there is
    /// none.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))
            .suggestion("valid keys are `cr3-path`, `phys-mem-path`, `dump` and `[fork]`")
    }

    fn from_toml(contents: &str) -> crate::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Merges the configuration with the command line. Options given on the command line (or
    /// through their environment variables) take precedence, `default_dump` is used if neither
    /// selects a dump filter.
    pub fn resolve(&self, options: &Options, default_dump: DumpFilter) -> Settings {
        let pick = |cli: &Option<PathBuf>, file: &Option<PathBuf>, default: &str| {
            cli.as_ref()
                .or(file.as_ref())
                .cloned()
                .unwrap_or_else(|| PathBuf::from(default))
        };

        Settings {
            cr3_path: pick(&options.cr3, &self.cr3_path, DEFAULT_CONTROL_REGISTERS_PATH),
            phys_mem_path: pick(
                &options.phys_mem,
                &self.phys_mem_path,
                DEFAULT_PHYSICAL_MEMORY_PATH,
            ),
            dump: options.dump.or(self.dump).unwrap_or(default_dump),
            child_delay: self
                .fork
                .child_delay
                .map_or(DEFAULT_CHILD_DELAY, Duration::from_secs),
            parent_delay: self
                .fork
                .parent_delay
                .map_or(DEFAULT_PARENT_DELAY, Duration::from_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn options(args: &[&str]) -> Options {
        use clap::Parser;

        #[derive(Parser)]
        struct Wrapper {
            #[clap(flatten)]
            options: Options,
        }

        Wrapper::try_parse_from(std::iter::once("pagewalk").chain(args.iter().copied()))
            .unwrap()
            .options
    }

    #[test]
    fn parse_full() {
        let config = Config::from_toml(indoc! {r#"
            cr3-path = "/tmp/cr3"
            phys-mem-path = "/tmp/mem"
            dump = "non-zero"

            [fork]
            child-delay = 2
            parent-delay = 5
        "#})
        .unwrap();

        assert_eq!(config.cr3_path.as_deref(), Some(Path::new("/tmp/cr3")));
        assert_eq!(config.phys_mem_path.as_deref(), Some(Path::new("/tmp/mem")));
        assert_eq!(config.dump, Some(DumpFilter::NonZero));
        assert_eq!(config.fork.child_delay, Some(2));
        assert_eq!(config.fork.parent_delay, Some(5));
    }

    #[test]
    fn reject_unknown_keys() {
        assert!(Config::from_toml("cr4-path = \"/proc/cr4\"").is_err());
        assert!(Config::from_toml("[fork]\ngrandchild-delay = 1").is_err());
        assert!(Config::from_toml("dump = \"everything\"").is_err());
    }

    #[test]
    fn defaults() {
        let settings = Config::default().resolve(&options(&[]), DumpFilter::Present);

        assert_eq!(
            settings,
            Settings {
                cr3_path: PathBuf::from("/proc/cr3"),
                phys_mem_path: PathBuf::from("/proc/page_reader"),
                dump: DumpFilter::Present,
                child_delay: Duration::from_secs(1),
                parent_delay: Duration::from_secs(3),
            }
        );

        let settings = Config::default().resolve(&options(&[]), DumpFilter::NonZero);
        assert_eq!(settings.dump, DumpFilter::NonZero);
    }

    #[test]
    fn command_line_wins() {
        let config = Config::from_toml(indoc! {r#"
            cr3-path = "/tmp/cr3"
            dump = "non-zero"
        "#})
        .unwrap();

        let settings = config.resolve(&options(&[]), DumpFilter::Present);
        assert_eq!(settings.cr3_path, PathBuf::from("/tmp/cr3"));
        assert_eq!(settings.dump, DumpFilter::NonZero);

        let settings = config.resolve(
            &options(&["--cr3", "/run/cr3", "--dump", "present"]),
            DumpFilter::NonZero,
        );
        assert_eq!(settings.cr3_path, PathBuf::from("/run/cr3"));
        assert_eq!(settings.phys_mem_path, PathBuf::from("/proc/page_reader"));
        assert_eq!(settings.dump, DumpFilter::Present);
    }
}
