// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io::{self, Write};
use std::time::Duration;

use color_eyre::eyre::{Context, ensure};
use pagewalk_core::VirtualAddress;

pub fn parse_secs(s: &str) -> crate::Result<Duration> {
    s.parse::<u64>()
        .map(Duration::from_secs)
        .context("not a valid number of seconds")
}

/// Parses a hexadecimal virtual address, with or without `0x` prefix. `_` may be used as a
/// digit separator.
pub fn parse_address(s: &str) -> crate::Result<VirtualAddress> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
        .replace('_', "");
    ensure!(!digits.is_empty(), "empty address");

    u64::from_str_radix(&digits, 16)
        .map(VirtualAddress::new)
        .with_context(|| format!("`{s}` is not a hexadecimal address"))
}

/// Writes `s` to stdout and flushes it right away.
///
/// Used before `fork` and after each transcript so buffered output is neither duplicated into
/// the child nor interleaved between the two processes.
pub fn print_flush(s: &str) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(s.as_bytes())?;
    stdout.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses() {
        assert_eq!(
            parse_address("0x401000").unwrap(),
            VirtualAddress::new(0x40_1000)
        );
        assert_eq!(
            parse_address("7FFE1C3A5000").unwrap(),
            VirtualAddress::new(0x7ffe_1c3a_5000)
        );
        assert_eq!(
            parse_address("0x0000_7fff_ffff_f000").unwrap(),
            VirtualAddress::new(0x7fff_ffff_f000)
        );
        assert_eq!(
            parse_address("ffffffffffffffff").unwrap(),
            VirtualAddress::new(u64::MAX)
        );
    }

    #[test]
    fn bad_addresses() {
        for s in ["", "0x", "xyz", "0x1_0000_0000_0000_0000", "-1", "0x 1000"] {
            assert!(parse_address(s).is_err(), "{s:?}");
        }
    }

    #[test]
    fn seconds() {
        assert_eq!(parse_secs("3").unwrap(), Duration::from_secs(3));
        assert!(parse_secs("1.5").is_err());
        assert!(parse_secs("-1").is_err());
    }
}
