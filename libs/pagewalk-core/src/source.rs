// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::str::FromStr;
use std::io;

use crate::paging::FRAME_ADDRESS_MASK;
use crate::{Error, PhysicalAddress};

/// Provides the physical address of the calling process' top-level page table.
///
/// On x86-64 this is the value of the `CR3` register, which can only be read with privileges.
pub trait ControlRegisterSource {
    /// Returns the physical base address of the currently active top-level page table.
    ///
    /// Implementations must not cache the value: it legitimately differs between processes (e.g.
    /// the two sides of a fork) and over time.
    ///
    /// # Errors
    ///
    /// Returns an error when the source is unreachable or its record cannot be parsed. Such
    /// errors are fatal, retrying a privileged read is not expected to change the outcome.
    fn top_level_table(&mut self) -> Result<PhysicalAddress, Error>;
}

/// Reads raw physical memory at absolute offsets.
pub trait PhysicalMemoryReader {
    /// Reads up to `buf.len()` bytes of physical memory starting at `address`.
    ///
    /// Returns the number of bytes read, which may be less than requested. Callers must not
    /// assume the remainder of `buf` was zero-filled.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying reader failed.
    fn read_at(&mut self, address: PhysicalAddress, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: ControlRegisterSource + ?Sized> ControlRegisterSource for &mut T {
    fn top_level_table(&mut self) -> Result<PhysicalAddress, Error> {
        (**self).top_level_table()
    }
}

impl<T: PhysicalMemoryReader + ?Sized> PhysicalMemoryReader for &mut T {
    fn read_at(&mut self, address: PhysicalAddress, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(address, buf)
    }
}

/// The control register record exposed by the helper kernel module.
///
/// The record consists of a mandatory first line `CR3=<16 uppercase hex digits>` optionally
/// followed by `CR4=<hex>`, `PAE=<0|1>` and `PSE=<0|1>` lines. Unknown lines are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRegisters {
    pub cr3: u64,
    pub cr4: Option<u64>,
    /// Physical Address Extension (CR4 bit 5).
    pub pae: Option<bool>,
    /// Page Size Extensions (CR4 bit 4).
    pub pse: Option<bool>,
}

impl ControlRegisters {
    /// The physical address of the top-level table referenced by CR3.
    ///
    /// The low 12 bits of CR3 hold the PCID (or the PWT/PCD cache control bits) and are not
    /// part of the address.
    pub fn top_level_table(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.cr3 & FRAME_ADDRESS_MASK)
    }
}

impl FromStr for ControlRegisters {
    type Err = Error;

    fn from_str(record: &str) -> Result<Self, Self::Err> {
        let malformed = || Error::MalformedControlRegisters {
            record: record.lines().next().unwrap_or_default().to_string(),
        };

        let mut lines = record.lines();
        let cr3 = lines
            .next()
            .and_then(|line| line.trim().strip_prefix("CR3="))
            .and_then(parse_hex)
            .ok_or_else(malformed)?;

        let mut regs = ControlRegisters {
            cr3,
            cr4: None,
            pae: None,
            pse: None,
        };

        for line in lines {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };

            match key {
                "CR4" => regs.cr4 = parse_hex(value),
                "PAE" => regs.pae = parse_hex(value).map(|v| v != 0),
                "PSE" => regs.pse = parse_hex(value).map(|v| v != 0),
                _ => log::trace!("ignoring control register line {line:?}"),
            }
        }

        Ok(regs)
    }
}

fn parse_hex(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}
