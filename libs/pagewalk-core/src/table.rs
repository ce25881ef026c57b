// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::str::FromStr;

use crate::PageTableEntry;
use crate::paging::{ENTRIES_PER_TABLE, ENTRY_SIZE, PAGE_SIZE};

/// A snapshot of one page table: exactly 512 entries read from one 4KiB page of physical memory.
///
/// Tables are transient, they are read, inspected and dropped within a single step of the walk.
/// Nothing is cached across translations so changes made by the operating system in the
/// meantime (e.g. a copy-on-write re-mapping) are always observed.
#[derive(Clone)]
pub struct PageTable {
    entries: Box<[PageTableEntry; ENTRIES_PER_TABLE]>,
}

impl PageTable {
    /// Parses a table from the raw little-endian contents of a physical page.
    ///
    /// Returns `None` unless `bytes` is exactly [`PAGE_SIZE`] long. An incomplete table is never
    /// partially interpreted.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PAGE_SIZE {
            return None;
        }

        let mut entries = Box::new([PageTableEntry::new(); ENTRIES_PER_TABLE]);
        for (entry, chunk) in entries.iter_mut().zip(bytes.chunks_exact(ENTRY_SIZE)) {
            let raw = u64::from_le_bytes(chunk.try_into().ok()?);
            *entry = PageTableEntry::from_bits(raw);
        }

        Some(Self { entries })
    }

    /// Returns the entry at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not less than 512.
    pub fn entry(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.entries.iter().copied().enumerate()
    }

    /// The entries worth reporting in a diagnostic dump, according to `filter`.
    pub fn dump(&self, filter: DumpFilter) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.iter().filter(move |(_, entry)| filter.matches(entry))
    }
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.dump(DumpFilter::NonZero)).finish()
    }
}

/// Selects which entries of a table show up in the per-level dump.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum DumpFilter {
    /// Entries whose present bit is set.
    #[default]
    Present,
    /// Every entry that is not all zeroes.
    ///
    /// After a fork the operating system may mark entries in ways that hide them from a
    /// present-only dump while they still hold a valid frame address worth displaying.
    #[cfg_attr(feature = "serde", serde(alias = "nonzero"))]
    NonZero,
}

impl DumpFilter {
    pub fn matches(self, entry: &PageTableEntry) -> bool {
        match self {
            DumpFilter::Present => entry.is_present(),
            DumpFilter::NonZero => !entry.is_zero(),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            DumpFilter::Present => "present",
            DumpFilter::NonZero => "non-zero",
        }
    }
}

impl fmt::Display for DumpFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDumpFilterError(String);

impl fmt::Display for ParseDumpFilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown dump filter `{}`, expected `present` or `non-zero`",
            self.0
        )
    }
}

impl core::error::Error for ParseDumpFilterError {}

impl FromStr for DumpFilter {
    type Err = ParseDumpFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(DumpFilter::Present),
            "non-zero" | "nonzero" => Ok(DumpFilter::NonZero),
            _ => Err(ParseDumpFilterError(s.to_string())),
        }
    }
}
