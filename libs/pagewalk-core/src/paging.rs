// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

// ===== Paging Mode =====
// ===== Describing the shape of the page table hierarchy the walker descends =====

use core::fmt;

use crate::VirtualAddress;

/// Number of bits covered by the in-page offset.
pub const PAGE_SHIFT: u32 = 12;
/// Size of a page, and therefore of every page table, in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask selecting the in-page offset of an address.
pub const PAGE_OFFSET_MASK: u64 = (1 << PAGE_SHIFT) - 1;
/// Number of virtual address bits consumed by each level of the hierarchy.
pub const INDEX_BITS: u32 = 9;
/// Mask selecting a table index once it has been shifted down.
pub const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
/// Number of entries in every page table.
pub const ENTRIES_PER_TABLE: usize = 1 << INDEX_BITS;
/// Size of a single page table entry in bytes.
pub const ENTRY_SIZE: usize = size_of::<u64>();
/// Number of levels in the hierarchy.
pub const LEVELS: usize = 4;
/// Bits 12..=47 of an entry hold the physical address of the next table or the final frame.
pub const FRAME_ADDRESS_MASK: u64 = 0x0000_ffff_ffff_f000;

const _: () = assert!(ENTRIES_PER_TABLE * ENTRY_SIZE == PAGE_SIZE);

/// x86-64 4-level paging with 4KiB pages.
pub static X86_64_4LEVEL: PagingMode = PagingMode::new(
    "x86-64 4-level",
    [
        PageTableLevel::new("PML4", 4),
        PageTableLevel::new("PDPT", 3),
        PageTableLevel::new("PD", 2),
        PageTableLevel::new("PT", 1),
    ],
);

/// The shape of the page table hierarchy: an ordered list of levels, from the top-level table
/// down to the table whose entries point at the final frames.
#[derive(Debug)]
pub struct PagingMode {
    description: &'static str,
    levels: [PageTableLevel; LEVELS],
}

impl PagingMode {
    const fn new(description: &'static str, levels: [PageTableLevel; LEVELS]) -> Self {
        Self {
            description,
            levels,
        }
    }

    pub const fn description(&self) -> &'static str {
        self.description
    }

    /// The levels of this mode, top-level table first.
    pub const fn levels(&self) -> &[PageTableLevel] {
        &self.levels
    }

    /// Returns the level that is consulted while `depth` levels remain to be resolved.
    ///
    /// Depth `LEVELS` is the top-level table, depth `1` the last table before the frame. There is
    /// no level for depth `0`, at that point the walk holds a frame address.
    pub fn level_for_depth(&self, depth: usize) -> Option<&PageTableLevel> {
        let idx = LEVELS.checked_sub(depth)?;
        self.levels.get(idx)
    }
}

/// A single level of the page table hierarchy.
#[derive(Debug, PartialEq, Eq)]
pub struct PageTableLevel {
    /// The name of the page table level, for diagnostic output.
    name: &'static str,
    /// How many levels remain below and including this one.
    depth: usize,
    /// The number of bits we need to right-shift a [`VirtualAddress`] by to obtain its entry
    /// index for this level. Used by [`Self::index_of`].
    index_shift: u32,
}

impl PageTableLevel {
    #[expect(clippy::cast_possible_truncation, reason = "depth is at most LEVELS")]
    const fn new(name: &'static str, depth: usize) -> Self {
        Self {
            name,
            depth,
            index_shift: PAGE_SHIFT + INDEX_BITS * (depth as u32 - 1),
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn depth(&self) -> usize {
        self.depth
    }

    pub const fn index_shift(&self) -> u32 {
        self.index_shift
    }

    /// The number of bytes of address space covered by a single entry at this level.
    ///
    /// - PT: 4KiB (2^12)
    /// - PD: 2MiB (2^21)
    /// - PDPT: 1GiB (2^30)
    /// - PML4: 512GiB (2^39)
    pub const fn page_size(&self) -> u64 {
        1 << self.index_shift
    }

    /// Extracts the index of the entry a table at this level holds for `address`.
    #[expect(clippy::cast_possible_truncation, reason = "masked to 9 bits")]
    pub const fn index_of(&self, address: VirtualAddress) -> usize {
        ((address.get() >> self.index_shift) & INDEX_MASK) as usize
    }
}

impl fmt::Display for PageTableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_shifts() {
        let shifts: Vec<_> = X86_64_4LEVEL
            .levels()
            .iter()
            .map(PageTableLevel::index_shift)
            .collect();
        assert_eq!(shifts, [39, 30, 21, 12]);
    }

    #[test]
    fn level_for_depth() {
        assert_eq!(X86_64_4LEVEL.level_for_depth(4).unwrap().name(), "PML4");
        assert_eq!(X86_64_4LEVEL.level_for_depth(1).unwrap().name(), "PT");
        assert!(X86_64_4LEVEL.level_for_depth(0).is_none());
        assert!(X86_64_4LEVEL.level_for_depth(5).is_none());
    }

    #[test]
    fn page_sizes() {
        let sizes: Vec<_> = X86_64_4LEVEL
            .levels()
            .iter()
            .map(PageTableLevel::page_size)
            .collect();
        assert_eq!(sizes, [512 << 30, 1 << 30, 2 << 20, 4 << 10]);
    }

    #[test]
    fn index_of() {
        let pt = X86_64_4LEVEL.level_for_depth(1).unwrap();
        assert_eq!(pt.index_of(VirtualAddress::new(0x401000)), 1);

        let pd = X86_64_4LEVEL.level_for_depth(2).unwrap();
        assert_eq!(pd.index_of(VirtualAddress::new(0x401000)), 2);
    }
}
