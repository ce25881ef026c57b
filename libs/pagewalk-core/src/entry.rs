// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::PhysicalAddress;
use crate::paging::{FRAME_ADDRESS_MASK, PAGE_OFFSET_MASK};

mycelium_bitfield::bitfield! {
    /// A single 64-bit x86-64 page table entry.
    ///
    /// The same layout is used at every level: the address bits either point to the next table
    /// in the hierarchy or, at the last level, to the final frame.
    #[derive(PartialEq, Eq)]
    pub struct PageTableEntry<u64> {
        /// The entry refers to a valid mapping. Accessing a mapping whose entry is not present
        /// causes a page fault.
        pub const PRESENT: bool;
        /// Writes are allowed through this entry. Cleared by the operating system on both sides
        /// of a fork to implement copy-on-write.
        pub const WRITABLE: bool;
        /// User mode accesses are allowed through this entry.
        pub const USER: bool;
        pub const WRITE_THROUGH: bool;
        pub const CACHE_DISABLE: bool;
        /// Set by the CPU when the entry was used for a translation.
        pub const ACCESSED: bool;
        /// Set by the CPU when the mapped page was written to.
        pub const DIRTY: bool;
        /// Maps a 2MiB or 1GiB page directly instead of pointing to another table.
        pub const HUGE: bool;
        pub const GLOBAL: bool;
        /// Available for use by the operating system.
        pub const AVAILABLE = 3;
        /// Bits 12..=47: the physical frame number of the next table or the final frame.
        pub const ADDRESS = 36;
        /// Ignored by the CPU.
        const _IGNORED = 11;
        pub const PROTECTION_KEY = 4;
        /// Instruction fetches are not allowed through this entry.
        pub const NO_EXECUTE: bool;
    }
}

impl PageTableEntry {
    /// Returns a present entry pointing at `address` with the given low flag bits.
    pub fn new_present(address: PhysicalAddress, flags: u64) -> Self {
        Self::from_bits(
            (address.get() & FRAME_ADDRESS_MASK) | (flags & PAGE_OFFSET_MASK) | 1,
        )
    }

    /// The physical address this entry points to, with all flag bits masked off.
    pub fn frame_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.bits() & FRAME_ADDRESS_MASK)
    }

    /// The low 12 flag bits of this entry.
    pub fn flags(&self) -> u64 {
        self.bits() & PAGE_OFFSET_MASK
    }

    pub fn is_present(&self) -> bool {
        self.get(Self::PRESENT)
    }

    pub fn is_zero(&self) -> bool {
        self.bits() == 0
    }

    /// Returns a short human-readable summary of the entry's flags, e.g. `P W U A D NX`.
    ///
    /// Absent flags are rendered as `-` so that columns line up across a table dump and a
    /// read-only marking after a fork stands out.
    pub fn describe(&self) -> Flags {
        Flags(*self)
    }
}

/// Display helper returned by [`PageTableEntry::describe`].
pub struct Flags(PageTableEntry);

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let e = &self.0;
        let flag = |set: bool, c: &'static str| if set { c } else { "-" };

        write!(
            f,
            "{} {} {} {} {} {}",
            flag(e.get(PageTableEntry::PRESENT), "P"),
            flag(e.get(PageTableEntry::WRITABLE), "W"),
            flag(e.get(PageTableEntry::USER), "U"),
            flag(e.get(PageTableEntry::ACCESSED), "A"),
            flag(e.get(PageTableEntry::DIRTY), "D"),
            flag(e.get(PageTableEntry::HUGE), "H"),
        )?;

        if e.get(PageTableEntry::NO_EXECUTE) {
            f.write_str(" NX")?;
        }

        Ok(())
    }
}
