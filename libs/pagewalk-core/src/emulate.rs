// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A synthetic machine for exercising the walker without any privileges.
//!
//! [`EmulatedMemory`] is a sparse physical memory made of 4KiB frames that behaves like the
//! `/proc/page_reader` file: reads never cross a page boundary and reading a frame that was never
//! written returns no data at all. [`EmulatedMachine`] builds 4-level page tables on top of it
//! and models the parts of the operating system the walker is meant to observe, most importantly
//! copy-on-write after a fork.

use core::{cmp, fmt};
use std::collections::BTreeMap;
use std::io;

use crate::paging::{
    ENTRIES_PER_TABLE, ENTRY_SIZE, FRAME_ADDRESS_MASK, LEVELS, PAGE_SIZE, X86_64_4LEVEL,
};
use crate::{
    ControlRegisterSource, Error, PageTableEntry, PhysicalAddress, PhysicalMemoryReader,
    VirtualAddress,
};

const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// Present, writable and user accessible. Used for intermediate tables created by
/// [`EmulatedMachine::map`].
pub const TABLE_FLAGS: u64 = 0x007;
/// Present, writable, user accessible, accessed and dirty.
pub const DATA_FLAGS: u64 = 0x067;

pub struct EmulatedMemory {
    frames: BTreeMap<PhysicalAddress, Box<[u8]>>,
    read_limits: BTreeMap<PhysicalAddress, usize>,
    reads: usize,
}

impl fmt::Debug for EmulatedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedMemory")
            .field("frames", &self.frames.keys().collect::<Vec<_>>())
            .field("read_limits", &self.read_limits)
            .field("reads", &self.reads)
            .finish()
    }
}

impl Default for EmulatedMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedMemory {
    pub fn new() -> Self {
        Self {
            frames: BTreeMap::new(),
            read_limits: BTreeMap::new(),
            reads: 0,
        }
    }

    /// Returns the frame containing `address`, backing it with zeroes first if necessary.
    fn frame_mut(&mut self, address: PhysicalAddress) -> (&mut [u8], usize) {
        let base = address.align_down(PAGE_SIZE_U64);
        let offset = offset_in_page(address);
        let frame = self
            .frames
            .entry(base)
            .or_insert_with(|| vec![0; PAGE_SIZE].into_boxed_slice());

        (&mut frame[..], offset)
    }

    /// Backs the frame at `frame` with zeroes, discarding any previous content.
    pub fn zero_frame(&mut self, frame: PhysicalAddress) {
        let (frame, _) = self.frame_mut(frame);
        frame.fill(0);
    }

    /// Writes `bytes` starting at `address`, backing frames as needed.
    pub fn write_bytes(&mut self, address: PhysicalAddress, bytes: &[u8]) {
        let mut address = address;
        let mut bytes = bytes;

        while !bytes.is_empty() {
            let (frame, offset) = self.frame_mut(address);
            let len = cmp::min(bytes.len(), PAGE_SIZE - offset);
            frame[offset..offset + len].copy_from_slice(&bytes[..len]);

            bytes = &bytes[len..];
            address = address.wrapping_add(len as u64);
        }
    }

    /// Reads `len` bytes starting at `address`. Unbacked memory reads as zeroes.
    pub fn read_bytes(&self, address: PhysicalAddress, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut address = address;

        while out.len() < len {
            let offset = offset_in_page(address);
            let chunk = cmp::min(len - out.len(), PAGE_SIZE - offset);

            match self.frames.get(&address.align_down(PAGE_SIZE_U64)) {
                Some(frame) => out.extend_from_slice(&frame[offset..offset + chunk]),
                None => out.resize(out.len() + chunk, 0),
            }

            address = address.wrapping_add(chunk as u64);
        }

        out
    }

    /// Writes the raw 64-bit entry `entry` into slot `index` of the table at `table`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not less than 512.
    pub fn write_entry(&mut self, table: PhysicalAddress, index: usize, entry: u64) {
        assert!(index < ENTRIES_PER_TABLE, "entry index {index} out of bounds");
        let slot = table
            .align_down(PAGE_SIZE_U64)
            .wrapping_add((index * ENTRY_SIZE) as u64);
        self.write_bytes(slot, &entry.to_le_bytes());
    }

    /// Reads slot `index` of the table at `table`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not less than 512.
    pub fn read_entry(&self, table: PhysicalAddress, index: usize) -> PageTableEntry {
        assert!(index < ENTRIES_PER_TABLE, "entry index {index} out of bounds");
        let slot = table
            .align_down(PAGE_SIZE_U64)
            .wrapping_add((index * ENTRY_SIZE) as u64);

        let mut raw = [0; ENTRY_SIZE];
        raw.copy_from_slice(&self.read_bytes(slot, ENTRY_SIZE));
        PageTableEntry::from_bits(u64::from_le_bytes(raw))
    }

    /// Copies the full contents of the frame at `from` into the frame at `to`.
    pub fn copy_frame(&mut self, from: PhysicalAddress, to: PhysicalAddress) {
        let bytes = self.read_bytes(from.align_down(PAGE_SIZE_U64), PAGE_SIZE);
        self.write_bytes(to.align_down(PAGE_SIZE_U64), &bytes);
    }

    /// Makes reads of the frame containing `frame` stop after `limit` bytes into the frame.
    ///
    /// Used to inject short reads.
    pub fn limit_reads(&mut self, frame: PhysicalAddress, limit: usize) {
        self.read_limits.insert(frame.align_down(PAGE_SIZE_U64), limit);
    }

    /// The number of reads served so far.
    pub fn reads(&self) -> usize {
        self.reads
    }
}

impl PhysicalMemoryReader for EmulatedMemory {
    fn read_at(&mut self, address: PhysicalAddress, buf: &mut [u8]) -> io::Result<usize> {
        self.reads += 1;

        let base = address.align_down(PAGE_SIZE_U64);
        let offset = offset_in_page(address);
        let Some(frame) = self.frames.get(&base) else {
            log::trace!("read of unbacked frame {base}");
            return Ok(0);
        };

        let end = self
            .read_limits
            .get(&base)
            .map_or(PAGE_SIZE, |limit| cmp::min(*limit, PAGE_SIZE));
        let len = cmp::min(buf.len(), end.saturating_sub(offset));

        buf[..len].copy_from_slice(&frame[offset..offset + len]);
        Ok(len)
    }
}

/// Hands out consecutive, never reused frames starting at a base address.
#[derive(Debug)]
pub struct FrameAllocator {
    next: PhysicalAddress,
}

impl FrameAllocator {
    pub fn new(start: PhysicalAddress) -> Self {
        Self {
            next: start.align_down(PAGE_SIZE_U64),
        }
    }

    pub fn allocate(&mut self) -> PhysicalAddress {
        let frame = self.next;
        self.next = self.next.wrapping_add(PAGE_SIZE_U64);
        frame
    }
}

/// An emulated address space, identified by the physical address of its top-level table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatedAddressSpace {
    root: PhysicalAddress,
}

impl EmulatedAddressSpace {
    /// The value `CR3` would hold while this address space is active.
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }
}

impl ControlRegisterSource for EmulatedAddressSpace {
    fn top_level_table(&mut self) -> Result<PhysicalAddress, Error> {
        Ok(self.root)
    }
}

/// A control register source that always returns the same top-level table.
#[derive(Debug, Clone, Copy)]
pub struct FixedControlRegister(pub PhysicalAddress);

impl ControlRegisterSource for FixedControlRegister {
    fn top_level_table(&mut self) -> Result<PhysicalAddress, Error> {
        Ok(self.0)
    }
}

/// Emulated physical memory plus the bookkeeping an operating system needs to build page tables
/// and share frames copy-on-write between address spaces.
#[derive(Debug)]
pub struct EmulatedMachine {
    memory: EmulatedMemory,
    frame_alloc: FrameAllocator,
    /// How many address spaces map each copy-on-write frame.
    shared: BTreeMap<PhysicalAddress, usize>,
}

impl Default for EmulatedMachine {
    fn default() -> Self {
        Self::new(PhysicalAddress::new(0x10_0000))
    }
}

impl EmulatedMachine {
    /// Creates a machine allocating frames upwards from `first_frame`.
    pub fn new(first_frame: PhysicalAddress) -> Self {
        Self {
            memory: EmulatedMemory::new(),
            frame_alloc: FrameAllocator::new(first_frame),
            shared: BTreeMap::new(),
        }
    }

    pub fn memory(&self) -> &EmulatedMemory {
        &self.memory
    }

    /// Allocates a zeroed frame.
    pub fn allocate_frame(&mut self) -> PhysicalAddress {
        let frame = self.frame_alloc.allocate();
        self.memory.zero_frame(frame);
        frame
    }

    /// Creates an empty address space with a freshly allocated top-level table.
    pub fn new_address_space(&mut self) -> EmulatedAddressSpace {
        EmulatedAddressSpace {
            root: self.allocate_frame(),
        }
    }

    /// Maps the page containing `virt` to a freshly allocated zeroed frame and returns the frame.
    pub fn map(&mut self, aspace: EmulatedAddressSpace, virt: VirtualAddress) -> PhysicalAddress {
        let frame = self.allocate_frame();
        self.map_frame(aspace, virt, frame, DATA_FLAGS);
        frame
    }

    /// Maps the page containing `virt` to `frame` with the given flags, creating intermediate
    /// tables as needed. The present bit is always set.
    pub fn map_frame(
        &mut self,
        aspace: EmulatedAddressSpace,
        virt: VirtualAddress,
        frame: PhysicalAddress,
        flags: u64,
    ) {
        let levels = X86_64_4LEVEL.levels();

        let mut table = aspace.root;
        for level in &levels[..LEVELS - 1] {
            let index = level.index_of(virt);
            let entry = self.memory.read_entry(table, index);

            table = if entry.is_present() {
                entry.frame_address()
            } else {
                let next = self.allocate_frame();
                let entry = PageTableEntry::new_present(next, TABLE_FLAGS);
                self.memory.write_entry(table, index, entry.bits());
                next
            };
        }

        let index = levels[LEVELS - 1].index_of(virt);
        self.memory
            .write_entry(table, index, PageTableEntry::new_present(frame, flags).bits());
    }

    /// Returns the leaf table and index that map `virt`, if every table on the way is present.
    fn leaf_slot(
        &self,
        aspace: EmulatedAddressSpace,
        virt: VirtualAddress,
    ) -> Option<(PhysicalAddress, usize)> {
        let levels = X86_64_4LEVEL.levels();

        let mut table = aspace.root;
        for level in &levels[..LEVELS - 1] {
            let entry = self.memory.read_entry(table, level.index_of(virt));
            if !entry.is_present() {
                return None;
            }
            table = entry.frame_address();
        }

        Some((table, levels[LEVELS - 1].index_of(virt)))
    }

    /// Returns the leaf entry mapping `virt`, if every table on the way is present.
    pub fn leaf_entry(
        &self,
        aspace: EmulatedAddressSpace,
        virt: VirtualAddress,
    ) -> Option<PageTableEntry> {
        let (table, index) = self.leaf_slot(aspace, virt)?;
        Some(self.memory.read_entry(table, index))
    }

    /// Duplicates `parent` the way `fork` does: every table is copied, but the frames mapped by
    /// leaf entries are shared. Leaf entries are write protected in *both* address spaces so the
    /// first write from either side faults and gets a private copy.
    pub fn fork(&mut self, parent: EmulatedAddressSpace) -> EmulatedAddressSpace {
        let root = self.fork_table(parent.root, LEVELS);
        log::debug!("forked address space {} -> {root}", parent.root);
        EmulatedAddressSpace { root }
    }

    fn fork_table(&mut self, table: PhysicalAddress, depth: usize) -> PhysicalAddress {
        let copy = self.allocate_frame();

        for index in 0..ENTRIES_PER_TABLE {
            let entry = self.memory.read_entry(table, index);
            if !entry.is_present() {
                continue;
            }

            if depth > 1 {
                let child = self.fork_table(entry.frame_address(), depth - 1);
                let child_entry =
                    PageTableEntry::from_bits((entry.bits() & !FRAME_ADDRESS_MASK) | child.get());
                self.memory.write_entry(copy, index, child_entry.bits());
            } else {
                let protected = entry.with(PageTableEntry::WRITABLE, false);
                self.memory.write_entry(table, index, protected.bits());
                self.memory.write_entry(copy, index, protected.bits());

                *self.shared.entry(entry.frame_address()).or_insert(1) += 1;
            }
        }

        copy
    }

    /// Writes `bytes` to `virt` in `aspace`, resolving copy-on-write faults on the way.
    ///
    /// A write to a write protected page whose frame is still shared allocates a new frame,
    /// copies the contents over and re-maps the page writable for this address space only. If
    /// the frame is no longer shared the existing mapping is simply made writable again.
    ///
    /// # Panics
    ///
    /// Panics if `virt` is not mapped or the write crosses a page boundary.
    pub fn write(&mut self, aspace: EmulatedAddressSpace, virt: VirtualAddress, bytes: &[u8]) {
        assert!(
            offset_in_page(virt) + bytes.len() <= PAGE_SIZE,
            "write to {virt} crosses a page boundary"
        );

        let Some((table, index)) = self.leaf_slot(aspace, virt) else {
            panic!("write: {virt} not present");
        };
        let mut entry = self.memory.read_entry(table, index);
        assert!(entry.is_present(), "write: {virt} not present");

        if !entry.get(PageTableEntry::WRITABLE) {
            let frame = entry.frame_address();
            let sharers = self.shared.get(&frame).copied().unwrap_or(1);

            entry = if sharers > 1 {
                let private = self.allocate_frame();
                self.memory.copy_frame(frame, private);
                self.release_shared(frame);

                log::debug!("copy-on-write fault at {virt}: {frame} -> {private}");
                PageTableEntry::from_bits((entry.bits() & !FRAME_ADDRESS_MASK) | private.get())
                    .with(PageTableEntry::WRITABLE, true)
            } else {
                self.shared.remove(&frame);

                log::debug!("write fault at {virt}: reusing {frame}");
                entry.with(PageTableEntry::WRITABLE, true)
            };
        }

        let entry = entry.with(PageTableEntry::DIRTY, true);
        self.memory.write_entry(table, index, entry.bits());

        let phys = entry.frame_address().wrapping_add(virt.page_offset());
        self.memory.write_bytes(phys, bytes);
    }

    fn release_shared(&mut self, frame: PhysicalAddress) {
        if let Some(count) = self.shared.get_mut(&frame) {
            *count -= 1;
            if *count <= 1 {
                self.shared.remove(&frame);
            }
        }
    }

    /// Reads `len` bytes at `virt` in `aspace`.
    ///
    /// # Panics
    ///
    /// Panics if `virt` is not mapped.
    pub fn read(
        &self,
        aspace: EmulatedAddressSpace,
        virt: VirtualAddress,
        len: usize,
    ) -> Vec<u8> {
        let Some(entry) = self.leaf_entry(aspace, virt).filter(PageTableEntry::is_present) else {
            panic!("read: {virt} not present");
        };

        let phys = entry.frame_address().wrapping_add(virt.page_offset());
        self.memory.read_bytes(phys, len)
    }
}

impl PhysicalMemoryReader for EmulatedMachine {
    fn read_at(&mut self, address: PhysicalAddress, buf: &mut [u8]) -> io::Result<usize> {
        self.memory.read_at(address, buf)
    }
}

#[expect(clippy::cast_possible_truncation, reason = "masked to 12 bits")]
fn offset_in_page(address: impl Into<u64>) -> usize {
    (address.into() & (PAGE_SIZE_U64 - 1)) as usize
}
