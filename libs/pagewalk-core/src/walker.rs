// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use arrayvec::ArrayVec;

use crate::paging::{FRAME_ADDRESS_MASK, LEVELS, PAGE_SIZE, X86_64_4LEVEL};
use crate::{
    AddressParts, Error, Observer, PageTable, PageTableEntry, PageTableLevel, PagingMode,
    PhysicalAddress, PhysicalMemoryReader, VirtualAddress,
};

/// Translates virtual addresses by walking the page table hierarchy in physical memory.
///
/// The walker holds no state between translations: every table is re-read from physical memory
/// on every call, so repeated translations observe changes the operating system made in the
/// meantime.
#[derive(Debug)]
pub struct Walker<R> {
    reader: R,
    mode: &'static PagingMode,
}

impl<R: PhysicalMemoryReader> Walker<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            mode: &X86_64_4LEVEL,
        }
    }

    pub fn mode(&self) -> &'static PagingMode {
        self.mode
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    pub fn reader_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Translates `virt` starting from the top-level table at `top_level`.
    ///
    /// The final physical address is the frame the walk arrives at plus the page offset of
    /// `virt`. The `observer` is informed about every step of the walk, including the summary
    /// for failed translations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PartialTableRead`] if fewer than 4096 bytes could be read for any of the
    /// tables and [`Error::TableRead`] if the reader failed. Both errors only affect this
    /// translation.
    pub fn translate<O: Observer>(
        &mut self,
        top_level: PhysicalAddress,
        virt: VirtualAddress,
        mut observer: O,
    ) -> Result<Translation, Error> {
        let parts = virt.decompose();
        log::trace!("translating {parts}");
        observer.visit_decomposed(&parts);

        let mut steps = ArrayVec::new();
        match self.walk(top_level, virt, LEVELS, &mut observer, &mut steps) {
            Ok(frame) => {
                let physical_address = frame.wrapping_add(virt.page_offset());
                log::debug!("virt {virt} -> phys {physical_address}");
                observer.visit_summary(virt, Some(physical_address));

                Ok(Translation {
                    parts,
                    frame,
                    physical_address,
                    steps,
                })
            }
            Err(err) => {
                log::debug!("virt {virt} -> unresolved: {err}");
                observer.visit_summary(virt, None);
                Err(err)
            }
        }
    }

    /// Resolves the remaining `depth` levels of the walk for `virt`, starting at the table (or
    /// table entry) `table`.
    ///
    /// At depth `0` the value is already the final frame address and is returned unchanged.
    /// Otherwise the low flag bits of `table` are masked off, the table is fetched, the entry for
    /// `virt` selected and the walk continues one level down with that entry.
    ///
    /// # Errors
    ///
    /// See [`Self::translate`].
    ///
    /// # Panics
    ///
    /// Panics if `depth` is larger than the number of levels in the hierarchy.
    pub fn resolve<O: Observer>(
        &mut self,
        table: PhysicalAddress,
        virt: VirtualAddress,
        depth: usize,
        mut observer: O,
    ) -> Result<PhysicalAddress, Error> {
        self.walk(table, virt, depth, &mut observer, &mut ArrayVec::new())
    }

    fn walk<O: Observer>(
        &mut self,
        table: PhysicalAddress,
        virt: VirtualAddress,
        depth: usize,
        observer: &mut O,
        steps: &mut ArrayVec<WalkStep, LEVELS>,
    ) -> Result<PhysicalAddress, Error> {
        assert!(
            depth <= LEVELS,
            "cannot resolve {depth} levels in a {LEVELS} level hierarchy"
        );

        let mode = self.mode;
        let mut current = table;
        for level in &mode.levels()[LEVELS - depth..] {
            let index = level.index_of(virt);
            let base = PhysicalAddress::new(current.get() & FRAME_ADDRESS_MASK);

            log::trace!("resolving entry {index:#05x} in {level} table at {base}");
            observer.visit_fetch(level, base, index);

            let table = match self.fetch(level, base) {
                Ok(table) => table,
                Err(err) => {
                    log::warn!("{err}");
                    observer.visit_error(&err);
                    return Err(err);
                }
            };

            let step = WalkStep {
                level,
                table: base,
                index,
                entry: table.entry(index),
            };

            if step.descends_through_not_present() {
                log::debug!(
                    "{level} entry {index:#05x} in {base} is not present ({:#018x}), descending anyway",
                    step.entry.bits()
                );
            }

            observer.visit_table(&step, &table);
            steps.push(step);

            current = step.entry.frame_address();
        }

        Ok(current)
    }

    fn fetch(
        &mut self,
        level: &'static PageTableLevel,
        table: PhysicalAddress,
    ) -> Result<PageTable, Error> {
        let mut buf = vec![0; PAGE_SIZE];

        let read = self
            .reader
            .read_at(table, &mut buf)
            .map_err(|source| Error::TableRead {
                level: level.name(),
                table,
                source,
            })?;

        buf.get(..read)
            .and_then(PageTable::from_bytes)
            .ok_or(Error::PartialTableRead {
                level: level.name(),
                table,
                read,
            })
    }
}

/// A single descent step: which table was consulted and which entry was selected from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkStep {
    pub level: &'static PageTableLevel,
    /// Physical base address of the consulted table, flag bits masked off.
    pub table: PhysicalAddress,
    pub index: usize,
    pub entry: PageTableEntry,
}

impl WalkStep {
    /// Returns `true` if the selected entry's present bit is clear.
    ///
    /// The walk continues through such entries using their frame bits, so later steps (and the
    /// final address) may be stale or meaningless.
    pub fn descends_through_not_present(&self) -> bool {
        !self.entry.is_present()
    }
}

/// The result of a successful translation.
#[derive(Debug, Clone)]
pub struct Translation {
    parts: AddressParts,
    frame: PhysicalAddress,
    physical_address: PhysicalAddress,
    steps: ArrayVec<WalkStep, LEVELS>,
}

impl Translation {
    pub fn virtual_address(&self) -> VirtualAddress {
        self.parts.address()
    }

    pub fn parts(&self) -> &AddressParts {
        &self.parts
    }

    /// Base address of the frame the walk arrived at.
    pub fn frame(&self) -> PhysicalAddress {
        self.frame
    }

    /// The frame address plus the page offset of the virtual address.
    pub fn physical_address(&self) -> PhysicalAddress {
        self.physical_address
    }

    /// The descent steps, top-level table first.
    pub fn steps(&self) -> &[WalkStep] {
        &self.steps
    }

    /// Returns `true` if any step of the walk went through an entry whose present bit was clear.
    pub fn is_speculative(&self) -> bool {
        self.steps.iter().any(WalkStep::descends_through_not_present)
    }
}
