// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::Write;
use core::mem;

use crate::{
    AddressParts, DumpFilter, Error, PageTable, PageTableLevel, PhysicalAddress, VirtualAddress,
    WalkStep,
};

/// Receives the intermediate states of a page table walk.
///
/// All methods have empty default implementations, so implementors only need to override the
/// events they are interested in.
pub trait Observer {
    /// Called once per translation, before the walk starts.
    #[allow(unused_variables, reason = "formatting")]
    fn visit_decomposed(&mut self, parts: &AddressParts) {}

    /// Called before the table at `table` is fetched from physical memory.
    #[allow(unused_variables, reason = "formatting")]
    fn visit_fetch(&mut self, level: &'static PageTableLevel, table: PhysicalAddress, index: usize) {
    }

    /// Called after a table was fetched and the entry for the next step was selected.
    #[allow(unused_variables, reason = "formatting")]
    fn visit_table(&mut self, step: &WalkStep, table: &PageTable) {}

    /// Called when fetching a table failed. The walk is aborted afterwards.
    #[allow(unused_variables, reason = "formatting")]
    fn visit_error(&mut self, error: &Error) {}

    /// Called once per translation after the walk finished. `physical` is `None` if the walk
    /// failed.
    #[allow(unused_variables, reason = "formatting")]
    fn visit_summary(&mut self, virt: VirtualAddress, physical: Option<PhysicalAddress>) {}
}

impl Observer for () {}

impl<O: Observer + ?Sized> Observer for &mut O {
    fn visit_decomposed(&mut self, parts: &AddressParts) {
        (**self).visit_decomposed(parts);
    }

    fn visit_fetch(&mut self, level: &'static PageTableLevel, table: PhysicalAddress, index: usize) {
        (**self).visit_fetch(level, table, index);
    }

    fn visit_table(&mut self, step: &WalkStep, table: &PageTable) {
        (**self).visit_table(step, table);
    }

    fn visit_error(&mut self, error: &Error) {
        (**self).visit_error(error);
    }

    fn visit_summary(&mut self, virt: VirtualAddress, physical: Option<PhysicalAddress>) {
        (**self).visit_summary(virt, physical);
    }
}

/// Renders a walk as the human-readable diagnostic transcript.
///
/// For every translation the transcript contains, in order: the decomposed virtual address, for
/// each level the consulted table with a filtered dump of its entries and the selected entry,
/// and finally a summary line with the virtual and the resulting physical address.
///
/// ```text
/// buff(): addr 00007FFE1C3A5000 -> 0FF 1F8 0E1 1A5 000
/// PML4: resolving entry 0FF in 0000000104E0A000
/// PAGE TABLE for 0000000104E0A000 (present entries):
///   0FF 0000000104e12067  P W U A D -
///   ...
/// Got PTE 0000000104E12067
/// ...
/// buff(): virt 00007FFE1C3A5000 -> phys 000000011B7C5000
/// ------------------
/// ```
#[derive(Debug)]
pub struct Transcript {
    label: String,
    filter: DumpFilter,
    out: String,
}

impl Transcript {
    pub fn new(label: impl Into<String>, filter: DumpFilter) -> Self {
        Self {
            label: label.into(),
            filter,
            out: String::new(),
        }
    }

    pub fn filter(&self) -> DumpFilter {
        self.filter
    }

    /// Changes the label that prefixes the first and last line of every translation.
    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    pub fn as_str(&self) -> &str {
        &self.out
    }

    /// Returns the transcript rendered so far, leaving it empty.
    pub fn take(&mut self) -> String {
        mem::take(&mut self.out)
    }
}

// Writing into a `String` cannot fail, the results of `writeln!` below are safe to ignore.
impl Observer for Transcript {
    fn visit_decomposed(&mut self, parts: &AddressParts) {
        let _ = writeln!(self.out, "{}(): {parts}", self.label);
    }

    fn visit_fetch(&mut self, level: &'static PageTableLevel, table: PhysicalAddress, index: usize) {
        let _ = writeln!(self.out, "{level}: resolving entry {index:03X} in {table}");
    }

    fn visit_table(&mut self, step: &WalkStep, table: &PageTable) {
        let _ = writeln!(
            self.out,
            "PAGE TABLE for {} ({} entries):",
            step.table, self.filter
        );
        for (idx, entry) in table.dump(self.filter) {
            let _ = writeln!(
                self.out,
                "  {idx:03X} {:016x}  {}",
                entry.bits(),
                entry.describe()
            );
        }

        let _ = write!(self.out, "Got PTE {:016X}", step.entry.bits());
        if step.descends_through_not_present() {
            let _ = write!(self.out, " (not present)");
        }
        let _ = writeln!(self.out);
    }

    fn visit_error(&mut self, error: &Error) {
        match error {
            Error::PartialTableRead { table, read, .. } => {
                let _ = writeln!(self.out, "Got {read} reading {table}");
            }
            Error::TableRead { table, source, .. } => {
                let _ = writeln!(self.out, "Failed reading {table}: {source}");
            }
            err => {
                let _ = writeln!(self.out, "{err}");
            }
        }
    }

    fn visit_summary(&mut self, virt: VirtualAddress, physical: Option<PhysicalAddress>) {
        let _ = write!(
            self.out,
            "{}(): virt {virt} -> phys {}",
            self.label,
            physical.unwrap_or_default()
        );
        if physical.is_none() {
            let _ = write!(self.out, " (unresolved)");
        }
        let _ = writeln!(self.out);
        let _ = writeln!(self.out, "------------------");
    }
}
