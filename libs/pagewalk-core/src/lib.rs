// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Software translation of virtual addresses through x86-64 4-level page tables.
//!
//! The [`Walker`] reproduces what the MMU does on every memory access: it splits a
//! [`VirtualAddress`] into four 9-bit table indices and a 12-bit page offset, then descends from
//! the top-level table (the value held in `CR3`) through physical memory, reading one 4KiB table
//! per level, until it reaches the final frame.
//!
//! Neither the control register nor physical memory are accessible to unprivileged code, so both
//! are consumed through two narrow traits: [`ControlRegisterSource`] and [`PhysicalMemoryReader`].
//! The [`procfs`] module implements them on top of the `/proc/cr3` and `/proc/page_reader` files
//! exposed by a helper kernel module, while the `emulate` feature provides a synthetic machine
//! so the walker can be exercised without any privileges at all.
//!
//! ## Not-present entries
//!
//! The walk does **not** stop when it encounters an entry whose present bit is clear. It keeps
//! descending using the entry's frame bits. This makes transitional states (such as entries
//! the operating system temporarily marked not-present) visible in the transcript instead of
//! hiding them behind an early error. Steps that went through a not-present entry are flagged,
//! see [`WalkStep::descends_through_not_present`].

mod address;
#[cfg(feature = "emulate")]
pub mod emulate;
mod entry;
mod error;
mod observe;
pub mod paging;
pub mod procfs;
mod source;
mod table;
mod walker;

pub use address::{AddressParts, PhysicalAddress, VirtualAddress};
pub use entry::PageTableEntry;
pub use error::Error;
pub use observe::{Observer, Transcript};
pub use paging::{PageTableLevel, PagingMode};
pub use source::{ControlRegisterSource, ControlRegisters, PhysicalMemoryReader};
pub use table::{DumpFilter, PageTable, ParseDumpFilterError};
pub use walker::{Translation, WalkStep, Walker};

