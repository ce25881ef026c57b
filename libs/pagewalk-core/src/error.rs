// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::{Display, Formatter};
use std::io;
use std::path::PathBuf;

use crate::PhysicalAddress;

#[derive(Debug)]
pub enum Error {
    /// The control register record could not be opened or read.
    ControlRegistersUnavailable { path: PathBuf, source: io::Error },
    /// The control register record did not start with a `CR3=<hex>` line.
    MalformedControlRegisters { record: String },
    /// The physical memory reader could not be opened.
    PhysicalMemoryUnavailable { path: PathBuf, source: io::Error },
    /// Fewer than 4096 bytes were returned while fetching a page table.
    PartialTableRead {
        level: &'static str,
        table: PhysicalAddress,
        read: usize,
    },
    /// The physical memory reader failed while fetching a page table.
    TableRead {
        level: &'static str,
        table: PhysicalAddress,
        source: io::Error,
    },
}

impl Error {
    /// Returns `true` if the error means no further translations can succeed.
    ///
    /// Failing to acquire the top-level table or to open physical memory aborts the whole run,
    /// while a failed table fetch only affects the translation it occurred in.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::ControlRegistersUnavailable { .. }
            | Error::MalformedControlRegisters { .. }
            | Error::PhysicalMemoryUnavailable { .. } => true,
            Error::PartialTableRead { .. } | Error::TableRead { .. } => false,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::ControlRegistersUnavailable { path, .. } => {
                write!(f, "failed to read control registers from {}", path.display())
            }
            Error::MalformedControlRegisters { record } => {
                write!(f, "couldn't read CR3 from control register record {record:?}")
            }
            Error::PhysicalMemoryUnavailable { path, .. } => {
                write!(f, "failed to open physical memory reader {}", path.display())
            }
            Error::PartialTableRead { level, table, read } => write!(
                f,
                "got {read} bytes reading {level} table at {table}, expected a full page"
            ),
            Error::TableRead { level, table, .. } => {
                write!(f, "failed to read {level} table at {table}")
            }
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Error::ControlRegistersUnavailable { source, .. }
            | Error::PhysicalMemoryUnavailable { source, .. }
            | Error::TableRead { source, .. } => Some(source),
            Error::MalformedControlRegisters { .. } | Error::PartialTableRead { .. } => None,
        }
    }
}
