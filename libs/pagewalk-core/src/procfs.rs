// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Collaborators backed by the `/proc` files of the `cr3` helper kernel module.
//!
//! The module exposes two pseudo files: `/proc/cr3` holds a text record with the calling
//! process' control registers, and `/proc/page_reader` gives read access to physical memory
//! at the requested file offset.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::{ControlRegisterSource, ControlRegisters, Error, PhysicalAddress, PhysicalMemoryReader};

pub const DEFAULT_CONTROL_REGISTERS_PATH: &str = "/proc/cr3";
pub const DEFAULT_PHYSICAL_MEMORY_PATH: &str = "/proc/page_reader";

/// Reads the control register record from a file every time it is asked for it.
#[derive(Debug, Clone)]
pub struct ProcControlRegisters {
    path: PathBuf,
}

impl Default for ProcControlRegisters {
    fn default() -> Self {
        Self::new(DEFAULT_CONTROL_REGISTERS_PATH)
    }
}

impl ProcControlRegisters {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and parses the full control register record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ControlRegistersUnavailable`] if the file cannot be read and
    /// [`Error::MalformedControlRegisters`] if it doesn't start with a `CR3=` line.
    pub fn read(&self) -> Result<ControlRegisters, Error> {
        let record =
            fs::read_to_string(&self.path).map_err(|source| Error::ControlRegistersUnavailable {
                path: self.path.clone(),
                source,
            })?;

        let regs: ControlRegisters = record.parse()?;
        log::debug!(
            "read control registers from {}: {regs:x?}",
            self.path.display()
        );

        Ok(regs)
    }
}

impl ControlRegisterSource for ProcControlRegisters {
    fn top_level_table(&mut self) -> Result<PhysicalAddress, Error> {
        Ok(self.read()?.top_level_table())
    }
}

/// A byte source that reads at explicit offsets without a shared cursor.
///
/// Handles inherited across `fork` share one file description and with it the file offset, so
/// a seek followed by a read can observe the other process' seek in between.
pub trait PositionedRead {
    /// Reads into `buf` starting at `offset`, returning the number of bytes read.
    ///
    /// # Errors
    ///
    /// Returns any error reported by the underlying source.
    fn read_at_offset(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

#[cfg(unix)]
impl PositionedRead for File {
    fn read_at_offset(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }
}

impl PositionedRead for [u8] {
    fn read_at_offset(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        let Some(src) = self.get(start..) else {
            return Ok(0);
        };

        let len = buf.len().min(src.len());
        buf[..len].copy_from_slice(&src[..len]);
        Ok(len)
    }
}

impl PositionedRead for Vec<u8> {
    fn read_at_offset(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.as_slice().read_at_offset(buf, offset)
    }
}

/// Reads physical memory through positioned reads at the absolute physical address.
#[derive(Debug)]
pub struct PhysicalMemoryFile<F> {
    inner: F,
}

impl PhysicalMemoryFile<File> {
    /// Opens the physical memory reader at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PhysicalMemoryUnavailable`] if the file cannot be opened for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let inner = File::open(path).map_err(|source| Error::PhysicalMemoryUnavailable {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self { inner })
    }
}

impl<F: PositionedRead> PhysicalMemoryFile<F> {
    pub fn new(inner: F) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> F {
        self.inner
    }
}

impl<F: PositionedRead> PhysicalMemoryReader for PhysicalMemoryFile<F> {
    fn read_at(&mut self, address: PhysicalAddress, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let offset = address.get() + filled as u64;
            match self.inner.read_at_offset(&mut buf[filled..], offset) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }

        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn read_at_absolute_offsets() {
        let data: Vec<u8> = (0..=255).cycle().take(0x3000).collect();
        let mut mem = PhysicalMemoryFile::new(data);

        let mut buf = [0; 4];
        assert_eq!(mem.read_at(PhysicalAddress::new(0x1001), &mut buf).unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);

        // reads are positioned absolutely, not relative to the previous read
        assert_eq!(mem.read_at(PhysicalAddress::new(0x10), &mut buf).unwrap(), 4);
        assert_eq!(buf, [0x10, 0x11, 0x12, 0x13]);
    }

    #[test]
    fn short_read_at_end() {
        let mut mem = PhysicalMemoryFile::new(vec![0xaa; 0x1800]);

        let mut page = [0; 4096];
        assert_eq!(mem.read_at(PhysicalAddress::new(0x1000), &mut page).unwrap(), 0x800);
        assert_eq!(mem.read_at(PhysicalAddress::new(0x2000), &mut page).unwrap(), 0);
    }

    #[test]
    fn missing_files() {
        let err = PhysicalMemoryFile::open("/nonexistent/page_reader").unwrap_err();
        assert!(matches!(err, Error::PhysicalMemoryUnavailable { .. }));
        assert!(err.is_fatal());

        let mut regs = ProcControlRegisters::new("/nonexistent/cr3");
        let err = regs.top_level_table().unwrap_err();
        assert!(matches!(err, Error::ControlRegistersUnavailable { .. }));
    }

    #[test]
    fn shared_description_reads_stay_positioned() {
        const ROUNDS: usize = 2000;

        let path = std::env::temp_dir().join(format!(
            "pagewalk-shared-description-{}",
            std::process::id()
        ));
        let mut data = vec![0xaa; 0x1000];
        data.resize(0x2000, 0x55);
        fs::write(&path, &data).unwrap();

        // like a reader inherited across fork: two handles, one file offset
        let first = PhysicalMemoryFile::open(&path).unwrap();
        let second = PhysicalMemoryFile::new(first.inner.try_clone().unwrap());

        let check = |mut mem: PhysicalMemoryFile<File>, table: u64, expected: u8| {
            let mut page = [0; 4096];
            let mut wrong = 0;
            for _ in 0..ROUNDS {
                let n = mem.read_at(PhysicalAddress::new(table), &mut page).unwrap();
                assert_eq!(n, page.len());
                if page.iter().any(|b| *b != expected) {
                    wrong += 1;
                }
            }
            wrong
        };

        let (a, b) = thread::scope(|s| {
            let a = s.spawn(|| check(first, 0, 0xaa));
            let b = s.spawn(|| check(second, 0x1000, 0x55));
            (a.join().unwrap(), b.join().unwrap())
        });
        fs::remove_file(&path).unwrap();

        assert_eq!((a, b), (0, 0), "reads observed the other handle's table");
    }
}
