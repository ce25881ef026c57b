// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io::Error;
use std::{ptr, slice};

use pagewalk_core::VirtualAddress;

/// A private anonymous memory mapping.
///
/// After a `fork` both processes see the same pages, shared copy-on-write until one of them
/// writes.
pub struct AnonymousRegion {
    base: ptr::NonNull<u8>,
    len: usize,
}

impl AnonymousRegion {
    pub fn new(len: usize) -> std::io::Result<Self> {
        // Safety: a fresh anonymous mapping doesn't alias any existing memory
        let mmap = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if mmap == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        let base = ptr::NonNull::new(mmap.cast::<u8>()).ok_or_else(Error::last_os_error)?;
        Ok(Self { base, len })
    }

    pub fn address(&self) -> VirtualAddress {
        VirtualAddress::from_ptr(self.base.as_ptr())
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safety: the mapping is readable, `len` bytes long and lives as long as `self`
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: the mapping is writable, `len` bytes long and lives as long as `self`
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }

    /// Copies `s` to the start of the region followed by a NUL byte.
    ///
    /// # Panics
    ///
    /// Panics if the region is too small.
    pub fn write_str(&mut self, s: &str) {
        let buf = self.as_mut_slice();
        buf[..s.len()].copy_from_slice(s.as_bytes());
        buf[s.len()] = 0;
    }

    /// Reads the NUL terminated string at the start of the region.
    pub fn read_str(&self) -> String {
        let buf = self.as_slice();
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    }
}

impl Drop for AnonymousRegion {
    fn drop(&mut self) {
        // Safety: `base` and `len` describe a mapping created by `new`
        let ret = unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
        debug_assert_eq!(ret, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read() {
        let mut region = AnonymousRegion::new(1024 * 1024).unwrap();
        assert!(region.address().is_aligned_to(4096));
        assert!(region.as_slice().iter().all(|b| *b == 0));

        region.write_str("original data");
        assert_eq!(region.read_str(), "original data");

        region.write_str("new data");
        assert_eq!(region.read_str(), "new data");
    }
}
