#![allow(unused, reason = "not used by all tests")]

use pagewalk_core::emulate::EmulatedMemory;
use pagewalk_core::{PhysicalAddress, VirtualAddress};

/// Present, writable, user, accessed, dirty.
pub const FLAGS: u64 = 0x067;

/// Builds a four-level chain of tables for `virt`, starting at `top`. The tables are placed in
/// consecutive frames after `top`, the mapped frame is `frame`.
///
/// Returns the table bases, top-level table first.
pub fn chain(
    mem: &mut EmulatedMemory,
    top: PhysicalAddress,
    virt: VirtualAddress,
    frame: PhysicalAddress,
    flags: u64,
) -> [PhysicalAddress; 4] {
    let parts = virt.decompose();
    let bases = [
        top,
        top.wrapping_add(0x1000),
        top.wrapping_add(0x2000),
        top.wrapping_add(0x3000),
    ];

    for (i, base) in bases.iter().enumerate() {
        let next = bases.get(i + 1).copied().unwrap_or(frame);
        let index = usize::from(parts.indices()[i]);
        mem.write_entry(*base, index, next.get() | flags);
    }

    bases
}
