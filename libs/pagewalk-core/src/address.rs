// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::paging::{INDEX_MASK, LEVELS, PAGE_OFFSET_MASK, X86_64_4LEVEL};

macro_rules! impl_address_from {
    ($address_ty:ident, $int_ty:ident) => {
        impl From<$int_ty> for $address_ty {
            fn from(value: $int_ty) -> Self {
                $address_ty(u64::from(value))
            }
        }
    };
}

macro_rules! impl_address {
    ($address_ty:ident) => {
        impl $address_ty {
            pub const MAX: Self = Self(u64::MAX);
            pub const MIN: Self = Self(u64::MIN);

            #[must_use]
            pub const fn new(n: u64) -> Self {
                Self(n)
            }

            #[inline]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Adds an unsigned offset to this address, returning `None` if overflow occurred.
            #[must_use]
            #[inline]
            pub const fn checked_add(self, offset: u64) -> Option<Self> {
                match self.0.checked_add(offset) {
                    Some(n) => Some(Self(n)),
                    None => None,
                }
            }

            /// Adds an unsigned offset to this address, wrapping around at the boundary of the type.
            #[must_use]
            #[inline]
            pub const fn wrapping_add(self, offset: u64) -> Self {
                Self(self.0.wrapping_add(offset))
            }

            #[must_use]
            #[inline]
            pub const fn is_aligned_to(self, align: u64) -> bool {
                assert!(
                    align.is_power_of_two(),
                    "is_aligned_to: align is not a power-of-two"
                );

                self.0 & (align - 1) == 0
            }

            #[must_use]
            #[inline]
            pub const fn align_down(self, align: u64) -> Self {
                assert!(
                    align.is_power_of_two(),
                    "align_down: align is not a power-of-two"
                );

                Self(self.0 & 0u64.wrapping_sub(align))
            }
        }

        impl_address_from!($address_ty, u64);
        impl_address_from!($address_ty, u32);
        impl_address_from!($address_ty, u16);
        impl_address_from!($address_ty, u8);

        impl From<$address_ty> for u64 {
            fn from(value: $address_ty) -> Self {
                value.0
            }
        }

        impl fmt::Display for $address_ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:016X}", self.0)
            }
        }

        impl fmt::Debug for $address_ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($address_ty))
                    .field(&format_args!("{:#018x}", self.0)) // 18 digits to account for the leading 0x
                    .finish()
            }
        }

        impl fmt::LowerHex for $address_ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl fmt::UpperHex for $address_ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::UpperHex::fmt(&self.0, f)
            }
        }
    };
}

#[repr(transparent)]
#[derive(Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);
impl_address!(VirtualAddress);

impl VirtualAddress {
    /// Returns the address of `ptr` in the calling process' address space.
    #[must_use]
    #[inline]
    pub fn from_ptr<T: ?Sized>(ptr: *const T) -> Self {
        Self(ptr.cast::<u8>().addr() as u64)
    }

    /// The byte offset of this address into its 4KiB page.
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    /// Splits this address into its four table indices and the page offset.
    pub fn decompose(self) -> AddressParts {
        let mut indices = [0; LEVELS];
        for (slot, level) in indices.iter_mut().zip(X86_64_4LEVEL.levels()) {
            // the index is masked to 9 bits, so this can never truncate
            *slot = u16::try_from(level.index_of(self)).unwrap_or(u16::MAX);
        }

        AddressParts {
            address: self,
            indices,
        }
    }
}

#[repr(transparent)]
#[derive(Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);
impl_address!(PhysicalAddress);

/// A [`VirtualAddress`] interpreted as four 9-bit table indices and a 12-bit page offset.
///
/// Nothing is stored separately: the parts are derived from the address with fixed shifts and
/// masks, and [`Self::reconstruct`] puts them back together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressParts {
    address: VirtualAddress,
    /// L4, L3, L2, L1, most significant first.
    indices: [u16; LEVELS],
}

impl AddressParts {
    /// The address these parts were decomposed from.
    pub const fn address(&self) -> VirtualAddress {
        self.address
    }

    /// Table indices from the top-level table down, i.e. `[L4, L3, L2, L1]`.
    pub const fn indices(&self) -> [u16; LEVELS] {
        self.indices
    }

    /// The table index used while `depth` levels remain to be resolved (`4` for the top-level
    /// table, `1` for the last table).
    ///
    /// # Panics
    ///
    /// Panics if `depth` is not in `1..=4`.
    pub fn index(&self, depth: usize) -> u16 {
        assert!((1..=LEVELS).contains(&depth), "invalid depth {depth}");
        self.indices[LEVELS - depth]
    }

    #[expect(clippy::cast_possible_truncation, reason = "masked to 12 bits")]
    pub const fn page_offset(&self) -> u16 {
        self.address.page_offset() as u16
    }

    /// The 16 bits above the translated range. Zero for canonical lower-half addresses and
    /// `0xFFFF` for canonical upper-half addresses.
    #[expect(clippy::cast_possible_truncation, reason = "shifted down to 16 bits")]
    pub const fn sign_extension(&self) -> u16 {
        (self.address.get() >> 48) as u16
    }

    /// Puts the parts back together into an address.
    pub fn reconstruct(&self) -> VirtualAddress {
        let translated = X86_64_4LEVEL
            .levels()
            .iter()
            .zip(self.indices)
            .fold(u64::from(self.page_offset()), |acc, (level, index)| {
                acc | ((u64::from(index) & INDEX_MASK) << level.index_shift())
            });

        VirtualAddress::new((u64::from(self.sign_extension()) << 48) | translated)
    }
}

impl fmt::Display for AddressParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "addr {} ->", self.address)?;
        for index in self.indices {
            write!(f, " {index:03X}")?;
        }
        write!(f, " {:03X}", self.page_offset())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn decompose_boundaries() {
        let parts = VirtualAddress::new(0).decompose();
        assert_eq!(parts.indices(), [0, 0, 0, 0]);
        assert_eq!(parts.page_offset(), 0);

        let parts = VirtualAddress::MAX.decompose();
        assert_eq!(parts.indices(), [0x1ff; 4]);
        assert_eq!(parts.page_offset(), 0xfff);
        assert_eq!(parts.sign_extension(), 0xffff);

        let parts = VirtualAddress::new(0x0000_7fff_ffff_f000).decompose();
        assert_eq!(parts.indices(), [0xff, 0x1ff, 0x1ff, 0x1ff]);
        assert_eq!(parts.page_offset(), 0);
    }

    #[test]
    fn decompose_by_depth() {
        let parts = VirtualAddress::new(0x0000_0000_0040_1abc).decompose();
        assert_eq!(parts.index(4), 0);
        assert_eq!(parts.index(3), 0);
        assert_eq!(parts.index(2), 2);
        assert_eq!(parts.index(1), 1);
        assert_eq!(parts.page_offset(), 0xabc);
    }

    #[test]
    #[should_panic]
    fn index_depth_zero() {
        let _ = VirtualAddress::new(0).decompose().index(0);
    }

    #[test]
    fn reconstruct_boundaries() {
        for raw in [
            0,
            u64::MAX,
            0x0000_7fff_ffff_f000,
            0x0000_7fff_ffff_ffff,
            0xffff_8000_0000_0000,
            0x0000_0000_0040_1000,
        ] {
            let addr = VirtualAddress::new(raw);
            assert_eq!(addr.decompose().reconstruct(), addr, "{addr:?}");
        }
    }

    #[test]
    fn display() {
        let parts = VirtualAddress::new(0x0000_7f12_3456_7abc).decompose();
        assert_eq!(
            parts.to_string(),
            "addr 00007F1234567ABC -> 0FE 048 1A2 167 ABC"
        );
    }

    proptest! {
        #[test]
        fn reconstruct_is_identity(raw in any::<u64>()) {
            let addr = VirtualAddress::new(raw);
            prop_assert_eq!(addr.decompose().reconstruct(), addr);
        }

        #[test]
        fn lower_half_matches_shift_formula(raw in 0u64..(1 << 48)) {
            let parts = VirtualAddress::new(raw).decompose();
            let [i4, i3, i2, i1] = parts.indices().map(u64::from);
            let rebuilt = (i4 << 39) | (i3 << 30) | (i2 << 21) | (i1 << 12) | u64::from(parts.page_offset());
            prop_assert_eq!(rebuilt, raw);
        }
    }
}
