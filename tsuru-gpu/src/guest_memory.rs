// SPDX-FileCopyrightText: 2025 tsuru contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Guest CPU memory interfaces consumed by the GPU memory manager.
//!
//! [`GuestMemory`] resolves guest CPU virtual addresses to host
//! pointers; [`ProcessMemory`] receives the device-mapped attribute
//! bookkeeping on map/unmap. [`GuestRam`] is an anonymous-mmap backed
//! provider implementing both, suitable for embedders that keep guest
//! RAM in a single flat allocation.

use bitflags::bitflags;
use memmap2::MmapMut;
use parking_lot::RwLock;
use thiserror::Error;

use tsuru_common::error::{INVALID_ADDRESS, INVALID_MEMORY_RANGE, INVALID_SIZE};
use tsuru_common::{is_page_aligned, ResultCode, VAddr, PAGE_BITS};

bitflags! {
    /// Guest memory attribute bits tracked by the process manager.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryAttribute: u32 {
        const LOCKED = 1 << 0;
        const IPC_LOCKED = 1 << 1;
        /// Set while a device (the GPU) holds a mapping of the range.
        const DEVICE_MAPPED = 1 << 2;
        const UNCACHED = 1 << 3;
    }
}

/// Resolves guest CPU virtual addresses to host pointers.
pub trait GuestMemory: Send + Sync {
    /// Host pointer backing `cpu_addr`, or null when the address is
    /// outside guest RAM.
    fn get_pointer(&self, cpu_addr: VAddr) -> *mut u8;
}

/// Attribute bookkeeping hook of the guest process memory manager.
pub trait ProcessMemory: Send + Sync {
    /// For every page covering `[cpu_addr, cpu_addr + size)`, update
    /// the attribute bits as `attr = (attr & !mask) | value`.
    fn set_memory_attribute(
        &self,
        cpu_addr: VAddr,
        size: u64,
        mask: MemoryAttribute,
        value: MemoryAttribute,
    ) -> ResultCode;
}

/// Errors raised while constructing a [`GuestRam`].
#[derive(Debug, Error)]
pub enum GuestRamError {
    #[error("guest RAM base 0x{0:016X} is not page-aligned")]
    MisalignedBase(VAddr),

    #[error("guest RAM size 0x{0:X} is zero or not page-aligned")]
    BadSize(u64),

    #[error("failed to create backing mmap: {0}")]
    MmapFailed(#[from] std::io::Error),
}

/// Guest RAM spanning `[base_addr, base_addr + size)`, backed by an
/// anonymous mmap, with per-page attribute bookkeeping.
pub struct GuestRam {
    backing: MmapMut,
    /// Host pointer to the start of `backing`; stable for its lifetime.
    base: *mut u8,
    base_addr: VAddr,
    attributes: RwLock<Vec<MemoryAttribute>>,
}

// SAFETY: `base` points into `backing`, which lives exactly as long as
// this value; attribute state is behind a lock. Host pointers handed
// out are used under the memory manager's single-writer contract.
unsafe impl Send for GuestRam {}
unsafe impl Sync for GuestRam {}

impl GuestRam {
    pub fn new(base_addr: VAddr, size: u64) -> Result<Self, GuestRamError> {
        if !is_page_aligned(base_addr) {
            return Err(GuestRamError::MisalignedBase(base_addr));
        }
        if size == 0 || !is_page_aligned(size) {
            return Err(GuestRamError::BadSize(size));
        }

        let mut backing = MmapMut::map_anon(size as usize)?;
        let base = backing.as_mut_ptr();
        let page_count = (size >> PAGE_BITS) as usize;

        Ok(Self {
            backing,
            base,
            base_addr,
            attributes: RwLock::new(vec![MemoryAttribute::empty(); page_count]),
        })
    }

    #[inline]
    pub fn base_addr(&self) -> VAddr {
        self.base_addr
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.backing.len() as u64
    }

    /// Whether `cpu_addr` falls inside guest RAM.
    #[inline]
    pub fn contains(&self, cpu_addr: VAddr) -> bool {
        cpu_addr >= self.base_addr && cpu_addr - self.base_addr < self.size()
    }

    /// Attribute bits of the page containing `cpu_addr`; empty when the
    /// address is outside guest RAM.
    pub fn attribute(&self, cpu_addr: VAddr) -> MemoryAttribute {
        if !self.contains(cpu_addr) {
            return MemoryAttribute::empty();
        }
        let page = ((cpu_addr - self.base_addr) >> PAGE_BITS) as usize;
        self.attributes.read()[page]
    }
}

impl GuestMemory for GuestRam {
    fn get_pointer(&self, cpu_addr: VAddr) -> *mut u8 {
        if !self.contains(cpu_addr) {
            log::error!("unknown guest pointer @ 0x{:016X}", cpu_addr);
            return std::ptr::null_mut();
        }
        unsafe { self.base.add((cpu_addr - self.base_addr) as usize) }
    }
}

impl ProcessMemory for GuestRam {
    fn set_memory_attribute(
        &self,
        cpu_addr: VAddr,
        size: u64,
        mask: MemoryAttribute,
        value: MemoryAttribute,
    ) -> ResultCode {
        if size == 0 {
            return INVALID_SIZE;
        }
        if !self.contains(cpu_addr) {
            return INVALID_ADDRESS;
        }
        let end = cpu_addr + size;
        if end > self.base_addr + self.size() {
            return INVALID_MEMORY_RANGE;
        }

        let first_page = ((cpu_addr - self.base_addr) >> PAGE_BITS) as usize;
        let last_page = ((end - 1 - self.base_addr) >> PAGE_BITS) as usize;

        let mut attributes = self.attributes.write();
        for attribute in &mut attributes[first_page..=last_page] {
            *attribute = (*attribute & !mask) | value;
        }

        log::debug!(
            "GuestRam: attributes [0x{:016X}..0x{:016X}) mask={:?} value={:?}",
            cpu_addr,
            end,
            mask,
            value
        );

        ResultCode::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use tsuru_common::PAGE_SIZE;

    use super::*;

    const BASE: VAddr = 0x8000_0000;
    const SIZE: u64 = 0x10_0000;

    #[test]
    fn test_rejects_bad_construction() {
        assert!(matches!(
            GuestRam::new(BASE | 0x800, SIZE),
            Err(GuestRamError::MisalignedBase(_))
        ));
        assert!(matches!(
            GuestRam::new(BASE, 0),
            Err(GuestRamError::BadSize(_))
        ));
        assert!(matches!(
            GuestRam::new(BASE, 0x1234),
            Err(GuestRamError::BadSize(_))
        ));
    }

    #[test]
    fn test_pointers_are_contiguous() {
        let ram = GuestRam::new(BASE, SIZE).unwrap();
        let p0 = ram.get_pointer(BASE);
        let p1 = ram.get_pointer(BASE + 0x1234);
        assert!(!p0.is_null());
        assert_eq!(p1 as usize - p0 as usize, 0x1234);
    }

    #[test]
    fn test_out_of_range_pointer_is_null() {
        let ram = GuestRam::new(BASE, SIZE).unwrap();
        assert!(ram.get_pointer(BASE - 1).is_null());
        assert!(ram.get_pointer(BASE + SIZE).is_null());
    }

    #[test]
    fn test_attribute_set_and_clear() {
        let ram = GuestRam::new(BASE, SIZE).unwrap();
        let mapped = MemoryAttribute::DEVICE_MAPPED;

        let rc = ram.set_memory_attribute(BASE, 0x2000, mapped, mapped);
        assert!(rc.is_success());
        assert_eq!(ram.attribute(BASE), mapped);
        assert_eq!(ram.attribute(BASE + 0x1FFF), mapped);
        assert_eq!(ram.attribute(BASE + 0x2000), MemoryAttribute::empty());

        let rc = ram.set_memory_attribute(BASE, 0x2000, mapped, MemoryAttribute::empty());
        assert!(rc.is_success());
        assert_eq!(ram.attribute(BASE), MemoryAttribute::empty());
    }

    #[test]
    fn test_attribute_masking_preserves_other_bits() {
        let ram = GuestRam::new(BASE, SIZE).unwrap();
        ram.set_memory_attribute(
            BASE,
            PAGE_SIZE,
            MemoryAttribute::LOCKED,
            MemoryAttribute::LOCKED,
        );
        ram.set_memory_attribute(
            BASE,
            PAGE_SIZE,
            MemoryAttribute::DEVICE_MAPPED,
            MemoryAttribute::DEVICE_MAPPED,
        );
        assert_eq!(
            ram.attribute(BASE),
            MemoryAttribute::LOCKED | MemoryAttribute::DEVICE_MAPPED
        );

        ram.set_memory_attribute(
            BASE,
            PAGE_SIZE,
            MemoryAttribute::DEVICE_MAPPED,
            MemoryAttribute::empty(),
        );
        assert_eq!(ram.attribute(BASE), MemoryAttribute::LOCKED);
    }

    #[test]
    fn test_attribute_range_errors() {
        let ram = GuestRam::new(BASE, SIZE).unwrap();
        let mapped = MemoryAttribute::DEVICE_MAPPED;
        assert!(ram.set_memory_attribute(BASE, 0, mapped, mapped).is_error());
        assert!(ram.set_memory_attribute(0x1000, 0x1000, mapped, mapped).is_error());
        assert!(ram
            .set_memory_attribute(BASE + SIZE - 0x1000, 0x2000, mapped, mapped)
            .is_error());
    }
}
