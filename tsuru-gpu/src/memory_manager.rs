// SPDX-FileCopyrightText: 2025 tsuru contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU virtual address space manager.
//!
//! Keeps two cooperating views of the 40-bit GPU address space: an
//! ordered map of virtual memory areas (VMAs) that is authoritative for
//! structure, and a flat page table used by the translation and block
//! I/O fast paths. Structural changes go through the VMA map and are
//! then written back into the page table; the two are never mutated
//! independently.
//!
//! Reads and writes of mapped memory are kept coherent with the
//! rasterizer backend: block reads flush the backend's pending writes
//! for each touched page, block writes invalidate its cached copies,
//! and unmapping flushes and invalidates before the translation is
//! torn down.

use std::collections::BTreeMap;
use std::sync::Arc;

use tsuru_common::{
    align_up, GPUVAddr, VAddr, ADDRESS_SPACE_BASE, ADDRESS_SPACE_WIDTH, PAGE_BITS, PAGE_MASK,
    PAGE_SIZE,
};

use crate::guest_memory::{GuestMemory, MemoryAttribute, ProcessMemory};
use crate::page_table::{PageTable, PageType};
use crate::rasterizer::{to_cache_addr, RasterizerInterface};

/// State tag of a [`VirtualMemoryArea`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaState {
    /// Never reserved.
    Unmapped,
    /// Reserved GPU VA with no host backing.
    Allocated,
    /// Backed by host memory supplied from a guest CPU address.
    Mapped,
}

/// A half-open interval `[base, base + size)` of the GPU address space.
///
/// `offset` is meaningful while the VMA is `Allocated` and latent
/// otherwise: a piece carved out of an allocated reservation keeps its
/// offset while mapped, so unmapping it merges the reservation back
/// together.
#[derive(Debug, Clone, Copy)]
pub struct VirtualMemoryArea {
    pub base: GPUVAddr,
    pub size: u64,
    pub state: VmaState,
    /// Logical offset into the reservation this VMA was allocated from.
    pub offset: u64,
    /// Host pointer backing `base` (only when `Mapped`).
    pub backing_memory: *mut u8,
    /// Guest CPU address backing `base` (only when `Mapped`).
    pub backing_addr: VAddr,
}

impl VirtualMemoryArea {
    fn unmapped(base: GPUVAddr, size: u64) -> Self {
        Self {
            base,
            size,
            state: VmaState::Unmapped,
            offset: 0,
            backing_memory: std::ptr::null_mut(),
            backing_addr: 0,
        }
    }

    #[inline]
    pub fn end(&self) -> GPUVAddr {
        self.base + self.size
    }

    /// Whether `next` can be folded into this VMA. Requires the same
    /// state and, for `Allocated`, a contiguous `offset`, or for
    /// `Mapped`, contiguous backing memory.
    pub fn can_be_merged_with(&self, next: &VirtualMemoryArea) -> bool {
        assert_eq!(self.end(), next.base);
        if self.state != next.state {
            return false;
        }
        match self.state {
            VmaState::Unmapped => true,
            VmaState::Allocated => self.offset + self.size == next.offset,
            VmaState::Mapped => {
                self.backing_memory as usize + self.size as usize == next.backing_memory as usize
            }
        }
    }
}

/// GPU virtual address space manager.
///
/// Structural operations and accesses are not internally synchronized;
/// the embedder is expected to serialize all calls (single-writer
/// contract), typically on the GPU thread.
pub struct MemoryManager {
    page_table: PageTable,
    vma_map: BTreeMap<GPUVAddr, VirtualMemoryArea>,
    address_space_end: GPUVAddr,
    rasterizer: Arc<dyn RasterizerInterface>,
    cpu_memory: Arc<dyn GuestMemory>,
    process: Arc<dyn ProcessMemory>,
}

// SAFETY: the page table holds borrowed pointers into guest RAM, which
// the providers keep alive for the manager's lifetime. Callers uphold
// the single-writer contract documented on the type.
unsafe impl Send for MemoryManager {}
unsafe impl Sync for MemoryManager {}

impl MemoryManager {
    /// Create a manager covering the full 40-bit address space.
    pub fn new(
        rasterizer: Arc<dyn RasterizerInterface>,
        cpu_memory: Arc<dyn GuestMemory>,
        process: Arc<dyn ProcessMemory>,
    ) -> Self {
        Self::with_address_space(ADDRESS_SPACE_WIDTH, rasterizer, cpu_memory, process)
    }

    /// Create a manager whose managed range spans `[0, 1 << width_bits)`.
    /// Smaller widths keep the page table small; useful for tests and
    /// embedders that configure a reduced space.
    pub fn with_address_space(
        width_bits: u32,
        rasterizer: Arc<dyn RasterizerInterface>,
        cpu_memory: Arc<dyn GuestMemory>,
        process: Arc<dyn ProcessMemory>,
    ) -> Self {
        let address_space_end: GPUVAddr = 1 << width_bits;
        let page_count = (address_space_end >> PAGE_BITS) as usize;

        let mut manager = Self {
            page_table: PageTable::new(page_count),
            vma_map: BTreeMap::new(),
            address_space_end,
            rasterizer,
            cpu_memory,
            process,
        };

        // A single unmapped VMA covers the entire managed range.
        let initial_vma = VirtualMemoryArea::unmapped(0, address_space_end);
        manager.vma_map.insert(initial_vma.base, initial_vma);
        manager.update_page_table_for_vma(&initial_vma);

        manager
    }

    // -- Placement ----------------------------------------------------------

    /// Reserve `size` bytes of GPU VA at the lowest free address, or
    /// `None` when the space is exhausted.
    pub fn allocate_space(&mut self, size: u64, _align: u64) -> Option<GPUVAddr> {
        let aligned_size = align_up(size, PAGE_SIZE);
        let gpu_addr = self.find_free_region(ADDRESS_SPACE_BASE, aligned_size)?;
        self.allocate_memory(gpu_addr, 0, aligned_size);
        Some(gpu_addr)
    }

    /// Reserve `size` bytes of GPU VA at a caller-chosen address.
    pub fn allocate_space_fixed(&mut self, gpu_addr: GPUVAddr, size: u64, _align: u64) -> GPUVAddr {
        let aligned_size = align_up(size, PAGE_SIZE);
        self.allocate_memory(gpu_addr, 0, aligned_size);
        gpu_addr
    }

    /// Map guest CPU memory at the lowest free GPU VA and mark the CPU
    /// range device-mapped. Returns `None` when the space is exhausted.
    pub fn map_buffer(&mut self, cpu_addr: VAddr, size: u64) -> Option<GPUVAddr> {
        let aligned_size = align_up(size, PAGE_SIZE);
        let gpu_addr = self.find_free_region(ADDRESS_SPACE_BASE, aligned_size)?;

        let memory = self.cpu_memory.get_pointer(cpu_addr);
        self.map_backing_memory(gpu_addr, memory, aligned_size, cpu_addr);

        let result = self.process.set_memory_attribute(
            cpu_addr,
            size,
            MemoryAttribute::DEVICE_MAPPED,
            MemoryAttribute::DEVICE_MAPPED,
        );
        assert!(result.is_success(), "set_memory_attribute failed: {}", result);

        Some(gpu_addr)
    }

    /// Map guest CPU memory at a caller-chosen GPU VA.
    pub fn map_buffer_fixed(&mut self, cpu_addr: VAddr, gpu_addr: GPUVAddr, size: u64) -> GPUVAddr {
        assert_eq!(gpu_addr & PAGE_MASK, 0, "non-page aligned base: 0x{:016X}", gpu_addr);

        let aligned_size = align_up(size, PAGE_SIZE);
        let memory = self.cpu_memory.get_pointer(cpu_addr);
        self.map_backing_memory(gpu_addr, memory, aligned_size, cpu_addr);

        let result = self.process.set_memory_attribute(
            cpu_addr,
            size,
            MemoryAttribute::DEVICE_MAPPED,
            MemoryAttribute::DEVICE_MAPPED,
        );
        assert!(result.is_success(), "set_memory_attribute failed: {}", result);

        gpu_addr
    }

    /// Tear down a mapping. The rasterizer is flushed and invalidated
    /// over the range *before* the page table loses the translation, so
    /// the backend can still resolve the host memory it must drain. The
    /// GPU VA range returns to the reusable `Allocated` state.
    pub fn unmap_buffer(&mut self, gpu_addr: GPUVAddr, size: u64) -> GPUVAddr {
        assert_eq!(gpu_addr & PAGE_MASK, 0, "non-page aligned base: 0x{:016X}", gpu_addr);

        let aligned_size = align_up(size, PAGE_SIZE);
        let cache_addr = to_cache_addr(self.get_pointer(gpu_addr));
        let Some(cpu_addr) = self.gpu_to_cpu_address(gpu_addr) else {
            panic!("unmap of unbacked address 0x{:016X}", gpu_addr);
        };

        self.rasterizer
            .flush_and_invalidate_region(cache_addr, aligned_size);

        self.unmap_range(gpu_addr, aligned_size);

        let result = self.process.set_memory_attribute(
            cpu_addr,
            size,
            MemoryAttribute::DEVICE_MAPPED,
            MemoryAttribute::empty(),
        );
        assert!(result.is_success(), "set_memory_attribute failed: {}", result);

        gpu_addr
    }

    /// First-fit search for an unmapped region of `size` bytes at or
    /// above `region_start`. `None` when the space is exhausted.
    fn find_free_region(&self, region_start: GPUVAddr, size: u64) -> Option<GPUVAddr> {
        let candidate = self.vma_map.values().find(|vma| {
            if vma.state != VmaState::Unmapped {
                return false;
            }
            let vma_end = vma.end();
            vma_end > region_start && vma_end >= region_start + size
        });

        match candidate {
            Some(vma) => Some(region_start.max(vma.base)),
            None => {
                log::error!(
                    "no free region of size 0x{:X} at or above 0x{:016X}",
                    size,
                    region_start
                );
                None
            }
        }
    }

    // -- Translation --------------------------------------------------------

    /// Whether `addr` falls inside the managed range.
    #[inline]
    pub fn is_address_valid(&self, addr: GPUVAddr) -> bool {
        ((addr >> PAGE_BITS) as usize) < self.page_table.page_count()
    }

    /// Reverse-translate a GPU VA to the guest CPU address backing it,
    /// or `None` when the page has no backing.
    pub fn gpu_to_cpu_address(&self, addr: GPUVAddr) -> Option<VAddr> {
        if !self.is_address_valid(addr) {
            return None;
        }
        let cpu_addr = self.page_table.backing_addr((addr >> PAGE_BITS) as usize);
        if cpu_addr != 0 {
            Some(cpu_addr + (addr & PAGE_MASK))
        } else {
            None
        }
    }

    /// Host pointer for `addr`, or null with an error log when the page
    /// has no backing.
    pub fn get_pointer(&self, addr: GPUVAddr) -> *const u8 {
        if !self.is_address_valid(addr) {
            return std::ptr::null();
        }
        let page_pointer = self.page_table.pointer((addr >> PAGE_BITS) as usize);
        if !page_pointer.is_null() {
            return unsafe { page_pointer.add((addr & PAGE_MASK) as usize) };
        }
        log::error!("unknown get_pointer @ 0x{:016X}", addr);
        std::ptr::null()
    }

    /// Mutable variant of [`Self::get_pointer`].
    pub fn get_pointer_mut(&mut self, addr: GPUVAddr) -> *mut u8 {
        if !self.is_address_valid(addr) {
            return std::ptr::null_mut();
        }
        let page_pointer = self.page_table.pointer((addr >> PAGE_BITS) as usize);
        if !page_pointer.is_null() {
            return unsafe { page_pointer.add((addr & PAGE_MASK) as usize) };
        }
        log::error!("unknown get_pointer @ 0x{:016X}", addr);
        std::ptr::null_mut()
    }

    // -- Scalar access ------------------------------------------------------
    //
    // Multi-byte accesses are byte-exact raw copies; the host is
    // assumed little-endian, matching the guest.

    pub fn read_u8(&self, addr: GPUVAddr) -> u8 {
        self.read_scalar(addr)
    }

    pub fn read_u16(&self, addr: GPUVAddr) -> u16 {
        self.read_scalar(addr)
    }

    pub fn read_u32(&self, addr: GPUVAddr) -> u32 {
        self.read_scalar(addr)
    }

    pub fn read_u64(&self, addr: GPUVAddr) -> u64 {
        self.read_scalar(addr)
    }

    pub fn write_u8(&mut self, addr: GPUVAddr, data: u8) {
        self.write_scalar(addr, data);
    }

    pub fn write_u16(&mut self, addr: GPUVAddr, data: u16) {
        self.write_scalar(addr, data);
    }

    pub fn write_u32(&mut self, addr: GPUVAddr, data: u32) {
        self.write_scalar(addr, data);
    }

    pub fn write_u64(&mut self, addr: GPUVAddr, data: u64) {
        self.write_scalar(addr, data);
    }

    fn read_scalar<T: Copy + Default>(&self, addr: GPUVAddr) -> T {
        if !self.is_address_valid(addr) {
            return T::default();
        }

        let page_pointer = self.page_table.pointer((addr >> PAGE_BITS) as usize);
        if !page_pointer.is_null() {
            // Keep this fast path free of any extra logic.
            return unsafe {
                std::ptr::read_unaligned(page_pointer.add((addr & PAGE_MASK) as usize) as *const T)
            };
        }

        match self.page_table.attribute((addr >> PAGE_BITS) as usize) {
            PageType::Unmapped => {
                log::error!(
                    "unmapped read{} @ 0x{:016X}",
                    std::mem::size_of::<T>() * 8,
                    addr
                );
                T::default()
            }
            PageType::Memory => {
                panic!("mapped memory page without a pointer @ 0x{:016X}", addr)
            }
        }
    }

    fn write_scalar<T: Copy + std::fmt::LowerHex>(&mut self, addr: GPUVAddr, data: T) {
        if !self.is_address_valid(addr) {
            return;
        }

        let page_pointer = self.page_table.pointer((addr >> PAGE_BITS) as usize);
        if !page_pointer.is_null() {
            // Keep this fast path free of any extra logic.
            unsafe {
                std::ptr::write_unaligned(
                    page_pointer.add((addr & PAGE_MASK) as usize) as *mut T,
                    data,
                );
            }
            return;
        }

        match self.page_table.attribute((addr >> PAGE_BITS) as usize) {
            PageType::Unmapped => {
                log::error!(
                    "unmapped write{} 0x{:x} @ 0x{:016X}",
                    std::mem::size_of::<T>() * 8,
                    data,
                    addr
                );
            }
            PageType::Memory => {
                panic!("mapped memory page without a pointer @ 0x{:016X}", addr)
            }
        }
    }

    // -- Block I/O ----------------------------------------------------------

    /// Copy out of GPU memory. Every touched page must be backed; each
    /// page slice is flushed on the rasterizer first so memory is
    /// synchronous when read, even in asynchronous GPU mode.
    pub fn read_block(&self, gpu_src_addr: GPUVAddr, dest: &mut [u8]) {
        let mut remaining = dest.len();
        let mut page_index = (gpu_src_addr >> PAGE_BITS) as usize;
        let mut page_offset = (gpu_src_addr & PAGE_MASK) as usize;
        let mut dest_offset = 0usize;

        while remaining > 0 {
            let copy_amount = remaining.min(PAGE_SIZE as usize - page_offset);

            match self.page_table.attribute(page_index) {
                PageType::Memory => {
                    let page_pointer = self.page_table.pointer(page_index);
                    assert!(
                        !page_pointer.is_null(),
                        "mapped memory page without a pointer @ 0x{:016X}",
                        (page_index as u64) << PAGE_BITS
                    );
                    let src_ptr = unsafe { page_pointer.add(page_offset) as *const u8 };
                    self.rasterizer
                        .flush_region(to_cache_addr(src_ptr), copy_amount as u64);
                    dest[dest_offset..dest_offset + copy_amount]
                        .copy_from_slice(unsafe { std::slice::from_raw_parts(src_ptr, copy_amount) });
                }
                PageType::Unmapped => unreachable!("read_block of unmapped GPU memory"),
            }

            page_index += 1;
            page_offset = 0;
            dest_offset += copy_amount;
            remaining -= copy_amount;
        }
    }

    /// Copy out of GPU memory, tolerating unbacked pages (they read as
    /// zero) and performing no rasterizer coherence. For callers that
    /// have flushed externally or know the range is quiescent.
    pub fn read_block_unsafe(&self, gpu_src_addr: GPUVAddr, dest: &mut [u8]) {
        let mut remaining = dest.len();
        let mut page_index = (gpu_src_addr >> PAGE_BITS) as usize;
        let mut page_offset = (gpu_src_addr & PAGE_MASK) as usize;
        let mut dest_offset = 0usize;

        while remaining > 0 {
            let copy_amount = remaining.min(PAGE_SIZE as usize - page_offset);
            let page_pointer = self.page_table.pointer(page_index);

            if !page_pointer.is_null() {
                let src_ptr = unsafe { page_pointer.add(page_offset) as *const u8 };
                dest[dest_offset..dest_offset + copy_amount]
                    .copy_from_slice(unsafe { std::slice::from_raw_parts(src_ptr, copy_amount) });
            } else {
                dest[dest_offset..dest_offset + copy_amount].fill(0);
            }

            page_index += 1;
            page_offset = 0;
            dest_offset += copy_amount;
            remaining -= copy_amount;
        }
    }

    /// Copy into GPU memory. Every touched page must be backed; each
    /// page slice is invalidated on the rasterizer first so cached
    /// copies are discarded before their authoritative value changes.
    pub fn write_block(&mut self, gpu_dest_addr: GPUVAddr, src: &[u8]) {
        let mut remaining = src.len();
        let mut page_index = (gpu_dest_addr >> PAGE_BITS) as usize;
        let mut page_offset = (gpu_dest_addr & PAGE_MASK) as usize;
        let mut src_offset = 0usize;

        while remaining > 0 {
            let copy_amount = remaining.min(PAGE_SIZE as usize - page_offset);

            match self.page_table.attribute(page_index) {
                PageType::Memory => {
                    let page_pointer = self.page_table.pointer(page_index);
                    assert!(
                        !page_pointer.is_null(),
                        "mapped memory page without a pointer @ 0x{:016X}",
                        (page_index as u64) << PAGE_BITS
                    );
                    let dest_ptr = unsafe { page_pointer.add(page_offset) };
                    self.rasterizer
                        .invalidate_region(to_cache_addr(dest_ptr), copy_amount as u64);
                    unsafe { std::slice::from_raw_parts_mut(dest_ptr, copy_amount) }
                        .copy_from_slice(&src[src_offset..src_offset + copy_amount]);
                }
                PageType::Unmapped => unreachable!("write_block of unmapped GPU memory"),
            }

            page_index += 1;
            page_offset = 0;
            src_offset += copy_amount;
            remaining -= copy_amount;
        }
    }

    /// Copy into GPU memory, skipping unbacked pages and performing no
    /// rasterizer coherence.
    pub fn write_block_unsafe(&mut self, gpu_dest_addr: GPUVAddr, src: &[u8]) {
        let mut remaining = src.len();
        let mut page_index = (gpu_dest_addr >> PAGE_BITS) as usize;
        let mut page_offset = (gpu_dest_addr & PAGE_MASK) as usize;
        let mut src_offset = 0usize;

        while remaining > 0 {
            let copy_amount = remaining.min(PAGE_SIZE as usize - page_offset);
            let page_pointer = self.page_table.pointer(page_index);

            if !page_pointer.is_null() {
                let dest_ptr = unsafe { page_pointer.add(page_offset) };
                unsafe { std::slice::from_raw_parts_mut(dest_ptr, copy_amount) }
                    .copy_from_slice(&src[src_offset..src_offset + copy_amount]);
            }

            page_index += 1;
            page_offset = 0;
            src_offset += copy_amount;
            remaining -= copy_amount;
        }
    }

    /// GPU-to-GPU copy with coherence: each source page slice is
    /// flushed, then written through [`Self::write_block`], which
    /// invalidates the destination slices.
    pub fn copy_block(&mut self, gpu_dest_addr: GPUVAddr, gpu_src_addr: GPUVAddr, size: usize) {
        let mut remaining = size;
        let mut page_index = (gpu_src_addr >> PAGE_BITS) as usize;
        let mut page_offset = (gpu_src_addr & PAGE_MASK) as usize;
        let mut dest_addr = gpu_dest_addr;

        while remaining > 0 {
            let copy_amount = remaining.min(PAGE_SIZE as usize - page_offset);

            match self.page_table.attribute(page_index) {
                PageType::Memory => {
                    let page_pointer = self.page_table.pointer(page_index);
                    assert!(
                        !page_pointer.is_null(),
                        "mapped memory page without a pointer @ 0x{:016X}",
                        (page_index as u64) << PAGE_BITS
                    );
                    let src_ptr = unsafe { page_pointer.add(page_offset) as *const u8 };
                    self.rasterizer
                        .flush_region(to_cache_addr(src_ptr), copy_amount as u64);
                    // Stage the slice so an aliasing destination never
                    // overlaps the source copy.
                    let chunk =
                        unsafe { std::slice::from_raw_parts(src_ptr, copy_amount) }.to_vec();
                    self.write_block(dest_addr, &chunk);
                }
                PageType::Unmapped => unreachable!("copy_block of unmapped GPU memory"),
            }

            page_index += 1;
            page_offset = 0;
            dest_addr += copy_amount as u64;
            remaining -= copy_amount;
        }
    }

    /// GPU-to-GPU copy without coherence, staged through a temporary
    /// buffer of the full size. Coherence is the caller's problem.
    pub fn copy_block_unsafe(&mut self, gpu_dest_addr: GPUVAddr, gpu_src_addr: GPUVAddr, size: usize) {
        let mut tmp_buffer = vec![0u8; size];
        self.read_block_unsafe(gpu_src_addr, &mut tmp_buffer);
        self.write_block_unsafe(gpu_dest_addr, &tmp_buffer);
    }

    /// Whether `[start, start + size)` lies in a single physically
    /// contiguous host mapping, and can be handed to a zero-copy
    /// consumer.
    pub fn is_block_continuous(&self, start: GPUVAddr, size: u64) -> bool {
        debug_assert!(size > 0);
        let inner_size = size - 1;
        let end = start + inner_size;
        let host_ptr_start = self.get_pointer(start) as usize;
        let host_ptr_end = self.get_pointer(end) as usize;
        host_ptr_end.wrapping_sub(host_ptr_start) as u64 == inner_size
    }

    // -- VMA algebra --------------------------------------------------------

    /// Base of the VMA containing `target`, or `None` past the end of
    /// the managed range.
    fn find_vma(&self, target: GPUVAddr) -> Option<GPUVAddr> {
        if target >= self.address_space_end {
            return None;
        }
        self.vma_map
            .range(..=target)
            .next_back()
            .map(|(&base, _)| base)
    }

    /// Turn the VMA at `base` into an `Allocated` reservation and merge
    /// with mergeable neighbours. Returns the resulting base.
    fn allocate(&mut self, base: GPUVAddr) -> GPUVAddr {
        let vma = self
            .vma_map
            .get_mut(&base)
            .expect("allocate target must be a VMA base");
        vma.state = VmaState::Allocated;
        vma.backing_addr = 0;
        vma.backing_memory = std::ptr::null_mut();

        let snapshot = *vma;
        self.update_page_table_for_vma(&snapshot);

        self.merge_adjacent(base)
    }

    /// Reserve `[target, target + size)` with the given reservation
    /// offset. Returns the resulting (possibly merged) base.
    fn allocate_memory(&mut self, target: GPUVAddr, offset: u64, size: u64) -> GPUVAddr {
        let base = self.carve_vma(target, size);

        let vma = self
            .vma_map
            .get_mut(&base)
            .expect("carved VMA must be in the map");
        assert_eq!(vma.size, size, "carve produced a mis-sized VMA");
        vma.offset = offset;

        self.allocate(base)
    }

    /// Bind `[target, target + size)` to host memory. Returns the
    /// resulting (possibly merged) base.
    fn map_backing_memory(
        &mut self,
        target: GPUVAddr,
        memory: *mut u8,
        size: u64,
        backing_addr: VAddr,
    ) -> GPUVAddr {
        let base = self.carve_vma(target, size);

        let vma = self
            .vma_map
            .get_mut(&base)
            .expect("carved VMA must be in the map");
        assert_eq!(vma.size, size, "carve produced a mis-sized VMA");
        vma.state = VmaState::Mapped;
        vma.backing_memory = memory;
        vma.backing_addr = backing_addr;

        let snapshot = *vma;
        self.update_page_table_for_vma(&snapshot);

        self.merge_adjacent(base)
    }

    /// Return every VMA in `[target, target + size)` to the reusable
    /// `Allocated` state, so later placements at the same address still
    /// succeed. Panics if the range contains never-reserved space.
    fn unmap_range(&mut self, target: GPUVAddr, size: u64) {
        let Some(mut base) = self.carve_vma_range(target, size) else {
            panic!(
                "unmap of unreserved range [0x{:016X}..0x{:016X})",
                target,
                target + size
            );
        };
        let target_end = target + size;

        // Advance by address, not handle: `allocate` merges neighbours
        // and replaces VMAs as it goes.
        while base < target_end {
            let merged = self.allocate(base);
            base = self.vma_map[&merged].end();
        }

        let vma_base = self.find_vma(target).expect("unmapped range lost its VMA");
        assert!(self.vma_map[&vma_base].size >= size);
    }

    /// Ensure exactly one VMA covers `[base, base + size)`, splitting
    /// at the right edge first so the left handle stays valid. If the
    /// containing VMA is already `Mapped` it is returned unchanged:
    /// pre-existing mappings act as a no-op acquire.
    fn carve_vma(&mut self, base: GPUVAddr, size: u64) -> GPUVAddr {
        assert_eq!(size & PAGE_MASK, 0, "non-page aligned size: 0x{:016X}", size);
        assert_eq!(base & PAGE_MASK, 0, "non-page aligned base: 0x{:016X}", base);

        let Some(vma_base) = self.find_vma(base) else {
            panic!("carve target 0x{:016X} is outside the managed range", base);
        };
        let vma = self.vma_map[&vma_base];

        if vma.state == VmaState::Mapped {
            return vma_base;
        }

        let start_in_vma = base - vma.base;
        let end_in_vma = start_in_vma + size;
        assert!(
            end_in_vma <= vma.size,
            "region size 0x{:016X} is less than required size 0x{:016X}",
            vma.size,
            end_in_vma
        );

        if end_in_vma < vma.size {
            self.split_vma(vma_base, end_in_vma);
        }
        if start_in_vma != 0 {
            return self.split_vma(vma_base, start_in_vma);
        }
        vma_base
    }

    /// Ensure VMA boundaries fall exactly on `target` and
    /// `target + size`. Returns `None` if any VMA in the range was
    /// never reserved: unmapping what is already unmapped is an error.
    fn carve_vma_range(&mut self, target: GPUVAddr, size: u64) -> Option<GPUVAddr> {
        assert_eq!(size & PAGE_MASK, 0, "non-page aligned size: 0x{:016X}", size);
        assert_eq!(target & PAGE_MASK, 0, "non-page aligned base: 0x{:016X}", target);

        let target_end = target + size;
        assert!(target_end >= target);
        assert!(size > 0);

        let mut begin_base = self.find_vma(target)?;
        if self
            .vma_map
            .range(begin_base..target_end)
            .any(|(_, vma)| vma.state == VmaState::Unmapped)
        {
            return None;
        }

        if target != begin_base {
            begin_base = self.split_vma(begin_base, target - begin_base);
        }

        if let Some(end_base) = self.find_vma(target_end) {
            if target_end != end_base {
                self.split_vma(end_base, target_end - end_base);
            }
        }

        Some(begin_base)
    }

    /// Split the VMA at `base` at a strictly interior offset; both
    /// halves inherit the state. Returns the right half's base.
    fn split_vma(&mut self, base: GPUVAddr, offset_in_vma: u64) -> GPUVAddr {
        let old_vma = self
            .vma_map
            .get_mut(&base)
            .expect("split target must be a VMA base");

        // Boundary splits are bugs in the caller.
        assert!(offset_in_vma < old_vma.size, "split out of range");
        assert!(offset_in_vma > 0, "split at start of VMA");

        let mut new_vma = *old_vma;
        old_vma.size = offset_in_vma;
        new_vma.base += offset_in_vma;
        new_vma.size -= offset_in_vma;

        match new_vma.state {
            VmaState::Unmapped => {}
            VmaState::Allocated => new_vma.offset += offset_in_vma,
            VmaState::Mapped => {
                new_vma.backing_memory =
                    unsafe { new_vma.backing_memory.add(offset_in_vma as usize) };
                new_vma.backing_addr += offset_in_vma;
            }
        }

        let left = self.vma_map[&base];
        assert!(left.can_be_merged_with(&new_vma));

        self.vma_map.insert(new_vma.base, new_vma);
        new_vma.base
    }

    /// Fold the VMA at `base` together with its successor and then its
    /// predecessor, where the merge rule allows. Returns the resulting
    /// (possibly widened) base.
    fn merge_adjacent(&mut self, base: GPUVAddr) -> GPUVAddr {
        let mut base = base;

        let vma = self.vma_map[&base];
        if let Some(next) = self.vma_map.get(&vma.end()).copied() {
            if vma.can_be_merged_with(&next) {
                self.vma_map
                    .get_mut(&base)
                    .expect("merge target must be a VMA base")
                    .size += next.size;
                self.vma_map.remove(&next.base);
            }
        }

        if let Some(prev) = self.vma_map.range(..base).next_back().map(|(_, vma)| *vma) {
            if prev.can_be_merged_with(&self.vma_map[&base]) {
                let merged_size = self.vma_map[&base].size;
                self.vma_map
                    .get_mut(&prev.base)
                    .expect("merge target must be a VMA base")
                    .size += merged_size;
                self.vma_map.remove(&base);
                base = prev.base;
            }
        }

        base
    }

    /// Rewrite the page-table entries covered by `vma` from its state.
    fn update_page_table_for_vma(&mut self, vma: &VirtualMemoryArea) {
        match vma.state {
            VmaState::Unmapped => self.page_table.unmap_region(vma.base, vma.size),
            VmaState::Allocated => self.page_table.map_memory_region(
                vma.base,
                vma.size,
                std::ptr::null_mut(),
                vma.backing_addr,
            ),
            VmaState::Mapped => self.page_table.map_memory_region(
                vma.base,
                vma.size,
                vma.backing_memory,
                vma.backing_addr,
            ),
        }
    }
}
