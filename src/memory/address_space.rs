// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Per-process virtual address-space management.
//!
//! This module provides [`AddressSpace`], which owns the layout and
//! permission state of one process's virtual memory. The address space is
//! divided into fixed regions (code, map, heap, TLS/IO) whose boundaries are
//! determined by the [`AddressSpaceType`] declared in program metadata.
//!
//! # Invariants
//!
//! - Mapped regions never overlap. A mapping whose range intersects an
//!   existing region is rejected with [`Error::OverlappingRegion`] without
//!   modifying the address space.
//! - Every mapping has exactly one semantic [`MemoryState`] and one
//!   [`MemoryPermission`] set at a time; reprotection replaces, it never
//!   merges.

use std::{collections::BTreeMap, ops::Range, sync::Arc};

use crate::{memory::PAGE_SIZE, Error, Result};

bitflags::bitflags! {
    /// Access permission of one mapped region.
    ///
    /// Permissions are any combination of read, write, and execute.
    /// Reprotecting a region replaces its permission set wholesale.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryPermission: u32 {
        /// No access.
        const NONE = 0;
        /// Region can be read.
        const READ = 1;
        /// Region can be written.
        const WRITE = 2;
        /// Region can be executed.
        const EXECUTE = 4;
        /// Read and write access.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Read and execute access, used for code segments.
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

/// Semantic state tag of one mapped region.
///
/// Every mapping carries exactly one state, describing what the region is
/// used for from the guest kernel's point of view. The state is independent
/// of the region's [`MemoryPermission`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum MemoryState {
    /// Executable program code.
    Code,
    /// Static program data (read-only or read-write segments).
    CodeData,
    /// Dynamically allocated heap memory.
    Heap,
    /// A thread stack.
    Stack,
    /// A thread-local-storage page.
    ThreadLocal,
    /// Memory-mapped IO.
    Io,
    /// No mapping; only ever returned by state queries.
    Unmapped,
}

/// The address-space flavor a process runs under.
///
/// Declared by program metadata and applied via [`AddressSpace::reset`].
/// Each flavor fixes the width of the address space and the boundaries of
/// its code, map, heap, and TLS/IO regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum AddressSpaceType {
    /// 32-bit address space with a map region.
    Is32Bit,
    /// 36-bit address space.
    Is36Bit,
    /// 32-bit address space without a map region.
    Is32BitNoMap,
    /// 39-bit address space, the default for modern programs.
    Is39Bit,
}

/// Fixed region boundaries for one address-space flavor.
#[derive(Debug, Clone)]
struct AddressSpaceLayout {
    code: Range<u64>,
    map: Range<u64>,
    heap: Range<u64>,
    tls_io: Range<u64>,
    end: u64,
}

impl AddressSpaceType {
    /// Returns the fixed region layout for this address-space flavor.
    ///
    /// Code sits low, map and heap in the middle, and the TLS/IO region at
    /// the top of the space; stacks grow downward from the TLS/IO region
    /// end while TLS pages grow upward from its base.
    fn layout(self) -> AddressSpaceLayout {
        match self {
            AddressSpaceType::Is32Bit => AddressSpaceLayout {
                code: 0x0020_0000..0x4000_0000,
                map: 0x4000_0000..0x8000_0000,
                heap: 0x8000_0000..0xC000_0000,
                tls_io: 0xC000_0000..0x1_0000_0000,
                end: 1 << 32,
            },
            AddressSpaceType::Is32BitNoMap => AddressSpaceLayout {
                code: 0x0020_0000..0x4000_0000,
                map: 0..0,
                heap: 0x4000_0000..0xC000_0000,
                tls_io: 0xC000_0000..0x1_0000_0000,
                end: 1 << 32,
            },
            AddressSpaceType::Is36Bit => AddressSpaceLayout {
                code: 0x0800_0000..0x8800_0000,
                map: 0x1_0000_0000..0x4_0000_0000,
                heap: 0x4_0000_0000..0x8_0000_0000,
                tls_io: 0x8_0000_0000..0x10_0000_0000,
                end: 1 << 36,
            },
            AddressSpaceType::Is39Bit => AddressSpaceLayout {
                code: 0x0800_0000..0x8800_0000,
                map: 0x10_0000_0000..0x20_0000_0000,
                heap: 0x20_0000_0000..0x40_0000_0000,
                tls_io: 0x40_0000_0000..0x80_0000_0000,
                end: 1 << 39,
            },
        }
    }
}

/// Backing storage for a mapped region, shared between the address space
/// and whichever component allocated it.
pub type MemoryBlock = Arc<Vec<u8>>;

/// One mapped region of a process address space.
///
/// A region is identified by its base address and covers `size` bytes of a
/// backing [`MemoryBlock`] starting at `offset`. It carries exactly one
/// [`MemoryState`] tag and one [`MemoryPermission`] set.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    base: u64,
    size: u64,
    block: MemoryBlock,
    offset: u64,
    state: MemoryState,
    permission: MemoryPermission,
}

impl MemoryRegion {
    /// Returns the base virtual address of this region.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Returns the size of this region in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the first address past the end of this region.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    /// Returns the semantic state tag of this region.
    #[must_use]
    pub fn state(&self) -> MemoryState {
        self.state
    }

    /// Returns the access permission of this region.
    #[must_use]
    pub fn permission(&self) -> MemoryPermission {
        self.permission
    }

    /// Returns the backing block this region maps.
    #[must_use]
    pub fn block(&self) -> &MemoryBlock {
        &self.block
    }

    /// Returns the offset into the backing block where this region begins.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// The layout and permission state of one process's virtual memory.
///
/// `AddressSpace` maps regions identified by base address, size, backing
/// storage, permission, and a semantic state tag. It exposes the fixed
/// region boundaries (code region base, TLS/IO region end, ...) used to lay
/// out stacks and TLS pages from fixed boundaries.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use nxkernel::memory::{AddressSpace, AddressSpaceType, MemoryState, PAGE_SIZE};
///
/// let mut space = AddressSpace::new(AddressSpaceType::Is39Bit);
/// let base = space.code_region_base();
/// let block = Arc::new(vec![0u8; PAGE_SIZE as usize]);
///
/// space.map_memory_block(base, block, 0, PAGE_SIZE, MemoryState::Code)?;
/// assert!(space.region_at(base).is_some());
/// # Ok::<(), nxkernel::Error>(())
/// ```
#[derive(Debug)]
pub struct AddressSpace {
    /// Mapped regions keyed by their base address.
    regions: BTreeMap<u64, MemoryRegion>,
    layout: AddressSpaceLayout,
    address_space_type: AddressSpaceType,
}

impl AddressSpace {
    /// Creates a new, empty address space with the given flavor.
    #[must_use]
    pub fn new(address_space_type: AddressSpaceType) -> Self {
        AddressSpace {
            regions: BTreeMap::new(),
            layout: address_space_type.layout(),
            address_space_type,
        }
    }

    /// Clears all mappings and installs the layout of the given flavor.
    ///
    /// Called when program metadata declares the address-space type the
    /// process must run under. Any regions mapped before the reset are
    /// discarded.
    pub fn reset(&mut self, address_space_type: AddressSpaceType) {
        self.regions.clear();
        self.layout = address_space_type.layout();
        self.address_space_type = address_space_type;
    }

    /// Returns the flavor this address space currently uses.
    #[must_use]
    pub fn address_space_type(&self) -> AddressSpaceType {
        self.address_space_type
    }

    /// Maps `size` bytes of `block` (starting at `offset`) at `base`.
    ///
    /// The new region is created with [`MemoryPermission::READ_WRITE`]; use
    /// [`reprotect`](Self::reprotect) to change that afterwards.
    ///
    /// # Arguments
    ///
    /// * `base` - Page-aligned base virtual address for the mapping
    /// * `block` - Backing storage shared with the caller
    /// * `offset` - Offset into `block` where the mapping begins
    /// * `size` - Size of the mapping in bytes
    /// * `state` - Semantic state tag for the new region
    ///
    /// # Returns
    ///
    /// The base address of the new region.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAddress`] if `base` is unaligned or the range falls
    ///   outside the address space
    /// - [`Error::InvalidSize`] if `size` is zero or exceeds the backing
    ///   block
    /// - [`Error::OverlappingRegion`] if the range intersects an existing
    ///   region
    pub fn map_memory_block(
        &mut self,
        base: u64,
        block: MemoryBlock,
        offset: u64,
        size: u64,
        state: MemoryState,
    ) -> Result<u64> {
        if base % PAGE_SIZE != 0 {
            return Err(Error::InvalidAddress {
                address: base,
                reason: "mapping base is not page aligned",
            });
        }
        if size == 0 {
            return Err(Error::InvalidSize {
                size,
                reason: "mappings must cover at least one byte",
            });
        }
        let end = base.checked_add(size).ok_or(Error::InvalidSize {
            size,
            reason: "mapping wraps the address space",
        })?;
        if end > self.layout.end {
            return Err(Error::InvalidAddress {
                address: base,
                reason: "mapping extends past the end of the address space",
            });
        }
        let backing_end = offset.checked_add(size).ok_or(Error::InvalidSize {
            size,
            reason: "backing range wraps",
        })?;
        if backing_end > block.len() as u64 {
            return Err(Error::InvalidSize {
                size,
                reason: "mapping extends past the end of the backing block",
            });
        }
        if self.overlaps(base, size) {
            return Err(Error::OverlappingRegion { base, size });
        }

        self.regions.insert(
            base,
            MemoryRegion {
                base,
                size,
                block,
                offset,
                state,
                permission: MemoryPermission::READ_WRITE,
            },
        );

        Ok(base)
    }

    /// Replaces the permission set of the region mapped at exactly `base`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if no region is mapped at `base`.
    pub fn reprotect(&mut self, base: u64, permission: MemoryPermission) -> Result<()> {
        let region = self.regions.get_mut(&base).ok_or(Error::InvalidAddress {
            address: base,
            reason: "no region mapped at this address",
        })?;
        region.permission = permission;
        Ok(())
    }

    /// Removes the region mapped at exactly `base`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if no region is mapped at `base`.
    pub fn unmap(&mut self, base: u64) -> Result<()> {
        self.regions.remove(&base).ok_or(Error::InvalidAddress {
            address: base,
            reason: "no region mapped at this address",
        })?;
        Ok(())
    }

    /// Returns the region containing `address`, if any.
    #[must_use]
    pub fn region_at(&self, address: u64) -> Option<&MemoryRegion> {
        self.regions
            .range(..=address)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| address < region.end())
    }

    /// Returns `true` if `address` lies inside a mapped region.
    #[must_use]
    pub fn is_valid_address(&self, address: u64) -> bool {
        self.region_at(address).is_some()
    }

    /// Returns the semantic state at `address`, or
    /// [`MemoryState::Unmapped`] if nothing is mapped there.
    #[must_use]
    pub fn state_at(&self, address: u64) -> MemoryState {
        self.region_at(address)
            .map_or(MemoryState::Unmapped, MemoryRegion::state)
    }

    /// Returns an iterator over all mapped regions in address order.
    pub fn regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.values()
    }

    /// Returns the base address of the code region.
    #[must_use]
    pub fn code_region_base(&self) -> u64 {
        self.layout.code.start
    }

    /// Returns the end address of the code region.
    #[must_use]
    pub fn code_region_end(&self) -> u64 {
        self.layout.code.end
    }

    /// Returns the base address of the heap region.
    #[must_use]
    pub fn heap_region_base(&self) -> u64 {
        self.layout.heap.start
    }

    /// Returns the end address of the heap region.
    #[must_use]
    pub fn heap_region_end(&self) -> u64 {
        self.layout.heap.end
    }

    /// Returns the base address of the TLS/IO region.
    ///
    /// TLS pages are laid out upward from this boundary.
    #[must_use]
    pub fn tls_io_region_base(&self) -> u64 {
        self.layout.tls_io.start
    }

    /// Returns the end address of the TLS/IO region.
    ///
    /// The main thread stack is mapped immediately below this boundary.
    #[must_use]
    pub fn tls_io_region_end(&self) -> u64 {
        self.layout.tls_io.end
    }

    /// Returns the first address past the end of the address space.
    #[must_use]
    pub fn address_space_end(&self) -> u64 {
        self.layout.end
    }

    /// Returns the total size of all Heap-state regions, in bytes.
    #[must_use]
    pub fn current_heap_size(&self) -> u64 {
        self.regions
            .values()
            .filter(|region| region.state == MemoryState::Heap)
            .map(|region| region.size)
            .sum()
    }

    /// Logs the current mapping layout at debug level.
    pub fn log_layout(&self) {
        log::debug!(
            "address space layout ({}, end {:#X}):",
            self.address_space_type,
            self.layout.end
        );
        for region in self.regions.values() {
            log::debug!(
                "  {:#014X}..{:#014X} {:?} {}",
                region.base,
                region.end(),
                region.permission,
                region.state
            );
        }
    }

    /// Reports whether `[base, base + size)` intersects any mapped region.
    fn overlaps(&self, base: u64, size: u64) -> bool {
        let end = base + size;

        // The only candidates are the closest region at or below `base` and
        // any region starting inside the requested range.
        if let Some((_, below)) = self.regions.range(..=base).next_back() {
            if below.end() > base {
                return true;
            }
        }
        self.regions.range(base..end).next().is_some()
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new(AddressSpaceType::Is39Bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(size: u64) -> MemoryBlock {
        Arc::new(vec![0u8; size as usize])
    }

    #[test]
    fn test_map_and_lookup() {
        let mut space = AddressSpace::new(AddressSpaceType::Is39Bit);
        let base = space.code_region_base();

        space
            .map_memory_block(base, block(PAGE_SIZE), 0, PAGE_SIZE, MemoryState::Code)
            .unwrap();

        let region = space.region_at(base + 0x10).unwrap();
        assert_eq!(region.base(), base);
        assert_eq!(region.state(), MemoryState::Code);
        assert_eq!(region.permission(), MemoryPermission::READ_WRITE);
        assert!(space.region_at(base + PAGE_SIZE).is_none());

        assert_eq!(space.state_at(base), MemoryState::Code);
        assert_eq!(space.state_at(base + PAGE_SIZE), MemoryState::Unmapped);
    }

    #[test]
    fn test_overlapping_mappings_rejected() {
        let mut space = AddressSpace::new(AddressSpaceType::Is39Bit);
        let base = space.code_region_base();

        space
            .map_memory_block(base, block(2 * PAGE_SIZE), 0, 2 * PAGE_SIZE, MemoryState::Code)
            .unwrap();

        // Intersecting from below, from above, and exactly on top.
        assert!(matches!(
            space.map_memory_block(base + PAGE_SIZE, block(PAGE_SIZE), 0, PAGE_SIZE, MemoryState::Code),
            Err(Error::OverlappingRegion { .. })
        ));
        assert!(matches!(
            space.map_memory_block(base, block(PAGE_SIZE), 0, PAGE_SIZE, MemoryState::Code),
            Err(Error::OverlappingRegion { .. })
        ));

        // Adjacent mapping is fine.
        space
            .map_memory_block(
                base + 2 * PAGE_SIZE,
                block(PAGE_SIZE),
                0,
                PAGE_SIZE,
                MemoryState::Code,
            )
            .unwrap();
    }

    #[test]
    fn test_unaligned_base_rejected() {
        let mut space = AddressSpace::new(AddressSpaceType::Is39Bit);
        let base = space.code_region_base() + 0x10;

        assert!(matches!(
            space.map_memory_block(base, block(PAGE_SIZE), 0, PAGE_SIZE, MemoryState::Code),
            Err(Error::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_mapping_past_end_rejected() {
        let mut space = AddressSpace::new(AddressSpaceType::Is32Bit);
        let base = space.address_space_end() - PAGE_SIZE;

        assert!(matches!(
            space.map_memory_block(base, block(2 * PAGE_SIZE), 0, 2 * PAGE_SIZE, MemoryState::Io),
            Err(Error::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_reprotect_replaces_permission() {
        let mut space = AddressSpace::new(AddressSpaceType::Is39Bit);
        let base = space.code_region_base();

        space
            .map_memory_block(base, block(PAGE_SIZE), 0, PAGE_SIZE, MemoryState::Code)
            .unwrap();
        space
            .reprotect(base, MemoryPermission::READ_EXECUTE)
            .unwrap();

        assert_eq!(
            space.region_at(base).unwrap().permission(),
            MemoryPermission::READ_EXECUTE
        );

        assert!(matches!(
            space.reprotect(base + PAGE_SIZE, MemoryPermission::READ),
            Err(Error::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_reset_discards_mappings() {
        let mut space = AddressSpace::new(AddressSpaceType::Is39Bit);
        let base = space.code_region_base();
        space
            .map_memory_block(base, block(PAGE_SIZE), 0, PAGE_SIZE, MemoryState::Code)
            .unwrap();

        space.reset(AddressSpaceType::Is32Bit);

        assert_eq!(space.address_space_type(), AddressSpaceType::Is32Bit);
        assert_eq!(space.regions().count(), 0);
        assert_eq!(space.address_space_end(), 1 << 32);
    }

    #[test]
    fn test_heap_size_accounting() {
        let mut space = AddressSpace::new(AddressSpaceType::Is39Bit);
        let heap = space.heap_region_base();

        space
            .map_memory_block(heap, block(PAGE_SIZE), 0, PAGE_SIZE, MemoryState::Heap)
            .unwrap();
        space
            .map_memory_block(
                heap + PAGE_SIZE,
                block(3 * PAGE_SIZE),
                0,
                3 * PAGE_SIZE,
                MemoryState::Heap,
            )
            .unwrap();
        space
            .map_memory_block(
                space.code_region_base(),
                block(PAGE_SIZE),
                0,
                PAGE_SIZE,
                MemoryState::Code,
            )
            .unwrap();

        assert_eq!(space.current_heap_size(), 4 * PAGE_SIZE);
    }
}
