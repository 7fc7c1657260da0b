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

//! Thread-local-storage slot allocation.
//!
//! Each thread of an emulated process owns one fixed-size TLS slot inside
//! the process's TLS/IO region. Slots are [`TLS_ENTRY_SIZE`] bytes wide and
//! packed [`TLS_SLOTS_PER_PAGE`] to a page; each page is tracked as a bitmap
//! with one bit per slot.
//!
//! # Allocation Policy
//!
//! Allocation is first-fit by page, then first-fit by slot: the allocator
//! scans pages in order and returns the first clear bit it finds. A new page
//! is appended only when every existing page is completely full, backed by a
//! zero-initialized block mapped at `TLS region base + page index * page
//! size`. This policy is deterministic and must be reproduced exactly for
//! address determinism across runs with the same thread creation order.
//!
//! Pages are never reclaimed once allocated; freeing a slot only clears its
//! bit. The pages themselves live until the owning process exits.

use std::sync::Arc;

use crate::{
    memory::{AddressSpace, MemoryBlock, MemoryState, PAGE_SIZE},
    Result,
};

/// Width of one thread-local-storage slot, in bytes.
pub const TLS_ENTRY_SIZE: u64 = 0x200;

/// Number of TLS slots in one page.
pub const TLS_SLOTS_PER_PAGE: usize = (PAGE_SIZE / TLS_ENTRY_SIZE) as usize;

/// Occupancy bitmap of one allocated TLS page, one bit per slot.
#[derive(Debug, Clone, Copy, Default)]
struct TlsPage {
    slots: u8,
}

impl TlsPage {
    const FULL: u8 = u8::MAX;

    fn is_full(self) -> bool {
        self.slots == Self::FULL
    }

    fn first_free_slot(self) -> Option<usize> {
        (0..TLS_SLOTS_PER_PAGE).find(|&slot| self.slots & (1 << slot) == 0)
    }

    fn mark_used(&mut self, slot: usize) {
        self.slots |= 1 << slot;
    }

    fn mark_free(&mut self, slot: usize) {
        self.slots &= !(1 << slot);
    }
}

/// Allocator for fixed-size thread-local-storage slots.
///
/// One `TlsAllocator` exists per process, scoped to that process's address
/// space. See the [module documentation](self) for the allocation policy.
///
/// # Example
///
/// ```rust
/// use nxkernel::memory::{AddressSpace, AddressSpaceType, TlsAllocator, TLS_ENTRY_SIZE};
///
/// let mut space = AddressSpace::new(AddressSpaceType::Is39Bit);
/// let mut tls = TlsAllocator::default();
///
/// let first = tls.allocate(&mut space)?;
/// let second = tls.allocate(&mut space)?;
/// assert_eq!(second, first + TLS_ENTRY_SIZE);
/// # Ok::<(), nxkernel::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct TlsAllocator {
    pages: Vec<TlsPage>,
}

impl TlsAllocator {
    /// Creates an allocator with no pages.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of TLS pages currently allocated.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Marks the next available TLS slot as used and returns its address.
    ///
    /// Scans allocated pages in order for the first free slot. If every page
    /// is full, appends a new page backed by a zero-filled block and maps it
    /// into `address_space` with the ThreadLocal state, then uses slot 0 of
    /// that page.
    ///
    /// # Errors
    ///
    /// Returns an error if mapping a newly required TLS page fails.
    pub fn allocate(&mut self, address_space: &mut AddressSpace) -> Result<u64> {
        let tls_base = address_space.tls_io_region_base();

        let (page, slot) = match self.find_free_slot() {
            Some(found) => found,
            None => {
                // All pages are full; back and map a fresh one.
                let page = self.pages.len();
                let block: MemoryBlock = Arc::new(vec![0u8; PAGE_SIZE as usize]);
                address_space.map_memory_block(
                    tls_base + page as u64 * PAGE_SIZE,
                    block,
                    0,
                    PAGE_SIZE,
                    MemoryState::ThreadLocal,
                )?;
                self.pages.push(TlsPage::default());
                (page, 0)
            }
        };

        self.pages[page].mark_used(slot);

        Ok(tls_base + page as u64 * PAGE_SIZE + slot as u64 * TLS_ENTRY_SIZE)
    }

    /// Frees the TLS slot at `address`.
    ///
    /// Only the slot's bit is cleared; the page stays allocated and mapped.
    ///
    /// # Panics
    ///
    /// Panics if `address` does not fall inside any allocated TLS page.
    /// That indicates slot-bookkeeping corruption in the caller, which the
    /// emulated kernel cannot recover from.
    pub fn free(&mut self, address: u64, address_space: &AddressSpace) {
        let tls_base = address_space.tls_io_region_base();
        assert!(
            address >= tls_base,
            "TLS address {address:#X} precedes the TLS region"
        );

        let offset = address - tls_base;
        let page = (offset / PAGE_SIZE) as usize;
        let slot = ((offset % PAGE_SIZE) / TLS_ENTRY_SIZE) as usize;
        assert!(
            page < self.pages.len(),
            "TLS address {address:#X} is outside any allocated page"
        );

        self.pages[page].mark_free(slot);
    }

    /// Finds the first page with a free slot and the first free slot in it.
    fn find_free_slot(&self) -> Option<(usize, usize)> {
        self.pages
            .iter()
            .enumerate()
            .find(|(_, page)| !page.is_full())
            .and_then(|(index, page)| page.first_free_slot().map(|slot| (index, slot)))
    }
}
