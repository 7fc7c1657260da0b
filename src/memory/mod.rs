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

//! Virtual memory subsystem for the emulated guest kernel.
//!
//! Each emulated process owns one [`AddressSpace`], which tracks the layout
//! and permission state of the process's virtual memory. Regions are mapped
//! with a backing block, a permission set, and exactly one semantic
//! [`MemoryState`] tag; mapped regions never overlap.
//!
//! Thread-local storage is carved out of the TLS/IO region by the
//! [`TlsAllocator`], which backs each TLS page with a zero-initialized block
//! mapped on demand.
//!
//! # Page Granularity
//!
//! All mappings are placed at [`PAGE_SIZE`]-aligned addresses. TLS slots are
//! [`TLS_ENTRY_SIZE`] bytes wide, eight to a page.

mod address_space;
mod tls;

pub use address_space::{
    AddressSpace, AddressSpaceType, MemoryBlock, MemoryPermission, MemoryRegion, MemoryState,
};
pub use tls::{TlsAllocator, TLS_ENTRY_SIZE, TLS_SLOTS_PER_PAGE};

/// The granularity of the emulated MMU, in bytes.
pub const PAGE_SIZE: u64 = 0x1000;

/// Rounds `value` up to the next multiple of `align`.
///
/// `align` must be a power of two.
pub(crate) const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, PAGE_SIZE), 0);
        assert_eq!(align_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE + 1, PAGE_SIZE), 2 * PAGE_SIZE);
    }
}
