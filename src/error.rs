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

use thiserror::Error;

/// The generic Error type, which provides coverage for all guest-visible
/// kernel errors this library can potentially return.
///
/// This enum covers the error conditions a guest program can legitimately
/// trigger through the emulated kernel interface: invalid object states,
/// malformed capability descriptors, bad mappings, and exhausted resources.
///
/// Host-internal invariant violations (acquiring an unavailable wait object,
/// terminating a process whose sibling threads are not quiesced, corrupting
/// the TLS slot bitmap) are *not* represented here. Those indicate a bug in
/// the surrounding scheduler contract or genuinely unsupported guest
/// behavior, and they panic instead of returning an error.
///
/// # Error Categories
///
/// ## Kernel object state
/// - [`Error::InvalidState`] - Operation not permitted in the object's current state
/// - [`Error::InvalidHandle`] - Handle does not refer to a live object
/// - [`Error::HandleTableFull`] - No free slot in the process handle table
///
/// ## Address space
/// - [`Error::InvalidAddress`] - Address outside the process address space or misaligned
/// - [`Error::OverlappingRegion`] - Requested mapping intersects an existing region
/// - [`Error::InvalidSize`] - Zero or out-of-range size
///
/// ## Thread parameters
/// - [`Error::InvalidPriority`] - Thread priority outside the permitted range
/// - [`Error::InvalidCoreId`] - Processor id outside the emulated core set
///
/// ## Capability parsing
/// - [`Error::InvalidCapability`] - Unknown capability descriptor kind
/// - [`Error::ReservedValue`] - Reserved descriptor bits were set
/// - [`Error::InvalidCombination`] - Duplicate or mutually exclusive descriptors
///
/// ## Resources
/// - [`Error::LimitReached`] - A resource limit reservation failed
#[derive(Error, Debug)]
pub enum Error {
    /// The object is not in a state that permits the requested operation.
    ///
    /// Returned, for example, when clearing the signal of a process that is
    /// not currently signaled, or of a process that has already exited.
    #[error("The object is not in a state that permits this operation")]
    InvalidState,

    /// An address was rejected by the address-space manager.
    ///
    /// The address is either outside the process address space, not
    /// page-aligned, or does not correspond to a mapped region.
    #[error("Invalid address {address:#X}: {reason}")]
    InvalidAddress {
        /// The offending virtual address.
        address: u64,
        /// Why the address was rejected.
        reason: &'static str,
    },

    /// A requested mapping intersects a region that is already mapped.
    ///
    /// Mapped regions within one address space never overlap; the mapping
    /// is rejected without modifying the address space.
    #[error("Mapping of {size:#X} bytes at {base:#X} overlaps an existing region")]
    OverlappingRegion {
        /// Base address of the rejected mapping.
        base: u64,
        /// Size of the rejected mapping in bytes.
        size: u64,
    },

    /// A size argument was rejected.
    #[error("Invalid size {size:#X}: {reason}")]
    InvalidSize {
        /// The offending size in bytes.
        size: u64,
        /// Why the size was rejected.
        reason: &'static str,
    },

    /// A thread priority was outside the permitted range.
    ///
    /// Valid priorities run from 0 (highest) to 63 (lowest), further
    /// restricted by the owning process's capability set.
    #[error("Invalid thread priority: {0}")]
    InvalidPriority(u32),

    /// A processor id was outside the emulated core set.
    #[error("Invalid processor id: {0}")]
    InvalidCoreId(u32),

    /// A kernel capability descriptor had an unknown kind tag.
    ///
    /// The descriptor kind is encoded in the count of trailing one bits;
    /// descriptors whose tag matches no known capability are rejected and
    /// the program load is aborted.
    #[error("Unknown kernel capability descriptor: {0:#010X}")]
    InvalidCapability(u32),

    /// Reserved bits were set in a kernel capability descriptor.
    #[error("Reserved bits set in kernel capability descriptor: {0:#010X}")]
    ReservedValue(u32),

    /// Duplicate or mutually exclusive kernel capability descriptors.
    ///
    /// Single-instance capabilities (thread info, program type, kernel
    /// version, handle table size, debug flags) may only be declared once,
    /// and some flag combinations are rejected outright.
    #[error("Invalid combination of kernel capability descriptors")]
    InvalidCombination,

    /// The handle table has no free slot for a new handle.
    #[error("Handle table is full (capacity {0})")]
    HandleTableFull(usize),

    /// A handle does not refer to a live kernel object.
    #[error("Invalid handle: {0:#010X}")]
    InvalidHandle(u32),

    /// A resource limit reservation failed.
    ///
    /// The associated value names the exhausted resource category.
    #[error("Resource limit exceeded for {0}")]
    LimitReached(&'static str),

    /// Generic error for miscellaneous failures.
    ///
    /// Used for errors that don't fit into other categories or for
    /// wrapping collaborator errors with additional context.
    #[error("{0}")]
    Error(String),
}
