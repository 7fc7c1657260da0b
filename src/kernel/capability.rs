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

//! Process capability sets.
//!
//! A process's capability set declares the privileges and resources the
//! guest kernel permits it to use: schedulable priority and core ranges,
//! callable system calls, mappable physical/IO ranges, usable interrupts,
//! the program type, the targeted kernel version, the handle table size,
//! and debug permissions.
//!
//! Capabilities arrive as raw `u32` descriptors in program metadata. The
//! kind of each descriptor is encoded in the count of trailing one bits:
//! a descriptor ending in `0111` (three ones) carries thread info, one
//! ending in `01111` a system-call mask, and so on. Malformed or duplicated
//! descriptors abort the program load with a distinct error.

use crate::{
    kernel::NUM_CPU_CORES,
    memory::{AddressSpace, PAGE_SIZE},
    Error, Result,
};

/// Number of distinct system calls a capability mask can cover.
const SVC_CAPABILITY_COUNT: u32 = 128;

/// System calls covered by one EnableSystemCalls descriptor.
const SVC_MASK_WIDTH: u32 = 24;

/// Interrupt id value meaning "no interrupt in this half".
const INTERRUPT_ID_NONE: u32 = 0x3FF;

/// Default handle table size for processes without metadata.
const METADATALESS_HANDLE_TABLE_SIZE: u32 = 0x200;

/// The kind of one capability descriptor, tagged by trailing one bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CapabilityKind {
    ThreadInfo,
    EnableSystemCalls,
    MapPhysical,
    MapIo,
    EnableInterrupts,
    ProgramType,
    KernelVersion,
    HandleTableSize,
    DebugFlags,
}

impl CapabilityKind {
    /// Decodes the kind tag of `descriptor`, if it is a known kind.
    fn decode(descriptor: u32) -> Option<Self> {
        match (!descriptor).trailing_zeros() {
            3 => Some(CapabilityKind::ThreadInfo),
            4 => Some(CapabilityKind::EnableSystemCalls),
            6 => Some(CapabilityKind::MapPhysical),
            7 => Some(CapabilityKind::MapIo),
            11 => Some(CapabilityKind::EnableInterrupts),
            13 => Some(CapabilityKind::ProgramType),
            14 => Some(CapabilityKind::KernelVersion),
            15 => Some(CapabilityKind::HandleTableSize),
            16 => Some(CapabilityKind::DebugFlags),
            _ => None,
        }
    }

    /// Returns `true` if this kind may appear at most once.
    fn single_instance(self) -> bool {
        matches!(
            self,
            CapabilityKind::ThreadInfo
                | CapabilityKind::ProgramType
                | CapabilityKind::KernelVersion
                | CapabilityKind::HandleTableSize
                | CapabilityKind::DebugFlags
        )
    }

    fn set_flag(self) -> u32 {
        1 << self as u32
    }
}

/// Broad classification of a program, declared by its capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum ProgramType {
    /// A system module.
    #[default]
    SystemModule,
    /// A regular application.
    Application,
    /// A system applet.
    Applet,
}

/// A physical or IO range a process is permitted to map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappableRange {
    /// Physical base address of the range.
    pub base: u64,
    /// Size of the range in bytes.
    pub size: u64,
    /// Whether the range may only be mapped read-only.
    pub read_only: bool,
    /// Whether the range is memory-mapped IO.
    pub is_io: bool,
}

/// The declared privilege set of one process.
///
/// Built either from program metadata via
/// [`from_metadata`](ProcessCapabilities::from_metadata), or with maximal
/// defaults via
/// [`metadataless`](ProcessCapabilities::metadataless) for processes that
/// run before any program image is loaded.
#[derive(Debug, Clone)]
pub struct ProcessCapabilities {
    priority_mask: u64,
    core_mask: u64,
    svc_capabilities: u128,
    mappable_ranges: Vec<MappableRange>,
    interrupts: Vec<u32>,
    program_type: ProgramType,
    kernel_version: u32,
    handle_table_size: u32,
    allow_debug: bool,
    force_debug: bool,
}

impl Default for ProcessCapabilities {
    fn default() -> Self {
        Self::metadataless()
    }
}

impl ProcessCapabilities {
    /// Creates the maximal default capability set.
    ///
    /// Used for processes created before a program image is loaded: all
    /// cores, all priorities, and all system calls are permitted, and the
    /// handle table gets its default size.
    #[must_use]
    pub fn metadataless() -> Self {
        ProcessCapabilities {
            priority_mask: u64::MAX,
            core_mask: (1 << NUM_CPU_CORES) - 1,
            svc_capabilities: u128::MAX,
            mappable_ranges: Vec::new(),
            interrupts: Vec::new(),
            program_type: ProgramType::SystemModule,
            kernel_version: 0,
            handle_table_size: METADATALESS_HANDLE_TABLE_SIZE,
            allow_debug: true,
            force_debug: false,
        }
    }

    /// Parses a capability set from the raw descriptors in program metadata.
    ///
    /// `address_space` is consulted to validate that declared mappable
    /// ranges fit inside the process's address space.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCapability`] for an unknown descriptor kind
    /// - [`Error::ReservedValue`] for set reserved bits
    /// - [`Error::InvalidCombination`] for duplicated single-instance
    ///   descriptors, repeated system-call bits, an unpaired physical-map
    ///   descriptor, or both debug flags at once
    /// - [`Error::InvalidPriority`] / [`Error::InvalidCoreId`] for
    ///   out-of-range thread info
    /// - [`Error::InvalidAddress`] for a mappable range outside the address
    ///   space
    pub fn from_metadata(descriptors: &[u32], address_space: &AddressSpace) -> Result<Self> {
        let mut capabilities = ProcessCapabilities {
            priority_mask: 0,
            core_mask: 0,
            svc_capabilities: 0,
            mappable_ranges: Vec::new(),
            interrupts: Vec::new(),
            program_type: ProgramType::SystemModule,
            kernel_version: 0,
            handle_table_size: 0,
            allow_debug: false,
            force_debug: false,
        };

        let mut seen_kinds: u32 = 0;
        let mut index = 0;
        while index < descriptors.len() {
            let descriptor = descriptors[index];
            let kind = CapabilityKind::decode(descriptor)
                .ok_or(Error::InvalidCapability(descriptor))?;

            if kind.single_instance() {
                if seen_kinds & kind.set_flag() != 0 {
                    log::error!("duplicate kernel capability descriptor: {descriptor:#010X}");
                    return Err(Error::InvalidCombination);
                }
                seen_kinds |= kind.set_flag();
            }

            match kind {
                CapabilityKind::ThreadInfo => {
                    capabilities.parse_thread_info(descriptor)?;
                }
                CapabilityKind::EnableSystemCalls => {
                    capabilities.parse_system_calls(descriptor)?;
                }
                CapabilityKind::MapPhysical => {
                    // Physical maps come as an address/size descriptor pair.
                    let size_descriptor = descriptors.get(index + 1).copied().ok_or_else(|| {
                        log::error!("unpaired physical map capability: {descriptor:#010X}");
                        Error::InvalidCombination
                    })?;
                    if CapabilityKind::decode(size_descriptor) != Some(CapabilityKind::MapPhysical)
                    {
                        return Err(Error::InvalidCombination);
                    }
                    capabilities.parse_map_physical(descriptor, size_descriptor, address_space)?;
                    index += 1;
                }
                CapabilityKind::MapIo => {
                    capabilities.parse_map_io(descriptor, address_space)?;
                }
                CapabilityKind::EnableInterrupts => {
                    capabilities.parse_interrupts(descriptor);
                }
                CapabilityKind::ProgramType => {
                    capabilities.program_type = match (descriptor >> 14) & 0x7 {
                        0 => ProgramType::SystemModule,
                        1 => ProgramType::Application,
                        2 => ProgramType::Applet,
                        _ => return Err(Error::ReservedValue(descriptor)),
                    };
                }
                CapabilityKind::KernelVersion => {
                    capabilities.kernel_version = descriptor >> 15;
                }
                CapabilityKind::HandleTableSize => {
                    if descriptor >> 26 != 0 {
                        return Err(Error::ReservedValue(descriptor));
                    }
                    capabilities.handle_table_size = (descriptor >> 16) & 0x3FF;
                }
                CapabilityKind::DebugFlags => {
                    capabilities.allow_debug = descriptor & (1 << 17) != 0;
                    capabilities.force_debug = descriptor & (1 << 18) != 0;
                    if capabilities.allow_debug && capabilities.force_debug {
                        return Err(Error::InvalidCombination);
                    }
                }
            }

            index += 1;
        }

        Ok(capabilities)
    }

    /// Returns the bitmask of priorities this process may schedule at.
    #[must_use]
    pub fn priority_mask(&self) -> u64 {
        self.priority_mask
    }

    /// Returns the bitmask of cores this process may run on.
    #[must_use]
    pub fn core_mask(&self) -> u64 {
        self.core_mask
    }

    /// Returns `true` if the process may invoke system call `svc_id`.
    #[must_use]
    pub fn is_svc_permitted(&self, svc_id: u32) -> bool {
        svc_id < SVC_CAPABILITY_COUNT && self.svc_capabilities & (1 << svc_id) != 0
    }

    /// Returns the physical and IO ranges the process may map.
    #[must_use]
    pub fn mappable_ranges(&self) -> &[MappableRange] {
        &self.mappable_ranges
    }

    /// Returns the interrupt ids the process may register for.
    #[must_use]
    pub fn interrupts(&self) -> &[u32] {
        &self.interrupts
    }

    /// Returns the declared program type.
    #[must_use]
    pub fn program_type(&self) -> ProgramType {
        self.program_type
    }

    /// Returns the raw targeted kernel version (major/minor packed).
    #[must_use]
    pub fn kernel_version(&self) -> u32 {
        self.kernel_version
    }

    /// Returns the declared handle table size, in entries.
    #[must_use]
    pub fn handle_table_size(&self) -> u32 {
        self.handle_table_size
    }

    /// Returns `true` if the process may be attached to by a debugger.
    #[must_use]
    pub fn allow_debug(&self) -> bool {
        self.allow_debug
    }

    /// Parses a thread-info descriptor into priority and core masks.
    fn parse_thread_info(&mut self, descriptor: u32) -> Result<()> {
        let lowest_priority = (descriptor >> 4) & 0x3F;
        let highest_priority = (descriptor >> 10) & 0x3F;
        let min_core = (descriptor >> 16) & 0xFF;
        let max_core = (descriptor >> 24) & 0xFF;

        if highest_priority > lowest_priority {
            log::error!("invalid priority range: {highest_priority}..={lowest_priority}");
            return Err(Error::InvalidPriority(highest_priority));
        }
        if min_core > max_core {
            return Err(Error::InvalidCombination);
        }
        if max_core >= NUM_CPU_CORES {
            log::error!("invalid core range: {min_core}..={max_core}");
            return Err(Error::InvalidCoreId(max_core));
        }

        self.priority_mask = mask_range(highest_priority, lowest_priority);
        self.core_mask = mask_range(min_core, max_core);
        Ok(())
    }

    /// Parses one indexed 24-bit system-call mask.
    fn parse_system_calls(&mut self, descriptor: u32) -> Result<()> {
        let mask = (descriptor >> 5) & 0x00FF_FFFF;
        let group = descriptor >> 29;

        for bit in 0..SVC_MASK_WIDTH {
            if mask & (1 << bit) == 0 {
                continue;
            }
            let svc_id = group * SVC_MASK_WIDTH + bit;
            if svc_id >= SVC_CAPABILITY_COUNT {
                return Err(Error::ReservedValue(descriptor));
            }
            if self.svc_capabilities & (1 << svc_id) != 0 {
                // The same system call may not be granted twice.
                return Err(Error::InvalidCombination);
            }
            self.svc_capabilities |= 1 << svc_id;
        }
        Ok(())
    }

    /// Parses a paired physical-map descriptor.
    fn parse_map_physical(
        &mut self,
        address_descriptor: u32,
        size_descriptor: u32,
        address_space: &AddressSpace,
    ) -> Result<()> {
        let base = u64::from((address_descriptor >> 7) & 0x00FF_FFFF) * PAGE_SIZE;
        let read_only = address_descriptor & (1 << 31) != 0;
        let pages = u64::from((size_descriptor >> 7) & 0x000F_FFFF);
        let size = pages * PAGE_SIZE;

        if base + size > address_space.address_space_end() {
            return Err(Error::InvalidAddress {
                address: base,
                reason: "mappable range extends past the end of the address space",
            });
        }

        self.mappable_ranges.push(MappableRange {
            base,
            size,
            read_only,
            is_io: false,
        });
        Ok(())
    }

    /// Parses a single-page IO-map descriptor.
    fn parse_map_io(&mut self, descriptor: u32, address_space: &AddressSpace) -> Result<()> {
        let base = u64::from((descriptor >> 8) & 0x00FF_FFFF) * PAGE_SIZE;
        if base + PAGE_SIZE > address_space.address_space_end() {
            return Err(Error::InvalidAddress {
                address: base,
                reason: "IO page extends past the end of the address space",
            });
        }

        self.mappable_ranges.push(MappableRange {
            base,
            size: PAGE_SIZE,
            read_only: false,
            is_io: true,
        });
        Ok(())
    }

    /// Parses an interrupt-pair descriptor; `0x3FF` halves carry nothing.
    fn parse_interrupts(&mut self, descriptor: u32) {
        for interrupt in [(descriptor >> 12) & 0x3FF, (descriptor >> 22) & 0x3FF] {
            if interrupt != INTERRUPT_ID_NONE {
                self.interrupts.push(interrupt);
            }
        }
    }
}

/// Builds a bitmask with bits `low..=high` set.
fn mask_range(low: u32, high: u32) -> u64 {
    debug_assert!(low <= high && high < 64);
    let width = high - low + 1;
    if width == 64 {
        u64::MAX
    } else {
        ((1u64 << width) - 1) << low
    }
}

/// Encodes a thread-info descriptor; used by tests and tooling.
#[cfg(test)]
pub(crate) fn encode_thread_info(
    lowest_priority: u32,
    highest_priority: u32,
    min_core: u32,
    max_core: u32,
) -> u32 {
    0b0111
        | (lowest_priority << 4)
        | (highest_priority << 10)
        | (min_core << 16)
        | (max_core << 24)
}
