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

//! Interfaces consumed from the program loader.
//!
//! Parsing executable formats is an external concern; this module defines
//! only the types that cross the boundary into the kernel: a prepared code
//! image ([`CodeSet`]), the program's declared metadata
//! ([`ProgramMetadata`]), and the [`ProgramLoader`] trait the
//! [`System`](crate::system::System) facade drives.

use std::sync::Arc;

use crate::{
    kernel::{KernelCore, Process},
    memory::{AddressSpaceType, MemoryBlock},
    Result,
};

/// One segment of a prepared code image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    /// Load address of the segment, relative to the image base.
    pub addr: u64,
    /// Byte offset of the segment's data inside the image's backing block.
    pub offset: u64,
    /// Size of the segment in bytes.
    pub size: u64,
}

/// A program image prepared for mapping: three segments sharing one backing
/// block.
///
/// The loader fills in the segment descriptors and the backing bytes; the
/// kernel maps them via [`Process::load_module`](crate::kernel::Process::load_module)
/// with code as read-execute, read-only data as read-only, and data as
/// read-write.
#[derive(Debug, Clone)]
pub struct CodeSet {
    segments: [Segment; 3],
    memory: MemoryBlock,
}

impl CodeSet {
    /// Wraps `memory` as an image with all segments empty.
    #[must_use]
    pub fn new(memory: MemoryBlock) -> Self {
        CodeSet {
            segments: [Segment::default(); 3],
            memory,
        }
    }

    /// Returns the executable code segment.
    #[must_use]
    pub fn code(&self) -> &Segment {
        &self.segments[0]
    }

    /// Returns the executable code segment for modification.
    pub fn code_mut(&mut self) -> &mut Segment {
        &mut self.segments[0]
    }

    /// Returns the read-only data segment.
    #[must_use]
    pub fn rodata(&self) -> &Segment {
        &self.segments[1]
    }

    /// Returns the read-only data segment for modification.
    pub fn rodata_mut(&mut self) -> &mut Segment {
        &mut self.segments[1]
    }

    /// Returns the read-write data segment.
    #[must_use]
    pub fn data(&self) -> &Segment {
        &self.segments[2]
    }

    /// Returns the read-write data segment for modification.
    pub fn data_mut(&mut self) -> &mut Segment {
        &mut self.segments[2]
    }

    /// Returns the backing block shared by all segments.
    #[must_use]
    pub fn memory(&self) -> &MemoryBlock {
        &self.memory
    }
}

/// Program metadata declared by an executable.
///
/// Built fluently by the loader and consumed by
/// [`Process::load_from_metadata`](crate::kernel::Process::load_from_metadata):
///
/// ```rust
/// use nxkernel::loader::ProgramMetadata;
/// use nxkernel::memory::AddressSpaceType;
///
/// let metadata = ProgramMetadata::new()
///     .with_title_id(0x0100_0000_0000_1000)
///     .with_main_thread_core(2)
///     .with_address_space_type(AddressSpaceType::Is39Bit);
/// assert_eq!(metadata.main_thread_core(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct ProgramMetadata {
    title_id: u64,
    main_thread_core: u32,
    is_64bit: bool,
    address_space_type: AddressSpaceType,
    main_thread_priority: u32,
    main_thread_stack_size: u64,
    kernel_capabilities: Vec<u32>,
}

impl Default for ProgramMetadata {
    fn default() -> Self {
        ProgramMetadata {
            title_id: 0,
            main_thread_core: 0,
            is_64bit: true,
            address_space_type: AddressSpaceType::Is39Bit,
            main_thread_priority: 44,
            main_thread_stack_size: 0x10000,
            kernel_capabilities: Vec::new(),
        }
    }
}

impl ProgramMetadata {
    /// Creates metadata with conventional defaults: a 64-bit program on
    /// core 0 in a 39-bit address space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the program's title id.
    #[must_use]
    pub fn with_title_id(mut self, title_id: u64) -> Self {
        self.title_id = title_id;
        self
    }

    /// Sets the core the main thread starts on.
    #[must_use]
    pub fn with_main_thread_core(mut self, core: u32) -> Self {
        self.main_thread_core = core;
        self
    }

    /// Declares the program's bitness.
    #[must_use]
    pub fn with_64bit(mut self, is_64bit: bool) -> Self {
        self.is_64bit = is_64bit;
        self
    }

    /// Sets the declared address-space layout.
    #[must_use]
    pub fn with_address_space_type(mut self, address_space_type: AddressSpaceType) -> Self {
        self.address_space_type = address_space_type;
        self
    }

    /// Sets the main thread's scheduling priority.
    #[must_use]
    pub fn with_main_thread_priority(mut self, priority: u32) -> Self {
        self.main_thread_priority = priority;
        self
    }

    /// Sets the main thread's stack size in bytes.
    #[must_use]
    pub fn with_main_thread_stack_size(mut self, stack_size: u64) -> Self {
        self.main_thread_stack_size = stack_size;
        self
    }

    /// Sets the raw kernel capability descriptors.
    #[must_use]
    pub fn with_kernel_capabilities(mut self, descriptors: Vec<u32>) -> Self {
        self.kernel_capabilities = descriptors;
        self
    }

    /// Returns the program's title id.
    #[must_use]
    pub fn title_id(&self) -> u64 {
        self.title_id
    }

    /// Returns the core the main thread starts on.
    #[must_use]
    pub fn main_thread_core(&self) -> u32 {
        self.main_thread_core
    }

    /// Returns `true` if the program is 64-bit.
    #[must_use]
    pub fn is_64bit(&self) -> bool {
        self.is_64bit
    }

    /// Returns the declared address-space layout.
    #[must_use]
    pub fn address_space_type(&self) -> AddressSpaceType {
        self.address_space_type
    }

    /// Returns the main thread's scheduling priority.
    #[must_use]
    pub fn main_thread_priority(&self) -> u32 {
        self.main_thread_priority
    }

    /// Returns the main thread's stack size in bytes.
    #[must_use]
    pub fn main_thread_stack_size(&self) -> u64 {
        self.main_thread_stack_size
    }

    /// Returns the raw kernel capability descriptors.
    #[must_use]
    pub fn kernel_capabilities(&self) -> &[u32] {
        &self.kernel_capabilities
    }
}

/// Parameters the loader hands back after populating a process.
#[derive(Debug, Clone, Copy)]
pub struct LoadParameters {
    /// Scheduling priority for the main thread.
    pub main_thread_priority: u32,
    /// Stack size for the main thread, in bytes.
    pub main_thread_stack_size: u64,
}

/// A source of executable programs.
///
/// Implementors parse one executable format. The
/// [`System`](crate::system::System) facade drives the two-phase protocol:
/// [`metadata`](ProgramLoader::metadata) first, so the process can be
/// configured before any mapping happens, then
/// [`load`](ProgramLoader::load) to populate the configured process.
pub trait ProgramLoader {
    /// Returns the program's declared metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the executable's metadata is missing or
    /// malformed.
    fn metadata(&self) -> Result<ProgramMetadata>;

    /// Maps the program's code into `process`.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be prepared or mapped.
    fn load(&mut self, kernel: &KernelCore, process: &Arc<Process>) -> Result<LoadParameters>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_set_segment_accessors() {
        let mut code_set = CodeSet::new(Arc::new(vec![0u8; 0x3000]));
        *code_set.code_mut() = Segment {
            addr: 0,
            offset: 0,
            size: 0x1000,
        };
        *code_set.rodata_mut() = Segment {
            addr: 0x1000,
            offset: 0x1000,
            size: 0x1000,
        };
        *code_set.data_mut() = Segment {
            addr: 0x2000,
            offset: 0x2000,
            size: 0x1000,
        };

        assert_eq!(code_set.code().size, 0x1000);
        assert_eq!(code_set.rodata().addr, 0x1000);
        assert_eq!(code_set.data().offset, 0x2000);
        assert_eq!(code_set.memory().len(), 0x3000);
    }

    #[test]
    fn test_metadata_builder() {
        let metadata = ProgramMetadata::new()
            .with_title_id(0x0100_0000_0000_1000)
            .with_main_thread_core(2)
            .with_64bit(true)
            .with_main_thread_priority(44)
            .with_main_thread_stack_size(0x20000);

        assert_eq!(metadata.title_id(), 0x0100_0000_0000_1000);
        assert_eq!(metadata.main_thread_core(), 2);
        assert!(metadata.is_64bit());
        assert_eq!(metadata.main_thread_priority(), 44);
        assert_eq!(metadata.main_thread_stack_size(), 0x20000);
        assert_eq!(metadata.address_space_type(), AddressSpaceType::Is39Bit);
    }
}
