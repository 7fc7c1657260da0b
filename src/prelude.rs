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

pub use crate::{
    kernel::{
        GlobalScheduler, Handle, HandleTable, KernelConfig, KernelCore, Process,
        ProcessCapabilities, ProcessStatus, ResourceLimit, ResourceType, Scheduler, Signal,
        Thread, ThreadContext, ThreadStatus, WaitObject, NUM_CPU_CORES,
    },
    loader::{CodeSet, LoadParameters, ProgramLoader, ProgramMetadata, Segment},
    memory::{
        AddressSpace, AddressSpaceType, MemoryBlock, MemoryPermission, MemoryRegion, MemoryState,
        TlsAllocator, PAGE_SIZE, TLS_ENTRY_SIZE,
    },
    system::{System, SystemConfig},
    Error, Result,
};
