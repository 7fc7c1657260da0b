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

//! Kernel objects and the scheduling contract.
//!
//! This module implements the guest kernel's object model. The ownership
//! graph is deliberate:
//!
//! - [`KernelCore`] owns the process registry, the system resource limit,
//!   and the [`GlobalScheduler`]
//! - [`Process`] owns its address space, handle table, capability set, and
//!   TLS bookkeeping, and holds *weak* references to its threads
//! - [`Thread`]s are held strongly by the global scheduler and by guest
//!   handles, and point back to their owner weakly
//!
//! Everything a guest can block on implements [`WaitObject`]; signaling is
//! always broadcast.

mod capability;
mod core;
mod handle_table;
mod object;
mod process;
mod resource_limit;
mod scheduler;
mod thread;

pub use capability::{MappableRange, ProcessCapabilities, ProgramType};
pub use self::core::{KernelConfig, KernelCore};
pub use handle_table::{Handle, HandleTable, MAX_HANDLE_TABLE_COUNT};
pub use object::{Signal, WaitObject};
pub use process::{Process, ProcessStatus};
pub use resource_limit::{ResourceLimit, ResourceType};
pub use scheduler::{GlobalScheduler, Scheduler, NUM_CPU_CORES};
pub use thread::{
    Thread, ThreadContext, ThreadStatus, THREAD_PRIORITY_HIGHEST, THREAD_PRIORITY_LOWEST,
};
