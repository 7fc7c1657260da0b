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

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]

//! # nxkernel
//!
//! A high-level emulation core for the guest OS kernel of a handheld console.
//! `nxkernel` reproduces the process, thread, virtual-memory, and
//! synchronization object model of the guest kernel closely enough that
//! unmodified guest binaries execute correctly under translation, while real
//! host concurrency (one execution thread per emulated CPU core) runs
//! underneath.
//!
//! ## Features
//!
//! - **Process model** - Full lifecycle (Created → Running → Exiting →
//!   Exited) with capability sets, handle tables, and shared resource limits
//! - **Per-process address spaces** - Non-overlapping region mapping with
//!   semantic state tags and permission reprotection
//! - **Thread-local storage** - Deterministic first-fit TLS slot allocation
//!   backed by on-demand page mapping
//! - **Wait objects** - Signal/broadcast-wake synchronization shared across
//!   all core threads, safe under concurrent access
//! - **Scheduling contract** - Per-core scheduler slots and a global thread
//!   registry supporting cross-core termination sweeps
//!
//! ## Quick Start
//!
//! ```rust
//! use nxkernel::prelude::*;
//!
//! let kernel = KernelCore::new(KernelConfig::default());
//! let process = Process::create(&kernel, "application");
//! let main_thread = process.run(&kernel, 44, 0x10000)?;
//!
//! assert_eq!(process.status(), ProcessStatus::Running);
//! assert_eq!(main_thread.status(), ThreadStatus::Ready);
//! # Ok::<(), nxkernel::Error>(())
//! ```
//!
//! ## Architecture
//!
//! `nxkernel` is organized into several key modules:
//!
//! - [`prelude`] - Convenient re-exports of commonly used types and traits
//! - [`memory`] - Address-space management and TLS slot allocation
//! - [`kernel`] - Kernel objects: processes, threads, handles, capabilities,
//!   resource limits, wait objects, and the scheduling contract
//! - [`loader`] - Interfaces consumed from the program loader (code images,
//!   program metadata)
//! - [`system`] - The session facade that sequences load, execution, and
//!   teardown
//! - [`Error`] and [`Result`] - Comprehensive error handling
//!
//! ## Concurrency Model
//!
//! Kernel objects are shared between all emulated core threads via
//! [`std::sync::Arc`] and protected by per-object critical sections. Wait
//! object signaling always wakes *all* blocked waiters; the check-then-block
//! and flag-flip-then-wake paths run under one lock per object so a dormant
//! thread can never miss its wakeup.
//!
//! Guest-visible failures are reported as [`Error`] results. Violations of
//! host-internal invariants - acquiring an unavailable wait object,
//! terminating a process whose sibling threads are not quiesced, freeing a
//! TLS address outside any allocated page - are fatal assertions by design:
//! correctness of the emulated kernel depends on these invariants holding
//! unconditionally.
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`](Result) with detailed error
//! information:
//!
//! ```rust
//! use nxkernel::prelude::*;
//!
//! let kernel = KernelCore::new(KernelConfig::default());
//! let process = Process::create(&kernel, "application");
//!
//! // A freshly created process has never been signaled.
//! match process.clear_signal_state() {
//!     Err(Error::InvalidState) => {}
//!     other => panic!("expected InvalidState, got {:?}", other),
//! }
//! ```

pub(crate) mod error;

/// Convenient re-exports of the most commonly used types and traits.
///
/// This module provides a curated selection of the most frequently used
/// types from across the library, allowing for convenient glob imports.
///
/// # Example
///
/// ```rust
/// use nxkernel::prelude::*;
///
/// let kernel = KernelCore::new(KernelConfig::default());
/// let process = Process::create(&kernel, "application");
/// assert_eq!(process.status(), ProcessStatus::Created);
/// ```
pub mod prelude;

/// Address-space management and thread-local-storage allocation.
///
/// This module owns the layout and permission state of one process's
/// virtual memory:
///
/// - [`memory::AddressSpace`] - Region mapping with overlap rejection,
///   semantic state tags, and permission reprotection
/// - [`memory::TlsAllocator`] - Deterministic first-fit allocation of
///   fixed-size thread-local slots inside the TLS/IO region
/// - [`memory::PAGE_SIZE`] and [`memory::TLS_ENTRY_SIZE`] constants
pub mod memory;

/// Kernel objects and the scheduling contract.
///
/// The emulated kernel's object model:
///
/// - [`kernel::Process`] - Owns an address space, handle table, capability
///   set, and resource limit; signaled on every status transition
/// - [`kernel::Thread`] - One schedulable execution context
/// - [`kernel::WaitObject`] - The synchronization capability every blocking
///   kernel object builds on
/// - [`kernel::KernelCore`] - The per-session orchestrator that allocates
///   process ids and owns the system-wide resource limit
/// - [`kernel::GlobalScheduler`] - Flat registry of all live threads across
///   cores, with per-core scheduler slots
pub mod kernel;

/// Interfaces consumed from the program loader.
///
/// The loader is an external collaborator; this module defines only the
/// types that cross the boundary:
///
/// - [`loader::CodeSet`] - A prepared code image with code/rodata/data
///   segments
/// - [`loader::ProgramMetadata`] - Title id, ideal core, bitness,
///   address-space type, and raw kernel capability descriptors
/// - [`loader::ProgramLoader`] - The trait the [`system::System`] facade
///   drives
pub mod loader;

/// End-to-end session sequencing.
///
/// [`system::System`] initializes the kernel, loads a program image into a
/// process, starts execution, and tears everything down on shutdown. A load
/// failure tears down any partially-initialized state through the same
/// shutdown path used for normal termination.
pub mod system;

/// `nxkernel` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type
/// is always [`Error`]. This is used consistently throughout the crate for
/// all fallible operations.
pub type Result<T> = std::result::Result<T, Error>;

/// `nxkernel` Error type
///
/// The main error type for all guest-visible kernel errors in this crate.
/// See [`error::Error`] for the full list of variants and the distinction
/// between guest-visible errors and fatal host-internal assertions.
pub use error::Error;

pub use kernel::{
    GlobalScheduler, Handle, HandleTable, KernelConfig, KernelCore, Process, ProcessCapabilities,
    ProcessStatus, ResourceLimit, ResourceType, Scheduler, Signal, Thread, ThreadContext,
    ThreadStatus, WaitObject, NUM_CPU_CORES,
};
pub use memory::{
    AddressSpace, AddressSpaceType, MemoryPermission, MemoryRegion, MemoryState, TlsAllocator,
    PAGE_SIZE, TLS_ENTRY_SIZE,
};
pub use system::{System, SystemConfig};
