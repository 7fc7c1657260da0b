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

//! Integration tests for the process lifecycle.
//!
//! These exercise the full path a real session takes: process creation,
//! metadata configuration, code mapping, startup, signaling, and
//! termination, using the public API only.

use std::sync::Arc;

use nxkernel::{loader::*, prelude::*};

/// Loader producing one page of code and conventional metadata.
struct PageLoader {
    metadata: ProgramMetadata,
}

impl PageLoader {
    fn new() -> Self {
        PageLoader {
            metadata: ProgramMetadata::new()
                .with_title_id(0x0100_0000_0000_1000)
                .with_main_thread_priority(44)
                .with_main_thread_stack_size(0x10000),
        }
    }
}

impl ProgramLoader for PageLoader {
    fn metadata(&self) -> Result<ProgramMetadata> {
        Ok(self.metadata.clone())
    }

    fn load(&mut self, _kernel: &KernelCore, process: &Arc<Process>) -> Result<LoadParameters> {
        let mut code_set = CodeSet::new(Arc::new(vec![0u8; PAGE_SIZE as usize]));
        code_set.code_mut().size = PAGE_SIZE;
        process.load_module(code_set, 0x0800_0000)?;

        Ok(LoadParameters {
            main_thread_priority: self.metadata.main_thread_priority(),
            main_thread_stack_size: self.metadata.main_thread_stack_size(),
        })
    }
}

/// A freshly created process started without any loaded program still runs:
/// it gets exactly one thread whose register 1 holds a handle to itself.
#[test]
fn test_metadataless_process_startup() -> Result<()> {
    let kernel = KernelCore::new(KernelConfig::default());
    let process = Process::create(&kernel, "bare");
    assert_eq!(process.status(), ProcessStatus::Created);

    let main_thread = process.run(&kernel, 44, 0x10000)?;

    assert_eq!(process.status(), ProcessStatus::Running);
    assert_eq!(process.thread_list().len(), 1);
    assert_eq!(main_thread.status(), ThreadStatus::Ready);
    assert_ne!(main_thread.context().cpu_registers[1], 0);
    assert_eq!(process.handle_table().open_handles(), 1);
    Ok(())
}

/// Metadata declaring a 64-bit program on core 2 is reflected in the
/// process's address space type and the main thread's placement.
#[test]
fn test_metadata_configures_the_process() -> Result<()> {
    let kernel = KernelCore::new(KernelConfig::default());
    let process = Process::create(&kernel, "app");

    let metadata = ProgramMetadata::new()
        .with_title_id(0xBEEF)
        .with_64bit(true)
        .with_main_thread_core(2)
        .with_address_space_type(AddressSpaceType::Is39Bit);
    process.load_from_metadata(&metadata)?;

    assert_eq!(process.program_id(), 0xBEEF);
    assert!(process.is_64bit());
    assert_eq!(process.ideal_core(), 2);
    assert_eq!(process.address_space_type(), AddressSpaceType::Is39Bit);

    let main_thread = process.run(&kernel, 44, 0x10000)?;
    assert_eq!(main_thread.ideal_core(), 2);
    assert_eq!(main_thread.affinity_mask(), 1 << 2);
    Ok(())
}

/// The system facade sequences metadata, code load, and startup, and makes
/// the loaded process current.
#[test]
fn test_system_load_sequences_a_full_session() -> Result<()> {
    let system = System::new(SystemConfig::default());
    let process = system.load("app", &mut PageLoader::new())?;

    assert_eq!(process.status(), ProcessStatus::Running);
    assert_eq!(process.program_id(), 0x0100_0000_0000_1000);
    // One page of code plus the page-aligned stack.
    assert_eq!(process.total_physical_memory_used(), PAGE_SIZE + 0x10000);

    let current = system.kernel().current_process().unwrap();
    assert!(Arc::ptr_eq(&current, &process));

    system.shutdown();
    assert!(system.kernel().process_list().is_empty());
    Ok(())
}

/// Every status transition signals the process; clearing the signal fails
/// when nothing was signaled and after the process has exited.
#[test]
fn test_signal_state_over_the_lifecycle() -> Result<()> {
    let kernel = KernelCore::new(KernelConfig::default());
    let process = Process::create(&kernel, "app");

    // Never signaled yet.
    assert!(matches!(
        process.clear_signal_state(),
        Err(Error::InvalidState)
    ));

    process.run(&kernel, 44, 0x10000)?;
    assert!(process.signal().is_signaled());
    process.clear_signal_state()?;
    assert!(!process.signal().is_signaled());

    // The stack is already mapped, so a second run fails without touching
    // the signal.
    let error = process.run(&kernel, 44, 0x10000).unwrap_err();
    assert!(matches!(error, Error::OverlappingRegion { .. }));
    assert!(!process.signal().is_signaled());

    Ok(())
}

/// Termination stops waiting sibling threads, spares the thread driving the
/// termination, and leaves the process Exited and signaled.
#[test]
fn test_termination_sweep() -> Result<()> {
    let kernel = KernelCore::new(KernelConfig::default());
    let process = Process::create(&kernel, "app");
    let main_thread = process.run(&kernel, 44, 0x10000)?;
    let worker = Thread::create(&kernel, "worker", 0, 44, 0, 1, 0x2000, &process)?;

    // The worker blocks on another process; the main thread keeps running
    // on core 0 and drives the termination.
    let other = Process::create(&kernel, "other");
    let target: Arc<dyn WaitObject> = other as Arc<dyn WaitObject>;
    assert!(worker.wait_on(&target));

    kernel.global_scheduler().register_core_thread(0);
    kernel
        .global_scheduler()
        .scheduler(0)
        .set_current_thread(Some(Arc::clone(&main_thread)));

    process.prepare_for_termination(&kernel);
    kernel.global_scheduler().unregister_core_thread();

    assert_eq!(process.status(), ProcessStatus::Exited);
    assert!(process.signal().is_signaled());
    assert_eq!(worker.status(), ThreadStatus::Dead);
    assert_ne!(main_thread.status(), ThreadStatus::Dead);
    assert!(matches!(
        process.clear_signal_state(),
        Err(Error::InvalidState)
    ));
    Ok(())
}

/// Stack sizes are rounded up to page granularity before mapping and
/// accounting.
#[test]
fn test_stack_size_alignment() -> Result<()> {
    let kernel = KernelCore::new(KernelConfig::default());

    let tiny = Process::create(&kernel, "tiny");
    tiny.run(&kernel, 44, 1)?;
    assert_eq!(tiny.total_physical_memory_used(), PAGE_SIZE);

    let exact = Process::create(&kernel, "exact");
    exact.run(&kernel, 44, PAGE_SIZE)?;
    assert_eq!(exact.total_physical_memory_used(), PAGE_SIZE);

    let spill = Process::create(&kernel, "spill");
    spill.run(&kernel, 44, PAGE_SIZE + 1)?;
    assert_eq!(spill.total_physical_memory_used(), 2 * PAGE_SIZE);
    Ok(())
}

/// A fixed entropy seed makes process entropy reproducible; distinct
/// processes in one session still draw distinct values.
#[test]
fn test_entropy_determinism() {
    let run = || {
        let kernel = KernelCore::new(KernelConfig { rng_seed: Some(7) });
        let a = Process::create(&kernel, "a").random_entropy();
        let b = Process::create(&kernel, "b").random_entropy();
        (a, b)
    };

    let (a1, b1) = run();
    let (a2, b2) = run();
    assert_eq!(a1, a2);
    assert_eq!(b1, b2);
    assert_ne!(a1, b1);
}
