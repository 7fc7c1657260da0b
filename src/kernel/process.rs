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

//! Guest processes: the unit of ownership for address space, handles,
//! capabilities, and threads.
//!
//! A [`Process`] is created empty ([`ProcessStatus::Created`]), optionally
//! configured from program metadata, populated with code images, and started
//! with [`Process::run`], which maps the main stack and spawns the main
//! thread. Status moves strictly forward through the lifecycle; every
//! transition signals the process and broadcast-wakes anything blocked on it.
//!
//! Threads are owned elsewhere (the global scheduler and guest handles hold
//! the strong references); the process keeps only weak back-references so a
//! dead thread's storage is not pinned by its former owner.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    kernel::{
        Handle, HandleTable, KernelCore, ProcessCapabilities, ResourceLimit, ResourceType, Signal,
        Thread, ThreadStatus, WaitObject,
    },
    loader::CodeSet,
    memory::{align_up, AddressSpace, AddressSpaceType, MemoryPermission, MemoryState, PAGE_SIZE},
    Error, Result,
};

/// Lifecycle state of a guest process.
///
/// Transitions are strictly forward; a process never re-enters an earlier
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
pub enum ProcessStatus {
    /// Created, not yet started.
    Created,
    /// Started and schedulable.
    Running,
    /// Termination in progress.
    Exiting,
    /// Fully terminated.
    Exited,
}

/// Mutable state of a process, guarded by the process's mutex.
struct ProcessState {
    status: ProcessStatus,
    program_id: u64,
    ideal_core: u32,
    is_64bit: bool,
    address_space: AddressSpace,
    tls_slots: crate::memory::TlsAllocator,
    capabilities: ProcessCapabilities,
    thread_list: Vec<Weak<Thread>>,
    main_thread_stack_size: u64,
    code_memory_size: u64,
    build_id: [u8; 32],
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("process_id", &self.process_id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// One guest process.
///
/// Owns an [`AddressSpace`], a [`HandleTable`], a [`ProcessCapabilities`]
/// set, per-process TLS slot bookkeeping, and weak references to its
/// threads. All processes created through [`Process::create`] share the
/// kernel's system-wide [`ResourceLimit`].
///
/// A process is a [`WaitObject`]: it becomes signaled on every status
/// transition and stays signaled until explicitly cleared with
/// [`clear_signal_state`](Process::clear_signal_state).
pub struct Process {
    process_id: u64,
    name: String,
    random_entropy: [u64; 4],
    resource_limit: Arc<ResourceLimit>,
    state: Mutex<ProcessState>,
    handle_table: Mutex<HandleTable>,
    signal: Signal,
}

impl Process {
    /// Creates an empty process and registers it with `kernel`.
    ///
    /// The new process starts in [`ProcessStatus::Created`] with a default
    /// 39-bit address space, the maximal metadataless capability set, the
    /// kernel's system resource limit, and freshly drawn entropy.
    pub fn create(kernel: &KernelCore, name: impl Into<String>) -> Arc<Process> {
        let process_id = kernel.create_new_process_id();

        // Fold the process id into the seed so seeded sessions still give
        // every process distinct entropy.
        let mut rng = match kernel.rng_seed() {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(process_id)),
            None => StdRng::from_entropy(),
        };

        let process = Arc::new(Process {
            process_id,
            name: name.into(),
            random_entropy: std::array::from_fn(|_| rng.gen()),
            resource_limit: Arc::clone(kernel.system_resource_limit()),
            state: Mutex::new(ProcessState {
                status: ProcessStatus::Created,
                program_id: 0,
                ideal_core: 0,
                is_64bit: true,
                address_space: AddressSpace::new(AddressSpaceType::Is39Bit),
                tls_slots: crate::memory::TlsAllocator::new(),
                capabilities: ProcessCapabilities::metadataless(),
                thread_list: Vec::new(),
                main_thread_stack_size: 0,
                code_memory_size: 0,
                build_id: [0; 32],
            }),
            handle_table: Mutex::new(HandleTable::new()),
            signal: Signal::new(),
        });

        kernel.append_new_process(Arc::clone(&process));
        process
    }

    /// Configures this process from loaded program metadata.
    ///
    /// Adopts the program id, ideal core, and bitness, rebuilds the address
    /// space with the declared layout (dropping any existing mappings),
    /// parses the raw capability descriptors against that layout, and sizes
    /// the handle table from the parsed capabilities.
    ///
    /// # Errors
    ///
    /// Returns any capability parsing error; see
    /// [`ProcessCapabilities::from_metadata`]. On error the process is left
    /// with its previous capability set and handle table size.
    pub fn load_from_metadata(&self, metadata: &crate::loader::ProgramMetadata) -> Result<()> {
        let mut state = self.lock();

        state.program_id = metadata.title_id();
        state.ideal_core = metadata.main_thread_core();
        state.is_64bit = metadata.is_64bit();
        state.address_space.reset(metadata.address_space_type());

        let capabilities = ProcessCapabilities::from_metadata(
            metadata.kernel_capabilities(),
            &state.address_space,
        )?;
        let table_size = capabilities.handle_table_size() as usize;
        state.capabilities = capabilities;
        drop(state);

        self.handle_table().set_size(table_size)
    }

    /// Maps a prepared code image into this process's address space.
    ///
    /// The image's three segments land at `base_addr` plus their declared
    /// offsets: code as read-execute, read-only data as read-only, and data
    /// as read-write; empty segments are skipped. The mapped bytes count
    /// against the process's physical memory budget.
    ///
    /// # Errors
    ///
    /// - [`Error::LimitReached`] if the image does not fit the physical
    ///   memory budget
    /// - Any mapping error from the address space (overlap, misalignment,
    ///   out of bounds)
    pub fn load_module(&self, code_set: CodeSet, base_addr: u64) -> Result<()> {
        let image_size = code_set.memory().len() as u64;
        if !self
            .resource_limit
            .reserve(ResourceType::PhysicalMemory, image_size as i64)
        {
            return Err(Error::LimitReached("PhysicalMemory"));
        }

        let mut state = self.lock();
        let result: Result<()> = (|| {
            for (segment, permission, memory_state) in [
                (code_set.code(), MemoryPermission::READ_EXECUTE, MemoryState::Code),
                (code_set.rodata(), MemoryPermission::READ, MemoryState::CodeData),
                (code_set.data(), MemoryPermission::READ_WRITE, MemoryState::CodeData),
            ] {
                if segment.size == 0 {
                    continue;
                }
                let base = base_addr + segment.addr;
                state.address_space.map_memory_block(
                    base,
                    Arc::clone(code_set.memory()),
                    segment.offset,
                    segment.size,
                    memory_state,
                )?;
                state.address_space.reprotect(base, permission)?;
            }
            Ok(())
        })();

        if result.is_err() {
            self.resource_limit
                .release(ResourceType::PhysicalMemory, image_size as i64);
            return result;
        }

        state.code_memory_size += image_size;
        Ok(())
    }

    /// Starts this process: maps the main stack, transitions to Running,
    /// and spawns the main thread.
    ///
    /// The stack is mapped at the top of the TLS/IO region, growing down;
    /// `stack_size` is rounded up to page granularity. The main thread
    /// starts at the base of the code region on the process's ideal core.
    /// Register 1 of the main thread receives a handle to the thread itself,
    /// the convention early guest code relies on to name its own thread.
    /// The returned thread is already Ready.
    ///
    /// # Errors
    ///
    /// - [`Error::LimitReached`] if the stack does not fit the physical
    ///   memory budget or the thread budget is exhausted
    /// - Any stack mapping or thread creation error; the physical memory
    ///   reservation is rolled back if mapping fails
    ///
    /// A failure after the stack is mapped (thread creation, handle
    /// allocation) leaves the process Running with the stack mapped and
    /// accounted. Status never moves backward, so the caller must tear the
    /// process down, as [`System::load`](crate::system::System::load) does.
    pub fn run(
        self: &Arc<Self>,
        kernel: &KernelCore,
        main_thread_priority: u32,
        stack_size: u64,
    ) -> Result<Arc<Thread>> {
        let stack_size = align_up(stack_size, PAGE_SIZE);
        if !self
            .resource_limit
            .reserve(ResourceType::PhysicalMemory, stack_size as i64)
        {
            return Err(Error::LimitReached("PhysicalMemory"));
        }

        let (stack_top, entry_point, ideal_core) = {
            let mut state = self.lock();
            let stack_top = state.address_space.tls_io_region_end();
            let block = Arc::new(vec![0u8; stack_size as usize]);

            if let Err(error) = state.address_space.map_memory_block(
                stack_top - stack_size,
                block,
                0,
                stack_size,
                MemoryState::Stack,
            ) {
                self.resource_limit
                    .release(ResourceType::PhysicalMemory, stack_size as i64);
                return Err(error);
            }

            state.main_thread_stack_size = stack_size;
            state.address_space.log_layout();
            (stack_top, state.address_space.code_region_base(), state.ideal_core)
        };

        self.change_status(ProcessStatus::Running);

        let thread = Thread::create(
            kernel,
            "main",
            entry_point,
            main_thread_priority,
            0,
            ideal_core,
            stack_top,
            self,
        )?;

        let handle = self.register_thread_handle(&thread)?;
        thread.set_register(1, u64::from(handle.raw()));
        thread.resume_from_wait();

        log::info!(
            "process {} ({}) started, main thread {}",
            self.process_id,
            self.name,
            thread.thread_id()
        );
        Ok(thread)
    }

    /// Terminates this process.
    ///
    /// Transitions to Exiting, stops every sibling thread owned by this
    /// process except the one currently running on the calling core, then
    /// transitions to Exited. Both transitions signal the process.
    ///
    /// # Panics
    ///
    /// Panics if any sibling thread to be stopped is not blocked in
    /// synchronization. Terminating a process whose threads are still
    /// runnable is not supported, and continuing would corrupt scheduler
    /// state.
    pub fn prepare_for_termination(&self, kernel: &KernelCore) {
        self.change_status(ProcessStatus::Exiting);

        let current_thread = kernel
            .global_scheduler()
            .current_scheduler()
            .and_then(|scheduler| scheduler.current_thread());

        for thread in kernel.global_scheduler().thread_list() {
            let owned = thread
                .owner()
                .is_some_and(|owner| owner.process_id == self.process_id);
            if !owned {
                continue;
            }
            if let Some(current) = &current_thread {
                if Arc::ptr_eq(current, &thread) {
                    continue;
                }
            }

            // A process cannot be terminated while its threads are runnable.
            assert_eq!(
                thread.status(),
                ThreadStatus::WaitSynch,
                "Exiting processes with non-waiting threads is currently unimplemented"
            );
            thread.stop(kernel);
        }

        self.change_status(ProcessStatus::Exited);
    }

    /// Clears this process's signaled state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the process has already exited or
    /// was never signaled since the last clear.
    pub fn clear_signal_state(&self) -> Result<()> {
        let state = self.lock();
        if state.status == ProcessStatus::Exited {
            log::error!("process {} is exited", self.process_id);
            return Err(Error::InvalidState);
        }
        if !self.signal.is_signaled() {
            log::error!("process {} was not signaled", self.process_id);
            return Err(Error::InvalidState);
        }
        self.signal.clear();
        Ok(())
    }

    /// Returns this process's unique id.
    #[must_use]
    pub fn process_id(&self) -> u64 {
        self.process_id
    }

    /// Returns this process's diagnostic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the title id of the loaded program, or 0 before metadata load.
    #[must_use]
    pub fn program_id(&self) -> u64 {
        self.lock().program_id
    }

    /// Returns this process's lifecycle status.
    #[must_use]
    pub fn status(&self) -> ProcessStatus {
        self.lock().status
    }

    /// Returns the core the main thread starts on.
    #[must_use]
    pub fn ideal_core(&self) -> u32 {
        self.lock().ideal_core
    }

    /// Returns `true` if the loaded program is 64-bit.
    #[must_use]
    pub fn is_64bit(&self) -> bool {
        self.lock().is_64bit
    }

    /// Returns the address-space layout this process was configured with.
    #[must_use]
    pub fn address_space_type(&self) -> AddressSpaceType {
        self.lock().address_space.address_space_type()
    }

    /// Returns the per-process entropy drawn at creation.
    ///
    /// The guest reads these words through its info queries; they stay
    /// constant for the process's lifetime.
    #[must_use]
    pub fn random_entropy(&self) -> [u64; 4] {
        self.random_entropy
    }

    /// Returns a copy of this process's capability set.
    #[must_use]
    pub fn capabilities(&self) -> ProcessCapabilities {
        self.lock().capabilities.clone()
    }

    /// Returns the build id recorded for the loaded module.
    #[must_use]
    pub fn build_id(&self) -> [u8; 32] {
        self.lock().build_id
    }

    /// Records the build id of the loaded module.
    pub fn set_build_id(&self, build_id: [u8; 32]) {
        self.lock().build_id = build_id;
    }

    /// Returns the resource limit this process draws from.
    #[must_use]
    pub fn resource_limit(&self) -> &Arc<ResourceLimit> {
        &self.resource_limit
    }

    /// Locks and returns this process's handle table.
    pub fn handle_table(&self) -> MutexGuard<'_, HandleTable> {
        self.handle_table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the physical memory this process currently accounts for:
    /// heap plus main stack plus loaded code.
    #[must_use]
    pub fn total_physical_memory_used(&self) -> u64 {
        let state = self.lock();
        state.address_space.current_heap_size()
            + state.main_thread_stack_size
            + state.code_memory_size
    }

    /// Returns the physical memory still available to this process under
    /// its resource limit.
    #[must_use]
    pub fn total_physical_memory_available(&self) -> u64 {
        let limit = self.resource_limit.limit_for(ResourceType::PhysicalMemory) as u64;
        limit.saturating_sub(self.total_physical_memory_used())
    }

    /// Returns strong references to this process's live threads.
    #[must_use]
    pub fn thread_list(&self) -> Vec<Arc<Thread>> {
        self.lock()
            .thread_list
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Records a back-reference to a newly created thread.
    pub(crate) fn register_thread(&self, thread: &Arc<Thread>) {
        self.lock().thread_list.push(Arc::downgrade(thread));
    }

    /// Drops the back-reference to a stopped thread.
    pub(crate) fn unregister_thread(&self, thread: &Thread) {
        self.lock().thread_list.retain(|entry| {
            entry
                .upgrade()
                .is_some_and(|live| live.thread_id() != thread.thread_id())
        });
    }

    /// Acquires a TLS slot in this process's address space.
    ///
    /// # Errors
    ///
    /// Returns an error if a newly required TLS page cannot be mapped.
    pub(crate) fn mark_next_available_tls_slot(&self) -> Result<u64> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.tls_slots.allocate(&mut state.address_space)
    }

    /// Returns a TLS slot to this process's allocator.
    pub(crate) fn free_tls_slot(&self, address: u64) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.tls_slots.free(address, &state.address_space);
    }

    /// Stores a handle to `thread` in this process's handle table.
    fn register_thread_handle(&self, thread: &Arc<Thread>) -> Result<Handle> {
        let object: Arc<dyn WaitObject> = Arc::clone(thread) as Arc<dyn WaitObject>;
        self.handle_table().create(object)
    }

    /// Moves the lifecycle status forward and signals the transition.
    ///
    /// A no-op when the status is unchanged. Every actual transition sets
    /// the signaled flag and broadcast-wakes waiters, even if the flag was
    /// already set.
    fn change_status(&self, new_status: ProcessStatus) {
        {
            let mut state = self.lock();
            if state.status == new_status {
                return;
            }
            assert!(
                state.status < new_status,
                "process status may only move forward"
            );
            state.status = new_status;
        }

        log::debug!("process {} is now {new_status}", self.process_id);
        self.signal.signal_and_wake_all();
    }

    fn lock(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WaitObject for Process {
    fn signal(&self) -> &Signal {
        &self.signal
    }

    /// A process can be waited on until its next status transition.
    fn should_wait(&self, _thread: &Thread) -> bool {
        !self.signal.is_signaled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelConfig;

    fn kernel() -> KernelCore {
        KernelCore::new(KernelConfig::default())
    }

    #[test]
    fn test_create_starts_empty() {
        let kernel = kernel();
        let process = Process::create(&kernel, "app");

        assert_eq!(process.status(), ProcessStatus::Created);
        assert!(process.thread_list().is_empty());
        assert!(!process.signal().is_signaled());
        assert_eq!(process.total_physical_memory_used(), 0);
    }

    #[test]
    fn test_entropy_is_deterministic_under_a_seed() {
        let seeded = KernelCore::new(KernelConfig {
            rng_seed: Some(42),
        });
        let a = Process::create(&seeded, "a");

        let seeded_again = KernelCore::new(KernelConfig {
            rng_seed: Some(42),
        });
        let b = Process::create(&seeded_again, "b");

        assert_eq!(a.random_entropy(), b.random_entropy());
    }

    #[test]
    fn test_run_spawns_main_thread_with_self_handle() {
        let kernel = kernel();
        let process = Process::create(&kernel, "app");

        let main_thread = process.run(&kernel, 44, 0x10000).unwrap();

        assert_eq!(process.status(), ProcessStatus::Running);
        assert_eq!(main_thread.status(), ThreadStatus::Ready);
        assert_eq!(main_thread.name(), "main");
        assert_eq!(main_thread.ideal_core(), process.ideal_core());

        // Register 1 holds a live handle to the thread itself.
        let raw = main_thread.context().cpu_registers[1];
        assert_ne!(raw, 0);
        assert_eq!(process.handle_table().open_handles(), 1);
    }

    #[test]
    fn test_run_accounts_for_the_stack() {
        let kernel = kernel();
        let process = Process::create(&kernel, "app");

        // Unaligned request rounds up to page granularity.
        process.run(&kernel, 44, PAGE_SIZE + 1).unwrap();
        assert_eq!(process.total_physical_memory_used(), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_run_failure_after_stack_mapping_leaves_process_running() {
        let kernel = kernel();
        let process = Process::create(&kernel, "app");

        // Thread creation fails after the stack has been mapped.
        let error = process.run(&kernel, 64, 0x10000).unwrap_err();
        assert!(matches!(error, Error::InvalidPriority(64)));

        // Status never moves backward: the process stays Running with the
        // stack mapped and accounted, and no thread was created. Callers
        // recover by tearing the process down.
        assert_eq!(process.status(), ProcessStatus::Running);
        assert_eq!(process.total_physical_memory_used(), 0x10000);
        assert!(process.thread_list().is_empty());
        assert_eq!(process.handle_table().open_handles(), 0);
    }

    #[test]
    fn test_status_transitions_signal_the_process() {
        let kernel = kernel();
        let process = Process::create(&kernel, "app");

        process.run(&kernel, 44, 0x10000).unwrap();
        assert!(process.signal().is_signaled());

        process.clear_signal_state().unwrap();
        assert!(!process.signal().is_signaled());
    }

    #[test]
    fn test_clear_signal_state_rejects_unsignaled_and_exited() {
        let kernel = kernel();
        let process = Process::create(&kernel, "app");

        // Never signaled.
        assert!(matches!(
            process.clear_signal_state(),
            Err(Error::InvalidState)
        ));

        process.run(&kernel, 44, 0x10000).unwrap();
        process.prepare_for_termination(&kernel);

        // Exited processes cannot have their signal cleared.
        assert_eq!(process.status(), ProcessStatus::Exited);
        assert!(matches!(
            process.clear_signal_state(),
            Err(Error::InvalidState)
        ));
    }

    #[test]
    fn test_termination_stops_waiting_siblings() {
        let kernel = kernel();
        let process = Process::create(&kernel, "app");
        let main_thread = process.run(&kernel, 44, 0x10000).unwrap();
        let sibling =
            Thread::create(&kernel, "worker", 0, 44, 0, 1, 0x2000, &process).unwrap();

        // Both threads block on an unrelated object before termination
        // begins, so the Exiting transition does not wake them early.
        let other = Process::create(&kernel, "other");
        let object: Arc<dyn WaitObject> = Arc::clone(&other) as Arc<dyn WaitObject>;
        assert!(main_thread.wait_on(&object));
        assert!(sibling.wait_on(&object));

        // Register the calling host thread as a core whose current thread
        // is the main thread; the sweep must spare it.
        kernel.global_scheduler().register_core_thread(0);
        kernel
            .global_scheduler()
            .scheduler(0)
            .set_current_thread(Some(Arc::clone(&main_thread)));

        process.prepare_for_termination(&kernel);
        kernel.global_scheduler().unregister_core_thread();

        assert_eq!(process.status(), ProcessStatus::Exited);
        assert_eq!(sibling.status(), ThreadStatus::Dead);
        assert_ne!(main_thread.status(), ThreadStatus::Dead);
    }

    #[test]
    #[should_panic(expected = "non-waiting threads")]
    fn test_termination_with_runnable_sibling_is_fatal() {
        let kernel = kernel();
        let process = Process::create(&kernel, "app");
        process.run(&kernel, 44, 0x10000).unwrap();

        // The main thread is Ready, not waiting, and no core claims it.
        process.prepare_for_termination(&kernel);
    }
}
