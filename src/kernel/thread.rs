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

//! Guest threads: one schedulable execution context each.
//!
//! A [`Thread`] belongs to exactly one [`Process`] for its whole lifetime
//! (the owner never changes), is registered in that process's thread list,
//! and is tracked by the [`GlobalScheduler`](crate::kernel::GlobalScheduler)'s
//! flat thread list. Threads are shared ([`Arc`]) between the owning
//! process, the scheduler, and guest-visible handles; a thread is destroyed
//! only when the last holder drops it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::{
    kernel::{KernelCore, Process, ResourceType, Signal, WaitObject, NUM_CPU_CORES},
    Error, Result,
};

/// Highest (most urgent) guest thread priority.
pub const THREAD_PRIORITY_HIGHEST: u32 = 0;

/// Lowest (least urgent) guest thread priority.
pub const THREAD_PRIORITY_LOWEST: u32 = 63;

/// Execution state of a guest thread.
///
/// The run/wait/dormant states are owned by the scheduler; this layer only
/// distinguishes the states its own contracts depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ThreadStatus {
    /// Created but never made runnable.
    Dormant,
    /// Runnable, waiting for a core.
    Ready,
    /// Currently executing on a core.
    Running,
    /// Suspended by an external activity request.
    Paused,
    /// Blocked on one or more wait objects.
    WaitSynch,
    /// Sleeping for a fixed duration.
    WaitSleep,
    /// Stopped; will never run again.
    Dead,
}

impl ThreadStatus {
    /// Returns `true` if this is a scheduler-recognized wait state.
    #[must_use]
    pub fn is_waiting(self) -> bool {
        matches!(self, ThreadStatus::WaitSynch | ThreadStatus::WaitSleep)
    }
}

/// Saved register state of a guest thread.
///
/// Reset when the thread is created and handed to the CPU core when the
/// thread is scheduled in. Register 1 of the main thread holds a handle to
/// the thread itself, a guest-kernel convention that lets early guest code
/// refer to its own thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadContext {
    /// General-purpose registers x0..x30.
    pub cpu_registers: [u64; 31],
    /// Stack pointer.
    pub sp: u64,
    /// Program counter.
    pub pc: u64,
    /// Processor state flags.
    pub pstate: u32,
    /// Floating-point control register.
    pub fpcr: u32,
}

impl Default for ThreadContext {
    fn default() -> Self {
        ThreadContext {
            cpu_registers: [0; 31],
            sp: 0,
            pc: 0,
            pstate: 0,
            // AHP = 0, DN = 1, FTZ = 1, RMode = round towards zero.
            fpcr: 0x03C0_0000,
        }
    }
}

impl ThreadContext {
    /// Resets a context so it is ready to be scheduled and run.
    ///
    /// # Arguments
    ///
    /// * `stack_top` - Address of the top of the thread's stack
    /// * `entry_point` - Address execution starts at
    /// * `arg` - User argument, placed in register 0
    fn reset(stack_top: u64, entry_point: u64, arg: u64) -> Self {
        let mut context = ThreadContext::default();
        context.cpu_registers[0] = arg;
        context.pc = entry_point;
        context.sp = stack_top;
        context
    }
}

/// Mutable state of a thread, guarded by the thread's mutex.
struct ThreadState {
    status: ThreadStatus,
    context: ThreadContext,
    nominal_priority: u32,
    current_priority: u32,
    processor_id: u32,
    ideal_core: u32,
    affinity_mask: u64,
    tls_address: Option<u64>,
    wait_objects: Vec<Arc<dyn WaitObject>>,
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("thread_id", &self.thread_id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// One schedulable guest execution context.
///
/// Created through [`Thread::create`], which validates priority and core
/// id, acquires a TLS slot from the owning process, registers the thread
/// with the process and the global scheduler, and resets its register
/// context. New threads start [`Dormant`](ThreadStatus::Dormant) and must
/// be made runnable with [`resume_from_wait`](Thread::resume_from_wait).
///
/// A thread is itself a [`WaitObject`]: it is signaled when it dies, so
/// joiners blocked on it are broadcast-woken by [`stop`](Thread::stop).
pub struct Thread {
    thread_id: u64,
    name: String,
    entry_point: u64,
    stack_top: u64,
    owner: Weak<Process>,
    state: Mutex<ThreadState>,
    signal: Signal,
}

impl Thread {
    /// Creates a new thread owned by `owner` and registers it everywhere it
    /// must be tracked.
    ///
    /// The thread starts dormant with its context reset to enter
    /// `entry_point` with `arg` in register 0 and the stack pointer at
    /// `stack_top`. A TLS slot is acquired from the owner and one slot of
    /// the owner's thread resource budget is reserved.
    ///
    /// # Arguments
    ///
    /// * `kernel` - The orchestrator allocating the thread id
    /// * `name` - Diagnostic name
    /// * `entry_point` - Guest address execution starts at
    /// * `priority` - Scheduling priority, 0 (highest) to 63 (lowest)
    /// * `arg` - User argument placed in register 0
    /// * `processor_id` - The core the thread starts on (also its ideal core)
    /// * `stack_top` - Top of the thread's stack
    /// * `owner` - The owning process
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPriority`] if `priority` exceeds the lowest priority
    /// - [`Error::InvalidCoreId`] if `processor_id` is not an emulated core
    /// - [`Error::LimitReached`] if the owner's thread budget is exhausted
    /// - Any error from TLS slot allocation
    pub fn create(
        kernel: &KernelCore,
        name: impl Into<String>,
        entry_point: u64,
        priority: u32,
        arg: u64,
        processor_id: u32,
        stack_top: u64,
        owner: &Arc<Process>,
    ) -> Result<Arc<Thread>> {
        // Lowest priority has the highest numeric id.
        if priority > THREAD_PRIORITY_LOWEST {
            log::error!("invalid thread priority: {priority}");
            return Err(Error::InvalidPriority(priority));
        }
        if processor_id >= NUM_CPU_CORES {
            log::error!("invalid processor id: {processor_id}");
            return Err(Error::InvalidCoreId(processor_id));
        }
        if !owner.resource_limit().reserve(ResourceType::Threads, 1) {
            return Err(Error::LimitReached("Threads"));
        }

        let tls_address = owner.mark_next_available_tls_slot()?;

        let thread = Arc::new(Thread {
            thread_id: kernel.create_new_thread_id(),
            name: name.into(),
            entry_point,
            stack_top,
            owner: Arc::downgrade(owner),
            state: Mutex::new(ThreadState {
                status: ThreadStatus::Dormant,
                context: ThreadContext::reset(stack_top, entry_point, arg),
                nominal_priority: priority,
                current_priority: priority,
                processor_id,
                ideal_core: processor_id,
                affinity_mask: 1 << processor_id,
                tls_address: Some(tls_address),
                wait_objects: Vec::new(),
            }),
            signal: Signal::new(),
        });

        kernel.global_scheduler().add_thread(Arc::clone(&thread));
        owner.register_thread(&thread);

        Ok(thread)
    }

    /// Returns this thread's unique id.
    #[must_use]
    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// Returns this thread's diagnostic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the guest address this thread entered execution at.
    #[must_use]
    pub fn entry_point(&self) -> u64 {
        self.entry_point
    }

    /// Returns the top of this thread's stack.
    #[must_use]
    pub fn stack_top(&self) -> u64 {
        self.stack_top
    }

    /// Returns the owning process, if it is still alive.
    ///
    /// The owner reference is immutable for the thread's lifetime; `None`
    /// only means the process object itself has already been dropped.
    #[must_use]
    pub fn owner(&self) -> Option<Arc<Process>> {
        self.owner.upgrade()
    }

    /// Returns this thread's current execution status.
    #[must_use]
    pub fn status(&self) -> ThreadStatus {
        self.lock().status
    }

    /// Sets this thread's execution status.
    ///
    /// Scheduling-state bookkeeping is owned by the per-core scheduler;
    /// this layer only records the transition.
    pub fn set_status(&self, status: ThreadStatus) {
        self.lock().status = status;
    }

    /// Returns a copy of this thread's saved register context.
    #[must_use]
    pub fn context(&self) -> ThreadContext {
        self.lock().context.clone()
    }

    /// Writes a general-purpose register in the saved context.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a valid register index (0..=30).
    pub fn set_register(&self, index: usize, value: u64) {
        self.lock().context.cpu_registers[index] = value;
    }

    /// Returns this thread's current (possibly inherited) priority.
    #[must_use]
    pub fn priority(&self) -> u32 {
        self.lock().current_priority
    }

    /// Returns this thread's nominal (assigned) priority.
    #[must_use]
    pub fn nominal_priority(&self) -> u32 {
        self.lock().nominal_priority
    }

    /// Reassigns this thread's priority.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is outside the valid range; priority values are
    /// validated at the kernel interface before reaching this point.
    pub fn set_priority(&self, priority: u32) {
        assert!(
            priority <= THREAD_PRIORITY_LOWEST,
            "invalid priority value"
        );
        let mut state = self.lock();
        state.nominal_priority = priority;
        state.current_priority = priority;
    }

    /// Returns the core this thread currently runs on.
    #[must_use]
    pub fn processor_id(&self) -> u32 {
        self.lock().processor_id
    }

    /// Returns the core this thread prefers to run on.
    #[must_use]
    pub fn ideal_core(&self) -> u32 {
        self.lock().ideal_core
    }

    /// Returns the bitmask of cores this thread may run on.
    #[must_use]
    pub fn affinity_mask(&self) -> u64 {
        self.lock().affinity_mask
    }

    /// Returns the address of this thread's TLS slot, or `None` once the
    /// slot has been released.
    #[must_use]
    pub fn tls_address(&self) -> Option<u64> {
        self.lock().tls_address
    }

    /// Blocks this thread on `object`.
    ///
    /// Marks the thread as waiting-for-synchronization and registers it in
    /// the object's waiter list. If the object is already signaled at
    /// registration time no wait is needed: the thread reverts to runnable
    /// and `false` is returned. Otherwise returns `true`; a later signal on
    /// the object is guaranteed to wake the thread.
    pub fn wait_on(self: &Arc<Self>, object: &Arc<dyn WaitObject>) -> bool {
        {
            let mut state = self.lock();
            state.status = ThreadStatus::WaitSynch;
            state.wait_objects.push(Arc::clone(object));
        }

        if object.signal().add_waiter_if_unsignaled(Arc::clone(self)) {
            return true;
        }

        // Already signaled; undo the wait before anyone observes it.
        self.wake_from_wait_object();
        false
    }

    /// Wakes this thread after a wait object it was blocked on signaled.
    ///
    /// Drops all wait-object back-references (removing the thread from the
    /// waiter lists of objects that did not signal) and makes the thread
    /// runnable again.
    pub(crate) fn wake_from_wait_object(&self) {
        let objects = std::mem::take(&mut self.lock().wait_objects);
        for object in objects {
            object.remove_waiting_thread(self);
        }
        self.resume_from_wait();
    }

    /// Makes a dormant or waiting thread runnable.
    ///
    /// A thread waiting on multiple objects might be awoken more than once
    /// before actually resuming; subsequent wakeups of an already-Ready
    /// thread are ignored. Resuming a Running or Dead thread indicates a
    /// bug in the surrounding scheduler contract.
    pub fn resume_from_wait(&self) {
        let mut state = self.lock();
        debug_assert!(
            state.wait_objects.is_empty(),
            "thread is waking up while still registered on wait objects"
        );

        match state.status {
            ThreadStatus::Dormant
            | ThreadStatus::Paused
            | ThreadStatus::WaitSynch
            | ThreadStatus::WaitSleep => {}
            ThreadStatus::Ready => return,
            ThreadStatus::Running => {
                debug_assert!(false, "thread {} has already resumed", self.thread_id);
                return;
            }
            ThreadStatus::Dead => {
                debug_assert!(
                    false,
                    "thread {} cannot be resumed because it is dead",
                    self.thread_id
                );
                return;
            }
        }

        state.status = ThreadStatus::Ready;
    }

    /// Stops this thread permanently.
    ///
    /// Marks the thread dead, broadcast-wakes everything blocked on it,
    /// drops any wait-object back-references it still holds, unregisters it
    /// from the owning process, releases its TLS slot and thread budget,
    /// and removes it from the global scheduler's thread list.
    pub fn stop(&self, kernel: &KernelCore) {
        let (objects, tls_address) = {
            let mut state = self.lock();
            state.status = ThreadStatus::Dead;
            (
                std::mem::take(&mut state.wait_objects),
                state.tls_address.take(),
            )
        };

        // Wake any joiners blocked on this thread.
        self.signal.signal_and_wake_all();

        // Clean up dangling references in objects this thread was waiting for.
        for object in objects {
            object.remove_waiting_thread(self);
        }

        if let Some(owner) = self.owner.upgrade() {
            owner.unregister_thread(self);
            if let Some(tls_address) = tls_address {
                owner.free_tls_slot(tls_address);
            }
            owner.resource_limit().release(ResourceType::Threads, 1);
        }

        kernel.global_scheduler().remove_thread(self);
    }

    fn lock(&self) -> MutexGuard<'_, ThreadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WaitObject for Thread {
    fn signal(&self) -> &Signal {
        &self.signal
    }

    /// A thread can be waited on (joined) until it is dead.
    fn should_wait(&self, _thread: &Thread) -> bool {
        self.status() != ThreadStatus::Dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{KernelConfig, Process};

    fn kernel_and_process() -> (KernelCore, Arc<Process>) {
        let kernel = KernelCore::new(KernelConfig::default());
        let process = Process::create(&kernel, "test");
        (kernel, process)
    }

    #[test]
    fn test_create_validates_priority_and_core() {
        let (kernel, process) = kernel_and_process();

        assert!(matches!(
            Thread::create(&kernel, "t", 0, 64, 0, 0, 0x1000, &process),
            Err(Error::InvalidPriority(64))
        ));
        assert!(matches!(
            Thread::create(&kernel, "t", 0, 44, 0, NUM_CPU_CORES, 0x1000, &process),
            Err(Error::InvalidCoreId(_))
        ));
    }

    #[test]
    fn test_create_registers_everywhere() {
        let (kernel, process) = kernel_and_process();
        let thread = Thread::create(&kernel, "worker", 0x1000, 44, 7, 2, 0x2000, &process).unwrap();

        assert_eq!(thread.status(), ThreadStatus::Dormant);
        assert_eq!(thread.context().cpu_registers[0], 7);
        assert_eq!(thread.context().pc, 0x1000);
        assert_eq!(thread.context().sp, 0x2000);
        assert_eq!(thread.ideal_core(), 2);
        assert_eq!(thread.affinity_mask(), 1 << 2);
        assert!(thread.tls_address().is_some());

        assert_eq!(process.thread_list().len(), 1);
        assert_eq!(kernel.global_scheduler().thread_list().len(), 1);
    }

    #[test]
    fn test_resume_is_idempotent_for_ready_threads() {
        let (kernel, process) = kernel_and_process();
        let thread = Thread::create(&kernel, "t", 0, 44, 0, 0, 0x1000, &process).unwrap();

        thread.resume_from_wait();
        assert_eq!(thread.status(), ThreadStatus::Ready);
        thread.resume_from_wait();
        assert_eq!(thread.status(), ThreadStatus::Ready);
    }

    #[test]
    fn test_stop_releases_tls_and_registrations() {
        let (kernel, process) = kernel_and_process();
        let thread = Thread::create(&kernel, "t", 0, 44, 0, 0, 0x1000, &process).unwrap();
        let tls = thread.tls_address().unwrap();

        thread.stop(&kernel);

        assert_eq!(thread.status(), ThreadStatus::Dead);
        assert!(thread.tls_address().is_none());
        assert!(process.thread_list().is_empty());
        assert!(kernel.global_scheduler().thread_list().is_empty());

        // The slot is reusable immediately (first-fit returns it).
        let next = Thread::create(&kernel, "t2", 0, 44, 0, 0, 0x1000, &process).unwrap();
        assert_eq!(next.tls_address().unwrap(), tls);
    }

    #[test]
    fn test_wait_on_already_signaled_object_does_not_block() {
        let (kernel, process) = kernel_and_process();
        let target = Thread::create(&kernel, "target", 0, 44, 0, 0, 0x1000, &process).unwrap();
        let waiter = Thread::create(&kernel, "waiter", 0, 44, 0, 0, 0x1000, &process).unwrap();
        waiter.resume_from_wait();

        target.stop(&kernel);

        let object: Arc<dyn WaitObject> = target.clone();
        assert!(!waiter.wait_on(&object));
        assert_eq!(waiter.status(), ThreadStatus::Ready);
    }

    #[test]
    fn test_join_via_stop_broadcast() {
        let (kernel, process) = kernel_and_process();
        let target = Thread::create(&kernel, "target", 0, 44, 0, 0, 0x1000, &process).unwrap();
        let a = Thread::create(&kernel, "a", 0, 44, 0, 0, 0x1000, &process).unwrap();
        let b = Thread::create(&kernel, "b", 0, 44, 0, 1, 0x1000, &process).unwrap();

        let object: Arc<dyn WaitObject> = target.clone();
        assert!(a.wait_on(&object));
        assert!(b.wait_on(&object));
        assert_eq!(a.status(), ThreadStatus::WaitSynch);
        assert_eq!(target.signal().waiter_count(), 2);

        target.stop(&kernel);

        assert_eq!(a.status(), ThreadStatus::Ready);
        assert_eq!(b.status(), ThreadStatus::Ready);
        assert_eq!(target.signal().waiter_count(), 0);
    }
}
