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

//! The scheduling contract: per-core current-thread slots and the global
//! thread registry.
//!
//! Actual scheduling policy (run queues, preemption, load balancing) lives
//! in the per-core execution substrate. This layer records which thread each
//! core is currently running and keeps a flat list of every live thread in
//! the system, which process termination sweeps and debugging walk.
//!
//! Host threads register themselves as an emulated core via
//! [`GlobalScheduler::register_core_thread`]; afterwards
//! [`GlobalScheduler::current_scheduler`] resolves to that core's scheduler
//! from anywhere on the same host thread.

use std::{
    cell::Cell,
    sync::{Arc, PoisonError, RwLock},
};

use crate::kernel::{Thread, ThreadStatus};

/// Number of emulated CPU cores.
pub const NUM_CPU_CORES: u32 = 4;

thread_local! {
    /// The emulated core this host thread is registered as, if any.
    static CURRENT_CORE: Cell<Option<u32>> = const { Cell::new(None) };
}

/// The current-thread slot of one emulated core.
#[derive(Debug)]
pub struct Scheduler {
    core_id: u32,
    current_thread: RwLock<Option<Arc<Thread>>>,
}

impl Scheduler {
    fn new(core_id: u32) -> Self {
        Scheduler {
            core_id,
            current_thread: RwLock::new(None),
        }
    }

    /// Returns the id of the core this scheduler belongs to.
    #[must_use]
    pub fn core_id(&self) -> u32 {
        self.core_id
    }

    /// Returns the thread currently running on this core, if any.
    #[must_use]
    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.current_thread
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Installs `thread` as this core's current thread.
    ///
    /// The new thread transitions to Running. The displaced thread, if it
    /// was still Running, becomes Ready; a thread that already moved to a
    /// wait state or died keeps that state.
    pub fn set_current_thread(&self, thread: Option<Arc<Thread>>) {
        if let Some(thread) = &thread {
            thread.set_status(ThreadStatus::Running);
        }

        let previous = {
            let mut slot = self
                .current_thread
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slot, thread)
        };

        if let Some(previous) = previous {
            if previous.status() == ThreadStatus::Running {
                previous.set_status(ThreadStatus::Ready);
            }
        }
    }
}

/// Global view of scheduling state: one [`Scheduler`] per core and the flat
/// registry of all live threads.
#[derive(Debug)]
pub struct GlobalScheduler {
    schedulers: [Scheduler; NUM_CPU_CORES as usize],
    threads: RwLock<Vec<Arc<Thread>>>,
}

impl Default for GlobalScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalScheduler {
    /// Creates the scheduler set with empty current-thread slots.
    #[must_use]
    pub fn new() -> Self {
        GlobalScheduler {
            schedulers: std::array::from_fn(|core| Scheduler::new(core as u32)),
            threads: RwLock::new(Vec::new()),
        }
    }

    /// Returns the scheduler of `core_id`.
    ///
    /// # Panics
    ///
    /// Panics if `core_id` is not an emulated core.
    #[must_use]
    pub fn scheduler(&self, core_id: u32) -> &Scheduler {
        &self.schedulers[core_id as usize]
    }

    /// Adds `thread` to the global thread registry.
    pub fn add_thread(&self, thread: Arc<Thread>) {
        self.threads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(thread);
    }

    /// Removes `thread` from the global thread registry.
    pub fn remove_thread(&self, thread: &Thread) {
        self.threads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|entry| entry.thread_id() != thread.thread_id());
    }

    /// Returns a snapshot of every live thread in the system.
    #[must_use]
    pub fn thread_list(&self) -> Vec<Arc<Thread>> {
        self.threads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Registers the calling host thread as emulated core `core_id`.
    ///
    /// # Panics
    ///
    /// Panics if `core_id` is not an emulated core.
    pub fn register_core_thread(&self, core_id: u32) {
        assert!(core_id < NUM_CPU_CORES, "invalid core id {core_id}");
        CURRENT_CORE.with(|core| core.set(Some(core_id)));
    }

    /// Drops the calling host thread's core registration.
    pub fn unregister_core_thread(&self) {
        CURRENT_CORE.with(|core| core.set(None));
    }

    /// Returns the core the calling host thread is registered as, if any.
    #[must_use]
    pub fn current_core(&self) -> Option<u32> {
        CURRENT_CORE.with(Cell::get)
    }

    /// Returns the scheduler of the calling host thread's core, if the
    /// thread is registered as one.
    #[must_use]
    pub fn current_scheduler(&self) -> Option<&Scheduler> {
        self.current_core().map(|core| self.scheduler(core))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{KernelConfig, KernelCore, Process};

    fn thread(kernel: &KernelCore, process: &Arc<Process>, name: &str) -> Arc<Thread> {
        Thread::create(kernel, name, 0, 44, 0, 0, 0x1000, process).unwrap()
    }

    #[test]
    fn test_set_current_thread_transitions_states() {
        let kernel = KernelCore::new(KernelConfig::default());
        let process = Process::create(&kernel, "test");
        let first = thread(&kernel, &process, "first");
        let second = thread(&kernel, &process, "second");

        let scheduler = kernel.global_scheduler().scheduler(0);
        scheduler.set_current_thread(Some(Arc::clone(&first)));
        assert_eq!(first.status(), ThreadStatus::Running);

        scheduler.set_current_thread(Some(Arc::clone(&second)));
        assert_eq!(second.status(), ThreadStatus::Running);
        assert_eq!(first.status(), ThreadStatus::Ready);
    }

    #[test]
    fn test_displaced_waiting_thread_keeps_its_state() {
        let kernel = KernelCore::new(KernelConfig::default());
        let process = Process::create(&kernel, "test");
        let first = thread(&kernel, &process, "first");

        let scheduler = kernel.global_scheduler().scheduler(1);
        scheduler.set_current_thread(Some(Arc::clone(&first)));
        first.set_status(ThreadStatus::WaitSynch);

        scheduler.set_current_thread(None);
        assert_eq!(first.status(), ThreadStatus::WaitSynch);
    }

    #[test]
    fn test_core_registration_is_per_host_thread() {
        let kernel = KernelCore::new(KernelConfig::default());
        let scheduler = kernel.global_scheduler();
        assert!(scheduler.current_core().is_none());

        scheduler.register_core_thread(2);
        assert_eq!(scheduler.current_core(), Some(2));
        assert_eq!(scheduler.current_scheduler().unwrap().core_id(), 2);

        scheduler.unregister_core_thread();
        assert!(scheduler.current_core().is_none());
    }

    #[test]
    fn test_thread_registry_tracks_additions_and_removals() {
        let kernel = KernelCore::new(KernelConfig::default());
        let process = Process::create(&kernel, "test");
        let a = thread(&kernel, &process, "a");
        let b = thread(&kernel, &process, "b");

        assert_eq!(kernel.global_scheduler().thread_list().len(), 2);

        a.stop(&kernel);
        let remaining = kernel.global_scheduler().thread_list();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].thread_id(), b.thread_id());
    }
}
