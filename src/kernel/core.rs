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

//! The per-session kernel orchestrator.
//!
//! One [`KernelCore`] exists per emulation session. It allocates process and
//! thread ids, owns the process registry, the system-wide resource limit,
//! and the [`GlobalScheduler`]. There is no global state; everything hangs
//! off this object, so tests and embedders can run multiple independent
//! sessions side by side.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, PoisonError, RwLock,
};

use dashmap::DashMap;

use crate::kernel::{GlobalScheduler, Process, ResourceLimit, ResourceType, Scheduler};

/// Tuning knobs for a kernel session.
#[derive(Debug, Default, Clone)]
pub struct KernelConfig {
    /// Seed for per-process entropy. `None` draws from the host's entropy
    /// source; a fixed seed makes entropy reproducible across runs.
    pub rng_seed: Option<u64>,
}

/// Default system-wide resource ceilings, applied to the shared limit at
/// session start.
const DEFAULT_LIMITS: [(ResourceType, i64); 5] = [
    (ResourceType::PhysicalMemory, 0x1_0000_0000),
    (ResourceType::Threads, 800),
    (ResourceType::Events, 700),
    (ResourceType::TransferMemory, 200),
    (ResourceType::Sessions, 900),
];

/// The root object of one emulation session.
///
/// Passed explicitly to every operation that needs id allocation, the
/// process registry, or scheduling state.
pub struct KernelCore {
    config: KernelConfig,
    next_process_id: AtomicU64,
    next_thread_id: AtomicU64,
    processes: DashMap<u64, Arc<Process>>,
    system_resource_limit: Arc<ResourceLimit>,
    global_scheduler: GlobalScheduler,
    current_process: RwLock<Option<Arc<Process>>>,
}

impl std::fmt::Debug for KernelCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelCore")
            .field("processes", &self.processes.len())
            .finish_non_exhaustive()
    }
}

impl Default for KernelCore {
    fn default() -> Self {
        Self::new(KernelConfig::default())
    }
}

impl KernelCore {
    /// Creates a fresh session with the default resource ceilings.
    #[must_use]
    pub fn new(config: KernelConfig) -> Self {
        let system_resource_limit = Arc::new(ResourceLimit::new());
        for (resource, limit) in DEFAULT_LIMITS {
            // Fresh limits have zero usage, so this cannot fail.
            let _ = system_resource_limit.set_limit_value(resource, limit);
        }

        KernelCore {
            config,
            next_process_id: AtomicU64::new(1),
            next_thread_id: AtomicU64::new(1),
            processes: DashMap::new(),
            system_resource_limit,
            global_scheduler: GlobalScheduler::new(),
            current_process: RwLock::new(None),
        }
    }

    /// Allocates the next process id. Ids are never reused in a session.
    #[must_use]
    pub fn create_new_process_id(&self) -> u64 {
        self.next_process_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates the next thread id. Ids are never reused in a session.
    #[must_use]
    pub fn create_new_thread_id(&self) -> u64 {
        self.next_thread_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a newly created process in the session's registry.
    pub fn append_new_process(&self, process: Arc<Process>) {
        self.processes.insert(process.process_id(), process);
    }

    /// Looks up a process by id.
    #[must_use]
    pub fn process(&self, process_id: u64) -> Option<Arc<Process>> {
        self.processes
            .get(&process_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Returns a snapshot of every registered process.
    #[must_use]
    pub fn process_list(&self) -> Vec<Arc<Process>> {
        self.processes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Returns the resource limit all processes share by default.
    #[must_use]
    pub fn system_resource_limit(&self) -> &Arc<ResourceLimit> {
        &self.system_resource_limit
    }

    /// Returns the session's global scheduling state.
    #[must_use]
    pub fn global_scheduler(&self) -> &GlobalScheduler {
        &self.global_scheduler
    }

    /// Returns the scheduler of the calling host thread's core, if the
    /// thread is registered as one.
    #[must_use]
    pub fn current_scheduler(&self) -> Option<&Scheduler> {
        self.global_scheduler.current_scheduler()
    }

    /// Marks `process` as the session's current (foreground) process.
    pub fn make_current_process(&self, process: Arc<Process>) {
        *self
            .current_process
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(process);
    }

    /// Returns the session's current process, if one has been set.
    #[must_use]
    pub fn current_process(&self) -> Option<Arc<Process>> {
        self.current_process
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the configured entropy seed, if any.
    #[must_use]
    pub fn rng_seed(&self) -> Option<u64> {
        self.config.rng_seed
    }

    /// Tears the session down: stops every live thread and drops every
    /// process registration.
    ///
    /// Threads are stopped unconditionally regardless of their wait state;
    /// this is host-driven shutdown, not guest-visible termination.
    pub fn shutdown(&self) {
        for thread in self.global_scheduler.thread_list() {
            thread.stop(self);
        }

        self.processes.clear();
        *self
            .current_process
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;

        log::info!("kernel shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Thread;

    #[test]
    fn test_ids_are_unique_and_monotonic() {
        let kernel = KernelCore::new(KernelConfig::default());
        let first = kernel.create_new_process_id();
        let second = kernel.create_new_process_id();
        assert!(second > first);

        let first = kernel.create_new_thread_id();
        let second = kernel.create_new_thread_id();
        assert!(second > first);
    }

    #[test]
    fn test_process_registry() {
        let kernel = KernelCore::new(KernelConfig::default());
        let process = Process::create(&kernel, "app");

        assert_eq!(kernel.process_list().len(), 1);
        let found = kernel.process(process.process_id()).unwrap();
        assert!(Arc::ptr_eq(&found, &process));
        assert!(kernel.process(process.process_id() + 1).is_none());
    }

    #[test]
    fn test_current_process_tracking() {
        let kernel = KernelCore::new(KernelConfig::default());
        assert!(kernel.current_process().is_none());

        let process = Process::create(&kernel, "app");
        kernel.make_current_process(Arc::clone(&process));
        assert!(Arc::ptr_eq(&kernel.current_process().unwrap(), &process));
    }

    #[test]
    fn test_shutdown_stops_threads_and_clears_registry() {
        let kernel = KernelCore::new(KernelConfig::default());
        let process = Process::create(&kernel, "app");
        let thread = Thread::create(&kernel, "t", 0, 44, 0, 0, 0x1000, &process).unwrap();
        kernel.make_current_process(Arc::clone(&process));

        kernel.shutdown();

        assert_eq!(thread.status(), crate::kernel::ThreadStatus::Dead);
        assert!(kernel.global_scheduler().thread_list().is_empty());
        assert!(kernel.process_list().is_empty());
        assert!(kernel.current_process().is_none());
    }

    #[test]
    fn test_default_limits_applied() {
        let kernel = KernelCore::new(KernelConfig::default());
        let limit = kernel.system_resource_limit();
        assert_eq!(limit.limit_for(ResourceType::Threads), 800);
        assert_eq!(limit.limit_for(ResourceType::PhysicalMemory), 0x1_0000_0000);
    }
}
