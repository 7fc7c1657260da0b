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

//! The wait/signal synchronization primitive every blocking kernel object
//! builds on.
//!
//! A [`WaitObject`] is a kernel entity threads can block on: it reports via
//! [`should_wait`](WaitObject::should_wait) whether a calling thread must
//! block, and signaling it wakes *all* currently blocked waiters (broadcast,
//! never single-wake). [`Process`](crate::kernel::Process) and
//! [`Thread`](crate::kernel::Thread) implement this trait; other kernel
//! object kinds (events, semaphores) are built the same way.
//!
//! # Concurrency
//!
//! Wait objects are shared across all emulated core threads. The signaled
//! flag and the waiter list live under one mutex per object, so the
//! check-then-block path ([`Signal::add_waiter_if_unsignaled`]) and the
//! flag-flip-then-wake path ([`Signal::signal_and_wake_all`]) can never
//! interleave in a way that leaves a dormant thread asleep.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::kernel::Thread;

/// The synchronization capability of a kernel object.
///
/// Implementors expose a [`Signal`] holding the signaled flag and waiter
/// list, plus object-specific wait semantics. The default [`acquire`]
/// implementation asserts availability: acquiring an object that should
/// block is a programming error in the surrounding scheduler contract, not
/// a guest-visible error.
///
/// [`acquire`]: WaitObject::acquire
pub trait WaitObject: Send + Sync {
    /// Returns the signal state of this object.
    fn signal(&self) -> &Signal;

    /// Reports whether `thread` must block before acquiring this object.
    fn should_wait(&self, thread: &Thread) -> bool;

    /// Acquires this object on behalf of `thread`.
    ///
    /// # Panics
    ///
    /// Panics if [`should_wait`](Self::should_wait) is still true; callers
    /// must only acquire after a successful wait or an upfront check.
    fn acquire(&self, thread: &Thread) {
        assert!(!self.should_wait(thread), "object unavailable!");
    }

    /// Removes `thread` from this object's waiter list.
    ///
    /// Used when a thread stops waiting for any reason other than this
    /// object waking it (timeout, wait cancellation, thread death).
    fn remove_waiting_thread(&self, thread: &Thread) {
        self.signal().remove_waiter(thread);
    }

    /// Wakes every thread currently blocked on this object.
    fn wake_all_waiting_threads(&self) {
        self.signal().signal_and_wake_all();
    }
}

/// State shared by the signaled flag and the set of blocked waiters.
#[derive(Debug, Default)]
struct SignalInner {
    signaled: bool,
    waiters: Vec<Arc<Thread>>,
}

/// The signal state of one wait object.
///
/// Holds the `is_signaled` flag and the list of guest threads currently
/// blocked on the object, protected by a single mutex. A condition variable
/// additionally lets host threads (one per emulated core) park until the
/// object is signaled.
///
/// # Broadcast Semantics
///
/// [`signal_and_wake_all`](Signal::signal_and_wake_all) flips the flag and
/// drains the entire waiter list under one critical section, then resumes
/// every drained thread. Multiple threads across different cores may
/// legitimately wait on the same object, and all of them observe the
/// signaled state once the call returns.
#[derive(Debug, Default)]
pub struct Signal {
    inner: Mutex<SignalInner>,
    condvar: Condvar,
}

impl Signal {
    /// Creates an unsignaled state with no waiters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the object is currently signaled.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.lock().signaled
    }

    /// Clears the signaled flag without waking anyone.
    pub fn clear(&self) {
        self.lock().signaled = false;
    }

    /// Sets the signaled flag and wakes every blocked waiter.
    ///
    /// Guest threads registered in the waiter list are drained and resumed;
    /// host threads parked in [`block_until_signaled`](Self::block_until_signaled)
    /// are released via the condition variable. The flag flip and the waiter
    /// drain happen under one lock, so no waiter registered before the
    /// signal can be missed.
    pub fn signal_and_wake_all(&self) {
        let waiters = {
            let mut inner = self.lock();
            inner.signaled = true;
            std::mem::take(&mut inner.waiters)
        };
        self.condvar.notify_all();

        // Resumed outside the lock: waking a thread takes its own state
        // lock and may touch other objects' waiter lists.
        for thread in waiters {
            thread.wake_from_wait_object();
        }
    }

    /// Registers `thread` as a waiter if the object is not yet signaled.
    ///
    /// Returns `true` if the thread was registered (it must block), or
    /// `false` if the object is already signaled (no wait is needed). The
    /// check and the registration are one critical section; a signal
    /// arriving after registration is guaranteed to find the thread in the
    /// waiter list.
    pub fn add_waiter_if_unsignaled(&self, thread: Arc<Thread>) -> bool {
        let mut inner = self.lock();
        if inner.signaled {
            return false;
        }
        inner.waiters.push(thread);
        true
    }

    /// Removes `thread` from the waiter list, if present.
    pub fn remove_waiter(&self, thread: &Thread) {
        self.lock()
            .waiters
            .retain(|waiter| waiter.thread_id() != thread.thread_id());
    }

    /// Returns the number of threads currently registered as waiters.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Parks the calling host thread until the object is signaled.
    ///
    /// Used by the per-core execution substrate to idle a core whose
    /// current guest thread is blocked, and by tests exercising broadcast
    /// wakeup. Returns immediately if the object is already signaled.
    pub fn block_until_signaled(&self) {
        let mut inner = self.lock();
        while !inner.signaled {
            inner = self
                .condvar
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Locks the inner state, recovering from poisoning.
    ///
    /// A poisoned lock only means another thread panicked mid-update; the
    /// flag and waiter list remain individually consistent.
    fn lock(&self) -> MutexGuard<'_, SignalInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_flag_transitions() {
        let signal = Signal::new();
        assert!(!signal.is_signaled());

        signal.signal_and_wake_all();
        assert!(signal.is_signaled());

        signal.clear();
        assert!(!signal.is_signaled());
    }

    #[test]
    fn test_block_until_signaled_releases_host_threads() {
        let signal = Arc::new(Signal::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let signal = Arc::clone(&signal);
                std::thread::spawn(move || signal.block_until_signaled())
            })
            .collect();

        // Give the waiters a moment to park.
        std::thread::sleep(std::time::Duration::from_millis(20));
        signal.signal_and_wake_all();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(signal.is_signaled());
    }

    #[test]
    fn test_block_returns_immediately_when_signaled() {
        let signal = Signal::new();
        signal.signal_and_wake_all();
        signal.block_until_signaled();
    }
}
