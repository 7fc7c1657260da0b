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

//! Per-resource usage accounting and ceilings.
//!
//! A [`ResourceLimit`] tracks the current usage and maximum allowance of
//! each countable kernel resource. Every process references one; by default
//! all processes share the system-wide limit owned by
//! [`KernelCore`](crate::kernel::KernelCore).

use std::sync::atomic::{AtomicI64, Ordering};

/// The countable kernel resources subject to limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ResourceType {
    /// Bytes of physical memory backing mapped regions.
    PhysicalMemory,
    /// Live thread count.
    Threads,
    /// Live event object count.
    Events,
    /// Live transfer memory object count.
    TransferMemory,
    /// Live session count.
    Sessions,
}

impl ResourceType {
    const COUNT: usize = 5;

    fn index(self) -> usize {
        self as usize
    }
}

/// Usage ceilings and current usage for the countable kernel resources.
///
/// All counters are atomics; reservation and release are safe to call from
/// any emulated core thread without external locking.
#[derive(Debug)]
pub struct ResourceLimit {
    limits: [AtomicI64; ResourceType::COUNT],
    current: [AtomicI64; ResourceType::COUNT],
}

impl Default for ResourceLimit {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceLimit {
    /// Creates a limit object with every ceiling and usage at zero.
    #[must_use]
    pub fn new() -> Self {
        ResourceLimit {
            limits: std::array::from_fn(|_| AtomicI64::new(0)),
            current: std::array::from_fn(|_| AtomicI64::new(0)),
        }
    }

    /// Returns the ceiling for `resource`.
    #[must_use]
    pub fn limit_for(&self, resource: ResourceType) -> i64 {
        self.limits[resource.index()].load(Ordering::Acquire)
    }

    /// Returns the current usage of `resource`.
    #[must_use]
    pub fn current_for(&self, resource: ResourceType) -> i64 {
        self.current[resource.index()].load(Ordering::Acquire)
    }

    /// Sets the ceiling for `resource` to `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`](crate::Error::InvalidState) if the
    /// current usage already exceeds the new ceiling.
    pub fn set_limit_value(&self, resource: ResourceType, value: i64) -> crate::Result<()> {
        if self.current_for(resource) > value {
            log::error!(
                "cannot lower the {resource} limit to {value} below current usage {}",
                self.current_for(resource)
            );
            return Err(crate::Error::InvalidState);
        }
        self.limits[resource.index()].store(value, Ordering::Release);
        Ok(())
    }

    /// Reserves `amount` units of `resource`.
    ///
    /// Returns `true` if the reservation fit under the ceiling. On `false`
    /// the usage counter is left unchanged.
    #[must_use]
    pub fn reserve(&self, resource: ResourceType, amount: i64) -> bool {
        let limit = self.limit_for(resource);
        let previous = self.current[resource.index()].fetch_add(amount, Ordering::AcqRel);
        if previous + amount > limit {
            self.current[resource.index()].fetch_sub(amount, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Releases `amount` previously reserved units of `resource`.
    pub fn release(&self, resource: ResourceType, amount: i64) {
        let previous = self.current[resource.index()].fetch_sub(amount, Ordering::AcqRel);
        debug_assert!(previous >= amount, "released more {resource} than reserved");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_within_limit() {
        let limit = ResourceLimit::new();
        limit.set_limit_value(ResourceType::Threads, 2).unwrap();

        assert!(limit.reserve(ResourceType::Threads, 1));
        assert!(limit.reserve(ResourceType::Threads, 1));
        assert_eq!(limit.current_for(ResourceType::Threads), 2);
    }

    #[test]
    fn test_reserve_over_limit_rolls_back() {
        let limit = ResourceLimit::new();
        limit.set_limit_value(ResourceType::Events, 1).unwrap();

        assert!(limit.reserve(ResourceType::Events, 1));
        assert!(!limit.reserve(ResourceType::Events, 1));
        assert_eq!(limit.current_for(ResourceType::Events), 1);
    }

    #[test]
    fn test_release_restores_headroom() {
        let limit = ResourceLimit::new();
        limit.set_limit_value(ResourceType::Sessions, 1).unwrap();

        assert!(limit.reserve(ResourceType::Sessions, 1));
        limit.release(ResourceType::Sessions, 1);
        assert!(limit.reserve(ResourceType::Sessions, 1));
    }

    #[test]
    fn test_cannot_lower_limit_below_usage() {
        let limit = ResourceLimit::new();
        limit
            .set_limit_value(ResourceType::PhysicalMemory, 0x10000)
            .unwrap();
        assert!(limit.reserve(ResourceType::PhysicalMemory, 0x8000));

        assert!(limit
            .set_limit_value(ResourceType::PhysicalMemory, 0x4000)
            .is_err());
        assert_eq!(limit.limit_for(ResourceType::PhysicalMemory), 0x10000);
    }
}
