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

//! Per-process handle tables.
//!
//! A handle is an opaque `u32` the guest uses to name a kernel object it
//! owns. Each process has one [`HandleTable`] translating handles to
//! [`WaitObject`](crate::kernel::WaitObject) references. Handles encode a
//! table slot plus a generation counter, so a stale handle to a closed slot
//! is rejected instead of aliasing whatever object reused the slot.

use std::sync::Arc;

use crate::{kernel::WaitObject, Error, Result};

/// Hard upper bound on handle table size, in entries.
pub const MAX_HANDLE_TABLE_COUNT: usize = 1024;

/// Number of distinct generation values before the counter wraps.
const GENERATION_LIMIT: u32 = 0x7FFF;

/// An opaque guest-visible name for a kernel object.
///
/// The low 15 bits carry the generation, the bits above the slot index.
/// Generation zero never occurs, so a raw value of zero is never a valid
/// handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    /// Returns the raw `u32` representation passed to and from the guest.
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }

    fn new(slot: usize, generation: u32) -> Self {
        Handle((slot as u32) << 15 | generation)
    }

    fn slot(self) -> usize {
        (self.0 >> 15) as usize
    }

    fn generation(self) -> u32 {
        self.0 & GENERATION_LIMIT
    }
}

/// One slot of a handle table.
#[derive(Default)]
struct Entry {
    object: Option<Arc<dyn WaitObject>>,
    generation: u32,
}

/// Translates guest handles to kernel object references for one process.
///
/// The table size is fixed per process, set from the process's capability
/// set; the hard ceiling is [`MAX_HANDLE_TABLE_COUNT`] entries.
pub struct HandleTable {
    entries: Vec<Entry>,
    table_size: usize,
    next_generation: u32,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable")
            .field("table_size", &self.table_size)
            .field("open_handles", &self.open_handles())
            .finish()
    }
}

impl HandleTable {
    /// Creates a table sized at the hard maximum.
    #[must_use]
    pub fn new() -> Self {
        HandleTable {
            entries: (0..MAX_HANDLE_TABLE_COUNT).map(|_| Entry::default()).collect(),
            table_size: MAX_HANDLE_TABLE_COUNT,
            next_generation: 1,
        }
    }

    /// Restricts the table to `size` usable entries.
    ///
    /// A size of zero keeps the hard maximum, matching the convention that
    /// metadata declaring no table size gets the full table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSize`] if `size` exceeds
    /// [`MAX_HANDLE_TABLE_COUNT`].
    pub fn set_size(&mut self, size: usize) -> Result<()> {
        if size > MAX_HANDLE_TABLE_COUNT {
            return Err(Error::InvalidSize {
                size: size as u64,
                reason: "handle table size exceeds the hard maximum",
            });
        }
        self.table_size = if size == 0 { MAX_HANDLE_TABLE_COUNT } else { size };
        Ok(())
    }

    /// Stores `object` in the first free slot and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandleTableFull`] if every usable slot is occupied.
    pub fn create(&mut self, object: Arc<dyn WaitObject>) -> Result<Handle> {
        let slot = self.entries[..self.table_size]
            .iter()
            .position(|entry| entry.object.is_none())
            .ok_or(Error::HandleTableFull(self.table_size))?;

        let generation = self.next_generation;
        // Generations run 1..=0x7FFF; zero would make a raw handle of zero
        // representable.
        self.next_generation = if generation == GENERATION_LIMIT {
            1
        } else {
            generation + 1
        };

        self.entries[slot] = Entry {
            object: Some(object),
            generation,
        };
        Ok(Handle::new(slot, generation))
    }

    /// Looks up the object named by `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the handle's slot is empty, out
    /// of range, or holds a different generation.
    pub fn get(&self, handle: Handle) -> Result<Arc<dyn WaitObject>> {
        self.entries
            .get(handle.slot())
            .filter(|entry| entry.generation == handle.generation())
            .and_then(|entry| entry.object.clone())
            .ok_or(Error::InvalidHandle(handle.raw()))
    }

    /// Closes `handle`, releasing the table's reference to its object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the handle is not currently open.
    pub fn close(&mut self, handle: Handle) -> Result<()> {
        let entry = self
            .entries
            .get_mut(handle.slot())
            .filter(|entry| entry.generation == handle.generation() && entry.object.is_some())
            .ok_or(Error::InvalidHandle(handle.raw()))?;
        entry.object = None;
        Ok(())
    }

    /// Returns the number of currently open handles.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.object.is_some())
            .count()
    }

    /// Returns the usable table size, in entries.
    #[must_use]
    pub fn table_size(&self) -> usize {
        self.table_size
    }
}
