// Copyright 2025 The Axvisor Team
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

use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

/// A fixed table of lock-guarded slots, indexed by object id.
///
/// Callers that hold more than one slot of a table at a time must acquire
/// them in ascending index order; [`Slots::lock_pair`] does so.
pub(crate) struct Slots<T> {
    slots: Box<[Mutex<T>]>,
}

/// Two slots of one table locked together. `old` is `None` when it was not
/// requested or when it is the same slot as `new`.
pub(crate) struct SlotPair<'a, T> {
    pub new: MutexGuard<'a, T>,
    pub old: Option<MutexGuard<'a, T>>,
}

impl<T> Slots<T> {
    pub fn new(len: usize, mut init: impl FnMut(usize) -> T) -> Self {
        let slots: Vec<Mutex<T>> = (0..len).map(|i| Mutex::new(init(i))).collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn lock(&self, idx: usize) -> Option<MutexGuard<'_, T>> {
        self.slots.get(idx).map(Mutex::lock)
    }

    /// Lock `new` and, if given and distinct, `old`, lowest index first.
    ///
    /// Returns `None` if either index is out of range.
    pub fn lock_pair(&self, new: usize, old: Option<usize>) -> Option<SlotPair<'_, T>> {
        match old {
            Some(old) if old != new => {
                let (new_slot, old_slot) = (self.slots.get(new)?, self.slots.get(old)?);
                if new < old {
                    let new = new_slot.lock();
                    let old = old_slot.lock();
                    Some(SlotPair { new, old: Some(old) })
                } else {
                    let old = old_slot.lock();
                    let new = new_slot.lock();
                    Some(SlotPair { new, old: Some(old) })
                }
            }
            _ => Some(SlotPair {
                new: self.lock(new)?,
                old: None,
            }),
        }
    }

    /// Visit every slot in index order, one lock at a time, stopping at the first `Some`.
    pub fn find_map<R>(&self, mut f: impl FnMut(usize, &mut T) -> Option<R>) -> Option<R> {
        self.slots
            .iter()
            .enumerate()
            .find_map(|(idx, slot)| f(idx, &mut *slot.lock()))
    }
}
