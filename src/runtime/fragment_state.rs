// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of one fragment instance.
///
/// Transitions only move forward: `Ok -> Failed`, `Ok -> Canceled`, `Failed -> Canceled`.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FragmentState {
    Ok = 0,
    Failed = 1,
    Canceled = 2,
}

impl FragmentState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => FragmentState::Ok,
            1 => FragmentState::Failed,
            _ => FragmentState::Canceled,
        }
    }
}

impl fmt::Display for FragmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FragmentState::Ok => "OK",
            FragmentState::Failed => "FAILED",
            FragmentState::Canceled => "CANCELED",
        };
        f.write_str(name)
    }
}

/// Shared holder of a [`FragmentState`].
///
/// Writers serialize through `transition`; readers load the atomic without locking, so a
/// worker polling between batches sees a new state eventually rather than immediately.
#[derive(Debug)]
pub struct FragmentStateCell {
    state: AtomicU8,
    transition: Mutex<()>,
}

impl Default for FragmentStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentStateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(FragmentState::Ok as u8),
            transition: Mutex::new(()),
        }
    }

    pub fn get(&self) -> FragmentState {
        FragmentState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Request a move to `target`. Returns true if the stored state changed.
    pub fn request(&self, target: FragmentState) -> bool {
        let _guard = self.transition.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.get();
        let next = match (current, target) {
            (FragmentState::Ok, target) => target,
            (FragmentState::Failed, FragmentState::Canceled) => FragmentState::Canceled,
            (current, _) => current,
        };
        if next == current {
            return false;
        }
        self.state.store(next as u8, Ordering::Release);
        true
    }

    pub fn is_failed(&self) -> bool {
        self.get() == FragmentState::Failed
    }

    pub fn is_cancelled(&self) -> bool {
        self.get() == FragmentState::Canceled
    }
}
