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
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::common::error::{FragmentError, FragmentResult};
use crate::common::logging::debug;
use crate::runtime::deferred_error::Closeable;

/// Budget-enforcing allocator capability.
///
/// Nodes form a tree rooted at a process-wide allocator. Accounting is logical: callers
/// report the bytes they hold, the allocator decides whether the request fits every budget
/// between the node and the root. Negative limits mean "unlimited".
pub trait BufferAllocator: Closeable + fmt::Debug {
    fn label(&self) -> &str;

    /// Spawn a sub-allocator whose `initial_reservation` is drawn from this node immediately.
    fn child_allocator(
        &self,
        owner: &str,
        initial_reservation: i64,
        max_reservation: i64,
        apply_fragment_limit: bool,
    ) -> FragmentResult<Arc<dyn BufferAllocator>>;

    /// Account `bytes` against this node and its ancestors, failing with `OutOfMemory`.
    fn try_consume(&self, bytes: i64) -> FragmentResult<()>;

    fn release(&self, bytes: i64);

    /// Runtime ceiling recomputed by the coordinator as sibling fragments come and go.
    fn set_fragment_limit(&self, limit: i64);

    fn fragment_limit(&self) -> i64;

    fn max_reservation(&self) -> i64;

    fn current(&self) -> i64;

    fn peak(&self) -> i64;

    fn children(&self) -> Vec<Arc<dyn BufferAllocator>>;
}

/// Tree node implementing [`BufferAllocator`].
///
/// A child's initial reservation is charged to its parent at creation. Usage within that
/// reservation stays local; only the overflow beyond it is charged further up, so every
/// node is bounded by what its parent still has left.
pub struct MemTracker {
    label: String,
    this: Weak<MemTracker>,
    parent: Option<Arc<MemTracker>>,
    initial_reservation: i64,
    max_reservation: i64,
    apply_fragment_limit: bool,
    fragment_limit: AtomicI64,
    current: Mutex<i64>,
    peak: AtomicI64,
    allocated: AtomicI64,
    deallocated: AtomicI64,
    closed: AtomicBool,
    children: Mutex<Vec<Weak<MemTracker>>>,
}

impl fmt::Debug for MemTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemTracker")
            .field("label", &self.label)
            .field("current", &self.current())
            .field("peak", &self.peak())
            .field("max_reservation", &self.max_reservation)
            .field("fragment_limit", &self.fragment_limit())
            .finish()
    }
}

impl MemTracker {
    /// Create a root tracker with no parent. `limit < 0` leaves it unbounded.
    pub fn new_root(label: impl Into<String>, limit: i64) -> Arc<Self> {
        Self::build(label.into(), None, 0, limit, false)
    }

    fn build(
        label: String,
        parent: Option<Arc<MemTracker>>,
        initial_reservation: i64,
        max_reservation: i64,
        apply_fragment_limit: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            label,
            this: this.clone(),
            parent,
            initial_reservation,
            max_reservation,
            apply_fragment_limit,
            fragment_limit: AtomicI64::new(-1),
            current: Mutex::new(0),
            peak: AtomicI64::new(0),
            allocated: AtomicI64::new(0),
            deallocated: AtomicI64::new(0),
            closed: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
        })
    }

    /// Create a child tracker under `parent`, charging `initial_reservation` to it.
    pub fn new_child(
        label: impl Into<String>,
        parent: &Arc<MemTracker>,
        initial_reservation: i64,
        max_reservation: i64,
        apply_fragment_limit: bool,
    ) -> FragmentResult<Arc<Self>> {
        let label = label.into();
        if initial_reservation < 0 {
            return Err(FragmentError::invalid_argument(format!(
                "negative initial reservation {initial_reservation} for {label}"
            )));
        }
        if max_reservation >= 0 && initial_reservation > max_reservation {
            return Err(FragmentError::invalid_argument(format!(
                "initial reservation {initial_reservation} exceeds max reservation {max_reservation} for {label}"
            )));
        }
        if parent.is_closed() {
            return Err(FragmentError::closed(format!("allocator {}", parent.label)));
        }
        parent.consume_inner(initial_reservation, apply_fragment_limit)?;

        let child = Self::build(
            label,
            Some(Arc::clone(parent)),
            initial_reservation,
            max_reservation,
            apply_fragment_limit,
        );
        {
            let mut children = parent.children.lock().unwrap_or_else(|e| e.into_inner());
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        debug!(
            "allocator {} created under {}: initial={} max={} apply_fragment_limit={}",
            child.label, parent.label, initial_reservation, max_reservation, apply_fragment_limit
        );
        Ok(child)
    }

    pub fn allocated(&self) -> i64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn deallocated(&self) -> i64 {
        self.deallocated.load(Ordering::Relaxed)
    }

    pub fn initial_reservation(&self) -> i64 {
        self.initial_reservation
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn overflow(&self, usage: i64) -> i64 {
        (usage - self.initial_reservation).max(0)
    }

    /// `enforce_fragment_limit` is false once the request crossed a node that opted out.
    fn consume_inner(&self, bytes: i64, enforce_fragment_limit: bool) -> FragmentResult<()> {
        if bytes <= 0 {
            return Ok(());
        }
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_closed() {
            return Err(FragmentError::closed(format!("allocator {}", self.label)));
        }
        let new_value = current.saturating_add(bytes);
        if self.max_reservation >= 0 && new_value > self.max_reservation {
            return Err(FragmentError::out_of_memory(format!(
                "allocator {} cannot grant {} bytes: {} in use, max reservation {}",
                self.label, bytes, *current, self.max_reservation
            )));
        }
        let limit = self.fragment_limit.load(Ordering::Acquire);
        if enforce_fragment_limit && limit >= 0 && new_value > limit {
            return Err(FragmentError::out_of_memory(format!(
                "allocator {} cannot grant {} bytes: {} in use, fragment limit {}",
                self.label, bytes, *current, limit
            )));
        }
        let overflow = self.overflow(new_value) - self.overflow(*current);
        if overflow > 0
            && let Some(parent) = &self.parent
        {
            parent.consume_inner(overflow, enforce_fragment_limit && self.apply_fragment_limit)?;
        }
        *current = new_value;
        drop(current);

        self.allocated.fetch_add(bytes, Ordering::AcqRel);
        self.update_peak(new_value);
        Ok(())
    }

    fn release_inner(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_closed() {
            return;
        }
        let new_value = (*current - bytes).max(0);
        let overflow = self.overflow(*current) - self.overflow(new_value);
        self.deallocated
            .fetch_add(*current - new_value, Ordering::AcqRel);
        *current = new_value;
        if overflow > 0
            && let Some(parent) = &self.parent
        {
            parent.release_inner(overflow);
        }
    }

    fn update_peak(&self, value: i64) {
        let mut prev = self.peak.load(Ordering::Relaxed);
        while value > prev {
            match self
                .peak
                .compare_exchange(prev, value, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Drop all accounting held by this node and hand its charges back to the parent.
    /// Returns the bytes that were still outstanding.
    fn close_inner(&self) -> Option<i64> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if self.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        let outstanding = *current;
        let charged_to_parent = self.overflow(outstanding) + self.initial_reservation;
        *current = 0;
        if let Some(parent) = &self.parent {
            parent.release_inner(charged_to_parent);
        }
        Some(outstanding)
    }
}

impl Closeable for MemTracker {
    fn close(&self) -> FragmentResult<()> {
        match self.close_inner() {
            Some(outstanding) if outstanding > 0 => Err(FragmentError::MemoryLeak {
                label: self.label.clone(),
                bytes: outstanding,
            }),
            _ => Ok(()),
        }
    }

    fn resource_name(&self) -> &str {
        &self.label
    }
}

impl BufferAllocator for MemTracker {
    fn label(&self) -> &str {
        &self.label
    }

    fn child_allocator(
        &self,
        owner: &str,
        initial_reservation: i64,
        max_reservation: i64,
        apply_fragment_limit: bool,
    ) -> FragmentResult<Arc<dyn BufferAllocator>> {
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| FragmentError::closed(format!("allocator {}", self.label)))?;
        let child = MemTracker::new_child(
            owner,
            &this,
            initial_reservation,
            max_reservation,
            apply_fragment_limit,
        )?;
        Ok(child)
    }

    fn try_consume(&self, bytes: i64) -> FragmentResult<()> {
        self.consume_inner(bytes, true)
    }

    fn release(&self, bytes: i64) {
        self.release_inner(bytes);
    }

    fn set_fragment_limit(&self, limit: i64) {
        debug!("allocator {} fragment limit set to {}", self.label, limit);
        self.fragment_limit.store(limit, Ordering::Release);
    }

    fn fragment_limit(&self) -> i64 {
        self.fragment_limit.load(Ordering::Acquire)
    }

    fn max_reservation(&self) -> i64 {
        self.max_reservation
    }

    fn current(&self) -> i64 {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    fn children(&self) -> Vec<Arc<dyn BufferAllocator>> {
        let mut out: Vec<Arc<dyn BufferAllocator>> = Vec::new();
        let guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
        for weak in guard.iter() {
            if let Some(child) = weak.upgrade()
                && !child.is_closed()
            {
                out.push(child);
            }
        }
        out
    }
}

impl Drop for MemTracker {
    fn drop(&mut self) {
        if let Some(outstanding) = self.close_inner()
            && outstanding > 0
        {
            debug!(
                "allocator {} dropped with {} bytes outstanding",
                self.label, outstanding
            );
        }
    }
}
