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
//! Scratch buffers tracked by a fragment-scoped pool.
//!
//! Responsibilities:
//! - Draws buffer memory from the fragment allocator and remembers every buffer handed out.
//! - Swaps a buffer for a differently sized one without leaking the old accounting.
//! - Force-releases whatever is still outstanding when the pool closes.
//!
//! Key exported interfaces:
//! - Types: `BufferManager`, `ManagedBuffer`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::error::{FragmentError, FragmentResult};
use crate::common::logging::debug;
use crate::runtime::deferred_error::Closeable;
use crate::runtime::mem_tracker::BufferAllocator;

struct BufferInner {
    id: u64,
    capacity: usize,
    data: Mutex<Option<Vec<u8>>>,
    allocator: Arc<dyn BufferAllocator>,
}

impl BufferInner {
    /// Idempotent: only the first call returns the bytes to the allocator.
    fn release(&self) -> bool {
        let taken = self
            .data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match taken {
            Some(_) => {
                self.allocator.release(capacity_as_i64(self.capacity));
                true
            }
            None => false,
        }
    }
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Handle to a scratch buffer owned by a [`BufferManager`].
///
/// Clones share the same memory. Once the buffer is released (by `replace`, by the pool
/// closing, or explicitly) every handle sees `is_released() == true` and data access fails.
#[derive(Clone)]
pub struct ManagedBuffer {
    inner: Arc<BufferInner>,
}

impl fmt::Debug for ManagedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedBuffer")
            .field("id", &self.inner.id)
            .field("capacity", &self.inner.capacity)
            .field("released", &self.is_released())
            .finish()
    }
}

impl ManagedBuffer {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn is_released(&self) -> bool {
        self.inner
            .data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    /// Run `f` over the buffer bytes.
    pub fn with_data<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> FragmentResult<R> {
        let mut guard = self.inner.data.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(data) => Ok(f(data.as_mut_slice())),
            None => Err(FragmentError::closed(format!(
                "managed buffer {}",
                self.inner.id
            ))),
        }
    }

    pub fn release(&self) -> bool {
        self.inner.release()
    }
}

fn capacity_as_i64(capacity: usize) -> i64 {
    i64::try_from(capacity).unwrap_or(i64::MAX)
}

/// Fragment-scoped pool of [`ManagedBuffer`]s.
pub struct BufferManager {
    owner: String,
    allocator: Arc<dyn BufferAllocator>,
    default_size: usize,
    next_id: AtomicU64,
    // None once closed.
    buffers: Mutex<Option<HashMap<u64, ManagedBuffer>>>,
}

impl BufferManager {
    pub fn new(
        owner: impl Into<String>,
        allocator: Arc<dyn BufferAllocator>,
        default_size: usize,
    ) -> Self {
        Self {
            owner: owner.into(),
            allocator,
            default_size,
            next_id: AtomicU64::new(0),
            buffers: Mutex::new(Some(HashMap::new())),
        }
    }

    pub fn managed_buffer(&self) -> FragmentResult<ManagedBuffer> {
        self.managed_buffer_with_size(self.default_size)
    }

    pub fn managed_buffer_with_size(&self, size: usize) -> FragmentResult<ManagedBuffer> {
        let mut guard = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let buffers = guard
            .as_mut()
            .ok_or_else(|| FragmentError::closed(format!("buffer manager of {}", self.owner)))?;
        let buffer = self.allocate(size)?;
        buffers.retain(|_, tracked| !tracked.is_released());
        buffers.insert(buffer.id(), buffer.clone());
        Ok(buffer)
    }

    /// Allocate a `new_size` buffer, then release `old` and stop tracking it.
    ///
    /// Contents are not copied. On allocation failure `old` stays tracked and usable.
    pub fn replace(&self, old: ManagedBuffer, new_size: usize) -> FragmentResult<ManagedBuffer> {
        let mut guard = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let buffers = guard
            .as_mut()
            .ok_or_else(|| FragmentError::closed(format!("buffer manager of {}", self.owner)))?;
        // Ids are per pool, so a buffer from another pool may carry a tracked id.
        let owned = buffers
            .get(&old.id())
            .is_some_and(|tracked| Arc::ptr_eq(&tracked.inner, &old.inner));
        if !owned {
            return Err(FragmentError::invalid_argument(format!(
                "buffer {} is not managed by {}",
                old.id(),
                self.owner
            )));
        }
        let replacement = self.allocate(new_size)?;
        buffers.remove(&old.id());
        old.release();
        buffers.retain(|_, tracked| !tracked.is_released());
        buffers.insert(replacement.id(), replacement.clone());
        Ok(replacement)
    }

    /// Number of tracked buffers not yet released. Buffers their callers released early
    /// stop being tracked at the next allocation.
    pub fn len(&self) -> usize {
        self.buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, |buffers| {
                buffers.values().filter(|b| !b.is_released()).count()
            })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn allocate(&self, size: usize) -> FragmentResult<ManagedBuffer> {
        let bytes = i64::try_from(size).map_err(|_| {
            FragmentError::invalid_argument(format!("buffer size {size} is too large"))
        })?;
        self.allocator.try_consume(bytes)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(ManagedBuffer {
            inner: Arc::new(BufferInner {
                id,
                capacity: size,
                data: Mutex::new(Some(vec![0u8; size])),
                allocator: Arc::clone(&self.allocator),
            }),
        })
    }
}

impl Closeable for BufferManager {
    fn close(&self) -> FragmentResult<()> {
        let taken = self
            .buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(buffers) = taken {
            let mut released = 0usize;
            for buffer in buffers.into_values() {
                if buffer.release() {
                    released += 1;
                }
            }
            debug!(
                "buffer manager of {} closed, force-released {} buffers",
                self.owner, released
            );
        }
        Ok(())
    }

    fn resource_name(&self) -> &str {
        "buffer manager"
    }
}
