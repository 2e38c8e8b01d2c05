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
//! Deferred failure aggregation for multi-resource teardown.
//!
//! Responsibilities:
//! - Records the first failure as primary and every later one as suppressed, in arrival order.
//! - Runs resource releases without letting one failing release skip the others.
//!
//! Key exported interfaces:
//! - Types: `DeferredError`.
//! - Traits: `Closeable`.

use std::sync::Mutex;

use crate::common::error::{FragmentError, FragmentResult};
use crate::common::logging::warn;

/// A resource released during fragment teardown.
pub trait Closeable: Send + Sync {
    fn close(&self) -> FragmentResult<()>;

    fn resource_name(&self) -> &str {
        "resource"
    }
}

#[derive(Debug, Default)]
struct DeferredState {
    primary: Option<FragmentError>,
    suppressed: Vec<FragmentError>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct DeferredError {
    state: Mutex<DeferredState>,
}

impl DeferredError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure. Fails with `Closed` once `close()` has run.
    pub fn add_error(&self, err: FragmentError) -> FragmentResult<()> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if guard.closed {
            return Err(FragmentError::closed(format!(
                "deferred error (dropped: {err})"
            )));
        }
        if guard.primary.is_none() {
            guard.primary = Some(err);
        } else {
            guard.suppressed.push(err);
        }
        Ok(())
    }

    /// Primary failure with the suppressed ones attached, if anything was recorded.
    pub fn exception(&self) -> Option<FragmentError> {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .primary
            .clone()
            .map(|primary| FragmentError::with_suppressed(primary, guard.suppressed.clone()))
    }

    pub fn get_and_clear(&self) -> Option<FragmentError> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let suppressed = std::mem::take(&mut guard.suppressed);
        guard
            .primary
            .take()
            .map(|primary| FragmentError::with_suppressed(primary, suppressed))
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    /// Release `resource`, recording its failure instead of returning it.
    pub fn suppressing_close<R: Closeable + ?Sized>(&self, resource: Option<&R>) {
        let Some(resource) = resource else {
            return;
        };
        if let Err(err) = resource.close() {
            warn!(
                "release of {} failed, deferring: {}",
                resource.resource_name(),
                err
            );
            if let Err(dropped) = self.add_error(err) {
                warn!("{}", dropped);
            }
        }
    }

    /// Final step of a teardown sequence: returns the combined failure if one was recorded.
    pub fn close(&self) -> FragmentResult<()> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.closed = true;
        let suppressed = std::mem::take(&mut guard.suppressed);
        match guard.primary.take() {
            Some(primary) => Err(FragmentError::with_suppressed(primary, suppressed)),
            None => Ok(()),
        }
    }
}
