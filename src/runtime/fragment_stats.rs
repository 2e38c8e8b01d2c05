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
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::common::types::{FragmentHandle, NodeEndpoint};
use crate::runtime::mem_tracker::BufferAllocator;
use crate::runtime::profile::{
    CounterRef, CounterUnit, RuntimeProfile, attach_allocator_tree,
};

pub const FRAGMENTS_STARTED: &str = "FragmentsStarted";
pub const FRAGMENTS_FAILED: &str = "FragmentsFailed";
pub const FRAGMENTS_CANCELED: &str = "FragmentsCanceled";

/// Counters of one operator instance inside a fragment.
#[derive(Clone, Debug)]
pub struct OperatorStats {
    operator_id: i32,
    operator_type: String,
    profile: RuntimeProfile,
    records: CounterRef,
    batches: CounterRef,
}

impl OperatorStats {
    pub fn operator_id(&self) -> i32 {
        self.operator_id
    }

    pub fn operator_type(&self) -> &str {
        &self.operator_type
    }

    pub fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }

    pub fn add_batch(&self, records: i64) {
        self.batches.add(1);
        self.records.add(records);
    }

    pub fn records(&self) -> i64 {
        self.records.value()
    }

    pub fn batches(&self) -> i64 {
        self.batches.value()
    }
}

/// Statistics of one fragment instance: timing, memory and per-operator counters.
pub struct FragmentStats {
    profile: RuntimeProfile,
    allocator: Arc<dyn BufferAllocator>,
    endpoint: NodeEndpoint,
    start_time: DateTime<Utc>,
    started: Instant,
    operators: Mutex<Vec<OperatorStats>>,
}

impl FragmentStats {
    pub fn new(
        handle: &FragmentHandle,
        allocator: Arc<dyn BufferAllocator>,
        metrics: &RuntimeProfile,
        endpoint: NodeEndpoint,
    ) -> Self {
        metrics.counter_add(FRAGMENTS_STARTED, CounterUnit::Unit, 1);
        let profile = RuntimeProfile::new(format!(
            "Fragment {}",
            handle.fragment_id_string()
        ));
        profile.add_info_string("Endpoint", endpoint.to_string());
        profile.add_info_string("QueryId", handle.query_id.to_string());
        Self {
            profile,
            allocator,
            endpoint,
            start_time: Utc::now(),
            started: Instant::now(),
            operators: Mutex::new(Vec::new()),
        }
    }

    pub fn new_operator_stats(&self, operator_id: i32, operator_type: &str) -> OperatorStats {
        let profile = self
            .profile
            .child(format!("{} (id={})", operator_type, operator_id));
        let stats = OperatorStats {
            operator_id,
            operator_type: operator_type.to_string(),
            records: profile.add_counter("RecordsProcessed", CounterUnit::Unit),
            batches: profile.add_counter("BatchesProcessed", CounterUnit::Unit),
            profile,
        };
        self.operators
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(stats.clone());
        stats
    }

    pub fn operators(&self) -> Vec<OperatorStats> {
        self.operators
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn memory_used(&self) -> i64 {
        self.allocator.current()
    }

    pub fn max_memory_used(&self) -> i64 {
        self.allocator.peak()
    }

    /// Refresh time and memory counters and return the fragment profile.
    pub fn profile(&self) -> RuntimeProfile {
        let elapsed_ns = i64::try_from(self.started.elapsed().as_nanos()).unwrap_or(i64::MAX);
        self.profile
            .counter_set("ElapsedTime", CounterUnit::TimeNs, elapsed_ns);
        self.profile
            .counter_set("MemoryUsed", CounterUnit::Bytes, self.memory_used());
        self.profile
            .counter_set("MaxMemoryUsed", CounterUnit::Bytes, self.max_memory_used());
        attach_allocator_tree(&self.profile, &self.allocator);
        self.profile.clone()
    }
}
