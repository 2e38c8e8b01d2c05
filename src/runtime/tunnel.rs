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
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::common::error::FragmentResult;
use crate::common::logging::debug;
use crate::common::types::{FragmentHandle, NodeEndpoint};
use crate::runtime::fragment_state::FragmentState;

/// Outbound data channel to one node. The transport behind it is not part of this crate.
pub trait DataTunnel: Send + Sync + fmt::Debug {
    fn endpoint(&self) -> &NodeEndpoint;

    fn send_record_batch(
        &self,
        sender: FragmentHandle,
        receiving_major_fragment_id: i32,
        payload: Vec<u8>,
    ) -> FragmentResult<()>;
}

/// Outbound control-plane channel to one node.
pub trait ControlTunnel: Send + Sync + fmt::Debug {
    fn endpoint(&self) -> &NodeEndpoint;

    fn send_fragment_status(&self, handle: FragmentHandle, state: FragmentState)
    -> FragmentResult<()>;

    fn cancel_fragment(&self, handle: FragmentHandle) -> FragmentResult<()>;
}

/// Source of data tunnels. Requesting the same endpoint twice is allowed.
pub trait DataConnectionPool: Send + Sync {
    fn tunnel(&self, endpoint: &NodeEndpoint) -> Arc<dyn DataTunnel>;
}

/// Source of control tunnels; it keeps its own cache.
pub trait Controller: Send + Sync {
    fn tunnel(&self, endpoint: &NodeEndpoint) -> Arc<dyn ControlTunnel>;
}

/// Per-fragment cache of data tunnels keyed by destination node.
///
/// Entries live as long as the cache. Two threads missing on the same endpoint may both
/// ask the pool; the first insert wins and the other tunnel is dropped.
pub struct TunnelCache {
    pool: Arc<dyn DataConnectionPool>,
    tunnels: Mutex<HashMap<NodeEndpoint, Arc<dyn DataTunnel>>>,
}

impl TunnelCache {
    pub fn new(pool: Arc<dyn DataConnectionPool>) -> Self {
        Self {
            pool,
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_tunnel(&self, endpoint: &NodeEndpoint) -> Arc<dyn DataTunnel> {
        if let Some(tunnel) = self
            .tunnels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(endpoint)
            .cloned()
        {
            return tunnel;
        }

        let created = self.pool.tunnel(endpoint);
        let mut guard = self.tunnels.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(endpoint.clone())
            .or_insert_with(|| {
                debug!("data tunnel to {} cached", endpoint);
                created
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.tunnels.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
