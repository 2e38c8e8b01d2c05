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
//! Node-wide services shared by every fragment running in the process.
//!
//! The context only holds references to these; their lifetime belongs to the node.

use std::sync::Arc;

use crate::common::config::root_limit_bytes;
use crate::common::types::NodeEndpoint;
use crate::runtime::mem_tracker::{BufferAllocator, MemTracker};
use crate::runtime::options::{OptionManager, SystemOptionManager};
use crate::runtime::profile::RuntimeProfile;
use crate::runtime::schema::SchemaFactory;
use crate::runtime::tunnel::{Controller, DataConnectionPool};

#[derive(Clone)]
pub struct ExecEnv {
    root_allocator: Arc<dyn BufferAllocator>,
    controller: Arc<dyn Controller>,
    connection_pool: Arc<dyn DataConnectionPool>,
    metrics: RuntimeProfile,
    system_options: Arc<dyn OptionManager>,
    schema_factory: Arc<dyn SchemaFactory>,
    endpoint: NodeEndpoint,
}

impl ExecEnv {
    pub fn new(
        root_allocator: Arc<dyn BufferAllocator>,
        controller: Arc<dyn Controller>,
        connection_pool: Arc<dyn DataConnectionPool>,
        schema_factory: Arc<dyn SchemaFactory>,
        endpoint: NodeEndpoint,
    ) -> Self {
        Self {
            root_allocator,
            controller,
            connection_pool,
            metrics: RuntimeProfile::new("Metrics"),
            system_options: Arc::new(SystemOptionManager::new()),
            schema_factory,
            endpoint,
        }
    }

    /// Build an environment whose root allocator is bounded by the configured process limit.
    pub fn from_config(
        controller: Arc<dyn Controller>,
        connection_pool: Arc<dyn DataConnectionPool>,
        schema_factory: Arc<dyn SchemaFactory>,
        endpoint: NodeEndpoint,
    ) -> Self {
        let root = MemTracker::new_root("process", root_limit_bytes());
        Self::new(root, controller, connection_pool, schema_factory, endpoint)
    }

    pub fn with_system_options(mut self, options: Arc<dyn OptionManager>) -> Self {
        self.system_options = options;
        self
    }

    pub fn root_allocator(&self) -> &Arc<dyn BufferAllocator> {
        &self.root_allocator
    }

    pub fn controller(&self) -> &Arc<dyn Controller> {
        &self.controller
    }

    pub fn connection_pool(&self) -> &Arc<dyn DataConnectionPool> {
        &self.connection_pool
    }

    /// Process-level counters such as `FragmentsStarted`.
    pub fn metrics(&self) -> &RuntimeProfile {
        &self.metrics
    }

    pub fn system_options(&self) -> &Arc<dyn OptionManager> {
        &self.system_options
    }

    pub fn schema_factory(&self) -> &Arc<dyn SchemaFactory> {
        &self.schema_factory
    }

    pub fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }
}
