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
//! Per-fragment execution context.
//!
//! Responsibilities:
//! - Owns the fragment allocator, scratch buffer pool, inbound buffers and data tunnel cache.
//! - Carries the failure/cancellation signal that workers poll between batches.
//! - Releases every owned resource exactly once in `close()` and reports the combined failure.
//!
//! Key exported interfaces:
//! - Types: `FragmentContext`, `PlanFragment`, `QueryDateTimeInfo`.
//! - Traits: `IncomingBuffers`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::common::config::{
    apply_fragment_limit, default_initial_reservation_bytes, default_max_reservation_bytes,
    managed_buffer_default_bytes,
};
use crate::common::error::{FragmentError, FragmentResult};
use crate::common::logging::{debug, error, info, instrument, warn};
use crate::common::types::{FragmentHandle, NodeEndpoint};
use crate::runtime::buffer_manager::{BufferManager, ManagedBuffer};
use crate::runtime::deferred_error::{Closeable, DeferredError};
use crate::runtime::exec_env::ExecEnv;
use crate::runtime::fragment_state::{FragmentState, FragmentStateCell};
use crate::runtime::fragment_stats::{FRAGMENTS_CANCELED, FRAGMENTS_FAILED, FragmentStats};
use crate::runtime::function_registry::FunctionRegistry;
use crate::runtime::mem_tracker::BufferAllocator;
use crate::runtime::options::{FragmentOptionManager, OptionManager, parse_option_list};
use crate::runtime::profile::CounterUnit;
use crate::runtime::schema::{SchemaTree, UserConnection};
use crate::runtime::tunnel::{ControlTunnel, DataTunnel, TunnelCache};

/// Definition of one fragment instance as handed out by the scheduler.
#[derive(Clone, Debug)]
pub struct PlanFragment {
    pub handle: FragmentHandle,
    pub mem_initial: i64,
    pub mem_max: i64,
    /// JSON list of option overrides; `None` means no overrides.
    pub options_json: Option<String>,
    /// Node that runs this fragment.
    pub assignment: NodeEndpoint,
    /// Node that accepted the query from the client.
    pub foreman: NodeEndpoint,
    /// Query start, epoch milliseconds.
    pub query_start_time: i64,
    /// IANA time zone name of the submitting session.
    pub time_zone: String,
}

impl PlanFragment {
    /// Fragment with the configured memory defaults, starting now in UTC.
    pub fn new(handle: FragmentHandle, assignment: NodeEndpoint, foreman: NodeEndpoint) -> Self {
        Self {
            handle,
            mem_initial: default_initial_reservation_bytes(),
            mem_max: default_max_reservation_bytes(),
            options_json: None,
            assignment,
            foreman,
            query_start_time: Utc::now().timestamp_millis(),
            time_zone: "UTC".to_string(),
        }
    }
}

/// Query start time and session time zone, used by date/time functions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QueryDateTimeInfo {
    start_time: DateTime<Utc>,
    time_zone: Tz,
}

impl QueryDateTimeInfo {
    pub fn new(start_time_millis: i64, time_zone: &str) -> FragmentResult<Self> {
        let time_zone: Tz = time_zone
            .parse()
            .map_err(|_| FragmentError::setup(format!("unknown time zone {time_zone}")))?;
        let start_time = DateTime::<Utc>::from_timestamp_millis(start_time_millis).ok_or_else(
            || FragmentError::setup(format!("query start time {start_time_millis} out of range")),
        )?;
        Ok(Self {
            start_time,
            time_zone,
        })
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn time_zone(&self) -> Tz {
        self.time_zone
    }

    pub fn local_start_time(&self) -> DateTime<Tz> {
        self.start_time.with_timezone(&self.time_zone)
    }
}

/// Inbound buffers feeding this fragment's receivers, built by the scheduler side.
pub trait IncomingBuffers: Closeable {
    /// True once every expected sender has finished.
    fn is_done(&self) -> bool;
}

/// Execution context of one fragment instance.
///
/// Built once per fragment, shared by the worker threads running its operators, and torn
/// down by a single `close()` after those workers have quiesced.
pub struct FragmentContext {
    fragment: PlanFragment,
    env: ExecEnv,
    connection: Option<Arc<dyn UserConnection>>,
    function_registry: Arc<FunctionRegistry>,
    options: FragmentOptionManager,
    date_time: QueryDateTimeInfo,
    allocator: Arc<dyn BufferAllocator>,
    stats: FragmentStats,
    buffer_manager: BufferManager,
    tunnels: TunnelCache,
    buffers: Mutex<Option<Arc<dyn IncomingBuffers>>>,
    state: FragmentStateCell,
    deferred: DeferredError,
    closed: AtomicBool,
}

impl fmt::Debug for FragmentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentContext")
            .field("handle", &self.fragment.handle)
            .field("state", &self.state.get())
            .field("allocator", &self.allocator)
            .finish()
    }
}

impl FragmentContext {
    /// Build the context. Fails with `Setup` if the option overrides are malformed, the
    /// time zone is unknown or the fragment allocator cannot be obtained.
    pub fn new(
        env: ExecEnv,
        fragment: PlanFragment,
        connection: Option<Arc<dyn UserConnection>>,
        function_registry: Arc<FunctionRegistry>,
    ) -> FragmentResult<Self> {
        let handle = fragment.handle;
        let overrides = parse_option_list(fragment.options_json.as_deref())?;
        let options = FragmentOptionManager::new(Arc::clone(env.system_options()), overrides);
        let date_time =
            QueryDateTimeInfo::new(fragment.query_start_time, &fragment.time_zone)?;

        let owner = format!("Fragment {}", handle.fragment_id_string());
        let allocator = env
            .root_allocator()
            .child_allocator(
                &owner,
                fragment.mem_initial,
                fragment.mem_max,
                apply_fragment_limit(),
            )
            .map_err(|e| {
                FragmentError::setup(format!(
                    "Failure while getting memory allocator for fragment: {e}"
                ))
            })?;

        let stats = FragmentStats::new(
            &handle,
            Arc::clone(&allocator),
            env.metrics(),
            fragment.assignment.clone(),
        );
        let buffer_manager = BufferManager::new(
            owner,
            Arc::clone(&allocator),
            managed_buffer_default_bytes(),
        );
        let tunnels = TunnelCache::new(Arc::clone(env.connection_pool()));

        debug!(
            "fragment {} context created: initial={} max={} root={}",
            handle,
            fragment.mem_initial,
            fragment.mem_max,
            connection.is_some()
        );
        Ok(Self {
            fragment,
            env,
            connection,
            function_registry,
            options,
            date_time,
            allocator,
            stats,
            buffer_manager,
            tunnels,
            buffers: Mutex::new(None),
            state: FragmentStateCell::new(),
            deferred: DeferredError::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Attach the inbound buffers. Called once by the wiring that built them.
    pub fn set_buffers(&self, buffers: Arc<dyn IncomingBuffers>) {
        *self.buffers.lock().unwrap_or_else(|e| e.into_inner()) = Some(buffers);
    }

    pub fn buffers(&self) -> Option<Arc<dyn IncomingBuffers>> {
        self.buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Record `cause` and mark the fragment failed. Never halts execution by itself.
    pub fn fail(&self, cause: FragmentError) {
        error!("Fragment {} received failure: {}", self.fragment.handle, cause);
        if self.state.request(FragmentState::Failed) {
            self.env
                .metrics()
                .counter_add(FRAGMENTS_FAILED, CounterUnit::Unit, 1);
        }
        if let Err(dropped) = self.deferred.add_error(cause) {
            warn!("{}", dropped);
        }
    }

    /// Request cancellation. Dominates an earlier failure.
    pub fn cancel(&self) {
        if self.state.request(FragmentState::Canceled) {
            info!("Fragment {} canceled", self.fragment.handle);
            self.env
                .metrics()
                .counter_add(FRAGMENTS_CANCELED, CounterUnit::Unit, 1);
        }
    }

    pub fn is_failed(&self) -> bool {
        self.state.is_failed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    pub fn state(&self) -> FragmentState {
        self.state.get()
    }

    /// First recorded failure with the later ones attached as suppressed.
    pub fn failure_cause(&self) -> Option<FragmentError> {
        self.deferred.exception()
    }

    pub fn deferred_error(&self) -> &DeferredError {
        &self.deferred
    }

    pub fn allocator(&self) -> &Arc<dyn BufferAllocator> {
        &self.allocator
    }

    /// Spawn an operator allocator under the fragment allocator.
    pub fn new_child_allocator(
        &self,
        owner: &str,
        initial_reservation: i64,
        max_reservation: i64,
        apply_fragment_limit: bool,
    ) -> FragmentResult<Arc<dyn BufferAllocator>> {
        self.allocator.child_allocator(
            owner,
            initial_reservation,
            max_reservation,
            apply_fragment_limit,
        )
    }

    pub fn set_fragment_limit(&self, limit: i64) {
        self.allocator.set_fragment_limit(limit);
    }

    pub fn managed_buffer(&self) -> FragmentResult<ManagedBuffer> {
        self.buffer_manager.managed_buffer()
    }

    pub fn managed_buffer_with_size(&self, size: usize) -> FragmentResult<ManagedBuffer> {
        self.buffer_manager.managed_buffer_with_size(size)
    }

    pub fn replace(&self, old: ManagedBuffer, new_size: usize) -> FragmentResult<ManagedBuffer> {
        self.buffer_manager.replace(old, new_size)
    }

    pub fn managed_buffer_count(&self) -> usize {
        self.buffer_manager.len()
    }

    pub fn data_tunnel(&self, endpoint: &NodeEndpoint) -> Arc<dyn DataTunnel> {
        self.tunnels.data_tunnel(endpoint)
    }

    /// Control tunnels are cached by the controller, not here.
    pub fn control_tunnel(&self, endpoint: &NodeEndpoint) -> Arc<dyn ControlTunnel> {
        self.env.controller().tunnel(endpoint)
    }

    /// Catalog view for the planner. Only the root fragment holds a user connection; on any
    /// other fragment this fails the fragment and returns `None`.
    pub fn root_schema(&self) -> Option<SchemaTree> {
        let Some(connection) = &self.connection else {
            self.fail(FragmentError::unsupported(
                "Schema tree can only be created in root fragment. This is a non-root fragment.",
            ));
            return None;
        };
        let mut root = SchemaTree::root();
        match self
            .env
            .schema_factory()
            .register_schemas(connection.session(), &mut root)
        {
            Ok(()) => Some(root),
            Err(err) => {
                self.fail(err);
                None
            }
        }
    }

    /// Endpoint of the local node.
    pub fn identity(&self) -> &NodeEndpoint {
        self.env.endpoint()
    }

    /// Node the scheduler assigned this fragment to.
    pub fn assignment(&self) -> &NodeEndpoint {
        &self.fragment.assignment
    }

    pub fn foreman_endpoint(&self) -> &NodeEndpoint {
        &self.fragment.foreman
    }

    pub fn handle(&self) -> FragmentHandle {
        self.fragment.handle
    }

    pub fn connection(&self) -> Option<&Arc<dyn UserConnection>> {
        self.connection.as_ref()
    }

    pub fn stats(&self) -> &FragmentStats {
        &self.stats
    }

    pub fn options(&self) -> &dyn OptionManager {
        &self.options
    }

    pub fn function_registry(&self) -> &Arc<FunctionRegistry> {
        &self.function_registry
    }

    pub fn query_date_time_info(&self) -> QueryDateTimeInfo {
        self.date_time
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release the buffer pool, the inbound buffers and the allocator, in that order, then
    /// report the combined failure if anything was recorded. Later calls are no-ops.
    #[instrument(skip_all, fields(fragment = %self.fragment.handle))]
    pub fn close(&self) -> FragmentResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("closing in state {}", self.state.get());
        self.deferred.suppressing_close(Some(&self.buffer_manager));
        let buffers = self
            .buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.deferred.suppressing_close(buffers.as_deref());
        self.deferred.suppressing_close(Some(self.allocator.as_ref()));
        self.deferred.close()
    }
}
