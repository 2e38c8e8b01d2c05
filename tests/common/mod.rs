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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use fragexec::common::error::{FragmentError, FragmentResult};
use fragexec::common::types::{FragmentHandle, NodeEndpoint, QueryId};
use fragexec::fragexec_config;
use fragexec::fragexec_logging;
use fragexec::runtime::deferred_error::Closeable;
use fragexec::runtime::exec_env::ExecEnv;
use fragexec::runtime::fragment_context::{IncomingBuffers, PlanFragment};
use fragexec::runtime::fragment_state::FragmentState;
use fragexec::runtime::mem_tracker::{BufferAllocator, MemTracker};
use fragexec::runtime::schema::{SchemaFactory, SchemaTree, UserConnection, UserSession};
use fragexec::runtime::tunnel::{ControlTunnel, Controller, DataConnectionPool, DataTunnel};

pub const MB: i64 = 1024 * 1024;

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with default settings.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_fragexec.toml");

        let config_content = r#"
log_level = "debug"

[memory]
root_limit_bytes = -1
default_initial_reservation_bytes = 1000000
default_max_reservation_bytes = 20000000000
managed_buffer_default_bytes = 256

[runtime]
apply_fragment_limit = true
"#;

        std::fs::write(&config_path, config_content)?;

        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    /// Initialize logging for tests.
    pub fn init_logging(&self) {
        fragexec_logging::init_with_level("debug");
    }

    /// Load the test configuration.
    pub fn load_config(&self) -> anyhow::Result<&'static fragexec_config::FragExecConfig> {
        fragexec_config::init_from_path(&self.config_path)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create test config")
    }
}

/// Generate a test query ID.
pub fn test_query_id() -> QueryId {
    QueryId::new(1234567890, 9876543210)
}

/// Generate a unique query ID based on test name.
pub fn unique_query_id(test_name: &str) -> QueryId {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    test_name.hash(&mut hasher);
    let hash = hasher.finish();

    QueryId::new(hash as i64, (hash >> 32) as i64)
}

pub fn node(port: u16) -> NodeEndpoint {
    NodeEndpoint::new("127.0.0.1", port, port + 1, port + 2)
}

/// Fragment 1:0 of the test query with a 1MB/10MB budget.
pub fn test_fragment() -> PlanFragment {
    let mut fragment = PlanFragment::new(
        FragmentHandle::new(test_query_id(), 1, 0),
        node(31010),
        node(41010),
    );
    fragment.mem_initial = MB;
    fragment.mem_max = 10 * MB;
    fragment.query_start_time = 1_700_000_000_000;
    fragment.time_zone = "America/Los_Angeles".to_string();
    fragment
}

#[derive(Debug)]
pub struct MockTunnel {
    pub endpoint: NodeEndpoint,
    pub sent: Mutex<Vec<(FragmentHandle, String)>>,
}

impl MockTunnel {
    fn new(endpoint: &NodeEndpoint) -> Self {
        Self {
            endpoint: endpoint.clone(),
            sent: Mutex::new(Vec::new()),
        }
    }
}

impl DataTunnel for MockTunnel {
    fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    fn send_record_batch(
        &self,
        sender: FragmentHandle,
        receiving_major_fragment_id: i32,
        payload: Vec<u8>,
    ) -> FragmentResult<()> {
        self.sent.lock().unwrap().push((
            sender,
            format!("batch:{}:{}", receiving_major_fragment_id, payload.len()),
        ));
        Ok(())
    }
}

impl ControlTunnel for MockTunnel {
    fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    fn send_fragment_status(
        &self,
        handle: FragmentHandle,
        state: FragmentState,
    ) -> FragmentResult<()> {
        self.sent
            .lock()
            .unwrap()
            .push((handle, format!("status:{state}")));
        Ok(())
    }

    fn cancel_fragment(&self, handle: FragmentHandle) -> FragmentResult<()> {
        self.sent
            .lock()
            .unwrap()
            .push((handle, "cancel".to_string()));
        Ok(())
    }
}

/// Connection pool that hands out a fresh tunnel per request and counts requests.
#[derive(Default)]
pub struct MockConnectionPool {
    pub requests: AtomicUsize,
}

impl DataConnectionPool for MockConnectionPool {
    fn tunnel(&self, endpoint: &NodeEndpoint) -> Arc<dyn DataTunnel> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Arc::new(MockTunnel::new(endpoint))
    }
}

/// Controller that hands out a fresh tunnel per request and counts requests.
#[derive(Default)]
pub struct MockController {
    pub requests: AtomicUsize,
}

impl Controller for MockController {
    fn tunnel(&self, endpoint: &NodeEndpoint) -> Arc<dyn ControlTunnel> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Arc::new(MockTunnel::new(endpoint))
    }
}

/// Registers `dfs` with a `tmp` sub-schema, plus a schema named after the session user.
pub struct MockSchemaFactory;

impl SchemaFactory for MockSchemaFactory {
    fn register_schemas(&self, session: &UserSession, root: &mut SchemaTree) -> FragmentResult<()> {
        root.add_sub_schema("dfs").add_sub_schema("tmp").add_table("orders");
        root.add_sub_schema(&session.user);
        Ok(())
    }
}

pub struct MockConnection {
    pub session: UserSession,
}

impl MockConnection {
    pub fn new(user: &str) -> Arc<Self> {
        Arc::new(Self {
            session: UserSession {
                user: user.to_string(),
                ..UserSession::default()
            },
        })
    }
}

impl UserConnection for MockConnection {
    fn session(&self) -> &UserSession {
        &self.session
    }
}

/// Inbound buffers whose release can be made to fail, recording the close order.
pub struct MockIncomingBuffers {
    pub fail_on_close: bool,
    pub closes: AtomicUsize,
}

impl MockIncomingBuffers {
    pub fn new(fail_on_close: bool) -> Arc<Self> {
        Arc::new(Self {
            fail_on_close,
            closes: AtomicUsize::new(0),
        })
    }
}

impl Closeable for MockIncomingBuffers {
    fn close(&self) -> FragmentResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_close {
            return Err(FragmentError::release("incoming buffers", "receiver still attached"));
        }
        Ok(())
    }

    fn resource_name(&self) -> &str {
        "incoming buffers"
    }
}

impl IncomingBuffers for MockIncomingBuffers {
    fn is_done(&self) -> bool {
        true
    }
}

/// Shared services plus handles to the mocks behind them.
pub struct TestEnv {
    pub env: ExecEnv,
    pub root: Arc<MemTracker>,
    pub pool: Arc<MockConnectionPool>,
    pub controller: Arc<MockController>,
}

impl TestEnv {
    pub fn new(root_limit: i64) -> Self {
        let root = MemTracker::new_root("process", root_limit);
        let pool = Arc::new(MockConnectionPool::default());
        let controller = Arc::new(MockController::default());
        let env = ExecEnv::new(
            root.clone(),
            controller.clone(),
            pool.clone(),
            Arc::new(MockSchemaFactory),
            node(31010),
        );
        Self {
            env,
            root,
            pool,
            controller,
        }
    }
}

/// Wait for a condition to become true, with timeout.
pub fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Assert that a result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $message:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $message, e),
        }
    };
}

/// Assert that a result is Err.
#[macro_export]
macro_rules! assert_err {
    ($result:expr) => {
        match $result {
            Ok(value) => panic!("Expected Err, got Ok: {:?}", value),
            Err(e) => e,
        }
    };
}
