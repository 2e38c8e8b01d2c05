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
//! Integration tests for the fragment execution context.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::common::{
    MB, MockConnection, MockIncomingBuffers, TestConfig, TestEnv, node, test_fragment,
};
use fragexec::common::error::FragmentError;
use fragexec::runtime::fragment_context::{FragmentContext, IncomingBuffers};
use fragexec::runtime::fragment_state::FragmentState;
use fragexec::runtime::fragment_stats::{FRAGMENTS_CANCELED, FRAGMENTS_FAILED, FRAGMENTS_STARTED};
use fragexec::runtime::function_registry::{FunctionRegistry, FunctionSignature};
use fragexec::runtime::mem_tracker::BufferAllocator;
use fragexec::runtime::options::{OptionManager, OptionScope, OptionValue, SystemOptionManager};
use fragexec::runtime::schema::UserConnection;
use fragexec::runtime::tunnel::{ControlTunnel, DataTunnel};

mod common;

fn registry() -> Arc<FunctionRegistry> {
    Arc::new(FunctionRegistry::new())
}

fn new_context(env: &TestEnv) -> FragmentContext {
    assert_ok!(FragmentContext::new(
        env.env.clone(),
        test_fragment(),
        None,
        registry()
    ))
}

#[test]
fn test_malformed_options_abort_construction() {
    let env = TestEnv::new(-1);
    let mut fragment = test_fragment();
    fragment.options_json = Some("[{\"name\": \"a\"".to_string());

    let err = assert_err!(FragmentContext::new(env.env.clone(), fragment, None, registry()));
    assert!(matches!(err, FragmentError::Setup(_)));
    assert!(err.to_string().contains("plan options"));
    assert_eq!(env.root.current(), 0);
    assert_eq!(env.env.metrics().counter_value(FRAGMENTS_STARTED), None);
}

#[test]
fn test_unobtainable_allocator_aborts_construction() {
    let env = TestEnv::new(MB / 2);
    let err = assert_err!(FragmentContext::new(
        env.env.clone(),
        test_fragment(),
        None,
        registry()
    ));
    assert!(matches!(err, FragmentError::Setup(_)));
    assert!(err.to_string().contains("memory allocator"));
    assert_eq!(env.root.current(), 0);
    assert!(env.root.children().is_empty());
}

#[test]
fn test_construction_charges_initial_reservation_and_counts_start() {
    let env = TestEnv::new(-1);
    let ctx = new_context(&env);
    assert_eq!(env.root.current(), MB);
    assert_eq!(ctx.allocator().label(), "Fragment 1:0");
    assert_eq!(ctx.allocator().max_reservation(), 10 * MB);
    assert_eq!(env.env.metrics().counter_value(FRAGMENTS_STARTED), Some(1));
    assert_eq!(ctx.state(), FragmentState::Ok);

    assert_ok!(ctx.close());
    assert_eq!(env.root.current(), 0);
}

#[test]
fn test_fragment_limit_scenario() {
    let env = TestEnv::new(-1);
    let ctx = new_context(&env);
    ctx.set_fragment_limit(5 * MB);

    let err = assert_err!(ctx.managed_buffer_with_size((6 * MB) as usize));
    assert!(err.is_out_of_memory());
    let buffer = assert_ok!(ctx.managed_buffer_with_size((4 * MB) as usize));
    assert!(buffer.capacity() >= (4 * MB) as usize);
    assert_eq!(ctx.managed_buffer_count(), 1);
    assert!(!ctx.is_failed());

    assert_ok!(ctx.close());
}

#[test]
fn test_fail_fail_cancel_scenario() {
    let env = TestEnv::new(-1);
    let ctx = new_context(&env);

    ctx.fail(FragmentError::execution("cause A"));
    ctx.fail(FragmentError::execution("cause B"));
    assert!(ctx.is_failed());
    ctx.cancel();

    assert_eq!(ctx.state(), FragmentState::Canceled);
    assert!(ctx.is_cancelled());
    assert!(!ctx.is_failed());

    let cause = ctx.failure_cause().expect("failure recorded");
    assert_eq!(cause.primary(), &FragmentError::execution("cause A"));
    assert_eq!(cause.suppressed(), &[FragmentError::execution("cause B")]);

    let metrics = env.env.metrics();
    assert_eq!(metrics.counter_value(FRAGMENTS_FAILED), Some(1));
    assert_eq!(metrics.counter_value(FRAGMENTS_CANCELED), Some(1));

    let err = assert_err!(ctx.close());
    assert_eq!(err.primary(), &FragmentError::execution("cause A"));
}

#[test]
fn test_cancel_is_terminal() {
    let env = TestEnv::new(-1);
    let ctx = new_context(&env);
    ctx.cancel();
    ctx.fail(FragmentError::execution("late"));
    ctx.cancel();
    assert_eq!(ctx.state(), FragmentState::Canceled);
    assert_eq!(env.env.metrics().counter_value(FRAGMENTS_CANCELED), Some(1));
    assert_eq!(env.env.metrics().counter_value(FRAGMENTS_FAILED), None);
    // The failure is still recorded for the coordinator.
    assert!(ctx.failure_cause().is_some());
}

#[test]
fn test_replace_swaps_one_for_one() {
    let env = TestEnv::new(-1);
    let ctx = new_context(&env);
    let first = assert_ok!(ctx.managed_buffer());
    let _other = assert_ok!(ctx.managed_buffer());
    assert_eq!(ctx.managed_buffer_count(), 2);

    let grown = assert_ok!(ctx.replace(first.clone(), 4096));
    assert!(grown.capacity() >= 4096);
    assert!(first.is_released());
    assert!(matches!(first.with_data(|d| d.len()), Err(FragmentError::Closed(_))));
    assert_eq!(ctx.managed_buffer_count(), 2);
    assert_eq!(assert_ok!(grown.with_data(|d| d.len())), 4096);

    let err = assert_err!(ctx.replace(first, 8));
    assert!(matches!(err, FragmentError::InvalidArgument(_)));

    assert_ok!(ctx.close());
    assert!(grown.is_released());
    assert!(matches!(ctx.managed_buffer(), Err(FragmentError::Closed(_))));
}

#[test]
fn test_replace_rejects_buffer_of_sibling_fragment() {
    let env = TestEnv::new(-1);
    let ctx = new_context(&env);
    let mut fragment = test_fragment();
    fragment.handle.minor_fragment_id = 1;
    let sibling = assert_ok!(FragmentContext::new(
        env.env.clone(),
        fragment,
        None,
        registry()
    ));

    let own = assert_ok!(ctx.managed_buffer_with_size(100));
    let foreign = assert_ok!(sibling.managed_buffer_with_size(40));
    assert_eq!(own.id(), foreign.id());

    let err = assert_err!(ctx.replace(foreign.clone(), 10));
    assert!(matches!(err, FragmentError::InvalidArgument(_)));
    assert!(!foreign.is_released());
    assert_eq!(ctx.managed_buffer_count(), 1);

    // The own buffer is still force-released, so no leak shows up at teardown.
    assert_ok!(ctx.close());
    assert!(own.is_released());
    assert_ok!(sibling.close());
    assert_eq!(env.root.current(), 0);
}

#[test]
fn test_data_tunnels_are_cached_control_tunnels_are_not() {
    let env = TestEnv::new(-1);
    let ctx = new_context(&env);
    let target = node(32010);

    let a = ctx.data_tunnel(&target);
    let b = ctx.data_tunnel(&target);
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(env.pool.requests.load(Ordering::SeqCst), 1);
    let _ = ctx.data_tunnel(&node(33010));
    assert_eq!(env.pool.requests.load(Ordering::SeqCst), 2);
    assert_ok!(a.send_record_batch(ctx.handle(), 2, vec![0u8; 16]));

    let c = ctx.control_tunnel(ctx.foreman_endpoint());
    let _ = ctx.control_tunnel(ctx.foreman_endpoint());
    assert_eq!(env.controller.requests.load(Ordering::SeqCst), 2);
    assert_eq!(c.endpoint(), &node(41010));
    assert_ok!(c.send_fragment_status(ctx.handle(), ctx.state()));
}

#[test]
fn test_root_schema_requires_user_connection() {
    let env = TestEnv::new(-1);
    let non_root = new_context(&env);
    assert!(non_root.root_schema().is_none());
    assert!(non_root.is_failed());
    assert!(matches!(
        non_root.failure_cause(),
        Some(FragmentError::Unsupported(_))
    ));

    let connection: Arc<dyn UserConnection> = MockConnection::new("alice");
    let mut fragment = test_fragment();
    fragment.handle.major_fragment_id = 0;
    let root = assert_ok!(FragmentContext::new(
        env.env.clone(),
        fragment,
        Some(connection),
        registry()
    ));
    let tree = root.root_schema().expect("root fragment exposes schemas");
    assert!(tree.sub_schema("dfs.tmp").is_some());
    assert!(tree.sub_schema("alice").is_some());
    assert!(!root.is_failed());
    assert_eq!(
        root.connection().map(|c| c.session().user.clone()),
        Some("alice".to_string())
    );
}

#[test]
fn test_close_attempts_every_release() {
    let env = TestEnv::new(-1);
    let ctx = new_context(&env);
    let incoming = MockIncomingBuffers::new(true);
    ctx.set_buffers(incoming.clone());
    assert!(ctx.buffers().is_some_and(|b| b.is_done()));

    let buffer = assert_ok!(ctx.managed_buffer_with_size(1024));
    assert_ok!(ctx.allocator().try_consume(100));
    ctx.fail(FragmentError::execution("operator failed"));

    let err = assert_err!(ctx.close());
    assert_eq!(err.primary(), &FragmentError::execution("operator failed"));
    let suppressed = err.suppressed();
    assert_eq!(suppressed.len(), 2);
    assert!(matches!(suppressed[0], FragmentError::Release { .. }));
    assert!(matches!(
        suppressed[1],
        FragmentError::MemoryLeak { bytes: 100, .. }
    ));

    assert_eq!(incoming.closes.load(Ordering::SeqCst), 1);
    assert!(buffer.is_released());
    assert_eq!(env.root.current(), 0);
    assert!(ctx.deferred_error().is_closed());

    // Failures after teardown are dropped rather than recorded.
    ctx.fail(FragmentError::execution("too late"));
    assert!(ctx.failure_cause().is_none());
    assert_ok!(ctx.close());
}

#[test]
fn test_close_without_buffers_or_failures() {
    let env = TestEnv::new(-1);
    let ctx = new_context(&env);
    assert!(ctx.buffers().is_none());
    assert_ok!(ctx.close());
    assert!(ctx.is_closed());
}

#[test]
fn test_operator_allocators_share_fragment_budget() {
    let env = TestEnv::new(-1);
    let ctx = new_context(&env);
    let scan = assert_ok!(ctx.new_child_allocator("scan", 0, -1, true));
    let agg = assert_ok!(ctx.new_child_allocator("agg", 0, -1, true));

    assert_ok!(scan.try_consume(6 * MB));
    let err = assert_err!(agg.try_consume(5 * MB));
    assert!(err.is_out_of_memory());
    assert_ok!(agg.try_consume(4 * MB));
    assert_eq!(ctx.allocator().current(), 10 * MB);
    assert_eq!(ctx.allocator().children().len(), 2);

    scan.release(6 * MB);
    agg.release(4 * MB);
    drop(scan);
    drop(agg);
    assert_ok!(ctx.close());
}

#[test]
fn test_concurrent_signals_while_workers_poll() {
    let env = TestEnv::new(-1);
    let ctx = new_context(&env);

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let mut batches = 0;
                while !ctx.is_cancelled() && batches < 1_000_000 {
                    batches += 1;
                    std::hint::spin_loop();
                }
            });
        }
        for i in 0..4 {
            let ctx = &ctx;
            s.spawn(move || ctx.fail(FragmentError::execution(format!("worker {i}"))));
        }
        s.spawn(|| ctx.cancel());
    });

    assert_eq!(ctx.state(), FragmentState::Canceled);
    let cause = ctx.failure_cause().expect("failures recorded");
    assert_eq!(cause.suppressed().len(), 3);
    assert!(ctx.close().is_err());
}

#[test]
fn test_options_resolve_overrides_before_system() {
    let env = TestEnv::new(-1);
    let system = Arc::new(SystemOptionManager::new());
    system.set_option(OptionValue::new_long(
        "planner.width.max_per_node",
        8,
        OptionScope::System,
    ));
    system.set_option(OptionValue::new_bool(
        "exec.errors.verbose",
        false,
        OptionScope::System,
    ));
    let exec_env = env.env.clone().with_system_options(system);

    let mut fragment = test_fragment();
    fragment.options_json = Some(
        r#"[{"name": "planner.width.max_per_node", "kind": "LONG", "type": "QUERY", "num_val": 2}]"#
            .to_string(),
    );
    let ctx = assert_ok!(FragmentContext::new(exec_env, fragment, None, registry()));
    assert_eq!(ctx.options().long_option("planner.width.max_per_node"), Some(2));
    assert_eq!(ctx.options().bool_option("exec.errors.verbose"), Some(false));
    assert_eq!(ctx.options().string_option("store.format"), None);
}

#[test]
fn test_accessors_expose_fragment_definition() {
    let env = TestEnv::new(-1);
    let functions = registry();
    functions.register(FunctionSignature::new("concat", &["VARCHAR", "VARCHAR"], "VARCHAR"));
    let mut fragment = test_fragment();
    fragment.assignment = node(35010);
    let ctx = assert_ok!(FragmentContext::new(
        env.env.clone(),
        fragment,
        None,
        functions
    ));

    // The local node comes from the shared services, not from the fragment definition.
    assert_eq!(ctx.identity(), env.env.endpoint());
    assert_eq!(ctx.identity(), &node(31010));
    assert_eq!(ctx.assignment(), &node(35010));
    assert_eq!(ctx.foreman_endpoint(), &node(41010));
    assert_eq!(ctx.handle().fragment_id_string(), "1:0");
    assert!(ctx.connection().is_none());
    assert!(ctx.function_registry().resolve("CONCAT", &["VARCHAR", "VARCHAR"]).is_some());

    let info = ctx.query_date_time_info();
    assert_eq!(info.start_time().timestamp_millis(), 1_700_000_000_000);
    assert_eq!(
        info.local_start_time().to_rfc3339(),
        "2023-11-14T14:13:20-08:00"
    );

    let scan = ctx.stats().new_operator_stats(0, "Scan");
    scan.add_batch(128);
    let _buffer = assert_ok!(ctx.managed_buffer_with_size(2048));
    let profile = ctx.stats().profile();
    assert_eq!(profile.counter_value("MemoryUsed"), Some(2048));
    assert!(profile.get_child("MemTracker").is_some());
    assert!(profile.to_text().contains("Scan (id=0)"));
    assert_eq!(ctx.stats().endpoint(), &node(35010));
}

#[test]
fn test_config_file_drives_defaults() {
    let cfg = TestConfig::new().expect("test config");
    cfg.init_logging();
    let loaded = assert_ok!(cfg.load_config());
    assert_eq!(loaded.memory.managed_buffer_default_bytes, 256);

    let env = TestEnv::new(-1);
    let ctx = new_context(&env);
    let buffer = assert_ok!(ctx.managed_buffer());
    assert_eq!(buffer.capacity(), 256);
    assert_ok!(ctx.close());
}
