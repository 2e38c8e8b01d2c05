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
use crate::common::app_config::config as fragexec_app_config;

pub(crate) fn managed_buffer_default_bytes() -> usize {
    fragexec_app_config()
        .ok()
        .map(|c| c.memory.managed_buffer_default_bytes)
        .unwrap_or(256)
}

pub(crate) fn apply_fragment_limit() -> bool {
    fragexec_app_config()
        .ok()
        .map(|c| c.runtime.apply_fragment_limit)
        .unwrap_or(true)
}

pub fn root_limit_bytes() -> i64 {
    fragexec_app_config()
        .ok()
        .map(|c| c.memory.root_limit_bytes)
        .unwrap_or(-1)
}

pub fn default_initial_reservation_bytes() -> i64 {
    fragexec_app_config()
        .ok()
        .map(|c| c.memory.default_initial_reservation_bytes)
        .unwrap_or(1_000_000)
}

pub fn default_max_reservation_bytes() -> i64 {
    fragexec_app_config()
        .ok()
        .map(|c| c.memory.default_max_reservation_bytes)
        .unwrap_or(20_000_000_000)
}
