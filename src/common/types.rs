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

/// 128-bit query identifier, rendered with the Java UUID layout.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct QueryId {
    pub hi: i64,
    pub lo: i64,
}

pub fn format_uuid(hi: i64, lo: i64) -> String {
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        ((hi as u64) >> 32) as u32,
        ((hi as u64) >> 16) as u16,
        (hi as u64) as u16,
        ((lo as u64) >> 48) as u16,
        (lo as u64) & 0x0000_FFFF_FFFF_FFFF
    )
}

impl QueryId {
    pub const fn new(hi: i64, lo: i64) -> Self {
        Self { hi, lo }
    }

    pub fn to_uuid_string(self) -> String {
        format_uuid(self.hi, self.lo)
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_uuid(self.hi, self.lo))
    }
}

/// Names one fragment instance: `(query, major fragment, minor fragment)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct FragmentHandle {
    pub query_id: QueryId,
    pub major_fragment_id: i32,
    pub minor_fragment_id: i32,
}

impl FragmentHandle {
    pub const fn new(query_id: QueryId, major_fragment_id: i32, minor_fragment_id: i32) -> Self {
        Self {
            query_id,
            major_fragment_id,
            minor_fragment_id,
        }
    }

    /// `major:minor`, the short form used in log lines and allocator labels.
    pub fn fragment_id_string(&self) -> String {
        format!("{}:{}", self.major_fragment_id, self.minor_fragment_id)
    }
}

impl fmt::Display for FragmentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.query_id, self.major_fragment_id, self.minor_fragment_id
        )
    }
}

/// Address of one execution node in the cluster.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct NodeEndpoint {
    pub address: String,
    pub user_port: u16,
    pub control_port: u16,
    pub data_port: u16,
}

impl NodeEndpoint {
    pub fn new(address: impl Into<String>, user_port: u16, control_port: u16, data_port: u16) -> Self {
        Self {
            address: address.into(),
            user_port,
            control_port,
            data_port,
        }
    }
}

impl fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.data_port)
    }
}
