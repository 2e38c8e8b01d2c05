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
//! Error taxonomy of the fragment execution core.

use thiserror::Error;

pub type FragmentResult<T> = std::result::Result<T, FragmentError>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FragmentError {
    /// Construction of a fragment context could not complete.
    #[error("setup failure: {0}")]
    Setup(String),

    /// An allocation exceeded one of the budgets on its path to the root.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Failure raised by an operator while running the fragment.
    #[error("execution failure: {0}")]
    Execution(String),

    /// Releasing an owned resource failed during teardown.
    #[error("failed to release {resource}: {message}")]
    Release { resource: String, message: String },

    #[error("memory leak in allocator {label}: {bytes} bytes outstanding")]
    MemoryLeak { label: String, bytes: i64 },

    #[error("{0} is closed")]
    Closed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// First recorded failure with every later one attached.
    #[error("{primary} ({} suppressed)", .suppressed.len())]
    Combined {
        primary: Box<FragmentError>,
        suppressed: Vec<FragmentError>,
    },
}

impl FragmentError {
    pub fn setup<S: Into<String>>(msg: S) -> Self {
        Self::Setup(msg.into())
    }

    pub fn out_of_memory<S: Into<String>>(msg: S) -> Self {
        Self::OutOfMemory(msg.into())
    }

    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn execution<S: Into<String>>(msg: S) -> Self {
        Self::Execution(msg.into())
    }

    pub fn release<R: Into<String>, S: Into<String>>(resource: R, msg: S) -> Self {
        Self::Release {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    pub fn closed<S: Into<String>>(what: S) -> Self {
        Self::Closed(what.into())
    }

    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Attach suppressed failures to `primary`. Without any the primary is returned as-is.
    pub fn with_suppressed(primary: FragmentError, suppressed: Vec<FragmentError>) -> Self {
        if suppressed.is_empty() {
            return primary;
        }
        Self::Combined {
            primary: Box::new(primary),
            suppressed,
        }
    }

    pub fn primary(&self) -> &FragmentError {
        match self {
            Self::Combined { primary, .. } => primary.as_ref(),
            other => other,
        }
    }

    pub fn suppressed(&self) -> &[FragmentError] {
        match self {
            Self::Combined { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self.primary(), Self::OutOfMemory(_))
    }
}
