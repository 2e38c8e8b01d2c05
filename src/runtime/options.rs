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
//! Execution options visible to one fragment.
//!
//! A plan fragment may carry a JSON list of option overrides. Lookups resolve against
//! those overrides first and fall back to the node-wide option manager.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::common::error::{FragmentError, FragmentResult};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptionKind {
    Bool,
    Long,
    Double,
    String,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptionScope {
    #[default]
    System,
    Session,
    Query,
}

/// One named option. Exactly the field matching `kind` carries the value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptionValue {
    pub name: String,
    pub kind: OptionKind,
    #[serde(rename = "type", default)]
    pub scope: OptionScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bool_val: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_val: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub float_val: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_val: Option<String>,
}

impl OptionValue {
    fn empty(name: impl Into<String>, kind: OptionKind, scope: OptionScope) -> Self {
        Self {
            name: name.into(),
            kind,
            scope,
            bool_val: None,
            num_val: None,
            float_val: None,
            string_val: None,
        }
    }

    pub fn new_bool(name: impl Into<String>, value: bool, scope: OptionScope) -> Self {
        Self {
            bool_val: Some(value),
            ..Self::empty(name, OptionKind::Bool, scope)
        }
    }

    pub fn new_long(name: impl Into<String>, value: i64, scope: OptionScope) -> Self {
        Self {
            num_val: Some(value),
            ..Self::empty(name, OptionKind::Long, scope)
        }
    }

    pub fn new_double(name: impl Into<String>, value: f64, scope: OptionScope) -> Self {
        Self {
            float_val: Some(value),
            ..Self::empty(name, OptionKind::Double, scope)
        }
    }

    pub fn new_string(
        name: impl Into<String>,
        value: impl Into<String>,
        scope: OptionScope,
    ) -> Self {
        Self {
            string_val: Some(value.into()),
            ..Self::empty(name, OptionKind::String, scope)
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.bool_val
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.num_val
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.float_val
    }

    pub fn as_str(&self) -> Option<&str> {
        self.string_val.as_deref()
    }

    fn validate(&self) -> FragmentResult<()> {
        let present = match self.kind {
            OptionKind::Bool => self.bool_val.is_some(),
            OptionKind::Long => self.num_val.is_some(),
            OptionKind::Double => self.float_val.is_some(),
            OptionKind::String => self.string_val.is_some(),
        };
        if present {
            Ok(())
        } else {
            Err(FragmentError::setup(format!(
                "option {} of kind {:?} carries no value",
                self.name, self.kind
            )))
        }
    }
}

/// Parse the serialized override list of a plan fragment. Absent or blank means no overrides.
pub fn parse_option_list(json: Option<&str>) -> FragmentResult<Vec<OptionValue>> {
    let Some(json) = json.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(Vec::new());
    };
    let list: Vec<OptionValue> = serde_json::from_str(json).map_err(|e| {
        FragmentError::setup(format!("Failure while reading plan options: {e}"))
    })?;
    for option in &list {
        option.validate()?;
    }
    Ok(list)
}

pub trait OptionManager: Send + Sync {
    fn option(&self, name: &str) -> Option<OptionValue>;

    fn bool_option(&self, name: &str) -> Option<bool> {
        self.option(name).and_then(|v| v.as_bool())
    }

    fn long_option(&self, name: &str) -> Option<i64> {
        self.option(name).and_then(|v| v.as_i64())
    }

    fn double_option(&self, name: &str) -> Option<f64> {
        self.option(name).and_then(|v| v.as_f64())
    }

    fn string_option(&self, name: &str) -> Option<String> {
        self.option(name).and_then(|v| v.string_val)
    }
}

/// Node-wide options, mutable at runtime.
#[derive(Debug, Default)]
pub struct SystemOptionManager {
    options: RwLock<HashMap<String, OptionValue>>,
}

impl SystemOptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_option(&self, value: OptionValue) {
        let mut guard = self.options.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(value.name.clone(), value);
    }
}

impl OptionManager for SystemOptionManager {
    fn option(&self, name: &str) -> Option<OptionValue> {
        self.options
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}

/// Fragment overrides layered on a fallback manager.
pub struct FragmentOptionManager {
    fallback: Arc<dyn OptionManager>,
    overrides: HashMap<String, OptionValue>,
}

impl FragmentOptionManager {
    pub fn new(fallback: Arc<dyn OptionManager>, overrides: Vec<OptionValue>) -> Self {
        Self {
            fallback,
            overrides: overrides
                .into_iter()
                .map(|v| (v.name.clone(), v))
                .collect(),
        }
    }

    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }
}

impl OptionManager for FragmentOptionManager {
    fn option(&self, name: &str) -> Option<OptionValue> {
        self.overrides
            .get(name)
            .cloned()
            .or_else(|| self.fallback.option(name))
    }
}
