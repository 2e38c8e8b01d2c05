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
use std::sync::RwLock;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FunctionSignature {
    pub name: String,
    pub arg_types: Vec<String>,
    pub return_type: String,
}

impl FunctionSignature {
    pub fn new(name: impl Into<String>, arg_types: &[&str], return_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arg_types: arg_types.iter().map(|s| s.to_string()).collect(),
            return_type: return_type.into(),
        }
    }
}

/// Functions operators may bind to. Names are matched case-insensitively.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, Vec<FunctionSignature>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, signature: FunctionSignature) {
        let mut guard = self.functions.write().unwrap_or_else(|e| e.into_inner());
        let overloads = guard.entry(signature.name.to_lowercase()).or_default();
        if !overloads.contains(&signature) {
            overloads.push(signature);
        }
    }

    pub fn lookup(&self, name: &str) -> Vec<FunctionSignature> {
        self.functions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&name.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    /// Overload of `name` whose argument types match exactly.
    pub fn resolve(&self, name: &str, arg_types: &[&str]) -> Option<FunctionSignature> {
        self.lookup(name)
            .into_iter()
            .find(|sig| sig.arg_types.iter().map(String::as_str).eq(arg_types.iter().copied()))
    }

    pub fn len(&self) -> usize {
        self.functions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
