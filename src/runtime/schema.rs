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
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::common::error::FragmentResult;

/// Client session state of the query submitter.
#[derive(Clone, Debug, Default)]
pub struct UserSession {
    pub user: String,
    pub default_schema: Option<String>,
    pub properties: HashMap<String, String>,
}

/// Connection to the client that submitted the query. Only the root fragment holds one.
pub trait UserConnection: Send + Sync {
    fn session(&self) -> &UserSession;
}

/// Catalog view handed to the planner: nested schemas with table names.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SchemaTree {
    name: String,
    tables: BTreeSet<String>,
    sub_schemas: BTreeMap<String, SchemaTree>,
}

impl SchemaTree {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get or create the direct sub-schema `name`.
    pub fn add_sub_schema(&mut self, name: &str) -> &mut SchemaTree {
        self.sub_schemas
            .entry(name.to_string())
            .or_insert_with(|| SchemaTree {
                name: name.to_string(),
                ..SchemaTree::default()
            })
    }

    pub fn add_table(&mut self, table: impl Into<String>) {
        self.tables.insert(table.into());
    }

    /// Resolve a dotted path such as `dfs.tmp`.
    pub fn sub_schema(&self, path: &str) -> Option<&SchemaTree> {
        path.split('.')
            .try_fold(self, |schema, part| schema.sub_schemas.get(part))
    }

    pub fn sub_schema_names(&self) -> impl Iterator<Item = &str> {
        self.sub_schemas.keys().map(String::as_str)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(String::as_str)
    }
}

/// Storage-side source of schemas visible to a user session.
pub trait SchemaFactory: Send + Sync {
    fn register_schemas(&self, session: &UserSession, root: &mut SchemaTree) -> FragmentResult<()>;
}
