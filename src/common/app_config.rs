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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<FragExecConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static FragExecConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = FragExecConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    CONFIG
        .get()
        .ok_or_else(|| anyhow!("config was not installed: {}", path.display()))
}

pub fn init_from_env_or_default() -> Result<&'static FragExecConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    init_from_path(path)
}

pub fn config() -> Result<&'static FragExecConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("FRAGEXEC_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("fragexec.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $FRAGEXEC_CONFIG or create ./fragexec.toml"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct FragExecConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "fragexec=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl FragExecConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: FragExecConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }

    /// Filter expression handed to the tracing subscriber.
    pub fn effective_log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(&self.log_level)
    }
}

impl Default for FragExecConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            memory: MemoryConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct MemoryConfig {
    /// Budget of the process-wide root allocator. Negative means unlimited.
    #[serde(default = "default_root_limit_bytes")]
    pub root_limit_bytes: i64,
    #[serde(default = "default_initial_reservation_bytes")]
    pub default_initial_reservation_bytes: i64,
    #[serde(default = "default_max_reservation_bytes")]
    pub default_max_reservation_bytes: i64,
    #[serde(default = "default_managed_buffer_bytes")]
    pub managed_buffer_default_bytes: usize,
}

fn default_root_limit_bytes() -> i64 {
    -1
}

fn default_initial_reservation_bytes() -> i64 {
    1_000_000
}

fn default_max_reservation_bytes() -> i64 {
    20_000_000_000
}

fn default_managed_buffer_bytes() -> usize {
    256
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            root_limit_bytes: default_root_limit_bytes(),
            default_initial_reservation_bytes: default_initial_reservation_bytes(),
            default_max_reservation_bytes: default_max_reservation_bytes(),
            managed_buffer_default_bytes: default_managed_buffer_bytes(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Whether the fragment allocator is bound by the coordinator-managed fragment limit.
    #[serde(default = "default_apply_fragment_limit")]
    pub apply_fragment_limit: bool,
}

fn default_apply_fragment_limit() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            apply_fragment_limit: default_apply_fragment_limit(),
        }
    }
}
