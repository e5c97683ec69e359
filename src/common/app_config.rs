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
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<TabletloadConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static TabletloadConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = TabletloadConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static TabletloadConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let cfg = match config_path_from_env_or_default() {
        Some(path) => TabletloadConfig::load_from_file(&path)?,
        None => TabletloadConfig::default(),
    };
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static TabletloadConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("TABLETLOAD_CONFIG") {
        if !p.trim().is_empty() {
            return Some(PathBuf::from(p));
        }
    }

    let candidate = PathBuf::from("tabletload.toml");
    if candidate.exists() {
        return Some(candidate);
    }
    None
}

#[derive(Clone, Deserialize)]
pub struct TabletloadConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "tabletload=debug,h2=off,hyper=off,tonic=off"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub sink: SinkConfig,

    #[serde(default)]
    pub client: ClientConfig,
}

impl TabletloadConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: TabletloadConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }
}

impl Default for TabletloadConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            sink: SinkConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct SinkConfig {
    /// Upper bound on accumulated bytes per node channel batch; a batch is
    /// sealed once it crosses this even when the row cap is not reached, so
    /// one wide-row batch cannot exceed the receiver's message limit.
    #[serde(default = "default_sink_max_batch_bytes")]
    pub max_batch_bytes: usize,
    #[serde(default = "default_load_channel_timeout_s")]
    pub load_channel_timeout_s: i64,
    #[serde(default = "default_buffer_mem_limit_bytes")]
    pub buffer_mem_limit_bytes: i64,
    #[serde(default = "default_buffer_size_limit")]
    pub buffer_size_limit: usize,
}

fn default_sink_max_batch_bytes() -> usize {
    64 * 1024 * 1024
}
fn default_load_channel_timeout_s() -> i64 {
    600
}
fn default_buffer_mem_limit_bytes() -> i64 {
    64 * 1024 * 1024
}
fn default_buffer_size_limit() -> usize {
    1024
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            max_batch_bytes: default_sink_max_batch_bytes(),
            load_channel_timeout_s: default_load_channel_timeout_s(),
            buffer_mem_limit_bytes: default_buffer_mem_limit_bytes(),
            buffer_size_limit: default_buffer_size_limit(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: i32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_rpc_timeout_ms() -> i32 {
    60_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_io_threads() -> usize {
    4
}
fn default_max_message_bytes() -> usize {
    64 * 1024 * 1024
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: default_rpc_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_threads: default_io_threads(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}
