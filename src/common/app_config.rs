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

static CONFIG: OnceLock<ChunksortConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static ChunksortConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = ChunksortConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static ChunksortConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = ChunksortConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static ChunksortConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("CHUNKSORT_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("chunksort.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $CHUNKSORT_CONFIG or create ./chunksort.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct ChunksortConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "chunksort=debug,info"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub exec: ExecConfig,
}

impl ChunksortConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: ChunksortConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }
}

impl Default for ChunksortConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            exec: ExecConfig::default(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct ExecConfig {
    /// Maximum row count per in-memory chunk. Sessions can override it with
    /// `QueryOptions::batch_size`.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// How many buffered chunks a top-n sorter accumulates before running an
    /// incremental sort-merge cycle.
    #[serde(default = "default_sorter_buffered_chunks")]
    pub sorter_buffered_chunks: usize,
}

fn default_chunk_size() -> usize {
    4096
}

fn default_sorter_buffered_chunks() -> usize {
    1000
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            sorter_buffered_chunks: default_sorter_buffered_chunks(),
        }
    }
}
