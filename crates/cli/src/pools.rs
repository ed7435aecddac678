// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Wirelift Contributors

// Address pools
//
// Named lists of target addresses, kept in one TOML file:
//
//   [pools]
//   lab = ["10.1.2.3", "10.1.2.4"]
//
// The resolver half plugs into the session controller; resolution happens
// at submission time, so edits to the file apply to the next connect.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use wirelift_engine::TargetResolver;

#[derive(Debug, Default, Deserialize)]
struct PoolFile {
    #[serde(default)]
    pools: BTreeMap<String, Vec<String>>,
}

pub struct PoolRegistry {
    path: PathBuf,
}

impl PoolRegistry {
    /// Open the registry at its default location, ~/.config/wirelift/pools.toml
    pub fn open() -> Result<Self> {
        let path = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("wirelift")
            .join("pools.toml");
        Ok(Self { path })
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    fn read(&self) -> Result<PoolFile> {
        if !self.path.exists() {
            return Ok(PoolFile::default());
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", self.path.display()))
    }

    /// All pools with their member lists, sorted by name
    pub fn list(&self) -> Result<Vec<(String, Vec<String>)>> {
        Ok(self.read()?.pools.into_iter().collect())
    }

    pub fn members(&self, name: &str) -> Result<Vec<String>> {
        self.read()?
            .pools
            .remove(name)
            .with_context(|| format!("pool '{}' is not defined in {}", name, self.path.display()))
    }
}

/// TargetResolver backed by the pools file
pub struct FilePoolResolver {
    registry: PoolRegistry,
}

impl FilePoolResolver {
    pub fn new(registry: PoolRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl TargetResolver for FilePoolResolver {
    async fn resolve_pool(&self, name: &str) -> wirelift_common::Result<Vec<String>> {
        self.registry
            .members(name)
            .map_err(|e| wirelift_common::Error::Target(e.to_string()))
    }
}
