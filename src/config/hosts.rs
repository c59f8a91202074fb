use crate::error::EngineResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Connection target for a managed host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_port() -> u16 {
    22
}

impl HostEntry {
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            name: None,
            address: address.into(),
            port,
            tags: vec![],
        }
    }
}

/// Read-only lookup of host connection parameters.
///
/// The inventory itself lives outside the engine; this is the only view of it
/// the engine needs.
pub trait HostResolver: Send + Sync {
    fn resolve(&self, host_id: &str) -> Option<HostEntry>;
}

/// Host file format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostsFile {
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

/// Static host table, loaded from `hosts.toml`
#[derive(Debug, Clone, Default)]
pub struct HostTable {
    hosts: HashMap<String, HostEntry>,
}

impl HostTable {
    pub fn load(config_dir: &Path) -> EngineResult<Self> {
        let path = config_dir.join("hosts.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        let file: HostsFile = toml::from_str(&content)?;
        Ok(Self::from_entries(file.hosts))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = HostEntry>) -> Self {
        Self {
            hosts: entries.into_iter().map(|h| (h.id.clone(), h)).collect(),
        }
    }

    pub fn list(&self) -> Vec<HostEntry> {
        let mut hosts: Vec<_> = self.hosts.values().cloned().collect();
        hosts.sort_by(|a, b| a.id.cmp(&b.id));
        hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl HostResolver for HostTable {
    fn resolve(&self, host_id: &str) -> Option<HostEntry> {
        self.hosts.get(host_id).cloned()
    }
}
