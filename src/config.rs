// src/config.rs
//! Proxy configuration: one `[[instance]]` per upstream SDRTrunk/Icecast
//! server plus shared timing knobs.
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_CONFIG_PATH: &str = "SDRTRUNK_PROXY_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/proxy.toml";

pub const ENV_NAME: &str = "SDRTRUNK_NAME";
pub const ENV_STREAM_URL: &str = "SDRTRUNK_STREAM_URL";
pub const ENV_METADATA_URL: &str = "SDRTRUNK_METADATA_URL";

pub const DEFAULT_NAME: &str = "SDRTrunk";

fn default_poll_interval_secs() -> u64 {
    2
}
fn default_metadata_timeout_secs() -> u64 {
    10
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_chunk_size() -> usize {
    crate::relay::DEFAULT_CHUNK_SIZE
}
fn default_content_type() -> Option<String> {
    Some(crate::relay::DEFAULT_CONTENT_TYPE.to_string())
}
fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// URL path segment; derived from `name` when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub stream_url: String,
    /// Empty means "no metadata": the talker stays idle.
    #[serde(default)]
    pub metadata_url: String,
}

impl InstanceConfig {
    pub fn new(name: &str, stream_url: &str, metadata_url: &str) -> Self {
        Self {
            name: name.to_string(),
            id: None,
            stream_url: stream_url.to_string(),
            metadata_url: metadata_url.to_string(),
        }
    }

    pub fn id(&self) -> String {
        match self.id.as_deref() {
            Some(id) if !id.trim().is_empty() => slugify(id),
            _ => slugify(&self.name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Content type sent when the upstream declares none; "" disables it.
    #[serde(default = "default_content_type")]
    pub default_content_type: Option<String>,
    #[serde(default, rename = "instance")]
    pub instances: Vec<InstanceConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            metadata_timeout_secs: default_metadata_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            chunk_size: default_chunk_size(),
            default_content_type: default_content_type(),
            instances: Vec::new(),
        }
    }
}

impl ProxyConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: ProxyConfig = toml::from_str(s).context("parsing proxy config toml")?;
        cfg.validated()
    }

    /// Fill defaults for zero values, resolve ids and reject duplicates.
    pub fn validated(mut self) -> Result<Self> {
        if self.poll_interval_secs == 0 {
            self.poll_interval_secs = default_poll_interval_secs();
        }
        if self.metadata_timeout_secs == 0 {
            self.metadata_timeout_secs = default_metadata_timeout_secs();
        }
        if self.connect_timeout_secs == 0 {
            self.connect_timeout_secs = default_connect_timeout_secs();
        }
        if self.chunk_size == 0 {
            self.chunk_size = default_chunk_size();
        }
        if self
            .default_content_type
            .as_deref()
            .is_some_and(|ct| ct.trim().is_empty())
        {
            self.default_content_type = None;
        }

        let mut ids = HashSet::new();
        let mut streams = HashSet::new();
        for inst in self.instances.iter_mut() {
            inst.name = inst.name.trim().to_string();
            if inst.name.is_empty() {
                inst.name = default_name();
            }
            inst.stream_url = inst.stream_url.trim().to_string();
            inst.metadata_url = inst.metadata_url.trim().to_string();
            if inst.stream_url.is_empty() {
                bail!("instance '{}' has no stream_url", inst.name);
            }
            let id = inst.id();
            if !ids.insert(id.clone()) {
                bail!("duplicate instance id '{id}'");
            }
            if !streams.insert(inst.stream_url.clone()) {
                bail!("stream_url '{}' is configured twice", inst.stream_url);
            }
            inst.id = Some(id);
        }
        Ok(self)
    }
}

/// Load config from an explicit TOML file.
pub fn load_from(path: &Path) -> Result<ProxyConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading proxy config from {}", path.display()))?;
    ProxyConfig::from_toml_str(&content)
}

/// Single instance described by `SDRTRUNK_*` env vars, if a stream URL is set.
pub fn instance_from_env() -> Option<InstanceConfig> {
    let stream_url = std::env::var(ENV_STREAM_URL).ok()?;
    if stream_url.trim().is_empty() {
        return None;
    }
    let name = std::env::var(ENV_NAME).unwrap_or_else(|_| default_name());
    let metadata_url = std::env::var(ENV_METADATA_URL).unwrap_or_default();
    Some(InstanceConfig::new(&name, &stream_url, &metadata_url))
}

/// Load config using env var + fallbacks:
/// 1) $SDRTRUNK_PROXY_CONFIG
/// 2) config/proxy.toml
/// 3) one instance from $SDRTRUNK_STREAM_URL / $SDRTRUNK_METADATA_URL / $SDRTRUNK_NAME
pub fn load_default() -> Result<ProxyConfig> {
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_from(&pb);
        }
        return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
    }
    let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
    if default_p.exists() {
        return load_from(&default_p);
    }
    let cfg = ProxyConfig {
        instances: instance_from_env().into_iter().collect(),
        ..ProxyConfig::default()
    };
    cfg.validated()
}

/// Lowercase ASCII alphanumerics; every other run of characters becomes one `-`.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("sdrtrunk");
    }
    out
}
