// src/instance.rs
//! Explicit lifecycle for configured upstreams: `InstanceHandle::start`
//! wires a relay and a poller for one `[[instance]]`, `stop` cancels the
//! poll timer. Relay sessions already handed to clients are not tracked
//! here beyond their counters and run to completion on their own.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use crate::config::{InstanceConfig, ProxyConfig};
use crate::metadata::{MetadataPoller, PollerHandle, PollerSnapshot, TalkerRecord};
use crate::relay::{self, RelayStats, StreamRelay};

pub const API_PREFIX: &str = "/api/sdrtrunk_proxy";
/// Stream-only alias kept for players configured with the short URL.
pub const LEGACY_PREFIX: &str = "/sdrtrunk_proxy";

/// Shared knobs and HTTP clients used to start instances.
#[derive(Clone)]
pub struct InstanceOptions {
    pub poll_interval: Duration,
    pub metadata_timeout: Duration,
    pub chunk_size: usize,
    pub default_content_type: Option<String>,
    pub metadata_client: reqwest::Client,
    pub stream_client: reqwest::Client,
}

impl InstanceOptions {
    pub fn from_config(cfg: &ProxyConfig) -> anyhow::Result<Self> {
        let stream_client =
            relay::stream_client(cfg.connect_timeout()).context("building stream http client")?;
        let metadata_client = reqwest::Client::builder()
            .build()
            .context("building metadata http client")?;
        Ok(Self {
            poll_interval: cfg.poll_interval(),
            metadata_timeout: cfg.metadata_timeout(),
            chunk_size: cfg.chunk_size,
            default_content_type: cfg.default_content_type.clone(),
            metadata_client,
            stream_client,
        })
    }
}

pub struct InstanceHandle {
    id: String,
    name: String,
    metadata_url: String,
    relay: StreamRelay,
    poller: Arc<MetadataPoller>,
    timer: Mutex<Option<PollerHandle>>,
}

impl InstanceHandle {
    /// Build the relay and poller; the first poll completes before this returns.
    pub async fn start(cfg: &InstanceConfig, opts: &InstanceOptions) -> Self {
        let id = cfg.id();
        let stream_url = cfg.stream_url.trim();
        let metadata_url = cfg.metadata_url.trim();
        let relay = StreamRelay::new(&cfg.name, stream_url, opts.stream_client.clone())
            .with_chunk_size(opts.chunk_size)
            .with_default_content_type(opts.default_content_type.as_deref());
        let poller = Arc::new(MetadataPoller::from_url(
            &cfg.name,
            metadata_url,
            opts.metadata_client.clone(),
            opts.metadata_timeout,
        ));
        let timer = Arc::clone(&poller).start(opts.poll_interval).await;

        info!(
            instance = %cfg.name,
            id = %id,
            stream = %stream_url,
            metadata = %metadata_url,
            "instance started"
        );

        Self {
            id,
            name: cfg.name.clone(),
            metadata_url: metadata_url.to_string(),
            relay,
            poller,
            timer: Mutex::new(Some(timer)),
        }
    }

    /// Cancel the poll timer. Idempotent.
    pub fn stop(&self) {
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            timer.stop();
            info!(instance = %self.name, id = %self.id, "instance stopped");
        }
    }

    pub fn is_polling(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(PollerHandle::is_running)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream_url(&self) -> &str {
        self.relay.stream_url()
    }

    pub fn metadata_url(&self) -> &str {
        &self.metadata_url
    }

    pub fn relay(&self) -> &StreamRelay {
        &self.relay
    }

    pub fn relay_stats(&self) -> Arc<RelayStats> {
        self.relay.stats()
    }

    pub fn poller(&self) -> &Arc<MetadataPoller> {
        &self.poller
    }

    /// Synchronous accessor for in-process readers; idle before the first record.
    pub fn current(&self) -> TalkerRecord {
        self.poller.current_or_idle()
    }

    pub fn snapshot(&self) -> Arc<PollerSnapshot> {
        self.poller.snapshot()
    }

    pub fn stream_path(&self) -> String {
        format!("{API_PREFIX}/{}/stream", self.id)
    }

    pub fn metadata_path(&self) -> String {
        format!("{API_PREFIX}/{}/metadata", self.id)
    }
}

impl Drop for InstanceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn check_unique(
    map: &BTreeMap<String, Arc<InstanceHandle>>,
    id: &str,
    stream_url: &str,
) -> Result<(), RegistryError> {
    if map.contains_key(id) {
        return Err(RegistryError::DuplicateId(id.to_string()));
    }
    if map.values().any(|h| h.stream_url() == stream_url) {
        return Err(RegistryError::DuplicateStream(stream_url.to_string()));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("instance id '{0}' is already configured")]
    DuplicateId(String),
    #[error("stream_url '{0}' is already configured")]
    DuplicateStream(String),
}

/// Running instances keyed by id.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<BTreeMap<String, Arc<InstanceHandle>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start every configured instance.
    pub async fn start_all(cfg: &ProxyConfig) -> anyhow::Result<Self> {
        let opts = InstanceOptions::from_config(cfg)?;
        let registry = Self::new();
        for inst in &cfg.instances {
            registry
                .insert(inst, &opts)
                .await
                .with_context(|| format!("starting instance '{}'", inst.name))?;
        }
        Ok(registry)
    }

    /// Start and register an instance. One instance per id and per stream URL.
    pub async fn insert(
        &self,
        cfg: &InstanceConfig,
        opts: &InstanceOptions,
    ) -> Result<Arc<InstanceHandle>, RegistryError> {
        let id = cfg.id();
        {
            let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            check_unique(&map, &id, cfg.stream_url.trim())?;
        }

        let handle = Arc::new(InstanceHandle::start(cfg, opts).await);

        // Another insert may have won while the first poll ran; check and
        // insert under one guard. A losing handle stops its timer on drop.
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        check_unique(&map, &id, handle.stream_url())?;
        map.insert(id, Arc::clone(&handle));
        Ok(handle)
    }

    /// Unregister and stop polling. Streams already being relayed keep going.
    pub fn remove(&self, id: &str) -> Option<Arc<InstanceHandle>> {
        let removed = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(handle) = &removed {
            handle.stop();
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<InstanceHandle>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<InstanceHandle>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every instance and clear the registry.
    pub fn shutdown(&self) {
        let drained: Vec<_> = {
            let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *map).into_values().collect()
        };
        for handle in drained {
            handle.stop();
        }
    }
}
