//! Cache manager that intercepts resource requests and orchestrates cache and network.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use url::Url;

use super::storage::CacheStorage;
use super::traits::{resource_key, CacheResult, Resource};
use crate::config::CacheConfig;
use crate::net::Network;

/// App-shell document served for any request that cannot be satisfied offline.
const ROOT_DOCUMENT: &str = "index.html";

/// Lifecycle of one cache manager version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  /// Installed but waiting for an explicit activate
  Installed,
  Activating,
  /// Intercepting every fetch
  Activated,
  /// Install failed; this version never takes control
  Redundant,
}

/// Offline cache manager.
///
/// Sits between the app and the network: the dynamic events resource is served
/// network-first, everything else cache-first with the app-shell root document
/// as the last-resort offline page.
pub struct CacheManager<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  base: Url,
  generation: String,
  precache: Vec<String>,
  dynamic: String,
  skip_waiting: bool,
  state: WorkerState,
  /// Fire-and-forget cache refreshes still running
  pending: Mutex<JoinSet<()>>,
}

impl<S: CacheStorage, N: Network> CacheManager<S, N> {
  pub fn new(storage: S, network: Arc<N>, base: Url, config: &CacheConfig) -> Self {
    Self {
      storage: Arc::new(storage),
      network,
      base,
      generation: config.name.clone(),
      precache: config.precache.clone(),
      dynamic: config.dynamic.clone(),
      skip_waiting: config.skip_waiting,
      state: WorkerState::Parsed,
      pending: Mutex::new(JoinSet::new()),
    }
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  pub fn generation(&self) -> &str {
    &self.generation
  }

  #[allow(dead_code)]
  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Resolve a resource name against the app base URL.
  pub fn resolve(&self, request: &str) -> Result<Url> {
    self
      .base
      .join(request)
      .map_err(|e| eyre!("Invalid resource '{}': {}", request, e))
  }

  /// Bring the manager up: resume a generation installed in an earlier session,
  /// otherwise install it now.
  pub async fn start(&mut self) -> Result<()> {
    if self.storage.has_generation(&self.generation)? {
      tracing::info!(generation = %self.generation, "resuming installed cache generation");
      self.state = WorkerState::Activated;
      return Ok(());
    }
    self.install().await
  }

  /// Populate the cache generation with the app shell.
  ///
  /// All or nothing: a transport failure or non-2xx response for any manifest entry
  /// fails the install and nothing is stored.
  pub async fn install(&mut self) -> Result<()> {
    self.state = WorkerState::Installing;
    tracing::info!(generation = %self.generation, entries = self.precache.len(), "installing");

    match self.precache_shell().await {
      Ok(entries) => {
        if let Err(e) = self.storage.put_all(&self.generation, &entries) {
          self.state = WorkerState::Redundant;
          return Err(e);
        }
      }
      Err(e) => {
        tracing::warn!(error = %e, "install failed");
        self.state = WorkerState::Redundant;
        return Err(e);
      }
    }

    self.state = WorkerState::Installed;

    if self.skip_waiting {
      self.activate()?;
    }
    Ok(())
  }

  async fn precache_shell(&self) -> Result<Vec<(String, Resource)>> {
    let urls = self
      .precache
      .iter()
      .map(|name| self.resolve(name))
      .collect::<Result<Vec<_>>>()?;

    let fetches = urls.iter().map(|url| {
      let network = Arc::clone(&self.network);
      async move {
        let resource = network.fetch(url).await?;
        if !resource.is_ok() {
          return Err(eyre!(
            "Failed to precache {}: HTTP {}",
            url,
            resource.status
          ));
        }
        Ok((resource_key(url), resource))
      }
    });

    futures::future::try_join_all(fetches).await
  }

  /// Take control of all clients. Only valid once installed.
  pub fn activate(&mut self) -> Result<()> {
    match self.state {
      WorkerState::Installed => {}
      WorkerState::Activated => return Ok(()),
      other => return Err(eyre!("Cannot activate from state {:?}", other)),
    }

    self.state = WorkerState::Activating;
    tracing::debug!(generation = %self.generation, "claiming clients");
    self.state = WorkerState::Activated;
    tracing::info!(generation = %self.generation, "activated, claimed clients");
    Ok(())
  }

  fn is_dynamic(&self, url: &Url) -> bool {
    url.path().ends_with(&self.dynamic)
  }

  /// Handle one outgoing request.
  ///
  /// Until activated, requests go straight to the network.
  pub async fn fetch(&self, request: &str) -> Result<CacheResult<Resource>> {
    let url = self.resolve(request)?;

    if self.state != WorkerState::Activated {
      let resource = self.network.fetch(&url).await?;
      return Ok(CacheResult::from_network(resource));
    }

    if self.is_dynamic(&url) {
      self.network_first(&url).await
    } else {
      self.cache_first(&url).await
    }
  }

  /// Network first, refreshing the cache in the background; stale copy on failure.
  async fn network_first(&self, url: &Url) -> Result<CacheResult<Resource>> {
    let key = resource_key(url);

    match self.network.fetch(url).await {
      Ok(resource) => {
        if resource.is_ok() {
          self.refresh_in_background(key, resource.clone());
        }
        Ok(CacheResult::from_network(resource))
      }
      Err(network_err) => {
        tracing::debug!(%url, error = %network_err, "network failed, trying cache");

        let canonical = resource_key(&self.resolve(&self.dynamic)?);
        let mut cached = self.storage.get(&self.generation, &key)?;
        if cached.is_none() && canonical != key {
          cached = self.storage.get(&self.generation, &canonical)?;
        }

        match cached {
          Some(hit) => Ok(CacheResult::offline(hit.resource, hit.cached_at)),
          None => Err(eyre!("{} is unavailable offline: {}", url, network_err)),
        }
      }
    }
  }

  /// Cache first, then network, then the app-shell root document.
  async fn cache_first(&self, url: &Url) -> Result<CacheResult<Resource>> {
    let key = resource_key(url);

    if let Some(hit) = self.storage.get(&self.generation, &key)? {
      return Ok(CacheResult::from_cache(hit.resource, hit.cached_at));
    }

    match self.network.fetch(url).await {
      Ok(resource) => Ok(CacheResult::from_network(resource)),
      Err(network_err) => {
        let root = resource_key(&self.resolve(ROOT_DOCUMENT)?);
        match self.storage.get(&self.generation, &root)? {
          Some(hit) => {
            tracing::debug!(%url, "serving app-shell root offline");
            Ok(CacheResult::fallback(hit.resource, hit.cached_at))
          }
          None => Err(eyre!("{} is unavailable offline: {}", url, network_err)),
        }
      }
    }
  }

  fn refresh_in_background(&self, key: String, resource: Resource) {
    let storage = Arc::clone(&self.storage);
    let generation = self.generation.clone();

    let Ok(mut pending) = self.pending.lock() else {
      tracing::warn!("pending refresh set poisoned, skipping cache refresh");
      return;
    };
    // Drop finished refreshes so the set only holds running ones
    while pending.try_join_next().is_some() {}
    pending.spawn_blocking(move || {
      if let Err(e) = storage.put(&generation, &key, &resource) {
        tracing::warn!(%key, error = %e, "cache refresh failed");
      }
    });
  }

  /// Wait for all background cache refreshes to finish.
  pub async fn wait_until_idle(&self) {
    let mut pending = match self.pending.lock() {
      Ok(mut guard) => std::mem::take(&mut *guard),
      Err(_) => return,
    };
    while pending.join_next().await.is_some() {}
  }

  #[cfg(test)]
  fn pending_refreshes(&self) -> usize {
    self.pending.lock().map(|p| p.len()).unwrap_or(0)
  }
}
