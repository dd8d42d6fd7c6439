//! Public facade: builds requests for a configured host and hands them to
//! the dispatcher.
//!
//! # Lifecycle
//! An `Engine` is an explicitly constructed value. `build` opens the
//! persistent cache and freeze store under the configured data directory,
//! starts a background watcher on the reachability monitor and, if the
//! network is up and frozen work is waiting, starts a replay right away.
//! `shutdown` (also run on drop) freezes in-flight freezable operations so
//! they survive the process.
//!
//! # Replay
//! Frozen operations are replayed when the reachability monitor goes from
//! unreachable to reachable, once at startup, and on an explicit `thaw`.
//! Replays never overlap; each operation is replayed to completion before
//! the next one starts, so side-effecting writes keep their order.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::PersistentCache;
use crate::config::EngineConfig;
use crate::credential::CredentialHandler;
use crate::dispatcher::{
    Dispatcher, DispatcherParts, OperationId, OperationState, Settings, WeakDispatcher,
};
use crate::error::{EngineError, StoreError};
use crate::freeze::FreezeStore;
use crate::http::HttpMethod;
use crate::observer::Observer;
use crate::reachability::ReachabilityMonitor;
use crate::request::OperationRequest;
use crate::transport::{Transport, UreqTransport};

pub struct EngineBuilder {
    config: EngineConfig,
    transport: Option<Arc<dyn Transport>>,
    credentials: Option<Arc<dyn CredentialHandler>>,
    reachability: Option<ReachabilityMonitor>,
    runtime: Option<Handle>,
    replay_observer: Observer,
}

impl EngineBuilder {
    /// Replace the default `UreqTransport`.
    pub fn transport(mut self, transport: impl Transport) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        self.transport = Some(transport);
        self
    }

    pub fn credential_handler(mut self, handler: impl CredentialHandler) -> Self {
        let handler: Arc<dyn CredentialHandler> = Arc::new(handler);
        self.credentials = Some(handler);
        self
    }

    /// Share a monitor the host platform feeds. Defaults to a fresh
    /// monitor that starts reachable.
    pub fn reachability(mut self, monitor: ReachabilityMonitor) -> Self {
        self.reachability = Some(monitor);
        self
    }

    /// Runtime that runs transfers. Defaults to the current runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Observer attached to every replayed operation.
    pub fn replay_observer(mut self, observer: Observer) -> Self {
        self.replay_observer = observer;
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;
        config.validate()?;

        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| EngineError::Runtime(e.to_string()))?,
        };
        let persistent = if config.cache.enabled {
            Some(PersistentCache::open(
                config.cache_dir(),
                config.cache.max_disk_age(),
            )?)
        } else {
            None
        };
        let freeze = FreezeStore::open(config.frozen_dir())?;
        let reachability = self.reachability.unwrap_or_default();
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(UreqTransport::new()),
        };

        let settings = Settings {
            cache_enabled: config.cache.enabled,
            memory_capacity: config.cache.memory_capacity,
            timeout: config.transfer.timeout(),
            default_expiry: config.cache.default_expiry(),
            max_disk_age: config.cache.max_disk_age(),
            max_auth_attempts: config.transfer.max_auth_attempts,
            max_concurrent: config.transfer.max_concurrent,
        };
        let dispatcher = Dispatcher::new(DispatcherParts {
            transport,
            credentials: self.credentials,
            reachability: reachability.clone(),
            persistent,
            freeze,
            runtime: runtime.clone(),
            settings,
            replay_observer: self.replay_observer,
        });

        let watcher = runtime.spawn(watch_reachability(
            dispatcher.downgrade(),
            reachability.subscribe(),
        ));

        let frozen = dispatcher.frozen_count();
        if frozen > 0 && reachability.is_reachable() {
            info!(frozen, "replaying operations frozen by a previous run");
            let replay = dispatcher.clone();
            runtime.spawn_blocking(move || log_thaw(replay.thaw_blocking()));
        }

        info!(data_dir = %config.data_dir.display(), host = %config.host.name, "engine started");
        Ok(Engine {
            config,
            dispatcher,
            runtime,
            watcher,
        })
    }
}

pub struct Engine {
    config: EngineConfig,
    dispatcher: Dispatcher,
    runtime: Handle,
    watcher: JoinHandle<()>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            transport: None,
            credentials: None,
            reachability: None,
            runtime: None,
            replay_observer: Observer::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// GET `path` on the configured host, with the default headers.
    pub fn request(&self, path: &str) -> OperationRequest {
        self.request_with_url(&self.config.host.url_for(path))
    }

    pub fn request_with_params<I, K, V>(
        &self,
        path: &str,
        params: I,
        method: HttpMethod,
    ) -> OperationRequest
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        let mut request = self.request(path);
        request.method = method;
        for (k, v) in params {
            request.add_param(k, v);
        }
        request
    }

    /// GET an absolute URL, with the default headers.
    pub fn request_with_url(&self, url: &str) -> OperationRequest {
        let host = &self.config.host;
        let mut request = OperationRequest::get(url);
        request
            .add_headers(host.default_headers.iter().map(|(k, v)| (k, v.clone())))
            .set_encoding(host.default_encoding);
        request
    }

    /// Submit an operation. Returns immediately; results arrive through
    /// `observer`, synchronously when a fresh memory entry answers it.
    pub fn submit(&self, request: OperationRequest, observer: Observer) -> OperationId {
        debug!(method = %request.method, url = %request.url, "submit");
        self.dispatcher.submit(request, observer)
    }

    /// Add callbacks to a live operation. Returns `false` once it finished.
    pub fn attach(&self, id: OperationId, observer: Observer) -> bool {
        self.dispatcher.attach(id, observer)
    }

    pub fn cancel(&self, id: OperationId) -> bool {
        self.dispatcher.cancel(id)
    }

    pub fn state(&self, id: OperationId) -> Option<OperationState> {
        self.dispatcher.state(id)
    }

    /// Physical transfers pending or running.
    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    pub fn reachability(&self) -> &ReachabilityMonitor {
        self.dispatcher.reachability()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.dispatcher.reachability().set_reachable(reachable);
    }

    /// Replay frozen operations now. Returns how many were replayed.
    pub async fn thaw(&self) -> Result<usize, EngineError> {
        let dispatcher = self.dispatcher.clone();
        let replayed = self
            .runtime
            .spawn_blocking(move || dispatcher.thaw_blocking())
            .await
            .map_err(|e| EngineError::Runtime(e.to_string()))??;
        Ok(replayed)
    }

    /// Blocking variant of `thaw` for callers outside the runtime.
    pub fn thaw_blocking(&self) -> Result<usize, StoreError> {
        self.dispatcher.thaw_blocking()
    }

    pub fn frozen_count(&self) -> usize {
        self.dispatcher.frozen_count()
    }

    pub fn sweep_cache(&self) -> Result<usize, StoreError> {
        self.dispatcher.sweep_cache()
    }

    pub fn empty_cache(&self) -> Result<(), StoreError> {
        self.dispatcher.empty_cache()
    }

    /// Freeze in-flight freezable operations, cancel the rest and stop
    /// accepting work. Returns how many operations were frozen.
    pub fn shutdown(&self) -> usize {
        self.watcher.abort();
        self.dispatcher.shutdown()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn watch_reachability(dispatcher: WeakDispatcher, mut rx: watch::Receiver<bool>) {
    while rx.changed().await.is_ok() {
        if !*rx.borrow_and_update() {
            continue;
        }
        let Some(dispatcher) = dispatcher.upgrade() else {
            break;
        };
        info!("connectivity restored; replaying frozen operations");
        match tokio::task::spawn_blocking(move || dispatcher.thaw_blocking()).await {
            Ok(result) => log_thaw(result),
            Err(err) => warn!(error = %err, "replay task failed"),
        }
    }
}

fn log_thaw(result: Result<usize, StoreError>) {
    match result {
        Ok(replayed) => debug!(replayed, "replay finished"),
        Err(err) => warn!(error = %err, "replay failed"),
    }
}
