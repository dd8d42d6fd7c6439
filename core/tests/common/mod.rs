//! Shared fixtures: a scripted transport and an observer that records
//! what it is told.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use netkit_core::{
    Direction, Engine, EngineConfig, HttpRequest, HttpResponse, Observer, OperationError,
    Progress, ProgressSink, Response, Transport, TransportError,
};
use tempfile::TempDir;
use tokio::sync::Semaphore;

type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

/// Transport answering from a closure. Records every request it receives
/// and can hold transfers until released.
#[derive(Clone)]
pub struct StubTransport {
    handler: Arc<Handler>,
    seen: Arc<Mutex<Vec<HttpRequest>>>,
    gate: Option<Arc<Semaphore>>,
    delay: Option<Duration>,
}

impl StubTransport {
    pub fn new(
        handler: impl Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            seen: Arc::new(Mutex::new(Vec::new())),
            gate: None,
            delay: None,
        }
    }

    /// Hold every transfer until `Gate::release` lets it through.
    pub fn gated(mut self) -> (Self, Gate) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(gate.clone());
        (self, Gate(gate))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn send(
        &self,
        request: HttpRequest,
        progress: ProgressSink,
    ) -> Result<HttpResponse, TransportError> {
        self.seen.lock().unwrap().push(request.clone());
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let response = (self.handler)(&request)?;
        let len = response.body.len() as u64;
        progress(Progress {
            direction: Direction::Download,
            completed: len,
            total: Some(len),
        });
        Ok(response)
    }
}

pub struct Gate(Arc<Semaphore>);

impl Gate {
    pub fn release(&self, transfers: usize) {
        self.0.add_permits(transfers);
    }
}

/// Connectivity switch for transports that should fail while "offline".
#[derive(Clone, Default)]
pub struct Switch(Arc<AtomicBool>);

impl Switch {
    pub fn on() -> Self {
        let s = Self::default();
        s.set(true);
        s
    }

    pub fn set(&self, on: bool) {
        self.0.store(on, Ordering::SeqCst);
    }

    pub fn is_on(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn reply(status: u16, body: &[u8], headers: &[(&str, &str)]) -> HttpResponse {
    HttpResponse {
        status,
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        body: body.to_vec(),
    }
}

pub fn config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config
}

pub fn engine(dir: &TempDir, transport: StubTransport) -> Engine {
    Engine::builder(config(dir))
        .transport(transport)
        .build()
        .unwrap()
}

#[derive(Debug, Clone)]
pub enum Event {
    Complete(Response),
    Error(OperationError),
    Cancel,
}

/// Observer that keeps every terminal or payload callback in order.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
    progress: Arc<Mutex<Vec<Progress>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observer(&self) -> Observer {
        let complete = self.events.clone();
        let error = self.events.clone();
        let cancel = self.events.clone();
        let progress = self.progress.clone();
        Observer::new()
            .on_complete(move |r| complete.lock().unwrap().push(Event::Complete(r.clone())))
            .on_error(move |e| error.lock().unwrap().push(Event::Error(e.clone())))
            .on_cancel(move || cancel.lock().unwrap().push(Event::Cancel))
            .on_progress(move |p| progress.lock().unwrap().push(p))
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn responses(&self) -> Vec<Response> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Complete(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn progress(&self) -> Vec<Progress> {
        self.progress.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, count: usize) -> Vec<Event> {
        wait_until(|| self.events.lock().unwrap().len() >= count).await;
        self.events()
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
