//! Drives operations from submission to a terminal state.
//!
//! # Design
//! All mutable dispatch state (the memory cache, the in-flight table, the
//! record arena and the handle table) lives behind one mutex. A submission
//! takes the lock exactly once to decide between attaching to a running
//! record, answering from memory, or registering a new record, so two
//! identical submissions can never both start a transfer. The lock is never
//! held across an await or while user callbacks run: every path collects
//! what it must deliver into a `Delivery` and runs it after unlocking.
//!
//! Transfers run as tokio tasks on an injected runtime handle, bounded by a
//! semaphore. Disk access (persistent cache, freeze store) happens on the
//! blocking pool.

mod record;
mod transfer;

pub use record::{OperationId, OperationState};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, warn};

use crate::cache::{MemoryCache, PersistentCache};
use crate::credential::CredentialHandler;
use crate::error::{OperationError, StoreError, TransportError};
use crate::freeze::FreezeStore;
use crate::key::RequestKey;
use crate::observer::{Observer, Response, ResponseSource};
use crate::reachability::ReachabilityMonitor;
use crate::request::OperationRequest;
use crate::transport::Transport;
use record::{OperationRecord, RecordArena, RecordIndex, Subscriber};

/// Terminal states kept for `state` queries after a record is gone.
const RECENT_LIMIT: usize = 256;

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub cache_enabled: bool,
    pub memory_capacity: usize,
    pub max_disk_age: Duration,
    pub timeout: Duration,
    pub default_expiry: chrono::Duration,
    pub max_auth_attempts: u32,
    pub max_concurrent: usize,
}

/// Everything a dispatcher is built from.
pub(crate) struct DispatcherParts {
    pub transport: Arc<dyn Transport>,
    pub credentials: Option<Arc<dyn CredentialHandler>>,
    pub reachability: ReachabilityMonitor,
    pub persistent: Option<PersistentCache>,
    pub freeze: FreezeStore,
    pub runtime: Handle,
    pub settings: Settings,
    pub replay_observer: Observer,
}

struct DispatchState {
    memory: MemoryCache,
    in_flight: HashMap<RequestKey, RecordIndex>,
    records: RecordArena,
    handles: HashMap<OperationId, RecordIndex>,
    recent: VecDeque<(OperationId, OperationState)>,
}

impl DispatchState {
    fn remember(&mut self, id: OperationId, state: OperationState) {
        if self.recent.len() >= RECENT_LIMIT {
            self.recent.pop_front();
        }
        self.recent.push_back((id, state));
    }

    /// Remove a record and work out what each subscriber is told.
    ///
    /// `Completed` delivers the record's response to everyone, except that a
    /// cached response is not repeated to subscribers that already got one.
    /// `Error` skips subscribers that already got a payload. `Cancelled` here
    /// means the record was frozen or shut down: freezable subscribers hear
    /// nothing and continue as the frozen operation, the rest get the error
    /// that caused the freeze or a cancellation.
    fn retire(&mut self, index: RecordIndex, state: OperationState) -> Delivery {
        let mut delivery = Delivery::default();
        let Some(mut record) = self.records.remove(index) else {
            return delivery;
        };
        if self.in_flight.get(&record.key) == Some(&index) {
            self.in_flight.remove(&record.key);
        }
        record.transition(state);

        for subscriber in record.subscribers.drain(..) {
            self.handles.remove(&subscriber.id);
            self.remember(subscriber.id, state);
            let signal = match state {
                OperationState::Completed => record
                    .response
                    .as_ref()
                    .filter(|r| r.source == ResponseSource::Network || !subscriber.delivered)
                    .map(|r| Signal::Complete(r.clone())),
                OperationState::Error => record
                    .error
                    .as_ref()
                    .filter(|_| !subscriber.delivered)
                    .map(|e| Signal::Error(e.clone())),
                OperationState::Cancelled if subscriber.freezable || subscriber.delivered => None,
                OperationState::Cancelled => Some(match &record.error {
                    Some(e) => Signal::Error(e.clone()),
                    None => Signal::Cancel,
                }),
                _ => None,
            };
            if let Some(signal) = signal {
                for observer in &subscriber.observers {
                    delivery.notify(observer.clone(), signal.clone());
                }
            }
            delivery.finished.push((subscriber, state));
        }
        delivery
    }
}

#[derive(Clone)]
enum Signal {
    Complete(Response),
    Error(OperationError),
    Cancel,
}

/// Callbacks collected under the lock and run after it is released.
#[derive(Default)]
#[must_use]
struct Delivery {
    notices: Vec<(Observer, Signal)>,
    finished: Vec<(Subscriber, OperationState)>,
}

impl Delivery {
    fn notify(&mut self, observer: Observer, signal: Signal) {
        self.notices.push((observer, signal));
    }

    fn run(self) {
        for (observer, signal) in self.notices {
            match signal {
                Signal::Complete(response) => observer.complete(&response),
                Signal::Error(error) => observer.error(&error),
                Signal::Cancel => observer.cancel(),
            }
        }
        for (mut subscriber, state) in self.finished {
            subscriber.finish(state);
        }
    }
}

/// Result of the admission decision for one submission.
enum Admission {
    /// Answered from memory; no record was created.
    Cached(Response, Subscriber),
    /// Joined a running record, with the payload it is currently showing.
    Attached(Option<Response>),
    /// New record, with a payload to show before the transfer.
    Started(RecordIndex, Option<Response>),
}

struct Inner {
    state: Mutex<DispatchState>,
    persistent: Option<PersistentCache>,
    freeze: FreezeStore,
    transport: Arc<dyn Transport>,
    credentials: Option<Arc<dyn CredentialHandler>>,
    reachability: ReachabilityMonitor,
    permits: Arc<Semaphore>,
    runtime: Handle,
    settings: Settings,
    replay_observer: Observer,
    next_id: AtomicU64,
    next_sequence: AtomicU64,
    thaw_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `request` may be answered from the cache tiers.
    fn reads_cache(&self, request: &OperationRequest) -> bool {
        self.settings.cache_enabled && request.is_cacheable() && !request.ignore_cache
    }

    /// Retire `index` as failed with `error`.
    fn fail(&self, index: RecordIndex, error: OperationError) {
        let delivery = {
            let mut st = self.lock();
            match st.records.get_mut(index) {
                Some(record) => record.error = Some(error),
                None => return,
            }
            st.retire(index, OperationState::Error)
        };
        delivery.run();
    }
}

/// Owns in-flight operations and the memory cache. Cheap to clone.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    inner: Arc<Inner>,
}

/// Non-owning reference used by background watchers.
#[derive(Clone)]
pub(crate) struct WeakDispatcher(Weak<Inner>);

impl WeakDispatcher {
    pub fn upgrade(&self) -> Option<Dispatcher> {
        self.0.upgrade().map(|inner| Dispatcher { inner })
    }
}

impl Dispatcher {
    pub fn new(parts: DispatcherParts) -> Self {
        let next_sequence = parts.freeze.next_sequence();
        let state = DispatchState {
            memory: MemoryCache::new(parts.settings.memory_capacity)
                .with_max_age(parts.settings.max_disk_age),
            in_flight: HashMap::new(),
            records: RecordArena::default(),
            handles: HashMap::new(),
            recent: VecDeque::new(),
        };
        let permits = Arc::new(Semaphore::new(parts.settings.max_concurrent.max(1)));
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                persistent: parts.persistent,
                freeze: parts.freeze,
                transport: parts.transport,
                credentials: parts.credentials,
                reachability: parts.reachability,
                permits,
                runtime: parts.runtime,
                settings: parts.settings,
                replay_observer: parts.replay_observer,
                next_id: AtomicU64::new(1),
                next_sequence: AtomicU64::new(next_sequence),
                thaw_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakDispatcher {
        WeakDispatcher(Arc::downgrade(&self.inner))
    }

    pub fn submit(&self, request: OperationRequest, observer: Observer) -> OperationId {
        self.submit_inner(request, observer, None, None)
    }

    fn submit_inner(
        &self,
        request: OperationRequest,
        observer: Observer,
        sequence: Option<u64>,
        done: Option<oneshot::Sender<OperationState>>,
    ) -> OperationId {
        let inner = &self.inner;
        let id = OperationId(inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscriber = Subscriber::new(id, observer.clone(), request.freezable, done);
        if inner.closed.load(Ordering::SeqCst) {
            debug!(%id, "submission after shutdown");
            observer.cancel();
            subscriber.finish(OperationState::Cancelled);
            return id;
        }

        let key = request.key();
        let dedupable = request.is_shareable();
        let reads_cache = inner.reads_cache(&request);
        let now = Utc::now();

        let admission = {
            let mut guard = inner.lock();
            let st = &mut *guard;
            let running = dedupable
                .then(|| st.in_flight.get(&key).copied())
                .flatten()
                .filter(|index| st.records.get(*index).is_some());

            if let Some(index) = running {
                let showing = st.records.get_mut(index).and_then(|record| {
                    let showing = match (record.state, &record.cached) {
                        (OperationState::RespondingFromStaleCache, Some(entry)) => {
                            Some(entry.to_response(ResponseSource::StaleCache))
                        }
                        (OperationState::RespondingFromCache, Some(entry)) => {
                            Some(entry.to_response(ResponseSource::Cache))
                        }
                        _ => None,
                    };
                    subscriber.delivered = showing.is_some();
                    record.subscribers.push(subscriber);
                    showing
                });
                st.handles.insert(id, index);
                debug!(%id, key = %key, "attached to in-flight operation");
                Admission::Attached(showing)
            } else {
                let hit = if reads_cache {
                    st.memory.get(&key).cloned()
                } else {
                    None
                };
                match hit {
                    Some(entry) if entry.is_fresh(now) && !request.always_load => {
                        st.remember(id, OperationState::Completed);
                        debug!(%id, key = %key, "memory cache hit");
                        Admission::Cached(entry.to_response(ResponseSource::Cache), subscriber)
                    }
                    hit => {
                        let sequence = sequence
                            .unwrap_or_else(|| inner.next_sequence.fetch_add(1, Ordering::Relaxed));
                        let mut record = OperationRecord::new(id, key.clone(), sequence, request);
                        let showing = match hit {
                            Some(entry) if entry.is_fresh(now) => {
                                record.transition(OperationState::RespondingFromCache);
                                let response = entry.to_response(ResponseSource::Cache);
                                record.cached = Some(entry);
                                Some(response)
                            }
                            Some(entry) if entry.is_revalidatable(now) => {
                                record.transition(OperationState::RespondingFromStaleCache);
                                let response = entry.to_response(ResponseSource::StaleCache);
                                record.cached = Some(entry);
                                Some(response)
                            }
                            _ => {
                                record.transition(OperationState::Started);
                                None
                            }
                        };
                        subscriber.delivered = showing.is_some();
                        record.subscribers.push(subscriber);
                        let index = st.records.insert(record);
                        st.handles.insert(id, index);
                        if dedupable {
                            st.in_flight.insert(key, index);
                        }
                        Admission::Started(index, showing)
                    }
                }
            }
        };

        match admission {
            Admission::Cached(response, mut subscriber) => {
                observer.complete(&response);
                subscriber.finish(OperationState::Completed);
            }
            Admission::Attached(showing) => {
                if let Some(response) = showing {
                    observer.complete(&response);
                }
            }
            Admission::Started(index, showing) => {
                if let Some(response) = showing {
                    observer.complete(&response);
                }
                self.spawn(index);
            }
        }
        id
    }

    /// Start the transfer task. The abort handle is stored under the same
    /// lock `cancel` takes, so a cancellation either finds it or finds the
    /// record already gone and nothing is spawned.
    fn spawn(&self, index: RecordIndex) {
        let inner = self.inner.clone();
        let task = {
            let mut st = self.inner.lock();
            let Some(record) = st.records.get_mut(index) else {
                return;
            };
            let task = self
                .inner
                .runtime
                .spawn(transfer::run(self.inner.clone(), index));
            record.abort = Some(task.abort_handle());
            task
        };
        // A panicking transfer must not leave its record in flight forever.
        self.inner.runtime.spawn(async move {
            if let Err(err) = task.await {
                if err.is_panic() {
                    warn!("transfer task panicked");
                    inner.fail(
                        index,
                        TransportError::Protocol("transfer task panicked".into()).into(),
                    );
                }
            }
        });
    }

    /// Add another observer to a live submission. A payload the operation
    /// is already showing from the cache is delivered to it immediately.
    pub fn attach(&self, id: OperationId, observer: Observer) -> bool {
        let showing = {
            let mut guard = self.inner.lock();
            let st = &mut *guard;
            let Some(index) = st.handles.get(&id).copied() else {
                return false;
            };
            let Some(record) = st.records.get_mut(index) else {
                return false;
            };
            let showing = match (record.state, &record.cached) {
                (OperationState::RespondingFromStaleCache, Some(entry)) => {
                    Some(entry.to_response(ResponseSource::StaleCache))
                }
                (OperationState::RespondingFromCache, Some(entry)) => {
                    Some(entry.to_response(ResponseSource::Cache))
                }
                _ => None,
            };
            match record.subscribers.iter_mut().find(|s| s.id == id) {
                Some(subscriber) => subscriber.observers.push(observer.clone()),
                None => return false,
            }
            showing
        };
        if let Some(response) = showing {
            observer.complete(&response);
        }
        true
    }

    /// Withdraw one submission. The physical transfer is stopped only when
    /// no other submission shares it.
    pub fn cancel(&self, id: OperationId) -> bool {
        let (mut subscriber, abort) = {
            let mut guard = self.inner.lock();
            let st = &mut *guard;
            let Some(index) = st.handles.remove(&id) else {
                return false;
            };
            let Some(record) = st.records.get_mut(index) else {
                return false;
            };
            let Some(position) = record.subscribers.iter().position(|s| s.id == id) else {
                return false;
            };
            let subscriber = record.subscribers.remove(position);
            let remaining = record.subscribers.len();
            st.remember(id, OperationState::Cancelled);

            let abort = if remaining == 0 {
                let mut record = st.records.remove(index);
                if let Some(record) = record.as_mut() {
                    record.transition(OperationState::Cancelled);
                    if st.in_flight.get(&record.key) == Some(&index) {
                        st.in_flight.remove(&record.key);
                    }
                }
                record.and_then(|mut r| r.abort.take())
            } else {
                debug!(%id, remaining, "detached from shared transfer");
                None
            };
            (subscriber, abort)
        };

        if let Some(abort) = abort {
            abort.abort();
        }
        for observer in &subscriber.observers {
            observer.cancel();
        }
        subscriber.finish(OperationState::Cancelled);
        true
    }

    /// Current state of a submission, if it is live or recently finished.
    pub fn state(&self, id: OperationId) -> Option<OperationState> {
        let st = self.inner.lock();
        if let Some(record) = st.handles.get(&id).and_then(|i| st.records.get(*i)) {
            return Some(record.state);
        }
        st.recent
            .iter()
            .rev()
            .find(|(recent, _)| *recent == id)
            .map(|(_, state)| *state)
    }

    /// Live records, i.e. physical transfers pending or running.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn reachability(&self) -> &ReachabilityMonitor {
        &self.inner.reachability
    }

    pub fn frozen_count(&self) -> usize {
        self.inner.freeze.len()
    }

    /// Drop every cached response from both tiers.
    pub fn empty_cache(&self) -> Result<(), StoreError> {
        self.inner.lock().memory.clear();
        match &self.inner.persistent {
            Some(persistent) => persistent.clear(),
            None => Ok(()),
        }
    }

    /// Remove over-age files from the persistent tier, and any memory entry
    /// whose file is gone.
    pub fn sweep_cache(&self) -> Result<usize, StoreError> {
        let Some(persistent) = &self.inner.persistent else {
            return Ok(0);
        };
        let removed = persistent.sweep()?;
        let remembered = self.inner.lock().memory.keys();
        let gone: Vec<RequestKey> = remembered
            .into_iter()
            .filter(|key| !persistent.contains(key))
            .collect();
        if !gone.is_empty() {
            let mut st = self.inner.lock();
            for key in &gone {
                st.memory.remove(key);
            }
            debug!(dropped = gone.len(), "dropped memory entries no longer on disk");
        }
        Ok(removed)
    }

    /// Resubmit frozen operations in submission order, one at a time.
    ///
    /// Each operation is removed from the freeze store once its resubmission
    /// has finished, whatever the outcome. Replay stops at the first
    /// operation that freezes again, or when connectivity is lost. Blocks
    /// the calling thread; never call it from inside an async task.
    pub fn thaw_blocking(&self) -> Result<usize, StoreError> {
        let _serial = self
            .inner
            .thaw_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut halted = false;
        self.inner.freeze.drain(|op| {
            if halted {
                return Err("replay halted after an operation froze again");
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err("dispatcher is shut down");
            }
            if !self.inner.reachability.is_reachable() {
                return Err("network unreachable");
            }
            let sequence = op.sequence;
            let (tx, rx) = oneshot::channel();
            let id = self.submit_inner(
                op.request,
                self.inner.replay_observer.clone(),
                Some(sequence),
                Some(tx),
            );
            debug!(%id, sequence, "replaying frozen operation");
            let state = rx.blocking_recv().unwrap_or(OperationState::Cancelled);
            if state == OperationState::Cancelled {
                halted = true;
            }
            Ok(())
        })
    }

    /// Stop accepting work, freeze every in-flight freezable operation and
    /// cancel the rest. Returns how many operations were frozen here; an
    /// operation whose task is already freezing it is left to that task.
    pub fn shutdown(&self) -> usize {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let (to_freeze, aborts, delivery) = {
            let mut guard = self.inner.lock();
            let st = &mut *guard;
            let live: Vec<RecordIndex> = st.records.iter().map(|(index, _)| index).collect();
            let mut to_freeze = Vec::new();
            let mut aborts = Vec::new();
            let mut delivery = Delivery::default();
            for index in live {
                if let Some(record) = st.records.get_mut(index) {
                    if record.freezing {
                        // Its task is writing the freeze and retires it.
                        continue;
                    }
                    if record.is_freezable() {
                        let mut request = record.request.clone();
                        request.freezable = true;
                        to_freeze.push((record.sequence, request));
                    }
                    if let Some(abort) = record.abort.take() {
                        aborts.push(abort);
                    }
                }
                let retired = st.retire(index, OperationState::Cancelled);
                delivery.notices.extend(retired.notices);
                delivery.finished.extend(retired.finished);
            }
            (to_freeze, aborts, delivery)
        };
        for abort in aborts {
            abort.abort();
        }

        let mut frozen = 0;
        for (sequence, request) in &to_freeze {
            match self.inner.freeze.freeze(*sequence, request) {
                Ok(_) => frozen += 1,
                Err(err) => warn!(sequence, error = %err, "failed to freeze operation at shutdown"),
            }
        }
        delivery.run();
        info!(frozen, "dispatcher shut down");
        frozen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use crate::http::{HttpMethod, HttpRequest, HttpResponse};
    use crate::transport::ProgressSink;

    /// Fails every transfer as offline, counting the attempts.
    #[derive(Default)]
    struct Offline(Arc<AtomicUsize>);

    #[async_trait]
    impl Transport for Offline {
        async fn send(
            &self,
            _request: HttpRequest,
            _progress: ProgressSink,
        ) -> Result<HttpResponse, TransportError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Offline)
        }
    }

    fn dispatcher(transport: Offline, dir: &Path) -> Dispatcher {
        Dispatcher::new(DispatcherParts {
            transport: Arc::new(transport),
            credentials: None,
            reachability: ReachabilityMonitor::new(true),
            persistent: None,
            freeze: FreezeStore::open(dir).unwrap(),
            runtime: Handle::current(),
            settings: Settings {
                cache_enabled: false,
                memory_capacity: 4,
                max_disk_age: Duration::from_secs(60),
                timeout: Duration::from_secs(5),
                default_expiry: chrono::Duration::seconds(60),
                max_auth_attempts: 1,
                max_concurrent: 1,
            },
            replay_observer: Observer::new(),
        })
    }

    /// A running freezable record with no task behind it.
    fn register(d: &Dispatcher) -> (OperationId, RecordIndex) {
        let id = OperationId(d.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut request = OperationRequest::new(HttpMethod::Post, "http://example.com/items");
        request.set_freezable(true);
        let mut record = OperationRecord::new(id, request.key(), 7, request);
        record.transition(OperationState::Started);
        record.subscribers.push(Subscriber::new(id, Observer::new(), true, None));
        let mut st = d.inner.lock();
        let index = st.records.insert(record);
        st.handles.insert(id, index);
        (id, index)
    }

    /// What the transfer task writes before it commits.
    fn write_freeze(d: &Dispatcher, index: RecordIndex) -> std::path::PathBuf {
        assert!(transfer::begin_freeze(&d.inner, index));
        let request = d.inner.lock().records.get(index).unwrap().request.clone();
        d.inner.freeze.freeze(7, &request).unwrap()
    }

    #[tokio::test]
    async fn cancel_while_freezing_discards_the_written_file() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(Offline::default(), dir.path());
        let (id, index) = register(&d);
        let path = write_freeze(&d, index);

        assert!(d.cancel(id));
        assert!(!transfer::commit_freeze(&d.inner, index, &path, TransportError::Offline.into()));
        assert!(!path.exists());
        assert_eq!(d.frozen_count(), 0);
        assert_eq!(d.state(id), Some(OperationState::Cancelled));
    }

    #[tokio::test]
    async fn shutdown_leaves_a_freezing_record_to_its_task() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(Offline::default(), dir.path());
        let (_, index) = register(&d);
        let path = write_freeze(&d, index);

        assert_eq!(d.shutdown(), 0);
        assert!(d.inner.lock().records.get(index).is_some());

        assert!(transfer::commit_freeze(&d.inner, index, &path, TransportError::Offline.into()));
        assert_eq!(d.frozen_count(), 1);
        assert_eq!(d.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancel_after_the_freeze_commits_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(Offline::default(), dir.path());
        let (id, index) = register(&d);
        let path = write_freeze(&d, index);

        assert!(transfer::commit_freeze(&d.inner, index, &path, TransportError::Offline.into()));
        assert!(!d.cancel(id));
        assert!(path.exists());
        assert_eq!(d.frozen_count(), 1);
    }

    #[tokio::test]
    async fn abort_handle_is_set_before_submit_returns() {
        let dir = tempfile::tempdir().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let d = dispatcher(Offline(attempts.clone()), dir.path());

        let id = d.submit(OperationRequest::get("http://example.com/a"), Observer::new());
        {
            let st = d.inner.lock();
            let index = st.handles[&id];
            assert!(st.records.get(index).unwrap().abort.is_some());
        }
        assert!(d.cancel(id));
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert_eq!(d.state(id), Some(OperationState::Cancelled));
    }
}
