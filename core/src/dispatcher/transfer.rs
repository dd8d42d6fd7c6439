//! The body of one transfer task.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::record::RecordIndex;
use super::{Inner, OperationState};
use crate::cache::CacheEntry;
use crate::cache_headers;
use crate::credential::{self, AuthChallenge, Credential, CredentialResolution, CredentialResponder};
use crate::error::{OperationError, TransportError};
use crate::http::{self, HttpResponse};
use crate::key::RequestKey;
use crate::observer::{Response, ResponseSource};
use crate::request::OperationRequest;
use crate::transport::{Progress, ProgressSink};

/// Slack between an operation's timeout and the transport's deadline.
const TRANSPORT_GRACE: Duration = Duration::from_secs(1);

/// What the task needs from its record, copied out under the lock.
struct Job {
    key: RequestKey,
    sequence: u64,
    request: OperationRequest,
    cached: Option<CacheEntry>,
}

enum DiskLookup {
    /// The record was answered and retired.
    Done,
    /// A payload was shown; keep going with this entry as validator.
    Continue(CacheEntry),
    Miss,
}

pub(super) async fn run(inner: Arc<Inner>, index: RecordIndex) {
    let Some(job) = snapshot(&inner, index) else {
        return;
    };

    let mut cached = job.cached.clone();
    if cached.is_none() && inner.reads_cache(&job.request) {
        if let Some(entry) = load_persistent(&inner, &job.key).await {
            match serve_from_disk(&inner, index, entry) {
                DiskLookup::Done => return,
                DiskLookup::Continue(entry) => cached = Some(entry),
                DiskLookup::Miss => {}
            }
        }
    }

    let Ok(permit) = inner.permits.clone().acquire_owned().await else {
        return;
    };
    let outcome = if inner.reachability.is_reachable() {
        execute(&inner, index, &job.request, cached.as_ref()).await
    } else {
        debug!(key = %job.key, "offline; skipping transfer attempt");
        Err(TransportError::Offline.into())
    };
    drop(permit);

    settle(&inner, index, &job, cached, outcome).await;
}

fn snapshot(inner: &Inner, index: RecordIndex) -> Option<Job> {
    let st = inner.lock();
    st.records.get(index).map(|record| Job {
        key: record.key.clone(),
        sequence: record.sequence,
        request: record.request.clone(),
        cached: record.cached.clone(),
    })
}

async fn load_persistent(inner: &Inner, key: &RequestKey) -> Option<CacheEntry> {
    let persistent = inner.persistent.clone()?;
    let key = key.clone();
    match tokio::task::spawn_blocking(move || persistent.get(&key)).await {
        Ok(found) => found,
        Err(err) => {
            warn!(error = %err, "persistent cache lookup failed");
            None
        }
    }
}

/// Act on an entry read from disk: promote it into memory and show it.
fn serve_from_disk(inner: &Inner, index: RecordIndex, entry: CacheEntry) -> DiskLookup {
    let now = Utc::now();
    let mut guard = inner.lock();
    let st = &mut *guard;
    let Some(record) = st.records.get_mut(index) else {
        return DiskLookup::Done;
    };

    let (state, source) = if entry.is_fresh(now) {
        (OperationState::RespondingFromCache, ResponseSource::Cache)
    } else if entry.is_revalidatable(now) {
        (OperationState::RespondingFromStaleCache, ResponseSource::StaleCache)
    } else {
        return DiskLookup::Miss;
    };
    debug!(key = %record.key, stale = entry.stale, "persistent cache hit");
    record.transition(state);
    let response = entry.to_response(source);

    if source == ResponseSource::Cache && !record.request.always_load {
        record.response = Some(response);
        st.memory.put(entry);
        let delivery = st.retire(index, OperationState::Completed);
        drop(guard);
        delivery.run();
        return DiskLookup::Done;
    }

    record.cached = Some(entry.clone());
    let mut observers = Vec::new();
    for subscriber in record.subscribers.iter_mut().filter(|s| !s.delivered) {
        subscriber.delivered = true;
        observers.extend(subscriber.observers.iter().cloned());
    }
    st.memory.put(entry.clone());
    drop(guard);
    for observer in observers {
        observer.complete(&response);
    }
    DiskLookup::Continue(entry)
}

fn progress_sink(inner: &Arc<Inner>, index: RecordIndex) -> ProgressSink {
    let weak = Arc::downgrade(inner);
    Arc::new(move |progress: Progress| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let observers = inner
            .lock()
            .records
            .get(index)
            .map(|r| r.observers())
            .unwrap_or_default();
        for observer in observers {
            observer.progress(progress);
        }
    })
}

/// Run the transfer, answering authentication challenges as they come.
async fn execute(
    inner: &Arc<Inner>,
    index: RecordIndex,
    request: &OperationRequest,
    cached: Option<&CacheEntry>,
) -> Result<HttpResponse, OperationError> {
    let mut wire = request.build()?;
    if let Some(validator) = cached.and_then(|entry| entry.validator.as_ref()) {
        let (name, value) = validator.conditional_header();
        http::set_header(&mut wire.headers, &name, value);
    }
    let timeout = request.timeout.unwrap_or(inner.settings.timeout);
    // The transport's own deadline backs up the one below and releases the
    // blocking thread once the operation has given up on it.
    wire.timeout = Some(timeout + TRANSPORT_GRACE);
    let sink = progress_sink(inner, index);

    let mut failures = 0;
    loop {
        let sent = tokio::time::timeout(timeout, inner.transport.send(wire.clone(), sink.clone())).await;
        let response = match sent {
            Ok(result) => result?,
            Err(_) => return Err(OperationError::Timeout(timeout)),
        };
        if response.status == 401 {
            if let Some(credential) = challenge(inner, &wire.url, &response, failures).await {
                http::set_header(&mut wire.headers, "Authorization", credential.authorization());
                failures += 1;
                continue;
            }
        }
        return Ok(response);
    }
}

/// Ask the credential handler for a credential. Suspends until answered.
async fn challenge(
    inner: &Inner,
    url: &str,
    response: &HttpResponse,
    failures: u32,
) -> Option<Credential> {
    let handler = inner.credentials.as_ref()?;
    if failures >= inner.settings.max_auth_attempts {
        debug!(url, failures, "giving up on authentication");
        return None;
    }
    let challenge = AuthChallenge::from_headers(url, &response.headers, failures)?;
    info!(url, scheme = %challenge.scheme, realm = ?challenge.realm, "credential required");
    let (responder, rx) = CredentialResponder::channel();
    handler.challenge(challenge, responder);
    match credential::await_resolution(rx).await {
        CredentialResolution::Use(credential) => Some(credential),
        CredentialResolution::NoCredential => None,
    }
}

/// Turn the outcome into cache writes, a freeze or an error, then retire
/// the record.
async fn settle(
    inner: &Arc<Inner>,
    index: RecordIndex,
    job: &Job,
    cached: Option<CacheEntry>,
    outcome: Result<HttpResponse, OperationError>,
) {
    let now = Utc::now();
    let default_expiry = inner.settings.default_expiry;
    let writes_cache = inner.settings.cache_enabled
        && job.request.method.is_safe()
        && job.request.download_path.is_none();

    let (state, response, error) = match (outcome, cached) {
        (Ok(reply), Some(entry)) if reply.is_not_modified() => {
            let mut refreshed = entry.refreshed(&reply.headers, now);
            let merged = HttpResponse {
                status: refreshed.status,
                headers: refreshed.headers.clone(),
                body: Vec::new(),
            };
            match cache_headers::storage_expiry(&job.request, &merged, now, default_expiry) {
                Some(expires_at) if writes_cache => {
                    refreshed.expires_at = expires_at;
                    debug!(key = %job.key, %expires_at, "revalidated; not modified");
                    store(inner, refreshed.clone()).await;
                }
                _ => evict(inner, &job.key).await,
            }
            let response = refreshed.to_response(ResponseSource::Cache);
            (OperationState::Completed, Some(response), None)
        }
        (Ok(reply), _) if reply.is_success() => {
            if writes_cache {
                match cache_headers::storage_expiry(&job.request, &reply, now, default_expiry) {
                    Some(expires_at) => {
                        let entry = CacheEntry::new(
                            job.key.clone(),
                            reply.status,
                            reply.headers.clone(),
                            reply.body.clone(),
                            expires_at,
                        );
                        store(inner, entry).await;
                    }
                    None => evict(inner, &job.key).await,
                }
            }
            let response = Response {
                status: reply.status,
                headers: reply.headers,
                body: reply.body,
                source: ResponseSource::Network,
                file: job.request.download_path.clone(),
            };
            (OperationState::Completed, Some(response), None)
        }
        (Ok(reply), _) => {
            let error = OperationError::Http {
                status: reply.status,
                headers: reply.headers,
                body: reply.body,
            };
            (OperationState::Error, None, Some(error))
        }
        (Err(error), _) => {
            if error.is_freeze_eligible()
                && begin_freeze(inner, index)
                && freeze(inner, index, job, &error).await
            {
                return;
            }
            debug!(key = %job.key, error = %error, "operation failed");
            (OperationState::Error, None, Some(error))
        }
    };

    let delivery = {
        let mut st = inner.lock();
        match st.records.get_mut(index) {
            Some(record) => {
                record.response = response;
                record.error = error;
            }
            None => return,
        }
        st.retire(index, state)
    };
    delivery.run();
}

/// Write disk first and memory only once disk has the entry.
async fn store(inner: &Inner, entry: CacheEntry) {
    let Some(persistent) = inner.persistent.clone() else {
        return;
    };
    let on_disk = entry.clone();
    let written = tokio::task::spawn_blocking(move || persistent.put(&on_disk)).await;
    match written {
        Ok(Ok(())) => {
            inner.lock().memory.put(entry);
        }
        Ok(Err(err)) => warn!(key = %entry.key, error = %err, "cache write failed"),
        Err(err) => warn!(key = %entry.key, error = %err, "cache write task failed"),
    }
}

/// Make sure neither tier holds `key`.
async fn evict(inner: &Inner, key: &RequestKey) {
    inner.lock().memory.remove(key);
    let Some(persistent) = inner.persistent.clone() else {
        return;
    };
    let key = key.clone();
    let removed = tokio::task::spawn_blocking(move || persistent.remove(&key)).await;
    if let Ok(Err(err)) = removed {
        warn!(error = %err, "cache eviction failed");
    }
}

/// Mark the record as being frozen. Fails when it is gone or no freezable
/// subscriber is left.
pub(super) fn begin_freeze(inner: &Inner, index: RecordIndex) -> bool {
    match inner.lock().records.get_mut(index) {
        Some(record) if record.is_freezable() => {
            record.freezing = true;
            true
        }
        _ => false,
    }
}

fn release_freeze(inner: &Inner, index: RecordIndex) {
    if let Some(record) = inner.lock().records.get_mut(index) {
        record.freezing = false;
    }
}

/// Write the operation to the freeze store and retire it as frozen.
///
/// The write and the commit run together on the blocking pool, so they
/// finish even if the task is aborted while waiting. Returns `false` when
/// nothing was frozen; the caller then reports `error` if the record is
/// still there.
async fn freeze(inner: &Arc<Inner>, index: RecordIndex, job: &Job, error: &OperationError) -> bool {
    let owner = inner.clone();
    let sequence = job.sequence;
    let mut request = job.request.clone();
    request.freezable = true;
    let error = error.clone();
    let frozen = tokio::task::spawn_blocking(move || match owner.freeze.freeze(sequence, &request) {
        Ok(path) => commit_freeze(&owner, index, &path, error),
        Err(err) => {
            warn!(sequence, error = %err, "freeze failed; reporting the error instead");
            release_freeze(&owner, index);
            false
        }
    })
    .await;
    match frozen {
        Ok(frozen) => frozen,
        Err(err) => {
            warn!(sequence, error = %err, "freeze task failed");
            release_freeze(inner, index);
            false
        }
    }
}

/// Keep a freshly written freeze only if its record still wants it, and
/// retire the record in the same critical section. Otherwise the file is
/// removed: the operation was cancelled while it was being written.
pub(super) fn commit_freeze(
    inner: &Inner,
    index: RecordIndex,
    path: &Path,
    error: OperationError,
) -> bool {
    let delivery = {
        let mut st = inner.lock();
        let keep = match st.records.get_mut(index) {
            Some(record) => {
                record.freezing = false;
                let keep = record.is_freezable();
                if keep {
                    record.error = Some(error);
                }
                keep
            }
            None => false,
        };
        keep.then(|| st.retire(index, OperationState::Cancelled))
    };
    match delivery {
        Some(delivery) => {
            delivery.run();
            true
        }
        None => {
            debug!(path = %path.display(), "operation withdrawn while freezing");
            if let Err(err) = inner.freeze.discard(path) {
                warn!(error = %err, "failed to discard frozen operation");
            }
            false
        }
    }
}
