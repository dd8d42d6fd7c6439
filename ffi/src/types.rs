//! `#[repr(C)]` types for the FFI boundary.
//!
//! # Design
//! Handles (`FfiEngine`, `FfiRequest`) are opaque to C. Everything a
//! callback receives (`FfiOutcome`, `FfiChallenge`) is borrowed for the
//! duration of the call only; C copies what it wants to keep. Conversion
//! helpers live here to keep `lib.rs` focused on the `extern "C"` surface.

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::os::raw::c_char;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use netkit_core::{
    AuthChallenge, CachePolicy, CredentialHandler, CredentialResponder, Engine, HttpMethod,
    OperationError, OperationRequest, Response, ResponseSource, TransportError,
};
use tokio::runtime::Runtime;

/// Opaque engine handle. Owns the runtime its transfers run on.
///
/// Field order matters: the engine shuts down before its runtime drops.
pub struct FfiEngine {
    pub(crate) engine: Engine,
    pub(crate) credentials: std::sync::Arc<CredentialBridge>,
    pub(crate) runtime: Runtime,
}

/// Opaque request under construction.
pub struct FfiRequest {
    pub(crate) inner: OperationRequest,
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// HTTP method as a C enum.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiHttpMethod {
    Get = 0,
    Head = 1,
    Post = 2,
    Put = 3,
    Patch = 4,
    Delete = 5,
}

impl From<FfiHttpMethod> for HttpMethod {
    fn from(m: FfiHttpMethod) -> Self {
        match m {
            FfiHttpMethod::Get => HttpMethod::Get,
            FfiHttpMethod::Head => HttpMethod::Head,
            FfiHttpMethod::Post => HttpMethod::Post,
            FfiHttpMethod::Put => HttpMethod::Put,
            FfiHttpMethod::Patch => HttpMethod::Patch,
            FfiHttpMethod::Delete => HttpMethod::Delete,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiCachePolicy {
    Default = 0,
    DoNotCache = 1,
    AlwaysCache = 2,
}

impl From<FfiCachePolicy> for CachePolicy {
    fn from(p: FfiCachePolicy) -> Self {
        match p {
            FfiCachePolicy::Default => CachePolicy::Default,
            FfiCachePolicy::DoNotCache => CachePolicy::DoNotCache,
            FfiCachePolicy::AlwaysCache => CachePolicy::AlwaysCache,
        }
    }
}

/// Error codes returned by entry points and carried in `FfiOutcome`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiErrorCode {
    Ok = 0,
    NullArg = 1,
    InvalidArg = 2,
    Offline = 3,
    Connection = 4,
    Timeout = 5,
    Http = 6,
    Encoding = 7,
    Protocol = 8,
    Store = 9,
    Config = 10,
    Runtime = 11,
    Panic = 12,
}

impl From<&OperationError> for FfiErrorCode {
    fn from(err: &OperationError) -> Self {
        match err {
            OperationError::Transport(TransportError::Offline) => FfiErrorCode::Offline,
            OperationError::Transport(t) if t.is_connectivity() => FfiErrorCode::Connection,
            OperationError::Transport(TransportError::InvalidRequest(_)) => FfiErrorCode::InvalidArg,
            OperationError::Transport(TransportError::Download(_)) => FfiErrorCode::Store,
            OperationError::Transport(_) => FfiErrorCode::Protocol,
            OperationError::Http { .. } => FfiErrorCode::Http,
            OperationError::Timeout(_) => FfiErrorCode::Timeout,
            OperationError::Encoding(_) => FfiErrorCode::Encoding,
        }
    }
}

impl From<&netkit_core::EngineError> for FfiErrorCode {
    fn from(err: &netkit_core::EngineError) -> Self {
        match err {
            netkit_core::EngineError::Config(_) => FfiErrorCode::Config,
            netkit_core::EngineError::Store(_) => FfiErrorCode::Store,
            netkit_core::EngineError::Runtime(_) => FfiErrorCode::Runtime,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiOutcomeKind {
    Complete = 0,
    Error = 1,
    Cancelled = 2,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiSource {
    None = 0,
    Network = 1,
    Cache = 2,
    StaleCache = 3,
}

impl From<ResponseSource> for FfiSource {
    fn from(s: ResponseSource) -> Self {
        match s {
            ResponseSource::Network => FfiSource::Network,
            ResponseSource::Cache => FfiSource::Cache,
            ResponseSource::StaleCache => FfiSource::StaleCache,
        }
    }
}

// ---------------------------------------------------------------------------
// Callback payloads
// ---------------------------------------------------------------------------

/// What an operation reported. Borrowed: valid only inside the callback.
///
/// `Complete` may be reported twice for one operation: a cached payload
/// first, then the network one.
#[repr(C)]
pub struct FfiOutcome {
    pub kind: FfiOutcomeKind,
    pub status: u16,
    pub body: *const u8,
    pub body_len: usize,
    pub source: FfiSource,
    pub error_code: FfiErrorCode,
    /// Null unless `kind` is `Error`.
    pub error_message: *const c_char,
}

/// Called once per outcome with the operation id from `netkit_submit`.
pub type FfiOutcomeCallback =
    extern "C" fn(id: u64, outcome: *const FfiOutcome, user_data: *mut c_void);

/// An authentication challenge. Borrowed: valid only inside the callback.
#[repr(C)]
pub struct FfiChallenge {
    pub url: *const c_char,
    pub scheme: *const c_char,
    /// Null when the server named no realm.
    pub realm: *const c_char,
    pub previous_failures: u32,
}

/// Answer later with `netkit_resolve_credential(engine, token, ..)`.
pub type FfiCredentialCallback =
    extern "C" fn(token: u64, challenge: *const FfiChallenge, user_data: *mut c_void);

/// Caller-owned context pointer handed back to C verbatim.
#[derive(Clone, Copy)]
pub(crate) struct UserData(pub *mut c_void);

// The pointer is only ever passed back to the caller's own callback.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

/// C string for text that may contain interior NULs.
pub(crate) fn c_string(text: impl Into<String>) -> CString {
    let text = text.into().replace('\0', " ");
    CString::new(text).unwrap_or_default()
}

/// Report one outcome to a C callback.
pub(crate) fn report_response(
    callback: FfiOutcomeCallback,
    id: u64,
    response: &Response,
    user_data: UserData,
) {
    let outcome = FfiOutcome {
        kind: FfiOutcomeKind::Complete,
        status: response.status,
        body: response.body.as_ptr(),
        body_len: response.body.len(),
        source: response.source.into(),
        error_code: FfiErrorCode::Ok,
        error_message: std::ptr::null(),
    };
    callback(id, &outcome, user_data.0);
}

pub(crate) fn report_error(
    callback: FfiOutcomeCallback,
    id: u64,
    error: &OperationError,
    user_data: UserData,
) {
    let message = c_string(error.to_string());
    let (status, body) = match error {
        OperationError::Http { status, body, .. } => (*status, body.as_slice()),
        _ => (0, &[] as &[u8]),
    };
    let outcome = FfiOutcome {
        kind: FfiOutcomeKind::Error,
        status,
        body: body.as_ptr(),
        body_len: body.len(),
        source: FfiSource::None,
        error_code: error.into(),
        error_message: message.as_ptr(),
    };
    callback(id, &outcome, user_data.0);
}

pub(crate) fn report_cancel(callback: FfiOutcomeCallback, id: u64, user_data: UserData) {
    let outcome = FfiOutcome {
        kind: FfiOutcomeKind::Cancelled,
        status: 0,
        body: std::ptr::null(),
        body_len: 0,
        source: FfiSource::None,
        error_code: FfiErrorCode::Ok,
        error_message: std::ptr::null(),
    };
    callback(id, &outcome, user_data.0);
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Parks responders under integer tokens until C answers them.
#[derive(Default)]
pub struct CredentialBridge {
    callback: Mutex<Option<(FfiCredentialCallback, UserData)>>,
    pending: Mutex<HashMap<u64, CredentialResponder>>,
    next_token: AtomicU64,
}

impl CredentialBridge {
    pub(crate) fn set_callback(&self, callback: Option<FfiCredentialCallback>, user_data: UserData) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) =
            callback.map(|cb| (cb, user_data));
    }

    /// Take the responder parked under `token`, dropping any whose
    /// operation has since gone away.
    pub(crate) fn take(&self, token: u64) -> Option<CredentialResponder> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|_, responder| !responder.is_cancelled());
        pending.remove(&token)
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// `CredentialHandler` that forwards challenges to the C callback.
pub(crate) struct BridgeHandler(pub std::sync::Arc<CredentialBridge>);

impl CredentialHandler for BridgeHandler {
    fn challenge(&self, challenge: AuthChallenge, responder: CredentialResponder) {
        let registered = *self
            .0
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some((callback, user_data)) = registered else {
            responder.no_credential();
            return;
        };
        let token = self.0.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        self.0
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, responder);

        let url = c_string(challenge.url);
        let scheme = c_string(challenge.scheme);
        let realm = challenge.realm.map(c_string);
        let ffi = FfiChallenge {
            url: url.as_ptr(),
            scheme: scheme.as_ptr(),
            realm: realm.as_ref().map_or(std::ptr::null(), |r| r.as_ptr()),
            previous_failures: challenge.previous_failures,
        };
        callback(token, &ffi, user_data.0);
    }
}
