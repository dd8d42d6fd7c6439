//! C-ABI wrapper around `netkit-core`.
//!
//! # Overview
//! Lets a native host drive the engine: build requests, submit them with a
//! C callback, cancel them, forward connectivity changes, trigger replays
//! of frozen work and answer authentication challenges.
//!
//! # Design
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - `FfiEngine` owns a multi-threaded tokio runtime; callbacks arrive on
//!   its worker threads, or on the submitting thread for memory cache hits.
//! - Handles returned as pointers are owned by the caller and released with
//!   the matching `netkit_*_free` function. Strings returned by the library
//!   are released with `netkit_free_string`.
//! - Credential challenges are parked under an integer token; the host
//!   answers with `netkit_resolve_credential` or
//!   `netkit_resolve_no_credential`, from any thread, at any later time.

pub mod types;

use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use netkit_core::{Credential, Engine, EngineConfig, Observer, OperationId};
use tracing_subscriber::EnvFilter;

use types::*;

/// Borrow a C string as UTF-8. Null or invalid UTF-8 is `None`.
fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

fn set_error(out: *mut FfiErrorCode, code: FfiErrorCode) {
    if !out.is_null() {
        unsafe { *out = code };
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install a compact `tracing` subscriber. `filter` uses `RUST_LOG`
/// syntax; null means `RUST_LOG` or `info`. Returns false if a subscriber
/// was already installed.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_init_logging(filter: *const c_char) -> bool {
    catch_unwind(|| {
        let filter = match str_arg(filter) {
            Some(directives) => EnvFilter::new(directives),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .try_init()
            .is_ok()
    })
    .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Engine lifecycle
// ---------------------------------------------------------------------------

/// Create an engine.
///
/// `config_toml` may be null for defaults. `data_dir`, when not null,
/// overrides the configured data directory. On failure returns null and
/// writes the reason to `out_error` (if not null).
/// The caller must free the returned pointer with `netkit_engine_free`.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_engine_new(
    config_toml: *const c_char,
    data_dir: *const c_char,
    out_error: *mut FfiErrorCode,
) -> *mut FfiEngine {
    catch_unwind(AssertUnwindSafe(|| {
        let config = if config_toml.is_null() {
            Ok(EngineConfig::default())
        } else {
            match str_arg(config_toml) {
                Some(text) => EngineConfig::from_toml_str(text),
                None => {
                    set_error(out_error, FfiErrorCode::InvalidArg);
                    return std::ptr::null_mut();
                }
            }
        };
        let mut config = match config {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "rejected engine configuration");
                set_error(out_error, FfiErrorCode::Config);
                return std::ptr::null_mut();
            }
        };
        if let Some(dir) = str_arg(data_dir) {
            config.data_dir = PathBuf::from(dir);
        }

        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .thread_name("netkit")
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(err) => {
                tracing::warn!(error = %err, "failed to start runtime");
                set_error(out_error, FfiErrorCode::Runtime);
                return std::ptr::null_mut();
            }
        };

        let credentials = Arc::new(CredentialBridge::default());
        let built = Engine::builder(config)
            .runtime(runtime.handle().clone())
            .credential_handler(BridgeHandler(credentials.clone()))
            .build();
        match built {
            Ok(engine) => {
                set_error(out_error, FfiErrorCode::Ok);
                Box::into_raw(Box::new(FfiEngine {
                    engine,
                    credentials,
                    runtime,
                }))
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to build engine");
                set_error(out_error, (&err).into());
                std::ptr::null_mut()
            }
        }
    }))
    .unwrap_or_else(|_| {
        set_error(out_error, FfiErrorCode::Panic);
        std::ptr::null_mut()
    })
}

/// Freeze in-flight freezable work and stop accepting submissions.
/// Returns how many operations were frozen.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_engine_shutdown(engine: *const FfiEngine) -> u32 {
    if engine.is_null() {
        return 0;
    }
    catch_unwind(AssertUnwindSafe(|| {
        let engine = unsafe { &*engine };
        engine.engine.shutdown() as u32
    }))
    .unwrap_or(0)
}

/// Shut down and free an engine created by `netkit_engine_new`. Safe to
/// call with null. Must not be called from inside one of its callbacks.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_engine_free(engine: *mut FfiEngine) {
    if !engine.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(engine) });
        }));
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Start a request for `path_or_url` on the configured host, with the
/// host's default headers.
///
/// Returns null if an argument is null or not UTF-8.
/// The caller must free the returned pointer with `netkit_request_free`.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_request_new(
    engine: *const FfiEngine,
    method: FfiHttpMethod,
    path_or_url: *const c_char,
) -> *mut FfiRequest {
    catch_unwind(AssertUnwindSafe(|| {
        if engine.is_null() {
            return std::ptr::null_mut();
        }
        let Some(path) = str_arg(path_or_url) else {
            return std::ptr::null_mut();
        };
        let engine = unsafe { &*engine };
        let mut inner = engine.engine.request(path);
        inner.method = method.into();
        Box::into_raw(Box::new(FfiRequest { inner }))
    }))
    .unwrap_or(std::ptr::null_mut())
}

/// Run `edit` on a live request, mapping null arguments to `NullArg`.
fn with_request(request: *mut FfiRequest, edit: impl FnOnce(&mut FfiRequest) -> FfiErrorCode) -> FfiErrorCode {
    if request.is_null() {
        return FfiErrorCode::NullArg;
    }
    catch_unwind(AssertUnwindSafe(|| edit(unsafe { &mut *request })))
        .unwrap_or(FfiErrorCode::Panic)
}

#[unsafe(no_mangle)]
pub extern "C" fn netkit_request_add_header(
    request: *mut FfiRequest,
    name: *const c_char,
    value: *const c_char,
) -> FfiErrorCode {
    with_request(request, |req| match (str_arg(name), str_arg(value)) {
        (Some(name), Some(value)) => {
            req.inner.add_header(name, value);
            FfiErrorCode::Ok
        }
        _ => FfiErrorCode::NullArg,
    })
}

/// Add a string parameter. It lands in the query or the body depending on
/// the method and encoding.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_request_add_param(
    request: *mut FfiRequest,
    name: *const c_char,
    value: *const c_char,
) -> FfiErrorCode {
    with_request(request, |req| match (str_arg(name), str_arg(value)) {
        (Some(name), Some(value)) => {
            req.inner.add_param(name, value);
            FfiErrorCode::Ok
        }
        _ => FfiErrorCode::NullArg,
    })
}

/// Attach a pre-encoded body. `body` may be null only when `len` is 0.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_request_set_body(
    request: *mut FfiRequest,
    body: *const u8,
    len: usize,
    content_type: *const c_char,
) -> FfiErrorCode {
    with_request(request, |req| {
        let Some(content_type) = str_arg(content_type) else {
            return FfiErrorCode::NullArg;
        };
        let bytes = match (body.is_null(), len) {
            (_, 0) => Vec::new(),
            (true, _) => return FfiErrorCode::NullArg,
            (false, len) => unsafe { std::slice::from_raw_parts(body, len) }.to_vec(),
        };
        req.inner.set_body(bytes, content_type);
        FfiErrorCode::Ok
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn netkit_request_set_freezable(request: *mut FfiRequest, freezable: bool) -> FfiErrorCode {
    with_request(request, |req| {
        req.inner.set_freezable(freezable);
        FfiErrorCode::Ok
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn netkit_request_set_cache_policy(
    request: *mut FfiRequest,
    policy: FfiCachePolicy,
) -> FfiErrorCode {
    with_request(request, |req| {
        req.inner.set_cache_policy(policy.into());
        FfiErrorCode::Ok
    })
}

/// Write a successful body to the file at `path` instead of delivering it.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_request_set_download_path(
    request: *mut FfiRequest,
    path: *const c_char,
) -> FfiErrorCode {
    with_request(request, |req| match str_arg(path) {
        Some(path) => {
            req.inner.set_download_path(path);
            FfiErrorCode::Ok
        }
        None => FfiErrorCode::NullArg,
    })
}

/// Render the request as a cURL command line, for logging.
/// The caller must free the returned string with `netkit_free_string`.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_request_to_curl(request: *const FfiRequest) -> *mut c_char {
    if request.is_null() {
        return std::ptr::null_mut();
    }
    catch_unwind(AssertUnwindSafe(|| {
        let request = unsafe { &*request };
        c_string(request.inner.to_curl()).into_raw()
    }))
    .unwrap_or(std::ptr::null_mut())
}

/// Free a request created by `netkit_request_new`. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_request_free(request: *mut FfiRequest) {
    if !request.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(request) });
        }));
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Submit a copy of `request`. The request stays owned by the caller and
/// may be submitted again.
///
/// `callback` receives every outcome for the returned id; it may run before
/// this function returns. Returns 0 if an argument is null.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_submit(
    engine: *const FfiEngine,
    request: *const FfiRequest,
    callback: Option<FfiOutcomeCallback>,
    user_data: *mut c_void,
) -> u64 {
    catch_unwind(AssertUnwindSafe(|| {
        if engine.is_null() || request.is_null() {
            return 0;
        }
        let (engine, request) = unsafe { (&*engine, &*request) };
        let user_data = UserData(user_data);

        // The id is only known after submission, and a memory hit reports
        // during it; read it from a slot filled right after `submit`.
        let slot = Arc::new(std::sync::OnceLock::new());
        let observer = match callback {
            Some(cb) => {
                let (complete, error, cancel) = (slot.clone(), slot.clone(), slot.clone());
                Observer::new()
                    .on_complete(move |response| {
                        report_response(cb, id_of(&complete), response, user_data)
                    })
                    .on_error(move |err| report_error(cb, id_of(&error), err, user_data))
                    .on_cancel(move || report_cancel(cb, id_of(&cancel), user_data))
            }
            None => Observer::new(),
        };
        let id = engine.engine.submit(request.inner.clone(), observer);
        let _ = slot.set(id.as_u64());
        id.as_u64()
    }))
    .unwrap_or(0)
}

fn id_of(slot: &std::sync::OnceLock<u64>) -> u64 {
    slot.get().copied().unwrap_or(0)
}

/// Withdraw one submission. Returns false if it already finished.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_cancel(engine: *const FfiEngine, id: u64) -> bool {
    if engine.is_null() {
        return false;
    }
    catch_unwind(AssertUnwindSafe(|| {
        let engine = unsafe { &*engine };
        engine.engine.cancel(OperationId::from_u64(id))
    }))
    .unwrap_or(false)
}

/// Forward the platform's connectivity state. Going from unreachable to
/// reachable replays frozen operations.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_set_reachable(engine: *const FfiEngine, reachable: bool) {
    if engine.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let engine = unsafe { &*engine };
        engine.engine.set_reachable(reachable);
    }));
}

/// Replay frozen operations now, blocking until the replay finishes.
/// Writes the number replayed to `out_replayed` (if not null). Must not be
/// called from inside a callback.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_thaw(engine: *const FfiEngine, out_replayed: *mut u32) -> FfiErrorCode {
    if engine.is_null() {
        return FfiErrorCode::NullArg;
    }
    catch_unwind(AssertUnwindSafe(|| {
        let engine = unsafe { &*engine };
        match engine.runtime.block_on(engine.engine.thaw()) {
            Ok(replayed) => {
                if !out_replayed.is_null() {
                    unsafe { *out_replayed = replayed as u32 };
                }
                FfiErrorCode::Ok
            }
            Err(err) => {
                tracing::warn!(error = %err, "replay failed");
                FfiErrorCode::Store
            }
        }
    }))
    .unwrap_or(FfiErrorCode::Panic)
}

#[unsafe(no_mangle)]
pub extern "C" fn netkit_frozen_count(engine: *const FfiEngine) -> u32 {
    if engine.is_null() {
        return 0;
    }
    catch_unwind(AssertUnwindSafe(|| {
        let engine = unsafe { &*engine };
        engine.engine.frozen_count() as u32
    }))
    .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Register the callback that receives authentication challenges. Null
/// unregisters it; challenges are then answered with no credential.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_set_credential_callback(
    engine: *const FfiEngine,
    callback: Option<FfiCredentialCallback>,
    user_data: *mut c_void,
) -> FfiErrorCode {
    if engine.is_null() {
        return FfiErrorCode::NullArg;
    }
    catch_unwind(AssertUnwindSafe(|| {
        let engine = unsafe { &*engine };
        engine.credentials.set_callback(callback, UserData(user_data));
        FfiErrorCode::Ok
    }))
    .unwrap_or(FfiErrorCode::Panic)
}

/// Answer challenge `token` with Basic credentials. `InvalidArg` means the
/// token is unknown, already answered, or its operation was cancelled.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_resolve_credential(
    engine: *const FfiEngine,
    token: u64,
    username: *const c_char,
    password: *const c_char,
) -> FfiErrorCode {
    if engine.is_null() {
        return FfiErrorCode::NullArg;
    }
    catch_unwind(AssertUnwindSafe(|| {
        let (Some(username), Some(password)) = (str_arg(username), str_arg(password)) else {
            return FfiErrorCode::NullArg;
        };
        let engine = unsafe { &*engine };
        match engine.credentials.take(token) {
            Some(responder) => {
                responder.resolve(Credential::basic(username, password));
                FfiErrorCode::Ok
            }
            None => FfiErrorCode::InvalidArg,
        }
    }))
    .unwrap_or(FfiErrorCode::Panic)
}

/// Decline challenge `token`; the operation reports the `401`.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_resolve_no_credential(engine: *const FfiEngine, token: u64) -> FfiErrorCode {
    if engine.is_null() {
        return FfiErrorCode::NullArg;
    }
    catch_unwind(AssertUnwindSafe(|| {
        let engine = unsafe { &*engine };
        match engine.credentials.take(token) {
            Some(responder) => {
                responder.no_credential();
                FfiErrorCode::Ok
            }
            None => FfiErrorCode::InvalidArg,
        }
    }))
    .unwrap_or(FfiErrorCode::Panic)
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Free a string returned by this library. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn netkit_free_string(s: *mut c_char) {
    if !s.is_null() {
        let _ = catch_unwind(|| {
            drop(unsafe { CString::from_raw(s) });
        });
    }
}
