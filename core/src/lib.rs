//! HTTP operation engine with a two-tier response cache and an offline
//! queue.
//!
//! # Overview
//! Callers build an `OperationRequest` (usually through `Engine::request`)
//! and submit it with an `Observer`. The engine deduplicates concurrent
//! identical requests, answers from a memory + disk cache following HTTP
//! caching headers, revalidates stale entries with conditional requests,
//! and freezes operations that fail for lack of connectivity so they can be
//! replayed in order once the network returns.
//!
//! # Design
//! - `RequestKey` is the single identity used for dedup and cache lookup.
//! - All network I/O goes through the `Transport` trait; `UreqTransport` is
//!   the default and tests substitute a stub.
//! - The dispatcher owns every piece of shared mutable state behind one
//!   lock; the persistent cache and the freeze store own the disk.
//! - Nothing is process-global: caches and stores belong to the `Engine`
//!   that opened them.

pub mod cache;
pub mod cache_headers;
pub mod config;
pub mod credential;
mod dispatcher;
pub mod engine;
pub mod error;
pub mod freeze;
pub mod http;
pub mod key;
pub mod observer;
pub mod reachability;
pub mod request;
mod store_io;
pub mod transport;

pub use cache::{CacheEntry, MemoryCache, PersistentCache};
pub use config::{CacheConfig, EngineConfig, HostConfig, TransferConfig};
pub use credential::{
    AuthChallenge, Credential, CredentialHandler, CredentialResolution, CredentialResponder,
};
pub use dispatcher::{OperationId, OperationState};
pub use engine::{Engine, EngineBuilder};
pub use error::{ConfigError, EngineError, OperationError, StoreError, TransportError};
pub use freeze::{FreezeStore, FrozenOperation};
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use key::RequestKey;
pub use observer::{Observer, Response, ResponseSource};
pub use reachability::ReachabilityMonitor;
pub use request::{CachePolicy, OperationRequest, ParameterEncoding};
pub use transport::{Direction, Progress, ProgressSink, Transport, UreqTransport};
