//! Callbacks a caller attaches to a submitted operation.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::OperationError;
use crate::http;
use crate::transport::Progress;

/// Where a delivered payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    /// A fresh cache entry; no transfer was needed.
    Cache,
    /// An expired entry delivered while a revalidation runs.
    StaleCache,
}

/// A delivered payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub source: ResponseSource,
    /// Where a download was written. The body is empty when this is set.
    pub file: Option<PathBuf>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        http::header(&self.headers, name)
    }

    /// Body as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn is_cached(&self) -> bool {
        self.source != ResponseSource::Network
    }
}

type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;
type CompleteFn = Arc<dyn Fn(&Response) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&OperationError) + Send + Sync>;
type CancelFn = Arc<dyn Fn() + Send + Sync>;

/// A set of callbacks. Any subset may be set; unset callbacks are skipped.
///
/// `on_complete` may fire twice for one submission: once with a
/// `StaleCache` payload and once more if revalidation returns new content.
/// Exactly one of the terminal signals (a final payload, an error or a
/// cancellation) is delivered unless the operation is frozen.
#[derive(Clone, Default)]
pub struct Observer {
    progress: Option<ProgressFn>,
    complete: Option<CompleteFn>,
    error: Option<ErrorFn>,
    cancel: Option<CancelFn>,
}

impl Observer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn(&Response) + Send + Sync + 'static) -> Self {
        self.complete = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&OperationError) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }

    pub fn on_cancel(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.cancel = Some(Arc::new(f));
        self
    }

    pub(crate) fn progress(&self, progress: Progress) {
        if let Some(f) = &self.progress {
            f(progress);
        }
    }

    pub(crate) fn complete(&self, response: &Response) {
        if let Some(f) = &self.complete {
            f(response);
        }
    }

    pub(crate) fn error(&self, error: &OperationError) {
        if let Some(f) = &self.error {
            f(error);
        }
    }

    pub(crate) fn cancel(&self) {
        if let Some(f) = &self.cancel {
            f();
        }
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("progress", &self.progress.is_some())
            .field("complete", &self.complete.is_some())
            .field("error", &self.error.is_some())
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn unset_callbacks_are_skipped() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let observer = Observer::new().on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        observer.error(&OperationError::Timeout(std::time::Duration::from_secs(1)));
        observer.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn response_helpers() {
        let response = Response {
            status: 200,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: br#"{"id":42}"#.to_vec(),
            source: ResponseSource::StaleCache,
            file: None,
        };
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["id"], 42);
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert!(response.is_cached());
        assert_eq!(response.text(), r#"{"id":42}"#);
    }
}
