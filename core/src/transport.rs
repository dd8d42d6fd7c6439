//! The I/O boundary: executing one `HttpRequest`.
//!
//! # Design
//! The dispatcher never opens sockets. It hands a built request to a
//! `Transport` and interprets whatever comes back, which keeps every cache,
//! dedup and freeze decision testable with a scripted stub. `UreqTransport`
//! is the production implementation: ureq is blocking, so each call runs on
//! tokio's blocking pool and only that worker thread waits on the network.
//! Each call carries its own deadline so an abandoned call cannot pin that
//! thread forever.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::TransportError;
use crate::http::{self, HttpRequest, HttpResponse};
use crate::store_io;

/// Which half of the exchange a progress report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub direction: Direction,
    pub completed: u64,
    pub total: Option<u64>,
}

impl Progress {
    /// Completed fraction in `0.0..=1.0`, when the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.completed as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

/// Progress callback handed to a transport. May be called from any thread,
/// any number of times during one transfer.
pub type ProgressSink = Arc<dyn Fn(Progress) + Send + Sync>;

/// Executes HTTP requests. Every status code is a successful `send`;
/// `Err` means no response was obtained.
///
/// When `request.download_to` is set, a 2xx body is written to that file
/// and the returned body is empty; other statuses keep their body in memory.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(
        &self,
        request: HttpRequest,
        progress: ProgressSink,
    ) -> Result<HttpResponse, TransportError>;
}

const READ_CHUNK: usize = 16 * 1024;

/// Blocking `ureq` agent run on tokio's blocking pool.
#[derive(Clone)]
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new() -> Self {
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .new_agent();
        Self { agent }
    }

    fn execute(
        agent: &ureq::Agent,
        request: &HttpRequest,
        progress: &ProgressSink,
    ) -> Result<HttpResponse, TransportError> {
        let mut builder = ureq::http::Request::builder()
            .method(request.method.as_str())
            .uri(request.url.as_str());
        for (k, v) in &request.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }

        let result = match request.body.as_deref() {
            Some(body) => {
                let req = builder
                    .body(body)
                    .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
                let req = agent
                    .configure_request(req)
                    .timeout_global(request.timeout)
                    .build();
                agent.run(req)
            }
            None => {
                let req = builder
                    .body(())
                    .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
                let req = agent
                    .configure_request(req)
                    .timeout_global(request.timeout)
                    .build();
                agent.run(req)
            }
        };
        let mut response = result.map_err(map_ureq_error)?;

        if let Some(body) = &request.body {
            let len = body.len() as u64;
            progress(Progress {
                direction: Direction::Upload,
                completed: len,
                total: Some(len),
            });
        }

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let total = http::header(&headers, "content-length").and_then(|v| v.trim().parse::<u64>().ok());

        let mut reader = response.body_mut().as_reader();
        let body = match &request.download_to {
            Some(path) if (200..300).contains(&status) => {
                let written = download(&mut reader, path, total, progress)?;
                debug!(status, bytes = written, path = %path.display(), "download finished");
                Vec::new()
            }
            _ => {
                let mut body = Vec::with_capacity(total.unwrap_or(0).min(8 * 1024 * 1024) as usize);
                read_chunks(&mut reader, total, progress, |chunk| {
                    body.extend_from_slice(chunk);
                    Ok(())
                })?;
                body
            }
        };

        debug!(status, bytes = body.len(), url = %request.url, "transfer finished");
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Feed the body to `sink` chunk by chunk, reporting download progress.
/// Returns the byte count.
fn read_chunks(
    reader: &mut impl Read,
    total: Option<u64>,
    progress: &ProgressSink,
    mut sink: impl FnMut(&[u8]) -> Result<(), TransportError>,
) -> Result<u64, TransportError> {
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut completed = 0u64;
    loop {
        let n = reader
            .read(&mut chunk)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if n == 0 {
            return Ok(completed);
        }
        sink(&chunk[..n])?;
        completed += n as u64;
        progress(Progress {
            direction: Direction::Download,
            completed,
            total,
        });
    }
}

/// Stream the body into a temp file next to `path` and rename it into
/// place, so `path` only ever holds a complete download.
fn download(
    reader: &mut impl Read,
    path: &Path,
    total: Option<u64>,
    progress: &ProgressSink,
) -> Result<u64, TransportError> {
    let local = |e: std::io::Error| TransportError::Download(format!("{}: {e}", path.display()));
    let temp = store_io::temp_sibling(path);
    let result = File::create(&temp).map_err(local).and_then(|mut file| {
        let written = read_chunks(reader, total, progress, |chunk| file.write_all(chunk).map_err(local))?;
        file.sync_all().map_err(local)?;
        fs::rename(&temp, path).map_err(local)?;
        Ok(written)
    });
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for UreqTransport {
    async fn send(
        &self,
        request: HttpRequest,
        progress: ProgressSink,
    ) -> Result<HttpResponse, TransportError> {
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || Self::execute(&agent, &request, &progress))
            .await
            .map_err(|e| TransportError::Io(format!("transfer worker failed: {e}")))?
    }
}

fn map_ureq_error(err: ureq::Error) -> TransportError {
    match err {
        ureq::Error::HostNotFound => TransportError::HostNotFound(err.to_string()),
        ureq::Error::ConnectionFailed => TransportError::Connection(err.to_string()),
        ureq::Error::Timeout(_) => TransportError::Connection(err.to_string()),
        ureq::Error::Io(e) => TransportError::Io(e.to_string()),
        ureq::Error::BadUri(uri) => TransportError::InvalidRequest(uri),
        ureq::Error::Http(e) => TransportError::InvalidRequest(e.to_string()),
        other => TransportError::Protocol(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_handles_unknown_and_empty_totals() {
        let p = |completed, total| Progress {
            direction: Direction::Download,
            completed,
            total,
        };
        assert_eq!(p(5, None).fraction(), None);
        assert_eq!(p(0, Some(0)).fraction(), Some(1.0));
        assert_eq!(p(25, Some(100)).fraction(), Some(0.25));
        assert_eq!(p(200, Some(100)).fraction(), Some(1.0));
    }

    #[test]
    fn download_lands_whole_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink: ProgressSink = {
            let seen = seen.clone();
            Arc::new(move |p: Progress| seen.lock().unwrap().push(p.completed))
        };
        let data = vec![7u8; READ_CHUNK + 10];

        let written = download(&mut data.as_slice(), &path, Some(data.len() as u64), &sink).unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(fs::read(&path).unwrap(), data);
        assert_eq!(*seen.lock().unwrap(), vec![READ_CHUNK as u64, data.len() as u64]);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn unwritable_download_target_is_not_a_connectivity_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("file.bin");
        let err = download(&mut &b"data"[..], &path, None, &(Arc::new(|_: Progress| {}) as ProgressSink)).unwrap_err();
        assert!(matches!(err, TransportError::Download(_)));
        assert!(!err.is_connectivity());
    }

    #[test]
    fn ureq_connectivity_errors_map_to_connectivity() {
        assert!(map_ureq_error(ureq::Error::HostNotFound).is_connectivity());
        assert!(map_ureq_error(ureq::Error::ConnectionFailed).is_connectivity());
        assert!(!map_ureq_error(ureq::Error::BadUri("::".into())).is_connectivity());
    }

    #[tokio::test]
    async fn refused_connection_is_a_connectivity_error() {
        // Bind then drop to get a port nothing listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let request = HttpRequest {
            method: crate::http::HttpMethod::Get,
            url: format!("http://127.0.0.1:{port}/"),
            headers: Vec::new(),
            body: None,
            timeout: Some(std::time::Duration::from_secs(5)),
            download_to: None,
        };
        let err = UreqTransport::new()
            .send(request, Arc::new(|_| {}))
            .await
            .unwrap_err();
        assert!(err.is_connectivity(), "unexpected error: {err:?}");
    }
}
