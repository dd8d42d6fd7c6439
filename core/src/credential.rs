//! Authentication challenges raised by a transfer.
//!
//! A `401` carrying `WWW-Authenticate` suspends the transfer task and hands
//! an `AuthChallenge` plus a `CredentialResponder` to the embedding
//! application. The task resumes when the responder is answered. Dropping
//! the responder unanswered is the same as answering `NoCredential`, and
//! cancelling the operation drops the waiting receiver, which the
//! application can observe through `is_cancelled`.

use base64::Engine as _;
use tokio::sync::oneshot;

use crate::http;

/// What the server asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub url: String,
    /// Authentication scheme, e.g. `Basic` or `Bearer`.
    pub scheme: String,
    pub realm: Option<String>,
    /// Challenges already answered for this transfer.
    pub previous_failures: u32,
}

impl AuthChallenge {
    /// Parse the first challenge of a `WWW-Authenticate` header.
    pub fn parse(url: &str, header: &str, previous_failures: u32) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = match header.split_once(char::is_whitespace) {
            Some((scheme, rest)) => (scheme, rest),
            None => (header, ""),
        };
        if scheme.is_empty() {
            return None;
        }
        Some(Self {
            url: url.to_string(),
            scheme: scheme.to_string(),
            realm: auth_param(rest, "realm"),
            previous_failures,
        })
    }

    pub(crate) fn from_headers(
        url: &str,
        headers: &[(String, String)],
        previous_failures: u32,
    ) -> Option<Self> {
        let value = http::header(headers, "www-authenticate")?;
        Self::parse(url, value, previous_failures)
    }
}

fn auth_param(params: &str, name: &str) -> Option<String> {
    params.split(',').find_map(|part| {
        let (k, v) = part.trim().split_once('=')?;
        if !k.trim().eq_ignore_ascii_case(name) {
            return None;
        }
        Some(v.trim().trim_matches('"').to_string())
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { username: String, password: String },
    Bearer(String),
}

impl Credential {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Value of the `Authorization` header for this credential.
    pub fn authorization(&self) -> String {
        match self {
            Credential::Basic { username, password } => {
                let token = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{password}"));
                format!("Basic {token}")
            }
            Credential::Bearer(token) => format!("Bearer {token}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialResolution {
    Use(Credential),
    NoCredential,
}

/// One-shot answer channel for a single challenge.
#[derive(Debug)]
pub struct CredentialResponder {
    tx: oneshot::Sender<CredentialResolution>,
}

impl CredentialResponder {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<CredentialResolution>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn resolve(self, credential: Credential) {
        let _ = self.tx.send(CredentialResolution::Use(credential));
    }

    pub fn no_credential(self) {
        let _ = self.tx.send(CredentialResolution::NoCredential);
    }

    /// The operation that raised the challenge is gone.
    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Answers authentication challenges, usually by asking the user.
///
/// Called from a transfer task; implementations must not block. Keep the
/// responder and answer it whenever the credential is known.
pub trait CredentialHandler: Send + Sync + 'static {
    fn challenge(&self, challenge: AuthChallenge, responder: CredentialResponder);
}

impl<F> CredentialHandler for F
where
    F: Fn(AuthChallenge, CredentialResponder) + Send + Sync + 'static,
{
    fn challenge(&self, challenge: AuthChallenge, responder: CredentialResponder) {
        self(challenge, responder)
    }
}

/// Wait for the answer. A dropped responder means no credential.
pub(crate) async fn await_resolution(
    rx: oneshot::Receiver<CredentialResolution>,
) -> CredentialResolution {
    rx.await.unwrap_or(CredentialResolution::NoCredential)
}
