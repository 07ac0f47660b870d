//! Transport adapter (§4's leaf component): abstracts POST-with-JSON-body,
//! cancellation, and status-code reporting from the rest of the engine. The
//! production implementation is a thin wrapper over `reqwest`; tests use a
//! `mockall`-generated mock instead of spinning up a real server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::wire::{RawSyncResponse, SyncRequest};

/// Supplies the current access token for the `Authorization` header. A trait
/// rather than a bare string since the embedding SDK may refresh tokens
/// out-of-band (OIDC refresh, soft-logout recovery, ...).
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// A fixed token, for tests and simple embedders.
pub struct StaticToken(pub String);

#[async_trait]
impl AccessTokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Cooperative cancellation signal for an in-flight request. Cloning shares the
/// same underlying flag; `cancel()` is idempotent.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Abstracts the POST-with-JSON-body call the sync loop makes every cycle.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `body` to the sliding-sync endpoint, with `pos` as the query
    /// parameter (absent when there is no streaming position yet, e.g. right
    /// after a reset). Returns `Error::Cancelled` if `cancel` fires first,
    /// `Error::HttpStatus`/`Error::SessionExpired` on non-2xx responses, and
    /// `Error::Transport` for network/parse failures.
    async fn send(
        &self,
        pos: Option<&str>,
        body: &SyncRequest,
        timeout: Duration,
        cancel: CancelToken,
    ) -> Result<RawSyncResponse>;
}

/// Production [`Transport`] backed by `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
    proxy_base_url: String,
    token_provider: Arc<dyn AccessTokenProvider>,
}

impl ReqwestTransport {
    pub fn new(proxy_base_url: impl Into<String>, token_provider: Arc<dyn AccessTokenProvider>) -> Self {
        Self {
            client: reqwest::Client::new(),
            proxy_base_url: proxy_base_url.into(),
            token_provider,
        }
    }

    const PATH: &'static str = "/_matrix/client/unstable/org.matrix.simplified_msc3575/sync";
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[instrument(level = "debug", skip(self, body, cancel))]
    async fn send(
        &self,
        pos: Option<&str>,
        body: &SyncRequest,
        timeout: Duration,
        cancel: CancelToken,
    ) -> Result<RawSyncResponse> {
        let mut url = format!("{}{}", self.proxy_base_url, Self::PATH);
        if let Some(pos) = pos {
            url.push_str("?pos=");
            url.push_str(&urlencoding_escape(pos));
        }

        let token = self.token_provider.access_token().await?;
        let request = self
            .client
            .post(&url)
            .bearer_auth(token)
            .timeout(timeout)
            .json(body)
            .send();

        let response = tokio::select! {
            result = request => result.map_err(|e| Error::Transport(e.to_string()))?,
            _ = cancel.cancelled() => {
                debug!("request cancelled before a response arrived");
                return Err(Error::Cancelled);
            }
        };

        let status = response.status();
        if status.as_u16() == 400 {
            let body_text = response.text().await.unwrap_or_default();
            if body_text.contains("expired") {
                warn!("server reported session expired");
                return Err(Error::SessionExpired);
            }
            return Err(Error::HttpStatus { code: 400 });
        }
        if !status.is_success() {
            return Err(Error::HttpStatus { code: status.as_u16() });
        }

        response
            .json::<RawSyncResponse>()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

fn urlencoding_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[test]
    fn escapes_reserved_characters() {
        assert_eq!(urlencoding_escape("a b"), "a%20b");
        assert_eq!(urlencoding_escape("abc_-.~"), "abc_-.~");
    }
}
