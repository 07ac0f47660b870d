//! Client-side Sliding Sync protocol engine.
//!
//! Maintains one logical streaming conversation with a remote sliding-sync
//! server: a long-lived loop ([`controller::SlidingSync`]) issues successive
//! POST requests, each carrying only the delta of what changed since the last
//! one (§4.2 [`builder`]), and applies the responses it gets back to a sparse,
//! windowed room index (§4.4 [`list`]) while fanning out per-room data and
//! lifecycle events (§6 [`events`]).
//!
//! Everything outside this crate — event parsing, the timeline model, crypto,
//! media, the retry scheduler for outbound events — is an external
//! collaborator; this crate only owns the sync cycle itself.

pub mod applier;
pub mod builder;
pub mod controller;
pub mod error;
pub mod events;
pub mod extension;
pub mod list;
pub mod subscription;
pub mod transport;
pub mod wire;

pub use error::{Error, Result};
pub use extension::{Extension, Phase};
pub use list::ListShape;
pub use subscription::SubscriptionShape;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};

use crate::controller::SlidingSync;
use crate::transport::{AccessTokenProvider, ReqwestTransport, Transport};

/// The configuration surface (§6): everything needed to bootstrap a
/// [`SlidingSync`] engine before its first `start()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub proxy_base_url: String,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub lists: BTreeMap<String, ListShape>,

    #[serde(default)]
    pub default_room_subscription: SubscriptionShape,
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Config {
    pub fn new(proxy_base_url: impl Into<String>) -> Self {
        Self {
            proxy_base_url: proxy_base_url.into(),
            timeout_seconds: default_timeout_seconds(),
            lists: BTreeMap::new(),
            default_room_subscription: SubscriptionShape::default(),
        }
    }

    pub fn with_list(mut self, name: impl Into<String>, shape: ListShape) -> Self {
        self.lists.insert(name.into(), shape);
        self
    }
}

/// Build a [`SlidingSync`] engine from a [`Config`], a token provider, and any
/// extensions that should already be registered before the first request.
pub struct SlidingSyncBuilder {
    config: Config,
    token_provider: Arc<dyn AccessTokenProvider>,
    extensions: Vec<Box<dyn Extension>>,
    transport_override: Option<Arc<dyn Transport>>,
}

impl SlidingSyncBuilder {
    pub fn new(config: Config, token_provider: Arc<dyn AccessTokenProvider>) -> Self {
        Self { config, token_provider, extensions: Vec::new(), transport_override: None }
    }

    pub fn with_extension(mut self, extension: Box<dyn Extension>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Override the production `reqwest` transport, e.g. with a mock in tests.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport_override = Some(transport);
        self
    }

    pub async fn build(self) -> Result<SlidingSync> {
        if self.config.proxy_base_url.is_empty() {
            return Err(Error::bad_config("proxy_base_url must not be empty"));
        }

        let transport = self.transport_override.unwrap_or_else(|| {
            Arc::new(ReqwestTransport::new(self.config.proxy_base_url.clone(), self.token_provider.clone()))
                as Arc<dyn Transport>
        });

        let sliding_sync =
            SlidingSync::with_timeout(transport, Duration::from_secs(self.config.timeout_seconds));

        for (name, shape) in self.config.lists {
            sliding_sync.set_list(name, shape).await;
        }
        sliding_sync.modify_room_subscription_info(self.config.default_room_subscription).await;
        for extension in self.extensions {
            sliding_sync.register_extension(extension).await?;
        }

        Ok(sliding_sync)
    }
}

/// Convenience re-export matching the glossary's "room subscription": a room
/// id the application wants fetched regardless of list windowing.
pub type RoomId = OwnedRoomId;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockTransport, StaticToken};

    #[tokio::test]
    async fn builder_rejects_empty_base_url() {
        let config = Config::new("");
        let builder = SlidingSyncBuilder::new(config, Arc::new(StaticToken("tok".into())));
        assert!(builder.build().await.is_err());
    }

    #[tokio::test]
    async fn builder_seeds_initial_lists() {
        let config = Config::new("https://example.org").with_list(
            "a",
            ListShape { ranges: vec![(0, 9)], ..Default::default() },
        );
        let builder = SlidingSyncBuilder::new(config, Arc::new(StaticToken("tok".into())))
            .with_transport(Arc::new(MockTransport::new()));
        let sync = builder.build().await.unwrap();
        assert_eq!(sync.get_list_params("a").await.unwrap().ranges, vec![(0, 9)]);
    }
}
