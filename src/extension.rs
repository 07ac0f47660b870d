//! Extension registry (§4.6): pluggable add-ons that piggyback their own request
//! and response fields onto the sync cycle, each with an ordered pre- or
//! post-processing phase relative to per-room/per-list event emission.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};

/// Whether an extension's `on_response` runs before or after the per-room and
/// per-list events derived from the same response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pre,
    Post,
}

/// A sliding-sync extension. Implementors are registered once under a stable
/// [`Extension::name`]; `on_request`/`on_response` are then driven by the sync
/// loop controller every cycle.
#[async_trait]
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    fn when(&self) -> Phase;

    /// Data to place under `extensions[name]` in the next request, or `None` to
    /// omit the field entirely. `initial` is true on the very first request ever,
    /// and again on the first request after a session-expiry reset.
    fn on_request(&self, initial: bool) -> Option<serde_json::Value>;

    /// Consume this extension's field of the response, if the server sent one.
    async fn on_response(&self, data: Option<&serde_json::Value>);
}

#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: Vec<Box<dyn Extension>>,
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("names", &self.extensions.iter().map(|e| e.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// §4.6: registering a second extension under an already-used name fails.
    /// Extensions registered mid-loop take effect from the next request, which
    /// falls out naturally since the registry is consulted fresh on every build.
    pub fn register(&mut self, extension: Box<dyn Extension>) -> Result<()> {
        if self.extensions.iter().any(|e| e.name() == extension.name()) {
            return Err(Error::DuplicateExtension(extension.name().to_string()));
        }
        debug!(extension = extension.name(), "registered extension");
        self.extensions.push(extension);
        Ok(())
    }

    pub fn build_request_extensions(&self, initial: bool) -> BTreeMap<String, serde_json::Value> {
        self.extensions
            .iter()
            .filter_map(|e| e.on_request(initial).map(|v| (e.name().to_string(), v)))
            .collect()
    }

    pub fn phase(&self, phase: Phase) -> impl Iterator<Item = &Box<dyn Extension>> {
        self.extensions.iter().filter(move |e| e.when() == phase)
    }
}
