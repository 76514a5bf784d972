//! Pluggable processing capabilities
//!
//! A capability declares how the dispatch engine should parse the incoming
//! data stream (its [`Settings`]) and provides the two processing handlers
//! invoked when a buffered group is flushed. Capabilities are resolved by
//! name from a [`CapabilityRegistry`] exactly once, before the dispatch loop
//! starts; an unknown name falls back to the registry's designated fallback
//! entry.

pub mod invertcontrast;
pub mod null;
pub mod passthrough;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use mrd::{Acquisition, AcquisitionFlag, Image, ImageType, MrdError, OutboundChannel, Result};

use crate::dispatch::grouping::{GroupingMask, IndexField};

/// Stream-parsing declaration supplied by a capability
///
/// - `keep_acquisition` / `keep_image` / `keep_waveform`: buffer records of
///   that kind and invoke the matching handler when a group completes
/// - `acquisition_ignore`: flags marking acquisitions to drop during load
/// - `acquisition_trigger`: flags forcing an immediate acquisition flush
/// - `image_select`: image types retained during load
/// - `grouping_fields`: index fields compared when grouping images
#[derive(Debug, Clone)]
pub struct Settings {
    pub keep_acquisition: bool,
    pub keep_image: bool,
    pub keep_waveform: bool,
    pub acquisition_ignore: Vec<AcquisitionFlag>,
    pub acquisition_trigger: Vec<AcquisitionFlag>,
    pub image_select: Vec<ImageType>,
    pub grouping_fields: Vec<IndexField>,
}

impl Settings {
    /// Grouping mask declared by these settings
    pub fn grouping_mask(&self) -> GroupingMask {
        GroupingMask::new(&self.grouping_fields)
    }
}

/// A processing routine invoked by the dispatch engine
///
/// Either handler may call outbound send operations (extra logging, interim
/// images) during its execution; returned images are forwarded by the engine
/// after the handler completes.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Stream-parsing settings for this capability
    fn settings(&self) -> Settings;

    /// Process an accumulated group of raw acquisitions
    async fn process_acquisition(
        &self,
        group: &[Acquisition],
        index: usize,
        channel: &mut dyn OutboundChannel,
        metadata: &str,
    ) -> anyhow::Result<Vec<Image>>;

    /// Process an accumulated group of images
    async fn process_image(
        &self,
        group: &[Image],
        index: usize,
        channel: &mut dyn OutboundChannel,
        metadata: &str,
    ) -> anyhow::Result<Vec<Image>>;
}

/// A capability resolved from the registry, fixed for one session
#[derive(Clone)]
pub struct ResolvedCapability {
    pub name: String,
    pub capability: Arc<dyn Capability>,
}

impl std::fmt::Debug for ResolvedCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCapability")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Name-to-capability registry with one designated fallback entry
pub struct CapabilityRegistry {
    entries: HashMap<String, Arc<dyn Capability>>,
    fallback: String,
}

impl CapabilityRegistry {
    /// Create an empty registry with the given fallback name
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            entries: HashMap::new(),
            fallback: fallback.into(),
        }
    }

    /// Registry preloaded with the built-in capabilities
    pub fn with_builtins() -> Self {
        let mut registry = Self::new("null");
        registry.register("null", Arc::new(null::Null));
        registry.register("passthrough", Arc::new(passthrough::Passthrough));
        registry.register("invertcontrast", Arc::new(invertcontrast::InvertContrast));
        registry
    }

    /// Register a capability under a name
    ///
    /// The trait bound enforces the two-handler interface and a typed
    /// settings declaration at registration, not at call time.
    pub fn register(&mut self, name: impl Into<String>, capability: Arc<dyn Capability>) {
        self.entries.insert(name.into(), capability);
    }

    /// Resolve a requested name, falling back to the designated entry
    ///
    /// Resolution happens once per session, before dispatch begins, and is
    /// never retried mid-session. A missing fallback is a fatal
    /// configuration error.
    pub fn resolve(&self, requested: &str) -> Result<ResolvedCapability> {
        if let Some(capability) = self.entries.get(requested) {
            info!("Resolved capability '{}'", requested);
            return Ok(ResolvedCapability {
                name: requested.to_string(),
                capability: Arc::clone(capability),
            });
        }

        warn!(
            "Unrecognised capability '{}'; falling back to '{}'",
            requested, self.fallback
        );
        match self.entries.get(&self.fallback) {
            Some(capability) => Ok(ResolvedCapability {
                name: self.fallback.clone(),
                capability: Arc::clone(capability),
            }),
            None => Err(MrdError::ConfigResolution(format!(
                "Capability '{}' not found and fallback '{}' is not registered",
                requested, self.fallback
            ))),
        }
    }

    /// Name of the designated fallback entry
    pub fn fallback_name(&self) -> &str {
        &self.fallback
    }

    /// Change the designated fallback entry
    pub fn set_fallback(&mut self, name: impl Into<String>) {
        self.fallback = name.into();
    }

    /// Registered capability names
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}
