//! Fallback capability: consumes the stream without processing anything

use async_trait::async_trait;
use tracing::debug;

use mrd::{Acquisition, Image, OutboundChannel};

use super::{Capability, Settings};

/// Discards every record kind; used when a requested capability is unknown
pub struct Null;

#[async_trait]
impl Capability for Null {
    fn settings(&self) -> Settings {
        Settings {
            keep_acquisition: false,
            keep_image: false,
            keep_waveform: false,
            acquisition_ignore: Vec::new(),
            acquisition_trigger: Vec::new(),
            image_select: Vec::new(),
            grouping_fields: Vec::new(),
        }
    }

    async fn process_acquisition(
        &self,
        group: &[Acquisition],
        index: usize,
        _channel: &mut dyn OutboundChannel,
        _metadata: &str,
    ) -> anyhow::Result<Vec<Image>> {
        debug!(
            "Null capability dropping acquisition group {} ({} readouts)",
            index,
            group.len()
        );
        Ok(Vec::new())
    }

    async fn process_image(
        &self,
        group: &[Image],
        index: usize,
        _channel: &mut dyn OutboundChannel,
        _metadata: &str,
    ) -> anyhow::Result<Vec<Image>> {
        debug!(
            "Null capability dropping image group {} ({} images)",
            index,
            group.len()
        );
        Ok(Vec::new())
    }
}
