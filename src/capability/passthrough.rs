//! Store-and-forward capability: returns image groups unchanged

use async_trait::async_trait;
use tracing::{debug, info};

use mrd::{Acquisition, AcquisitionFlag, Image, ImageType, OutboundChannel};

use super::{Capability, Settings};

/// Retains every record kind and forwards images without modification
///
/// Raw k-space groups are only summarized; the inbound mirror is responsible
/// for persisting them.
pub struct Passthrough;

#[async_trait]
impl Capability for Passthrough {
    fn settings(&self) -> Settings {
        Settings {
            keep_acquisition: true,
            keep_image: true,
            keep_waveform: true,
            acquisition_ignore: Vec::new(),
            acquisition_trigger: vec![AcquisitionFlag::LastInSlice],
            image_select: vec![
                ImageType::Unset,
                ImageType::Magnitude,
                ImageType::Phase,
                ImageType::Real,
                ImageType::Imag,
                ImageType::Complex,
            ],
            grouping_fields: vec![crate::dispatch::grouping::IndexField::Slice],
        }
    }

    async fn process_acquisition(
        &self,
        group: &[Acquisition],
        index: usize,
        _channel: &mut dyn OutboundChannel,
        _metadata: &str,
    ) -> anyhow::Result<Vec<Image>> {
        let samples: usize = group.iter().map(|acq| acq.data.len() / 2).sum();
        info!(
            "Passthrough: acquisition group {} holds {} readouts ({} complex samples)",
            index,
            group.len(),
            samples
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
            "Passthrough: forwarding image group {} ({} images) unchanged",
            index,
            group.len()
        );
        Ok(group.to_vec())
    }
}
