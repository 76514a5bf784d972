//! Dataset adapter boundary
//!
//! The session core consumes persisted datasets through this trait; it never
//! implements a container file format itself. The in-memory implementation
//! backs the client's receive path and the test suites.

pub mod synthetic;

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use mrd::{Acquisition, Image, MrdError, Result, Waveform};

/// Persisted dataset adapter
///
/// Image data is organized into named groups; acquisitions and waveforms are
/// flat indexed sequences.
#[async_trait]
pub trait Dataset: Send + Sync {
    async fn read_xml_header(&self) -> Result<Option<String>>;
    async fn write_xml_header(&self, text: &str) -> Result<()>;

    async fn number_of_acquisitions(&self) -> Result<usize>;
    async fn read_acquisition(&self, index: usize) -> Result<Acquisition>;
    async fn append_acquisition(&self, acquisition: Acquisition) -> Result<()>;

    async fn image_groups(&self) -> Result<Vec<String>>;
    async fn number_of_images(&self, group: &str) -> Result<usize>;
    async fn read_image(&self, group: &str, index: usize) -> Result<Image>;
    async fn append_image(&self, group: &str, image: Image) -> Result<()>;

    async fn number_of_waveforms(&self) -> Result<usize>;
    async fn read_waveform(&self, index: usize) -> Result<Waveform>;
    async fn append_waveform(&self, waveform: Waveform) -> Result<()>;
}

#[derive(Default)]
struct MemoryDatasetInner {
    xml_header: Option<String>,
    acquisitions: Vec<Acquisition>,
    images: BTreeMap<String, Vec<Image>>,
    waveforms: Vec<Waveform>,
}

/// In-memory dataset
#[derive(Default)]
pub struct MemoryDataset {
    inner: Mutex<MemoryDatasetInner>,
}

impl MemoryDataset {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Dataset for MemoryDataset {
    async fn read_xml_header(&self) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().xml_header.clone())
    }

    async fn write_xml_header(&self, text: &str) -> Result<()> {
        self.inner.lock().unwrap().xml_header = Some(text.to_string());
        Ok(())
    }

    async fn number_of_acquisitions(&self) -> Result<usize> {
        Ok(self.inner.lock().unwrap().acquisitions.len())
    }

    async fn read_acquisition(&self, index: usize) -> Result<Acquisition> {
        self.inner
            .lock()
            .unwrap()
            .acquisitions
            .get(index)
            .cloned()
            .ok_or_else(|| MrdError::dataset(format!("No acquisition at index {}", index)))
    }

    async fn append_acquisition(&self, acquisition: Acquisition) -> Result<()> {
        self.inner.lock().unwrap().acquisitions.push(acquisition);
        Ok(())
    }

    async fn image_groups(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().unwrap().images.keys().cloned().collect())
    }

    async fn number_of_images(&self, group: &str) -> Result<usize> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .images
            .get(group)
            .map_or(0, Vec::len))
    }

    async fn read_image(&self, group: &str, index: usize) -> Result<Image> {
        self.inner
            .lock()
            .unwrap()
            .images
            .get(group)
            .and_then(|images| images.get(index))
            .cloned()
            .ok_or_else(|| {
                MrdError::dataset(format!("No image at index {} in group '{}'", index, group))
            })
    }

    async fn append_image(&self, group: &str, image: Image) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .images
            .entry(group.to_string())
            .or_default()
            .push(image);
        Ok(())
    }

    async fn number_of_waveforms(&self) -> Result<usize> {
        Ok(self.inner.lock().unwrap().waveforms.len())
    }

    async fn read_waveform(&self, index: usize) -> Result<Waveform> {
        self.inner
            .lock()
            .unwrap()
            .waveforms
            .get(index)
            .cloned()
            .ok_or_else(|| MrdError::dataset(format!("No waveform at index {}", index)))
    }

    async fn append_waveform(&self, waveform: Waveform) -> Result<()> {
        self.inner.lock().unwrap().waveforms.push(waveform);
        Ok(())
    }
}
