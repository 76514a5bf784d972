//! Reference reconstruction capability: sum-of-squares recon plus contrast
//! inversion
//!
//! The acquisition handler sorts buffered readouts into a k-space grid,
//! transforms it to image space, combines channels by sum of squares and
//! hands the result straight to the image handler. The image handler
//! normalizes pixel values into the short-integer window and inverts them.

use std::f64::consts::PI;
use std::time::Instant;

use anyhow::{bail, ensure};
use async_trait::async_trait;
use tracing::debug;

use mrd::{
    Acquisition, AcquisitionFlag, AcquisitionHeader, Image, ImageDataType, ImageType, LogLevel,
    OutboundChannel,
};

use super::{Capability, Settings};
use crate::dispatch::grouping::IndexField;
use crate::helpers::{image_header_from_raw, MetaAttributes};

const WINDOW_MAX: f64 = 32767.0;

pub struct InvertContrast;

#[async_trait]
impl Capability for InvertContrast {
    fn settings(&self) -> Settings {
        Settings {
            keep_acquisition: true,
            keep_image: true,
            keep_waveform: false,
            acquisition_ignore: vec![
                AcquisitionFlag::IsNoiseMeasurement,
                AcquisitionFlag::IsParallelCalibration,
                AcquisitionFlag::IsPhaseCorrData,
                AcquisitionFlag::IsNavigationData,
            ],
            acquisition_trigger: vec![AcquisitionFlag::LastInSlice],
            image_select: vec![ImageType::Magnitude, ImageType::Unset],
            grouping_fields: vec![IndexField::Slice],
        }
    }

    async fn process_acquisition(
        &self,
        group: &[Acquisition],
        index: usize,
        channel: &mut dyn OutboundChannel,
        metadata: &str,
    ) -> anyhow::Result<Vec<Image>> {
        let started = Instant::now();
        ensure!(!group.is_empty(), "acquisition group {} is empty", index);

        let channels = group[0].header.active_channels as usize;
        let cols = group
            .iter()
            .map(|acq| acq.header.number_of_samples as usize)
            .max()
            .unwrap_or(0);
        let rows = group
            .iter()
            .map(|acq| acq.header.idx.kspace_encode_step_1 as usize)
            .max()
            .unwrap_or(0)
            + 1;
        ensure!(
            channels > 0 && cols > 0,
            "acquisition group {} carries no sample data",
            index
        );
        debug!(
            "Reconstructing group {}: {} readouts into [{} x {} x {}]",
            index,
            group.len(),
            channels,
            rows,
            cols
        );

        // Sort readouts into the zero-padded k-space grid; the reference
        // header is the readout closest to the centre line recorded in
        // idx.user[5].
        let mut grid = vec![(0.0f32, 0.0f32); channels * rows * cols];
        let mut reference: Option<(&AcquisitionHeader, i32)> = None;
        for acq in group {
            let row = acq.header.idx.kspace_encode_step_1 as usize;
            if row >= rows {
                continue;
            }
            let acq_channels = (acq.header.active_channels as usize).min(channels);
            let acq_cols = (acq.header.number_of_samples as usize).min(cols);
            for c in 0..acq_channels {
                for s in 0..acq_cols {
                    grid[(c * rows + row) * cols + s] = acq.sample(c, s);
                }
            }

            let centre = acq.header.idx.user[5] as i32;
            let distance = (acq.header.idx.kspace_encode_step_1 as i32 - centre).abs();
            if reference.map_or(true, |(_, best)| distance < best) {
                reference = Some((&acq.header, distance));
            }
        }
        let (reference, _) = reference.expect("group is non-empty");

        // Per-channel inverse transform, then sum-of-squares combination
        let mut combined = vec![0.0f64; rows * cols];
        for c in 0..channels {
            let image = inverse_dft_2d(&grid[c * rows * cols..(c + 1) * rows * cols], rows, cols);
            for (slot, (re, im)) in combined.iter_mut().zip(image) {
                *slot += re * re + im * im;
            }
        }
        for value in combined.iter_mut() {
            *value = value.sqrt();
        }

        let pixels = normalize_to_window(&combined);
        let mut header = image_header_from_raw(reference);
        header.image_index = index as u16;

        let mut attrs = MetaAttributes::new();
        attrs.set("DataRole", "Image");
        attrs.append("ImageProcessingHistory", "RESONANCE");
        attrs.set("WindowCenter", "16384");
        attrs.set("WindowWidth", "32768");
        attrs.set("Keep_image_geometry", "1");

        let image = Image::from_i16_pixels(
            header,
            cols as u16,
            rows as u16,
            &pixels,
            attrs.serialize(),
        );

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        channel
            .send_logging(
                LogLevel::Info,
                &format!("Total processing time: {:.2} ms", elapsed_ms),
            )
            .await?;

        // Invert contrast before returning, exactly as the image path does
        self.process_image(&[image], 0, channel, metadata).await
    }

    async fn process_image(
        &self,
        group: &[Image],
        index: usize,
        _channel: &mut dyn OutboundChannel,
        _metadata: &str,
    ) -> anyhow::Result<Vec<Image>> {
        debug!("Inverting image group {} ({} images)", index, group.len());

        let mut out = Vec::with_capacity(group.len());
        for image in group {
            let values: Vec<f64> = match image.header.data_type {
                ImageDataType::Short => image
                    .to_i16_pixels()?
                    .into_iter()
                    .map(|v| v as f64)
                    .collect(),
                ImageDataType::Float => image
                    .to_f32_pixels()?
                    .into_iter()
                    .map(|v| v as f64)
                    .collect(),
                other => bail!("Cannot invert image data of type {:?}", other),
            };

            let pixels = normalize_to_window(&values);
            let inverted: Vec<i16> = pixels
                .into_iter()
                .map(|v| (WINDOW_MAX as i16 - v).abs())
                .collect();

            let mut header = image.header;
            header.data_type = ImageDataType::Short;

            let mut attrs = MetaAttributes::deserialize(&image.attributes);
            attrs.set("DataRole", "Image");
            attrs.append("ImageProcessingHistory", "INVERT");
            attrs.set("WindowCenter", "16384");
            attrs.set("WindowWidth", "32768");
            attrs.set("SequenceDescriptionAdditional", "RESONANCE");
            attrs.set("Keep_image_geometry", "1");

            let mut data = Vec::with_capacity(inverted.len() * 2);
            for v in &inverted {
                data.extend_from_slice(&v.to_le_bytes());
            }
            out.push(Image {
                header,
                data,
                attributes: attrs.serialize(),
            });
        }
        Ok(out)
    }
}

/// Naive inverse 2D DFT, rows pass then columns pass
///
/// Group sizes here are small enough that the quadratic per-line transform
/// is acceptable; numerically heavy reconstruction belongs to external
/// toolkits, not this reference capability.
fn inverse_dft_2d(grid: &[(f32, f32)], rows: usize, cols: usize) -> Vec<(f64, f64)> {
    let mut stage: Vec<(f64, f64)> = grid
        .iter()
        .map(|&(re, im)| (re as f64, im as f64))
        .collect();

    for r in 0..rows {
        let line: Vec<(f64, f64)> = stage[r * cols..(r + 1) * cols].to_vec();
        let transformed = inverse_dft_1d(&line);
        stage[r * cols..(r + 1) * cols].copy_from_slice(&transformed);
    }
    for c in 0..cols {
        let line: Vec<(f64, f64)> = (0..rows).map(|r| stage[r * cols + c]).collect();
        let transformed = inverse_dft_1d(&line);
        for (r, value) in transformed.into_iter().enumerate() {
            stage[r * cols + c] = value;
        }
    }
    stage
}

fn inverse_dft_1d(line: &[(f64, f64)]) -> Vec<(f64, f64)> {
    let n = line.len();
    (0..n)
        .map(|k| {
            let mut acc = (0.0f64, 0.0f64);
            for (j, &(re, im)) in line.iter().enumerate() {
                let angle = 2.0 * PI * (k * j) as f64 / n as f64;
                let (sin, cos) = angle.sin_cos();
                acc.0 += re * cos - im * sin;
                acc.1 += re * sin + im * cos;
            }
            (acc.0 / n as f64, acc.1 / n as f64)
        })
        .collect()
}

/// Scale non-negative values into the 0..=32767 window and round
fn normalize_to_window(values: &[f64]) -> Vec<i16> {
    let max = values.iter().cloned().fold(0.0f64, f64::max);
    let scale = if max > 0.0 { WINDOW_MAX / max } else { 0.0 };
    values
        .iter()
        .map(|v| (v * scale).round().clamp(0.0, WINDOW_MAX) as i16)
        .collect()
}
