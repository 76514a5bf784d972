//! Synthetic source datasets for demos and tests

use mrd::{
    Acquisition, AcquisitionFlag, AcquisitionHeader, Image, ImageHeader, ImageType, Waveform,
    WaveformHeader,
};

use super::{Dataset, MemoryDataset};

/// Checkerboard pixel pattern alternating between 0 and the window maximum
pub fn checkerboard_pixels(width: u16, height: u16) -> Vec<i16> {
    (0..height as usize)
        .flat_map(|y| {
            (0..width as usize).map(move |x| if (x + y) % 2 == 0 { 32767 } else { 0 })
        })
        .collect()
}

/// Source dataset of checkerboard magnitude images, one per slice
pub async fn checkerboard_images(matrix: u16, slices: u16) -> MemoryDataset {
    let dataset = MemoryDataset::new();
    dataset
        .write_xml_header(&study_header(matrix))
        .await
        .expect("memory dataset never fails");

    let pixels = checkerboard_pixels(matrix, matrix);
    for slice in 0..slices {
        let header = ImageHeader {
            slice,
            image_type: ImageType::Magnitude,
            image_series_index: 0,
            ..Default::default()
        };
        let image = Image::from_i16_pixels(header, matrix, matrix, &pixels, "");
        dataset
            .append_image("image_0", image)
            .await
            .expect("memory dataset never fails");
    }
    dataset
}

/// Source dataset of uniform k-space readouts, one slice per group of
/// `matrix` lines with the final line flagged last-in-slice
pub async fn uniform_kspace(matrix: u16, slices: u16, channels: u16) -> MemoryDataset {
    let dataset = MemoryDataset::new();
    dataset
        .write_xml_header(&study_header(matrix))
        .await
        .expect("memory dataset never fails");

    for slice in 0..slices {
        for line in 0..matrix {
            let mut header = AcquisitionHeader {
                active_channels: channels,
                number_of_samples: matrix,
                ..Default::default()
            };
            header.idx.slice = slice;
            header.idx.kspace_encode_step_1 = line;
            header.scan_counter = (slice * matrix + line) as u32;
            if line == matrix - 1 {
                header.set_flag(AcquisitionFlag::LastInSlice);
            }

            let mut data = Vec::with_capacity(2 * channels as usize * matrix as usize);
            for _ in 0..(channels as usize * matrix as usize) {
                data.push(1.0);
                data.push(0.0);
            }
            dataset
                .append_acquisition(Acquisition::new(header, data))
                .await
                .expect("memory dataset never fails");
        }
    }
    dataset
}

/// Attach a short physiological waveform to a dataset
pub async fn with_waveforms(dataset: MemoryDataset, count: u16) -> MemoryDataset {
    for index in 0..count {
        let header = WaveformHeader {
            waveform_id: 0,
            channels: 1,
            number_of_samples: 8,
            time_stamp: index as u32 * 8,
            ..Default::default()
        };
        let data = (0..8).map(|s| (index as u32 * 8) + s).collect();
        dataset
            .append_waveform(Waveform::new(header, data))
            .await
            .expect("memory dataset never fails");
    }
    dataset
}

fn study_header(matrix: u16) -> String {
    format!(
        "<ismrmrdHeader><encoding><encodedSpace><matrixSize>\
         <x>{m}</x><y>{m}</y><z>1</z>\
         </matrixSize></encodedSpace></encoding></ismrmrdHeader>",
        m = matrix
    )
}
