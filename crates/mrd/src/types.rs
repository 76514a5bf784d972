//! Message and record types for the MRD streaming protocol

use serde::{Deserialize, Serialize};

use crate::error::{MrdError, Result};

/// One framed message on the wire, tagged by kind
///
/// Exactly one variant is active per frame; the payload shape depends on the
/// tag. `Close` is terminal for a session: nothing decoded after it is
/// processed.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// Name of a server-side capability configuration
    ConfigName(String),
    /// Literal configuration text supplied by the peer
    ConfigText(String),
    /// Serialized session metadata (flexible data header)
    Metadata(String),
    /// Free-form text message
    Text(String),
    /// Log message forwarded to the peer
    Logging(LogLevel, String),
    /// Raw k-space readout
    Acquisition(Acquisition),
    /// Reconstructed image
    Image(Image),
    /// Physiological waveform samples
    Waveform(Waveform),
    /// End of session
    Close,
}

impl StreamMessage {
    /// Wire type-id for this message kind
    pub fn type_id(&self) -> u32 {
        match self {
            StreamMessage::ConfigName(_) => crate::codec::MESSAGE_CONFIG_NAME,
            StreamMessage::ConfigText(_) => crate::codec::MESSAGE_CONFIG_TEXT,
            StreamMessage::Metadata(_) => crate::codec::MESSAGE_METADATA,
            StreamMessage::Close => crate::codec::MESSAGE_CLOSE,
            StreamMessage::Text(_) => crate::codec::MESSAGE_TEXT,
            StreamMessage::Logging(_, _) => crate::codec::MESSAGE_LOGGING,
            StreamMessage::Acquisition(_) => crate::codec::MESSAGE_ACQUISITION,
            StreamMessage::Image(_) => crate::codec::MESSAGE_IMAGE,
            StreamMessage::Waveform(_) => crate::codec::MESSAGE_WAVEFORM,
        }
    }

    /// Human-readable kind name, used in diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            StreamMessage::ConfigName(_) => "config-name",
            StreamMessage::ConfigText(_) => "config-text",
            StreamMessage::Metadata(_) => "metadata",
            StreamMessage::Close => "close",
            StreamMessage::Text(_) => "text",
            StreamMessage::Logging(_, _) => "logging",
            StreamMessage::Acquisition(_) => "acquisition",
            StreamMessage::Image(_) => "image",
            StreamMessage::Waveform(_) => "waveform",
        }
    }
}

/// Severity of a `Logging` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Wire encoding of the severity
    pub fn to_wire(self) -> u8 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warning => 2,
            LogLevel::Error => 3,
        }
    }

    /// Decode a severity byte
    pub fn from_wire(value: u8) -> Result<Self> {
        match value {
            0 => Ok(LogLevel::Debug),
            1 => Ok(LogLevel::Info),
            2 => Ok(LogLevel::Warning),
            3 => Ok(LogLevel::Error),
            other => Err(MrdError::protocol(format!(
                "Unknown logging severity {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARNING"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Acquisition flag bits
///
/// Discriminants are the one-based bit positions used on the wire; the flag
/// field stores `1 << (discriminant - 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionFlag {
    FirstInEncodeStep1 = 1,
    LastInEncodeStep1 = 2,
    FirstInSlice = 7,
    LastInSlice = 8,
    FirstInRepetition = 13,
    LastInRepetition = 14,
    IsNoiseMeasurement = 19,
    IsParallelCalibration = 20,
    IsNavigationData = 23,
    IsPhaseCorrData = 24,
    LastInMeasurement = 25,
    IsDummyScanData = 27,
}

impl AcquisitionFlag {
    /// Bit mask for this flag
    pub fn bit(self) -> u64 {
        1u64 << ((self as u64) - 1)
    }
}

/// Per-acquisition encoding loop counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodingCounters {
    pub kspace_encode_step_1: u16,
    pub kspace_encode_step_2: u16,
    pub average: u16,
    pub slice: u16,
    pub contrast: u16,
    pub phase: u16,
    pub repetition: u16,
    pub set: u16,
    pub segment: u16,
    pub user: [u16; 8],
}

/// Fixed-size header preceding raw k-space sample data
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionHeader {
    pub version: u16,
    pub flags: u64,
    pub measurement_uid: u32,
    pub scan_counter: u32,
    pub acquisition_time_stamp: u32,
    pub physiology_time_stamp: [u32; 3],
    pub number_of_samples: u16,
    pub active_channels: u16,
    pub trajectory_dimensions: u16,
    pub sample_time_us: f32,
    pub position: [f32; 3],
    pub read_dir: [f32; 3],
    pub phase_dir: [f32; 3],
    pub slice_dir: [f32; 3],
    pub patient_table_position: [f32; 3],
    pub idx: EncodingCounters,
}

impl Default for AcquisitionHeader {
    fn default() -> Self {
        Self {
            version: 1,
            flags: 0,
            measurement_uid: 0,
            scan_counter: 0,
            acquisition_time_stamp: 0,
            physiology_time_stamp: [0; 3],
            number_of_samples: 0,
            active_channels: 1,
            trajectory_dimensions: 0,
            sample_time_us: 0.0,
            position: [0.0; 3],
            read_dir: [0.0; 3],
            phase_dir: [0.0; 3],
            slice_dir: [0.0; 3],
            patient_table_position: [0.0; 3],
            idx: EncodingCounters::default(),
        }
    }
}

impl AcquisitionHeader {
    /// Check a single flag bit
    pub fn is_flag_set(&self, flag: AcquisitionFlag) -> bool {
        self.flags & flag.bit() != 0
    }

    /// Set a flag bit
    pub fn set_flag(&mut self, flag: AcquisitionFlag) {
        self.flags |= flag.bit();
    }

    /// Check whether any flag from `set` is present
    pub fn has_any_flag(&self, set: &[AcquisitionFlag]) -> bool {
        set.iter().any(|flag| self.is_flag_set(*flag))
    }
}

/// One raw k-space readout: header, optional trajectory, complex sample data
///
/// Samples are stored interleaved (re, im) as `f32`, `active_channels` blocks
/// of `number_of_samples` complex values each.
#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    pub header: AcquisitionHeader,
    /// `number_of_samples * trajectory_dimensions` values
    pub trajectory: Vec<f32>,
    /// `active_channels * number_of_samples` complex values, interleaved re/im
    pub data: Vec<f32>,
}

impl Acquisition {
    /// Create an acquisition from interleaved complex sample data
    pub fn new(header: AcquisitionHeader, data: Vec<f32>) -> Self {
        Self {
            header,
            trajectory: Vec::new(),
            data,
        }
    }

    /// Number of f32 values expected in the trajectory buffer
    pub fn expected_trajectory_len(&self) -> usize {
        self.header.number_of_samples as usize * self.header.trajectory_dimensions as usize
    }

    /// Number of f32 values expected in the sample buffer (2 per complex value)
    pub fn expected_data_len(&self) -> usize {
        2 * self.header.active_channels as usize * self.header.number_of_samples as usize
    }

    /// Complex sample at (channel, sample) as a (re, im) pair
    pub fn sample(&self, channel: usize, sample: usize) -> (f32, f32) {
        let base = 2 * (channel * self.header.number_of_samples as usize + sample);
        (self.data[base], self.data[base + 1])
    }

    pub fn is_flag_set(&self, flag: AcquisitionFlag) -> bool {
        self.header.is_flag_set(flag)
    }
}

/// Image content kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageType {
    /// No type recorded by the producer
    Unset = 0,
    Magnitude = 1,
    Phase = 2,
    Real = 3,
    Imag = 4,
    Complex = 5,
}

impl ImageType {
    pub fn to_wire(self) -> u16 {
        self as u16
    }

    pub fn from_wire(value: u16) -> Result<Self> {
        match value {
            0 => Ok(ImageType::Unset),
            1 => Ok(ImageType::Magnitude),
            2 => Ok(ImageType::Phase),
            3 => Ok(ImageType::Real),
            4 => Ok(ImageType::Imag),
            5 => Ok(ImageType::Complex),
            other => Err(MrdError::protocol(format!("Unknown image type {}", other))),
        }
    }
}

/// Element type of the pixel payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageDataType {
    Ushort = 1,
    Short = 2,
    Uint = 3,
    Int = 4,
    Float = 5,
    Double = 6,
    ComplexFloat = 7,
    ComplexDouble = 8,
}

impl ImageDataType {
    /// Size of one element in bytes
    pub fn element_size(self) -> usize {
        match self {
            ImageDataType::Ushort | ImageDataType::Short => 2,
            ImageDataType::Uint | ImageDataType::Int | ImageDataType::Float => 4,
            ImageDataType::Double | ImageDataType::ComplexFloat => 8,
            ImageDataType::ComplexDouble => 16,
        }
    }

    pub fn to_wire(self) -> u16 {
        self as u16
    }

    pub fn from_wire(value: u16) -> Result<Self> {
        match value {
            1 => Ok(ImageDataType::Ushort),
            2 => Ok(ImageDataType::Short),
            3 => Ok(ImageDataType::Uint),
            4 => Ok(ImageDataType::Int),
            5 => Ok(ImageDataType::Float),
            6 => Ok(ImageDataType::Double),
            7 => Ok(ImageDataType::ComplexFloat),
            8 => Ok(ImageDataType::ComplexDouble),
            other => Err(MrdError::protocol(format!(
                "Unknown image data type {}",
                other
            ))),
        }
    }
}

/// Fixed-size header preceding image pixel data
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageHeader {
    pub version: u16,
    pub data_type: ImageDataType,
    pub flags: u64,
    pub measurement_uid: u32,
    /// Matrix size as [x, y, z]
    pub matrix_size: [u16; 3],
    pub field_of_view: [f32; 3],
    pub channels: u16,
    pub position: [f32; 3],
    pub read_dir: [f32; 3],
    pub phase_dir: [f32; 3],
    pub slice_dir: [f32; 3],
    pub patient_table_position: [f32; 3],
    pub average: u16,
    pub slice: u16,
    pub contrast: u16,
    pub phase: u16,
    pub repetition: u16,
    pub set: u16,
    pub acquisition_time_stamp: u32,
    pub physiology_time_stamp: [u32; 3],
    pub image_type: ImageType,
    pub image_index: u16,
    pub image_series_index: u16,
}

impl Default for ImageHeader {
    fn default() -> Self {
        Self {
            version: 1,
            data_type: ImageDataType::Short,
            flags: 0,
            measurement_uid: 0,
            matrix_size: [0, 0, 1],
            field_of_view: [0.0; 3],
            channels: 1,
            position: [0.0; 3],
            read_dir: [0.0; 3],
            phase_dir: [0.0; 3],
            slice_dir: [0.0; 3],
            patient_table_position: [0.0; 3],
            average: 0,
            slice: 0,
            contrast: 0,
            phase: 0,
            repetition: 0,
            set: 0,
            acquisition_time_stamp: 0,
            physiology_time_stamp: [0; 3],
            image_type: ImageType::Magnitude,
            image_index: 0,
            image_series_index: 0,
        }
    }
}

impl ImageHeader {
    /// Number of pixel elements implied by the header dimensions
    pub fn pixel_count(&self) -> usize {
        self.channels as usize
            * self.matrix_size[2] as usize
            * self.matrix_size[1] as usize
            * self.matrix_size[0] as usize
    }

    /// Byte size of the pixel payload implied by dimensions and data type
    pub fn pixel_bytes(&self) -> usize {
        self.pixel_count() * self.data_type.element_size()
    }
}

/// One reconstructed image: header, raw pixel payload, attribute string
///
/// Pixel bytes are stored in wire order (little-endian elements, x fastest);
/// use the typed accessors to interpret them.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub header: ImageHeader,
    pub data: Vec<u8>,
    /// Free-form serialized key/value metadata
    pub attributes: String,
}

impl Image {
    /// Build a 2D short-integer image from row-major pixels
    pub fn from_i16_pixels(mut header: ImageHeader, width: u16, height: u16, pixels: &[i16], attributes: impl Into<String>) -> Self {
        header.data_type = ImageDataType::Short;
        header.matrix_size = [width, height, 1];
        header.channels = 1;
        let mut data = Vec::with_capacity(pixels.len() * 2);
        for v in pixels {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            header,
            data,
            attributes: attributes.into(),
        }
    }

    /// Interpret the pixel payload as i16 elements
    pub fn to_i16_pixels(&self) -> Result<Vec<i16>> {
        if self.header.data_type != ImageDataType::Short {
            return Err(MrdError::internal(format!(
                "Expected short pixel data, found {:?}",
                self.header.data_type
            )));
        }
        Ok(self
            .data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect())
    }

    /// Interpret the pixel payload as f32 elements
    pub fn to_f32_pixels(&self) -> Result<Vec<f32>> {
        if self.header.data_type != ImageDataType::Float {
            return Err(MrdError::internal(format!(
                "Expected float pixel data, found {:?}",
                self.header.data_type
            )));
        }
        Ok(self
            .data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

/// Fixed-size header preceding waveform sample data
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformHeader {
    pub version: u16,
    pub flags: u64,
    pub measurement_uid: u32,
    pub scan_counter: u32,
    pub time_stamp: u32,
    pub number_of_samples: u16,
    pub channels: u16,
    pub sample_time_us: f32,
    pub waveform_id: u16,
}

impl Default for WaveformHeader {
    fn default() -> Self {
        Self {
            version: 1,
            flags: 0,
            measurement_uid: 0,
            scan_counter: 0,
            time_stamp: 0,
            number_of_samples: 0,
            channels: 1,
            sample_time_us: 0.0,
            waveform_id: 0,
        }
    }
}

/// One physiological waveform record
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub header: WaveformHeader,
    /// `channels * number_of_samples` values
    pub data: Vec<u32>,
}

impl Waveform {
    pub fn new(header: WaveformHeader, data: Vec<u32>) -> Self {
        Self { header, data }
    }

    /// Number of u32 values expected in the sample buffer
    pub fn expected_data_len(&self) -> usize {
        self.header.channels as usize * self.header.number_of_samples as usize
    }
}
