//! MRD streaming protocol implementation
//!
//! This crate provides the framed message protocol and connection abstraction
//! used to move magnetic-resonance data (raw acquisitions, reconstructed
//! images, physiological waveforms) and control messages over one duplex
//! transport.
//!
//! # Features
//! - Typed message set: config, metadata, acquisition, image, waveform, text,
//!   logging, close
//! - Wire codec for the `[type-id][length][payload]` frame format
//! - Split connections: a single-pass inbound message sequence and a
//!   single-writer outbound half with one send operation per message kind

pub mod codec;
pub mod connection;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use connection::{
    Connection, ConnectionReader, ConnectionWriter, InboundChannel, OutboundChannel, RecordCounts,
};
pub use error::{MrdError, Result};
pub use types::{
    Acquisition, AcquisitionFlag, AcquisitionHeader, EncodingCounters, Image, ImageDataType,
    ImageHeader, ImageType, LogLevel, StreamMessage, Waveform, WaveformHeader,
};

/// MRD protocol version
pub const MRD_VERSION: &str = "0.1.0";

/// Default MRD streaming port
pub const DEFAULT_MRD_PORT: u16 = 9002;
