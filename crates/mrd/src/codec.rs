//! Wire codec for framed MRD messages
//!
//! Every message is one frame: `[type-id: u32 LE][length: u32 LE][payload]`.
//! The payload layout depends on the type-id; record payloads carry a
//! fixed-size header followed by sample data whose size is derived from the
//! header fields. An unknown type-id or a payload inconsistent with its
//! header-derived size is a protocol error and not recoverable by retry.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MrdError, Result};
use crate::types::{
    Acquisition, AcquisitionHeader, EncodingCounters, Image, ImageDataType, ImageHeader,
    ImageType, LogLevel, StreamMessage, Waveform, WaveformHeader,
};

pub const MESSAGE_CONFIG_NAME: u32 = 1;
pub const MESSAGE_CONFIG_TEXT: u32 = 2;
pub const MESSAGE_METADATA: u32 = 3;
pub const MESSAGE_CLOSE: u32 = 4;
pub const MESSAGE_TEXT: u32 = 5;
pub const MESSAGE_LOGGING: u32 = 6;
pub const MESSAGE_ACQUISITION: u32 = 1008;
pub const MESSAGE_IMAGE: u32 = 1022;
pub const MESSAGE_WAVEFORM: u32 = 1026;

/// Byte size of the fixed acquisition header on the wire
pub const ACQUISITION_HEADER_SIZE: usize = 138;
/// Byte size of the fixed image header on the wire
pub const IMAGE_HEADER_SIZE: usize = 130;
/// Byte size of the fixed waveform header on the wire
pub const WAVEFORM_HEADER_SIZE: usize = 32;

/// Upper bound on a single frame payload
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Encode one message into a complete wire frame
pub fn encode_message(message: &StreamMessage) -> Bytes {
    let payload = encode_payload(message);
    let mut frame = BytesMut::with_capacity(8 + payload.len());
    frame.put_u32_le(message.type_id());
    frame.put_u32_le(payload.len() as u32);
    frame.extend_from_slice(&payload);
    frame.freeze()
}

fn encode_payload(message: &StreamMessage) -> BytesMut {
    let mut buf = BytesMut::new();
    match message {
        StreamMessage::ConfigName(text)
        | StreamMessage::ConfigText(text)
        | StreamMessage::Metadata(text)
        | StreamMessage::Text(text) => {
            buf.extend_from_slice(text.as_bytes());
        }
        StreamMessage::Logging(level, text) => {
            buf.put_u8(level.to_wire());
            buf.extend_from_slice(text.as_bytes());
        }
        StreamMessage::Acquisition(acq) => {
            put_acquisition_header(&mut buf, &acq.header);
            for value in &acq.trajectory {
                buf.put_f32_le(*value);
            }
            for value in &acq.data {
                buf.put_f32_le(*value);
            }
        }
        StreamMessage::Image(image) => {
            put_image_header(&mut buf, &image.header);
            buf.extend_from_slice(&image.data);
            buf.put_u32_le(image.attributes.len() as u32);
            buf.extend_from_slice(image.attributes.as_bytes());
        }
        StreamMessage::Waveform(wave) => {
            put_waveform_header(&mut buf, &wave.header);
            for value in &wave.data {
                buf.put_u32_le(*value);
            }
        }
        StreamMessage::Close => {}
    }
    buf
}

/// Decode one payload given its frame type-id
pub fn decode_payload(type_id: u32, payload: Bytes) -> Result<StreamMessage> {
    match type_id {
        MESSAGE_CONFIG_NAME => Ok(StreamMessage::ConfigName(decode_text(payload)?)),
        MESSAGE_CONFIG_TEXT => Ok(StreamMessage::ConfigText(decode_text(payload)?)),
        MESSAGE_METADATA => Ok(StreamMessage::Metadata(decode_text(payload)?)),
        MESSAGE_TEXT => Ok(StreamMessage::Text(decode_text(payload)?)),
        MESSAGE_LOGGING => decode_logging(payload),
        MESSAGE_ACQUISITION => decode_acquisition(payload),
        MESSAGE_IMAGE => decode_image(payload),
        MESSAGE_WAVEFORM => decode_waveform(payload),
        MESSAGE_CLOSE => {
            if payload.is_empty() {
                Ok(StreamMessage::Close)
            } else {
                Err(MrdError::protocol(format!(
                    "Close frame carries {} unexpected payload bytes",
                    payload.len()
                )))
            }
        }
        other => Err(MrdError::protocol(format!(
            "Unknown message type-id {}",
            other
        ))),
    }
}

/// Read one complete message from the transport
///
/// Returns `Ok(None)` at a clean end of stream (transport closed on a frame
/// boundary). Truncation inside a frame is a protocol error.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<StreamMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 8];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(MrdError::protocol(
                "Transport closed inside a frame prefix",
            ));
        }
        filled += n;
    }

    let type_id = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    let length = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
    if length > MAX_FRAME_BYTES {
        return Err(MrdError::protocol(format!(
            "Frame of type {} declares {} payload bytes (limit {})",
            type_id, length, MAX_FRAME_BYTES
        )));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            MrdError::protocol(format!(
                "Transport closed inside a frame of type {} ({} bytes expected)",
                type_id, length
            ))
        } else {
            MrdError::Transport(e)
        }
    })?;

    decode_payload(type_id, Bytes::from(payload)).map(Some)
}

/// Write one complete message to the transport
pub async fn write_message<W>(writer: &mut W, message: &StreamMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_message(message);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn decode_text(payload: Bytes) -> Result<String> {
    String::from_utf8(payload.to_vec())
        .map_err(|e| MrdError::protocol(format!("Invalid UTF-8 in text payload: {}", e)))
}

fn decode_logging(mut payload: Bytes) -> Result<StreamMessage> {
    if payload.is_empty() {
        return Err(MrdError::protocol("Logging frame is missing its severity"));
    }
    let level = LogLevel::from_wire(payload.get_u8())?;
    let text = decode_text(payload)?;
    Ok(StreamMessage::Logging(level, text))
}

fn decode_acquisition(mut payload: Bytes) -> Result<StreamMessage> {
    if payload.len() < ACQUISITION_HEADER_SIZE {
        return Err(MrdError::protocol(format!(
            "Acquisition frame of {} bytes is shorter than its {}-byte header",
            payload.len(),
            ACQUISITION_HEADER_SIZE
        )));
    }
    let total = payload.len();
    let header = get_acquisition_header(&mut payload);

    let trajectory_len =
        header.number_of_samples as usize * header.trajectory_dimensions as usize;
    let data_len = 2 * header.active_channels as usize * header.number_of_samples as usize;
    let expected = ACQUISITION_HEADER_SIZE + 4 * (trajectory_len + data_len);
    if total != expected {
        return Err(MrdError::protocol(format!(
            "Acquisition frame is {} bytes but header implies {}",
            total, expected
        )));
    }

    let mut trajectory = Vec::with_capacity(trajectory_len);
    for _ in 0..trajectory_len {
        trajectory.push(payload.get_f32_le());
    }
    let mut data = Vec::with_capacity(data_len);
    for _ in 0..data_len {
        data.push(payload.get_f32_le());
    }

    Ok(StreamMessage::Acquisition(Acquisition {
        header,
        trajectory,
        data,
    }))
}

fn decode_image(mut payload: Bytes) -> Result<StreamMessage> {
    if payload.len() < IMAGE_HEADER_SIZE {
        return Err(MrdError::protocol(format!(
            "Image frame of {} bytes is shorter than its {}-byte header",
            payload.len(),
            IMAGE_HEADER_SIZE
        )));
    }
    let total = payload.len();
    let header = get_image_header(&mut payload)?;

    let pixel_bytes = header.pixel_bytes();
    if payload.remaining() < pixel_bytes + 4 {
        return Err(MrdError::protocol(format!(
            "Image frame is {} bytes but header implies at least {}",
            total,
            IMAGE_HEADER_SIZE + pixel_bytes + 4
        )));
    }
    let data = payload.copy_to_bytes(pixel_bytes).to_vec();

    let attr_len = payload.get_u32_le() as usize;
    if payload.remaining() != attr_len {
        return Err(MrdError::protocol(format!(
            "Image attribute string declares {} bytes, {} remain in frame",
            attr_len,
            payload.remaining()
        )));
    }
    let attributes = decode_text(payload)?;

    Ok(StreamMessage::Image(Image {
        header,
        data,
        attributes,
    }))
}

fn decode_waveform(mut payload: Bytes) -> Result<StreamMessage> {
    if payload.len() < WAVEFORM_HEADER_SIZE {
        return Err(MrdError::protocol(format!(
            "Waveform frame of {} bytes is shorter than its {}-byte header",
            payload.len(),
            WAVEFORM_HEADER_SIZE
        )));
    }
    let total = payload.len();
    let header = get_waveform_header(&mut payload);

    let data_len = header.channels as usize * header.number_of_samples as usize;
    let expected = WAVEFORM_HEADER_SIZE + 4 * data_len;
    if total != expected {
        return Err(MrdError::protocol(format!(
            "Waveform frame is {} bytes but header implies {}",
            total, expected
        )));
    }

    let mut data = Vec::with_capacity(data_len);
    for _ in 0..data_len {
        data.push(payload.get_u32_le());
    }

    Ok(StreamMessage::Waveform(Waveform { header, data }))
}

fn put_f32_triplet(buf: &mut BytesMut, values: &[f32; 3]) {
    for v in values {
        buf.put_f32_le(*v);
    }
}

fn get_f32_triplet(buf: &mut Bytes) -> [f32; 3] {
    [buf.get_f32_le(), buf.get_f32_le(), buf.get_f32_le()]
}

fn put_acquisition_header(buf: &mut BytesMut, header: &AcquisitionHeader) {
    buf.put_u16_le(header.version);
    buf.put_u64_le(header.flags);
    buf.put_u32_le(header.measurement_uid);
    buf.put_u32_le(header.scan_counter);
    buf.put_u32_le(header.acquisition_time_stamp);
    for v in &header.physiology_time_stamp {
        buf.put_u32_le(*v);
    }
    buf.put_u16_le(header.number_of_samples);
    buf.put_u16_le(header.active_channels);
    buf.put_u16_le(header.trajectory_dimensions);
    buf.put_f32_le(header.sample_time_us);
    put_f32_triplet(buf, &header.position);
    put_f32_triplet(buf, &header.read_dir);
    put_f32_triplet(buf, &header.phase_dir);
    put_f32_triplet(buf, &header.slice_dir);
    put_f32_triplet(buf, &header.patient_table_position);
    buf.put_u16_le(header.idx.kspace_encode_step_1);
    buf.put_u16_le(header.idx.kspace_encode_step_2);
    buf.put_u16_le(header.idx.average);
    buf.put_u16_le(header.idx.slice);
    buf.put_u16_le(header.idx.contrast);
    buf.put_u16_le(header.idx.phase);
    buf.put_u16_le(header.idx.repetition);
    buf.put_u16_le(header.idx.set);
    buf.put_u16_le(header.idx.segment);
    for v in &header.idx.user {
        buf.put_u16_le(*v);
    }
}

fn get_acquisition_header(buf: &mut Bytes) -> AcquisitionHeader {
    let version = buf.get_u16_le();
    let flags = buf.get_u64_le();
    let measurement_uid = buf.get_u32_le();
    let scan_counter = buf.get_u32_le();
    let acquisition_time_stamp = buf.get_u32_le();
    let physiology_time_stamp = [buf.get_u32_le(), buf.get_u32_le(), buf.get_u32_le()];
    let number_of_samples = buf.get_u16_le();
    let active_channels = buf.get_u16_le();
    let trajectory_dimensions = buf.get_u16_le();
    let sample_time_us = buf.get_f32_le();
    let position = get_f32_triplet(buf);
    let read_dir = get_f32_triplet(buf);
    let phase_dir = get_f32_triplet(buf);
    let slice_dir = get_f32_triplet(buf);
    let patient_table_position = get_f32_triplet(buf);
    let mut idx = EncodingCounters {
        kspace_encode_step_1: buf.get_u16_le(),
        kspace_encode_step_2: buf.get_u16_le(),
        average: buf.get_u16_le(),
        slice: buf.get_u16_le(),
        contrast: buf.get_u16_le(),
        phase: buf.get_u16_le(),
        repetition: buf.get_u16_le(),
        set: buf.get_u16_le(),
        segment: buf.get_u16_le(),
        user: [0; 8],
    };
    for slot in idx.user.iter_mut() {
        *slot = buf.get_u16_le();
    }

    AcquisitionHeader {
        version,
        flags,
        measurement_uid,
        scan_counter,
        acquisition_time_stamp,
        physiology_time_stamp,
        number_of_samples,
        active_channels,
        trajectory_dimensions,
        sample_time_us,
        position,
        read_dir,
        phase_dir,
        slice_dir,
        patient_table_position,
        idx,
    }
}

fn put_image_header(buf: &mut BytesMut, header: &ImageHeader) {
    buf.put_u16_le(header.version);
    buf.put_u16_le(header.data_type.to_wire());
    buf.put_u64_le(header.flags);
    buf.put_u32_le(header.measurement_uid);
    for v in &header.matrix_size {
        buf.put_u16_le(*v);
    }
    for v in &header.field_of_view {
        buf.put_f32_le(*v);
    }
    buf.put_u16_le(header.channels);
    put_f32_triplet(buf, &header.position);
    put_f32_triplet(buf, &header.read_dir);
    put_f32_triplet(buf, &header.phase_dir);
    put_f32_triplet(buf, &header.slice_dir);
    put_f32_triplet(buf, &header.patient_table_position);
    buf.put_u16_le(header.average);
    buf.put_u16_le(header.slice);
    buf.put_u16_le(header.contrast);
    buf.put_u16_le(header.phase);
    buf.put_u16_le(header.repetition);
    buf.put_u16_le(header.set);
    buf.put_u32_le(header.acquisition_time_stamp);
    for v in &header.physiology_time_stamp {
        buf.put_u32_le(*v);
    }
    buf.put_u16_le(header.image_type.to_wire());
    buf.put_u16_le(header.image_index);
    buf.put_u16_le(header.image_series_index);
}

fn get_image_header(buf: &mut Bytes) -> Result<ImageHeader> {
    let version = buf.get_u16_le();
    let data_type = ImageDataType::from_wire(buf.get_u16_le())?;
    let flags = buf.get_u64_le();
    let measurement_uid = buf.get_u32_le();
    let matrix_size = [buf.get_u16_le(), buf.get_u16_le(), buf.get_u16_le()];
    let field_of_view = get_f32_triplet(buf);
    let channels = buf.get_u16_le();
    let position = get_f32_triplet(buf);
    let read_dir = get_f32_triplet(buf);
    let phase_dir = get_f32_triplet(buf);
    let slice_dir = get_f32_triplet(buf);
    let patient_table_position = get_f32_triplet(buf);
    let average = buf.get_u16_le();
    let slice = buf.get_u16_le();
    let contrast = buf.get_u16_le();
    let phase = buf.get_u16_le();
    let repetition = buf.get_u16_le();
    let set = buf.get_u16_le();
    let acquisition_time_stamp = buf.get_u32_le();
    let physiology_time_stamp = [buf.get_u32_le(), buf.get_u32_le(), buf.get_u32_le()];
    let image_type = ImageType::from_wire(buf.get_u16_le())?;
    let image_index = buf.get_u16_le();
    let image_series_index = buf.get_u16_le();

    Ok(ImageHeader {
        version,
        data_type,
        flags,
        measurement_uid,
        matrix_size,
        field_of_view,
        channels,
        position,
        read_dir,
        phase_dir,
        slice_dir,
        patient_table_position,
        average,
        slice,
        contrast,
        phase,
        repetition,
        set,
        acquisition_time_stamp,
        physiology_time_stamp,
        image_type,
        image_index,
        image_series_index,
    })
}

fn put_waveform_header(buf: &mut BytesMut, header: &WaveformHeader) {
    buf.put_u16_le(header.version);
    buf.put_u64_le(header.flags);
    buf.put_u32_le(header.measurement_uid);
    buf.put_u32_le(header.scan_counter);
    buf.put_u32_le(header.time_stamp);
    buf.put_u16_le(header.number_of_samples);
    buf.put_u16_le(header.channels);
    buf.put_f32_le(header.sample_time_us);
    buf.put_u16_le(header.waveform_id);
}

fn get_waveform_header(buf: &mut Bytes) -> WaveformHeader {
    WaveformHeader {
        version: buf.get_u16_le(),
        flags: buf.get_u64_le(),
        measurement_uid: buf.get_u32_le(),
        scan_counter: buf.get_u32_le(),
        time_stamp: buf.get_u32_le(),
        number_of_samples: buf.get_u16_le(),
        channels: buf.get_u16_le(),
        sample_time_us: buf.get_f32_le(),
        waveform_id: buf.get_u16_le(),
    }
}
