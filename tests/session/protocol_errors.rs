//! Error containment: malformed frames and failing capabilities must still
//! end every session with exactly one Close frame

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use mrd::codec;
use mrd::{
    Acquisition, AcquisitionFlag, AcquisitionHeader, ConnectionReader, Image, InboundChannel,
    LogLevel, OutboundChannel, StreamMessage,
};
use resonance::capability::{Capability, CapabilityRegistry, Settings};
use resonance::config::Config;
use resonance::dispatch::IndexField;
use resonance::server::MrdServer;

async fn spawn_single_session_server(registry: CapabilityRegistry) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let server = MrdServer::new(Config::default(), registry);
        let _ = server.handle_session(stream, peer).await;
    });
    addr
}

/// Read every frame the server sends until it closes the transport
async fn drain_server_frames(read_half: tokio::net::tcp::OwnedReadHalf) -> Vec<StreamMessage> {
    let mut reader = ConnectionReader::new(read_half);
    let mut frames = Vec::new();
    while let Ok(Some(message)) = reader.next_message().await {
        let done = message == StreamMessage::Close;
        frames.push(message);
        if done {
            break;
        }
    }
    frames
}

fn close_count(frames: &[StreamMessage]) -> usize {
    frames
        .iter()
        .filter(|m| **m == StreamMessage::Close)
        .count()
}

fn error_logs(frames: &[StreamMessage]) -> Vec<&str> {
    frames
        .iter()
        .filter_map(|m| match m {
            StreamMessage::Logging(LogLevel::Error, text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_unknown_type_id_reports_and_closes() {
    let addr = spawn_single_session_server(CapabilityRegistry::with_builtins()).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();

    // A frame the codec has never heard of, right at session start
    let mut garbage = Vec::new();
    garbage.extend_from_slice(&999u32.to_le_bytes());
    garbage.extend_from_slice(&0u32.to_le_bytes());
    write_half.write_all(&garbage).await.unwrap();

    let frames = drain_server_frames(read_half).await;
    assert_eq!(close_count(&frames), 1);
    assert!(error_logs(&frames)
        .iter()
        .any(|text| text.contains("Unknown message type-id 999")));
}

#[tokio::test]
async fn test_truncated_frame_mid_session_reports_and_closes() {
    let addr = spawn_single_session_server(CapabilityRegistry::with_builtins()).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();

    // Valid preamble
    let config = codec::encode_message(&StreamMessage::ConfigName("passthrough".into()));
    let metadata = codec::encode_message(&StreamMessage::Metadata("<study/>".into()));
    write_half.write_all(&config).await.unwrap();
    write_half.write_all(&metadata).await.unwrap();

    // A frame that promises 64 payload bytes but delivers 8, then hang up
    let mut partial = Vec::new();
    partial.extend_from_slice(&codec::MESSAGE_TEXT.to_le_bytes());
    partial.extend_from_slice(&64u32.to_le_bytes());
    partial.extend_from_slice(&[0u8; 8]);
    write_half.write_all(&partial).await.unwrap();
    drop(write_half);

    let frames = drain_server_frames(read_half).await;
    assert_eq!(close_count(&frames), 1);
    assert!(error_logs(&frames)
        .iter()
        .any(|text| text.contains("closed inside a frame")));
}

/// Capability whose acquisition handler always fails
struct Explosive;

#[async_trait]
impl Capability for Explosive {
    fn settings(&self) -> Settings {
        Settings {
            keep_acquisition: true,
            keep_image: false,
            keep_waveform: false,
            acquisition_ignore: vec![],
            acquisition_trigger: vec![AcquisitionFlag::LastInSlice],
            image_select: vec![],
            grouping_fields: vec![IndexField::Slice],
        }
    }

    async fn process_acquisition(
        &self,
        _group: &[Acquisition],
        _index: usize,
        _channel: &mut dyn OutboundChannel,
        _metadata: &str,
    ) -> anyhow::Result<Vec<Image>> {
        anyhow::bail!("deliberate reconstruction failure")
    }

    async fn process_image(
        &self,
        _group: &[Image],
        _index: usize,
        _channel: &mut dyn OutboundChannel,
        _metadata: &str,
    ) -> anyhow::Result<Vec<Image>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_capability_failure_reports_and_closes() {
    let mut registry = CapabilityRegistry::with_builtins();
    registry.register("explosive", Arc::new(Explosive));
    let addr = spawn_single_session_server(registry).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();

    let mut header = AcquisitionHeader {
        active_channels: 1,
        number_of_samples: 2,
        ..Default::default()
    };
    header.set_flag(AcquisitionFlag::LastInSlice);
    let acquisition = Acquisition::new(header, vec![0.0; 4]);

    for message in [
        StreamMessage::ConfigName("explosive".into()),
        StreamMessage::Metadata("<study/>".into()),
        StreamMessage::Acquisition(acquisition),
        StreamMessage::Close,
    ] {
        let frame = codec::encode_message(&message);
        write_half.write_all(&frame).await.unwrap();
    }

    let frames = drain_server_frames(read_half).await;

    // The handler failure is reported outbound and the session still closes
    // exactly once, with no image results
    assert_eq!(close_count(&frames), 1);
    assert!(error_logs(&frames)
        .iter()
        .any(|text| text.contains("deliberate reconstruction failure")));
    assert!(!frames
        .iter()
        .any(|m| matches!(m, StreamMessage::Image(_))));
}

#[tokio::test]
async fn test_clean_session_sends_exactly_one_close() {
    let addr = spawn_single_session_server(CapabilityRegistry::with_builtins()).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();

    for message in [
        StreamMessage::ConfigName("null".into()),
        StreamMessage::Metadata("<study/>".into()),
        StreamMessage::Close,
    ] {
        let frame = codec::encode_message(&message);
        write_half.write_all(&frame).await.unwrap();
    }

    let frames = drain_server_frames(read_half).await;
    assert_eq!(close_count(&frames), 1);
    assert!(error_logs(&frames).is_empty());
}
