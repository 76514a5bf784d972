//! Client send-phase ordering: config, metadata, waveforms, raw data,
//! images, close

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use mrd::{Connection, InboundChannel, OutboundChannel, StreamMessage};
use resonance::client::{run_session, ClientConfig};
use resonance::dataset::{synthetic, Dataset, MemoryDataset};

/// Accept one connection, record every inbound frame kind in order, then
/// answer with a bare Close
async fn spawn_recording_server() -> (SocketAddr, oneshot::Receiver<Vec<&'static str>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = Connection::split(stream);

        let mut kinds = Vec::new();
        while let Ok(Some(message)) = reader.next_message().await {
            let done = message == StreamMessage::Close;
            kinds.push(message.kind_name());
            if done {
                break;
            }
        }
        let _ = writer.send_close().await;
        let _ = tx.send(kinds);
    });

    (addr, rx)
}

fn client_config(addr: SocketAddr, send_waveforms: bool) -> ClientConfig {
    ClientConfig {
        address: addr.ip().to_string(),
        port: addr.port(),
        capability: "passthrough".to_string(),
        send_waveforms,
        out_group: "results".to_string(),
        ..Default::default()
    }
}

async fn mixed_source() -> MemoryDataset {
    // Raw readouts, one slice, plus an image group and waveforms
    let dataset = synthetic::uniform_kspace(4, 1, 1).await;
    let image = mrd::Image::from_i16_pixels(
        mrd::ImageHeader::default(),
        4,
        4,
        &synthetic::checkerboard_pixels(4, 4),
        "",
    );
    dataset.append_image("image_0", image).await.unwrap();
    synthetic::with_waveforms(dataset, 2).await
}

#[tokio::test]
async fn test_send_phases_are_ordered() {
    let (addr, recorded) = spawn_recording_server().await;

    let source = Arc::new(mixed_source().await);
    let output = Arc::new(MemoryDataset::new());
    let config = client_config(addr, true);

    let summary = run_session(
        &config,
        Arc::clone(&source) as Arc<dyn Dataset>,
        output as Arc<dyn Dataset>,
    )
    .await
    .unwrap();

    assert_eq!(summary.sent_waveforms, 2);
    assert_eq!(summary.sent_acquisitions, 4);
    assert_eq!(summary.sent_images, 1);

    let kinds = recorded.await.unwrap();
    assert_eq!(
        kinds,
        vec![
            "config-name",
            "metadata",
            "waveform",
            "waveform",
            "acquisition",
            "acquisition",
            "acquisition",
            "acquisition",
            "image",
            "close",
        ]
    );
}

#[tokio::test]
async fn test_waveforms_held_back_by_default() {
    let (addr, recorded) = spawn_recording_server().await;

    let source = Arc::new(mixed_source().await);
    let output = Arc::new(MemoryDataset::new());
    let config = client_config(addr, false);

    let summary = run_session(
        &config,
        Arc::clone(&source) as Arc<dyn Dataset>,
        output as Arc<dyn Dataset>,
    )
    .await
    .unwrap();

    assert_eq!(summary.sent_waveforms, 0);
    let kinds = recorded.await.unwrap();
    assert!(!kinds.contains(&"waveform"));
    assert_eq!(*kinds.last().unwrap(), "close");
}

#[tokio::test]
async fn test_local_config_text_replaces_name() {
    let (addr, recorded) = spawn_recording_server().await;

    let source = Arc::new(synthetic::checkerboard_images(4, 1).await);
    let output = Arc::new(MemoryDataset::new());
    let mut config = client_config(addr, false);
    config.config_text = Some(r#"{"parameters": {"config": "passthrough"}}"#.to_string());

    run_session(
        &config,
        Arc::clone(&source) as Arc<dyn Dataset>,
        output as Arc<dyn Dataset>,
    )
    .await
    .unwrap();

    let kinds = recorded.await.unwrap();
    assert_eq!(kinds[0], "config-text");
    assert_eq!(kinds[1], "metadata");
}
