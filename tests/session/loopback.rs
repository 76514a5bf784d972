//! End-to-end sessions over TCP: client dataset in, processed images out

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use resonance::capability::CapabilityRegistry;
use resonance::client::{run_session, ClientConfig};
use resonance::config::Config;
use resonance::dataset::{synthetic, Dataset, MemoryDataset};
use resonance::server::MrdServer;

/// Accept one connection and drive a full session with the given registry
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

fn client_config(addr: SocketAddr, capability: &str) -> ClientConfig {
    ClientConfig {
        address: addr.ip().to_string(),
        port: addr.port(),
        capability: capability.to_string(),
        out_group: "results".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_invertcontrast_image_session() {
    let addr = spawn_single_session_server(CapabilityRegistry::with_builtins()).await;

    let source = Arc::new(synthetic::checkerboard_images(4, 2).await);
    let output = Arc::new(MemoryDataset::new());

    let config = client_config(addr, "invertcontrast");
    let summary = run_session(
        &config,
        Arc::clone(&source) as Arc<dyn Dataset>,
        Arc::clone(&output) as Arc<dyn Dataset>,
    )
    .await
    .unwrap();

    // Two slices under a {slice} mask: one mid-stream flush, one final flush
    assert_eq!(summary.sent_images, 2);
    assert_eq!(summary.received_images, 2);

    // Results land under the configured output group
    let groups = output.image_groups().await.unwrap();
    assert_eq!(groups, vec!["results/image_0".to_string()]);
    assert_eq!(output.number_of_images("results/image_0").await.unwrap(), 2);

    // Every returned pixel is the inverse of the checkerboard source
    let original = source.read_image("image_0", 0).await.unwrap();
    let inverted = output.read_image("results/image_0", 0).await.unwrap();
    let original_pixels = original.to_i16_pixels().unwrap();
    let inverted_pixels = inverted.to_i16_pixels().unwrap();
    assert_eq!(original_pixels.len(), inverted_pixels.len());
    for (a, b) in original_pixels.iter().zip(&inverted_pixels) {
        assert_eq!(a + b, 32767);
    }

    // The session metadata was mirrored into the output dataset
    assert!(output
        .read_xml_header()
        .await
        .unwrap()
        .unwrap()
        .contains("matrixSize"));
}

#[tokio::test]
async fn test_invertcontrast_raw_session() {
    let addr = spawn_single_session_server(CapabilityRegistry::with_builtins()).await;

    let source = Arc::new(synthetic::uniform_kspace(4, 1, 1).await);
    let output = Arc::new(MemoryDataset::new());

    let config = client_config(addr, "invertcontrast");
    let summary = run_session(
        &config,
        Arc::clone(&source) as Arc<dyn Dataset>,
        Arc::clone(&output) as Arc<dyn Dataset>,
    )
    .await
    .unwrap();

    // One slice of readouts, flushed by the last-in-slice trigger
    assert_eq!(summary.sent_acquisitions, 4);
    assert_eq!(summary.received_images, 1);

    // Uniform k-space reconstructs to a single bright pixel; inverted, that
    // pixel is the only dark one
    let result = output.read_image("results/image_0", 0).await.unwrap();
    let pixels = result.to_i16_pixels().unwrap();
    assert_eq!(pixels.len(), 16);
    assert_eq!(pixels[0], 0);
    assert!(pixels[1..].iter().all(|&v| v == 32767));
}

#[tokio::test]
async fn test_unknown_capability_falls_back_to_null() {
    let addr = spawn_single_session_server(CapabilityRegistry::with_builtins()).await;

    let source = Arc::new(synthetic::checkerboard_images(4, 2).await);
    let output = Arc::new(MemoryDataset::new());

    let config = client_config(addr, "no-such-capability");
    let summary = run_session(
        &config,
        Arc::clone(&source) as Arc<dyn Dataset>,
        Arc::clone(&output) as Arc<dyn Dataset>,
    )
    .await
    .unwrap();

    // The null fallback ignores everything and returns nothing
    assert_eq!(summary.sent_images, 2);
    assert_eq!(summary.received_images, 0);
    assert!(output.image_groups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_passthrough_returns_images_unchanged() {
    let addr = spawn_single_session_server(CapabilityRegistry::with_builtins()).await;

    let source = Arc::new(synthetic::checkerboard_images(4, 3).await);
    let output = Arc::new(MemoryDataset::new());

    let config = client_config(addr, "passthrough");
    let summary = run_session(
        &config,
        Arc::clone(&source) as Arc<dyn Dataset>,
        Arc::clone(&output) as Arc<dyn Dataset>,
    )
    .await
    .unwrap();

    assert_eq!(summary.received_images, 3);
    let original = source.read_image("image_0", 0).await.unwrap();
    let returned = output.read_image("results/image_0", 0).await.unwrap();
    assert_eq!(
        original.to_i16_pixels().unwrap(),
        returned.to_i16_pixels().unwrap()
    );
}
