//! Send-side session driver
//!
//! Streams a source dataset to a processing endpoint and mirrors returned
//! records into an output dataset. Two tasks share nothing but the socket:
//! one only reads the transport (and owns the output dataset), one only
//! writes it.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use mrd::{
    Connection, ConnectionReader, LogLevel, MrdError, OutboundChannel, Result, StreamMessage,
    DEFAULT_MRD_PORT,
};
use tokio::net::tcp::OwnedReadHalf;

use crate::dataset::Dataset;

/// Client session parameters
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Address of the processing endpoint
    pub address: String,
    pub port: u16,
    /// Remote capability name to request
    pub capability: String,
    /// Literal configuration text to send instead of a capability name
    pub config_text: Option<String>,
    /// Forward waveform records from the source dataset
    pub send_waveforms: bool,
    /// Output dataset group that received images are stored under
    pub out_group: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: DEFAULT_MRD_PORT,
            capability: "invertcontrast".to_string(),
            config_text: None,
            send_waveforms: false,
            out_group: chrono::Utc::now()
                .format("%Y-%m-%d %H:%M:%S%.6f")
                .to_string(),
        }
    }
}

/// Per-kind totals for one client session
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionSummary {
    pub sent_acquisitions: u64,
    pub sent_images: u64,
    pub sent_waveforms: u64,
    pub received_acquisitions: u64,
    pub received_images: u64,
    pub received_waveforms: u64,
}

/// Connect and stream one session: config, metadata, waveforms, raw data,
/// images, close
///
/// A failed send of one acquisition or image is logged and that record is
/// skipped; a failed waveform send aborts the remaining waveform phase.
pub async fn run_session(
    config: &ClientConfig,
    source: Arc<dyn Dataset>,
    output: Arc<dyn Dataset>,
) -> Result<SessionSummary> {
    info!(
        "Connecting to MRD server at {}:{}",
        config.address, config.port
    );
    let stream = connect_with_retry(&config.address, config.port, 5).await?;
    let (reader, mut writer) = Connection::split(stream);

    // Receive task: the only context that touches the output dataset
    let receive = tokio::spawn(receive_loop(
        reader,
        Arc::clone(&output),
        config.out_group.clone(),
    ));

    // --------------- Send config -----------------------------
    match &config.config_text {
        Some(text) => {
            info!("Sending local config text ({} bytes)", text.len());
            writer.send_config_text(text).await?;
        }
        None => {
            info!("Sending remote config name '{}'", config.capability);
            writer.send_config_name(&config.capability).await?;
        }
    }

    // --------------- Send metadata ---------------------------
    let metadata = match source.read_xml_header().await? {
        Some(text) => text,
        None => {
            warn!("Could not find metadata header in source dataset");
            "<ismrmrdHeader/>".to_string()
        }
    };
    writer.send_metadata(&metadata).await?;
    output.write_xml_header(&metadata).await?;

    // --------------- Send waveform data ----------------------
    let waveform_count = source.number_of_waveforms().await?;
    if waveform_count > 0 {
        if config.send_waveforms {
            info!("Sending waveform data: {} records", waveform_count);
            for index in 0..waveform_count {
                let waveform = source.read_waveform(index).await?;
                if let Err(e) = writer.send_waveform(&waveform).await {
                    error!("Failed to send waveform {} -- aborting: {}", index, e);
                    break;
                }
            }
        } else {
            info!("Waveform data present, but send-waveforms option turned off");
        }
    }

    // --------------- Send raw data ---------------------------
    let acquisition_count = source.number_of_acquisitions().await?;
    if acquisition_count > 0 {
        info!(
            "Starting raw data session: {} readouts",
            acquisition_count
        );
        for index in 0..acquisition_count {
            let acquisition = source.read_acquisition(index).await?;
            if let Err(e) = writer.send_acquisition(&acquisition).await {
                error!("Failed to send acquisition {} -- skipping: {}", index, e);
            }
        }
    }

    // --------------- Send image data -------------------------
    let groups = source.image_groups().await?;
    if !groups.is_empty() {
        info!("Starting image data session");
        for group in groups {
            let image_count = source.number_of_images(&group).await?;
            info!("Sending {} images from group '{}'", image_count, group);
            for index in 0..image_count {
                let image = source.read_image(&group, index).await?;
                debug!("Sending image {} of {}", index, image_count - 1);
                if let Err(e) = writer.send_image(&image).await {
                    error!("Failed to send image {} -- skipping: {}", index, e);
                }
            }
        }
    }

    if let Err(e) = writer.send_close().await {
        error!("Failed to send close message: {}", e);
    }

    // Wait for the receive task to drain the server's results
    debug!("Waiting for incoming data to finish");
    let received = receive
        .await
        .map_err(|e| MrdError::internal(format!("Receive task panicked: {}", e)))?;

    let sent = writer.sent();
    let summary = SessionSummary {
        sent_acquisitions: sent.acquisitions,
        sent_images: sent.images,
        sent_waveforms: sent.waveforms,
        received_acquisitions: received.acquisitions,
        received_images: received.images,
        received_waveforms: received.waveforms,
    };

    info!("---------------------- Summary ----------------------");
    info!(
        "Sent {:5} acquisitions  |  Received {:5} acquisitions",
        summary.sent_acquisitions, summary.received_acquisitions
    );
    info!(
        "Sent {:5} images        |  Received {:5} images",
        summary.sent_images, summary.received_images
    );
    info!(
        "Sent {:5} waveforms     |  Received {:5} waveforms",
        summary.sent_waveforms, summary.received_waveforms
    );
    info!("Session complete");

    Ok(summary)
}

/// Bounded connect retry: one attempt per second
async fn connect_with_retry(address: &str, port: u16, max_attempts: u32) -> Result<TcpStream> {
    let mut attempt = 0;
    loop {
        match TcpStream::connect((address, port)).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    error!(
                        "Failed to connect ({}/{}): {} -- aborting",
                        attempt, max_attempts, e
                    );
                    return Err(MrdError::Transport(e));
                }
                warn!("Failed to connect ({}/{}): {}", attempt, max_attempts, e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Drain the inbound half, mirroring records into the output dataset
///
/// Ends at Close, end-of-stream or the first receive error; errors are
/// logged, not propagated, so the send side can still finish its summary.
async fn receive_loop(
    reader: ConnectionReader<OwnedReadHalf>,
    output: Arc<dyn Dataset>,
    out_group: String,
) -> mrd::RecordCounts {
    let mut counts = mrd::RecordCounts::default();
    let mut stream = Box::pin(reader.into_stream());

    while let Some(item) = stream.next().await {
        let message = match item {
            Ok(message) => message,
            Err(e) => {
                error!("Receive loop ended: {}", e);
                break;
            }
        };

        let stored = match message {
            StreamMessage::Image(image) => {
                counts.images += 1;
                let group = format!(
                    "{}/image_{}",
                    out_group, image.header.image_series_index
                );
                output.append_image(&group, image).await
            }
            StreamMessage::Acquisition(acquisition) => {
                counts.acquisitions += 1;
                output.append_acquisition(acquisition).await
            }
            StreamMessage::Waveform(waveform) => {
                counts.waveforms += 1;
                output.append_waveform(waveform).await
            }
            StreamMessage::Logging(level, text) => {
                match level {
                    LogLevel::Debug => debug!("Server: {}", text),
                    LogLevel::Info => info!("Server: {}", text),
                    LogLevel::Warning => warn!("Server: {}", text),
                    LogLevel::Error => error!("Server: {}", text),
                }
                Ok(())
            }
            StreamMessage::Text(text) => {
                info!("Server text: {}", text);
                Ok(())
            }
            StreamMessage::Close => {
                debug!("Close received (reader)");
                Ok(())
            }
            other => {
                warn!("Unexpected {} frame from server", other.kind_name());
                Ok(())
            }
        };
        if let Err(e) = stored {
            error!("Could not store received record: {}", e);
        }
    }
    counts
}
