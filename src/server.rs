//! Session listener and per-connection session driver

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use mrd::{
    Connection, InboundChannel, LogLevel, MrdError, OutboundChannel, Result, StreamMessage,
};

use crate::capability::CapabilityRegistry;
use crate::config::Config;
use crate::dispatch::DispatchEngine;

/// Outcome of the session preamble (frames before the data stream)
enum SessionPreamble {
    /// Config and metadata arrived; dispatch can begin
    Ready {
        requested: Option<String>,
        metadata: String,
    },
    /// The peer closed before sending any data
    Ended,
}

/// MRD streaming server
pub struct MrdServer {
    config: Config,
    registry: Arc<CapabilityRegistry>,
}

impl MrdServer {
    /// Create a new server with the given configuration and capabilities
    pub fn new(config: Config, registry: CapabilityRegistry) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
        }
    }

    /// Start the session listener
    pub async fn run(self) -> Result<()> {
        self.config.validate()?;

        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        info!("Starting MRD session listener on {}", addr);

        let server = Arc::new(self);
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("Accepted connection from {}", peer_addr);
                    let server = Arc::clone(&server);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_session(stream, peer_addr).await {
                            error!("Error handling session from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }

    /// Drive one streaming session to completion
    pub async fn handle_session(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        info!("Starting session with {}", peer_addr);
        let (mut reader, mut writer) = Connection::split(stream);

        let preamble = match read_preamble(&mut reader).await {
            Ok(preamble) => preamble,
            Err(e) => {
                error!("Session preamble with {} failed: {}", peer_addr, e);
                let report = format!("Session preamble failed: {}", e);
                let _ = writer.send_logging(LogLevel::Error, &report).await;
                let _ = writer.send_close().await;
                return Err(e);
            }
        };

        let SessionPreamble::Ready {
            requested,
            metadata,
        } = preamble
        else {
            info!("Session with {} ended before any data", peer_addr);
            let _ = writer.send_close().await;
            return Ok(());
        };

        let requested =
            requested.unwrap_or_else(|| self.registry.fallback_name().to_string());
        let resolved = match self.registry.resolve(&requested) {
            Ok(resolved) => resolved,
            Err(e) => {
                error!("Capability resolution for {} failed: {}", peer_addr, e);
                let _ = writer
                    .send_logging(LogLevel::Error, &format!("{}", e))
                    .await;
                let _ = writer.send_close().await;
                return Err(e);
            }
        };

        let mut engine = DispatchEngine::new(resolved, metadata);
        let counters = engine.run(&mut reader, &mut writer).await;

        info!(
            "Session with {} complete: {}/{} acquisitions processed, {}/{} images processed, {} waveforms retained",
            peer_addr,
            counters.acquisitions_processed,
            counters.acquisitions_seen,
            counters.images_processed,
            counters.images_seen,
            counters.waveforms_retained,
        );
        Ok(())
    }
}

/// Read the session preamble: capability request and metadata, in either
/// order, with free-form text tolerated in between
///
/// A data record arriving before the preamble is complete is a protocol
/// error; the MRD stream always opens with configuration.
async fn read_preamble(reader: &mut dyn InboundChannel) -> Result<SessionPreamble> {
    let mut config_seen = false;
    let mut requested: Option<String> = None;
    let mut metadata: Option<String> = None;

    loop {
        let message = match reader.next_message().await? {
            Some(message) => message,
            None => {
                warn!("Transport closed during session preamble");
                return Ok(SessionPreamble::Ended);
            }
        };

        match message {
            StreamMessage::ConfigName(name) => {
                info!("Capability requested: {}", name);
                requested = Some(name);
                config_seen = true;
            }
            StreamMessage::ConfigText(text) => {
                config_seen = true;
                match capability_from_config_text(&text) {
                    Some(name) => {
                        info!("Capability requested via config text: {}", name);
                        requested = Some(name);
                    }
                    None => {
                        warn!("Config text does not name a capability; using fallback");
                    }
                }
            }
            StreamMessage::Metadata(text) => {
                debug!("Session metadata received ({} bytes)", text.len());
                metadata = Some(text);
            }
            StreamMessage::Text(text) => {
                info!("Client text: {}", text);
            }
            StreamMessage::Close => {
                debug!("Close received during preamble");
                return Ok(SessionPreamble::Ended);
            }
            other => {
                return Err(MrdError::protocol(format!(
                    "Received {} frame before configuration and metadata",
                    other.kind_name()
                )));
            }
        }

        if config_seen && metadata.is_some() {
            return Ok(SessionPreamble::Ready {
                requested,
                metadata: metadata.unwrap_or_default(),
            });
        }
    }
}

/// Extract the capability name from a JSON config-text frame
///
/// The client may forward a parameter document of the form
/// `{"parameters": {"config": "<name>"}}`; anything else selects the
/// fallback capability.
fn capability_from_config_text(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value
        .get("parameters")?
        .get("config")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_from_config_text() {
        let text = r#"{"parameters": {"config": "invertcontrast", "other": 1}}"#;
        assert_eq!(
            capability_from_config_text(text).as_deref(),
            Some("invertcontrast")
        );

        assert_eq!(capability_from_config_text("not json"), None);
        assert_eq!(capability_from_config_text(r#"{"parameters": {}}"#), None);
        assert_eq!(capability_from_config_text(r#"{"config": "x"}"#), None);
    }
}
