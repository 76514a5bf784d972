//! Example client for the MRD streaming format
//!
//! Streams a synthetic source dataset to a server and collects the returned
//! images in memory. Reading persisted container files is handled by
//! external tooling, not by this client.

use std::sync::Arc;

use clap::{Parser, ValueEnum};

use resonance::client::{run_session, ClientConfig};
use resonance::dataset::{synthetic, Dataset, MemoryDataset};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceKind {
    /// Checkerboard magnitude images, one per slice
    Images,
    /// Uniform k-space readouts, one group per slice
    Raw,
}

#[derive(Parser, Debug)]
#[command(
    name = "resonance-client",
    about = "Example client for MRD streaming sessions",
    version
)]
struct Args {
    /// Address (hostname) of the MRD server
    #[arg(short, long, default_value = "localhost")]
    address: String,

    /// Port
    #[arg(short, long, default_value_t = mrd::DEFAULT_MRD_PORT)]
    port: u16,

    /// Remote capability name
    #[arg(short, long, default_value = "invertcontrast")]
    config: String,

    /// Local configuration file sent as literal config text
    #[arg(short = 'C', long)]
    config_local: Option<std::path::PathBuf>,

    /// Output group name
    #[arg(short = 'G', long)]
    out_group: Option<String>,

    /// Kind of synthetic source data to stream
    #[arg(long, value_enum, default_value_t = SourceKind::Images)]
    source: SourceKind,

    /// Matrix size of the synthetic source
    #[arg(long, default_value_t = 16)]
    matrix: u16,

    /// Number of slices in the synthetic source
    #[arg(long, default_value_t = 2)]
    slices: u16,

    /// Attach synthetic waveform records to the source
    #[arg(long, default_value_t = 0)]
    waveforms: u16,

    /// Send waveform (physio) data
    #[arg(short = 'w', long)]
    send_waveforms: bool,

    /// Verbose mode
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", if args.verbose { "debug" } else { "info" });
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_text = match &args.config_local {
        Some(path) => Some(std::fs::read_to_string(path)?),
        None => None,
    };

    let mut config = ClientConfig {
        address: args.address,
        port: args.port,
        capability: args.config,
        config_text,
        send_waveforms: args.send_waveforms,
        ..Default::default()
    };
    if let Some(out_group) = args.out_group {
        config.out_group = out_group;
    }

    let source = match args.source {
        SourceKind::Images => synthetic::checkerboard_images(args.matrix, args.slices).await,
        SourceKind::Raw => synthetic::uniform_kspace(args.matrix, args.slices, 1).await,
    };
    let source = synthetic::with_waveforms(source, args.waveforms).await;

    let output = Arc::new(MemoryDataset::new());
    let summary = run_session(&config, Arc::new(source), Arc::clone(&output) as Arc<dyn Dataset>)
        .await?;

    for group in output.image_groups().await? {
        let count = output.number_of_images(&group).await?;
        tracing::info!("Result group '{}' holds {} images", group, count);
    }
    tracing::info!(
        "Received {} images in total",
        summary.received_images
    );
    Ok(())
}
