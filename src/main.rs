use clap::Parser;

use resonance::config::Config;

#[derive(Parser, Debug)]
#[command(
    name = "resonance-server",
    about = "MRD streaming reconstruction server",
    version
)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Override the listener port
    #[arg(short, long)]
    port: Option<u16>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", if args.verbose { "debug" } else { "info" });
    }

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }

    resonance::run(config).await?;
    Ok(())
}
