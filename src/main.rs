use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use pixelgate::config::Config;
use pixelgate::server::GatewayServer;

/// Pixelgate - serves the smallest acceptable WebP/AVIF/JXL variant of
/// every image request, with an on-disk artifact cache.
#[derive(Parser, Debug)]
#[command(name = "pixelgate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print the default configuration and exit
    #[arg(long)]
    dump_config: bool,

    /// Walk the local source tree at startup and pre-build artifacts
    #[arg(long)]
    prefetch: bool,

    /// Override the prefetch worker count
    #[arg(long)]
    jobs: Option<usize>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.dump_config {
        print!("{}", Config::sample_yaml());
        return Ok(());
    }

    pixelgate::logging::init_subscriber()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let mut config = if args.config.exists() {
        Config::from_file(&args.config)
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?
    } else {
        tracing::warn!(
            config_file = %args.config.display(),
            "configuration file not found, using defaults"
        );
        Config::default()
    };

    if args.prefetch {
        config.prefetch = true;
    }
    if let Some(jobs) = args.jobs {
        config.jobs = jobs;
    }

    tracing::info!(
        config_file = %args.config.display(),
        address = %config.listen_addr(),
        webp = config.enable_webp,
        avif = config.enable_avif,
        jxl = config.enable_jxl,
        allowed_types = ?config.allowed_types,
        "configuration loaded"
    );

    let server = GatewayServer::new(config)
        .map_err(|e| anyhow::anyhow!("Failed to create server: {}", e))?;
    server.run()?;
    Ok(())
}
