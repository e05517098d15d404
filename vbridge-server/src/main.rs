//! vbridge streaming server entry point.
//!
//! ```text
//! vbridge-server                  Stream the test pattern (foreground)
//! vbridge-server --receive        Decode and log an incoming stream
//! vbridge-server --config <path>  Load a custom config TOML
//! vbridge-server --gen-config     Write default config to stdout
//! vbridge-server --gen-config <path>  Write default config to a file
//! ```

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vbridge_server::config::ServerConfig;
use vbridge_server::service::{ServiceResult, StreamService};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "vbridge-server", about = "vbridge adaptive video streaming server")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "vbridge-server.toml")]
    config: PathBuf,

    /// Receive and decode a stream instead of sending one.
    #[arg(long)]
    receive: bool,

    /// Write the default configuration to a file (stdout if no path
    /// is given) and exit.
    #[arg(long, value_name = "PATH", num_args = 0..=1, default_missing_value = "-")]
    gen_config: Option<PathBuf>,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ServiceResult<()> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if let Some(path) = cli.gen_config {
        if path.as_os_str() == "-" {
            let text = toml::to_string_pretty(&ServerConfig::default())?;
            println!("{text}");
        } else {
            ServerConfig::write_default(&path)?;
            println!("wrote default config to {}", path.display());
        }
        return Ok(());
    }

    let config = ServerConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("vbridge-server v{}", env!("CARGO_PKG_VERSION"));
    info!("remote: {}", config.network.remote_addr);
    info!(
        "format: {}, max {} fps, bitrate {}..{} bit/s",
        config.video.format,
        config.video.max_frame_rate,
        config.video.min_bitrate,
        config.video.max_bitrate
    );

    let receive = cli.receive;
    let service = StreamService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, Ordering::SeqCst);
    });

    if receive {
        let summary = service.run_receiver().await?;
        info!(?summary, "done");
    } else {
        service.run().await?;
    }

    Ok(())
}
