//! Raynet - a pluggable proxying platform

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use raynet::error::Result;
use raynet::proxy::ProxyRegistry;
use raynet::transport::TransportRegistry;
use raynet::{Point, PointConfig};

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    let Some(config_path) = args.config else {
        eprintln!("No config file specified. See --help.");
        std::process::exit(1);
    };

    let config = PointConfig::load(&config_path)?;

    // RUST_LOG wins over the config file level
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| config.log.level.parse().ok())
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");

    info!("raynet v{} starting", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let transports = Arc::new(TransportRegistry::with_builtins());
        let proxies = Arc::new(ProxyRegistry::with_builtins());
        let point = Point::new(&config, transports, proxies, None)?;
        point.start().await?;

        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        point.close().await;
        Ok(())
    })
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self { config, version }
    }
}

fn print_help() {
    println!(
        r#"Raynet - a pluggable proxying platform

USAGE:
    raynet [OPTIONS] [CONFIG]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    raynet -c config.json
    raynet config.json
"#
    );
}

fn print_version() {
    println!("raynet v{}", env!("CARGO_PKG_VERSION"));
}
