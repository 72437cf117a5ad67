use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use party_telemetry::{LogConfig, LogLevel, Profile};
use tokio::net::TcpListener;
use tracing::{error, info};
use watch_party_relay::{RelayConfig, serve};

const LOG_PROFILE: Profile = Profile {
    targets: &["watch_party_relay", "signal_bus"],
    env_prefix: "WATCH_PARTY_RELAY",
};

#[derive(Parser, Debug)]
#[command(name = "watch-party-relay", about = "Signalling relay for watch parties", version)]
struct Cli {
    #[arg(long, help = "Port to listen on (overrides WATCH_PARTY_RELAY_PORT)")]
    port: Option<u16>,

    #[arg(long, default_value = "0.0.0.0", help = "Address to bind")]
    bind: String,

    #[arg(
        long = "log-level",
        value_enum,
        env = "WATCH_PARTY_RELAY_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    log_level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "WATCH_PARTY_RELAY_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_config = LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    };
    let log_guard = match party_telemetry::init(&LOG_PROFILE, &log_config) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("❌ {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(cli).await {
        error!("relay stopped: {err:#}");
        drop(log_guard);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = RelayConfig::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    info!(
        port = config.port,
        heartbeat_timeout = ?config.heartbeat_timeout,
        "starting watch-party relay"
    );

    let addr = format!("{}:{}", cli.bind, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    serve(listener, config).await
}
