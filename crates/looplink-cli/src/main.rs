//! Looplink CLI tools: key generation, key inspection, echo app.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use looplink_app::{AppConfig, LoopConn, Meta};
use looplink_crypto::{PubKey, SecKey, StaticKeypair};
use tracing::{debug, info, warn};

/// Name the host knows this binary by.
const APP_NAME: &str = "looplink";

#[derive(Parser, Debug)]
#[command(name = "looplink")]
#[command(about = "Looplink CLI tools")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new secp256k1 static keypair
    Keygen {
        /// Output file path (without extension)
        #[arg(short, long, default_value = "looplink")]
        output: String,
    },

    /// Show the public key for a secret key
    ShowPk {
        /// Secret key (hex)
        #[arg(long, env = "LOOPLINK_SK", hide_env_values = true)]
        sk: String,
    },

    /// Run as an app that echoes every loop back to its sender
    Echo {
        /// Host public key (hex)
        #[arg(long, env = "LOOPLINK_HOST_PK")]
        host_pk: PubKey,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    looplink_common::init_tracing();

    let raw_args: Vec<String> = std::env::args().collect();
    if looplink_app::describe_requested(&raw_args, APP_NAME)? {
        let meta = Meta::new(APP_NAME, env!("CARGO_PKG_VERSION"));
        looplink_app::write_meta(std::io::stdout().lock(), &meta)?;
        return Ok(());
    }

    let args = Args::parse();

    match args.command {
        Command::Keygen { output } => {
            let keypair = StaticKeypair::generate();

            let private_path = format!("{}.key", output);
            let public_path = format!("{}.pub", output);

            std::fs::write(&private_path, hex::encode(keypair.secret_key().as_bytes()))
                .with_context(|| format!("failed to write {private_path}"))?;
            std::fs::write(&public_path, keypair.public_key().to_string())
                .with_context(|| format!("failed to write {public_path}"))?;

            println!("Private key: {}", private_path);
            println!("Public key:  {}", public_path);
            println!("PK:          {}", keypair.public_key());
        }
        Command::ShowPk { sk } => {
            let sk: SecKey = sk.parse().context("invalid secret key")?;
            let keypair = StaticKeypair::from_secret(sk).context("invalid secret key")?;
            println!("{}", keypair.public_key());
        }
        Command::Echo { host_pk } => {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            rt.block_on(run_echo(host_pk))?;
        }
        Command::Version => {
            println!("looplink {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

async fn run_echo(host_pk: PubKey) -> Result<()> {
    let config = AppConfig::new(APP_NAME, env!("CARGO_PKG_VERSION"), host_pk);
    let session = looplink_app::setup_stdio(config);
    info!("echo app ready");

    loop {
        tokio::select! {
            accepted = session.accept() => match accepted {
                Ok(conn) => {
                    tokio::spawn(echo_loop(conn));
                }
                Err(e) if e.is_fatal() => {
                    info!("session ended: {}", e);
                    break;
                }
                Err(e) => warn!("failed to accept loop: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    session.close().await;
    Ok(())
}

async fn echo_loop(conn: LoopConn) {
    let meta = conn.meta();
    let (mut reader, mut writer) = tokio::io::split(conn);
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => debug!(%meta, bytes, "loop finished"),
        Err(e) => debug!(%meta, "loop ended: {}", e),
    }
}
