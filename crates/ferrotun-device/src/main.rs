#![forbid(unsafe_code)]

//! ferrotun - point-to-point encrypted UDP tunnel daemon.
//!
//! The daemon:
//! 1. Loads the static identity and rekey policy
//! 2. Follows the interface's up/down/MTU events, binding UDP while up
//! 3. Answers handshakes and runs the per-peer timers

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use ferrotun_common::{init_tracing, init_tracing_with_default, Config};
use ferrotun_core::{KEY_LEN, MAX_MESSAGE_SIZE};
use ferrotun_crypto::{Identity, PrivateKey};
use ferrotun_device::{Device, MemoryTun, Outcome, Tun, TunEvent};

const SWEEP_INTERVAL_MS: u64 = 250;

#[derive(Parser, Debug)]
#[command(name = "ferrotun")]
#[command(about = "ferrotun - point-to-point encrypted UDP tunnel")]
struct Args {
    /// JSON config file
    #[arg(long, env = "FERROTUN_CONFIG")]
    config: Option<PathBuf>,

    /// UDP listen port (overrides the config file)
    #[arg(long, env = "FERROTUN_LISTEN_PORT")]
    listen_port: Option<u16>,

    /// Interface MTU (overrides the config file)
    #[arg(long, env = "FERROTUN_MTU")]
    mtu: Option<i32>,

    /// Static private key (hex encoded X25519)
    #[arg(long, env = "FERROTUN_PRIVATE_KEY")]
    private_key: Option<String>,

    /// Interface name
    #[arg(long, default_value = "ferrotun0")]
    interface: String,

    /// Default log level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

fn load_identity(hex_key: Option<&str>) -> Result<Identity> {
    match hex_key {
        Some(hex_key) => {
            let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
            hex::decode_to_slice(hex_key.trim(), &mut bytes[..])
                .context("private key must be 64 hex characters")?;
            Ok(Identity::from_private(PrivateKey::from_bytes(*bytes)))
        }
        None => {
            warn!("no private key configured, generating an ephemeral identity");
            Ok(Identity::generate()?)
        }
    }
}

async fn recv(socket: Option<&UdpSocket>, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

async fn run(device: &Device, tun: &MemoryTun) -> Result<()> {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    let mut sweep = tokio::time::interval(Duration::from_millis(SWEEP_INTERVAL_MS));

    loop {
        let socket = device.binding().socket().await;

        tokio::select! {
            result = recv(socket.as_deref(), &mut buf) => {
                let (len, src) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("UDP receive failed: {}", e);
                        continue;
                    }
                };
                let Some(socket) = socket.as_deref() else {
                    continue;
                };

                match device.handle_message(&buf[..len], src, Instant::now()) {
                    Ok(Outcome::Reply(datagrams)) => {
                        for datagram in datagrams {
                            socket.send_to(&datagram, src).await?;
                        }
                    }
                    Ok(Outcome::Data { packet, .. }) => {
                        tun.write(&packet)?;
                    }
                    Ok(Outcome::Done) => {}
                    Err(e) => debug!("Packet from {} dropped: {}", src, e),
                }
            }
            _ = sweep.tick() => {
                let due = device.sweep(Instant::now());
                if let Some(socket) = socket.as_deref() {
                    for (endpoint, datagram) in due {
                        if let Err(e) = socket.send_to(&datagram, endpoint).await {
                            debug!("send to {} failed: {}", endpoint, e);
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match &args.log_level {
        Some(level) => init_tracing_with_default(level),
        None => init_tracing(),
    }

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(port) = args.listen_port {
        config.device.listen_port = port;
    }
    if let Some(mtu) = args.mtu {
        config.device.mtu = mtu;
    }
    if args.private_key.is_some() {
        config.device.private_key = args.private_key.clone();
    }
    config.validate()?;

    let identity = load_identity(config.device.private_key.as_deref())?;
    info!("public key {}", identity.public_key().to_hex());

    let device = Arc::new(Device::new(identity, &config));
    let tun = Arc::new(MemoryTun::new(args.interface.clone(), config.device.mtu));

    let reactor = tokio::spawn({
        let device = Arc::clone(&device);
        let tun = Arc::clone(&tun);
        async move { device.run_event_reader(tun.as_ref()).await }
    });

    tun.send_event(TunEvent::UP | TunEvent::MTU_UPDATE);

    let result = run(&device, &tun).await;

    tun.close()?;
    reactor.await.context("event reader panicked")?;
    device.binding().close().await;
    result
}
