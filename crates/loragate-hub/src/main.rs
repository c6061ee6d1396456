//! Loragate Hub Daemon
//!
//! Bridges a cell of LoRa end-nodes to the backend server: adopted nodes
//! speak an encrypted, replay-protected packet protocol on one side, the
//! server a signed/MAC'd JSON session over TLS+WebSocket on the other.
//! Everything runs on one cooperative event loop split across two tasks
//! on a current-thread runtime, wired by bounded channels.

mod bootstrap;
mod bridge;
mod clock;
mod config;
mod engine;
mod radio;
mod storage;
mod telemetry;
mod ws;

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::info;

use loragate_common::crypto::identity;

use crate::bridge::{Directive, UpstreamEvent};
use crate::clock::now_ms;
use crate::config::HubConfig;
use crate::engine::LoraEngine;
use crate::radio::{FrameQueue, ReceivedFrame, UdpRadio};
use crate::storage::{DeviceStore, FileStore, KeyValueStore};
use crate::ws::SessionEngine;

/// Cadence of the hub-status report in the log.
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    dotenvy::dotenv().ok();
    let cfg = config::load().context("loading configuration")?;

    info!("==============================================");
    info!("   Loragate Hub v{}", env!("CARGO_PKG_VERSION"));
    info!("==============================================");
    info!("Device ID: {}", cfg.device_id);
    info!(
        "Server: {}:{}{}",
        cfg.server_host, cfg.server_port, cfg.websocket_path
    );
    info!(
        "Radio: {} MHz, SF{}, {} kHz, sync 0x{:02x}, {} dBm",
        cfg.radio.frequency_hz / 1_000_000,
        cfg.radio.spreading_factor,
        cfg.radio.bandwidth_hz / 1000,
        cfg.radio.sync_word,
        cfg.radio.tx_power_dbm
    );

    let mut store = DeviceStore::new(FileStore::open(&cfg.storage_path, "hub")?);

    // Both steps are fatal when their state is missing and cannot be
    // established; recovery is a factory reset.
    ensure_device_identity(&cfg, &mut store).await?;
    ensure_server_credentials(&cfg, &mut store).await?;

    let device_keys = store.device_keys().context("device keys missing")?;
    let server_sign_pub = store
        .server_signing_public_key()
        .context("server signing key missing")?;

    let lora_engine = LoraEngine::new(
        cfg.max_nodes,
        cfg.max_discovered_nodes,
        cfg.adoption_timeout_ms,
        cfg.discovered_node_ttl_ms,
    )
    .context("hub key generation failed")?;

    let session_engine = SessionEngine::new(
        cfg.device_id.clone(),
        device_keys,
        server_sign_pub,
        store.is_adopted(),
        cfg.max_time_drift_s,
    );

    let socket = Arc::new(
        UdpSocket::bind(&cfg.radio.bind_addr)
            .await
            .context("binding radio frame bridge")?,
    );
    info!("radio frame bridge on {}", socket.local_addr()?);
    let radio_peer: Option<SocketAddr> = match &cfg.radio.peer_addr {
        Some(addr) => Some(addr.parse().context("bad radio peer address")?),
        None => None,
    };

    let epoch = Instant::now();
    let (events_tx, events_rx) = mpsc::channel::<UpstreamEvent>(32);
    let (directives_tx, directives_rx) = mpsc::channel::<Directive>(32);

    let lora_task = tokio::spawn(run_lora_task(
        cfg.clone(),
        lora_engine,
        socket,
        radio_peer,
        events_tx,
        directives_rx,
        epoch,
    ));
    let session_task = ws::run_session_task(
        cfg,
        store,
        session_engine,
        events_rx,
        directives_tx,
        epoch,
    );

    tokio::select! {
        res = lora_task => res.context("lora task aborted")?,
        res = session_task => res,
    }
}

/// First boot: generate the identity key pair and announce the public
/// key to the server before persisting.
async fn ensure_device_identity<S: KeyValueStore>(
    cfg: &HubConfig,
    store: &mut DeviceStore<S>,
) -> Result<()> {
    if store.has_device_keys() {
        info!("device identity present");
        return Ok(());
    }

    info!("generating device identity key pair");
    let keys = identity::generate_keypair().context("identity key generation failed")?;

    bootstrap::announce_public_key(cfg, &keys.public_pem)
        .await
        .context("fatal: public key announce failed")?;

    store.set_device_keys(&keys)?;
    info!("device identity stored");
    Ok(())
}

/// First boot: TOFU-fetch and pin the server credentials.
async fn ensure_server_credentials<S: KeyValueStore>(
    cfg: &HubConfig,
    store: &mut DeviceStore<S>,
) -> Result<()> {
    if store.has_server_credentials() {
        info!("server credentials present");
        return Ok(());
    }

    let credentials = bootstrap::fetch_server_credentials(cfg)
        .await
        .context("fatal: bootstrap fetch failed")?;

    store.set_server_credentials(
        &credentials.cert_chain_pem,
        &credentials.server_pub_sign_key_pem,
    )?;
    info!("server credentials pinned");
    Ok(())
}

/// LoRa side of the loop: drain received frames through the bounded
/// ring, actuate server directives, run the housekeeping timer.
async fn run_lora_task(
    cfg: HubConfig,
    mut engine: LoraEngine,
    socket: Arc<UdpSocket>,
    radio_peer: Option<SocketAddr>,
    events_tx: mpsc::Sender<UpstreamEvent>,
    mut directives_rx: mpsc::Receiver<Directive>,
    epoch: Instant,
) -> Result<()> {
    let mut radio = UdpRadio::new(socket.clone(), radio_peer);
    let mut queue = FrameQueue::new(cfg.packet_queue_size);
    let mut housekeeping = tokio::time::interval(Duration::from_millis(1_000));
    let mut status_timer = tokio::time::interval(STATUS_LOG_INTERVAL);
    let mut buf = [0u8; 2048];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received.context("radio frame bridge recv")?;
                radio.note_peer(from);
                // The UDP bridge carries no link measurements; real
                // drivers report RSSI/SNR per frame.
                queue.push(ReceivedFrame {
                    data: buf[..len].to_vec(),
                    rssi: 0,
                    snr: 0.0,
                });

                while let Some(frame) = queue.pop() {
                    let events = engine.handle_frame(
                        &frame.data,
                        frame.rssi,
                        frame.snr,
                        now_ms(epoch),
                        &mut radio,
                    );
                    for event in events {
                        if events_tx.send(event).await.is_err() {
                            bail!("session task gone");
                        }
                    }
                }
            }
            directive = directives_rx.recv() => {
                let Some(directive) = directive else { bail!("session task gone") };
                engine.apply_directive(directive, now_ms(epoch), &mut radio);
            }
            _ = housekeeping.tick() => {
                engine.tick(now_ms(epoch));
            }
            _ = status_timer.tick() => {
                engine.log_status(now_ms(epoch), queue.dropped_count());
            }
        }
    }
}
