//! Server session engine
//!
//! A single WebSocket to the backend, TLS-pinned to the bootstrapped
//! certificate. The handshake is deterministic:
//!
//! 1. send `timestamp` (plain JSON)
//! 2. `timestamp_ack` — verify the server signature, anchor the clock
//! 3. send `hello` (first contact, carries the public key) or `session`
//!    (already adopted), signed with the device identity key
//! 4. `hello_ack` / `session_ack` — verify, derive the 32-byte session
//!    key with HKDF, adopt `seq0`
//! 5. answer with a MAC-authenticated ack
//!
//! Any verification failure aborts the step and the reconnect loop is
//! the liveness mechanism: a disconnect clears the key and the handshake
//! restarts from scratch.

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use loragate_common::crypto::identity::IdentityKeyPair;
use loragate_common::crypto::{self, identity};
use loragate_common::protocol::SHARED_SECRET_SIZE;
use loragate_common::session::{self, SecureChannel};

use crate::bridge::{Directive, RestoredNode, UpstreamEvent};
use crate::clock::now_ms;
use crate::config::HubConfig;
use crate::storage::{DeviceStore, KeyValueStore};
use crate::telemetry::TelemetryCollector;

/// Results of handling one inbound message.
#[derive(Default)]
pub struct SessionOutput {
    /// Messages to transmit on the socket, in order.
    pub outgoing: Vec<String>,
    /// Authenticated instructions for the LoRa engine.
    pub directives: Vec<Directive>,
    /// The server acknowledged adoption for the first time; persist the
    /// flag.
    pub adopted_now: bool,
}

/// Protocol state machine for the server session, free of socket I/O so
/// the whole handshake is testable in-process.
pub struct SessionEngine {
    channel: SecureChannel,
    device_id: String,
    device_keys: IdentityKeyPair,
    server_sign_pub_pem: String,
    adopted: bool,
    authenticated: bool,
}

impl SessionEngine {
    pub fn new(
        device_id: String,
        device_keys: IdentityKeyPair,
        server_sign_pub_pem: String,
        adopted: bool,
        max_drift_s: i64,
    ) -> Self {
        Self {
            channel: SecureChannel::new(max_drift_s),
            device_id,
            device_keys,
            server_sign_pub_pem,
            adopted,
            authenticated: false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Messages to send immediately after the socket opens.
    pub fn on_connect(&mut self) -> Vec<String> {
        info!("starting server handshake");
        vec![String::from(r#"{"type":"timestamp"}"#)]
    }

    /// Disconnect: the session key and authentication are gone until the
    /// next full handshake.
    pub fn on_disconnect(&mut self) {
        self.channel.clear();
        self.authenticated = false;
        warn!("server session cleared");
    }

    /// Dispatch one inbound text (or binary-as-text) message.
    pub fn handle_text(&mut self, text: &str, now_ms: u64) -> SessionOutput {
        let mut out = SessionOutput::default();

        let doc: Value = match serde_json::from_str(text) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "dropping unparseable server message");
                return out;
            }
        };

        let msg_type = doc.get("type").and_then(Value::as_str).unwrap_or("");
        debug!(msg_type, "server message");

        match msg_type {
            "timestamp_ack" => self.handle_timestamp_ack(&doc, now_ms, &mut out),
            "hello_ack" => self.handle_key_ack(&doc, now_ms, false, &mut out),
            "session_ack" => self.handle_key_ack(&doc, now_ms, true, &mut out),
            "adopt_ack" => self.handle_adopt_ack(&doc, now_ms, &mut out),
            "discovery_ack" | "ws_enable_node_adoption" | "ws_node_command" => {
                self.handle_node_directive(&doc, now_ms, msg_type, &mut out);
            }
            other => debug!(msg_type = other, "ignoring unknown message type"),
        }
        out
    }

    /// Wrap an upstream event as an authenticated message. Before the
    /// session is authenticated, events are dropped at the source.
    pub fn compose_event(&mut self, event: &UpstreamEvent, now_ms: u64) -> Option<String> {
        if !self.authenticated {
            debug!(
                msg_type = event.message_type(),
                "dropping upstream event, session not authenticated"
            );
            return None;
        }
        match self
            .channel
            .create_message(event.message_type(), Some(&event.payload()), now_ms)
        {
            Ok(msg) => Some(msg),
            Err(e) => {
                error!(error = %e, "failed to build upstream message");
                None
            }
        }
    }

    /// Wrap a telemetry payload; same authentication gate as events.
    pub fn compose_telemetry(&mut self, payload: Value, now_ms: u64) -> Option<String> {
        if !self.authenticated {
            return None;
        }
        self.channel
            .create_message("telemetry", Some(&payload), now_ms)
            .map_err(|e| error!(error = %e, "failed to build telemetry message"))
            .ok()
    }

    fn handle_timestamp_ack(&mut self, doc: &Value, now_ms: u64, out: &mut SessionOutput) {
        info!("processing timestamp ack");
        let ts = match session::verify_server_signature(&self.server_sign_pub_pem, doc) {
            Ok(ts) => ts,
            Err(e) => {
                error!(error = %e, "timestamp ack rejected");
                return;
            }
        };
        self.channel.set_server_time(ts, now_ms);
        info!(server_time = ts, "server time anchored");

        match self.build_identity_message(now_ms) {
            Ok(msg) => out.outgoing.push(msg),
            Err(e) => error!(error = %e, "failed to build identity message"),
        }
    }

    /// `hello` (first contact) or `session` (adopted): both carry the
    /// device signature over `sha256(device_id ‖ ts ‖ nonce)`.
    fn build_identity_message(&self, now_ms: u64) -> Result<String> {
        let nonce_b64 = crypto::b64_encode(&crypto::random_array::<12>());
        let ts = self.channel.current_time(now_ms);

        let digest = session::device_signature_digest(&self.device_id, ts, &nonce_b64)
            .context("building identity digest")?;
        let sig = identity::sign_digest(&self.device_keys.private_pem, &digest)
            .context("signing identity digest")?;

        let mut doc = json!({
            "type": if self.adopted { "session" } else { "hello" },
            "device_id": self.device_id,
            "ts": ts,
            "nonce": nonce_b64,
            "sig": crypto::b64_encode(&sig),
        });
        if !self.adopted {
            doc["pubkey_pem"] = json!(self.device_keys.public_pem);
        }

        info!(adopted = self.adopted, "identity message built");
        Ok(doc.to_string())
    }

    fn handle_key_ack(&mut self, doc: &Value, now_ms: u64, restoring: bool, out: &mut SessionOutput) {
        info!(restoring, "processing key ack");

        let ts = match session::verify_server_signature(&self.server_sign_pub_pem, doc) {
            Ok(ts) => ts,
            Err(e) => {
                error!(error = %e, "key ack rejected");
                return;
            }
        };
        if restoring {
            if let Err(e) = self.channel.check_time_drift(ts, now_ms) {
                error!(error = %e, "key ack rejected");
                return;
            }
        }

        let Some(ikm) = doc
            .get("ikm")
            .and_then(Value::as_str)
            .and_then(crypto::b64_decode)
        else {
            error!("key ack missing ikm");
            return;
        };
        let Some(salt) = doc
            .get("kdf")
            .and_then(|kdf| kdf.get("salt"))
            .and_then(Value::as_str)
            .and_then(crypto::b64_decode)
        else {
            error!("key ack missing kdf salt");
            return;
        };
        let Some(info_str) = doc
            .get("kdf")
            .and_then(|kdf| kdf.get("info"))
            .and_then(Value::as_str)
        else {
            error!("key ack missing kdf info");
            return;
        };

        let session_key = crypto::hkdf_sha256(&ikm, &salt, info_str.as_bytes());
        self.channel.set_session_key(session_key);
        self.channel.set_server_time(ts, now_ms);
        if let Some(seq0) = doc.get("seq0").and_then(Value::as_u64) {
            self.channel.set_seq_out(seq0 as u32);
        }
        info!("session key derived");

        let ack_type = if restoring { "session_ack" } else { "hello_ack" };
        match self.channel.create_message(ack_type, None, now_ms) {
            Ok(msg) => out.outgoing.push(msg),
            Err(e) => error!(error = %e, "failed to build ack"),
        }

        if restoring && self.adopted {
            self.authenticated = true;
            info!("session restored, device already adopted");

            if let Some(nodes) = doc
                .get("payload")
                .and_then(|p| p.get("nodes"))
                .and_then(Value::as_array)
            {
                // The server's list replaces the registry wholesale,
                // even when empty.
                out.directives.push(Directive::RestoreNodes {
                    nodes: parse_restored_nodes(nodes),
                });
            }
        }
    }

    fn handle_adopt_ack(&mut self, doc: &Value, now_ms: u64, out: &mut SessionOutput) {
        info!("processing adopt ack");
        if let Err(e) = self.channel.verify_message(doc, now_ms) {
            error!(error = %e, "adopt ack verification failed");
            return;
        }

        self.authenticated = true;
        if !self.adopted {
            self.adopted = true;
            out.adopted_now = true;
            info!("device marked as adopted");
        }
        info!("device authenticated");
    }

    fn handle_node_directive(
        &mut self,
        doc: &Value,
        now_ms: u64,
        msg_type: &str,
        out: &mut SessionOutput,
    ) {
        if let Err(e) = self.channel.verify_message(doc, now_ms) {
            error!(error = %e, msg_type, "directive verification failed");
            return;
        }

        let payload = doc.get("payload");
        let Some(serial) = payload
            .and_then(|p| p.get("serial_id").or_else(|| p.get("serialId")))
            .and_then(Value::as_str)
        else {
            error!(msg_type, "directive payload missing serial id");
            return;
        };
        let Ok(serial_id) = Uuid::parse_str(serial) else {
            error!(serial, "invalid node UUID");
            return;
        };

        match msg_type {
            "discovery_ack" => out.directives.push(Directive::DiscoveryAck { serial_id }),
            "ws_enable_node_adoption" => {
                out.directives.push(Directive::EnableAdoption { serial_id });
            }
            "ws_node_command" => {
                let Some(command) = payload
                    .and_then(|p| p.get("message"))
                    .and_then(Value::as_str)
                else {
                    error!("node command payload missing message");
                    return;
                };
                out.directives.push(Directive::SendCommand {
                    serial_id,
                    command: command.to_string(),
                });
            }
            _ => unreachable!("dispatched from handle_text"),
        }
    }
}

fn parse_restored_nodes(nodes: &[Value]) -> Vec<RestoredNode> {
    nodes
        .iter()
        .filter_map(|entry| {
            let serial = entry
                .get("serialId")
                .or_else(|| entry.get("serial_id"))?
                .as_str()?;
            let secret_hex = entry
                .get("sharedSecret")
                .or_else(|| entry.get("shared_secret"))?
                .as_str()?;

            let serial_id = match Uuid::parse_str(serial) {
                Ok(id) => id,
                Err(_) => {
                    error!(serial, "invalid node UUID in restoration list");
                    return None;
                }
            };
            let bytes = match hex::decode(secret_hex) {
                Ok(bytes) if bytes.len() == SHARED_SECRET_SIZE => bytes,
                _ => {
                    error!(node = serial, "invalid shared secret in restoration list");
                    return None;
                }
            };

            let mut shared_secret = [0u8; SHARED_SECRET_SIZE];
            shared_secret.copy_from_slice(&bytes);
            Some(RestoredNode {
                serial_id,
                shared_secret,
            })
        })
        .collect()
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reconnect loop: connect, drive the session until it dies, clear the
/// volatile state, wait, repeat.
pub async fn run_session_task<S: KeyValueStore>(
    cfg: HubConfig,
    mut store: DeviceStore<S>,
    mut engine: SessionEngine,
    mut events_rx: mpsc::Receiver<UpstreamEvent>,
    directives_tx: mpsc::Sender<Directive>,
    epoch: Instant,
) -> Result<()> {
    let mut telemetry = TelemetryCollector::new(cfg.firmware_version.clone());

    loop {
        match connect(&cfg, &store).await {
            Ok(stream) => {
                info!("websocket connected");
                let result = drive_session(
                    &cfg,
                    &mut engine,
                    &mut store,
                    &mut telemetry,
                    stream,
                    &mut events_rx,
                    &directives_tx,
                    epoch,
                )
                .await;
                if let Err(e) = result {
                    warn!(error = %e, "websocket session ended");
                }
                engine.on_disconnect();
            }
            Err(e) => warn!(error = %e, "websocket connect failed"),
        }

        sleep(Duration::from_millis(cfg.ws_reconnect_interval_ms)).await;
    }
}

/// Open the socket, pinning TLS to the bootstrapped certificate chain.
/// Without a pinned certificate the connection falls back to plaintext —
/// a bootstrap-only state.
async fn connect<S: KeyValueStore>(cfg: &HubConfig, store: &DeviceStore<S>) -> Result<WsStream> {
    let pinned_cert = store.server_certificate();

    let (scheme, connector) = match (&pinned_cert, cfg.server_use_tls) {
        (Some(cert_pem), true) => ("wss", Some(pinned_connector(cert_pem)?)),
        _ => {
            warn!("no pinned server certificate, using insecure connection");
            ("ws", None)
        }
    };

    let url = format!(
        "{}://{}:{}{}",
        scheme, cfg.server_host, cfg.server_port, cfg.websocket_path
    );
    info!(%url, "connecting to websocket");

    let (stream, _) = connect_async_tls_with_config(url.as_str(), None, false, connector)
        .await
        .context("websocket connect")?;
    Ok(stream)
}

fn pinned_connector(cert_pem: &str) -> Result<Connector> {
    let mut roots = rustls::RootCertStore::empty();
    let certs =
        rustls_pemfile::certs(&mut cert_pem.as_bytes()).context("parsing pinned certificate")?;
    anyhow::ensure!(!certs.is_empty(), "pinned certificate chain is empty");
    for cert in certs {
        roots
            .add(&rustls::Certificate(cert))
            .context("adding pinned certificate")?;
    }

    let tls = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Connector::Rustls(Arc::new(tls)))
}

#[allow(clippy::too_many_arguments)]
async fn drive_session<S: KeyValueStore>(
    cfg: &HubConfig,
    engine: &mut SessionEngine,
    store: &mut DeviceStore<S>,
    telemetry: &mut TelemetryCollector,
    stream: WsStream,
    events_rx: &mut mpsc::Receiver<UpstreamEvent>,
    directives_tx: &mpsc::Sender<Directive>,
    epoch: Instant,
) -> Result<()> {
    let (mut sink, mut stream) = stream.split();

    for msg in engine.on_connect() {
        sink.send(Message::Text(msg)).await?;
    }

    let telemetry_period = Duration::from_millis(cfg.telemetry_interval_ms);
    let mut telemetry_timer =
        interval_at(tokio::time::Instant::now() + telemetry_period, telemetry_period);
    let heartbeat_period = Duration::from_millis(cfg.ws_heartbeat_interval_ms);
    let mut heartbeat_timer =
        interval_at(tokio::time::Instant::now() + heartbeat_period, heartbeat_period);
    heartbeat_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let pong_timeout = Duration::from_millis(cfg.ws_heartbeat_timeout_ms);
    // Armed after every Ping; a Pong disarms it, expiry counts a miss.
    let mut pong_deadline: Option<tokio::time::Instant> = None;
    let mut missed_pongs: u32 = 0;

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(msg) = msg else { bail!("connection closed") };
                match msg? {
                    Message::Text(text) => {
                        apply_output(
                            engine.handle_text(&text, now_ms(epoch)),
                            &mut sink,
                            store,
                            directives_tx,
                        )
                        .await?;
                    }
                    // Binary frames are accepted and parsed identically.
                    Message::Binary(bin) => {
                        if let Ok(text) = String::from_utf8(bin) {
                            apply_output(
                                engine.handle_text(&text, now_ms(epoch)),
                                &mut sink,
                                store,
                                directives_tx,
                            )
                            .await?;
                        } else {
                            warn!("dropping non-UTF8 binary message");
                        }
                    }
                    Message::Ping(payload) => sink.send(Message::Pong(payload)).await?,
                    Message::Pong(_) => {
                        missed_pongs = 0;
                        pong_deadline = None;
                    }
                    Message::Close(_) => bail!("server closed connection"),
                    _ => {}
                }
            }
            event = events_rx.recv() => {
                let Some(event) = event else { bail!("event channel closed") };
                if let Some(msg) = engine.compose_event(&event, now_ms(epoch)) {
                    sink.send(Message::Text(msg)).await?;
                }
            }
            _ = telemetry_timer.tick() => {
                if engine.is_authenticated() {
                    let payload = telemetry.collect();
                    if let Some(msg) = engine.compose_telemetry(payload, now_ms(epoch)) {
                        debug!("telemetry sent");
                        sink.send(Message::Text(msg)).await?;
                    }
                }
            }
            _ = heartbeat_timer.tick(), if pong_deadline.is_none() => {
                sink.send(Message::Ping(Vec::new())).await?;
                pong_deadline = Some(tokio::time::Instant::now() + pong_timeout);
            }
            _ = async { tokio::time::sleep_until(pong_deadline.unwrap()).await },
                if pong_deadline.is_some() =>
            {
                missed_pongs += 1;
                if missed_pongs > cfg.ws_heartbeat_retries {
                    bail!(
                        "heartbeat timed out after {} retries",
                        cfg.ws_heartbeat_retries
                    );
                }
                // Retry on the timeout cadence rather than waiting out
                // the send interval.
                warn!(missed_pongs, "heartbeat pong overdue, retrying");
                sink.send(Message::Ping(Vec::new())).await?;
                pong_deadline = Some(tokio::time::Instant::now() + pong_timeout);
            }
        }
    }
}

async fn apply_output<S, K>(
    output: SessionOutput,
    sink: &mut S,
    store: &mut DeviceStore<K>,
    directives_tx: &mpsc::Sender<Directive>,
) -> Result<()>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
    K: KeyValueStore,
{
    if output.adopted_now {
        store.set_adopted(true).context("persisting adopted flag")?;
    }
    for msg in output.outgoing {
        sink.send(Message::Text(msg)).await?;
    }
    for directive in output.directives {
        directives_tx
            .send(directive)
            .await
            .context("lora engine gone")?;
    }
    Ok(())
}
