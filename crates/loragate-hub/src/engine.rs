//! LoRa protocol engine
//!
//! Owns the node registry, the hub's ephemeral ECDH key pair and the
//! adoption window, and turns received frames into upstream events and
//! outgoing frames. Parse and verification failures are logged and
//! dropped; there are no ACKs or retransmits on this link — liveness
//! comes from the nodes' periodic transmissions and the challenge
//! resync.

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use loragate_common::crypto::ecdh;
use loragate_common::error::CryptoError;
use loragate_common::protocol::{frames, secure, Frame, FrameType, ECC_PUBLIC_KEY_SIZE};
use loragate_common::registry::NodeRegistry;

use crate::bridge::{Directive, RestoredNode, UpstreamEvent};
use crate::radio::Radio;

/// At most one adoption window, opened by a server directive naming a
/// specific node.
struct AdoptionWindow {
    expected_node_id: Uuid,
    started_ms: u64,
    duration_ms: u64,
}

impl AdoptionWindow {
    fn expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.started_ms) > self.duration_ms
    }
}

pub struct LoraEngine {
    registry: NodeRegistry,
    window: Option<AdoptionWindow>,
    keypair: ecdh::KeyPair,
    adoption_timeout_ms: u64,
    discovered_ttl_ms: u64,
}

impl LoraEngine {
    pub fn new(
        max_nodes: usize,
        max_discovered: usize,
        adoption_timeout_ms: u64,
        discovered_ttl_ms: u64,
    ) -> Result<Self, CryptoError> {
        info!("generating hub LoRa key pair");
        Ok(Self {
            registry: NodeRegistry::new(max_nodes, max_discovered),
            window: None,
            keypair: ecdh::make_keypair()?,
            adoption_timeout_ms,
            discovered_ttl_ms,
        })
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn hub_public_key(&self) -> &[u8; ECC_PUBLIC_KEY_SIZE] {
        &self.keypair.public
    }

    /// Process one received frame.
    pub fn handle_frame(
        &mut self,
        raw: &[u8],
        rssi: i16,
        snr: f32,
        now_ms: u64,
        radio: &mut dyn Radio,
    ) -> Vec<UpstreamEvent> {
        self.expire_window(now_ms);

        let frame = match Frame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, len = raw.len(), "dropping malformed frame");
                return Vec::new();
            }
        };

        match frame {
            Frame::Discovery { node_id } => self.handle_discovery(node_id, rssi, snr, now_ms),
            Frame::AdoptRequest {
                node_id,
                node_public_key,
            } => self.handle_adoption_request(node_id, &node_public_key, now_ms, radio),
            Frame::Challenge(challenge) => self.handle_challenge(raw, &challenge, radio),
            Frame::Data(data) => self.handle_data(raw, &data, now_ms),
            other => {
                debug!(frame_type = ?other.frame_type(), "ignoring hub-originated frame type");
                Vec::new()
            }
        }
    }

    /// Actuate an authenticated server directive.
    pub fn apply_directive(&mut self, directive: Directive, now_ms: u64, radio: &mut dyn Radio) {
        match directive {
            Directive::EnableAdoption { serial_id } => self.enable_adoption(serial_id, now_ms),
            Directive::DiscoveryAck { serial_id } => {
                let frame = frames::build_discovery_ack(&serial_id);
                match radio.transmit(&frame) {
                    Ok(()) => info!(node = %serial_id, "discovery ack sent"),
                    Err(e) => error!(error = %e, "failed to send discovery ack"),
                }
            }
            Directive::SendCommand { serial_id, command } => {
                self.send_command(&serial_id, &command, radio);
            }
            Directive::RestoreNodes { nodes } => self.restore_nodes(&nodes, now_ms),
        }
    }

    /// Timer work: adoption-window expiry and discovered-table aging.
    pub fn tick(&mut self, now_ms: u64) {
        self.expire_window(now_ms);
        self.registry
            .purge_discovered_older_than(self.discovered_ttl_ms, now_ms);
    }

    /// Periodic status report: node population, discovered table and the
    /// radio's dropped-frame count.
    pub fn log_status(&self, now_ms: u64, dropped_frames: u64) {
        info!(
            active_nodes = self.registry.active_count(),
            discovered_nodes = self.registry.discovered_nodes().count(),
            dropped_frames,
            adoption_window_open = self.window.is_some(),
            "hub status"
        );
        for record in self.registry.active_nodes() {
            info!(
                node = %record.node_id,
                last_seen_s = now_ms.saturating_sub(record.last_seen_ms) / 1000,
                "active node"
            );
        }
        for entry in self.registry.discovered_nodes() {
            info!(
                node = %entry.node_id,
                rssi = entry.rssi,
                snr = entry.snr,
                last_seen_s = now_ms.saturating_sub(entry.last_seen_ms) / 1000,
                "discovered node"
            );
        }
    }

    fn expire_window(&mut self, now_ms: u64) {
        if self.window.as_ref().is_some_and(|w| w.expired(now_ms)) {
            info!("adoption window ended");
            self.window = None;
        }
    }

    fn enable_adoption(&mut self, node_id: Uuid, now_ms: u64) {
        info!(
            node = %node_id,
            duration_s = self.adoption_timeout_ms / 1000,
            "adoption window open"
        );
        self.window = Some(AdoptionWindow {
            expected_node_id: node_id,
            started_ms: now_ms,
            duration_ms: self.adoption_timeout_ms,
        });
    }

    fn handle_discovery(
        &mut self,
        node_id: Uuid,
        rssi: i16,
        snr: f32,
        now_ms: u64,
    ) -> Vec<UpstreamEvent> {
        if self.registry.find(&node_id).is_some() {
            // Already adopted; its beacons carry no news.
            return Vec::new();
        }

        info!(node = %node_id, rssi, snr, "discovery beacon");
        self.registry.add_discovered(&node_id, rssi, snr, now_ms);

        vec![UpstreamEvent::Discovery {
            serial_id: node_id,
            rssi,
            snr,
        }]
    }

    fn handle_adoption_request(
        &mut self,
        node_id: Uuid,
        node_public_key: &[u8; ECC_PUBLIC_KEY_SIZE],
        now_ms: u64,
        radio: &mut dyn Radio,
    ) -> Vec<UpstreamEvent> {
        info!(node = %node_id, "adoption request");

        let Some(window) = &self.window else {
            warn!("not in adoption mode, ignoring");
            return Vec::new();
        };
        if window.expected_node_id != node_id {
            warn!(
                expected = %window.expected_node_id,
                "adoption request from unexpected node, ignoring"
            );
            return Vec::new();
        }

        let secret = match ecdh::shared_secret(node_public_key, &self.keypair.private) {
            Ok(secret) => secret,
            Err(e) => {
                error!(error = %e, "ECDH failed");
                return Vec::new();
            }
        };
        let session_key = ecdh::derive_session_key(&secret);

        if !self.registry.add(&node_id, session_key, now_ms) {
            error!("failed to add node");
            return Vec::new();
        }

        let response = frames::build_adopt_response(&node_id, 0x01, &self.keypair.public);
        match radio.transmit(&response) {
            Ok(()) => {
                info!(node = %node_id, "adoption response sent");
                self.window = None;
                vec![UpstreamEvent::AdoptionCompleted {
                    serial_id: node_id,
                    shared_secret: secret,
                }]
            }
            Err(e) => {
                error!(error = %e, "failed to send adoption response");
                Vec::new()
            }
        }
    }

    fn handle_challenge(
        &mut self,
        raw: &[u8],
        challenge: &frames::ChallengeFrame,
        radio: &mut dyn Radio,
    ) -> Vec<UpstreamEvent> {
        let Some(idx) = self.registry.find(&challenge.node_id) else {
            warn!(node = %challenge.node_id, "challenge from unknown node");
            return Vec::new();
        };
        let Some(record) = self.registry.get(idx) else {
            return Vec::new();
        };
        let session_key = record.session_key;

        if !secure::verify_frame_hmac(raw, &session_key) {
            error!(node = %challenge.node_id, "challenge HMAC verification failed");
            return Vec::new();
        }

        info!(
            node_tx = challenge.sender_tx,
            node_rx = challenge.sender_rx,
            "challenge received"
        );
        self.registry
            .sync(idx, challenge.sender_tx, challenge.sender_rx);

        let Some(record) = self.registry.get(idx) else {
            return Vec::new();
        };
        let response = secure::seal_challenge(
            FrameType::ChallengeResponse,
            &challenge.node_id,
            &session_key,
            record.tx_counter,
            record.rx_counter,
            &challenge.nonce,
        );
        match radio.transmit(&response) {
            Ok(()) => info!("challenge response sent, counter sync complete"),
            Err(e) => error!(error = %e, "failed to send challenge response"),
        }
        Vec::new()
    }

    fn handle_data(
        &mut self,
        raw: &[u8],
        frame: &frames::SecureFrame,
        now_ms: u64,
    ) -> Vec<UpstreamEvent> {
        let Some(idx) = self.registry.find(&frame.node_id) else {
            warn!(node = %frame.node_id, "data from unknown node");
            return Vec::new();
        };
        let Some(record) = self.registry.get(idx) else {
            return Vec::new();
        };
        let session_key = record.session_key;

        if !secure::verify_frame_hmac(raw, &session_key) {
            error!(node = %frame.node_id, "data HMAC verification failed");
            return Vec::new();
        }

        if !self.registry.validate(idx, frame.counter) {
            // Replay or duplicate, already logged by the registry.
            return Vec::new();
        }

        let plaintext = match secure::open_message(frame, &session_key) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(error = %e, "dropping undecryptable data frame");
                return Vec::new();
            }
        };

        self.registry.update_rx(idx, frame.counter);
        self.registry.update_last_seen(idx, now_ms);

        info!(node = %frame.node_id, counter = frame.counter, "decrypted message from node");
        vec![UpstreamEvent::NodeMessage {
            serial_id: frame.node_id,
            message: String::from_utf8_lossy(&plaintext).into_owned(),
        }]
    }

    fn send_command(&mut self, node_id: &Uuid, command: &str, radio: &mut dyn Radio) {
        let Some(idx) = self.registry.find(node_id) else {
            warn!(node = %node_id, "cannot send command to unknown node");
            return;
        };
        let Some(record) = self.registry.get(idx) else {
            return;
        };

        let counter = record.tx_counter;
        let frame = match secure::seal_message(
            FrameType::Command,
            node_id,
            &record.session_key,
            counter,
            command.as_bytes(),
        ) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "failed to encrypt command");
                return;
            }
        };

        // The stamped counter is consumed by the attempt, whether or not
        // the radio reports success.
        let result = radio.transmit(&frame);
        self.registry.increment_tx(idx);

        match result {
            Ok(()) => info!(node = %node_id, counter, "command sent"),
            Err(e) => error!(error = %e, "failed to send command"),
        }
    }

    fn restore_nodes(&mut self, nodes: &[RestoredNode], now_ms: u64) {
        self.registry.clear();
        info!(count = nodes.len(), "restoring nodes from server");

        for node in nodes {
            let session_key = ecdh::derive_session_key(&node.shared_secret);
            if self.registry.add(&node.serial_id, session_key, now_ms) {
                info!(node = %node.serial_id, "node restored");
            }
        }
    }
}
