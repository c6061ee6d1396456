//! Bridge vocabulary between the LoRa engine and the server session
//!
//! The two engines never hold references to each other: the LoRa side
//! emits [`UpstreamEvent`]s the session engine wraps into authenticated
//! messages, and the session side emits [`Directive`]s the LoRa engine
//! actuates. The event loop wires the two through bounded channels.

use serde_json::{json, Value};
use uuid::Uuid;

use loragate_common::protocol::SHARED_SECRET_SIZE;

/// Something that happened on the LoRa side and belongs upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// DISCOVERY heard from a non-adopted node.
    Discovery {
        serial_id: Uuid,
        rssi: i16,
        snr: f32,
    },
    /// Adoption handshake completed; the server learns the shared
    /// secret so it can restore the node on reconnect.
    AdoptionCompleted {
        serial_id: Uuid,
        shared_secret: [u8; SHARED_SECRET_SIZE],
    },
    /// Decrypted payload from an adopted node.
    NodeMessage { serial_id: Uuid, message: String },
}

impl UpstreamEvent {
    /// Wire message type for the authenticated upstream frame.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Discovery { .. } => "discovery",
            Self::AdoptionCompleted { .. } => "hub_node_adoption",
            Self::NodeMessage { .. } => "hub_message_from_node",
        }
    }

    /// JSON payload for the authenticated upstream frame.
    pub fn payload(&self) -> Value {
        match self {
            Self::Discovery {
                serial_id,
                rssi,
                snr,
            } => json!({
                "serialId": serial_id.to_string(),
                "rssi": rssi,
                "snr": snr,
            }),
            Self::AdoptionCompleted {
                serial_id,
                shared_secret,
            } => json!({
                "serialId": serial_id.to_string(),
                "sharedSecret": hex::encode(shared_secret),
            }),
            Self::NodeMessage { serial_id, message } => json!({
                "serialId": serial_id.to_string(),
                "message": message,
            }),
        }
    }
}

/// A node record delivered by the server's restoration list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredNode {
    pub serial_id: Uuid,
    pub shared_secret: [u8; SHARED_SECRET_SIZE],
}

/// An authenticated server instruction for the LoRa engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Transmit an unencrypted DISCOVERY_ACK to the node.
    DiscoveryAck { serial_id: Uuid },
    /// Open the adoption window for exactly this node.
    EnableAdoption { serial_id: Uuid },
    /// Send an encrypted COMMAND frame to an adopted node.
    SendCommand { serial_id: Uuid, command: String },
    /// Replace the node registry with the server's list.
    RestoreNodes { nodes: Vec<RestoredNode> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_payload_shape() {
        let serial_id = Uuid::nil();
        let event = UpstreamEvent::Discovery {
            serial_id,
            rssi: -72,
            snr: 9.25,
        };

        assert_eq!(event.message_type(), "discovery");
        let payload = event.payload();
        assert_eq!(payload["serialId"], serial_id.to_string());
        assert_eq!(payload["rssi"], -72);
        assert_eq!(payload["snr"], 9.25);
    }

    #[test]
    fn test_adoption_payload_carries_lowercase_hex_secret() {
        let mut secret = [0u8; SHARED_SECRET_SIZE];
        secret[0] = 0xab;
        secret[19] = 0x01;

        let event = UpstreamEvent::AdoptionCompleted {
            serial_id: Uuid::nil(),
            shared_secret: secret,
        };

        assert_eq!(event.message_type(), "hub_node_adoption");
        let hex_secret = event.payload()["sharedSecret"].as_str().unwrap().to_string();
        assert_eq!(hex_secret.len(), SHARED_SECRET_SIZE * 2);
        assert!(hex_secret.starts_with("ab"));
        assert!(hex_secret.ends_with("01"));
        assert_eq!(hex_secret, hex_secret.to_lowercase());
    }

    #[test]
    fn test_node_message_payload() {
        let event = UpstreamEvent::NodeMessage {
            serial_id: Uuid::nil(),
            message: String::from("telemetry;3872;60;false"),
        };
        assert_eq!(event.message_type(), "hub_message_from_node");
        assert_eq!(event.payload()["message"], "telemetry;3872;60;false");
    }
}
