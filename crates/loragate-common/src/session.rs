//! Secure server channel
//!
//! Every message after session-key derivation is authenticated with an
//! HMAC over a canonical "pack" string:
//!
//! ```text
//! {"type":"<t>","seq":<n>,"ts":<ts>,"nonce":"<b64>"[,"payload":<payload_json>]}
//! ```
//!
//! Field order is normative and there is no whitespace, so the pack is
//! built by concatenation rather than through a serializer. The outgoing
//! wire message is the pack with a trailing `mac` field spliced in, which
//! keeps the two byte-identical up to the MAC.

use serde_json::Value;
use tracing::warn;

use crate::crypto::{self, b64_decode, b64_encode, hmac_sha256, sha256, verify_hmac};
use crate::error::AuthError;

/// Server session key size.
pub const SERVER_KEY_SIZE: usize = 32;
/// Nonce size for server-side messages.
pub const SERVER_NONCE_SIZE: usize = 12;

#[derive(Debug, Clone, Copy)]
struct TimeAnchor {
    server_ts: u64,
    anchored_at_ms: u64,
}

/// Volatile state of the single server session: session key, send/receive
/// sequence numbers and the server-time anchor. Cleared on disconnect.
pub struct SecureChannel {
    session_key: Option<[u8; SERVER_KEY_SIZE]>,
    seq_out: u32,
    seq_in_last: u32,
    anchor: Option<TimeAnchor>,
    max_drift_s: i64,
}

impl SecureChannel {
    pub fn new(max_drift_s: i64) -> Self {
        Self {
            session_key: None,
            seq_out: 1,
            seq_in_last: 0,
            anchor: None,
            max_drift_s,
        }
    }

    pub fn set_session_key(&mut self, key: [u8; SERVER_KEY_SIZE]) {
        self.session_key = Some(key);
    }

    pub fn has_session_key(&self) -> bool {
        self.session_key.is_some()
    }

    /// Forget the session key and reset sequence tracking (disconnect).
    pub fn clear(&mut self) {
        self.session_key = None;
        self.seq_out = 1;
        self.seq_in_last = 0;
    }

    pub fn set_seq_out(&mut self, seq: u32) {
        self.seq_out = seq;
    }

    pub fn last_seq_in(&self) -> u32 {
        self.seq_in_last
    }

    /// Anchor the server clock against the local monotonic clock.
    pub fn set_server_time(&mut self, server_ts: u64, now_ms: u64) {
        self.anchor = Some(TimeAnchor {
            server_ts,
            anchored_at_ms: now_ms,
        });
    }

    /// Server-clock seconds extrapolated from the anchor. Without an
    /// anchor this falls back to local uptime.
    pub fn current_time(&self, now_ms: u64) -> u64 {
        match self.anchor {
            Some(anchor) => anchor.server_ts + (now_ms - anchor.anchored_at_ms) / 1000,
            None => now_ms / 1000 + 1,
        }
    }

    /// Build the canonical MAC input.
    pub fn build_pack(
        msg_type: &str,
        seq: u32,
        ts: u64,
        nonce_b64: &str,
        payload_json: Option<&str>,
    ) -> String {
        let mut pack = format!(
            "{{\"type\":\"{}\",\"seq\":{},\"ts\":{},\"nonce\":\"{}\"",
            msg_type, seq, ts, nonce_b64
        );
        if let Some(payload) = payload_json {
            pack.push_str(",\"payload\":");
            pack.push_str(payload);
        }
        pack.push('}');
        pack
    }

    /// Build an authenticated outgoing message. Consumes one sequence
    /// number (the stamped value is the pre-increment `seq_out`).
    pub fn create_message(
        &mut self,
        msg_type: &str,
        payload: Option<&Value>,
        now_ms: u64,
    ) -> Result<String, AuthError> {
        let key = self.session_key.ok_or(AuthError::NoSessionKey)?;

        let seq = self.seq_out;
        self.seq_out = self.seq_out.wrapping_add(1);

        let ts = self.current_time(now_ms);
        let nonce_b64 = b64_encode(&crypto::random_array::<SERVER_NONCE_SIZE>());

        let payload_text = payload.map(|p| p.to_string());
        let pack = Self::build_pack(msg_type, seq, ts, &nonce_b64, payload_text.as_deref());

        let mac_b64 = b64_encode(&hmac_sha256(&key, pack.as_bytes()));

        // Splice the MAC in as the last field; everything before it is
        // byte-identical to the pack the receiver rebuilds.
        let mut out = pack;
        out.pop();
        out.push_str(",\"mac\":\"");
        out.push_str(&mac_b64);
        out.push_str("\"}");
        Ok(out)
    }

    /// Verify an inbound authenticated message: MAC (constant-time), then
    /// time drift, then strictly-increasing sequence. Only full success
    /// advances `seq_in_last`.
    pub fn verify_message(&mut self, doc: &Value, now_ms: u64) -> Result<(), AuthError> {
        let key = self.session_key.ok_or(AuthError::NoSessionKey)?;

        let msg_type = doc
            .get("type")
            .and_then(Value::as_str)
            .ok_or(AuthError::MissingField("type"))?;
        let seq = doc
            .get("seq")
            .and_then(Value::as_u64)
            .ok_or(AuthError::MissingField("seq"))? as u32;
        let ts = doc
            .get("ts")
            .and_then(Value::as_u64)
            .ok_or(AuthError::MissingField("ts"))?;
        let nonce = doc
            .get("nonce")
            .and_then(Value::as_str)
            .ok_or(AuthError::MissingField("nonce"))?;
        let mac = doc
            .get("mac")
            .and_then(Value::as_str)
            .ok_or(AuthError::MissingField("mac"))?;

        let payload_text = doc.get("payload").map(Value::to_string);
        let pack = Self::build_pack(msg_type, seq, ts, nonce, payload_text.as_deref());

        let mac_bytes = b64_decode(mac).ok_or(AuthError::MalformedField("mac"))?;
        if !verify_hmac(&key, pack.as_bytes(), &mac_bytes) {
            return Err(AuthError::MacMismatch);
        }

        self.check_time_drift(ts, now_ms)?;

        if seq <= self.seq_in_last {
            warn!(seq, last = self.seq_in_last, "out-of-order seq from server");
            return Err(AuthError::OutOfOrderSeq {
                seq,
                last: self.seq_in_last,
            });
        }
        self.seq_in_last = seq;
        Ok(())
    }

    /// Reject timestamps further than the drift limit from our view of
    /// the server clock.
    pub fn check_time_drift(&self, ts: u64, now_ms: u64) -> Result<(), AuthError> {
        let drift = self.current_time(now_ms) as i64 - ts as i64;
        if drift.abs() > self.max_drift_s {
            warn!(drift, limit = self.max_drift_s, "message timestamp drift too large");
            return Err(AuthError::TimeDrift {
                drift: drift.abs(),
                limit: self.max_drift_s,
            });
        }
        Ok(())
    }
}

/// Digest for server-signed control messages: `sha256(ts_string ‖ nonce)`.
pub fn server_signature_digest(ts: u64, nonce_b64: &str) -> Result<[u8; 32], AuthError> {
    let nonce = b64_decode(nonce_b64).ok_or(AuthError::MalformedField("nonce"))?;
    let mut input = ts.to_string().into_bytes();
    input.extend_from_slice(&nonce);
    Ok(sha256(&input))
}

/// Digest the hub signs to prove its identity:
/// `sha256(device_id ‖ ts_string ‖ nonce)`.
pub fn device_signature_digest(
    device_id: &str,
    ts: u64,
    nonce_b64: &str,
) -> Result<[u8; 32], AuthError> {
    let nonce = b64_decode(nonce_b64).ok_or(AuthError::MalformedField("nonce"))?;
    let mut input = format!("{}{}", device_id, ts).into_bytes();
    input.extend_from_slice(&nonce);
    Ok(sha256(&input))
}

/// Verify the `ts`/`nonce`/`sig` envelope of a server-signed message
/// against the pinned server public key. Returns the verified timestamp.
pub fn verify_server_signature(server_pub_pem: &str, doc: &Value) -> Result<u64, AuthError> {
    let ts = doc
        .get("ts")
        .and_then(Value::as_u64)
        .filter(|ts| *ts > 0)
        .ok_or(AuthError::MissingField("ts"))?;
    let nonce = doc
        .get("nonce")
        .and_then(Value::as_str)
        .ok_or(AuthError::MissingField("nonce"))?;
    let sig = doc
        .get("sig")
        .and_then(Value::as_str)
        .ok_or(AuthError::MissingField("sig"))?;

    let digest = server_signature_digest(ts, nonce)?;
    let sig_der = b64_decode(sig).ok_or(AuthError::MalformedField("sig"))?;

    if !crate::crypto::identity::verify_digest(server_pub_pem, &digest, &sig_der) {
        warn!("server signature verification failed");
        return Err(AuthError::BadSignature);
    }
    Ok(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::identity;
    use serde_json::json;

    const KEY: [u8; 32] = [0x3c; 32];

    fn channel_with_key() -> SecureChannel {
        let mut ch = SecureChannel::new(120);
        ch.set_session_key(KEY);
        ch
    }

    #[test]
    fn test_canonical_pack_string() {
        let pack = SecureChannel::build_pack("telemetry", 42, 1003, "bm9uY2U=", Some("{\"uptime\":3}"));
        assert_eq!(
            pack,
            "{\"type\":\"telemetry\",\"seq\":42,\"ts\":1003,\"nonce\":\"bm9uY2U=\",\"payload\":{\"uptime\":3}}"
        );

        let pack = SecureChannel::build_pack("hello_ack", 1, 1000, "bm9uY2U=", None);
        assert_eq!(
            pack,
            "{\"type\":\"hello_ack\",\"seq\":1,\"ts\":1000,\"nonce\":\"bm9uY2U=\"}"
        );
    }

    #[test]
    fn test_create_then_verify_roundtrip() {
        let mut sender = channel_with_key();
        sender.set_server_time(1000, 0);
        sender.set_seq_out(42);

        let mut receiver = channel_with_key();
        receiver.set_server_time(1000, 0);
        receiver.seq_in_last = 41;

        let msg = sender
            .create_message("telemetry", Some(&json!({"uptime": 3})), 3050)
            .unwrap();
        let doc: Value = serde_json::from_str(&msg).unwrap();

        // Anchor ts=1000 at mono 0, sent at mono 3050 => ts 1003.
        assert_eq!(doc["seq"], 42);
        assert_eq!(doc["ts"], 1003);
        assert_eq!(sender.seq_out, 43);

        receiver.verify_message(&doc, 3100).unwrap();
        assert_eq!(receiver.last_seq_in(), 42);
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let mut sender = channel_with_key();
        sender.set_server_time(1000, 0);
        let mut receiver = channel_with_key();
        receiver.set_server_time(1000, 0);

        let msg = sender
            .create_message("telemetry", Some(&json!({"uptime": 3})), 0)
            .unwrap();
        let mut doc: Value = serde_json::from_str(&msg).unwrap();
        doc["payload"]["uptime"] = json!(9000);

        assert_eq!(
            receiver.verify_message(&doc, 0).unwrap_err(),
            AuthError::MacMismatch
        );
        assert_eq!(receiver.last_seq_in(), 0);
    }

    #[test]
    fn test_verify_rejects_time_drift() {
        let mut sender = channel_with_key();
        // Sender believes it is 300 seconds behind the receiver.
        sender.set_server_time(700, 0);
        let mut receiver = channel_with_key();
        receiver.set_server_time(1000, 0);

        let msg = sender.create_message("telemetry", None, 0).unwrap();
        let doc: Value = serde_json::from_str(&msg).unwrap();

        assert!(matches!(
            receiver.verify_message(&doc, 0).unwrap_err(),
            AuthError::TimeDrift { drift: 300, .. }
        ));
        assert_eq!(receiver.last_seq_in(), 0, "seq must stay unmutated");
    }

    #[test]
    fn test_verify_rejects_replayed_seq() {
        let mut sender = channel_with_key();
        sender.set_server_time(1000, 0);
        let mut receiver = channel_with_key();
        receiver.set_server_time(1000, 0);

        let msg = sender.create_message("telemetry", None, 0).unwrap();
        let doc: Value = serde_json::from_str(&msg).unwrap();

        receiver.verify_message(&doc, 0).unwrap();
        assert!(matches!(
            receiver.verify_message(&doc, 0).unwrap_err(),
            AuthError::OutOfOrderSeq { .. }
        ));
    }

    #[test]
    fn test_create_message_requires_key() {
        let mut ch = SecureChannel::new(120);
        assert_eq!(
            ch.create_message("telemetry", None, 0).unwrap_err(),
            AuthError::NoSessionKey
        );
    }

    #[test]
    fn test_clear_resets_sequences() {
        let mut ch = channel_with_key();
        ch.set_seq_out(99);
        ch.seq_in_last = 7;
        ch.clear();
        assert!(!ch.has_session_key());
        assert_eq!(ch.seq_out, 1);
        assert_eq!(ch.last_seq_in(), 0);
    }

    #[test]
    fn test_server_signature_envelope() {
        let server = identity::generate_keypair().unwrap();
        let nonce_b64 = b64_encode(&[0x01; 12]);
        let ts = 1_700_000_000u64;

        let digest = server_signature_digest(ts, &nonce_b64).unwrap();
        let sig = identity::sign_digest(&server.private_pem, &digest).unwrap();

        let doc = json!({
            "type": "timestamp_ack",
            "ts": ts,
            "nonce": nonce_b64,
            "sig": b64_encode(&sig),
        });
        assert_eq!(verify_server_signature(&server.public_pem, &doc).unwrap(), ts);

        // Wrong timestamp breaks the signature.
        let mut forged = doc.clone();
        forged["ts"] = json!(ts + 1);
        assert_eq!(
            verify_server_signature(&server.public_pem, &forged).unwrap_err(),
            AuthError::BadSignature
        );

        // Missing fields are malformed, not panics.
        let incomplete = json!({"type": "timestamp_ack", "ts": ts});
        assert!(verify_server_signature(&server.public_pem, &incomplete).is_err());
    }

    #[test]
    fn test_device_signature_digest_matches_manual_concat() {
        let nonce = [0x10u8; 12];
        let nonce_b64 = b64_encode(&nonce);

        let digest = device_signature_digest("hub-001", 1234, &nonce_b64).unwrap();

        let mut manual = b"hub-0011234".to_vec();
        manual.extend_from_slice(&nonce);
        assert_eq!(digest, sha256(&manual));
    }

    #[test]
    fn test_current_time_fallback_without_anchor() {
        let ch = SecureChannel::new(120);
        assert_eq!(ch.current_time(5_000), 6);
    }
}
