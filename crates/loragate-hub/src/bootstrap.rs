//! One-time bootstrap against the backend server
//!
//! Trust-on-first-use: the very first HTTPS fetch deliberately skips
//! certificate validation, and the certificate chain it returns is
//! pinned for every subsequent connection. On a first boot without a
//! device key pair the hub also announces its public key. Failure of
//! either step (when the corresponding state is missing) is fatal — the
//! loop never starts, and recovery is a factory reset.

use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::info;

use crate::config::HubConfig;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Bootstrap response. Field spellings changed across server revisions;
/// both are accepted as aliases.
#[derive(Debug, Deserialize)]
pub struct BootstrapResponse {
    pub cert_chain_pem: String,
    #[serde(alias = "pub_sign_key_pem")]
    pub server_pub_sign_key_pem: String,
    #[serde(default, alias = "ts")]
    pub srv_ts: Option<u64>,
}

fn tofu_client() -> Result<reqwest::Client> {
    // TOFU: no certificate validation for this one exchange.
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("building bootstrap HTTP client")
}

/// Fetch the server certificate chain and signing public key.
pub async fn fetch_server_credentials(cfg: &HubConfig) -> Result<BootstrapResponse> {
    let url = format!(
        "https://{}:{}{}",
        cfg.server_host, cfg.server_port, cfg.bootstrap_path
    );
    info!(%url, "fetching server credentials (TOFU)");

    let response: BootstrapResponse = tofu_client()?
        .get(&url)
        .send()
        .await
        .context("bootstrap request failed")?
        .error_for_status()
        .context("bootstrap request rejected")?
        .json()
        .await
        .context("bootstrap response is not valid JSON")?;

    ensure!(
        !response.cert_chain_pem.is_empty() && !response.server_pub_sign_key_pem.is_empty(),
        "bootstrap response is missing credentials"
    );

    if let Some(ts) = response.srv_ts {
        info!(server_time = ts, "server credentials fetched");
    }
    Ok(response)
}

/// Announce the freshly generated device public key (first boot only).
pub async fn announce_public_key(cfg: &HubConfig, pubkey_pem: &str) -> Result<()> {
    let url = format!(
        "https://{}:{}{}",
        cfg.server_host, cfg.server_port, cfg.announce_path
    );
    info!(%url, "announcing device public key");

    tofu_client()?
        .post(&url)
        .json(&json!({ "pubkey_pem": pubkey_pem }))
        .send()
        .await
        .context("announce request failed")?
        .error_for_status()
        .context("announce request rejected")?;

    info!("public key announced");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_accepts_both_field_spellings() {
        let old: BootstrapResponse = serde_json::from_str(
            r#"{"cert_chain_pem":"cert","pub_sign_key_pem":"key","ts":1700000000}"#,
        )
        .unwrap();
        assert_eq!(old.server_pub_sign_key_pem, "key");
        assert_eq!(old.srv_ts, Some(1_700_000_000));

        let new: BootstrapResponse = serde_json::from_str(
            r#"{"cert_chain_pem":"cert","server_pub_sign_key_pem":"key","srv_ts":42}"#,
        )
        .unwrap();
        assert_eq!(new.server_pub_sign_key_pem, "key");
        assert_eq!(new.srv_ts, Some(42));
    }

    #[test]
    fn test_response_timestamp_is_optional() {
        let response: BootstrapResponse =
            serde_json::from_str(r#"{"cert_chain_pem":"cert","pub_sign_key_pem":"key"}"#).unwrap();
        assert_eq!(response.srv_ts, None);
    }
}
