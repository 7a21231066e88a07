use crate::error::{EngineError, Result};
use crate::protocol::PeerInfo;
use reqwest::Client;
use std::time::Duration;

/// Hard ceiling on any probe round-trip
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Base URL for a peer endpoint; IPv6 literals get bracketed
pub(crate) fn http_base(address: &str, port: u16) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("http://[{}]:{}", address, port)
    } else {
        format!("http://{}:{}", address, port)
    }
}

/// Reachability and identity checks against a resolved address:port pair.
///
/// Every call completes within [`PROBE_TIMEOUT`] and fails closed: timeouts,
/// refusals and protocol mismatches report unreachable instead of surfacing
/// a fault.
#[derive(Clone)]
pub struct PeerProbe {
    client: Client,
}

impl PeerProbe {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .connect_timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    /// `true` when the peer answers its health endpoint with success
    pub async fn check(&self, address: &str, port: u16) -> bool {
        let url = format!("{}/health", http_base(address, port));
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("Probe of {}:{} failed: {}", address, port, e);
                false
            }
        }
    }

    /// Fetch the peer's self-reported identity
    pub async fn get_info(&self, address: &str, port: u16) -> Result<PeerInfo> {
        let url = format!("{}/info", http_base(address, port));

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::unreachable(format!("{}:{} - {}", address, port, e)))?;

        if !response.status().is_success() {
            return Err(EngineError::unreachable(format!(
                "{}:{} returned status {}",
                address,
                port,
                response.status()
            )));
        }

        response
            .json::<PeerInfo>()
            .await
            .map_err(|e| EngineError::unreachable(format!("Malformed peer info: {}", e)))
    }
}

impl Default for PeerProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_base_formats() {
        assert_eq!(http_base("10.0.0.5", 53317), "http://10.0.0.5:53317");
        assert_eq!(http_base("fe80::1", 9000), "http://[fe80::1]:9000");
    }

    #[tokio::test]
    async fn test_check_fails_closed_on_refused_connection() {
        let probe = PeerProbe::new();
        // Nothing listens on this port of the discard range
        assert!(!probe.check("127.0.0.1", 1).await);
    }

    #[tokio::test]
    async fn test_get_info_reports_unreachable() {
        let probe = PeerProbe::new();
        let err = probe.get_info("127.0.0.1", 1).await.unwrap_err();
        assert!(matches!(err, EngineError::Unreachable { .. }));
    }
}
