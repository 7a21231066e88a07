use crate::error::{EngineError, Result};
use crate::probe::http_base;
use crate::protocol::{
    APPROVAL_POLL_MS, APPROVAL_TIMEOUT_SECS, ApprovalStatus, CHUNK_SIZE, TransferDecision,
    TransferFile, TransferOffer, TransferResponse,
};
use reqwest::{Body, Client as HttpClient};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

/// Observes cumulative bytes streamed for the current file
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Outcome of offering a transfer and waiting for the peer's decision
#[derive(Debug)]
pub enum OfferOutcome {
    /// Peer accepted; chunks may be uploaded with this token
    Accepted { token: String },
    /// Peer declined the offer
    Rejected,
}

/// Paces an outbound stream so sustained throughput never exceeds a
/// configured bytes-per-second limit.
#[derive(Debug)]
pub struct Throttle {
    limit_bps: u64,
    started: Instant,
    sent: u64,
}

impl Throttle {
    pub fn new(limit_bps: u64) -> Self {
        Self {
            limit_bps,
            started: Instant::now(),
            sent: 0,
        }
    }

    /// Account for bytes just sent and sleep until the average rate is back
    /// under the limit.
    pub async fn pace(&mut self, just_sent: usize) {
        self.sent += just_sent as u64;
        let target = Duration::from_secs_f64(self.sent as f64 / self.limit_bps as f64);
        let elapsed = self.started.elapsed();
        if target > elapsed {
            sleep(target - elapsed).await;
        }
    }
}

/// Sender-side wire client: offers transfers, polls for approval, and streams
/// file chunks to the receiving peer.
#[derive(Clone)]
pub struct TransferClient {
    http: HttpClient,
}

impl TransferClient {
    pub fn new() -> Self {
        let http = HttpClient::builder()
            // No global timeout; large transfers legitimately take long.
            // Stalled connections are caught by the read timeout instead.
            .read_timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| HttpClient::new());
        Self { http }
    }

    /// Post a transfer offer to the peer
    pub async fn offer(
        &self,
        address: &str,
        port: u16,
        offer: &TransferOffer,
    ) -> Result<TransferResponse> {
        let url = format!("{}/transfer", http_base(address, port));

        let response = self
            .http
            .post(&url)
            .json(offer)
            .send()
            .await
            .map_err(EngineError::from_request)?;

        if !response.status().is_success() {
            return Err(EngineError::fatal(format!(
                "Peer rejected offer with status {}",
                response.status()
            )));
        }

        response
            .json::<TransferResponse>()
            .await
            .map_err(|e| EngineError::transient(format!("Malformed offer response: {}", e)))
    }

    /// Poll the peer until the user there accepts or rejects the offer.
    /// Returns early when `cancel` fires.
    pub async fn wait_for_approval(
        &self,
        address: &str,
        port: u16,
        transfer_id: &str,
        cancel: &CancellationToken,
    ) -> Result<OfferOutcome> {
        let url = format!(
            "{}/transfer/status?transfer_id={}",
            http_base(address, port),
            transfer_id
        );
        let deadline = Instant::now() + Duration::from_secs(APPROVAL_TIMEOUT_SECS);
        let poll_interval = Duration::from_millis(APPROVAL_POLL_MS);

        loop {
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(EngineError::from_request)?;

            if !response.status().is_success() {
                return Err(EngineError::transient(format!(
                    "Status check failed: {}",
                    response.status()
                )));
            }

            let status: ApprovalStatus = response
                .json()
                .await
                .map_err(|e| EngineError::transient(format!("Malformed status: {}", e)))?;

            match status.status {
                TransferDecision::Accepted => {
                    let token = status.token.ok_or_else(|| {
                        EngineError::fatal("Peer accepted but provided no token")
                    })?;
                    return Ok(OfferOutcome::Accepted { token });
                }
                TransferDecision::Rejected => return Ok(OfferOutcome::Rejected),
                TransferDecision::NotFound => {
                    return Err(EngineError::fatal("Peer no longer knows the transfer"));
                }
                TransferDecision::Pending => {
                    if Instant::now() >= deadline {
                        return Err(EngineError::fatal("Transfer approval timed out"));
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(OfferOutcome::Rejected),
                        _ = sleep(poll_interval) => {}
                    }
                }
            }
        }
    }

    /// Stream one file to the peer's chunk endpoint.
    ///
    /// `on_progress` receives cumulative bytes read for this file. The stream
    /// stops at the next chunk boundary when `cancel` fires; the resulting
    /// short upload is rejected by the receiver and discarded there.
    pub async fn send_file(
        &self,
        address: &str,
        port: u16,
        transfer_id: &str,
        token: &str,
        file: &TransferFile,
        path: &Path,
        bandwidth_limit_bps: Option<u64>,
        cancel: CancellationToken,
        on_progress: ProgressFn,
    ) -> Result<()> {
        let url = format!(
            "{}/chunk?transfer_id={}&file_id={}&token={}",
            http_base(address, port),
            transfer_id,
            file.id,
            token
        );

        let source = tokio::fs::File::open(path)
            .await
            .map_err(EngineError::from_disk)?;
        let file_size = file.size;

        let stream = {
            let cancel = cancel.clone();
            let on_progress = on_progress.clone();
            async_stream::stream! {
                let mut source = source;
                let mut throttle = bandwidth_limit_bps.map(Throttle::new);
                let mut sent: u64 = 0;
                let mut buf = vec![0u8; CHUNK_SIZE];

                loop {
                    // Cooperative cancellation checkpoint, once per chunk
                    if cancel.is_cancelled() {
                        break;
                    }
                    match source.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            sent += n as u64;
                            on_progress(sent);
                            if let Some(ref mut throttle) = throttle {
                                throttle.pace(n).await;
                            }
                            yield Ok::<_, std::io::Error>(bytes::Bytes::copy_from_slice(&buf[..n]));
                        }
                        Err(e) => {
                            yield Err(e);
                            break;
                        }
                    }
                }
            }
        };

        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/octet-stream")
            .header("Content-Length", file_size)
            .body(Body::wrap_stream(stream))
            .send()
            .await
            .map_err(EngineError::from_request)?;

        if cancel.is_cancelled() {
            return Err(EngineError::invalid_state("Transfer cancelled"));
        }

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.as_u16() == 401 {
            Err(EngineError::fatal("Upload token rejected by peer"))
        } else if status.is_server_error() {
            Err(EngineError::transient(format!(
                "Peer failed to store {}: {}",
                file.name, status
            )))
        } else {
            Err(EngineError::fatal(format!(
                "Peer refused chunk upload for {}: {}",
                file.name, status
            )))
        }
    }
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_throttle_paces_to_limit() {
        let mut throttle = Throttle::new(1000); // 1000 B/s
        let before = Instant::now();
        throttle.pace(500).await;
        // 500 bytes at 1000 B/s must take at least half a second
        assert!(before.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_no_sleep_under_limit() {
        let mut throttle = Throttle::new(u64::MAX);
        let before = Instant::now();
        throttle.pace(CHUNK_SIZE).await;
        assert!(before.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_offer_to_unreachable_peer() {
        let client = TransferClient::new();
        let offer = TransferOffer {
            transfer_id: "t-1".to_string(),
            sender_name: None,
            files: vec![TransferFile::new("a.txt", 1)],
            total_size: 1,
        };
        let err = client.offer("127.0.0.1", 1, &offer).await.unwrap_err();
        assert!(matches!(err, EngineError::Unreachable { .. }));
    }
}
