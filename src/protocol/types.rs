use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One file within a transfer offer.
///
/// `relative_path` preserves directory structure when a whole folder is sent;
/// it is empty for top-level files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFile {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub relative_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Transfer offer sent to a peer's `/transfer` endpoint
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOffer {
    pub transfer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub files: Vec<TransferFile>,
    pub total_size: u64,
}

/// Immediate response to a transfer offer.
///
/// `accepted:false` without a token means the offer is pending user approval
/// and the sender should poll `/transfer/status`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Receiver-side decision reported by `/transfer/status`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferDecision {
    Pending,
    Accepted,
    Rejected,
    NotFound,
}

/// Poll result for a pending offer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalStatus {
    pub status: TransferDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Identity reported by a peer's `/info` endpoint.
///
/// Transient: produced by a probe, never stored beyond the call that made it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub version: String,
    pub app: String,
}

/// An inbound offer awaiting accept/reject, as exposed to consumers
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTransfer {
    pub id: String,
    pub source_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub files: Vec<TransferFile>,
    pub total_size: u64,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

/// Result of resolving a destination address or hostname
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolveResult {
    pub hostname: String,
    pub ips: Vec<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferFile {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            size,
            relative_path: String::new(),
            mime_type: None,
        }
    }

    /// Destination path of this file relative to the download directory
    pub fn dest_relative(&self) -> PathBuf {
        if self.relative_path.is_empty() {
            PathBuf::from(&self.name)
        } else {
            PathBuf::from(&self.relative_path)
        }
    }
}
