use crate::error::{EngineError, Result};
use crate::protocol::TransferFile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferDirection {
    Outbound,
    Inbound,
}

/// Lifecycle status of a transfer.
///
/// `Rejected`, `Completed`, `Failed` and `Cancelled` are terminal: the record
/// is frozen, one history entry is appended, and no further events carry the
/// transfer's id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Pending,
    Accepted,
    Rejected,
    InProgress,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Completed | Self::Failed | Self::Cancelled
        )
    }
}

/// One file/folder send operation between two peers, tracked end-to-end
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: String,
    pub direction: TransferDirection,
    pub peer_address: String,
    pub peer_port: u16,
    /// Immutable once the transfer is accepted
    pub files: Vec<TransferFile>,
    pub total_size: u64,
    pub bytes_transferred: u64,
    pub status: TransferStatus,
    /// Send/receive attempts made so far, starting at 1
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    /// Set exactly once, on entering a terminal status
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transfer {
    /// Create an inbound transfer from a received offer; starts `Pending`
    pub fn inbound(
        id: String,
        peer_address: String,
        peer_port: u16,
        files: Vec<TransferFile>,
    ) -> Self {
        let total_size = files.iter().map(|f| f.size).sum();
        Self {
            id,
            direction: TransferDirection::Inbound,
            peer_address,
            peer_port,
            files,
            total_size,
            bytes_transferred: 0,
            status: TransferStatus::Pending,
            attempt: 1,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Create an outbound transfer. Starts `Accepted` (locally approved,
    /// awaiting the peer's protocol-level decision); never passes `Pending`.
    pub fn outbound(peer_address: String, peer_port: u16, files: Vec<TransferFile>) -> Self {
        let total_size = files.iter().map(|f| f.size).sum();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction: TransferDirection::Outbound,
            peer_address,
            peer_port,
            files,
            total_size,
            bytes_transferred: 0,
            status: TransferStatus::Accepted,
            attempt: 1,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Accept a pending inbound transfer
    pub fn accept(&mut self) -> Result<()> {
        match self.status {
            TransferStatus::Pending => {
                self.status = TransferStatus::Accepted;
                Ok(())
            }
            other => Err(EngineError::invalid_state(format!(
                "Cannot accept transfer {} in state {:?}",
                self.id, other
            ))),
        }
    }

    /// Reject a pending inbound transfer (terminal)
    pub fn reject(&mut self) -> Result<()> {
        match self.status {
            TransferStatus::Pending => {
                self.finish(TransferStatus::Rejected);
                Ok(())
            }
            other => Err(EngineError::invalid_state(format!(
                "Cannot reject transfer {} in state {:?}",
                self.id, other
            ))),
        }
    }

    /// Mark the peer's protocol-level rejection of an outbound offer (terminal)
    pub fn peer_rejected(&mut self) {
        self.finish(TransferStatus::Rejected);
    }

    /// Data transfer begins
    pub fn begin(&mut self) -> Result<()> {
        match self.status {
            TransferStatus::Accepted | TransferStatus::Retrying => {
                self.status = TransferStatus::InProgress;
                Ok(())
            }
            other => Err(EngineError::invalid_state(format!(
                "Cannot start transfer {} in state {:?}",
                self.id, other
            ))),
        }
    }

    /// A recoverable failure occurred and retry budget remains; `attempt` is
    /// incremented and byte progress rolls back to `acknowledged` (the sum of
    /// sizes the peer has already confirmed). Valid from `Accepted` too, for
    /// failures during offer negotiation before any data flowed.
    pub fn retrying(&mut self, acknowledged: u64) -> Result<()> {
        match self.status {
            TransferStatus::InProgress | TransferStatus::Accepted => {
                self.status = TransferStatus::Retrying;
                self.attempt += 1;
                self.bytes_transferred = acknowledged;
                Ok(())
            }
            other => Err(EngineError::invalid_state(format!(
                "Cannot retry transfer {} in state {:?}",
                self.id, other
            ))),
        }
    }

    /// Record forward byte progress for the active attempt.
    /// Clamped to `total_size`; never decreases within an attempt.
    pub fn advance(&mut self, bytes: u64) {
        self.bytes_transferred = self.bytes_transferred.max(bytes).min(self.total_size);
    }

    /// All bytes of all files acknowledged (terminal)
    pub fn complete(&mut self) -> Result<()> {
        match self.status {
            TransferStatus::InProgress => {
                self.bytes_transferred = self.total_size;
                self.finish(TransferStatus::Completed);
                Ok(())
            }
            other => Err(EngineError::invalid_state(format!(
                "Cannot complete transfer {} in state {:?}",
                self.id, other
            ))),
        }
    }

    /// Unrecoverable error or retries exhausted (terminal)
    pub fn fail(&mut self) {
        if !self.status.is_terminal() {
            self.finish(TransferStatus::Failed);
        }
    }

    /// Explicit cancel (terminal). No-op, not an error, when already terminal.
    /// Returns whether the status actually changed.
    pub fn cancel(&mut self) -> Result<bool> {
        match self.status {
            TransferStatus::Accepted | TransferStatus::InProgress | TransferStatus::Retrying => {
                self.finish(TransferStatus::Cancelled);
                Ok(true)
            }
            status if status.is_terminal() => Ok(false),
            other => Err(EngineError::invalid_state(format!(
                "Cannot cancel transfer {} in state {:?}",
                self.id, other
            ))),
        }
    }

    fn finish(&mut self, status: TransferStatus) {
        debug_assert!(!self.status.is_terminal(), "terminal status reached twice");
        self.status = status;
        if self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }
}
