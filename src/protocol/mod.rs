pub mod constants;
pub mod types;
pub mod validation;

pub use constants::{
    APPROVAL_POLL_MS, APPROVAL_TIMEOUT_SECS, CHUNK_SIZE, DEFAULT_PORT, MAX_CONCURRENT_TRANSFERS,
    PROTOCOL_VERSION,
};
pub use types::{
    ApprovalStatus, PeerInfo, PendingTransfer, ResolveResult, TransferDecision, TransferFile,
    TransferOffer, TransferResponse,
};
pub use validation::{validate_offer, validate_port};
