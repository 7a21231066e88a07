use crate::error::{EngineError, Result};
use crate::protocol::TransferOffer;

/// Validates that a port number is usable (1-65535)
pub fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(EngineError::config("Port must be between 1 and 65535"));
    }
    Ok(())
}

/// Validates an inbound transfer offer before a Pending record is created.
///
/// The declared total is advisory; the sum of per-file sizes is authoritative
/// and a mismatch is only logged.
pub fn validate_offer(offer: &TransferOffer) -> Result<u64> {
    if offer.transfer_id.trim().is_empty() {
        return Err(EngineError::config("Transfer id cannot be empty"));
    }

    if offer.files.is_empty() {
        return Err(EngineError::config("Transfer must contain at least one file"));
    }

    for file in &offer.files {
        if file.id.trim().is_empty() {
            return Err(EngineError::config("File id cannot be empty"));
        }
        if file.name.trim().is_empty() {
            return Err(EngineError::config("File name cannot be empty"));
        }
    }

    let computed: u64 = offer.files.iter().map(|f| f.size).sum();
    if computed != offer.total_size {
        tracing::warn!(
            "Offer total mismatch for {}: declared {}, computed {}",
            offer.transfer_id,
            offer.total_size,
            computed
        );
    }

    Ok(computed)
}
