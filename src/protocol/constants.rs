/// Default TCP port for the transfer server
pub const DEFAULT_PORT: u16 = 53317;

/// Wire protocol version, semantic-versioned
pub const PROTOCOL_VERSION: &str = "1.0";

/// How long a sender keeps polling for the receiver's accept/reject decision
pub const APPROVAL_TIMEOUT_SECS: u64 = 120;

/// Interval between approval-status polls on the sender side
pub const APPROVAL_POLL_MS: u64 = 500;

/// Chunk size for outbound file streaming
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on simultaneously active transfers (backpressure)
pub const MAX_CONCURRENT_TRANSFERS: usize = 4;
