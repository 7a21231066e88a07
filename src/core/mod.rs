pub mod file;
pub mod progress;
pub mod retry;
pub mod transfer;

pub use file::{build_transfer_file, collect_directory, get_mime_type};
pub use progress::ProgressTracker;
pub use retry::{RetryDecision, RetryPolicy};
pub use transfer::{Transfer, TransferDirection, TransferStatus};
