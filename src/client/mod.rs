pub mod client;

pub use client::{OfferOutcome, ProgressFn, Throttle, TransferClient};
