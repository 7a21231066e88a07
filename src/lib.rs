//! LAN file-transfer engine: peer probing, offer/approval negotiation,
//! chunked transfer with retry and progress, and the persistent stores
//! behind it. UI-free; consumers drive it through [`TransferEngine`]
//! commands and observe outcomes on its event stream.

pub mod client;
pub mod core;
pub mod engine;
pub mod error;
pub mod event;
pub mod netif;
pub mod probe;
pub mod protocol;
pub mod resolver;
pub mod store;

mod server;

pub mod prelude;

pub use engine::TransferEngine;
pub use error::{EngineError, Result};
pub use event::{EngineEvent, EventBus, TransferProgress};
pub use netif::{InterfaceCategory, InterfaceFilters, NetworkInterface};
pub use probe::PeerProbe;
pub use protocol::{
    ApprovalStatus, DEFAULT_PORT, PROTOCOL_VERSION, PeerInfo, PendingTransfer, ResolveResult,
    TransferDecision, TransferFile, TransferOffer, TransferResponse, validate_offer, validate_port,
};
pub use resolver::{DebouncedResolver, Resolve, SystemResolver, resolve_blocking};
pub use store::{Favorite, HistoryRecord, Settings};
