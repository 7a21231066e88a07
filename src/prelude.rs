//! Prelude module for convenient imports
//!
//! Use `use beamdrop::prelude::*;` to import commonly used types

// Engine and events
pub use crate::engine::TransferEngine;
pub use crate::event::{EngineEvent, EventBus, TransferProgress};

// Protocol types
pub use crate::protocol::{
    ApprovalStatus, DEFAULT_PORT, PROTOCOL_VERSION, PeerInfo, PendingTransfer, ResolveResult,
    TransferDecision, TransferFile, TransferOffer, TransferResponse,
};

// Transfer records
pub use crate::core::{Transfer, TransferDirection, TransferStatus};

// Address resolution and probing
pub use crate::probe::PeerProbe;
pub use crate::resolver::{DebouncedResolver, Resolve, SystemResolver, resolve_blocking};

// Network interfaces
pub use crate::netif::{InterfaceCategory, InterfaceFilters, NetworkInterface};

// Stores
pub use crate::store::{Favorite, HistoryRecord, Settings};

// Errors
pub use crate::error::{EngineError, Result};
