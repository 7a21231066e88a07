use crate::client::{OfferOutcome, TransferClient};
use crate::core::{
    ProgressTracker, RetryDecision, RetryPolicy, Transfer, TransferDirection, TransferStatus,
};
use crate::core::{build_transfer_file, collect_directory};
use crate::error::{EngineError, Result};
use crate::event::{EngineEvent, EventBus};
use crate::netif::{NetworkInterface, get_interfaces};
use crate::probe::PeerProbe;
use crate::protocol::{
    ApprovalStatus, MAX_CONCURRENT_TRANSFERS, PendingTransfer, ResolveResult, TransferDecision,
    TransferFile, TransferOffer, TransferResponse, validate_offer, validate_port,
};
use crate::resolver::{Resolve, SystemResolver, resolve_blocking};
use crate::server::{self, ServerHandle};
use crate::store::{
    Favorite, FavoritesStore, HistoryRecord, HistoryStore, Settings, SettingsStore,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock, Semaphore, broadcast};
use tokio_util::sync::CancellationToken;

/// Per-transfer bookkeeping held in the active table.
///
/// The inner mutex serializes all mutation of one transfer; handles for
/// different ids are independent.
#[derive(Clone)]
pub(crate) struct TransferHandle {
    pub(crate) transfer: Arc<AsyncMutex<Transfer>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) tracker: Arc<parking_lot::Mutex<ProgressTracker>>,
}

impl TransferHandle {
    fn new(transfer: Transfer) -> Self {
        let tracker = ProgressTracker::new(transfer.id.clone(), transfer.total_size);
        Self {
            transfer: Arc::new(AsyncMutex::new(transfer)),
            cancel: CancellationToken::new(),
            tracker: Arc::new(parking_lot::Mutex::new(tracker)),
        }
    }
}

/// Everything an upload handler needs to stream one file to disk
#[derive(Debug)]
pub(crate) struct ChunkGrant {
    pub(crate) transfer: Arc<AsyncMutex<Transfer>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) tracker: Arc<parking_lot::Mutex<ProgressTracker>>,
    pub(crate) file: TransferFile,
    pub(crate) download_dir: PathBuf,
}

/// Engine-wide state, shared by command handlers, the server, and transfer
/// tasks. There are no ambient singletons; every task holds an `Arc` to this.
pub(crate) struct EngineShared {
    pub(crate) settings: SettingsStore,
    pub(crate) favorites: FavoritesStore,
    pub(crate) history: HistoryStore,
    pub(crate) events: EventBus,
    transfers: AsyncMutex<HashMap<String, TransferHandle>>,
    /// Inbound offers awaiting a user decision
    pending_offers: AsyncRwLock<HashMap<String, PendingTransfer>>,
    /// Upload tokens for accepted inbound transfers
    approved_tokens: AsyncRwLock<HashMap<String, String>>,
    /// Rejection reasons kept for the sender's status polls
    rejected: AsyncRwLock<HashMap<String, String>>,
    /// file ids the receiver has fully stored, per transfer
    received_files: AsyncMutex<HashMap<String, HashSet<String>>>,
    send_permits: Arc<Semaphore>,
    client: TransferClient,
    probe: PeerProbe,
}

impl EngineShared {
    pub(crate) fn device_name(&self) -> String {
        self.settings.get().device_name
    }

    /// Record an inbound offer and answer the sender.
    ///
    /// Offers from trusted hosts are accepted immediately with a token;
    /// everyone else gets a pending answer and a `TransferRequest` event
    /// prompts the local user.
    pub(crate) async fn handle_offer(
        &self,
        offer: TransferOffer,
        source_ip: String,
    ) -> Result<TransferResponse> {
        let total_size = validate_offer(&offer)?;

        // A repeated offer for a known id (sender retrying after a network
        // hiccup) is answered from the current decision instead of creating
        // a second record.
        if self.transfers.lock().await.contains_key(&offer.transfer_id) {
            let status = self.approval_status(&offer.transfer_id).await;
            return Ok(TransferResponse {
                accepted: status.status == TransferDecision::Accepted,
                message: status.message,
                token: status.token,
            });
        }

        tracing::info!(
            "Inbound offer {} from {}: {} files, {} bytes",
            offer.transfer_id,
            source_ip,
            offer.files.len(),
            total_size
        );

        let settings = self.settings.get();
        let is_trusted = settings.trusted_hosts.iter().any(|h| h == &source_ip);

        let transfer = Transfer::inbound(
            offer.transfer_id.clone(),
            source_ip.clone(),
            settings.port,
            offer.files.clone(),
        );
        let handle = TransferHandle::new(transfer);

        if is_trusted {
            handle.transfer.lock().await.accept()?;
            let token = uuid::Uuid::new_v4().to_string();
            self.approved_tokens
                .write()
                .await
                .insert(offer.transfer_id.clone(), token.clone());
            self.transfers
                .lock()
                .await
                .insert(offer.transfer_id.clone(), handle);

            return Ok(TransferResponse {
                accepted: true,
                message: Some("Auto-accepted from trusted host".to_string()),
                token: Some(token),
            });
        }

        let pending = PendingTransfer {
            id: offer.transfer_id.clone(),
            source_ip,
            sender_name: offer.sender_name.clone(),
            files: offer.files,
            total_size,
            received_at: Utc::now(),
        };

        self.transfers
            .lock()
            .await
            .insert(offer.transfer_id.clone(), handle);
        self.pending_offers
            .write()
            .await
            .insert(offer.transfer_id.clone(), pending.clone());

        self.events
            .publish(EngineEvent::TransferRequest { transfer: pending });

        Ok(TransferResponse {
            accepted: false,
            message: Some("Awaiting user approval".to_string()),
            token: None,
        })
    }

    /// Answer a sender's approval poll
    pub(crate) async fn approval_status(&self, transfer_id: &str) -> ApprovalStatus {
        if let Some(token) = self.approved_tokens.read().await.get(transfer_id) {
            return ApprovalStatus {
                status: TransferDecision::Accepted,
                token: Some(token.clone()),
                message: None,
            };
        }
        if let Some(reason) = self.rejected.read().await.get(transfer_id) {
            return ApprovalStatus {
                status: TransferDecision::Rejected,
                token: None,
                message: Some(reason.clone()),
            };
        }
        if self.pending_offers.read().await.contains_key(transfer_id) {
            return ApprovalStatus {
                status: TransferDecision::Pending,
                token: None,
                message: Some("Awaiting user approval".to_string()),
            };
        }
        ApprovalStatus {
            status: TransferDecision::NotFound,
            token: None,
            message: Some("Transfer not found".to_string()),
        }
    }

    /// Authorize one chunk upload. `Ok(None)` means the file was already
    /// stored in full and the upload is acknowledged without rewriting it.
    pub(crate) async fn chunk_grant(
        &self,
        transfer_id: &str,
        file_id: &str,
        token: &str,
    ) -> Result<Option<ChunkGrant>> {
        {
            let approved = self.approved_tokens.read().await;
            if approved.get(transfer_id).map(String::as_str) != Some(token) {
                return Err(EngineError::invalid_state("Invalid or expired token"));
            }
        }

        let handle = self
            .transfers
            .lock()
            .await
            .get(transfer_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(transfer_id))?;

        {
            let received = self.received_files.lock().await;
            if received
                .get(transfer_id)
                .is_some_and(|set| set.contains(file_id))
            {
                return Ok(None);
            }
        }

        let file = {
            let mut transfer = handle.transfer.lock().await;
            // First chunk of an accepted transfer flips it to InProgress
            if transfer.status == TransferStatus::Accepted {
                transfer.begin()?;
            }
            transfer
                .files
                .iter()
                .find(|f| f.id == file_id)
                .cloned()
                .ok_or_else(|| EngineError::not_found(file_id))?
        };

        Ok(Some(ChunkGrant {
            transfer: handle.transfer.clone(),
            cancel: handle.cancel.clone(),
            tracker: handle.tracker.clone(),
            file,
            download_dir: self.settings.get().download_dir,
        }))
    }

    /// Record a fully stored file; finalizes the transfer when it was the
    /// last one.
    pub(crate) async fn file_received(&self, transfer_id: &str, file_id: &str) -> Result<()> {
        let expected = {
            let handle = self
                .transfers
                .lock()
                .await
                .get(transfer_id)
                .cloned()
                .ok_or_else(|| EngineError::not_found(transfer_id))?;

            let mut transfer = handle.transfer.lock().await;
            let size = transfer
                .files
                .iter()
                .find(|f| f.id == file_id)
                .map(|f| f.size)
                .unwrap_or(0);
            let done = transfer.bytes_transferred + size;
            transfer.advance(done);
            transfer.files.len()
        };

        let received_count = {
            let mut received = self.received_files.lock().await;
            let set = received.entry(transfer_id.to_string()).or_default();
            set.insert(file_id.to_string());
            set.len()
        };

        if received_count >= expected {
            tracing::info!(
                "Transfer {} complete: all {} files received",
                transfer_id,
                expected
            );
            self.finalize(transfer_id, Finalize::Complete).await;
        }
        Ok(())
    }

    /// A receiver-side fatal error (disk full etc.) ends the transfer
    pub(crate) async fn receive_failed(&self, transfer_id: &str, error: &EngineError) {
        tracing::error!("Receive of {} failed: {}", transfer_id, error);
        self.finalize(transfer_id, Finalize::Failed(error.to_string()))
            .await;
    }

    /// Drive a transfer to its terminal status exactly once: freeze the
    /// record, append one history entry, emit the terminal event, and drop
    /// all bookkeeping for the id. Later calls for the same id are no-ops.
    async fn finalize(&self, transfer_id: &str, outcome: Finalize) {
        let Some(handle) = self.transfers.lock().await.remove(transfer_id) else {
            return;
        };

        let record = {
            let mut transfer = handle.transfer.lock().await;
            if transfer.status.is_terminal() {
                None
            } else {
                match outcome {
                    Finalize::Complete => {
                        let _ = transfer.complete();
                    }
                    Finalize::Failed(_) => transfer.fail(),
                    Finalize::Cancelled => {
                        let _ = transfer.cancel();
                    }
                    Finalize::PeerRejected => transfer.peer_rejected(),
                }
                // A transition refused from the current state still ends the
                // transfer; it must not linger half-finalized
                if !transfer.status.is_terminal() {
                    transfer.fail();
                }
                Some(HistoryRecord::from_transfer(&transfer))
            }
        };

        handle.cancel.cancel();
        self.pending_offers.write().await.remove(transfer_id);
        self.approved_tokens.write().await.remove(transfer_id);
        self.received_files.lock().await.remove(transfer_id);

        let Some(record) = record else { return };
        let status = record.status;
        let direction = record.direction;

        if let Err(e) = self.history.add(record) {
            self.events.publish(EngineEvent::EngineError {
                error: format!("Failed to record history: {}", e),
            });
        }

        let id = transfer_id.to_string();
        let event = match (status, outcome) {
            (TransferStatus::Completed, _) => {
                Some(EngineEvent::TransferComplete { transfer_id: id })
            }
            (TransferStatus::Cancelled, _) => {
                Some(EngineEvent::TransferCancelled { transfer_id: id })
            }
            // A local rejection was the user's own decision; only the sender
            // side surfaces the peer's refusal as a failure
            (TransferStatus::Rejected, _) => match direction {
                TransferDirection::Outbound => Some(EngineEvent::TransferFailed {
                    transfer_id: id,
                    error: "Rejected by peer".to_string(),
                }),
                TransferDirection::Inbound => None,
            },
            (_, Finalize::Failed(error)) => Some(EngineEvent::TransferFailed {
                transfer_id: id,
                error,
            }),
            (status, _) => Some(EngineEvent::TransferFailed {
                transfer_id: id,
                error: format!("Transfer ended as {:?}", status),
            }),
        };
        if let Some(event) = event {
            self.events.publish(event);
        }
    }
}

#[derive(Clone, Debug)]
enum Finalize {
    Complete,
    Failed(String),
    Cancelled,
    PeerRejected,
}

/// The transfer engine: owns all transfer state, the persistent stores, the
/// server socket, and the event stream. Commands validate and enqueue; the
/// outcome of anything long-running arrives via events.
pub struct TransferEngine {
    shared: Arc<EngineShared>,
    server: AsyncMutex<Option<ServerHandle>>,
}

impl TransferEngine {
    /// Open an engine whose stores live under `config_dir`
    pub fn open(config_dir: &Path) -> Result<Self> {
        let shared = EngineShared {
            settings: SettingsStore::open(config_dir)?,
            favorites: FavoritesStore::open(config_dir)?,
            history: HistoryStore::open(config_dir)?,
            events: EventBus::default(),
            transfers: AsyncMutex::new(HashMap::new()),
            pending_offers: AsyncRwLock::new(HashMap::new()),
            approved_tokens: AsyncRwLock::new(HashMap::new()),
            rejected: AsyncRwLock::new(HashMap::new()),
            received_files: AsyncMutex::new(HashMap::new()),
            send_permits: Arc::new(Semaphore::new(MAX_CONCURRENT_TRANSFERS)),
            client: TransferClient::new(),
            probe: PeerProbe::new(),
        };

        Ok(Self {
            shared: Arc::new(shared),
            server: AsyncMutex::new(None),
        })
    }

    /// Open an engine with stores in the platform config directory
    pub fn with_default_dirs() -> Result<Self> {
        let dir = crate::store::default_config_dir()
            .ok_or_else(|| EngineError::config("Could not determine config directory"))?;
        Self::open(&dir)
    }

    /// Subscribe to the engine's event stream
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    // ========================================================================
    // Server lifecycle
    // ========================================================================

    /// Bind the transfer server on the configured port. Emits `ServerStarted`.
    /// A bind failure is reported, never retried automatically.
    pub async fn start_server(&self) -> Result<u16> {
        let mut server = self.server.lock().await;
        if let Some(handle) = server.as_ref() {
            return Ok(handle.port());
        }

        let port = self.shared.settings.get().port;
        let handle = server::spawn(self.shared.clone(), port).await?;
        let bound = handle.port();
        *server = Some(handle);

        self.shared
            .events
            .publish(EngineEvent::ServerStarted { port: bound });
        Ok(bound)
    }

    /// Stop accepting inbound offers. In-flight uploads finish gracefully.
    pub async fn stop_server(&self) {
        if let Some(handle) = self.server.lock().await.take() {
            handle.shutdown();
        }
    }

    /// Move the server to `new_port`.
    ///
    /// The new listener is bound before the old one shuts down gracefully, so
    /// in-flight uploads on the old binding run to completion; only new
    /// inbound offers see the new port. Emits `PortChanged` on success.
    pub async fn change_port(&self, new_port: u16, restart_immediately: bool) -> Result<()> {
        validate_port(new_port)?;

        let mut settings = self.shared.settings.get();
        settings.port = new_port;
        self.shared.settings.update(settings).map_err(|e| {
            self.shared.events.publish(EngineEvent::EngineError {
                error: format!("Failed to persist settings: {}", e),
            });
            e
        })?;

        if restart_immediately {
            let mut server = self.server.lock().await;
            if server.is_some() {
                // Bind first; the old listener keeps serving if this fails
                let next = server::spawn(self.shared.clone(), new_port).await?;
                if let Some(old) = server.replace(next) {
                    old.shutdown();
                }
            }
        }

        self.shared
            .events
            .publish(EngineEvent::PortChanged { new_port });
        Ok(())
    }

    // ========================================================================
    // Destination resolution and probing
    // ========================================================================

    /// Resolve a destination to candidate IPs. A literal IP is returned as-is
    /// without any network lookup.
    pub fn resolve_address(address: &str) -> ResolveResult {
        resolve_blocking(address)
    }

    /// `true` when the peer answers its health endpoint in time
    pub async fn check_peer(&self, address: &str, port: u16) -> bool {
        self.shared.probe.check(address, port).await
    }

    /// Identity reported by the peer, as JSON
    pub async fn get_peer_info(&self, address: &str, port: u16) -> Result<serde_json::Value> {
        let info = self.shared.probe.get_info(address, port).await?;
        Ok(serde_json::to_value(info)?)
    }

    /// Local non-loopback interfaces, classified and filtered per settings
    pub fn get_interfaces(&self) -> Vec<NetworkInterface> {
        get_interfaces(&self.shared.settings.get().interface_filters)
    }

    // ========================================================================
    // Outbound transfers
    // ========================================================================

    /// Send files to a peer. Validates and enqueues; returns the new transfer
    /// id immediately. Progress and the outcome arrive via events.
    pub async fn send_files(&self, address: &str, port: u16, paths: Vec<PathBuf>) -> Result<String> {
        let mut files = Vec::with_capacity(paths.len());
        for path in &paths {
            files.push(build_transfer_file(path).await?);
        }
        self.spawn_outbound(address, port, files, paths).await
    }

    /// Send a whole directory, preserving its structure on the receiver
    pub async fn send_directory(&self, address: &str, port: u16, path: &Path) -> Result<String> {
        let entries = collect_directory(path).await?;
        let (paths, files): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
        self.spawn_outbound(address, port, files, paths).await
    }

    async fn spawn_outbound(
        &self,
        address: &str,
        port: u16,
        files: Vec<TransferFile>,
        paths: Vec<PathBuf>,
    ) -> Result<String> {
        let settings = self.shared.settings.get();
        if settings.receive_only {
            return Err(EngineError::config(
                "Sending is disabled in receive-only mode",
            ));
        }
        validate_port(port)?;
        if files.is_empty() {
            return Err(EngineError::config("Nothing to send"));
        }

        let transfer = Transfer::outbound(address.to_string(), port, files);
        let id = transfer.id.clone();
        let handle = TransferHandle::new(transfer);
        self.shared
            .transfers
            .lock()
            .await
            .insert(id.clone(), handle.clone());

        let shared = self.shared.clone();
        let address = address.to_string();
        let task_id = id.clone();
        tokio::spawn(async move {
            run_outbound(shared, task_id, address, port, paths, handle).await;
        });

        Ok(id)
    }

    // ========================================================================
    // Inbound decisions
    // ========================================================================

    /// Accept a pending inbound transfer; the sender may start uploading
    pub async fn accept_transfer(&self, id: &str) -> Result<()> {
        let handle = self
            .shared
            .transfers
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(id))?;

        handle.transfer.lock().await.accept()?;

        let token = uuid::Uuid::new_v4().to_string();
        self.shared
            .approved_tokens
            .write()
            .await
            .insert(id.to_string(), token);
        self.shared.pending_offers.write().await.remove(id);
        tracing::info!("Transfer {} accepted", id);
        Ok(())
    }

    /// Reject a pending inbound transfer (terminal)
    pub async fn reject_transfer(&self, id: &str) -> Result<()> {
        {
            let transfers = self.shared.transfers.lock().await;
            let handle = transfers.get(id).ok_or_else(|| EngineError::not_found(id))?;
            let transfer = handle.transfer.lock().await;
            if transfer.status != TransferStatus::Pending {
                return Err(EngineError::invalid_state(format!(
                    "Cannot reject transfer {} in state {:?}",
                    id, transfer.status
                )));
            }
        }

        self.shared
            .rejected
            .write()
            .await
            .insert(id.to_string(), "Rejected by user".to_string());
        self.shared.finalize(id, Finalize::PeerRejected).await;
        tracing::info!("Transfer {} rejected", id);
        Ok(())
    }

    /// Accept every currently pending transfer; no-op on an empty set
    pub async fn accept_all(&self) -> Result<()> {
        for id in self.pending_ids().await {
            self.accept_transfer(&id).await?;
        }
        Ok(())
    }

    /// Reject every currently pending transfer; no-op on an empty set
    pub async fn reject_all(&self) -> Result<()> {
        for id in self.pending_ids().await {
            self.reject_transfer(&id).await?;
        }
        Ok(())
    }

    async fn pending_ids(&self) -> Vec<String> {
        self.shared
            .pending_offers
            .read()
            .await
            .keys()
            .cloned()
            .collect()
    }

    /// Cancel an accepted or in-flight transfer. A no-op, not an error, when
    /// the transfer is already terminal.
    pub async fn cancel_transfer(&self, id: &str) -> Result<()> {
        let handle = self
            .shared
            .transfers
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(id))?;

        {
            // Validate before signalling the I/O task; the transition itself
            // happens inside finalize so it runs exactly once
            let transfer = handle.transfer.lock().await;
            if transfer.status.is_terminal() {
                return Ok(());
            }
            if transfer.status == TransferStatus::Pending {
                return Err(EngineError::invalid_state(
                    "Pending transfers are rejected, not cancelled",
                ));
            }
        }

        handle.cancel.cancel();
        self.shared.finalize(id, Finalize::Cancelled).await;
        tracing::info!("Transfer {} cancelled", id);
        Ok(())
    }

    /// Inbound offers currently awaiting a decision, oldest first
    pub async fn get_pending_transfers(&self) -> Vec<PendingTransfer> {
        let mut pending: Vec<PendingTransfer> = self
            .shared
            .pending_offers
            .read()
            .await
            .values()
            .cloned()
            .collect();
        pending.sort_by_key(|p| p.received_at);
        pending
    }

    // ========================================================================
    // Stores
    // ========================================================================

    pub fn list_favorites(&self) -> Vec<Favorite> {
        self.shared.favorites.list()
    }

    pub fn add_favorite(&self, name: String, address: String) -> Result<Favorite> {
        self.shared
            .favorites
            .add(name, address)
            .map_err(|e| self.report_store_error(e))
    }

    pub fn update_favorite(
        &self,
        id: &str,
        name: Option<String>,
        address: Option<String>,
    ) -> Result<Favorite> {
        self.shared.favorites.update(id, name, address)
    }

    pub fn delete_favorite(&self, id: &str) -> Result<()> {
        self.shared.favorites.delete(id)
    }

    pub fn touch_favorite(&self, id: &str) -> Result<()> {
        self.shared.favorites.touch(id)
    }

    pub fn list_history(&self) -> Vec<HistoryRecord> {
        self.shared.history.list()
    }

    pub fn clear_history(&self) -> Result<()> {
        self.shared
            .history
            .clear()
            .map_err(|e| self.report_store_error(e))
    }

    pub fn get_settings(&self) -> Settings {
        self.shared.settings.get()
    }

    /// Replace the settings record wholesale. `ConfigInvalid` on a malformed
    /// record; a port change takes effect on the next (re)start.
    pub fn save_settings(&self, settings: Settings) -> Result<()> {
        self.shared
            .settings
            .update(settings)
            .map_err(|e| self.report_store_error(e))
    }

    fn report_store_error(&self, e: EngineError) -> EngineError {
        if matches!(e, EngineError::Io { .. } | EngineError::Serde { .. }) {
            self.shared.events.publish(EngineEvent::EngineError {
                error: format!("Store error: {}", e),
            });
        }
        e
    }
}

/// Drive one outbound transfer to a terminal status: offer, approval,
/// per-file uploads, and retries, bounded by the concurrent-transfer permits.
async fn run_outbound(
    shared: Arc<EngineShared>,
    id: String,
    address: String,
    port: u16,
    paths: Vec<PathBuf>,
    handle: TransferHandle,
) {
    let _permit = match shared.send_permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    let settings = shared.settings.get();
    let policy = RetryPolicy::new(settings.max_retries, settings.retry_delay_ms);

    // Resolve the destination off the caller's path; a favorite pointing at
    // this address remembers the result.
    let peer_ip = match SystemResolver.resolve(&address).await {
        ResolveResult { success: true, ips, .. } if !ips.is_empty() => ips[0].clone(),
        result => {
            let error = result
                .error
                .unwrap_or_else(|| "No IP addresses found".to_string());
            shared.finalize(&id, Finalize::Failed(error)).await;
            return;
        }
    };
    if peer_ip != address {
        if let Err(e) = shared.favorites.update_resolved_ip(&address, &peer_ip) {
            tracing::debug!("Could not record resolved IP: {}", e);
        }
        handle.transfer.lock().await.peer_address = peer_ip.clone();
    }

    let (offer, files) = {
        let transfer = handle.transfer.lock().await;
        (
            TransferOffer {
                transfer_id: id.clone(),
                sender_name: Some(settings.device_name.clone()),
                files: transfer.files.clone(),
                total_size: transfer.total_size,
            },
            transfer.files.clone(),
        )
    };

    let mut token: Option<String> = None;
    let mut completed: HashSet<String> = HashSet::new();
    let mut acknowledged: u64 = 0;

    loop {
        let attempt_result = run_attempt(
            &shared,
            &handle,
            &peer_ip,
            port,
            &offer,
            &files,
            &paths,
            settings.bandwidth_limit_bps,
            &mut token,
            &mut completed,
            &mut acknowledged,
        )
        .await;

        match attempt_result {
            Ok(AttemptOutcome::Completed) => {
                shared.finalize(&id, Finalize::Complete).await;
                return;
            }
            Ok(AttemptOutcome::PeerRejected) => {
                shared.finalize(&id, Finalize::PeerRejected).await;
                return;
            }
            Err(error) => {
                if handle.cancel.is_cancelled() {
                    // cancel_transfer already finalized; just stand down
                    shared.finalize(&id, Finalize::Cancelled).await;
                    return;
                }

                let attempt = handle.transfer.lock().await.attempt;
                match policy.decide(attempt, &error) {
                    RetryDecision::Retry { delay } => {
                        let next_attempt = {
                            let mut transfer = handle.transfer.lock().await;
                            if transfer.retrying(acknowledged).is_err() {
                                return; // raced with a terminal transition
                            }
                            transfer.attempt
                        };
                        tracing::warn!(
                            "Transfer {} attempt {} failed ({}); retrying in {:?}",
                            id,
                            attempt,
                            error,
                            delay
                        );
                        shared.events.publish(EngineEvent::TransferRetry {
                            transfer_id: id.clone(),
                            attempt: next_attempt,
                            max_attempts: policy.max_attempts(),
                            error: error.to_string(),
                        });
                        handle.tracker.lock().reset(acknowledged);

                        tokio::select! {
                            _ = handle.cancel.cancelled() => {
                                shared.finalize(&id, Finalize::Cancelled).await;
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    RetryDecision::GiveUp => {
                        shared
                            .finalize(&id, Finalize::Failed(error.to_string()))
                            .await;
                        return;
                    }
                }
            }
        }
    }
}

enum AttemptOutcome {
    Completed,
    PeerRejected,
}

#[allow(clippy::too_many_arguments)]
async fn run_attempt(
    shared: &Arc<EngineShared>,
    handle: &TransferHandle,
    peer_ip: &str,
    port: u16,
    offer: &TransferOffer,
    files: &[TransferFile],
    paths: &[PathBuf],
    bandwidth_limit_bps: Option<u64>,
    token: &mut Option<String>,
    completed: &mut HashSet<String>,
    acknowledged: &mut u64,
) -> Result<AttemptOutcome> {
    if token.is_none() {
        let response = shared.client.offer(peer_ip, port, offer).await?;
        let granted = if response.accepted {
            response
                .token
                .ok_or_else(|| EngineError::fatal("Peer accepted but provided no token"))?
        } else {
            match shared
                .client
                .wait_for_approval(peer_ip, port, &offer.transfer_id, &handle.cancel)
                .await?
            {
                OfferOutcome::Accepted { token } => token,
                OfferOutcome::Rejected => return Ok(AttemptOutcome::PeerRejected),
            }
        };
        *token = Some(granted);
    }

    {
        let mut transfer = handle.transfer.lock().await;
        if transfer.status != TransferStatus::InProgress {
            transfer.begin()?;
        }
    }

    let granted = token.as_ref().expect("token set above").clone();

    for (file, path) in files.iter().zip(paths.iter()) {
        if completed.contains(&file.id) {
            continue;
        }
        if handle.cancel.is_cancelled() {
            return Err(EngineError::invalid_state("Transfer cancelled"));
        }

        let progress = {
            let tracker = handle.tracker.clone();
            let events = shared.events.clone();
            let file_name = file.name.clone();
            let base = *acknowledged;
            Arc::new(move |file_bytes: u64| {
                let sample = tracker.lock().record(Some(&file_name), base + file_bytes);
                if let Some(progress) = sample {
                    events.publish(EngineEvent::TransferProgress { progress });
                }
            })
        };

        shared
            .client
            .send_file(
                peer_ip,
                port,
                &offer.transfer_id,
                &granted,
                file,
                path,
                bandwidth_limit_bps,
                handle.cancel.clone(),
                progress,
            )
            .await?;

        completed.insert(file.id.clone());
        *acknowledged += file.size;
        handle.transfer.lock().await.advance(*acknowledged);
        tracing::info!("Sent {} ({} bytes)", file.name, file.size);
    }

    Ok(AttemptOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EngineEvent;

    fn test_engine() -> (TransferEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let engine = TransferEngine::open(dir.path()).unwrap();
        (engine, dir)
    }

    fn offer(id: &str, files: Vec<TransferFile>) -> TransferOffer {
        let total_size = files.iter().map(|f| f.size).sum();
        TransferOffer {
            transfer_id: id.to_string(),
            sender_name: Some("peer".to_string()),
            files,
            total_size,
        }
    }

    #[tokio::test]
    async fn test_offer_creates_pending_and_emits_request() {
        let (engine, _dir) = test_engine();
        let mut events = engine.subscribe();

        let response = engine
            .shared
            .handle_offer(
                offer("t-1", vec![TransferFile::new("a.txt", 10)]),
                "10.0.0.7".to_string(),
            )
            .await
            .unwrap();
        assert!(!response.accepted);
        assert!(response.token.is_none());

        let pending = engine.get_pending_transfers().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "t-1");
        assert_eq!(pending[0].source_ip, "10.0.0.7");

        assert!(matches!(
            events.recv().await.unwrap(),
            EngineEvent::TransferRequest { .. }
        ));
    }

    #[tokio::test]
    async fn test_trusted_host_is_auto_accepted() {
        let (engine, _dir) = test_engine();
        let mut settings = engine.get_settings();
        settings.trusted_hosts = vec!["10.0.0.7".to_string()];
        engine.save_settings(settings).unwrap();

        let response = engine
            .shared
            .handle_offer(
                offer("t-1", vec![TransferFile::new("a.txt", 10)]),
                "10.0.0.7".to_string(),
            )
            .await
            .unwrap();

        assert!(response.accepted);
        assert!(response.token.is_some());
        assert!(engine.get_pending_transfers().await.is_empty());

        let status = engine.shared.approval_status("t-1").await;
        assert_eq!(status.status, TransferDecision::Accepted);
    }

    #[tokio::test]
    async fn test_repeated_offer_is_idempotent() {
        let (engine, _dir) = test_engine();
        let files = vec![TransferFile::new("a.txt", 10)];
        engine
            .shared
            .handle_offer(offer("t-1", files.clone()), "10.0.0.7".to_string())
            .await
            .unwrap();

        // Same id again: answered from the pending decision, no second record
        let repeat = engine
            .shared
            .handle_offer(offer("t-1", files.clone()), "10.0.0.7".to_string())
            .await
            .unwrap();
        assert!(!repeat.accepted);
        assert_eq!(engine.get_pending_transfers().await.len(), 1);

        // After acceptance a re-offer hands back the token
        engine.accept_transfer("t-1").await.unwrap();
        let repeat = engine
            .shared
            .handle_offer(offer("t-1", files), "10.0.0.7".to_string())
            .await
            .unwrap();
        assert!(repeat.accepted);
        assert!(repeat.token.is_some());
    }

    #[tokio::test]
    async fn test_accept_unknown_id_is_not_found() {
        let (engine, _dir) = test_engine();
        assert!(matches!(
            engine.accept_transfer("missing").await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_accept_twice_is_invalid_state() {
        let (engine, _dir) = test_engine();
        engine
            .shared
            .handle_offer(
                offer("t-1", vec![TransferFile::new("a.txt", 10)]),
                "10.0.0.7".to_string(),
            )
            .await
            .unwrap();

        engine.accept_transfer("t-1").await.unwrap();
        assert!(matches!(
            engine.accept_transfer("t-1").await,
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_reject_all_clears_pending_without_progress_events() {
        let (engine, _dir) = test_engine();
        let mut events = engine.subscribe();

        for i in 0..3 {
            engine
                .shared
                .handle_offer(
                    offer(&format!("t-{}", i), vec![TransferFile::new("a.txt", 10)]),
                    "10.0.0.7".to_string(),
                )
                .await
                .unwrap();
        }

        engine.reject_all().await.unwrap();
        assert!(engine.get_pending_transfers().await.is_empty());

        // History got one terminal record per rejected transfer
        assert_eq!(engine.list_history().len(), 3);

        // Drain everything emitted so far: requests and terminal events only,
        // never progress
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, EngineEvent::TransferProgress { .. }),
                "rejected transfers must not emit progress"
            );
        }

        // Rejection is visible to the sender's polls
        let status = engine.shared.approval_status("t-0").await;
        assert_eq!(status.status, TransferDecision::Rejected);
    }

    #[tokio::test]
    async fn test_reject_all_on_empty_set_is_noop() {
        let (engine, _dir) = test_engine();
        engine.reject_all().await.unwrap();
        engine.accept_all().await.unwrap();
        assert!(engine.list_history().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_pending_is_invalid_reject_instead() {
        let (engine, _dir) = test_engine();
        engine
            .shared
            .handle_offer(
                offer("t-1", vec![TransferFile::new("a.txt", 10)]),
                "10.0.0.7".to_string(),
            )
            .await
            .unwrap();

        assert!(matches!(
            engine.cancel_transfer("t-1").await,
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_accepted_transfer_is_terminal_once() {
        let (engine, _dir) = test_engine();
        let mut events = engine.subscribe();

        engine
            .shared
            .handle_offer(
                offer("t-1", vec![TransferFile::new("a.txt", 10)]),
                "10.0.0.7".to_string(),
            )
            .await
            .unwrap();
        engine.accept_transfer("t-1").await.unwrap();
        engine.cancel_transfer("t-1").await.unwrap();

        // Exactly one terminal history record
        let history = engine.list_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, TransferStatus::Cancelled);

        // Cancel again: gone from the table, so NotFound (terminal records
        // are not kept in the active table)
        assert!(matches!(
            engine.cancel_transfer("t-1").await,
            Err(EngineError::NotFound { .. })
        ));

        let mut saw_cancelled = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::TransferCancelled { .. }) {
                saw_cancelled += 1;
            }
        }
        assert_eq!(saw_cancelled, 1);
    }

    #[tokio::test]
    async fn test_send_in_receive_only_mode_is_config_error() {
        let (engine, _dir) = test_engine();
        let mut settings = engine.get_settings();
        settings.receive_only = true;
        engine.save_settings(settings).unwrap();

        let err = engine
            .send_files("10.0.0.5", 53317, vec![PathBuf::from("/tmp/nope")])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ConfigInvalid { .. }));
    }

    #[tokio::test]
    async fn test_outbound_to_unreachable_peer_fails_via_events() {
        let (engine, dir) = test_engine();
        let mut settings = engine.get_settings();
        settings.max_retries = 0;
        engine.save_settings(settings).unwrap();

        let src = dir.path().join("payload.bin");
        tokio::fs::write(&src, vec![0u8; 128]).await.unwrap();

        let mut events = engine.subscribe();
        // Port 1 on loopback: nothing listens there
        let id = engine
            .send_files("127.0.0.1", 1, vec![src])
            .await
            .unwrap();

        loop {
            match events.recv().await.unwrap() {
                EngineEvent::TransferFailed { transfer_id, .. } => {
                    assert_eq!(transfer_id, id);
                    break;
                }
                EngineEvent::TransferProgress { .. } => panic!("no progress expected"),
                _ => {}
            }
        }

        let history = engine.list_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, TransferStatus::Failed);
    }

    #[tokio::test]
    async fn test_change_port_updates_settings_and_emits() {
        let (engine, _dir) = test_engine();
        let mut events = engine.subscribe();

        engine.change_port(9000, true).await.unwrap();
        assert_eq!(engine.get_settings().port, 9000);
        assert!(matches!(
            events.recv().await.unwrap(),
            EngineEvent::PortChanged { new_port: 9000 }
        ));

        assert!(matches!(
            engine.change_port(0, false).await,
            Err(EngineError::ConfigInvalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_chunk_grant_requires_valid_token() {
        let (engine, _dir) = test_engine();
        engine
            .shared
            .handle_offer(
                offer("t-1", vec![TransferFile::new("a.txt", 10)]),
                "10.0.0.7".to_string(),
            )
            .await
            .unwrap();
        engine.accept_transfer("t-1").await.unwrap();

        let err = engine
            .shared
            .chunk_grant("t-1", "whatever", "bad-token")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));

        let status = engine.shared.approval_status("t-1").await;
        let token = status.token.unwrap();
        let file_id = engine.shared.transfers.lock().await["t-1"]
            .transfer
            .lock()
            .await
            .files[0]
            .id
            .clone();

        let grant = engine
            .shared
            .chunk_grant("t-1", &file_id, &token)
            .await
            .unwrap();
        assert!(grant.is_some());
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_loopback_transfer_end_to_end() {
        use std::time::Duration;

        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let (receiver, recv_dir) = test_engine();
        let download_dir = recv_dir.path().join("downloads");
        std::fs::create_dir_all(&download_dir).unwrap();

        let mut settings = receiver.get_settings();
        settings.port = free_port();
        settings.download_dir = download_dir.clone();
        settings.trusted_hosts = vec!["127.0.0.1".to_string()];
        receiver.save_settings(settings).unwrap();
        let port = receiver.start_server().await.unwrap();
        let mut receiver_events = receiver.subscribe();

        let (sender, send_dir) = test_engine();
        let payload = b"hello across the wire".repeat(512);
        let src = send_dir.path().join("payload.bin");
        std::fs::write(&src, &payload).unwrap();

        let mut sender_events = sender.subscribe();
        let id = sender
            .send_files("127.0.0.1", port, vec![src])
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            let mut saw_progress = false;
            loop {
                match sender_events.recv().await.unwrap() {
                    EngineEvent::TransferProgress { progress } => {
                        assert_eq!(progress.transfer_id, id);
                        saw_progress = true;
                    }
                    EngineEvent::TransferComplete { transfer_id } => {
                        assert_eq!(transfer_id, id);
                        break;
                    }
                    EngineEvent::TransferFailed { error, .. } => {
                        panic!("transfer failed: {}", error);
                    }
                    _ => {}
                }
            }
            assert!(saw_progress, "expected at least one progress event");
        })
        .await
        .unwrap();

        // Receiver finalized before acknowledging the last chunk
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if matches!(
                    receiver_events.recv().await.unwrap(),
                    EngineEvent::TransferComplete { .. }
                ) {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let stored = std::fs::read(download_dir.join("payload.bin")).unwrap();
        assert_eq!(stored, payload);

        let sent_history = sender.list_history();
        assert_eq!(sent_history.len(), 1);
        assert_eq!(sent_history[0].status, TransferStatus::Completed);

        let recv_history = receiver.list_history();
        assert_eq!(recv_history.len(), 1);
        assert_eq!(recv_history[0].status, TransferStatus::Completed);

        receiver.stop_server().await;
    }
}
