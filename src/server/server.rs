use crate::engine::{ChunkGrant, EngineShared};
use crate::error::{EngineError, Result};
use crate::event::EngineEvent;
use crate::protocol::{PROTOCOL_VERSION, PeerInfo, TransferOffer};
use crate::server::dest::{open_unique_file, safe_relative, sanitize_file_name};
use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A running transfer server binding. Dropping the handle without calling
/// [`ServerHandle::shutdown`] also stops the listener.
pub(crate) struct ServerHandle {
    port: u16,
    shutdown: oneshot::Sender<()>,
}

impl ServerHandle {
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting new connections; in-flight requests run to completion
    pub(crate) fn shutdown(self) {
        let _ = self.shutdown.send(());
    }
}

/// Bind the transfer server on `port` and serve until shut down
pub(crate) async fn spawn(shared: Arc<EngineShared>, port: u16) -> Result<ServerHandle> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| EngineError::BindFailure {
            port,
            message: e.to_string(),
        })?;
    let bound = listener.local_addr().map(|a| a.port()).unwrap_or(port);

    let app = router(shared);
    let (tx, rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = rx.await;
        });
        if let Err(e) = serve.await {
            tracing::error!("Transfer server error: {}", e);
        }
    });

    tracing::info!("Transfer server listening on port {}", bound);
    Ok(ServerHandle {
        port: bound,
        shutdown: tx,
    })
}

fn router(shared: Arc<EngineShared>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/transfer", post(receive_offer))
        .route("/transfer/status", get(transfer_status))
        .route("/chunk", post(receive_chunk))
        .with_state(shared)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": PROTOCOL_VERSION }))
}

async fn info(State(shared): State<Arc<EngineShared>>) -> impl IntoResponse {
    Json(PeerInfo {
        name: shared.device_name(),
        version: PROTOCOL_VERSION.to_string(),
        app: "beamdrop".to_string(),
    })
}

async fn receive_offer(
    State(shared): State<Arc<EngineShared>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(offer): Json<TransferOffer>,
) -> Response {
    match shared.handle_offer(offer, peer.ip().to_string()).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct StatusQuery {
    transfer_id: String,
}

async fn transfer_status(
    State(shared): State<Arc<EngineShared>>,
    Query(query): Query<StatusQuery>,
) -> Response {
    Json(shared.approval_status(&query.transfer_id).await).into_response()
}

#[derive(Deserialize)]
struct ChunkQuery {
    transfer_id: String,
    file_id: String,
    token: String,
}

async fn receive_chunk(
    State(shared): State<Arc<EngineShared>>,
    Query(query): Query<ChunkQuery>,
    body: Body,
) -> Response {
    let grant = match shared
        .chunk_grant(&query.transfer_id, &query.file_id, &query.token)
        .await
    {
        Ok(Some(grant)) => grant,
        // File already stored in full; acknowledge the duplicate upload
        Ok(None) => return StatusCode::OK.into_response(),
        Err(e @ EngineError::InvalidState { .. }) => {
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
        Err(e) => return (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    };

    match store_file(&shared, &grant, body).await {
        StoreOutcome::Stored => {
            if let Err(e) = shared
                .file_received(&query.transfer_id, &query.file_id)
                .await
            {
                tracing::warn!("Could not record received file: {}", e);
            }
            Json(json!({ "status": "ok" })).into_response()
        }
        StoreOutcome::Cancelled => {
            (StatusCode::CONFLICT, "Transfer cancelled").into_response()
        }
        StoreOutcome::Oversize => (
            StatusCode::PAYLOAD_TOO_LARGE,
            "Upload exceeds the declared file size",
        )
            .into_response(),
        StoreOutcome::ShortBody { received, expected } => (
            StatusCode::BAD_REQUEST,
            format!("Expected {} bytes, received {}", expected, received),
        )
            .into_response(),
        StoreOutcome::BodyError(message) => {
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        }
        StoreOutcome::DiskError(error) => {
            // Disk-full and permission failures end the whole transfer
            if matches!(error, EngineError::Fatal { .. }) {
                shared.receive_failed(&query.transfer_id, &error).await;
            }
            (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
        }
    }
}

enum StoreOutcome {
    Stored,
    Cancelled,
    Oversize,
    ShortBody { received: u64, expected: u64 },
    BodyError(String),
    DiskError(EngineError),
}

/// Stream one file body to a unique path under the download directory.
/// Partial files are deleted on every non-`Stored` outcome.
async fn store_file(shared: &Arc<EngineShared>, grant: &ChunkGrant, body: Body) -> StoreOutcome {
    let (target_dir, file_name) = match destination(grant).await {
        Ok(dest) => dest,
        Err(e) => return StoreOutcome::DiskError(e),
    };

    let (path, file) = match open_unique_file(&target_dir, &file_name).await {
        Ok(opened) => opened,
        Err(e) => return StoreOutcome::DiskError(EngineError::from_disk(e)),
    };

    let base = grant.transfer.lock().await.bytes_transferred;
    let expected = grant.file.size;
    let mut writer = BufWriter::new(file);
    let mut stream = body.into_data_stream();
    let mut received: u64 = 0;

    let outcome = loop {
        let chunk = match stream.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => break StoreOutcome::BodyError(e.to_string()),
            None => {
                if received == expected {
                    break StoreOutcome::Stored;
                }
                break StoreOutcome::ShortBody { received, expected };
            }
        };

        // Cooperative cancellation checkpoint, once per chunk
        if grant.cancel.is_cancelled() {
            break StoreOutcome::Cancelled;
        }

        received += chunk.len() as u64;
        if received > expected {
            break StoreOutcome::Oversize;
        }

        if let Err(e) = writer.write_all(&chunk).await {
            break StoreOutcome::DiskError(EngineError::from_disk(e));
        }

        let sample = grant
            .tracker
            .lock()
            .record(Some(&grant.file.name), base + received);
        if let Some(progress) = sample {
            shared
                .events
                .publish(EngineEvent::TransferProgress { progress });
        }
    };

    if matches!(outcome, StoreOutcome::Stored) {
        if let Err(e) = writer.flush().await {
            let _ = tokio::fs::remove_file(&path).await;
            return StoreOutcome::DiskError(EngineError::from_disk(e));
        }
        tracing::info!("Stored {} ({} bytes)", path.display(), received);
        return outcome;
    }

    // Never leave a partial file behind
    drop(writer);
    if let Err(e) = tokio::fs::remove_file(&path).await {
        tracing::warn!("Could not remove partial file {}: {}", path.display(), e);
    }
    grant.tracker.lock().reset(base);
    outcome
}

/// Resolve where a received file lands: the download directory plus any safe
/// relative subpath from the offer, with the final name sanitized.
async fn destination(grant: &ChunkGrant) -> Result<(PathBuf, String)> {
    let relative = grant.file.dest_relative();
    let safe = relative
        .to_str()
        .and_then(safe_relative)
        .unwrap_or_else(|| PathBuf::from(&grant.file.name));

    let sub_dir = safe.parent().filter(|p| !p.as_os_str().is_empty());
    let target_dir = match sub_dir {
        Some(sub) => grant.download_dir.join(sub),
        None => grant.download_dir.clone(),
    };
    tokio::fs::create_dir_all(&target_dir)
        .await
        .map_err(EngineError::from_disk)?;

    let raw_name = safe
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(&grant.file.name);
    let file_name = sanitize_file_name(raw_name, &grant.file.id);

    Ok((target_dir, file_name))
}
