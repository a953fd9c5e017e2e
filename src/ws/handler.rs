//! Axum WebSocket upgrade handler.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use bytes::BytesMut;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::upgrade::{compute_accept_key, validate_upgrade};
use crate::app_state::AppState;
use crate::error::UpgradeError;
use crate::handshake;

/// Builds the router serving the configured upgrade path.
pub fn router(state: AppState) -> Router {
    let path = state.options.websocket_path.clone();
    Router::new()
        .route(&path, any(upgrade_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Upgrades a request on the WebSocket path to an MQTT session.
///
/// Validation and the extra check run before anything is hijacked; on
/// failure the client gets a plain HTTP error.
///
/// # Errors
///
/// Returns an [`UpgradeError`] rendered as the HTTP error response.
pub async fn upgrade_handler(
    State(state): State<AppState>,
    mut request: Request,
) -> Result<Response, UpgradeError> {
    validate_upgrade(request.method(), request.headers())?;
    if let Some(hook) = &state.options.upgrade_hook {
        hook(&request).map_err(UpgradeError::Rejected)?;
    }

    let accept = request
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .map(compute_accept_key)
        .ok_or(UpgradeError::BadKey)?;
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let on_upgrade = request
        .extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or(UpgradeError::NotUpgradable)?;

    drop(tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => serve_upgraded(state, TokioIo::new(upgraded), remote_addr).await,
            Err(e) => warn!(error = %e, "websocket upgrade failed"),
        }
    }));

    Ok((
        StatusCode::SWITCHING_PROTOCOLS,
        [
            (header::CONNECTION, "Upgrade".to_string()),
            (header::UPGRADE, "websocket".to_string()),
            (header::SEC_WEBSOCKET_ACCEPT, accept),
        ],
    )
        .into_response())
}

/// Negotiates the upgraded stream and hands the session to the registry.
async fn serve_upgraded<S>(state: AppState, mut stream: S, remote_addr: Option<SocketAddr>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    debug!(peer = ?remote_addr, "websocket connection upgraded");
    match handshake::negotiate_websocket(&mut stream, BytesMut::new(), remote_addr, &state.options)
        .await
    {
        Ok(negotiated) => {
            let session = negotiated.into_session(stream, &state.options);
            if let Err(e) = state.registry.admit(session).await {
                warn!(peer = ?remote_addr, error = %e, "session not admitted");
            }
        }
        Err(e) => info!(
            peer = ?remote_addr,
            error = %e,
            kind = ?e.kind(),
            "websocket handshake failed"
        ),
    }
}
