//! Transport listeners.
//!
//! [`bind`] opens every enabled socket before spawning anything, so a failed
//! bind leaves nothing listening. TCP connections are negotiated here; the
//! WebSocket port is served by the axum router from [`crate::ws`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::domain::{ManagerOptions, Registry};
use crate::error::GatewayError;
use crate::handshake;
use crate::ws;

/// Back-off after a failed `accept`.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Socket addresses the running listeners are bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundAddrs {
    /// Raw MQTT listener.
    pub tcp: SocketAddr,
    /// WebSocket listener, when enabled.
    pub websocket: Option<SocketAddr>,
    /// Placeholder UDP socket, when enabled.
    pub udp: Option<SocketAddr>,
}

/// Listener tasks owned by a started registry.
#[derive(Debug)]
pub(crate) struct RunningListeners {
    addrs: BoundAddrs,
    tasks: Vec<JoinHandle<()>>,
    // Bound only so the port is reserved; datagrams are never read.
    _udp: Option<UdpSocket>,
}

impl RunningListeners {
    pub(crate) const fn addrs(&self) -> BoundAddrs {
        self.addrs
    }

    /// Aborts every accept loop and waits for it to exit.
    pub(crate) async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for result in join_all(self.tasks).await {
            match result {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!(error = %e, "listener task failed"),
            }
        }
    }
}

/// Binds the enabled listeners and starts serving them.
///
/// # Errors
///
/// Returns [`GatewayError::Bind`] for the first socket that cannot be bound;
/// sockets bound before it are closed again.
pub(crate) async fn bind(
    registry: &Registry,
    options: &Arc<ManagerOptions>,
) -> Result<RunningListeners, GatewayError> {
    let tcp_addr = SocketAddr::new(options.bind_host, options.tcp_port);
    let tcp = TcpListener::bind(tcp_addr)
        .await
        .map_err(|source| GatewayError::Bind {
            transport: "tcp",
            addr: tcp_addr.to_string(),
            source,
        })?;

    let websocket = if options.websocket_enabled {
        let addr = SocketAddr::new(options.bind_host, options.websocket_port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind {
                transport: "websocket",
                addr: addr.to_string(),
                source,
            })?;
        Some(listener)
    } else {
        None
    };

    let udp = if options.udp_enabled {
        let addr = SocketAddr::new(options.bind_host, options.udp_port);
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind {
                transport: "udp",
                addr: addr.to_string(),
                source,
            })?;
        Some(socket)
    } else {
        None
    };

    let addrs = BoundAddrs {
        tcp: tcp.local_addr()?,
        websocket: websocket.as_ref().map(TcpListener::local_addr).transpose()?,
        udp: udp.as_ref().map(UdpSocket::local_addr).transpose()?,
    };

    info!(addr = %addrs.tcp, "tcp listener bound");
    let mut tasks = vec![tokio::spawn(accept_tcp(tcp, registry.clone()))];
    if let Some(listener) = websocket {
        info!(addr = ?addrs.websocket, path = %options.websocket_path, "websocket listener bound");
        let router = ws::router(AppState {
            registry: registry.clone(),
            options: Arc::clone(options),
        });
        tasks.push(tokio::spawn(serve_websocket(listener, router)));
    }
    if let Some(addr) = addrs.udp {
        info!(addr = %addr, "udp socket bound (idle)");
    }

    Ok(RunningListeners {
        addrs,
        tasks,
        _udp: udp,
    })
}

async fn accept_tcp(listener: TcpListener, registry: Registry) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "tcp connection accepted");
                let registry = registry.clone();
                drop(tokio::spawn(serve_tcp(registry, stream, peer)));
            }
            Err(e) => {
                warn!(error = %e, "tcp accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Negotiates one TCP connection and hands the session to the registry.
async fn serve_tcp(registry: Registry, mut stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
    }
    let options = registry.options().await;
    match handshake::negotiate_tcp(&mut stream, Some(peer), &options).await {
        Ok(negotiated) => {
            let session = negotiated.into_session(stream, &options);
            if let Err(e) = registry.admit(session).await {
                warn!(peer = %peer, error = %e, "session not admitted");
            }
        }
        Err(e) => info!(peer = %peer, error = %e, kind = ?e.kind(), "tcp handshake failed"),
    }
}

async fn serve_websocket(listener: TcpListener, router: axum::Router) {
    let service = router.into_make_service_with_connect_info::<SocketAddr>();
    if let Err(e) = axum::serve(listener, service).await {
        error!(error = %e, "websocket server stopped");
    }
}
