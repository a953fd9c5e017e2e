//! Live session registry.
//!
//! [`Registry`] owns the listeners and the map of running sessions, keyed
//! by MQTT client id. Sessions register themselves after a successful
//! handshake and are removed exactly once when their read loop exits. The
//! map is a `BTreeMap`, so listing walks it in descending key order without
//! sorting.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::hooks::PacketHook;
use super::{ConnectionRecord, HookDispatcher, ManagerOptions, OptionsUpdate};
use crate::app_state::AppState;
use crate::codec::Packet;
use crate::error::GatewayError;
use crate::listener::{self, BoundAddrs, RunningListeners};
use crate::session::{PacketForwarder, Session, SessionHandle, SessionOutcome};
use crate::ws;

/// Connection registry and listener owner.
///
/// Cheap to clone; every clone refers to the same registry.
///
/// # Concurrency
///
/// - Queries take a shared lock and never wait on a session.
/// - Registration, removal, start and stop take the exclusive lock.
/// - Writes to a session happen outside the lock.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<RwLock<RegistryState>>,
}

#[derive(Debug)]
struct RegistryState {
    options: Arc<ManagerOptions>,
    sessions: BTreeMap<String, SessionHandle>,
    listeners: Option<RunningListeners>,
    dispatchers: Dispatchers,
}

/// One bounded dispatcher per hook category.
#[derive(Debug, Clone)]
struct Dispatchers {
    packet: HookDispatcher,
    connected: HookDispatcher,
    disconnected: HookDispatcher,
}

impl Dispatchers {
    fn new(concurrency: usize) -> Self {
        Self {
            packet: HookDispatcher::new("packet", concurrency),
            connected: HookDispatcher::new("connected", concurrency),
            disconnected: HookDispatcher::new("disconnected", concurrency),
        }
    }
}

/// Hands decoded packets to the packet hook.
struct RegistryForwarder {
    dispatcher: HookDispatcher,
    hook: Option<PacketHook>,
}

impl PacketForwarder for RegistryForwarder {
    async fn forward(&self, client_id: &str, packet: Packet) {
        let Some(hook) = &self.hook else {
            return;
        };
        let hook = Arc::clone(hook);
        let client_id = client_id.to_string();
        self.dispatcher.dispatch(move || hook(&client_id, packet));
    }
}

impl Registry {
    /// Creates a stopped registry with `update` applied to the defaults.
    #[must_use]
    pub fn new(update: OptionsUpdate) -> Self {
        let options = ManagerOptions::default().merge(update);
        let dispatchers = Dispatchers::new(options.hook_concurrency);
        Self {
            inner: Arc::new(RwLock::new(RegistryState {
                options: Arc::new(options),
                sessions: BTreeMap::new(),
                listeners: None,
                dispatchers,
            })),
        }
    }

    /// Returns the number of registered sessions.
    pub async fn count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Returns the total count and the snapshots in `[offset, limit)` of
    /// the sessions ordered by descending client id.
    ///
    /// Bounds past the end, or `offset >= limit`, yield an empty page.
    pub async fn list(&self, offset: usize, limit: usize) -> (usize, Vec<ConnectionRecord>) {
        let state = self.inner.read().await;
        let total = state.sessions.len();
        if offset >= limit {
            return (total, Vec::new());
        }
        let page = state
            .sessions
            .values()
            .rev()
            .skip(offset)
            .take(limit - offset)
            .map(SessionHandle::snapshot)
            .collect();
        (total, page)
    }

    /// Binds the listeners enabled in the current options.
    ///
    /// Calling `start` on a running registry returns the existing addresses.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Bind`] if any listener cannot be bound; no
    /// listener is left running in that case.
    pub async fn start(&self) -> Result<BoundAddrs, GatewayError> {
        let mut state = self.inner.write().await;
        if let Some(running) = &state.listeners {
            return Ok(running.addrs());
        }
        let options = Arc::clone(&state.options);
        let running = listener::bind(self, &options).await?;
        let addrs = running.addrs();
        state.listeners = Some(running);
        info!(tcp = %addrs.tcp, websocket = ?addrs.websocket, udp = ?addrs.udp, "gateway started");
        Ok(addrs)
    }

    /// Closes the listeners and disconnects every session without firing
    /// the disconnected hook. Does nothing when already stopped.
    pub async fn stop(&self) {
        let (listeners, sessions) = {
            let mut state = self.inner.write().await;
            (
                state.listeners.take(),
                std::mem::take(&mut state.sessions),
            )
        };
        let Some(listeners) = listeners else {
            return;
        };
        listeners.shutdown().await;
        let total = sessions.len();
        for handle in sessions.into_values() {
            let _ = handle.disconnect_with(true, None);
        }
        info!(sessions = total, "gateway stopped");
    }

    /// Returns `true` between [`start`](Self::start) and [`stop`](Self::stop).
    pub async fn is_running(&self) -> bool {
        self.inner.read().await.listeners.is_some()
    }

    /// Addresses of the running listeners.
    pub async fn bound_addrs(&self) -> Option<BoundAddrs> {
        self.inner
            .read()
            .await
            .listeners
            .as_ref()
            .map(RunningListeners::addrs)
    }

    /// Current options.
    pub async fn options(&self) -> Arc<ManagerOptions> {
        Arc::clone(&self.inner.read().await.options)
    }

    /// Merges `update` into the options while stopped.
    ///
    /// Returns `false`, leaving the options untouched, while running.
    pub async fn set_options(&self, update: OptionsUpdate) -> bool {
        let mut state = self.inner.write().await;
        if state.listeners.is_some() {
            debug!("ignoring options update while running");
            return false;
        }
        let merged = state.options.merge(update);
        state.dispatchers = Dispatchers::new(merged.hook_concurrency);
        state.options = Arc::new(merged);
        true
    }

    /// Asks the session registered as `client_id` to disconnect; the
    /// disconnected hook fires once it has stopped.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ClientNotFound`] if no such session exists.
    pub async fn close_once(&self, client_id: &str) -> Result<(), GatewayError> {
        let handle = self.session(client_id).await?;
        let _ = handle.disconnect();
        Ok(())
    }

    /// Returns a snapshot of the session registered as `client_id`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ClientNotFound`] if no such session exists.
    pub async fn get_once(&self, client_id: &str) -> Result<ConnectionRecord, GatewayError> {
        Ok(self.session(client_id).await?.snapshot())
    }

    /// Writes one packet to the session registered as `client_id`,
    /// returning the bytes put on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ClientNotFound`] if no such session exists,
    /// otherwise whatever [`SessionHandle::send`] returns.
    pub async fn send_once(&self, client_id: &str, packet: &Packet) -> Result<usize, GatewayError> {
        let handle = self.session(client_id).await?;
        handle.send(packet).await
    }

    /// Returns the handle of the session registered as `client_id`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ClientNotFound`] if no such session exists.
    pub async fn session(&self, client_id: &str) -> Result<SessionHandle, GatewayError> {
        self.inner
            .read()
            .await
            .sessions
            .get(client_id)
            .cloned()
            .ok_or_else(|| GatewayError::ClientNotFound(client_id.to_string()))
    }

    /// Builds a router serving the WebSocket upgrade path, for mounting in
    /// a host application's own axum server.
    ///
    /// Sessions are only admitted while the registry is running.
    pub async fn websocket_router(&self) -> axum::Router {
        ws::router(AppState {
            registry: self.clone(),
            options: self.options().await,
        })
    }

    /// Starts `session` and registers it under its client id.
    ///
    /// A session already registered under the same id is disconnected with
    /// [`SessionError::TakenOver`](crate::error::SessionError::TakenOver).
    pub(crate) async fn admit<S>(&self, session: Session<S>) -> Result<SessionHandle, GatewayError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut state = self.inner.write().await;
        if state.listeners.is_none() {
            return Err(GatewayError::NotRunning);
        }
        let forwarder = RegistryForwarder {
            dispatcher: state.dispatchers.packet.clone(),
            hook: state.options.packet_hook.clone(),
        };
        let (handle, task) = session.start(forwarder);
        let client_id = handle.client_id().to_string();
        if let Some(previous) = state.sessions.insert(client_id.clone(), handle.clone()) {
            info!(client_id = %client_id, "client id taken over by a newer connection");
            previous.evict();
        }
        let connected = state.dispatchers.connected.clone();
        let connected_hook = state.options.connected_hook.clone();
        drop(state);

        let registry = self.clone();
        let connection_id = handle.connection_id();
        let supervised_id = client_id.clone();
        drop(tokio::spawn(async move {
            match task.await {
                Ok(outcome) => registry.release(outcome).await,
                Err(e) => {
                    warn!(client_id = %supervised_id, error = %e, "session task failed");
                    let mut state = registry.inner.write().await;
                    if state
                        .sessions
                        .get(&supervised_id)
                        .is_some_and(|h| h.connection_id() == connection_id)
                    {
                        let _ = state.sessions.remove(&supervised_id);
                    }
                }
            }
        }));

        if let Some(hook) = connected_hook {
            connected.dispatch(move || hook(&client_id));
        }
        Ok(handle)
    }

    /// Removes a finished session and fires the disconnected hook.
    ///
    /// The entry is only removed if it still belongs to the same connection.
    /// The hook fires for a removed or evicted session unless suppressed.
    async fn release(&self, outcome: SessionOutcome) {
        let record = outcome.record;
        let (removed, dispatcher, hook) = {
            let mut state = self.inner.write().await;
            let owned = state
                .sessions
                .get(&record.client_id)
                .is_some_and(|h| h.connection_id() == record.connection_id);
            if owned {
                let _ = state.sessions.remove(&record.client_id);
            }
            (
                owned,
                state.dispatchers.disconnected.clone(),
                state.options.disconnected_hook.clone(),
            )
        };

        if outcome.suppressed || !(removed || outcome.evicted) {
            debug!(client_id = %record.client_id, "disconnected hook skipped");
            return;
        }
        if let Some(hook) = hook {
            dispatcher.dispatch(move || hook(record));
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::codec::PacketType;
    use crate::domain::Protocol;
    use crate::error::SessionError;
    use bytes::Bytes;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    fn local_update() -> OptionsUpdate {
        OptionsUpdate {
            bind_host: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            tcp_port: Some(0),
            ..OptionsUpdate::default()
        }
    }

    async fn running(update: OptionsUpdate) -> Registry {
        let registry = Registry::new(update);
        let Ok(_) = registry.start().await else {
            panic!("start failed");
        };
        registry
    }

    async fn admit(registry: &Registry, client_id: &str) -> (DuplexStream, SessionHandle) {
        let (client, server) = tokio::io::duplex(4096);
        let Ok(handle) = registry.admit(Session::tcp(server, client_id, None)).await else {
            panic!("admit failed");
        };
        (client, handle)
    }

    async fn wait_until_gone(registry: &Registry, client_id: &str) {
        for _ in 0..200 {
            if registry.session(client_id).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session {client_id} was never removed");
    }

    #[tokio::test]
    async fn list_is_descending_and_paged() {
        let registry = running(local_update()).await;
        let mut clients = Vec::new();
        for id in ["a", "c", "b", "d"] {
            clients.push(admit(&registry, id).await);
        }

        let (total, page) = registry.list(0, 10).await;
        assert_eq!(total, 4);
        let ids: Vec<_> = page.iter().map(|r| r.client_id.as_str()).collect();
        assert_eq!(ids, ["d", "c", "b", "a"]);

        let (_, page) = registry.list(1, 3).await;
        let ids: Vec<_> = page.iter().map(|r| r.client_id.as_str()).collect();
        assert_eq!(ids, ["c", "b"]);

        assert_eq!(registry.list(0, 0).await, (4, Vec::new()));
        assert_eq!(registry.list(3, 2).await, (4, Vec::new()));
        assert_eq!(registry.list(10, 20).await, (4, Vec::new()));
        registry.stop().await;
    }

    #[tokio::test]
    async fn lookups_of_unknown_ids_fail() {
        let registry = running(local_update()).await;
        assert!(matches!(
            registry.get_once("ghost").await,
            Err(GatewayError::ClientNotFound(_))
        ));
        assert!(matches!(
            registry.close_once("ghost").await,
            Err(GatewayError::ClientNotFound(_))
        ));
        let packet = Packet::new(PacketType::PingResp, 0, Bytes::new());
        assert!(matches!(
            registry.send_once("ghost", &packet).await,
            Err(GatewayError::ClientNotFound(_))
        ));
        registry.stop().await;
    }

    #[tokio::test]
    async fn close_once_fires_disconnected_hook_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = running(local_update().on_disconnected(move |record| {
            let _ = tx.send(record);
        }))
        .await;
        let (_client, _handle) = admit(&registry, "c1").await;

        let Ok(()) = registry.close_once("c1").await else {
            panic!("close failed");
        };
        let Some(record) = rx.recv().await else {
            panic!("hook not called");
        };
        assert_eq!(record.client_id, "c1");
        assert_eq!(record.protocol, Protocol::Tcp);
        assert!(record.last_error.is_none());
        assert!(!record.is_active());
        assert_eq!(registry.count().await, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        registry.stop().await;
    }

    #[tokio::test]
    async fn stop_suppresses_hook_and_clears_registry() {
        let (tx, mut rx) = mpsc::unbounded_channel::<ConnectionRecord>();
        let registry = running(local_update().on_disconnected(move |record| {
            let _ = tx.send(record);
        }))
        .await;
        let (_c1, h1) = admit(&registry, "c1").await;
        let (_c2, h2) = admit(&registry, "c2").await;

        registry.stop().await;
        registry.stop().await;
        assert_eq!(registry.count().await, 0);
        assert!(!registry.is_running().await);

        for _ in 0..200 {
            if !h1.is_active() && !h2.is_active() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!h1.is_active() && !h2.is_active());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_client_id_evicts_the_older_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = running(local_update().on_disconnected(move |record| {
            let _ = tx.send(record);
        }))
        .await;
        let (_old_client, old) = admit(&registry, "dup").await;
        let (_new_client, new) = admit(&registry, "dup").await;

        let Some(record) = rx.recv().await else {
            panic!("evicted session did not report");
        };
        assert_eq!(record.connection_id, old.connection_id());
        assert_eq!(record.last_error, Some(SessionError::TakenOver));

        let Ok(current) = registry.get_once("dup").await else {
            panic!("new session missing");
        };
        assert_eq!(current.connection_id, new.connection_id());
        assert!(current.is_active());
        assert_eq!(registry.count().await, 1);
        registry.stop().await;
    }

    #[tokio::test]
    async fn packets_reach_the_packet_hook() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = running(local_update().on_packet(move |id, packet| {
            let _ = tx.send((id.to_string(), packet.packet_type()));
        }))
        .await;
        let (mut client, _handle) = admit(&registry, "pub").await;

        let Ok(()) = client.write_all(&[0xC0, 0x00]).await else {
            panic!("client write failed");
        };
        let Some((id, kind)) = rx.recv().await else {
            panic!("packet hook not called");
        };
        assert_eq!(id, "pub");
        assert_eq!(kind, PacketType::PingReq);
        registry.stop().await;
    }

    #[tokio::test]
    async fn panicking_packet_hook_leaves_session_running() {
        let registry = running(local_update().on_packet(|_, _| panic!("bad hook"))).await;
        let (mut client, handle) = admit(&registry, "sturdy").await;

        for _ in 0..3 {
            let Ok(()) = client.write_all(&[0xC0, 0x00]).await else {
                panic!("client write failed");
            };
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_active());
        assert_eq!(registry.count().await, 1);
        registry.stop().await;
    }

    #[tokio::test]
    async fn send_once_writes_to_the_session() {
        let registry = running(local_update()).await;
        let (_client, _handle) = admit(&registry, "rx").await;
        let packet = Packet::new(PacketType::PingResp, 0, Bytes::new());
        let Ok(written) = registry.send_once("rx", &packet).await else {
            panic!("send failed");
        };
        assert_eq!(written, 2);
        registry.stop().await;
    }

    #[tokio::test]
    async fn peer_disconnect_removes_session() {
        let registry = running(local_update()).await;
        let (client, _handle) = admit(&registry, "gone").await;
        drop(client);
        wait_until_gone(&registry, "gone").await;
        assert_eq!(registry.count().await, 0);
        registry.stop().await;
    }

    #[tokio::test]
    async fn set_options_only_applies_while_stopped() {
        let registry = Registry::new(local_update());
        assert!(
            registry
                .set_options(OptionsUpdate {
                    statistics_enabled: Some(true),
                    ..OptionsUpdate::default()
                })
                .await
        );
        assert!(registry.options().await.statistics_enabled);

        let Ok(_) = registry.start().await else {
            panic!("start failed");
        };
        assert!(
            !registry
                .set_options(OptionsUpdate {
                    idle_timeout_secs: Some(30),
                    ..OptionsUpdate::default()
                })
                .await
        );
        assert_eq!(registry.options().await.idle_timeout_secs, 60);
        registry.stop().await;
    }

    #[tokio::test]
    async fn start_is_idempotent_and_admit_requires_running() {
        let registry = Registry::new(local_update());
        let (_client, server) = tokio::io::duplex(64);
        assert!(matches!(
            registry.admit(Session::tcp(server, "early", None)).await,
            Err(GatewayError::NotRunning)
        ));

        let Ok(first) = registry.start().await else {
            panic!("start failed");
        };
        let Ok(second) = registry.start().await else {
            panic!("second start failed");
        };
        assert_eq!(first, second);
        assert_eq!(registry.bound_addrs().await, Some(first));
        registry.stop().await;
        assert_eq!(registry.bound_addrs().await, None);
    }

    #[tokio::test]
    async fn failed_bind_leaves_nothing_running() {
        let registry = running(local_update()).await;
        let Some(taken) = registry.bound_addrs().await else {
            panic!("no addresses");
        };

        let second = Registry::new(OptionsUpdate {
            websocket_enabled: Some(true),
            websocket_port: Some(taken.tcp.port()),
            ..local_update()
        });
        assert!(matches!(
            second.start().await,
            Err(GatewayError::Bind {
                transport: "websocket",
                ..
            })
        ));
        assert!(!second.is_running().await);
        registry.stop().await;
    }

    #[tokio::test]
    async fn connected_hook_fires_after_registration() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = running(local_update().on_connected(move |id| {
            let _ = tx.send(id.to_string());
        }))
        .await;
        let (_client, _handle) = admit(&registry, "hello").await;
        let Some(id) = rx.recv().await else {
            panic!("connected hook not called");
        };
        assert_eq!(id, "hello");
        assert_eq!(registry.count().await, 1);
        registry.stop().await;
    }

    #[tokio::test]
    async fn close_then_takeover_still_reports_the_old_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = running(local_update().on_disconnected(move |record| {
            let _ = tx.send(record);
        }))
        .await;
        let (_old_client, old) = admit(&registry, "dup").await;

        let Ok(()) = registry.close_once("dup").await else {
            panic!("close failed");
        };
        let (_new_client, new) = admit(&registry, "dup").await;

        let Some(record) = rx.recv().await else {
            panic!("closed session did not report");
        };
        assert_eq!(record.connection_id, old.connection_id());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        let Ok(current) = registry.get_once("dup").await else {
            panic!("new session missing");
        };
        assert_eq!(current.connection_id, new.connection_id());
        registry.stop().await;
    }

    #[tokio::test]
    async fn close_once_is_not_held_up_by_a_blocked_send() {
        let registry = running(local_update()).await;
        let (client, server) = tokio::io::duplex(64);
        let Ok(_handle) = registry.admit(Session::tcp(server, "stuck", None)).await else {
            panic!("admit failed");
        };

        let sender = registry.clone();
        let send = tokio::spawn(async move {
            let large = Packet::new(PacketType::Publish, 0, Bytes::from(vec![b'x'; 10_000]));
            sender.send_once("stuck", &large).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!send.is_finished());

        let Ok(()) = registry.close_once("stuck").await else {
            panic!("close failed");
        };
        wait_until_gone(&registry, "stuck").await;
        let Ok(result) = send.await else {
            panic!("send task failed");
        };
        assert!(matches!(result, Err(GatewayError::Disconnected(_))));
        drop(client);
        registry.stop().await;
    }

    #[tokio::test]
    async fn slow_packet_hook_does_not_hold_sessions_open() {
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let gate = std::sync::Mutex::new(gate_rx);
        let registry = running(
            OptionsUpdate {
                hook_concurrency: Some(1),
                ..local_update()
            }
            .on_packet(move |_, _| {
                if let Ok(gate) = gate.lock() {
                    let _ = gate.recv();
                }
            }),
        )
        .await;
        let (mut client, _handle) = admit(&registry, "busy").await;
        let (_other_client, _other) = admit(&registry, "other").await;

        for _ in 0..2 {
            let Ok(()) = client.write_all(&[0xC0, 0x00]).await else {
                panic!("client write failed");
            };
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let Ok(()) = registry.close_once("busy").await else {
            panic!("close failed");
        };
        wait_until_gone(&registry, "busy").await;
        let Ok(()) = registry.close_once("other").await else {
            panic!("close failed");
        };
        wait_until_gone(&registry, "other").await;

        drop(gate_tx);
        registry.stop().await;
    }
}
