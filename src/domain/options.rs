//! Registry options and partial updates.
//!
//! [`ManagerOptions`] is the resolved configuration, shared as an `Arc` and
//! never mutated. [`OptionsUpdate`] carries only the fields a caller wants
//! to change; [`ManagerOptions::merge`] applies it.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;

use super::ConnectionRecord;
use super::hooks::{
    ConnectedHook, DisconnectedHook, HandshakeHook, HandshakeRecord, HandshakeResult, PacketHook,
    UpgradeHook,
};
use crate::codec::Packet;
use crate::codec::frame::DEFAULT_MAX_FRAME_PAYLOAD;
use crate::codec::mqtt::DEFAULT_MAX_PACKET_SIZE;

/// Default MQTT TCP port.
pub const DEFAULT_TCP_PORT: u16 = 1883;
/// Default WebSocket listener port.
pub const DEFAULT_WEBSOCKET_PORT: u16 = 80;
/// Default WebSocket upgrade path.
pub const DEFAULT_WEBSOCKET_PATH: &str = "/websocket";
/// Default UDP port (placeholder transport).
pub const DEFAULT_UDP_PORT: u16 = 1884;
/// Default handshake deadline in seconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
/// Longest accepted handshake deadline in seconds.
pub const MAX_HANDSHAKE_TIMEOUT_SECS: u64 = 300;
/// Default idle timeout in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
/// Shortest accepted idle timeout in seconds.
pub const MIN_IDLE_TIMEOUT_SECS: u64 = 10;
/// Longest accepted idle timeout in seconds.
pub const MAX_IDLE_TIMEOUT_SECS: u64 = 300;
/// Default number of concurrently running hooks per category.
pub const DEFAULT_HOOK_CONCURRENCY: usize = 64;

/// Returns `true` if `secs` is an accepted idle timeout.
#[must_use]
pub const fn is_valid_idle_timeout(secs: u64) -> bool {
    secs >= MIN_IDLE_TIMEOUT_SECS && secs <= MAX_IDLE_TIMEOUT_SECS
}

/// Resolved registry configuration.
#[derive(Clone)]
pub struct ManagerOptions {
    /// Address every listener binds to.
    pub bind_host: IpAddr,
    /// TCP listener port (always enabled).
    pub tcp_port: u16,
    /// Whether the WebSocket listener is started.
    pub websocket_enabled: bool,
    /// WebSocket listener port.
    pub websocket_port: u16,
    /// Path that accepts WebSocket upgrades.
    pub websocket_path: String,
    /// Largest frame payload read or written on WebSocket sessions.
    pub websocket_max_frame_size: usize,
    /// Largest MQTT packet, and largest fragmented WebSocket message,
    /// accepted from a client.
    pub max_packet_size: usize,
    /// Whether the (placeholder) UDP socket is bound.
    pub udp_enabled: bool,
    /// UDP port.
    pub udp_port: u16,
    /// Whether sessions count bytes read and written.
    pub statistics_enabled: bool,
    /// Deadline for receiving the CONNECT, in seconds.
    pub handshake_timeout_secs: u64,
    /// Maximum gap between complete reads, in seconds.
    pub idle_timeout_secs: u64,
    /// Concurrently running hooks per category.
    pub hook_concurrency: usize,
    /// Authorizes a CONNECT; absent means accept.
    pub handshake_hook: Option<HandshakeHook>,
    /// Called after a session is registered.
    pub connected_hook: Option<ConnectedHook>,
    /// Called after a session is removed.
    pub disconnected_hook: Option<DisconnectedHook>,
    /// Called for every decoded control packet.
    pub packet_hook: Option<PacketHook>,
    /// Extra check on WebSocket upgrade requests.
    pub upgrade_hook: Option<UpgradeHook>,
}

impl ManagerOptions {
    /// Returns a copy of `self` with every field set in `update` applied.
    ///
    /// Unset fields keep their current value. An empty WebSocket path is
    /// treated as unset; out-of-range timeouts and zero sizes fall back to
    /// their defaults.
    #[must_use]
    pub fn merge(&self, update: OptionsUpdate) -> Self {
        let mut merged = self.clone();
        if let Some(host) = update.bind_host {
            merged.bind_host = host;
        }
        if let Some(port) = update.tcp_port {
            merged.tcp_port = port;
        }
        if let Some(enabled) = update.websocket_enabled {
            merged.websocket_enabled = enabled;
        }
        if let Some(port) = update.websocket_port {
            merged.websocket_port = port;
        }
        if let Some(path) = update.websocket_path.filter(|p| !p.trim().is_empty()) {
            merged.websocket_path = normalize_path(&path);
        }
        if let Some(size) = update.websocket_max_frame_size {
            merged.websocket_max_frame_size = if size == 0 {
                DEFAULT_MAX_FRAME_PAYLOAD
            } else {
                size
            };
        }
        if let Some(size) = update.max_packet_size {
            merged.max_packet_size = if size == 0 {
                DEFAULT_MAX_PACKET_SIZE
            } else {
                size
            };
        }
        if let Some(enabled) = update.udp_enabled {
            merged.udp_enabled = enabled;
        }
        if let Some(port) = update.udp_port {
            merged.udp_port = port;
        }
        if let Some(enabled) = update.statistics_enabled {
            merged.statistics_enabled = enabled;
        }
        if let Some(secs) = update.handshake_timeout_secs {
            merged.handshake_timeout_secs = if (1..=MAX_HANDSHAKE_TIMEOUT_SECS).contains(&secs) {
                secs
            } else {
                DEFAULT_HANDSHAKE_TIMEOUT_SECS
            };
        }
        if let Some(secs) = update.idle_timeout_secs {
            merged.idle_timeout_secs = if is_valid_idle_timeout(secs) {
                secs
            } else {
                DEFAULT_IDLE_TIMEOUT_SECS
            };
        }
        if let Some(concurrency) = update.hook_concurrency {
            merged.hook_concurrency = if concurrency == 0 {
                DEFAULT_HOOK_CONCURRENCY
            } else {
                concurrency
            };
        }
        if update.handshake_hook.is_some() {
            merged.handshake_hook = update.handshake_hook;
        }
        if update.connected_hook.is_some() {
            merged.connected_hook = update.connected_hook;
        }
        if update.disconnected_hook.is_some() {
            merged.disconnected_hook = update.disconnected_hook;
        }
        if update.packet_hook.is_some() {
            merged.packet_hook = update.packet_hook;
        }
        if update.upgrade_hook.is_some() {
            merged.upgrade_hook = update.upgrade_hook;
        }
        merged
    }

    /// Handshake deadline.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port: DEFAULT_TCP_PORT,
            websocket_enabled: false,
            websocket_port: DEFAULT_WEBSOCKET_PORT,
            websocket_path: DEFAULT_WEBSOCKET_PATH.to_string(),
            websocket_max_frame_size: DEFAULT_MAX_FRAME_PAYLOAD,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            udp_enabled: false,
            udp_port: DEFAULT_UDP_PORT,
            statistics_enabled: false,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            hook_concurrency: DEFAULT_HOOK_CONCURRENCY,
            handshake_hook: None,
            connected_hook: None,
            disconnected_hook: None,
            packet_hook: None,
            upgrade_hook: None,
        }
    }
}

impl fmt::Debug for ManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerOptions")
            .field("bind_host", &self.bind_host)
            .field("tcp_port", &self.tcp_port)
            .field("websocket_enabled", &self.websocket_enabled)
            .field("websocket_port", &self.websocket_port)
            .field("websocket_path", &self.websocket_path)
            .field("websocket_max_frame_size", &self.websocket_max_frame_size)
            .field("max_packet_size", &self.max_packet_size)
            .field("udp_enabled", &self.udp_enabled)
            .field("udp_port", &self.udp_port)
            .field("statistics_enabled", &self.statistics_enabled)
            .field("handshake_timeout_secs", &self.handshake_timeout_secs)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("hook_concurrency", &self.hook_concurrency)
            .field("handshake_hook", &self.handshake_hook.is_some())
            .field("connected_hook", &self.connected_hook.is_some())
            .field("disconnected_hook", &self.disconnected_hook.is_some())
            .field("packet_hook", &self.packet_hook.is_some())
            .field("upgrade_hook", &self.upgrade_hook.is_some())
            .finish()
    }
}

/// Partial options update; `None` leaves the current value in place.
#[derive(Clone, Default)]
pub struct OptionsUpdate {
    /// See [`ManagerOptions::bind_host`].
    pub bind_host: Option<IpAddr>,
    /// See [`ManagerOptions::tcp_port`].
    pub tcp_port: Option<u16>,
    /// See [`ManagerOptions::websocket_enabled`].
    pub websocket_enabled: Option<bool>,
    /// See [`ManagerOptions::websocket_port`].
    pub websocket_port: Option<u16>,
    /// See [`ManagerOptions::websocket_path`].
    pub websocket_path: Option<String>,
    /// See [`ManagerOptions::websocket_max_frame_size`].
    pub websocket_max_frame_size: Option<usize>,
    /// See [`ManagerOptions::max_packet_size`].
    pub max_packet_size: Option<usize>,
    /// See [`ManagerOptions::udp_enabled`].
    pub udp_enabled: Option<bool>,
    /// See [`ManagerOptions::udp_port`].
    pub udp_port: Option<u16>,
    /// See [`ManagerOptions::statistics_enabled`].
    pub statistics_enabled: Option<bool>,
    /// See [`ManagerOptions::handshake_timeout_secs`].
    pub handshake_timeout_secs: Option<u64>,
    /// See [`ManagerOptions::idle_timeout_secs`].
    pub idle_timeout_secs: Option<u64>,
    /// See [`ManagerOptions::hook_concurrency`].
    pub hook_concurrency: Option<usize>,
    /// See [`ManagerOptions::handshake_hook`].
    pub handshake_hook: Option<HandshakeHook>,
    /// See [`ManagerOptions::connected_hook`].
    pub connected_hook: Option<ConnectedHook>,
    /// See [`ManagerOptions::disconnected_hook`].
    pub disconnected_hook: Option<DisconnectedHook>,
    /// See [`ManagerOptions::packet_hook`].
    pub packet_hook: Option<PacketHook>,
    /// See [`ManagerOptions::upgrade_hook`].
    pub upgrade_hook: Option<UpgradeHook>,
}

impl OptionsUpdate {
    /// Sets the handshake hook.
    #[must_use]
    pub fn on_handshake<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HandshakeRecord) -> HandshakeResult + Send + Sync + 'static,
    {
        self.handshake_hook = Some(Arc::new(hook));
        self
    }

    /// Sets the connected hook.
    #[must_use]
    pub fn on_connected<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.connected_hook = Some(Arc::new(hook));
        self
    }

    /// Sets the disconnected hook.
    #[must_use]
    pub fn on_disconnected<F>(mut self, hook: F) -> Self
    where
        F: Fn(ConnectionRecord) + Send + Sync + 'static,
    {
        self.disconnected_hook = Some(Arc::new(hook));
        self
    }

    /// Sets the packet hook.
    #[must_use]
    pub fn on_packet<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, Packet) + Send + Sync + 'static,
    {
        self.packet_hook = Some(Arc::new(hook));
        self
    }

    /// Sets the WebSocket upgrade extra check.
    #[must_use]
    pub fn on_websocket_upgrade<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Request) -> Result<(), String> + Send + Sync + 'static,
    {
        self.upgrade_hook = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for OptionsUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionsUpdate")
            .field("bind_host", &self.bind_host)
            .field("tcp_port", &self.tcp_port)
            .field("websocket_enabled", &self.websocket_enabled)
            .field("websocket_port", &self.websocket_port)
            .field("websocket_path", &self.websocket_path)
            .field("websocket_max_frame_size", &self.websocket_max_frame_size)
            .field("max_packet_size", &self.max_packet_size)
            .field("udp_enabled", &self.udp_enabled)
            .field("udp_port", &self.udp_port)
            .field("statistics_enabled", &self.statistics_enabled)
            .field("handshake_timeout_secs", &self.handshake_timeout_secs)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("hook_concurrency", &self.hook_concurrency)
            .finish_non_exhaustive()
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
