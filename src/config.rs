//! Gateway configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). Every setting is optional; unset or
//! unparsable values leave the registry default in place.

use std::net::IpAddr;

use crate::domain::OptionsUpdate;
use crate::error::GatewayError;

/// Top-level gateway configuration.
///
/// Loaded once at startup via [`GatewayConfig::from_env`] and turned into
/// an [`OptionsUpdate`] for the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayConfig {
    /// `MQTT_BIND_HOST`: address every listener binds to.
    pub bind_host: Option<IpAddr>,
    /// `MQTT_TCP_PORT`: raw MQTT port.
    pub tcp_port: Option<u16>,
    /// `MQTT_WS_ENABLED`: start the WebSocket listener.
    pub websocket_enabled: Option<bool>,
    /// `MQTT_WS_PORT`: WebSocket port.
    pub websocket_port: Option<u16>,
    /// `MQTT_WS_PATH`: WebSocket upgrade path.
    pub websocket_path: Option<String>,
    /// `MQTT_WS_MAX_FRAME_SIZE`: largest WebSocket frame payload.
    pub websocket_max_frame_size: Option<usize>,
    /// `MQTT_MAX_PACKET_SIZE`: largest packet or fragmented message.
    pub max_packet_size: Option<usize>,
    /// `MQTT_UDP_ENABLED`: bind the placeholder UDP socket.
    pub udp_enabled: Option<bool>,
    /// `MQTT_UDP_PORT`: UDP port.
    pub udp_port: Option<u16>,
    /// `MQTT_STATISTICS_ENABLED`: count bytes per session.
    pub statistics_enabled: Option<bool>,
    /// `MQTT_HANDSHAKE_TIMEOUT_SECS`: CONNECT deadline.
    pub handshake_timeout_secs: Option<u64>,
    /// `MQTT_IDLE_TIMEOUT_SECS`: session idle timeout.
    pub idle_timeout_secs: Option<u64>,
    /// `HOOK_CONCURRENCY`: concurrently running hooks per category.
    pub hook_concurrency: Option<usize>,
}

impl GatewayConfig {
    /// Loads configuration from the process environment.
    ///
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] if `MQTT_BIND_HOST` is set but is
    /// not an IP address.
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`GatewayConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GatewayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_host = match lookup("MQTT_BIND_HOST") {
            Some(raw) => Some(raw.trim().parse::<IpAddr>().map_err(|e| {
                GatewayError::Internal(format!("invalid MQTT_BIND_HOST {raw:?}: {e}"))
            })?),
            None => None,
        };

        Ok(Self {
            bind_host,
            tcp_port: parse_var(&lookup, "MQTT_TCP_PORT"),
            websocket_enabled: parse_bool_var(&lookup, "MQTT_WS_ENABLED"),
            websocket_port: parse_var(&lookup, "MQTT_WS_PORT"),
            websocket_path: lookup("MQTT_WS_PATH").filter(|p| !p.trim().is_empty()),
            websocket_max_frame_size: parse_var(&lookup, "MQTT_WS_MAX_FRAME_SIZE"),
            max_packet_size: parse_var(&lookup, "MQTT_MAX_PACKET_SIZE"),
            udp_enabled: parse_bool_var(&lookup, "MQTT_UDP_ENABLED"),
            udp_port: parse_var(&lookup, "MQTT_UDP_PORT"),
            statistics_enabled: parse_bool_var(&lookup, "MQTT_STATISTICS_ENABLED"),
            handshake_timeout_secs: parse_var(&lookup, "MQTT_HANDSHAKE_TIMEOUT_SECS"),
            idle_timeout_secs: parse_var(&lookup, "MQTT_IDLE_TIMEOUT_SECS"),
            hook_concurrency: parse_var(&lookup, "HOOK_CONCURRENCY"),
        })
    }

    /// Converts the configuration into a registry options update.
    ///
    /// Hooks are left unset; the caller adds its own.
    #[must_use]
    pub fn into_update(self) -> OptionsUpdate {
        OptionsUpdate {
            bind_host: self.bind_host,
            tcp_port: self.tcp_port,
            websocket_enabled: self.websocket_enabled,
            websocket_port: self.websocket_port,
            websocket_path: self.websocket_path,
            websocket_max_frame_size: self.websocket_max_frame_size,
            max_packet_size: self.max_packet_size,
            udp_enabled: self.udp_enabled,
            udp_port: self.udp_port,
            statistics_enabled: self.statistics_enabled,
            handshake_timeout_secs: self.handshake_timeout_secs,
            idle_timeout_secs: self.idle_timeout_secs,
            hook_concurrency: self.hook_concurrency,
            ..OptionsUpdate::default()
        }
    }
}

/// Parses a variable as `T`, returning `None` on missing or invalid values.
fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|v| v.trim().parse().ok())
}

/// Parses a variable as a boolean. Accepts `"true"`, `"1"`, `"false"`,
/// `"0"` (case-insensitive). Returns `None` otherwise.
fn parse_bool_var<F>(lookup: &F, key: &str) -> Option<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key)?.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_sets_nothing() {
        let Ok(config) = GatewayConfig::from_lookup(lookup_from(&[])) else {
            panic!("empty config failed");
        };
        assert_eq!(config, GatewayConfig::default());
    }

    #[test]
    fn variables_are_parsed() {
        let Ok(config) = GatewayConfig::from_lookup(lookup_from(&[
            ("MQTT_BIND_HOST", "127.0.0.1"),
            ("MQTT_TCP_PORT", "11883"),
            ("MQTT_WS_ENABLED", "TRUE"),
            ("MQTT_WS_PORT", "8080"),
            ("MQTT_WS_PATH", "/mqtt"),
            ("MQTT_STATISTICS_ENABLED", "1"),
            ("MQTT_IDLE_TIMEOUT_SECS", "120"),
            ("HOOK_CONCURRENCY", "8"),
            ("MQTT_MAX_PACKET_SIZE", "4096"),
        ])) else {
            panic!("config failed");
        };
        assert_eq!(config.bind_host, "127.0.0.1".parse().ok());
        assert_eq!(config.tcp_port, Some(11883));
        assert_eq!(config.websocket_enabled, Some(true));
        assert_eq!(config.websocket_port, Some(8080));
        assert_eq!(config.websocket_path.as_deref(), Some("/mqtt"));
        assert_eq!(config.statistics_enabled, Some(true));
        assert_eq!(config.idle_timeout_secs, Some(120));
        assert_eq!(config.hook_concurrency, Some(8));
        assert_eq!(config.max_packet_size, Some(4096));
    }

    #[test]
    fn unparsable_values_are_ignored() {
        let Ok(config) = GatewayConfig::from_lookup(lookup_from(&[
            ("MQTT_TCP_PORT", "not-a-port"),
            ("MQTT_WS_ENABLED", "maybe"),
            ("MQTT_WS_PATH", "   "),
        ])) else {
            panic!("config failed");
        };
        assert_eq!(config.tcp_port, None);
        assert_eq!(config.websocket_enabled, None);
        assert_eq!(config.websocket_path, None);
    }

    #[test]
    fn bad_bind_host_is_an_error() {
        let result = GatewayConfig::from_lookup(lookup_from(&[("MQTT_BIND_HOST", "localhost:1")]));
        assert!(matches!(result, Err(GatewayError::Internal(_))));
    }

    #[test]
    fn update_merges_over_defaults() {
        let Ok(config) = GatewayConfig::from_lookup(lookup_from(&[
            ("MQTT_TCP_PORT", "2883"),
            ("MQTT_IDLE_TIMEOUT_SECS", "5"),
        ])) else {
            panic!("config failed");
        };
        let options = crate::domain::ManagerOptions::default().merge(config.into_update());
        assert_eq!(options.tcp_port, 2883);
        assert_eq!(options.idle_timeout_secs, 60);
        assert_eq!(options.websocket_path, "/websocket");
    }
}
