//! Domain layer: identities, snapshots, hooks, options and the registry.
//!
//! This module holds the gateway's server-side model: the connection
//! identifier and snapshot types, the hook signatures and their bounded
//! dispatcher, the registry options, and the [`Registry`] that owns every
//! live session.

pub mod connection_id;
pub mod connection_record;
pub mod hook_dispatcher;
pub mod hooks;
pub mod options;
pub mod registry;

pub use connection_id::ConnectionId;
pub use connection_record::{ConnectionRecord, Protocol, SessionStatus};
pub use hook_dispatcher::HookDispatcher;
pub use hooks::{
    ConnectedHook, DisconnectedHook, HandshakeHook, HandshakeRecord, HandshakeResult, PacketHook,
    UpgradeHook,
};
pub use options::{ManagerOptions, OptionsUpdate};
pub use registry::Registry;
