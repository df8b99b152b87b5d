//! Plugin system for kiln.
//!
//! Builders, provisioners, post-processors, hooks, and commands can live in
//! separate executables. The host spawns them, performs a one-line stdout
//! handshake to learn a transport address, and then speaks a bidirectional
//! RPC protocol over TCP: the host invokes the plugin's capability, and the
//! plugin calls back into the host for UI output and hooks.

pub mod client;
pub mod connection;
pub mod discovery;
pub mod framing;
pub mod protocol;
pub mod proxy;
pub mod serve;

// Re-export commonly used types
pub use client::PluginClient;
pub use connection::Connection;
pub use serve::{ServeComponents, serve};
