//! Wire-level contracts: the startup handshake line and the RPC frame
//! envelope exchanged over the negotiated transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, LaunchErrorKind};

/// Bumped whenever the frame envelope changes incompatibly. Host and plugin
/// must agree exactly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable carrying the magic cookie. A plugin refuses to run
/// in plugin mode unless this is present with the exact expected value,
/// which protects against executing an unrelated binary and parsing its
/// output as protocol data.
pub const MAGIC_COOKIE_KEY: &str = "KILN_PLUGIN_MAGIC_COOKIE";
pub const MAGIC_COOKIE_VALUE: &str = "b9c4d3f01a6e48d2a7c05e9f31b82c64";

/// Prefix for plugin executable names: `kiln-<kind>-<name>`.
pub const PLUGIN_PREFIX: &str = "kiln";

/// Parsed form of the single handshake line a plugin writes to stdout
/// before any other output: `<version>|<network>|<address>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub version: u32,
    pub network: String,
    pub address: String,
}

impl HandshakeInfo {
    pub fn parse(line: &str) -> Result<Self, CoreError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.splitn(3, '|');
        let (version, network, address) = match (parts.next(), parts.next(), parts.next()) {
            (Some(v), Some(n), Some(a)) => (v, n, a),
            _ => {
                return Err(protocol_error(format!(
                    "malformed handshake line {line:?}, expected <version>|<network>|<address>"
                )));
            }
        };

        let version: u32 = version
            .parse()
            .map_err(|_| protocol_error(format!("non-numeric protocol version {version:?}")))?;
        if version != PROTOCOL_VERSION {
            return Err(protocol_error(format!(
                "plugin speaks protocol {version}, host requires {PROTOCOL_VERSION}"
            )));
        }
        if network != "tcp" {
            return Err(protocol_error(format!("unsupported network {network:?}")));
        }
        if address.is_empty() {
            return Err(protocol_error("empty transport address".to_string()));
        }

        Ok(HandshakeInfo {
            version,
            network: network.to_string(),
            address: address.to_string(),
        })
    }

    /// The line a plugin emits, newline not included.
    pub fn to_line(&self) -> String {
        format!("{}|{}|{}", self.version, self.network, self.address)
    }
}

fn protocol_error(message: String) -> CoreError {
    CoreError::launch(LaunchErrorKind::Protocol, "<handshake>", message)
}

/// Categories for errors crossing the RPC boundary. Business errors decode
/// back into their original [`CoreError`] variants on the calling side;
/// `Protocol` and `Internal` surface as communication failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Config,
    Validation,
    Build,
    NotFound,
    Protocol,
    Internal,
}

/// One frame on the wire. Requests and responses are paired by `id`;
/// both sides may originate calls on the same transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: u64,
    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Invoke `method` on the named service at the other end.
    Call {
        service: String,
        method: String,
        params: Value,
    },
    /// Successful result for the call with the same id.
    Reply { result: Value },
    /// The remote method reported failure; structured so the caller can
    /// distinguish a deliberate business error from a transport fault.
    /// `detail` carries variant fields that the message alone cannot
    /// reconstruct.
    Fault {
        kind: FaultKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },
}

/// Encode a [`CoreError`] for the wire.
pub fn fault_of(err: &CoreError) -> (FaultKind, String, Option<Value>) {
    match err {
        CoreError::Config(_) => (FaultKind::Config, err.to_string(), None),
        CoreError::Validation(_) => (FaultKind::Validation, err.to_string(), None),
        CoreError::Build(_) => (FaultKind::Build, err.to_string(), None),
        CoreError::ComponentNotFound { kind, name } => (
            FaultKind::NotFound,
            err.to_string(),
            Some(serde_json::json!({ "kind": kind.as_str(), "name": name })),
        ),
        CoreError::PluginLaunch { .. } | CoreError::PluginCommunication { .. } => {
            (FaultKind::Protocol, err.to_string(), None)
        }
        _ => (FaultKind::Internal, err.to_string(), None),
    }
}

/// Decode a fault received from the wire back into a [`CoreError`].
pub fn error_of(kind: FaultKind, message: String, detail: Option<Value>) -> CoreError {
    match kind {
        FaultKind::Config => CoreError::Config(vec![message]),
        FaultKind::Validation => CoreError::Validation(vec![message]),
        FaultKind::Build => CoreError::Build(message),
        FaultKind::NotFound => not_found_of(message, detail),
        FaultKind::Protocol | FaultKind::Internal => CoreError::comm(message),
    }
}

fn not_found_of(message: String, detail: Option<Value>) -> CoreError {
    if let Some(detail) = detail {
        let kind = detail
            .get("kind")
            .and_then(Value::as_str)
            .and_then(|k| k.parse().ok());
        let name = detail.get("name").and_then(Value::as_str);
        if let (Some(kind), Some(name)) = (kind, name) {
            return CoreError::ComponentNotFound {
                kind,
                name: name.to_string(),
            };
        }
    }
    CoreError::Build(message)
}
