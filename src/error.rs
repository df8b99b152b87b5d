//! Error taxonomy for the kiln core.
//!
//! Transport failures (`PluginLaunch`, `PluginCommunication`) are kept
//! distinct from errors a component deliberately reports (`Config`,
//! `Validation`, `Build`) so callers can always tell a dead subprocess
//! apart from a failed build.

use std::path::PathBuf;

use crate::core::ComponentKind;

/// Spawn/handshake failure categories for a plugin subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchErrorKind {
    /// No executable found for the component name.
    NotFound,
    /// Handshake line did not arrive within the deadline.
    Timeout,
    /// Handshake line was present but malformed or version-mismatched.
    Protocol,
    /// Dialing the announced address failed.
    Connect,
}

impl std::fmt::Display for LaunchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LaunchErrorKind::NotFound => "not found",
            LaunchErrorKind::Timeout => "handshake timeout",
            LaunchErrorKind::Protocol => "protocol error",
            LaunchErrorKind::Connect => "connect failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// One or more configuration problems, reported together so the user
    /// sees every mistake in a single pass.
    #[error("{} configuration error(s):\n{}", .0.len(), bullet_list(.0))]
    Config(Vec<String>),

    /// Structural problems not specific to one component.
    #[error("{} validation error(s):\n{}", .0.len(), bullet_list(.0))]
    Validation(Vec<String>),

    #[error("unknown {kind} {name:?}")]
    ComponentNotFound { kind: ComponentKind, name: String },

    #[error("failed to launch plugin {}: {kind}: {message}", .path.display())]
    PluginLaunch {
        kind: LaunchErrorKind,
        path: PathBuf,
        message: String,
    },

    /// Post-handshake transport or decoding failure, including the
    /// subprocess dying mid-call. Carries the exit status when known.
    #[error("plugin communication failed: {context}{}", exit_suffix(.exit))]
    PluginCommunication {
        context: String,
        exit: Option<i32>,
    },

    /// A component deliberately reported failure of its own logic.
    #[error("{0}")]
    Build(String),

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Shorthand for a transport failure with no known exit status.
    pub fn comm(context: impl Into<String>) -> Self {
        CoreError::PluginCommunication {
            context: context.into(),
            exit: None,
        }
    }

    pub fn launch(kind: LaunchErrorKind, path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        CoreError::PluginLaunch {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    /// True for errors the plugin transport produced, as opposed to errors
    /// the remote component reported.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            CoreError::PluginLaunch { .. } | CoreError::PluginCommunication { .. }
        )
    }
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("* {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn exit_suffix(exit: &Option<i32>) -> String {
    match exit {
        Some(code) => format!(" (plugin exited with status {code})"),
        None => String::new(),
    }
}
