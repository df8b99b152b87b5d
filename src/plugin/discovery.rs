//! Plugin discovery.
//!
//! Plugins are standalone executables named `kiln-<kind>-<name>`, found in
//! configured plugin directories (searched in order, first match wins) and
//! then on the system PATH.

use std::path::{Path, PathBuf};

use crate::core::ComponentKind;
use crate::plugin::protocol::PLUGIN_PREFIX;

/// The executable name for a component, e.g. `kiln-builder-amazon`.
pub fn plugin_binary_name(kind: ComponentKind, name: &str) -> String {
    format!("{PLUGIN_PREFIX}-{kind}-{name}")
}

/// Locate the executable for `kind`/`name`. Directory order is the
/// precedence order; PATH is the last tier.
pub fn find_plugin(kind: ComponentKind, name: &str, plugin_dirs: &[PathBuf]) -> Option<PathBuf> {
    let binary = plugin_binary_name(kind, name);

    for dir in plugin_dirs {
        for candidate in candidates(dir, &binary) {
            if is_executable(&candidate) {
                return Some(candidate);
            }
        }
    }

    which::which(&binary).ok()
}

fn candidates(dir: &Path, binary: &str) -> Vec<PathBuf> {
    let mut paths = vec![dir.join(binary)];
    if cfg!(windows) {
        paths.push(dir.join(format!("{binary}.exe")));
    }
    paths
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
