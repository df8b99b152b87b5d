//! Capability interfaces shared by in-process components and plugin proxies.
//!
//! Every trait here is object-safe and async so the same call site can hold
//! either a local implementation or an RPC proxy backed by a subprocess.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::environment::Environment;
use crate::error::CoreError;
use crate::ui::Ui;

/// Loosely-typed configuration bundle exchanged with plugins: string keys,
/// values limited to JSON primitives, sequences, and nested bundles.
pub type ConfigBundle = serde_json::Map<String, Value>;

/// The capability kinds a component may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Builder,
    Provisioner,
    PostProcessor,
    Hook,
    Command,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 5] = [
        ComponentKind::Builder,
        ComponentKind::Provisioner,
        ComponentKind::PostProcessor,
        ComponentKind::Hook,
        ComponentKind::Command,
    ];

    /// The kind segment used in plugin executable names.
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Builder => "builder",
            ComponentKind::Provisioner => "provisioner",
            ComponentKind::PostProcessor => "post-processor",
            ComponentKind::Hook => "hook",
            ComponentKind::Command => "command",
        }
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "builder" => Ok(ComponentKind::Builder),
            "provisioner" => Ok(ComponentKind::Provisioner),
            "post-processor" => Ok(ComponentKind::PostProcessor),
            "hook" => Ok(ComponentKind::Hook),
            "command" => Ok(ComponentKind::Command),
            other => Err(format!("unknown component kind {other:?}")),
        }
    }
}

/// The result of a successful build: a value snapshot that stays usable
/// after the producing component (possibly a subprocess) is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    /// Identifier of the builder that produced this artifact.
    pub builder_id: String,
    /// Files that make up the artifact.
    pub files: Vec<String>,
    /// Builder-specific artifact identifier (image id, snapshot name, ...).
    pub id: String,
    /// Human-readable description.
    pub description: String,
}

/// Produces a machine image from a prepared configuration.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Validate and absorb configuration. Configuration problems are
    /// aggregated into a single [`CoreError::Config`].
    async fn prepare(&mut self, config: &ConfigBundle) -> Result<(), CoreError>;

    /// Run the build. The hook fires at defined points (notably
    /// `"provision"`) and the UI receives progress output.
    async fn run(
        &self,
        ui: Arc<dyn Ui>,
        hook: Arc<dyn Hook>,
    ) -> Result<Option<ArtifactInfo>, CoreError>;

    /// Request cancellation of an in-flight run. Best effort.
    async fn cancel(&self);
}

impl std::fmt::Debug for dyn Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Builder")
    }
}

/// Installs and configures software inside a machine while it is being built.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn prepare(&mut self, configs: &[ConfigBundle]) -> Result<(), CoreError>;
    async fn provision(&self, ui: Arc<dyn Ui>) -> Result<(), CoreError>;
}

/// Transforms an artifact after the build (compress, upload, re-package).
#[async_trait]
pub trait PostProcessor: Send + Sync {
    async fn configure(&mut self, config: &ConfigBundle) -> Result<(), CoreError>;

    /// Returns the replacement artifact, or `None` to keep the input.
    async fn post_process(
        &self,
        ui: Arc<dyn Ui>,
        artifact: &ArtifactInfo,
    ) -> Result<Option<ArtifactInfo>, CoreError>;
}

/// A named extension point components fire during a run.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn run(&self, name: &str, ui: Arc<dyn Ui>, data: Value) -> Result<(), CoreError>;
}

/// Hook name fired by builders when the machine is ready for provisioners.
pub const HOOK_PROVISION: &str = "provision";

/// A CLI subcommand, in-process or plugin-backed.
#[async_trait]
pub trait Command: Send + Sync {
    /// Execute and return the process exit code.
    async fn run(&self, env: &Arc<Environment>, args: &[String]) -> Result<i32, CoreError>;

    /// One-line description for usage output.
    async fn synopsis(&self) -> String;
}

/// A hook that does nothing. Used where a builder requires a hook but the
/// template defines no provisioners.
pub struct NoopHook;

#[async_trait]
impl Hook for NoopHook {
    async fn run(&self, _name: &str, _ui: Arc<dyn Ui>, _data: Value) -> Result<(), CoreError> {
        Ok(())
    }
}
