//! Component registry: maps a capability kind and name to either a
//! built-in implementation or a discoverable plugin executable.
//!
//! Resolution is static: per-kind tables of constructors for built-ins,
//! with plugin discovery as the other tier. Built-ins win by default; see
//! [`Registry::prefer_plugins`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::builtin::NullBuilder;
use crate::commands::{BuildCommand, VersionCommand};
use crate::core::{Builder, Command, ComponentKind, Hook, PostProcessor, Provisioner};
use crate::error::CoreError;
use crate::plugin::discovery::find_plugin;

pub type BuilderFactory = fn() -> Box<dyn Builder>;
pub type ProvisionerFactory = fn() -> Box<dyn Provisioner>;
pub type PostProcessorFactory = fn() -> Box<dyn PostProcessor>;
pub type HookFactory = fn() -> Arc<dyn Hook>;
pub type CommandFactory = fn() -> Box<dyn Command>;

static DEFAULT_BUILDERS: Lazy<HashMap<&'static str, BuilderFactory>> = Lazy::new(|| {
    let mut map: HashMap<&'static str, BuilderFactory> = HashMap::new();
    map.insert("null", || Box::new(NullBuilder::new()));
    map
});

static DEFAULT_COMMANDS: Lazy<HashMap<&'static str, CommandFactory>> = Lazy::new(|| {
    let mut map: HashMap<&'static str, CommandFactory> = HashMap::new();
    map.insert("build", || Box::new(BuildCommand));
    map.insert("version", || Box::new(VersionCommand));
    map
});

/// How a name resolved: instantiate in-process, or launch the executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Builtin,
    Plugin(PathBuf),
}

pub struct Registry {
    builders: HashMap<String, BuilderFactory>,
    provisioners: HashMap<String, ProvisionerFactory>,
    post_processors: HashMap<String, PostProcessorFactory>,
    hooks: HashMap<String, HookFactory>,
    commands: HashMap<String, CommandFactory>,
    plugin_dirs: Vec<PathBuf>,
    prefer_plugins: bool,
}

impl Registry {
    /// An empty registry: no built-ins, no plugin directories.
    pub fn empty() -> Self {
        Registry {
            builders: HashMap::new(),
            provisioners: HashMap::new(),
            post_processors: HashMap::new(),
            hooks: HashMap::new(),
            commands: HashMap::new(),
            plugin_dirs: Vec::new(),
            prefer_plugins: false,
        }
    }

    /// The standard registry: built-in commands and builders registered.
    pub fn with_defaults() -> Self {
        let mut registry = Registry::empty();
        for (name, factory) in DEFAULT_BUILDERS.iter() {
            registry.builders.insert((*name).to_string(), *factory);
        }
        for (name, factory) in DEFAULT_COMMANDS.iter() {
            registry.commands.insert((*name).to_string(), *factory);
        }
        registry
    }

    /// Append a directory to the plugin search path. Directories are
    /// searched in insertion order; the first match wins.
    pub fn add_plugin_dir(&mut self, dir: impl Into<PathBuf>) {
        self.plugin_dirs.push(dir.into());
    }

    /// When set, a discoverable plugin shadows a built-in of the same
    /// name. Off by default: built-ins take precedence.
    pub fn prefer_plugins(&mut self, prefer: bool) {
        self.prefer_plugins = prefer;
    }

    pub fn register_builder(&mut self, name: impl Into<String>, factory: BuilderFactory) {
        self.builders.insert(name.into(), factory);
    }

    pub fn register_provisioner(&mut self, name: impl Into<String>, factory: ProvisionerFactory) {
        self.provisioners.insert(name.into(), factory);
    }

    pub fn register_post_processor(
        &mut self,
        name: impl Into<String>,
        factory: PostProcessorFactory,
    ) {
        self.post_processors.insert(name.into(), factory);
    }

    pub fn register_hook(&mut self, name: impl Into<String>, factory: HookFactory) {
        self.hooks.insert(name.into(), factory);
    }

    pub fn register_command(&mut self, name: impl Into<String>, factory: CommandFactory) {
        self.commands.insert(name.into(), factory);
    }

    /// Registered built-in command names, sorted for usage output.
    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }

    fn has_builtin(&self, kind: ComponentKind, name: &str) -> bool {
        match kind {
            ComponentKind::Builder => self.builders.contains_key(name),
            ComponentKind::Provisioner => self.provisioners.contains_key(name),
            ComponentKind::PostProcessor => self.post_processors.contains_key(name),
            ComponentKind::Hook => self.hooks.contains_key(name),
            ComponentKind::Command => self.commands.contains_key(name),
        }
    }

    /// Resolve a name without instantiating anything. Never spawns.
    pub fn resolve(&self, kind: ComponentKind, name: &str) -> Result<Resolution, CoreError> {
        let builtin = self.has_builtin(kind, name);
        if builtin && !self.prefer_plugins {
            return Ok(Resolution::Builtin);
        }
        if let Some(path) = find_plugin(kind, name, &self.plugin_dirs) {
            return Ok(Resolution::Plugin(path));
        }
        if builtin {
            return Ok(Resolution::Builtin);
        }
        Err(CoreError::ComponentNotFound {
            kind,
            name: name.to_string(),
        })
    }

    pub fn new_builtin_builder(&self, name: &str) -> Option<Box<dyn Builder>> {
        self.builders.get(name).map(|factory| factory())
    }

    pub fn new_builtin_provisioner(&self, name: &str) -> Option<Box<dyn Provisioner>> {
        self.provisioners.get(name).map(|factory| factory())
    }

    pub fn new_builtin_post_processor(&self, name: &str) -> Option<Box<dyn PostProcessor>> {
        self.post_processors.get(name).map(|factory| factory())
    }

    pub fn new_builtin_hook(&self, name: &str) -> Option<Arc<dyn Hook>> {
        self.hooks.get(name).map(|factory| factory())
    }

    pub fn new_builtin_command(&self, name: &str) -> Option<Box<dyn Command>> {
        self.commands.get(name).map(|factory| factory())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_include_build_and_version() {
        let registry = Registry::with_defaults();
        assert_eq!(
            registry.command_names(),
            vec!["build".to_string(), "version".to_string()]
        );
    }

    #[test]
    fn unknown_name_is_component_not_found() {
        let registry = Registry::with_defaults();
        let err = registry
            .resolve(ComponentKind::Builder, "unknown-xyz")
            .unwrap_err();
        match err {
            CoreError::ComponentNotFound { kind, name } => {
                assert_eq!(kind, ComponentKind::Builder);
                assert_eq!(name, "unknown-xyz");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn builtin_wins_by_default() {
        let registry = Registry::with_defaults();
        assert_eq!(
            registry.resolve(ComponentKind::Builder, "null").unwrap(),
            Resolution::Builtin
        );
    }

    #[cfg(unix)]
    #[test]
    fn prefer_plugins_flips_precedence() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln-builder-null");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut registry = Registry::with_defaults();
        registry.add_plugin_dir(dir.path());

        assert_eq!(
            registry.resolve(ComponentKind::Builder, "null").unwrap(),
            Resolution::Builtin
        );

        registry.prefer_plugins(true);
        assert_eq!(
            registry.resolve(ComponentKind::Builder, "null").unwrap(),
            Resolution::Plugin(path)
        );
    }
}
