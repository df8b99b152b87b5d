//! Composition root: resolves CLI invocations to commands, loads components
//! through the registry, and guarantees that every plugin subprocess
//! started during a run is terminated however the run ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::{Cache, FileCache};
use crate::core::{Builder, Command, ComponentKind, Hook, PostProcessor, Provisioner};
use crate::error::CoreError;
use crate::plugin::client::PluginClient;
use crate::plugin::connection::Connection;
use crate::plugin::proxy::{
    BuilderProxy, CommandProxy, HookProxy, PostProcessorProxy, ProvisionerProxy,
};
use crate::registry::{Registry, Resolution};
use crate::ui::{Ui, WriterUi};

/// Everything needed to assemble an [`Environment`]. `Default` gives the
/// standard CLI wiring.
pub struct EnvironmentConfig {
    pub registry: Registry,
    pub ui: Arc<dyn Ui>,
    pub cache: Arc<dyn Cache>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        EnvironmentConfig {
            registry: Registry::with_defaults(),
            ui: Arc::new(WriterUi::stdout()),
            cache: Arc::new(FileCache::new("kiln_cache")),
        }
    }
}

pub struct Environment {
    registry: Registry,
    ui: Arc<dyn Ui>,
    cache: Arc<dyn Cache>,
    /// Every plugin client started during this run, keyed by client id.
    /// Entries are added before first use and removed only after the
    /// subprocess is confirmed terminated.
    clients: Mutex<HashMap<u64, Arc<PluginClient>>>,
    cancelled: AtomicBool,
    cancel_tx: watch::Sender<bool>,
}

impl Environment {
    pub fn new(config: EnvironmentConfig) -> Arc<Environment> {
        Arc::new(Environment {
            registry: config.registry,
            ui: config.ui,
            cache: config.cache,
            clients: Mutex::new(HashMap::new()),
            cancelled: AtomicBool::new(false),
            cancel_tx: watch::channel(false).0,
        })
    }

    pub fn ui(&self) -> Arc<dyn Ui> {
        Arc::clone(&self.ui)
    }

    pub fn cache(&self) -> Arc<dyn Cache> {
        Arc::clone(&self.cache)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once [`Environment::cancel`] has been called. Lets a command
    /// propagate the interrupt to work it has in flight.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolve the first argument to a command and run it. Returns the
    /// process exit code; cleanup has already run when this returns.
    pub async fn run(self: &Arc<Self>, args: &[String]) -> i32 {
        let code = match self.dispatch(args).await {
            Ok(code) => code,
            Err(e) => {
                self.ui.error(&e.to_string()).await;
                1
            }
        };
        self.cleanup().await;
        code
    }

    async fn dispatch(self: &Arc<Self>, args: &[String]) -> Result<i32, CoreError> {
        let Some(name) = args.first() else {
            self.usage().await;
            return Ok(1);
        };

        let command = match self.load_command(name).await {
            Ok(command) => command,
            Err(CoreError::ComponentNotFound { .. }) => {
                self.ui.error(&format!("unknown command {name:?}")).await;
                self.usage().await;
                return Ok(1);
            }
            Err(e) => return Err(e),
        };

        command.run(self, &args[1..]).await
    }

    async fn usage(&self) {
        self.ui.say("usage: kiln [options] <command> [args]").await;
        self.ui.say("available commands:").await;
        for name in self.registry.command_names() {
            if let Some(command) = self.registry.new_builtin_command(&name) {
                let synopsis = command.synopsis().await;
                self.ui.message(&format!("    {name:<12} {synopsis}")).await;
            }
        }
    }

    /// Kill every tracked plugin client. Idempotent; safe to call from the
    /// normal completion path and again from an interrupt path. Individual
    /// kill failures are logged, never escalated.
    pub async fn cleanup(&self) {
        let snapshot: Vec<(u64, Arc<PluginClient>)> = {
            let clients = self.clients.lock().expect("client set poisoned");
            clients.iter().map(|(id, c)| (*id, Arc::clone(c))).collect()
        };

        for (id, client) in snapshot {
            debug!(plugin = %client.path().display(), "cleaning up plugin client");
            client.kill().await;
            // Terminated (or never started); safe to drop from the set.
            self.clients.lock().expect("client set poisoned").remove(&id);
        }
    }

    /// Operator-requested abort: stop accepting new plugin launches and
    /// kill everything already tracked.
    pub async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.cancel_tx.send(true);
        warn!("interrupt received, cleaning up plugins");
        self.cleanup().await;
    }

    /// Number of tracked clients whose subprocess may still be alive.
    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().expect("client set poisoned").len()
    }

    /// Launch a plugin executable and return its live connection. The
    /// client joins the cleanup set before it is started.
    async fn launch(&self, path: std::path::PathBuf) -> Result<Arc<Connection>, CoreError> {
        if self.is_cancelled() {
            return Err(CoreError::Interrupted);
        }

        let client = Arc::new(PluginClient::new(path));
        let id = client.id();
        self.clients
            .lock()
            .expect("client set poisoned")
            .insert(id, Arc::clone(&client));

        if let Err(e) = client.start().await {
            // start() never leaves a subprocess behind on failure.
            self.clients.lock().expect("client set poisoned").remove(&id);
            return Err(e);
        }
        client.connection().await
    }

    pub async fn load_builder(&self, name: &str) -> Result<Box<dyn Builder>, CoreError> {
        match self.registry.resolve(ComponentKind::Builder, name)? {
            Resolution::Builtin => Ok(self
                .registry
                .new_builtin_builder(name)
                .expect("resolved builtin must exist")),
            Resolution::Plugin(path) => {
                let conn = self.launch(path).await?;
                Ok(Box::new(BuilderProxy::new(conn)))
            }
        }
    }

    pub async fn load_provisioner(&self, name: &str) -> Result<Box<dyn Provisioner>, CoreError> {
        match self.registry.resolve(ComponentKind::Provisioner, name)? {
            Resolution::Builtin => Ok(self
                .registry
                .new_builtin_provisioner(name)
                .expect("resolved builtin must exist")),
            Resolution::Plugin(path) => {
                let conn = self.launch(path).await?;
                Ok(Box::new(ProvisionerProxy::new(conn)))
            }
        }
    }

    pub async fn load_post_processor(
        &self,
        name: &str,
    ) -> Result<Box<dyn PostProcessor>, CoreError> {
        match self.registry.resolve(ComponentKind::PostProcessor, name)? {
            Resolution::Builtin => Ok(self
                .registry
                .new_builtin_post_processor(name)
                .expect("resolved builtin must exist")),
            Resolution::Plugin(path) => {
                let conn = self.launch(path).await?;
                Ok(Box::new(PostProcessorProxy::new(conn)))
            }
        }
    }

    pub async fn load_hook(&self, name: &str) -> Result<Arc<dyn Hook>, CoreError> {
        match self.registry.resolve(ComponentKind::Hook, name)? {
            Resolution::Builtin => Ok(self
                .registry
                .new_builtin_hook(name)
                .expect("resolved builtin must exist")),
            Resolution::Plugin(path) => {
                let conn = self.launch(path).await?;
                Ok(Arc::new(HookProxy::new(conn)))
            }
        }
    }

    pub async fn load_command(&self, name: &str) -> Result<Box<dyn Command>, CoreError> {
        match self.registry.resolve(ComponentKind::Command, name)? {
            Resolution::Builtin => Ok(self
                .registry
                .new_builtin_command(name)
                .expect("resolved builtin must exist")),
            Resolution::Plugin(path) => {
                let conn = self.launch(path).await?;
                Ok(Box::new(CommandProxy::new(conn)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::{UiEvent, UiEventKind};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    pub(crate) struct RecordingUi {
        pub events: StdMutex<Vec<UiEvent>>,
    }

    impl RecordingUi {
        pub fn new() -> Self {
            RecordingUi {
                events: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Ui for RecordingUi {
        async fn event(&self, event: UiEvent) {
            self.events.lock().unwrap().push(event);
        }

        async fn ask(&self, _query: &str) -> Result<String, CoreError> {
            Ok(String::new())
        }
    }

    fn test_env(ui: Arc<RecordingUi>) -> Arc<Environment> {
        let dir = std::env::temp_dir().join("kiln-test-cache");
        Environment::new(EnvironmentConfig {
            registry: Registry::with_defaults(),
            ui,
            cache: Arc::new(FileCache::new(dir)),
        })
    }

    #[tokio::test]
    async fn unknown_component_spawns_nothing() {
        let env = test_env(Arc::new(RecordingUi::new()));
        let err = env.load_builder("unknown-xyz").await.unwrap_err();
        assert!(matches!(err, CoreError::ComponentNotFound { .. }));
        assert_eq!(env.tracked_clients(), 0);
    }

    #[tokio::test]
    async fn builtin_builder_loads_in_process() {
        let env = test_env(Arc::new(RecordingUi::new()));
        env.load_builder("null").await.unwrap();
        assert_eq!(env.tracked_clients(), 0);
    }

    #[tokio::test]
    async fn missing_command_prints_usage_and_fails() {
        let ui = Arc::new(RecordingUi::new());
        let env = test_env(Arc::clone(&ui));
        let code = env.run(&[]).await;
        assert_eq!(code, 1);
        let events = ui.events.lock().unwrap();
        assert!(events.iter().any(|e| e.data.iter().any(|d| d.contains("usage"))));
    }

    #[tokio::test]
    async fn unknown_command_fails_without_spawning() {
        let ui = Arc::new(RecordingUi::new());
        let env = test_env(Arc::clone(&ui));
        let code = env.run(&["definitely-not-a-command".to_string()]).await;
        assert_eq!(code, 1);
        assert_eq!(env.tracked_clients(), 0);
        let events = ui.events.lock().unwrap();
        assert!(
            events
                .iter()
                .any(|e| e.kind == UiEventKind::Error
                    && e.data.iter().any(|d| d.contains("unknown command")))
        );
    }

    #[tokio::test]
    async fn cancelled_environment_refuses_new_launches() {
        let ui = Arc::new(RecordingUi::new());
        let env = test_env(ui);
        env.cancel().await;

        // Even a discoverable plugin must not be launched once cancelled;
        // use a builtin-free name against a registry with a plugin dir.
        let err = env.launch(std::path::PathBuf::from("/nonexistent")).await;
        assert!(matches!(err, Err(CoreError::Interrupted)));
        assert_eq!(env.tracked_clients(), 0);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let env = test_env(Arc::new(RecordingUi::new()));
        env.cleanup().await;
        env.cleanup().await;
        assert_eq!(env.tracked_clients(), 0);
    }
}
