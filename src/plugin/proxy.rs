//! Capability proxies and service adapters for the RPC bridge.
//!
//! Host side: `*Proxy` types implement the capability traits by marshaling
//! each method over a [`Connection`]; before a call that can produce
//! callbacks, the host registers its `ui`/`hook` services on the same
//! connection so the plugin can dial back mid-call.
//!
//! Plugin side: `*Service` adapters expose a concrete component to inbound
//! calls and hand it proxy implementations of [`Ui`] and [`Hook`] that
//! relay to the host.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::RwLock;

use crate::core::{
    ArtifactInfo, Builder, Command, ConfigBundle, Hook, PostProcessor, Provisioner,
};
use crate::environment::Environment;
use crate::error::CoreError;
use crate::plugin::connection::{Connection, Service};
use crate::ui::{Ui, UiEvent};

fn param<T: DeserializeOwned>(params: &Value, key: &str) -> Result<T, CoreError> {
    serde_json::from_value(params.get(key).cloned().unwrap_or(Value::Null))
        .map_err(|e| CoreError::comm(format!("bad parameter {key:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Host-side proxies

pub struct BuilderProxy {
    conn: Arc<Connection>,
}

impl BuilderProxy {
    pub fn new(conn: Arc<Connection>) -> Self {
        BuilderProxy { conn }
    }
}

#[async_trait]
impl Builder for BuilderProxy {
    async fn prepare(&mut self, config: &ConfigBundle) -> Result<(), CoreError> {
        self.conn
            .call("builder", "prepare", json!({ "config": config }))
            .await
            .map(|_| ())
    }

    async fn run(
        &self,
        ui: Arc<dyn Ui>,
        hook: Arc<dyn Hook>,
    ) -> Result<Option<ArtifactInfo>, CoreError> {
        // Callback-server role for the duration of this call.
        self.conn.register("ui", Arc::new(UiService::new(Arc::clone(&ui))));
        self.conn.register("hook", Arc::new(HookService::new(hook, ui)));
        let result = self.conn.call("builder", "run", json!({})).await;
        self.conn.unregister("ui");
        self.conn.unregister("hook");
        param(&result?, "artifact")
    }

    async fn cancel(&self) {
        let _ = self.conn.call("builder", "cancel", json!({})).await;
    }
}

pub struct ProvisionerProxy {
    conn: Arc<Connection>,
}

impl ProvisionerProxy {
    pub fn new(conn: Arc<Connection>) -> Self {
        ProvisionerProxy { conn }
    }
}

#[async_trait]
impl Provisioner for ProvisionerProxy {
    async fn prepare(&mut self, configs: &[ConfigBundle]) -> Result<(), CoreError> {
        self.conn
            .call("provisioner", "prepare", json!({ "configs": configs }))
            .await
            .map(|_| ())
    }

    async fn provision(&self, ui: Arc<dyn Ui>) -> Result<(), CoreError> {
        self.conn.register("ui", Arc::new(UiService::new(ui)));
        let result = self.conn.call("provisioner", "provision", json!({})).await;
        self.conn.unregister("ui");
        result.map(|_| ())
    }
}

pub struct PostProcessorProxy {
    conn: Arc<Connection>,
}

impl PostProcessorProxy {
    pub fn new(conn: Arc<Connection>) -> Self {
        PostProcessorProxy { conn }
    }
}

#[async_trait]
impl PostProcessor for PostProcessorProxy {
    async fn configure(&mut self, config: &ConfigBundle) -> Result<(), CoreError> {
        self.conn
            .call("post-processor", "configure", json!({ "config": config }))
            .await
            .map(|_| ())
    }

    async fn post_process(
        &self,
        ui: Arc<dyn Ui>,
        artifact: &ArtifactInfo,
    ) -> Result<Option<ArtifactInfo>, CoreError> {
        self.conn.register("ui", Arc::new(UiService::new(ui)));
        let result = self
            .conn
            .call("post-processor", "post_process", json!({ "artifact": artifact }))
            .await;
        self.conn.unregister("ui");
        param(&result?, "artifact")
    }
}

pub struct HookProxy {
    conn: Arc<Connection>,
}

impl HookProxy {
    pub fn new(conn: Arc<Connection>) -> Self {
        HookProxy { conn }
    }
}

#[async_trait]
impl Hook for HookProxy {
    async fn run(&self, name: &str, ui: Arc<dyn Ui>, data: Value) -> Result<(), CoreError> {
        self.conn.register("ui", Arc::new(UiService::new(ui)));
        let result = self
            .conn
            .call("hook", "run", json!({ "name": name, "data": data }))
            .await;
        self.conn.unregister("ui");
        result.map(|_| ())
    }
}

pub struct CommandProxy {
    conn: Arc<Connection>,
}

impl CommandProxy {
    pub fn new(conn: Arc<Connection>) -> Self {
        CommandProxy { conn }
    }
}

#[async_trait]
impl Command for CommandProxy {
    async fn run(&self, env: &Arc<Environment>, args: &[String]) -> Result<i32, CoreError> {
        self.conn.register("ui", Arc::new(UiService::new(env.ui())));
        let result = self
            .conn
            .call("command", "run", json!({ "args": args }))
            .await;
        self.conn.unregister("ui");
        param(&result?, "code")
    }

    async fn synopsis(&self) -> String {
        match self.conn.call("command", "synopsis", json!({})).await {
            Ok(result) => param::<String>(&result, "synopsis").unwrap_or_default(),
            Err(_) => String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Callback services the host exposes to plugins

/// Relays inbound `ui.*` calls to the host's UI sink.
pub struct UiService {
    ui: Arc<dyn Ui>,
}

impl UiService {
    pub fn new(ui: Arc<dyn Ui>) -> Self {
        UiService { ui }
    }
}

#[async_trait]
impl Service for UiService {
    async fn call(&self, method: &str, params: Value) -> Result<Value, CoreError> {
        match method {
            "event" => {
                let event: UiEvent = param(&params, "event")?;
                self.ui.event(event).await;
                Ok(Value::Null)
            }
            "ask" => {
                let query: String = param(&params, "query")?;
                let answer = self.ui.ask(&query).await?;
                Ok(json!({ "answer": answer }))
            }
            other => Err(CoreError::comm(format!("unknown ui method {other:?}"))),
        }
    }
}

/// Relays inbound `hook.run` calls to a host-held hook, injecting the
/// host's UI (the plugin's own UI handle does not cross the wire).
pub struct HookService {
    hook: Arc<dyn Hook>,
    ui: Arc<dyn Ui>,
}

impl HookService {
    pub fn new(hook: Arc<dyn Hook>, ui: Arc<dyn Ui>) -> Self {
        HookService { hook, ui }
    }
}

#[async_trait]
impl Service for HookService {
    async fn call(&self, method: &str, params: Value) -> Result<Value, CoreError> {
        match method {
            "run" => {
                let name: String = param(&params, "name")?;
                let data = params.get("data").cloned().unwrap_or(Value::Null);
                self.hook.run(&name, Arc::clone(&self.ui), data).await?;
                Ok(Value::Null)
            }
            other => Err(CoreError::comm(format!("unknown hook method {other:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Plugin-side proxies back into the host

/// [`Ui`] implementation that relays every event to the host.
pub struct UiProxy {
    conn: Arc<Connection>,
}

impl UiProxy {
    pub fn new(conn: Arc<Connection>) -> Self {
        UiProxy { conn }
    }
}

#[async_trait]
impl Ui for UiProxy {
    async fn event(&self, event: UiEvent) {
        // Output is best effort once the transport is gone.
        let _ = self.conn.call("ui", "event", json!({ "event": event })).await;
    }

    async fn ask(&self, query: &str) -> Result<String, CoreError> {
        let result = self.conn.call("ui", "ask", json!({ "query": query })).await?;
        param(&result, "answer")
    }
}

// ---------------------------------------------------------------------------
// Plugin-side service adapters exposing concrete components

pub struct BuilderHostService {
    inner: RwLock<Box<dyn Builder>>,
    conn: Arc<Connection>,
}

impl BuilderHostService {
    pub fn new(inner: Box<dyn Builder>, conn: Arc<Connection>) -> Self {
        BuilderHostService {
            inner: RwLock::new(inner),
            conn,
        }
    }
}

#[async_trait]
impl Service for BuilderHostService {
    async fn call(&self, method: &str, params: Value) -> Result<Value, CoreError> {
        match method {
            "prepare" => {
                let config: ConfigBundle = param(&params, "config")?;
                self.inner.write().await.prepare(&config).await?;
                Ok(Value::Null)
            }
            "run" => {
                let ui: Arc<dyn Ui> = Arc::new(UiProxy::new(Arc::clone(&self.conn)));
                let hook: Arc<dyn Hook> = Arc::new(HookProxy::new(Arc::clone(&self.conn)));
                // Read lock so a concurrent `cancel` is still serviceable.
                let artifact = self.inner.read().await.run(ui, hook).await?;
                Ok(json!({ "artifact": artifact }))
            }
            "cancel" => {
                self.inner.read().await.cancel().await;
                Ok(Value::Null)
            }
            other => Err(CoreError::comm(format!("unknown builder method {other:?}"))),
        }
    }
}

pub struct ProvisionerHostService {
    inner: RwLock<Box<dyn Provisioner>>,
    conn: Arc<Connection>,
}

impl ProvisionerHostService {
    pub fn new(inner: Box<dyn Provisioner>, conn: Arc<Connection>) -> Self {
        ProvisionerHostService {
            inner: RwLock::new(inner),
            conn,
        }
    }
}

#[async_trait]
impl Service for ProvisionerHostService {
    async fn call(&self, method: &str, params: Value) -> Result<Value, CoreError> {
        match method {
            "prepare" => {
                let configs: Vec<ConfigBundle> = param(&params, "configs")?;
                self.inner.write().await.prepare(&configs).await?;
                Ok(Value::Null)
            }
            "provision" => {
                let ui: Arc<dyn Ui> = Arc::new(UiProxy::new(Arc::clone(&self.conn)));
                self.inner.read().await.provision(ui).await?;
                Ok(Value::Null)
            }
            other => Err(CoreError::comm(format!(
                "unknown provisioner method {other:?}"
            ))),
        }
    }
}

pub struct PostProcessorHostService {
    inner: RwLock<Box<dyn PostProcessor>>,
    conn: Arc<Connection>,
}

impl PostProcessorHostService {
    pub fn new(inner: Box<dyn PostProcessor>, conn: Arc<Connection>) -> Self {
        PostProcessorHostService {
            inner: RwLock::new(inner),
            conn,
        }
    }
}

#[async_trait]
impl Service for PostProcessorHostService {
    async fn call(&self, method: &str, params: Value) -> Result<Value, CoreError> {
        match method {
            "configure" => {
                let config: ConfigBundle = param(&params, "config")?;
                self.inner.write().await.configure(&config).await?;
                Ok(Value::Null)
            }
            "post_process" => {
                let artifact: ArtifactInfo = param(&params, "artifact")?;
                let ui: Arc<dyn Ui> = Arc::new(UiProxy::new(Arc::clone(&self.conn)));
                let out = self
                    .inner
                    .read()
                    .await
                    .post_process(ui, &artifact)
                    .await?;
                Ok(json!({ "artifact": out }))
            }
            other => Err(CoreError::comm(format!(
                "unknown post-processor method {other:?}"
            ))),
        }
    }
}

/// Exposes a plugin-implemented command. The command runs against a
/// plugin-local environment whose UI relays to the launching host.
pub struct CommandHostService {
    inner: Box<dyn Command>,
    conn: Arc<Connection>,
}

impl CommandHostService {
    pub fn new(inner: Box<dyn Command>, conn: Arc<Connection>) -> Self {
        CommandHostService { inner, conn }
    }
}

#[async_trait]
impl Service for CommandHostService {
    async fn call(&self, method: &str, params: Value) -> Result<Value, CoreError> {
        match method {
            "run" => {
                let args: Vec<String> = param(&params, "args")?;
                let ui: Arc<dyn Ui> = Arc::new(UiProxy::new(Arc::clone(&self.conn)));
                let env = Environment::new(crate::environment::EnvironmentConfig {
                    ui,
                    ..Default::default()
                });
                let code = self.inner.run(&env, &args).await;
                env.cleanup().await;
                Ok(json!({ "code": code? }))
            }
            "synopsis" => Ok(json!({ "synopsis": self.inner.synopsis().await })),
            other => Err(CoreError::comm(format!("unknown command method {other:?}"))),
        }
    }
}

pub struct HookHostService {
    inner: Arc<dyn Hook>,
    conn: Arc<Connection>,
}

impl HookHostService {
    pub fn new(inner: Arc<dyn Hook>, conn: Arc<Connection>) -> Self {
        HookHostService { inner, conn }
    }
}

#[async_trait]
impl Service for HookHostService {
    async fn call(&self, method: &str, params: Value) -> Result<Value, CoreError> {
        match method {
            "run" => {
                let name: String = param(&params, "name")?;
                let data = params.get("data").cloned().unwrap_or(Value::Null);
                let ui: Arc<dyn Ui> = Arc::new(UiProxy::new(Arc::clone(&self.conn)));
                self.inner.run(&name, ui, data).await?;
                Ok(Value::Null)
            }
            other => Err(CoreError::comm(format!("unknown hook method {other:?}"))),
        }
    }
}
