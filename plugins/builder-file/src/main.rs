//! File builder plugin: "builds" an image by writing its contents to a
//! file on disk. Exists to exercise the full plugin path (handshake, RPC,
//! UI callbacks, provision hook) with a verifiable side effect.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use kiln::core::{ArtifactInfo, Builder, ConfigBundle, HOOK_PROVISION, Hook};
use kiln::error::CoreError;
use kiln::plugin::{ServeComponents, serve};
use kiln::ui::Ui;

const BUILDER_ID: &str = "file";

#[derive(Default)]
struct FileBuilder {
    target: PathBuf,
    content: String,
}

#[async_trait]
impl Builder for FileBuilder {
    async fn prepare(&mut self, config: &ConfigBundle) -> Result<(), CoreError> {
        let mut problems = Vec::new();

        match config.get("target") {
            Some(Value::String(target)) if !target.is_empty() => {
                self.target = PathBuf::from(target);
            }
            Some(Value::String(_)) => problems.push("`target` must not be empty".to_string()),
            Some(_) => problems.push("`target` must be a string".to_string()),
            None => problems.push("missing required field `target`".to_string()),
        }

        match config.get("content") {
            Some(Value::String(content)) => self.content = content.clone(),
            Some(_) => problems.push("`content` must be a string".to_string()),
            None => problems.push("missing required field `content`".to_string()),
        }

        for key in config.keys() {
            if key != "target" && key != "content" {
                problems.push(format!("unknown field `{key}`"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Config(problems))
        }
    }

    async fn run(
        &self,
        ui: Arc<dyn Ui>,
        hook: Arc<dyn Hook>,
    ) -> Result<Option<ArtifactInfo>, CoreError> {
        ui.say(&format!("writing {}", self.target.display())).await;

        if let Some(parent) = self.target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.target, &self.content).await?;
        debug!(path = %self.target.display(), bytes = self.content.len(), "artifact written");

        hook.run(HOOK_PROVISION, Arc::clone(&ui), Value::Null).await?;

        let target = self.target.display().to_string();
        ui.say(&format!("wrote {} bytes", self.content.len())).await;
        Ok(Some(ArtifactInfo {
            builder_id: BUILDER_ID.to_string(),
            files: vec![target.clone()],
            id: target,
            description: "file image".to_string(),
        }))
    }

    async fn cancel(&self) {}
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = serve(ServeComponents::builder(FileBuilder::default())).await {
        eprintln!("{e}");
        std::process::exit(1);
    }
    Ok(())
}
