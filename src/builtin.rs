//! Built-in components that run in-process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{ArtifactInfo, Builder, ConfigBundle, HOOK_PROVISION, Hook};
use crate::error::CoreError;
use crate::ui::Ui;

/// A builder that produces an artifact without touching any real
/// infrastructure. Useful for template debugging and as the in-process
/// reference implementation.
pub struct NullBuilder {
    image_name: String,
    files: Vec<String>,
    cancelled: AtomicBool,
}

impl NullBuilder {
    pub fn new() -> Self {
        NullBuilder {
            image_name: String::new(),
            files: Vec::new(),
            cancelled: AtomicBool::new(false),
        }
    }
}

impl Default for NullBuilder {
    fn default() -> Self {
        NullBuilder::new()
    }
}

#[async_trait]
impl Builder for NullBuilder {
    async fn prepare(&mut self, config: &ConfigBundle) -> Result<(), CoreError> {
        let mut problems = Vec::new();

        match config.get("image_name") {
            Some(Value::String(name)) if !name.is_empty() => {
                self.image_name = name.clone();
            }
            Some(Value::String(_)) => {
                problems.push("`image_name` must not be empty".to_string());
            }
            Some(_) => problems.push("`image_name` must be a string".to_string()),
            None => problems.push("missing required field `image_name`".to_string()),
        }

        if let Some(files) = config.get("files") {
            match files {
                Value::Array(items) => {
                    for (i, item) in items.iter().enumerate() {
                        match item {
                            Value::String(f) => self.files.push(f.clone()),
                            _ => problems.push(format!("`files[{i}]` must be a string")),
                        }
                    }
                }
                _ => problems.push("`files` must be a list of strings".to_string()),
            }
        }

        for key in config.keys() {
            if key != "image_name" && key != "files" {
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
        ui.say(&format!("creating image {}", self.image_name)).await;

        hook.run(HOOK_PROVISION, Arc::clone(&ui), Value::Null).await?;
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(CoreError::Interrupted);
        }

        ui.say(&format!("image {} ready", self.image_name)).await;
        Ok(Some(ArtifactInfo {
            builder_id: "null".to_string(),
            files: self.files.clone(),
            id: self.image_name.clone(),
            description: format!("null image {}", self.image_name),
        }))
    }

    async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NoopHook;
    use crate::ui::UiEvent;
    use std::sync::Mutex;

    struct SilentUi;

    #[async_trait]
    impl Ui for SilentUi {
        async fn event(&self, _event: UiEvent) {}
        async fn ask(&self, _query: &str) -> Result<String, CoreError> {
            Ok(String::new())
        }
    }

    fn config(json: Value) -> ConfigBundle {
        match json {
            Value::Object(map) => map,
            _ => panic!("config must be an object"),
        }
    }

    #[tokio::test]
    async fn prepare_aggregates_every_problem() {
        let mut builder = NullBuilder::new();
        // Missing required field plus one wrong-typed field: the report
        // must name both.
        let err = builder
            .prepare(&config(serde_json::json!({"files": "not-a-list"})))
            .await
            .unwrap_err();
        match err {
            CoreError::Config(problems) => {
                assert_eq!(problems.len(), 2);
                assert!(problems.iter().any(|p| p.contains("image_name")));
                assert!(problems.iter().any(|p| p.contains("files")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn prepare_rejects_unknown_fields() {
        let mut builder = NullBuilder::new();
        let err = builder
            .prepare(&config(serde_json::json!({
                "image_name": "web",
                "flavor": "large"
            })))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown field `flavor`"));
    }

    #[tokio::test]
    async fn run_fires_the_provision_hook_and_returns_an_artifact() {
        struct CountingHook(Mutex<u32>);
        #[async_trait]
        impl Hook for CountingHook {
            async fn run(
                &self,
                name: &str,
                _ui: Arc<dyn Ui>,
                _data: Value,
            ) -> Result<(), CoreError> {
                assert_eq!(name, HOOK_PROVISION);
                *self.0.lock().unwrap() += 1;
                Ok(())
            }
        }

        let mut builder = NullBuilder::new();
        builder
            .prepare(&config(serde_json::json!({"image_name": "web"})))
            .await
            .unwrap();

        let hook = Arc::new(CountingHook(Mutex::new(0)));
        let artifact = builder
            .run(Arc::new(SilentUi), Arc::clone(&hook) as Arc<dyn Hook>)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(artifact.id, "web");
        assert_eq!(*hook.0.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_run_reports_interruption() {
        let mut builder = NullBuilder::new();
        builder
            .prepare(&config(serde_json::json!({"image_name": "web"})))
            .await
            .unwrap();
        builder.cancel().await;

        let err = builder
            .run(Arc::new(SilentUi), Arc::new(NoopHook))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Interrupted));
    }
}
