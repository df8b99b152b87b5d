//! The `build` command: parse a template, prepare every component with
//! aggregated configuration errors, then run the builds concurrently.
//! One build's failure never aborts its siblings.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::debug;

use crate::core::{
    ArtifactInfo, Builder, Command, ConfigBundle, HOOK_PROVISION, Hook, PostProcessor, Provisioner,
};
use crate::environment::Environment;
use crate::error::CoreError;
use crate::ui::{TargetedUi, Ui};

/// Declarative build template. Component semantics live in the components
/// themselves; the template only names them and carries their bundles.
#[derive(Debug, Deserialize)]
struct Template {
    #[serde(default)]
    builders: Vec<ComponentDef>,
    #[serde(default)]
    provisioners: Vec<ComponentDef>,
    #[serde(default, rename = "post-processors")]
    post_processors: Vec<ComponentDef>,
}

#[derive(Debug, Deserialize)]
struct ComponentDef {
    #[serde(rename = "type")]
    type_name: String,
    /// Display name for the build; defaults to the component type.
    name: Option<String>,
    #[serde(flatten)]
    config: ConfigBundle,
}

impl ComponentDef {
    fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.type_name)
    }
}

/// Fires template provisioners when a builder reaches its provision point.
struct ProvisionHook {
    provisioners: Vec<Box<dyn Provisioner>>,
}

#[async_trait]
impl Hook for ProvisionHook {
    async fn run(&self, name: &str, ui: Arc<dyn Ui>, _data: Value) -> Result<(), CoreError> {
        if name != HOOK_PROVISION {
            return Ok(());
        }
        for provisioner in &self.provisioners {
            provisioner.provision(Arc::clone(&ui)).await?;
        }
        Ok(())
    }
}

/// One prepared, runnable unit of work. The builder is shared so an
/// interrupt can reach it while the run is in flight.
struct BuildUnit {
    name: String,
    builder: Arc<dyn Builder>,
    hook: Arc<dyn Hook>,
    post_processors: Vec<Box<dyn PostProcessor>>,
}

impl std::fmt::Debug for BuildUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildUnit")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl BuildUnit {
    async fn run(&self, ui: Arc<dyn Ui>) -> Result<Option<ArtifactInfo>, CoreError> {
        let mut artifact = self.builder.run(Arc::clone(&ui), Arc::clone(&self.hook)).await?;

        if let Some(current) = artifact.take() {
            let mut current = current;
            for post_processor in &self.post_processors {
                if let Some(replacement) =
                    post_processor.post_process(Arc::clone(&ui), &current).await?
                {
                    current = replacement;
                }
            }
            artifact = Some(current);
        }

        Ok(artifact)
    }
}

pub struct BuildCommand;

impl BuildCommand {
    /// Load and prepare everything the template names. Configuration
    /// problems across all components are aggregated into one report.
    async fn prepare_units(
        env: &Arc<Environment>,
        template: &Template,
    ) -> Result<Vec<BuildUnit>, CoreError> {
        let mut problems = Vec::new();
        let mut units = Vec::new();

        for def in &template.builders {
            let mut builder = match env.load_builder(&def.type_name).await {
                Ok(builder) => builder,
                Err(e) => {
                    problems.push(e.to_string());
                    continue;
                }
            };
            if let Err(e) = builder.prepare(&def.config).await {
                problems.push(format!("builder {:?}: {e}", def.display_name()));
                continue;
            }

            // Each build gets its own provisioner and post-processor
            // instances; their state is per-build.
            let mut provisioners = Vec::new();
            for p_def in &template.provisioners {
                match env.load_provisioner(&p_def.type_name).await {
                    Ok(mut provisioner) => {
                        match provisioner.prepare(std::slice::from_ref(&p_def.config)).await {
                            Ok(()) => provisioners.push(provisioner),
                            Err(e) => problems
                                .push(format!("provisioner {:?}: {e}", p_def.type_name)),
                        }
                    }
                    Err(e) => problems.push(e.to_string()),
                }
            }

            let mut post_processors = Vec::new();
            for pp_def in &template.post_processors {
                match env.load_post_processor(&pp_def.type_name).await {
                    Ok(mut post_processor) => match post_processor.configure(&pp_def.config).await
                    {
                        Ok(()) => post_processors.push(post_processor),
                        Err(e) => problems
                            .push(format!("post-processor {:?}: {e}", pp_def.type_name)),
                    },
                    Err(e) => problems.push(e.to_string()),
                }
            }

            units.push(BuildUnit {
                name: def.display_name().to_string(),
                builder: Arc::from(builder),
                hook: Arc::new(ProvisionHook { provisioners }),
                post_processors,
            });
        }

        if problems.is_empty() {
            Ok(units)
        } else {
            Err(CoreError::Config(problems))
        }
    }
}

#[async_trait]
impl Command for BuildCommand {
    async fn run(&self, env: &Arc<Environment>, args: &[String]) -> Result<i32, CoreError> {
        let Some(template_path) = args.first() else {
            env.ui().error("usage: kiln build <template.json>").await;
            return Ok(1);
        };

        let raw = std::fs::read_to_string(template_path).map_err(|e| {
            CoreError::Config(vec![format!("failed to read template {template_path:?}: {e}")])
        })?;
        let template: Template = serde_json::from_str(&raw).map_err(|e| {
            CoreError::Config(vec![format!("failed to parse template {template_path:?}: {e}")])
        })?;
        if template.builders.is_empty() {
            return Err(CoreError::Validation(vec![
                "template defines no builders".to_string(),
            ]));
        }

        let units = Self::prepare_units(env, &template).await?;
        debug!(builds = units.len(), "template prepared");

        let mut tasks = JoinSet::new();
        let mut running: Vec<Arc<dyn Builder>> = Vec::with_capacity(units.len());
        for unit in units {
            running.push(Arc::clone(&unit.builder));
            let env = Arc::clone(env);
            tasks.spawn(async move {
                let ui: Arc<dyn Ui> = Arc::new(TargetedUi::new(unit.name.clone(), env.ui()));
                ui.say("starting build").await;
                let outcome = unit.run(Arc::clone(&ui)).await;
                (unit.name, ui, outcome)
            });
        }

        // An interrupt mid-run reaches every in-flight builder; the
        // dispatcher separately kills plugin subprocesses.
        let canceller = tokio::spawn({
            let env = Arc::clone(env);
            async move {
                env.cancelled().await;
                for builder in running {
                    builder.cancel().await;
                }
            }
        });

        let mut failed = 0usize;
        let mut artifacts = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (name, ui, outcome) = joined
                .map_err(|e| CoreError::Build(format!("build task panicked: {e}")))?;
            match outcome {
                Ok(Some(artifact)) => {
                    ui.say(&format!(
                        "build finished: {} ({})",
                        artifact.id, artifact.description
                    ))
                    .await;
                    artifacts.push((name, artifact));
                }
                Ok(None) => {
                    ui.say("build finished (no artifact)").await;
                }
                Err(e) => {
                    ui.error(&format!("build failed: {e}")).await;
                    failed += 1;
                }
            }
        }

        canceller.abort();

        for (name, artifact) in &artifacts {
            for file in &artifact.files {
                env.ui().message(&format!("{name}: {file}")).await;
            }
        }

        if env.is_cancelled() {
            return Err(CoreError::Interrupted);
        }
        Ok(if failed == 0 { 0 } else { 1 })
    }

    async fn synopsis(&self) -> String {
        "build images from a template".to_string()
    }
}
