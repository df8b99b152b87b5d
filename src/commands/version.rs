use std::sync::Arc;

use async_trait::async_trait;

use crate::core::Command;
use crate::environment::Environment;
use crate::error::CoreError;

pub struct VersionCommand;

#[async_trait]
impl Command for VersionCommand {
    async fn run(&self, env: &Arc<Environment>, _args: &[String]) -> Result<i32, CoreError> {
        env.ui()
            .message(&format!("kiln v{}", env!("CARGO_PKG_VERSION")))
            .await;
        Ok(0)
    }

    async fn synopsis(&self) -> String {
        "print the kiln version".to_string()
    }
}
