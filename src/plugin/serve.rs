//! Plugin-side entry point.
//!
//! A plugin executable hands its components to [`serve`], which refuses to
//! run unless launched by a compatible host (magic cookie), binds an
//! ephemeral local listener, announces it with the one-line handshake on
//! stdout, and services a single host connection until it closes.

use std::io::Write;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::debug;

use crate::core::{Builder, Command, Hook, PostProcessor, Provisioner};
use crate::error::CoreError;
use crate::plugin::connection::Connection;
use crate::plugin::protocol::{
    HandshakeInfo, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, PROTOCOL_VERSION,
};
use crate::plugin::proxy::{
    BuilderHostService, CommandHostService, HookHostService, PostProcessorHostService,
    ProvisionerHostService,
};

/// The components one plugin executable exposes. A binary usually exposes
/// exactly one, but nothing prevents bundling.
#[derive(Default)]
pub struct ServeComponents {
    pub builder: Option<Box<dyn Builder>>,
    pub provisioner: Option<Box<dyn Provisioner>>,
    pub post_processor: Option<Box<dyn PostProcessor>>,
    pub hook: Option<Arc<dyn Hook>>,
    pub command: Option<Box<dyn Command>>,
}

impl ServeComponents {
    pub fn builder(builder: impl Builder + 'static) -> Self {
        ServeComponents {
            builder: Some(Box::new(builder)),
            ..Default::default()
        }
    }

    pub fn provisioner(provisioner: impl Provisioner + 'static) -> Self {
        ServeComponents {
            provisioner: Some(Box::new(provisioner)),
            ..Default::default()
        }
    }

    pub fn post_processor(post_processor: impl PostProcessor + 'static) -> Self {
        ServeComponents {
            post_processor: Some(Box::new(post_processor)),
            ..Default::default()
        }
    }

    pub fn hook(hook: impl Hook + 'static) -> Self {
        ServeComponents {
            hook: Some(Arc::new(hook)),
            ..Default::default()
        }
    }

    pub fn command(command: impl Command + 'static) -> Self {
        ServeComponents {
            command: Some(Box::new(command)),
            ..Default::default()
        }
    }
}

/// Serve the given components to the host that launched this process.
/// Returns once the host disconnects.
pub async fn serve(components: ServeComponents) -> Result<(), CoreError> {
    if std::env::var(MAGIC_COOKIE_KEY).as_deref() != Ok(MAGIC_COOKIE_VALUE) {
        return Err(CoreError::Validation(vec![format!(
            "this binary is a kiln plugin and is not meant to be run directly; \
             it is launched automatically by kiln (missing {MAGIC_COOKIE_KEY})"
        )]));
    }

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;

    // The handshake line must be the first thing on stdout; everything
    // after it is treated by the host as diagnostic text.
    let handshake = HandshakeInfo {
        version: PROTOCOL_VERSION,
        network: "tcp".to_string(),
        address: address.to_string(),
    };
    {
        let mut stdout = std::io::stdout();
        writeln!(stdout, "{}", handshake.to_line())?;
        stdout.flush()?;
    }

    let (stream, peer) = listener.accept().await?;
    debug!(%peer, "host connected");
    let conn = Connection::new(stream);

    if let Some(builder) = components.builder {
        conn.register(
            "builder",
            Arc::new(BuilderHostService::new(builder, Arc::clone(&conn))),
        );
    }
    if let Some(provisioner) = components.provisioner {
        conn.register(
            "provisioner",
            Arc::new(ProvisionerHostService::new(provisioner, Arc::clone(&conn))),
        );
    }
    if let Some(post_processor) = components.post_processor {
        conn.register(
            "post-processor",
            Arc::new(PostProcessorHostService::new(
                post_processor,
                Arc::clone(&conn),
            )),
        );
    }
    if let Some(hook) = components.hook {
        conn.register("hook", Arc::new(HookHostService::new(hook, Arc::clone(&conn))));
    }
    if let Some(command) = components.command {
        conn.register(
            "command",
            Arc::new(CommandHostService::new(command, Arc::clone(&conn))),
        );
    }

    conn.wait_closed().await;
    debug!("host disconnected, shutting down");
    Ok(())
}
