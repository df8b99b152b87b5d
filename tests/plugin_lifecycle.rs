//! Plugin client lifecycle tests against fake plugins implemented as
//! shell scripts, so every handshake edge case is exercised without
//! depending on a compiled plugin binary.

#![cfg(unix)]

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kiln::error::{CoreError, LaunchErrorKind};
use kiln::plugin::PluginClient;

/// Write an executable script into `dir` and return its path.
fn fake_plugin(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A listener standing in for the server a real plugin would bind.
fn local_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[tokio::test]
async fn well_formed_handshake_reaches_connected() {
    let dir = tempfile::tempdir().unwrap();
    let (listener, port) = local_listener();
    // The script refuses to run without the cookie, like a real plugin.
    let path = fake_plugin(
        &dir,
        "kiln-builder-fake",
        &format!(
            "[ -n \"$KILN_PLUGIN_MAGIC_COOKIE\" ] || exit 9\n\
             echo '1|tcp|127.0.0.1:{port}'\n\
             sleep 30"
        ),
    );

    let accepted = std::thread::spawn(move || listener.accept());

    let client = PluginClient::new(&path);
    client.start().await.unwrap();
    assert_eq!(client.address().await.unwrap(), format!("127.0.0.1:{port}"));
    accepted.join().unwrap().unwrap();

    // start() is idempotent while connected.
    client.start().await.unwrap();

    client.kill().await;
    assert!(client.exited().await);
}

#[tokio::test]
async fn silent_plugin_times_out_and_leaves_no_subprocess() {
    let dir = tempfile::tempdir().unwrap();
    let path = fake_plugin(&dir, "kiln-builder-silent", "sleep 30");

    let client =
        PluginClient::new(&path).with_handshake_timeout(Duration::from_millis(300));
    let err = client.start().await.unwrap_err();
    match err {
        CoreError::PluginLaunch { kind, .. } => assert_eq!(kind, LaunchErrorKind::Timeout),
        other => panic!("unexpected error: {other}"),
    }
    // The failed start must not leak the subprocess.
    assert!(client.exited().await);
}

#[tokio::test]
async fn garbage_handshake_line_is_a_protocol_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = fake_plugin(&dir, "kiln-builder-garbage", "echo 'hello world'; sleep 30");

    let client = PluginClient::new(&path);
    let err = client.start().await.unwrap_err();
    match err {
        CoreError::PluginLaunch { kind, .. } => {
            assert_eq!(kind, LaunchErrorKind::Protocol)
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(client.exited().await);
}

#[tokio::test]
async fn version_mismatch_is_a_protocol_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = fake_plugin(
        &dir,
        "kiln-builder-old",
        "echo '99|tcp|127.0.0.1:1'; sleep 30",
    );

    let client = PluginClient::new(&path);
    let err = client.start().await.unwrap_err();
    assert!(err.to_string().contains("protocol 99"), "got: {err}");
}

#[tokio::test]
async fn unreachable_address_is_a_connect_error() {
    let dir = tempfile::tempdir().unwrap();
    // Bind and immediately drop a listener so the port is free but dead.
    let port = {
        let (listener, port) = local_listener();
        drop(listener);
        port
    };
    let path = fake_plugin(
        &dir,
        "kiln-builder-dead",
        &format!("echo '1|tcp|127.0.0.1:{port}'; sleep 30"),
    );

    let client = PluginClient::new(&path);
    let err = client.start().await.unwrap_err();
    match err {
        CoreError::PluginLaunch { kind, .. } => assert_eq!(kind, LaunchErrorKind::Connect),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn missing_executable_is_not_found() {
    let client = PluginClient::new("/nonexistent/kiln-builder-nope");
    let err = client.start().await.unwrap_err();
    match err {
        CoreError::PluginLaunch { kind, .. } => assert_eq!(kind, LaunchErrorKind::NotFound),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn kill_is_idempotent_and_close_after_kill_is_safe() {
    let dir = tempfile::tempdir().unwrap();
    let (listener, port) = local_listener();
    let path = fake_plugin(
        &dir,
        "kiln-builder-fake",
        &format!("echo '1|tcp|127.0.0.1:{port}'; sleep 30"),
    );

    let accepted = std::thread::spawn(move || listener.accept());
    let client = Arc::new(PluginClient::new(&path));
    client.start().await.unwrap();
    accepted.join().unwrap().unwrap();

    client.kill().await;
    client.kill().await;
    client.close().await;
    assert!(client.exited().await);

    // The connection is gone for good.
    let err = client.connection().await.unwrap_err();
    assert!(err.is_transport());
}

#[tokio::test]
async fn kill_from_another_task_does_not_race() {
    let dir = tempfile::tempdir().unwrap();
    let (listener, port) = local_listener();
    let path = fake_plugin(
        &dir,
        "kiln-builder-fake",
        &format!("echo '1|tcp|127.0.0.1:{port}'; sleep 30"),
    );

    let accepted = std::thread::spawn(move || listener.accept());
    let client = Arc::new(PluginClient::new(&path));
    client.start().await.unwrap();
    accepted.join().unwrap().unwrap();

    // Normal completion racing an interrupt path.
    let a = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.kill().await }
    });
    let b = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.kill().await }
    });
    a.await.unwrap();
    b.await.unwrap();
    assert!(client.exited().await);
}

#[tokio::test]
async fn environment_cleanup_terminates_every_launched_plugin() {
    use kiln::cache::FileCache;
    use kiln::environment::{Environment, EnvironmentConfig};
    use kiln::registry::Registry;
    use kiln::ui::{Ui, UiEvent};

    struct SilentUi;

    #[async_trait::async_trait]
    impl Ui for SilentUi {
        async fn event(&self, _event: UiEvent) {}
        async fn ask(&self, _query: &str) -> Result<String, CoreError> {
            Ok(String::new())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let (listener, port) = local_listener();
    fake_plugin(
        &dir,
        "kiln-builder-sleepy",
        &format!("echo '1|tcp|127.0.0.1:{port}'; sleep 30"),
    );
    let accepted = std::thread::spawn(move || listener.accept());

    let mut registry = Registry::with_defaults();
    registry.add_plugin_dir(dir.path());
    let env = Environment::new(EnvironmentConfig {
        registry,
        ui: Arc::new(SilentUi),
        cache: Arc::new(FileCache::new(dir.path().join("cache"))),
    });

    let _builder = env.load_builder("sleepy").await.unwrap();
    accepted.join().unwrap().unwrap();
    assert_eq!(env.tracked_clients(), 1);

    env.cleanup().await;
    assert_eq!(env.tracked_clients(), 0);
    // Interrupt path after normal completion must be harmless.
    env.cancel().await;
    assert_eq!(env.tracked_clients(), 0);
}

#[tokio::test]
async fn plugin_death_after_handshake_fails_the_next_call() {
    let dir = tempfile::tempdir().unwrap();
    let (listener, port) = local_listener();
    // Exits with status 1 right after the handshake, before servicing
    // anything.
    let path = fake_plugin(
        &dir,
        "kiln-builder-dying",
        &format!("echo '1|tcp|127.0.0.1:{port}'; exit 1"),
    );

    // Accept and immediately drop the connection, as the dying plugin's
    // kernel would on exit.
    let accepted = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        drop(stream);
    });

    let client = PluginClient::new(&path);
    client.start().await.unwrap();
    accepted.join().unwrap();

    let conn = client.connection().await.unwrap();
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        conn.call("builder", "prepare", serde_json::json!({})),
    )
    .await
    .expect("call must fail, not hang")
    .unwrap_err();
    assert!(err.is_transport(), "got: {err}");

    client.kill().await;
    assert_eq!(client.exit_status().await, Some(1));
}
