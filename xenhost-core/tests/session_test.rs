// Host connection, credential rotation and configuration loading

mod common;

use common::{TestEnv, HOST_UUID, POOL_UUID};
use serial_test::serial;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use xenhost_core::credentials::CredentialProvider;
use xenhost_core::{AgentConfig, HostConnector, RotatingCredentials, XenhostError};

fn rotating(passwords: &[&str]) -> Arc<RotatingCredentials> {
    Arc::new(RotatingCredentials::new(
        passwords.iter().map(|p| p.to_string()),
    ))
}

fn connector(env: &TestEnv, credentials: Arc<RotatingCredentials>) -> HostConnector {
    HostConnector::new(
        env.sim.clone(),
        env.chain.clone(),
        env.cache.clone(),
        env.remote.clone(),
        credentials,
    )
}

#[tokio::test]
async fn test_connect_resolves_release_and_networks() {
    let env = TestEnv::new("6.2.0", &["XS62ESP1"]);
    let ctx = env.connect().await;

    assert_eq!(ctx.release.name, "xenserver620sp1");
    assert!(ctx.behavior.gpu_support);
    assert!(ctx.networks.private.is_some());
    assert!(ctx.networks.public.is_none());
    assert_eq!(ctx.cluster_id(), POOL_UUID);
    assert_eq!(ctx.host_uuid(), HOST_UUID);
}

#[tokio::test]
async fn test_rejected_password_rotates_to_next() {
    let env = TestEnv::new("6.0.0", &[]);
    env.sim.accept_passwords(&["new-secret"]);
    let credentials = rotating(&["old-secret", "new-secret"]);

    let ctx = connector(&env, credentials.clone())
        .connect(&env.config)
        .await
        .unwrap();

    assert_eq!(ctx.release.name, "xenserver600");
    assert_eq!(env.sim.login_attempts(), vec!["old-secret", "new-secret"]);
    // The working password stays current for the next login
    assert_eq!(credentials.peek().as_deref(), Some("new-secret"));
}

#[tokio::test]
async fn test_all_passwords_rejected() {
    let env = TestEnv::new("6.0.0", &[]);
    env.sim.accept_passwords(&["something-else"]);

    let err = connector(&env, rotating(&["a", "b"]))
        .connect(&env.config)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, XenhostError::CredentialsExhausted { .. }));
    assert_eq!(env.sim.login_attempts().len(), 2);
}

#[tokio::test]
async fn test_pushed_password_is_tried_after_exhaustion() {
    let env = TestEnv::new("6.0.0", &[]);
    env.sim.accept_passwords(&["rotated"]);
    let credentials = rotating(&["stale"]);
    let connector = connector(&env, credentials.clone());

    assert!(connector.login(&env.config.host).await.is_err());
    credentials.push("rotated".to_string());
    connector.login(&env.config.host).await.unwrap();
}

#[tokio::test]
async fn test_login_transport_error_does_not_rotate() {
    let env = TestEnv::new("6.0.0", &[]);
    env.sim.inject_failure("session.login_with_password");
    let credentials = rotating(&["a", "b"]);

    let err = connector(&env, credentials.clone())
        .login(&env.config.host)
        .await
        .unwrap_err();
    assert!(matches!(err, XenhostError::RemoteCall { .. }));
    assert_eq!(credentials.peek().as_deref(), Some("a"));
}

#[tokio::test]
async fn test_unsupported_host_version() {
    let env = TestEnv::new("5.5.0", &[]);
    let err = env.connector().connect(&env.config).await.err().unwrap();
    assert!(matches!(err, XenhostError::UnsupportedVersion { .. }));
}

#[tokio::test]
async fn test_missing_configured_network_fails_connect() {
    let env = TestEnv::new("6.0.0", &[]);
    let mut config = env.config.clone();
    config.host.networks.storage = Some("storage-net".to_string());

    let err = env.connector().connect(&config).await.err().unwrap();
    match err {
        XenhostError::NotFound { resource } => assert!(resource.contains("storage-net")),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
#[serial]
fn test_config_from_toml_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
hypervisor_backend = "simulated"
scripts_dir = "/opt/xenhost/scripts"

[host]
host_uuid = "host-a"
ip = "10.0.0.5"
pool_uuid = "pool-1"

[host.networks]
private = "cloud-private"

[host.tunables]
task_poll_interval = "500ms"
task_wait = "10m"
migrate_wait = "1h"

[host.credentials]
username = "root"
passwords = ["one", "two"]

[logging]
format = "json"
"#
    )
    .unwrap();

    let config = AgentConfig::from_file(file.path()).unwrap();
    assert_eq!(config.host.tunables.task_poll_interval, Duration::from_millis(500));
    assert_eq!(config.host.tunables.task_wait, Duration::from_secs(600));
    assert_eq!(config.host.tunables.migrate_wait, Duration::from_secs(3600));
    assert_eq!(config.host.credentials.passwords.len(), 2);
    assert_eq!(config.host.networks.private.as_deref(), Some("cloud-private"));
    assert_eq!(config.logging.format, "json");
    // Unset tunables keep their defaults
    assert_eq!(config.host.tunables.max_nics, 7);
}

#[test]
#[serial]
fn test_config_from_env() {
    std::env::set_var("XENHOST_HOST_UUID", "env-host");
    std::env::set_var("XENHOST_HOST_IP", "192.168.0.10");
    std::env::set_var("XENHOST_POOL_UUID", "env-pool");
    std::env::set_var("XENHOST_PASSWORDS", "first,second");
    std::env::set_var("XENHOST_TASK_WAIT_SECS", "90");

    let config = AgentConfig::from_env();

    for key in [
        "XENHOST_HOST_UUID",
        "XENHOST_HOST_IP",
        "XENHOST_POOL_UUID",
        "XENHOST_PASSWORDS",
        "XENHOST_TASK_WAIT_SECS",
    ] {
        std::env::remove_var(key);
    }

    let config = config.unwrap();
    assert_eq!(config.host.host_uuid, "env-host");
    assert_eq!(config.host.cluster_id(), "env-pool");
    assert_eq!(
        config.host.credentials.passwords,
        vec!["first".to_string(), "second".to_string()]
    );
    assert_eq!(config.host.tunables.task_wait, Duration::from_secs(90));
}

#[test]
#[serial]
fn test_config_without_passwords_is_rejected() {
    std::env::set_var("XENHOST_HOST_UUID", "env-host");
    std::env::set_var("XENHOST_HOST_IP", "192.168.0.10");
    std::env::set_var("XENHOST_POOL_UUID", "env-pool");

    let result = AgentConfig::from_env();

    for key in ["XENHOST_HOST_UUID", "XENHOST_HOST_IP", "XENHOST_POOL_UUID"] {
        std::env::remove_var(key);
    }
    assert!(matches!(result, Err(XenhostError::ConfigError(_))));
}
