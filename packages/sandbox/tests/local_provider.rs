use std::time::Duration;

use fabric_sandbox::{
    ExecOptions, LocalConfig, LocalSandbox, Sandbox, SandboxError, SandboxRequest, SandboxStatus,
};

/// Needs a reachable docker daemon and `FABRIC_TEST_IMAGE` naming an image with a shell,
/// coreutils and tar (e.g. `ubuntu:22.04`). The container is kept alive with `sleep`.
fn docker_image() -> Option<String> {
    let image = std::env::var("FABRIC_TEST_IMAGE").ok()?;
    let docker = which::which("docker").ok()?;
    let info = std::process::Command::new(docker).arg("info").output().ok()?;
    info.status.success().then_some(image)
}

#[tokio::test]
async fn container_round_trip() {
    let Some(image) = docker_image() else {
        println!("Skipping test: docker or FABRIC_TEST_IMAGE unavailable");
        return;
    };
    let data = tempfile::tempdir().unwrap();
    let mut config = LocalConfig::new(image, data.path());
    config.command = vec!["sleep".into(), "infinity".into()];
    let sandbox = LocalSandbox::new(config, SandboxRequest::new("workspace-21"));

    let info = match sandbox.start().await {
        Ok(info) => info,
        Err(err) => panic!("start failed: {err}"),
    };
    assert!(info.url.starts_with("http://127.0.0.1:"));

    sandbox.upload_file("/tmp/x.txt", b"hello").await.unwrap();
    let output = sandbox
        .exec(ExecOptions::new("cat").arg("/tmp/x.txt"))
        .await
        .unwrap();
    assert_eq!(output.stdout, "hello");
    assert_eq!(output.exit_code, 0);

    let output = sandbox
        .exec(ExecOptions::shell("echo $FABRIC_WORKSPACE_ID"))
        .await
        .unwrap();
    assert_eq!(output.stdout.trim(), "workspace-21");

    let err = sandbox
        .exec(ExecOptions::new("sleep").arg("30").timeout(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::ExecTimeout { .. }));

    sandbox.stop().await.unwrap();
    sandbox.stop().await.unwrap();
    assert_eq!(sandbox.instance().unwrap().status, SandboxStatus::Stopped);
}
