#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use container_lifecycle::{
    CommandDriver, ContainerConfig, ContainerRegistry, ContainerState, LifecycleError,
    LifecycleMonitor, ProcessSpec, PtyDriver, StopSignal,
};

fn command_monitor() -> LifecycleMonitor {
    LifecycleMonitor::new(
        Arc::new(ContainerRegistry::default()),
        Arc::new(CommandDriver::default()),
    )
}

#[tokio::test]
async fn cat_round_trips_and_exits_when_stdin_closes() {
    let monitor = command_monitor();
    let container = monitor
        .create(ContainerConfig::new(ProcessSpec::new("cat")))
        .unwrap();
    let mut out = container.stdout().subscribe();
    monitor.start(&container).unwrap();
    container.wait_running().await.unwrap();
    assert!(container.pid().is_some());

    for _ in 0..10 {
        container.stdin().write(b"hello\n".to_vec()).await.unwrap();
        let mut line = Vec::new();
        while line.len() < 6 {
            let chunk = tokio::time::timeout(Duration::from_secs(5), out.recv())
                .await
                .expect("cat never answered")
                .expect("stdout closed early");
            line.extend(chunk);
        }
        assert_eq!(line, b"hello\n");
    }

    assert!(container.close_stdin());
    let code = container
        .wait_stop(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(code, 0);
    assert!(out.recv().await.is_none());
}

#[tokio::test]
async fn exit_code_and_auto_remove() {
    let monitor = command_monitor();
    let container = monitor
        .create(ContainerConfig {
            auto_remove: true,
            name: Some("short-lived".into()),
            ..ContainerConfig::new(ProcessSpec::new("sh").arg("-c").arg("exit 5"))
        })
        .unwrap();
    monitor.start(&container).unwrap();

    assert_eq!(container.wait_stop(None).await, Ok(5));
    assert_eq!(container.state(), ContainerState::Removed);
    assert!(matches!(
        monitor.registry().get("short-lived"),
        Err(LifecycleError::NotFound(_))
    ));
}

#[tokio::test]
async fn term_signal_reported_as_exit_code() {
    let monitor = command_monitor();
    let container = monitor
        .create(ContainerConfig::new(ProcessSpec::new("sleep").arg("30")))
        .unwrap();
    monitor.start(&container).unwrap();

    assert!(matches!(
        container.wait_stop(Some(Duration::from_millis(100))).await,
        Err(LifecycleError::Timeout(_))
    ));
    container.kill(StopSignal::Term).unwrap();
    assert_eq!(
        container.wait_stop(Some(Duration::from_secs(5))).await,
        Ok(143)
    );
}

#[tokio::test]
async fn missing_binary_stops_with_127() {
    let monitor = command_monitor();
    let container = monitor
        .create(ContainerConfig::new(ProcessSpec::new(
            "/nonexistent/berth-test-binary",
        )))
        .unwrap();
    assert!(matches!(
        monitor.start(&container),
        Err(LifecycleError::SpawnFailed(_))
    ));
    assert_eq!(container.wait_stop(Some(Duration::ZERO)).await, Ok(127));
}

#[tokio::test]
async fn pty_container_merges_streams() {
    let monitor = LifecycleMonitor::new(
        Arc::new(ContainerRegistry::default()),
        Arc::new(PtyDriver::default()),
    );
    let container = monitor
        .create(ContainerConfig {
            tty: true,
            ..ContainerConfig::new(
                ProcessSpec::new("sh")
                    .arg("-c")
                    .arg("printf out; printf err >&2"),
            )
        })
        .unwrap();
    let mut out = container.stdout().subscribe();
    let mut err = container.stderr().subscribe();
    monitor.start(&container).unwrap();

    let mut received = Vec::new();
    while let Some(chunk) = tokio::time::timeout(Duration::from_secs(5), out.recv())
        .await
        .expect("pty output never closed")
    {
        received.extend(chunk);
    }
    assert_eq!(received, b"outerr");
    assert!(err.recv().await.is_none());
    assert_eq!(container.wait_stop(None).await, Ok(0));
}
