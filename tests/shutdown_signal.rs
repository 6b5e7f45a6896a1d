#![cfg(unix)]

use std::process::Command;
use std::time::Duration;

use cmma::shutdown_signal;

#[tokio::test]
async fn sigterm_resolves_shutdown_signal() {
    let signal = shutdown_signal();

    let status = Command::new("kill")
        .args(["-TERM", &std::process::id().to_string()])
        .status()
        .expect("kill should be available");
    assert!(status.success());

    let reason = tokio::time::timeout(Duration::from_secs(5), signal)
        .await
        .expect("SIGTERM should resolve the shutdown future");
    assert_eq!(reason, "sigterm");
}
