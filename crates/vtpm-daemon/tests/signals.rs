//! Signal forwarding. Kept in its own test binary because it raises real
//! signals at the process.

use std::time::Duration;
use vtpm_core::StopHandle;
use vtpm_daemon::signals;

#[tokio::test]
async fn test_signal_before_task_runs_requests_stop() {
    let handle = StopHandle::new();
    let forwarder = signals::forward_to(handle.clone()).unwrap();

    // The forwarding task has not been polled yet on this runtime.
    let rc = unsafe { libc::raise(libc::SIGTERM) };
    assert_eq!(rc, 0);

    tokio::time::timeout(Duration::from_secs(5), forwarder)
        .await
        .expect("forwarder did not see the signal")
        .unwrap();
    assert!(handle.is_requested());
}
