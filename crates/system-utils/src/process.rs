use std::process::ExitStatus;

use tokio::process::Child;
use tokio::time::{timeout, Duration};

pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

#[cfg(unix)]
fn request_stop(child: &Child) -> bool {
    match child.id() {
        Some(pid) => unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 },
        None => false,
    }
}

#[cfg(not(unix))]
fn request_stop(_child: &Child) -> bool {
    false
}

/// Asks the child to stop, then kills it once `grace` has passed.
pub async fn terminate_child(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }
    if request_stop(child) {
        if let Ok(status) = timeout(grace, child.wait()).await {
            return status.ok();
        }
    }
    let _ = child.kill().await;
    child.wait().await.ok()
}
