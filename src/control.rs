//! Stop propagation and filesystem control markers.
//!
//! `StopSignal` is the in-process broadcast every loop and wait observes.
//! `ControlMarkers` are the out-of-process surface: `devloop stop` and
//! `devloop shutdown` drop a file that the supervisor polls each tick.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;

/// Cloneable one-way latch. Once triggered it stays triggered.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has been triggered.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Requests read from the control markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Kill loops and invocations now.
    Stop,
    /// Stop polling, let invocations finish.
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ControlMarkers {
    stop_path: PathBuf,
    shutdown_path: PathBuf,
}

impl ControlMarkers {
    pub fn new(stop_path: PathBuf, shutdown_path: PathBuf) -> Self {
        Self { stop_path, shutdown_path }
    }

    /// Immediate stop wins when both markers are present.
    pub fn check(&self) -> Option<ControlRequest> {
        if self.stop_path.exists() {
            Some(ControlRequest::Stop)
        } else if self.shutdown_path.exists() {
            Some(ControlRequest::Shutdown)
        } else {
            None
        }
    }

    pub fn request(&self, request: ControlRequest) -> Result<PathBuf> {
        let path = self.path_for(request);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, chrono::Utc::now().to_rfc3339())
            .with_context(|| format!("Failed to write control marker {}", path.display()))?;
        Ok(path.to_path_buf())
    }

    /// Remove a marker once acted upon. A missing marker is not an error.
    pub fn clear(&self, request: ControlRequest) {
        let path = self.path_for(request);
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to clear control marker"),
        }
    }

    /// Drop markers left over from a previous run.
    pub fn clear_all(&self) {
        self.clear(ControlRequest::Stop);
        self.clear(ControlRequest::Shutdown);
    }

    fn path_for(&self, request: ControlRequest) -> &Path {
        match request {
            ControlRequest::Stop => &self.stop_path,
            ControlRequest::Shutdown => &self.shutdown_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn markers(dir: &Path) -> ControlMarkers {
        ControlMarkers::new(dir.join("STOP"), dir.join("SHUTDOWN"))
    }

    #[tokio::test]
    async fn stop_signal_wakes_waiters() {
        let stop = StopSignal::new();
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.stopped().await })
        };
        assert!(!stop.is_stopped());
        stop.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(stop.is_stopped());
    }

    #[tokio::test]
    async fn stopped_returns_immediately_when_already_triggered() {
        let stop = StopSignal::new();
        stop.trigger();
        tokio::time::timeout(Duration::from_millis(100), stop.stopped())
            .await
            .unwrap();
    }

    #[test]
    fn check_reports_nothing_without_markers() {
        let dir = tempdir().unwrap();
        assert_eq!(markers(dir.path()).check(), None);
    }

    #[test]
    fn stop_takes_priority_over_shutdown() {
        let dir = tempdir().unwrap();
        let m = markers(dir.path());
        m.request(ControlRequest::Shutdown).unwrap();
        assert_eq!(m.check(), Some(ControlRequest::Shutdown));
        m.request(ControlRequest::Stop).unwrap();
        assert_eq!(m.check(), Some(ControlRequest::Stop));
    }

    #[test]
    fn clear_removes_marker_and_tolerates_absence() {
        let dir = tempdir().unwrap();
        let m = markers(dir.path());
        m.request(ControlRequest::Stop).unwrap();
        m.clear(ControlRequest::Stop);
        assert!(!dir.path().join("STOP").exists());
        m.clear(ControlRequest::Stop);
        assert_eq!(m.check(), None);
    }
}
