//! Request-scoped resource ownership.
//!
//! Every temporary file and intermediate buffer a request creates is wrapped in
//! a guard whose `Drop` releases it. A guard can only be dropped once, so each
//! resource is released exactly once whether the request succeeds, fails, or
//! its future is dropped mid-flight by a disconnecting caller.
//!
//! [`ResourceTracker`] counts live guards so callers (and tests) can assert
//! that nothing outlived a request.

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::SentinelError;
use crate::metrics;

/// Shared counter of resources currently held by requests.
#[derive(Clone, Default)]
pub struct ResourceTracker {
    inner: Arc<TrackerCounters>,
}

#[derive(Default)]
struct TrackerCounters {
    live: AtomicUsize,
    acquired: AtomicUsize,
    cleanup_failures: AtomicUsize,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resources acquired and not yet released.
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Total resources ever acquired through this tracker.
    pub fn acquired(&self) -> usize {
        self.inner.acquired.load(Ordering::Relaxed)
    }

    pub fn cleanup_failures(&self) -> usize {
        self.inner.cleanup_failures.load(Ordering::Relaxed)
    }

    /// Wrap `value` so its release is counted.
    pub fn track<T>(&self, label: impl Into<String>, value: T) -> Tracked<T> {
        let label = label.into();
        self.acquire(&label);
        Tracked {
            value,
            label,
            tracker: self.clone(),
        }
    }

    fn acquire(&self, label: &str) {
        self.inner.live.fetch_add(1, Ordering::AcqRel);
        self.inner.acquired.fetch_add(1, Ordering::Relaxed);
        metrics::inc_resources();
        trace!("acquired {}", label);
    }

    fn release(&self, label: &str) {
        self.inner.live.fetch_sub(1, Ordering::AcqRel);
        metrics::dec_resources();
        trace!("released {}", label);
    }

    fn record_cleanup_failure(&self, err: &SentinelError) {
        self.inner.cleanup_failures.fetch_add(1, Ordering::Relaxed);
        warn!("{}", err);
    }
}

impl fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTracker")
            .field("live", &self.live())
            .field("acquired", &self.acquired())
            .finish()
    }
}

/// An in-memory buffer whose lifetime is counted by a [`ResourceTracker`].
pub struct Tracked<T> {
    value: T,
    label: String,
    tracker: ResourceTracker,
}

impl<T> Deref for Tracked<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Drop for Tracked<T> {
    fn drop(&mut self) {
        self.tracker.release(&self.label);
    }
}

impl<T: fmt::Debug> fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracked")
            .field("label", &self.label)
            .field("value", &self.value)
            .finish()
    }
}

/// A file created on behalf of a request; removed when dropped.
pub struct TempFile {
    path: PathBuf,
    tracker: ResourceTracker,
}

impl TempFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let label = format!("temp file {}", self.path.display());
        if let Err(e) = std::fs::remove_file(&self.path) {
            self.tracker.record_cleanup_failure(&SentinelError::CleanupFailure {
                resource: label.clone(),
                message: e.to_string(),
            });
        }
        self.tracker.release(&label);
    }
}

/// Owns every resource registered during one request.
///
/// Resources are released in reverse registration order when the scope is
/// closed or dropped.
pub struct RequestScope {
    id: Uuid,
    tracker: ResourceTracker,
    resources: Mutex<Vec<Box<dyn Any + Send>>>,
}

impl RequestScope {
    pub fn new(tracker: ResourceTracker) -> Self {
        let id = Uuid::new_v4();
        debug!("opened request scope {}", id);
        Self {
            id,
            tracker,
            resources: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    /// Register a file that already exists on disk; it is deleted on release.
    pub fn adopt_file(&self, path: impl Into<PathBuf>) -> PathBuf {
        let path = path.into();
        self.tracker.acquire(&format!("temp file {}", path.display()));
        let guard = TempFile {
            path: path.clone(),
            tracker: self.tracker.clone(),
        };
        self.push(Box::new(guard));
        path
    }

    /// Write `contents` to `path` and register the file for removal.
    ///
    /// If the write fails midway, the partial file is still registered and
    /// removed with the rest of the scope.
    pub async fn write_temp_file(
        &self,
        path: impl Into<PathBuf>,
        contents: &[u8],
    ) -> crate::error::Result<PathBuf> {
        let path = self.adopt_file(path);
        tokio::fs::write(&path, contents).await?;
        Ok(path)
    }

    /// Hand an intermediate value to the scope and get back a shared reference.
    ///
    /// The scope keeps one reference until release; the tracked count drops
    /// once the last reference is gone.
    pub fn hold<T: Send + Sync + 'static>(&self, label: impl Into<String>, value: T) -> Arc<Tracked<T>> {
        let held = Arc::new(self.tracker.track(label, value));
        self.push(Box::new(held.clone()));
        held
    }

    fn push(&self, resource: Box<dyn Any + Send>) {
        match self.resources.lock() {
            Ok(mut resources) => resources.push(resource),
            // A poisoned lock means another thread panicked mid-push; drop the
            // resource right away so it is still released.
            Err(_) => drop(resource),
        }
    }

    fn release_all(&self) -> usize {
        let drained: Vec<Box<dyn Any + Send>> = match self.resources.lock() {
            Ok(mut resources) => resources.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        let count = drained.len();
        for resource in drained.into_iter().rev() {
            drop(resource);
        }
        count
    }

    /// Release everything now. Equivalent to dropping the scope, but logs a summary.
    pub fn close(self) {
        let released = self.release_all();
        debug!(
            "closed request scope {} ({} resource(s) released)",
            self.id, released
        );
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        let released = self.release_all();
        if released > 0 {
            debug!(
                "request scope {} dropped early, released {} resource(s)",
                self.id, released
            );
        }
    }
}
