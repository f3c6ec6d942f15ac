use std::sync::{Arc, OnceLock};

use crate::artifact::ModelHandle;

/// Process lifecycle as seen by orchestration.
#[derive(Debug, Clone)]
pub enum LifecycleState {
    /// The artifact is still loading.
    Starting,
    /// The artifact loaded; traffic may be routed here.
    Ready(Arc<ModelHandle>),
    /// The artifact failed to load. Terminal; the process is exiting.
    Failed(String),
}

/// Readiness reporter and holder of the shared model handle.
///
/// Both slots are write-once, so reads on the request path take no lock.
#[derive(Debug, Default)]
pub struct Readiness {
    model: OnceLock<Arc<ModelHandle>>,
    failure: OnceLock<String>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff the model artifact loaded successfully.
    pub fn is_ready(&self) -> bool {
        self.model.get().is_some()
    }

    pub fn model(&self) -> Option<&Arc<ModelHandle>> {
        self.model.get()
    }

    /// Publishes the loaded handle. Returns `false` if a handle or a failure
    /// was already recorded.
    pub fn mark_ready(&self, handle: Arc<ModelHandle>) -> bool {
        if self.failure.get().is_some() {
            return false;
        }
        self.model.set(handle).is_ok()
    }

    /// Records a terminal load failure. Ignored once ready.
    pub fn mark_failed(&self, reason: impl Into<String>) {
        if self.model.get().is_none() {
            let _ = self.failure.set(reason.into());
        }
    }

    pub fn state(&self) -> LifecycleState {
        if let Some(model) = self.model.get() {
            LifecycleState::Ready(model.clone())
        } else if let Some(reason) = self.failure.get() {
            LifecycleState::Failed(reason.clone())
        } else {
            LifecycleState::Starting
        }
    }
}
