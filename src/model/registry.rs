use std::{fmt, sync::Arc, time::Duration};

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::{sync::Semaphore, task, time};
use tracing::{debug, error, info, warn};

use crate::{
    config::ModelSource,
    device::DeviceProfile,
    error::ServiceError,
    model::{
        BackendLoader, CompileOutcome, InvocationRequest, VisionBackend, invoker,
        loader::LoadOptions,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Loading,
    Ready,
    Failed,
    ShuttingDown,
    Terminated,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Loading => "loading",
            LifecycleState::Ready => "ready",
            LifecycleState::Failed => "failed",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Lifecycle {
    state: LifecycleState,
    backend: Option<Arc<dyn VisionBackend>>,
    optimized: bool,
}

/// Owns the one backend of the process and its lifecycle. Handlers receive it
/// through router state.
pub struct ModelRegistry {
    lifecycle: RwLock<Lifecycle>,
    slots: Arc<Semaphore>,
    max_slots: u32,
}

impl ModelRegistry {
    /// `max_concurrent` bounds how many backend calls run at once; 1 queues
    /// every invocation behind the previous one.
    pub fn new(max_concurrent: usize) -> Self {
        let max_slots = max_concurrent.clamp(1, 1024) as u32;
        Self {
            lifecycle: RwLock::new(Lifecycle {
                state: LifecycleState::Uninitialized,
                backend: None,
                optimized: false,
            }),
            slots: Arc::new(Semaphore::new(max_slots as usize)),
            max_slots,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.read().state
    }

    pub fn is_loaded(&self) -> bool {
        self.current_backend().is_some()
    }

    /// Whether the post-load compile pass ran successfully.
    pub fn is_optimized(&self) -> bool {
        self.lifecycle.read().optimized
    }

    /// The backend, only while the registry is Ready.
    pub fn current_backend(&self) -> Option<Arc<dyn VisionBackend>> {
        let lifecycle = self.lifecycle.read();
        match lifecycle.state {
            LifecycleState::Ready => lifecycle.backend.clone(),
            _ => None,
        }
    }

    pub fn ensure_ready(&self) -> Result<(), ServiceError> {
        if self.is_loaded() {
            Ok(())
        } else {
            Err(ServiceError::BackendUnavailable)
        }
    }

    pub async fn load(
        &self,
        loader: Arc<dyn BackendLoader>,
        source: ModelSource,
        profile: DeviceProfile,
    ) -> Result<(), ServiceError> {
        {
            let mut lifecycle = self.lifecycle.write();
            if lifecycle.state != LifecycleState::Uninitialized {
                return Err(ServiceError::BackendLoad(format!(
                    "backend already loaded or loading (state: {})",
                    lifecycle.state
                )));
            }
            lifecycle.state = LifecycleState::Loading;
        }

        info!(
            source = %source.repo_id,
            revision = source.revision_label(),
            device = %profile.kind,
            precision = ?profile.precision,
            "loading backend"
        );

        let options = LoadOptions::from_profile(&profile);
        let outcome = task::spawn_blocking(move || load_and_compile(loader.as_ref(), &source, &options))
            .await
            .map_err(|err| ServiceError::BackendLoad(format!("load task failed: {err}")))
            .and_then(|result| result);

        let mut lifecycle = self.lifecycle.write();
        match outcome {
            Ok((backend, optimized)) => {
                info!(backend = backend.name(), optimized, "backend loaded successfully");
                lifecycle.backend = Some(Arc::from(backend));
                lifecycle.optimized = optimized;
                lifecycle.state = LifecycleState::Ready;
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "failed to load backend");
                lifecycle.state = LifecycleState::Failed;
                Err(err)
            }
        }
    }

    pub async fn invoke(&self, request: InvocationRequest) -> Result<Value, ServiceError> {
        self.ensure_ready()?;
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServiceError::BackendUnavailable)?;
        // State may have moved on while queued for a slot.
        let backend = self.current_backend().ok_or(ServiceError::BackendUnavailable)?;

        // The permit travels with the blocking call so a dropped request still
        // holds its slot until the backend returns.
        task::spawn_blocking(move || {
            let _permit = permit;
            invoker::invoke(backend.as_ref(), request)
        })
        .await
        .map_err(|err| ServiceError::Invocation(format!("inference task failed: {err}")))?
    }

    /// Stop accepting invocations, wait up to `grace` for in-flight ones, then
    /// release the backend.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut lifecycle = self.lifecycle.write();
            match lifecycle.state {
                LifecycleState::Ready => lifecycle.state = LifecycleState::ShuttingDown,
                LifecycleState::ShuttingDown | LifecycleState::Terminated => return,
                _ => {
                    lifecycle.backend = None;
                    lifecycle.state = LifecycleState::Terminated;
                    return;
                }
            }
        }
        info!("shutting down backend");

        match time::timeout(grace, self.slots.acquire_many(self.max_slots)).await {
            Ok(Ok(_drained)) => debug!("all in-flight invocations finished"),
            Ok(Err(_)) => {}
            Err(_) => warn!(
                grace_secs = grace.as_secs(),
                "in-flight invocations still running after grace period"
            ),
        }
        self.slots.close();

        let mut lifecycle = self.lifecycle.write();
        lifecycle.backend = None;
        lifecycle.state = LifecycleState::Terminated;
        info!("backend released");
    }
}

fn load_and_compile(
    loader: &dyn BackendLoader,
    source: &ModelSource,
    options: &LoadOptions,
) -> Result<(Box<dyn VisionBackend>, bool), ServiceError> {
    let mut backend = loader
        .load(source, options)
        .map_err(|err| ServiceError::BackendLoad(format!("{err:#}")))?;

    let optimized = match backend.compile() {
        Ok(CompileOutcome::Compiled) => {
            info!("model compile completed");
            true
        }
        Ok(CompileOutcome::Unsupported) => {
            debug!("backend has no compile pass");
            false
        }
        Err(err) => {
            warn!(error = %format!("{err:#}"), "model compile skipped");
            false
        }
    };

    Ok((backend, optimized))
}
