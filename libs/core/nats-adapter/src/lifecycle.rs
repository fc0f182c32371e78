//! Start/stop contract shared by containers and adapters.

use crate::error::NatsError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

/// A component with an explicit running state.
///
/// `start` and `stop` are idempotent: calling either in the state it would
/// produce is a no-op.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<(), NatsError>;

    async fn stop(&self) -> Result<(), NatsError>;

    fn is_running(&self) -> bool;

    /// Whether a [`LifecycleGroup`] starts this component.
    fn auto_startup(&self) -> bool {
        true
    }
}

/// Starts components in registration order and stops them in reverse.
#[derive(Default, Clone)]
pub struct LifecycleGroup {
    components: Vec<Arc<dyn Lifecycle>>,
}

impl LifecycleGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, component: Arc<dyn Lifecycle>) -> &mut Self {
        self.components.push(component);
        self
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Start every auto-startup component. Stops at the first failure; already
    /// started components keep running until [`stop_all`](Self::stop_all).
    pub async fn start_all(&self) -> Result<(), NatsError> {
        for component in self.components.iter().filter(|c| c.auto_startup()) {
            component.start().await.inspect_err(|e| {
                error!(component = component.name(), error = %e, "Failed to start component");
            })?;
            info!(component = component.name(), "Component started");
        }
        Ok(())
    }

    /// Stop every component in reverse order, returning the first error after
    /// all of them have been asked to stop.
    pub async fn stop_all(&self) -> Result<(), NatsError> {
        let mut first_error = None;
        for component in self.components.iter().rev() {
            if let Err(e) = component.stop().await {
                error!(component = component.name(), error = %e, "Failed to stop component");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// True when every auto-startup component is running.
    pub fn all_running(&self) -> bool {
        self.components
            .iter()
            .filter(|c| c.auto_startup())
            .all(|c| c.is_running())
    }

    /// Names of auto-startup components that are not running.
    pub fn not_running(&self) -> Vec<String> {
        self.components
            .iter()
            .filter(|c| c.auto_startup() && !c.is_running())
            .map(|c| c.name().to_string())
            .collect()
    }
}
