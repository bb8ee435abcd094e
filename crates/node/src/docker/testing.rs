use super::{ContainerRuntime, ContainerSpec, ContainerStatus, RuntimeError};
use async_trait::async_trait;
use std::sync::Mutex;

type CreateFn = dyn Fn(&ContainerSpec) -> Result<String, RuntimeError> + Send + Sync;
type IdFn = dyn Fn(&str) -> Result<(), RuntimeError> + Send + Sync;
type InspectFn = dyn Fn(&str) -> Result<ContainerStatus, RuntimeError> + Send + Sync;

#[derive(Debug, Default)]
pub(crate) struct MockCalls {
    pub ensure_image: Vec<String>,
    pub create: Vec<ContainerSpec>,
    pub start: Vec<String>,
    pub stop: Vec<String>,
    pub remove: Vec<String>,
    pub inspect: Vec<String>,
}

/// Scripted [`ContainerRuntime`] with call tracking. Every operation
/// succeeds by default; individual operations can be overridden per test.
#[derive(Default)]
pub(crate) struct MockRuntime {
    pub create_fn: Option<Box<CreateFn>>,
    pub start_fn: Option<Box<IdFn>>,
    pub stop_fn: Option<Box<IdFn>>,
    pub remove_fn: Option<Box<IdFn>>,
    pub inspect_fn: Option<Box<InspectFn>>,
    pub calls: Mutex<MockCalls>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.calls
            .lock()
            .unwrap()
            .ensure_image
            .push(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.calls.lock().unwrap().create.push(spec.clone());
        match &self.create_fn {
            Some(f) => f(spec),
            None => Ok("container-123".to_string()),
        }
    }

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.calls
            .lock()
            .unwrap()
            .start
            .push(container_id.to_string());
        match &self.start_fn {
            Some(f) => f(container_id),
            None => Ok(()),
        }
    }

    async fn stop_container(&self, container_id: &str, _timeout_s: i64) -> Result<(), RuntimeError> {
        self.calls
            .lock()
            .unwrap()
            .stop
            .push(container_id.to_string());
        match &self.stop_fn {
            Some(f) => f(container_id),
            None => Ok(()),
        }
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> Result<(), RuntimeError> {
        self.calls
            .lock()
            .unwrap()
            .remove
            .push(container_id.to_string());
        match &self.remove_fn {
            Some(f) => f(container_id),
            None => Ok(()),
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus, RuntimeError> {
        self.calls
            .lock()
            .unwrap()
            .inspect
            .push(container_id.to_string());
        match &self.inspect_fn {
            Some(f) => f(container_id),
            None => Ok(ContainerStatus {
                container_id: container_id.to_string(),
                state: "running".to_string(),
                health: "healthy".to_string(),
                ssh_host_port: Some(30000),
            }),
        }
    }
}
