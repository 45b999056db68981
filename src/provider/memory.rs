//! In-process provisioner.
//!
//! Keeps live resources in a map and records every call. Failures can be
//! injected per logical name, either permanently or for a fixed number of
//! calls, which makes it the workhorse of the engine's tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

use crate::error::ProviderError;
use crate::model::{Properties, PropertyValue, ResourceKind};

use super::{Provisioner, ResourceHandle};

/// Which provider operation a call was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// `create`
    Create,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `describe`
    Describe,
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// The operation.
    pub kind: CallKind,
    /// Logical name of the resource.
    pub resource: String,
}

#[derive(Debug, Clone)]
struct LiveResource {
    name: String,
    kind: ResourceKind,
    properties: Properties,
}

#[derive(Debug)]
enum Failure {
    Always(ProviderError),
    Times { remaining: u32, error: ProviderError },
}

#[derive(Debug, Default)]
struct Inner {
    live: HashMap<ResourceHandle, LiveResource>,
    calls: Vec<ProviderCall>,
    failures: HashMap<String, Failure>,
    call_failures: HashMap<(CallKind, String), Failure>,
    next_id: u64,
}

/// Provisioner that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryProvisioner {
    inner: Mutex<Inner>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter when a call ends.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryProvisioner {
    /// Creates an empty provisioner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call take `latency` before it acts.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes every call for `resource` fail with `error`.
    pub fn fail_on(&self, resource: &str, error: ProviderError) {
        self.lock().failures.insert(resource.to_string(), Failure::Always(error));
    }

    /// Makes the next `times` calls for `resource` fail with `error`.
    pub fn fail_times(&self, resource: &str, times: u32, error: ProviderError) {
        self.lock().failures.insert(
            resource.to_string(),
            Failure::Times {
                remaining: times,
                error,
            },
        );
    }

    /// Makes the next `times` calls of one kind for `resource` fail.
    pub fn fail_call(&self, kind: CallKind, resource: &str, times: u32, error: ProviderError) {
        self.lock().call_failures.insert(
            (kind, resource.to_string()),
            Failure::Times {
                remaining: times,
                error,
            },
        );
    }

    /// Removes any injected failure for `resource`.
    pub fn clear_failure(&self, resource: &str) {
        let mut inner = self.lock();
        inner.failures.remove(resource);
        inner.call_failures.retain(|(_, name), _| name != resource);
    }

    /// Returns every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Returns the calls of one kind, as resource names.
    #[must_use]
    pub fn calls_of(&self, kind: CallKind) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.resource.clone())
            .collect()
    }

    /// Forgets the recorded calls.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Number of live resources.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    /// Handle of the live resource named `resource`.
    #[must_use]
    pub fn handle_of(&self, resource: &str) -> Option<ResourceHandle> {
        self.lock()
            .live
            .iter()
            .find(|(_, r)| r.name == resource)
            .map(|(h, _)| h.clone())
    }

    /// Live properties of the resource named `resource`.
    #[must_use]
    pub fn live_properties(&self, resource: &str) -> Option<Properties> {
        self.lock()
            .live
            .values()
            .find(|r| r.name == resource)
            .map(|r| r.properties.clone())
    }

    /// Changes a live property behind the engine's back.
    pub fn set_live_property(&self, resource: &str, key: &str, value: PropertyValue) {
        if let Some(live) = self.lock().live.values_mut().find(|r| r.name == resource) {
            live.properties.insert(key.to_string(), value);
        }
    }

    /// Deletes a live resource behind the engine's back.
    pub fn remove_live(&self, resource: &str) {
        self.lock().live.retain(|_, r| r.name != resource);
    }

    /// Highest number of calls that were in progress at the same time.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        InFlight(&self.in_flight)
    }
}

impl Inner {
    /// Records the call and returns the injected failure, if any.
    fn record(&mut self, kind: CallKind, resource: &str) -> Result<(), ProviderError> {
        self.calls.push(ProviderCall {
            kind,
            resource: resource.to_string(),
        });

        let key = (kind, resource.to_string());
        if let Some(failure) = self.call_failures.get_mut(&key) {
            trip(failure)?;
        }
        self.failures.get_mut(resource).map_or(Ok(()), trip)
    }

    fn name_of(&self, handle: &ResourceHandle) -> Result<String, ProviderError> {
        self.live
            .get(handle)
            .map(|r| r.name.clone())
            .ok_or_else(|| ProviderError::NotFound {
                handle: handle.to_string(),
            })
    }
}

fn trip(failure: &mut Failure) -> Result<(), ProviderError> {
    match failure {
        Failure::Always(error) => Err(error.clone()),
        Failure::Times { remaining, error } if *remaining > 0 => {
            *remaining -= 1;
            Err(error.clone())
        }
        Failure::Times { .. } => Ok(()),
    }
}

#[async_trait]
impl Provisioner for MemoryProvisioner {
    async fn create(
        &self,
        kind: ResourceKind,
        name: &str,
        properties: &Properties,
    ) -> Result<ResourceHandle, ProviderError> {
        let _call = self.enter().await;
        let mut inner = self.lock();
        inner.record(CallKind::Create, name)?;

        inner.next_id += 1;
        let handle = ResourceHandle::new(format!("{kind}-{:04}", inner.next_id));
        inner.live.insert(
            handle.clone(),
            LiveResource {
                name: name.to_string(),
                kind,
                properties: properties.clone(),
            },
        );

        trace!("Created {kind} {name} as {handle}");
        Ok(handle)
    }

    async fn update(&self, handle: &ResourceHandle, properties: &Properties) -> Result<(), ProviderError> {
        let _call = self.enter().await;
        let mut inner = self.lock();
        let name = inner.name_of(handle)?;
        inner.record(CallKind::Update, &name)?;

        if let Some(live) = inner.live.get_mut(handle) {
            live.properties = properties.clone();
        }
        Ok(())
    }

    async fn delete(&self, handle: &ResourceHandle) -> Result<(), ProviderError> {
        let _call = self.enter().await;
        let mut inner = self.lock();
        let name = inner.name_of(handle)?;
        inner.record(CallKind::Delete, &name)?;

        inner.live.remove(handle);
        Ok(())
    }

    async fn describe(&self, handle: &ResourceHandle) -> Result<Properties, ProviderError> {
        let _call = self.enter().await;
        let mut inner = self.lock();
        let name = inner.name_of(handle)?;
        inner.record(CallKind::Describe, &name)?;

        let live = inner.live.get(handle).cloned().ok_or_else(|| ProviderError::NotFound {
            handle: handle.to_string(),
        })?;

        let mut outputs = live.properties;
        outputs.insert(String::from("id"), PropertyValue::from(handle.as_str()));
        outputs.insert(
            String::from("arn"),
            PropertyValue::from(format!("arn:stackform:{}:{}", live.kind, live.name)),
        );
        Ok(outputs)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
