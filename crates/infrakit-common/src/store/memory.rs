//! In-process resource store
//!
//! Backs tests and single-process deployments. All resources live in one
//! ordered map behind a mutex; changes fan out to watchers over a broadcast
//! channel.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{trace, warn};

use super::{EventKind, ResourceStore, WatchEvent, WatchStream};
use crate::query::Query;
use crate::resource::{DynamicObject, Phase, ResourceRef};
use crate::{Error, Result};

/// Buffered events per watcher before it starts lagging
const WATCH_BUFFER: usize = 1024;

/// Resource store held entirely in memory
pub struct MemoryStore {
    objects: Mutex<BTreeMap<ResourceRef, DynamicObject>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            objects: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    /// Number of stored resources across all types
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// True if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    fn emit(&self, kind: EventKind, object: &DynamicObject) {
        trace!(kind = ?kind, resource = %object.metadata.resource_ref(), "store event");
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(WatchEvent {
            kind,
            object: object.clone(),
        });
    }

    /// Apply `f` to an existing resource and bump its version
    fn mutate<F>(&self, resource: &ResourceRef, f: F) -> Result<DynamicObject>
    where
        F: FnOnce(&mut DynamicObject) -> bool,
    {
        let updated = {
            let mut objects = self.objects.lock();
            let object = objects
                .get_mut(resource)
                .ok_or_else(|| Error::not_found(&resource.kind, &resource.id))?;
            if !f(object) {
                return Ok(object.clone());
            }
            object.metadata.version += 1;
            object.metadata.updated = Some(Utc::now());
            object.clone()
        };
        self.emit(EventKind::Updated, &updated);
        Ok(updated)
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, resource: &ResourceRef) -> Result<Option<DynamicObject>> {
        Ok(self.objects.lock().get(resource).cloned())
    }

    async fn list(&self, namespace: &str, kind: &str, query: &Query) -> Result<Vec<DynamicObject>> {
        let objects = self.objects.lock();
        Ok(objects
            .values()
            .filter(|o| o.metadata.namespace == namespace && o.metadata.kind == kind)
            .filter(|o| query.matches(&o.metadata.labels))
            .cloned()
            .collect())
    }

    async fn create(&self, mut object: DynamicObject) -> Result<DynamicObject> {
        let resource = object.metadata.resource_ref();
        {
            let mut objects = self.objects.lock();
            if objects.contains_key(&resource) {
                return Err(Error::already_exists(&resource.kind, &resource.id));
            }
            let now = Utc::now();
            object.metadata.version = 1;
            object.metadata.phase = Phase::Running;
            object.metadata.created = Some(now);
            object.metadata.updated = Some(now);
            objects.insert(resource, object.clone());
        }
        self.emit(EventKind::Created, &object);
        Ok(object)
    }

    async fn update(&self, object: DynamicObject) -> Result<DynamicObject> {
        let resource = object.metadata.resource_ref();
        let updated = {
            let mut objects = self.objects.lock();
            let current = objects
                .get_mut(&resource)
                .ok_or_else(|| Error::not_found(&resource.kind, &resource.id))?;
            if current.metadata.version != object.metadata.version {
                return Err(Error::conflict(
                    &resource.kind,
                    &resource.id,
                    format!(
                        "version {} is stale, current is {}",
                        object.metadata.version, current.metadata.version
                    ),
                ));
            }
            current.spec = object.spec;
            current.metadata.labels = object.metadata.labels;
            current.metadata.annotations = object.metadata.annotations;
            current.metadata.owner = object.metadata.owner;
            current.metadata.version += 1;
            current.metadata.updated = Some(Utc::now());
            current.clone()
        };
        self.emit(EventKind::Updated, &updated);
        Ok(updated)
    }

    async fn add_finalizer(&self, resource: &ResourceRef, finalizer: &str) -> Result<()> {
        self.mutate(resource, |o| o.metadata.add_finalizer(finalizer))?;
        Ok(())
    }

    async fn remove_finalizer(&self, resource: &ResourceRef, finalizer: &str) -> Result<()> {
        self.mutate(resource, |o| o.metadata.remove_finalizer(finalizer))?;
        Ok(())
    }

    async fn teardown(&self, resource: &ResourceRef) -> Result<bool> {
        let object = self.mutate(resource, |o| {
            if o.metadata.is_tearing_down() {
                return false;
            }
            o.metadata.phase = Phase::TearingDown;
            true
        })?;
        Ok(object.metadata.finalizers.is_empty())
    }

    async fn destroy(&self, resource: &ResourceRef) -> Result<()> {
        let removed = {
            let mut objects = self.objects.lock();
            let current = objects
                .get(resource)
                .ok_or_else(|| Error::not_found(&resource.kind, &resource.id))?;
            if !current.metadata.is_tearing_down() {
                return Err(Error::conflict(
                    &resource.kind,
                    &resource.id,
                    "destroy requires teardown first",
                ));
            }
            if !current.metadata.finalizers.is_empty() {
                return Err(Error::conflict(
                    &resource.kind,
                    &resource.id,
                    format!("finalizers remain: {}", current.metadata.finalizers.join(", ")),
                ));
            }
            objects.remove(resource)
        };
        if let Some(object) = removed {
            self.emit(EventKind::Destroyed, &object);
        }
        Ok(())
    }

    async fn watch(&self, namespace: &str, kind: &str) -> Result<WatchStream> {
        let namespace = namespace.to_string();
        let kind = kind.to_string();
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(move |event| {
            let event = match event {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, kind = %kind, "watcher lagged, events dropped");
                    None
                }
            };
            let event = event.filter(|e| {
                e.object.metadata.namespace == namespace && e.object.metadata.kind == kind
            });
            futures::future::ready(event)
        });
        Ok(stream.boxed())
    }
}
