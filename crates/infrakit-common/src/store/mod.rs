//! Resource store contract
//!
//! The store is the shared, versioned state every controller reads and
//! writes. Deletion is two-phase: [`ResourceStore::teardown`] requests it and
//! reports whether no finalizers remain, [`ResourceStore::destroy`] removes
//! the resource once that is the case.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::query::Query;
use crate::resource::{DynamicObject, Object, ResourceRef, ResourceSpec};
use crate::retry::{retry_with_backoff_if, RetryConfig};
use crate::{Error, Result};

pub use memory::MemoryStore;

/// What happened to a watched resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Resource was created
    Created,
    /// Resource was written (spec, labels, finalizers or phase)
    Updated,
    /// Resource was destroyed
    Destroyed,
}

/// Change notification for one resource
#[derive(Clone, Debug)]
pub struct WatchEvent {
    /// Kind of change
    pub kind: EventKind,
    /// Resource after the change (before it, for [`EventKind::Destroyed`])
    pub object: DynamicObject,
}

/// Stream of change notifications for one resource type
pub type WatchStream = BoxStream<'static, WatchEvent>;

/// Trait abstracting the resource store
///
/// Allows mocking the store in tests while using a real backend in
/// production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Get a resource, `None` if it does not exist
    async fn get(&self, resource: &ResourceRef) -> Result<Option<DynamicObject>>;

    /// List resources of a type whose labels match `query`
    async fn list(&self, namespace: &str, kind: &str, query: &Query) -> Result<Vec<DynamicObject>>;

    /// Create a resource; fails with `AlreadyExists` if present
    async fn create(&self, object: DynamicObject) -> Result<DynamicObject>;

    /// Replace a resource's spec, labels and annotations
    ///
    /// Fails with `Conflict` if `object.metadata.version` is stale. Phase and
    /// finalizers are only changed through their dedicated calls.
    async fn update(&self, object: DynamicObject) -> Result<DynamicObject>;

    /// Add a finalizer (idempotent)
    async fn add_finalizer(&self, resource: &ResourceRef, finalizer: &str) -> Result<()>;

    /// Remove a finalizer (idempotent)
    async fn remove_finalizer(&self, resource: &ResourceRef, finalizer: &str) -> Result<()>;

    /// Request deletion; returns true if the resource can be destroyed now
    async fn teardown(&self, resource: &ResourceRef) -> Result<bool>;

    /// Physically remove a torn-down resource without finalizers
    async fn destroy(&self, resource: &ResourceRef) -> Result<()>;

    /// Subscribe to changes of one resource type
    async fn watch(&self, namespace: &str, kind: &str) -> Result<WatchStream>;
}

/// Attempts for an optimistic read-modify-write before giving up
const MODIFY_ATTEMPTS: u32 = 5;

fn modify_retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: MODIFY_ATTEMPTS,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_secs(1),
        backoff_multiplier: 2.0,
    }
}

/// Get a typed resource
pub async fn get<S: ResourceSpec>(store: &dyn ResourceStore, id: &str) -> Result<Option<Object<S>>> {
    store
        .get(&ResourceRef::of::<S>(id))
        .await?
        .map(Object::from_dynamic)
        .transpose()
}

/// List typed resources matching `query`
pub async fn list<S: ResourceSpec>(store: &dyn ResourceStore, query: &Query) -> Result<Vec<Object<S>>> {
    store
        .list(S::NAMESPACE, S::KIND, query)
        .await?
        .into_iter()
        .map(Object::from_dynamic)
        .collect()
}

/// Create a typed resource
pub async fn create<S: ResourceSpec>(store: &dyn ResourceStore, object: &Object<S>) -> Result<Object<S>> {
    Object::from_dynamic(store.create(object.to_dynamic()?).await?)
}

/// Read-modify-write a typed resource, creating it from `Object::new(id)`
/// if missing. Retried when the write loses a version race.
pub async fn modify<S, F>(store: &dyn ResourceStore, id: &str, mut f: F) -> Result<Object<S>>
where
    S: ResourceSpec,
    F: FnMut(&mut Object<S>) -> Result<()> + Send,
{
    let template = Object::<S>::new(id).to_dynamic()?;
    let object = modify_dynamic(store, template, |dynamic| {
        let mut typed = Object::<S>::from_dynamic(dynamic.clone())?;
        f(&mut typed)?;
        *dynamic = typed.to_dynamic()?;
        Ok(())
    })
    .await?;
    Object::from_dynamic(object)
}

/// Read-modify-write an untyped resource, creating it from `template` if
/// missing. Writes are skipped when `f` leaves the resource unchanged.
pub async fn modify_dynamic<F>(
    store: &dyn ResourceStore,
    template: DynamicObject,
    f: F,
) -> Result<DynamicObject>
where
    F: FnMut(&mut DynamicObject) -> Result<()> + Send,
{
    let resource = template.metadata.resource_ref();
    let operation = format!("modify {resource}");
    let f = Mutex::new(f);
    let (f, template, resource) = (&f, &template, &resource);

    retry_with_backoff_if(&modify_retry_config(), &operation, Error::is_conflict, move || async move {
        match store.get(resource).await? {
            Some(current) => {
                let mut next = current.clone();
                {
                    let mut f = f.lock();
                    (*f)(&mut next)?;
                }
                if next == current {
                    return Ok(current);
                }
                store.update(next).await
            }
            None => {
                let mut next = template.clone();
                {
                    let mut f = f.lock();
                    (*f)(&mut next)?;
                }
                match store.create(next).await {
                    Err(Error::AlreadyExists { kind, id }) => {
                        debug!(resource = %resource, "created concurrently, retrying as update");
                        Err(Error::conflict(kind, id, "created concurrently"))
                    }
                    other => other,
                }
            }
        }
    })
    .await
}

/// Tear down and, once unblocked, destroy a resource
///
/// Returns true when the resource is gone. Not-found on either phase counts
/// as already destroyed.
pub async fn teardown_and_destroy(store: &dyn ResourceStore, resource: &ResourceRef) -> Result<bool> {
    let ready = match store.teardown(resource).await {
        Ok(ready) => ready,
        Err(e) if e.is_not_found() => return Ok(true),
        Err(e) => return Err(e),
    };

    if !ready {
        debug!(resource = %resource, "teardown blocked by finalizers");
        return Ok(false);
    }

    match store.destroy(resource).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(true),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ConfigPatchRequestSpec, MachineRequestStatusSpec, Stage};

    fn patch_ref() -> ResourceRef {
        ResourceRef::of::<ConfigPatchRequestSpec>("req-1-network")
    }

    // ===== teardown_and_destroy =====

    #[tokio::test]
    async fn test_teardown_of_missing_resource_is_destroyed() {
        let mut store = MockResourceStore::new();
        store
            .expect_teardown()
            .returning(|r| Err(Error::not_found(&r.kind, &r.id)));
        store.expect_destroy().never();

        assert!(teardown_and_destroy(&store, &patch_ref()).await.unwrap());
    }

    #[tokio::test]
    async fn test_destroy_not_found_is_success() {
        let mut store = MockResourceStore::new();
        store.expect_teardown().returning(|_| Ok(true));
        store
            .expect_destroy()
            .returning(|r| Err(Error::not_found(&r.kind, &r.id)));

        assert!(teardown_and_destroy(&store, &patch_ref()).await.unwrap());
    }

    #[tokio::test]
    async fn test_blocked_teardown_does_not_destroy() {
        let mut store = MockResourceStore::new();
        store.expect_teardown().returning(|_| Ok(false));
        store.expect_destroy().never();

        assert!(!teardown_and_destroy(&store, &patch_ref()).await.unwrap());
    }

    #[tokio::test]
    async fn test_teardown_propagates_other_errors() {
        let mut store = MockResourceStore::new();
        store
            .expect_teardown()
            .returning(|_| Err(Error::internal("store unavailable")));

        assert!(teardown_and_destroy(&store, &patch_ref()).await.is_err());
    }

    // ===== modify =====

    #[tokio::test]
    async fn test_modify_retries_on_conflict() {
        let existing = Object::<MachineRequestStatusSpec>::new("req-1")
            .to_dynamic()
            .unwrap();

        let mut store = MockResourceStore::new();
        let current = existing.clone();
        store
            .expect_get()
            .returning(move |_| Ok(Some(current.clone())));
        let mut seq = mockall::Sequence::new();
        store
            .expect_update()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|o| Err(Error::conflict(&o.metadata.kind, &o.metadata.id, "stale")));
        store
            .expect_update()
            .times(1)
            .in_sequence(&mut seq)
            .returning(Ok);

        let status = modify::<MachineRequestStatusSpec, _>(&store, "req-1", |s| {
            s.spec.stage = Stage::Provisioning;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(status.spec.stage, Stage::Provisioning);
    }

    #[tokio::test]
    async fn test_modify_gives_up_after_persistent_conflicts() {
        let existing = Object::<MachineRequestStatusSpec>::new("req-1")
            .to_dynamic()
            .unwrap();

        let mut store = MockResourceStore::new();
        store
            .expect_get()
            .returning(move |_| Ok(Some(existing.clone())));
        store
            .expect_update()
            .times(MODIFY_ATTEMPTS as usize)
            .returning(|o| Err(Error::conflict(&o.metadata.kind, &o.metadata.id, "stale")));

        let err = modify::<MachineRequestStatusSpec, _>(&store, "req-1", |s| {
            s.spec.stage = Stage::Failed;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_modify_concurrent_create_retries_as_update() {
        let mut store = MockResourceStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        store
            .expect_create()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|o| Err(Error::already_exists(&o.metadata.kind, &o.metadata.id)));
        let winner = Object::<MachineRequestStatusSpec>::new("req-1")
            .to_dynamic()
            .unwrap();
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(Some(winner.clone())));
        store
            .expect_update()
            .times(1)
            .in_sequence(&mut seq)
            .returning(Ok);

        let status = modify::<MachineRequestStatusSpec, _>(&store, "req-1", |s| {
            s.spec.status = "queued".into();
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(status.spec.status, "queued");
    }

    #[tokio::test]
    async fn test_modify_skips_unchanged_write() {
        let existing = Object::<MachineRequestStatusSpec>::new("req-1")
            .to_dynamic()
            .unwrap();

        let mut store = MockResourceStore::new();
        store
            .expect_get()
            .returning(move |_| Ok(Some(existing.clone())));
        store.expect_update().never();
        store.expect_create().never();

        modify::<MachineRequestStatusSpec, _>(&store, "req-1", |_| Ok(()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_modify_creates_missing_resource() {
        let store = MemoryStore::new();
        let status = modify::<MachineRequestStatusSpec, _>(&store, "req-1", |s| {
            s.spec.status = "queued".into();
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(status.metadata.version, 1);

        let loaded = get::<MachineRequestStatusSpec>(&store, "req-1").await.unwrap().unwrap();
        assert_eq!(loaded.spec.status, "queued");
    }

    #[tokio::test]
    async fn test_modify_error_from_closure_aborts() {
        let store = MemoryStore::new();
        let err = modify::<MachineRequestStatusSpec, _>(&store, "req-1", |_| {
            Err(Error::internal("nope"))
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert!(get::<MachineRequestStatusSpec>(&store, "req-1").await.unwrap().is_none());
    }
}
