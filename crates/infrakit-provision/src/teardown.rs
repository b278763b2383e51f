//! Teardown cascade
//!
//! Deletion runs in gated stages, each re-entered by later reconciles until
//! it completes:
//!
//! 1. config patches labeled with this provider and request
//! 2. the provider resource and the request status
//! 3. the provider's deprovision hook
//! 4. the request's finalizer
//!
//! Not-found at any stage counts as already done.

use tracing::{debug, error, info, instrument, warn};

use infrakit_common::query::Query;
use infrakit_common::resource::{
    ConfigPatchRequestSpec, MachineRequest, MachineRequestSpec, MachineRequestStatusSpec,
    ProviderResource, ProviderState, ResourceRef,
};
use infrakit_common::store::{self, teardown_and_destroy};
use infrakit_common::{Error, Result, LABEL_INFRA_PROVIDER_ID, LABEL_MACHINE_REQUEST};

use crate::controller::Context;

/// Tear down a request's dependents, then release its finalizer
///
/// Returns true once the finalizer is gone and the store may destroy the
/// request.
#[instrument(skip_all, fields(request = %request.id()))]
pub async fn teardown(ctx: &Context, request: &MachineRequest) -> Result<bool> {
    let finalizer = ctx.controller_name();
    // Released already: the cascade and deprovision ran before the release
    if !request.metadata.has_finalizer(&finalizer) {
        debug!(%finalizer, "finalizer already released");
        return Ok(true);
    }

    if !cascade(ctx, request.id(), Some(request)).await? {
        return Ok(false);
    }

    match ctx
        .store
        .remove_finalizer(&request.metadata.resource_ref(), &finalizer)
        .await
    {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }
    info!(%finalizer, "finalizer released");
    Ok(true)
}

/// Remove everything provisioned for `request_id` and deprovision it
///
/// `request` is `None` for orphans whose request no longer exists. Returns
/// false while some stage is still blocked.
pub async fn cascade(ctx: &Context, request_id: &str, request: Option<&MachineRequest>) -> Result<bool> {
    let store = ctx.store.as_ref();

    // Stage 1: config patches. Shared type, so filter by both labels.
    let query = Query::new()
        .equal(LABEL_INFRA_PROVIDER_ID, ctx.provider_id())
        .equal(LABEL_MACHINE_REQUEST, request_id);
    let patches = store::list::<ConfigPatchRequestSpec>(store, &query).await?;

    let mut patches_clear = true;
    for patch in &patches {
        let destroyed = teardown_and_destroy(store, &patch.metadata.resource_ref()).await?;
        if !destroyed {
            debug!(patch = %patch.id(), "config patch still finalized");
        }
        patches_clear &= destroyed;
    }
    if !patches_clear {
        return Ok(false);
    }

    // Stage 2: provider resource and status. Snapshot the state first; the
    // deprovision hook needs it after the resource is gone.
    let resource_ref = ctx.provider_resource_ref(request_id);
    let state: Box<dyn ProviderState> = match store.get(&resource_ref).await? {
        Some(object) => ProviderResource::from_dynamic(object, &ctx.state_factory)?.state,
        None => (ctx.state_factory)(),
    };

    let resource_destroyed = teardown_and_destroy(store, &resource_ref).await?;
    let status_destroyed =
        teardown_and_destroy(store, &ResourceRef::of::<MachineRequestStatusSpec>(request_id)).await?;
    if !(resource_destroyed && status_destroyed) {
        debug!(
            resource_destroyed,
            status_destroyed, "waiting for provider resource and status"
        );
        return Ok(false);
    }

    // Stage 3: deprovision
    ctx.provisioner
        .deprovision(request_id, state.as_ref(), request)
        .await
        .map_err(|e| match e {
            Error::Provider { .. } => e,
            other => Error::provider(ctx.provider_id(), other.to_string()),
        })?;

    info!(request = %request_id, "deprovisioned");
    Ok(true)
}

/// Tear down provider resources whose request no longer exists
///
/// Guards against missed deletion events. Returns the number of orphans fully
/// removed; failures are logged and left for the next sweep.
pub async fn sweep_orphans(ctx: &Context) -> Result<usize> {
    let store = ctx.store.as_ref();
    let kind = ctx.provider_resource_ref("");
    let resources = store.list(&kind.namespace, &kind.kind, &Query::new()).await?;

    let mut removed = 0;
    for resource in resources {
        let request_id = resource.metadata.id.as_str();
        if store::get::<MachineRequestSpec>(store, request_id).await?.is_some() {
            continue;
        }

        warn!(request = %request_id, "found orphaned provider resource");
        match cascade(ctx, request_id, None).await {
            Ok(true) => removed += 1,
            Ok(false) => debug!(request = %request_id, "orphan teardown blocked"),
            Err(e) => error!(request = %request_id, error = %e, "orphan teardown failed"),
        }
    }

    if removed > 0 {
        info!(removed, "orphan sweep complete");
    }
    Ok(removed)
}
