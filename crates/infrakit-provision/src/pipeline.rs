//! Provisioning step pipeline
//!
//! A provider supplies an ordered list of named [`Step`]s. Each step runs
//! against a [`ProvisionContext`] that exposes the request, its status, the
//! provider-owned state and the connection parameters. Steps must tolerate
//! being re-run after a crash between their side effects and the checkpoint.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use infrakit_common::resource::{
    ConfigPatchRequestSpec, ConnectionParamsSpec, GrpcTunnelMode, MachineRequest,
    MachineRequestStatus, MetaValue, Overlay, ProviderResource, ProviderState,
};
use infrakit_common::store::{self, ResourceStore};
use infrakit_common::{
    Error, Result, LABEL_INFRA_PROVIDER_ID, LABEL_MACHINE_INFRA_ID, LABEL_MACHINE_REQUEST,
};

/// Work performed by one provisioning step
#[async_trait]
pub trait StepAction: Send + Sync {
    /// Run the step; return [`Error::Requeue`] to retry later without failing
    async fn run(&self, ctx: &mut ProvisionContext) -> Result<()>;
}

/// A named provisioning step
#[derive(Clone)]
pub struct Step {
    name: String,
    action: Arc<dyn StepAction>,
}

impl Step {
    /// Create a step
    pub fn new(name: impl Into<String>, action: impl StepAction + 'static) -> Self {
        Self {
            name: name.into(),
            action: Arc::new(action),
        }
    }

    /// Step name, recorded as the checkpoint once the step completes
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the step
    pub async fn run(&self, ctx: &mut ProvisionContext) -> Result<()> {
        self.action.run(ctx).await
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("name", &self.name).finish()
    }
}

/// Provider-specific provisioning logic
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Ordered provisioning steps
    fn steps(&self) -> Vec<Step>;

    /// Release the infrastructure backing a request
    ///
    /// `state` is the provider state as it was before teardown. `request` is
    /// `None` when cleaning up an orphan whose request is already gone.
    async fn deprovision(
        &self,
        request_id: &str,
        state: &dyn ProviderState,
        request: Option<&MachineRequest>,
    ) -> Result<()>;

    /// Check that the provider's backend is reachable
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Image customization registered with the image factory
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Schematic {
    /// System extensions, sorted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
    /// Extra kernel arguments, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kernel_args: Vec<String>,
    /// META values, sorted by key
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta_values: Vec<MetaValue>,
    /// Optional overlay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<Overlay>,
}

/// Per-call adjustments to the generated schematic
#[derive(Clone, Debug, Default)]
pub struct SchematicOptions {
    /// Kernel arguments appended after the request's own
    pub extra_kernel_args: Vec<String>,
    /// META values added to the request's own; these win on key collisions
    pub extra_meta_values: Vec<MetaValue>,
    /// Leave out the fleet connection kernel arguments
    pub skip_connection_params: bool,
}

/// External image-building service
#[async_trait]
pub trait ImageFactory: Send + Sync {
    /// Register `schematic` and return its image reference
    async fn ensure_schematic(&self, schematic: &Schematic) -> Result<String>;
}

/// Image factory used when none is configured; every call fails
#[derive(Debug, Default)]
pub struct NoImageFactory;

#[async_trait]
impl ImageFactory for NoImageFactory {
    async fn ensure_schematic(&self, _schematic: &Schematic) -> Result<String> {
        Err(Error::internal_with_context(
            "image-factory",
            "no image factory configured",
        ))
    }
}

/// Everything a step may read or mutate
///
/// Status and provider state mutations are persisted by the controller after
/// the step returns. Config patches are written immediately.
pub struct ProvisionContext {
    provider_id: String,
    request: MachineRequest,
    pub(crate) status: MachineRequestStatus,
    pub(crate) resource: ProviderResource,
    connection_params: ConnectionParamsSpec,
    store: Arc<dyn ResourceStore>,
    image_factory: Arc<dyn ImageFactory>,
}

impl ProvisionContext {
    pub(crate) fn new(
        provider_id: impl Into<String>,
        request: MachineRequest,
        status: MachineRequestStatus,
        resource: ProviderResource,
        connection_params: ConnectionParamsSpec,
        store: Arc<dyn ResourceStore>,
        image_factory: Arc<dyn ImageFactory>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            request,
            status,
            resource,
            connection_params,
            store,
            image_factory,
        }
    }

    /// Id of the request being provisioned
    pub fn request_id(&self) -> &str {
        self.request.id()
    }

    /// The request being provisioned
    pub fn request(&self) -> &MachineRequest {
        &self.request
    }

    /// Requested Talos version
    pub fn talos_version(&self) -> &str {
        &self.request.spec.talos_version
    }

    /// Requested gRPC tunnel mode
    pub fn grpc_tunnel(&self) -> GrpcTunnelMode {
        self.request.spec.grpc_tunnel
    }

    /// Decode the request's provider data into `T`
    ///
    /// An empty blob decodes like an empty mapping.
    pub fn provider_data<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = self.request.spec.provider_data.trim();
        let raw = if raw.is_empty() { "{}" } else { raw };
        serde_yaml::from_str(raw).map_err(|e| {
            Error::serialization_for_kind("providerData", format!("request {}: {e}", self.request_id()))
        })
    }

    /// Provider state
    pub fn state<T: 'static>(&self) -> Result<&T> {
        let kind = self.resource.state.kind();
        self.resource
            .state
            .downcast_ref::<T>()
            .ok_or_else(|| Error::internal_with_context("provision-context", format!("state is not {kind}")))
    }

    /// Provider state, mutably
    pub fn state_mut<T: 'static>(&mut self) -> Result<&mut T> {
        let kind = self.resource.state.kind();
        self.resource
            .state
            .downcast_mut::<T>()
            .ok_or_else(|| Error::internal_with_context("provision-context", format!("state is not {kind}")))
    }

    /// Connection parameters for joining the fleet
    pub fn connection_params(&self) -> &ConnectionParamsSpec {
        &self.connection_params
    }

    /// Rendered join configuration
    pub fn join_config(&self) -> &str {
        &self.connection_params.join_config
    }

    /// Connection kernel arguments followed by the request's own
    pub fn kernel_args(&self) -> Vec<String> {
        self.connection_params
            .kernel_args
            .iter()
            .chain(&self.request.spec.kernel_args)
            .cloned()
            .collect()
    }

    /// Machine identity, once known
    pub fn machine_uuid(&self) -> Option<&str> {
        Some(self.status.spec.id.as_str()).filter(|id| !id.is_empty())
    }

    /// Record the machine identity
    pub fn set_machine_uuid(&mut self, id: impl Into<String>) {
        self.status.spec.id = id.into();
    }

    /// Record the provider-side machine identifier as a status label
    pub fn set_machine_infra_id(&mut self, id: impl Into<String>) {
        self.status.metadata.labels.set(LABEL_MACHINE_INFRA_ID, id);
    }

    /// Create or update the config patch `<request>-<name>`
    ///
    /// The patch is labeled with the provider and request ids, so teardown can
    /// find it without a reference.
    pub async fn create_config_patch(&self, name: &str, data: impl Into<String>) -> Result<()> {
        let id = format!("{}-{}", self.request_id(), name);
        let data = data.into();
        store::modify::<ConfigPatchRequestSpec, _>(self.store.as_ref(), &id, |patch| {
            patch.metadata.labels.set(LABEL_INFRA_PROVIDER_ID, &self.provider_id);
            patch.metadata.labels.set(LABEL_MACHINE_REQUEST, self.request_id());
            patch.spec.data = data.clone();
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Schematic for this request's image
    pub fn schematic(&self, options: &SchematicOptions) -> Schematic {
        let mut extensions = self.request.spec.extensions.clone();
        extensions.sort();
        extensions.dedup();

        let mut kernel_args = Vec::new();
        if !options.skip_connection_params {
            kernel_args.extend(self.connection_params.kernel_args.iter().cloned());
        }
        kernel_args.extend(self.request.spec.kernel_args.iter().cloned());
        kernel_args.extend(options.extra_kernel_args.iter().cloned());

        let mut meta_values: Vec<MetaValue> = Vec::new();
        for value in self
            .request
            .spec
            .meta_values
            .iter()
            .chain(&options.extra_meta_values)
        {
            meta_values.retain(|existing| existing.key != value.key);
            meta_values.push(value.clone());
        }
        meta_values.sort_by_key(|v| v.key);

        Schematic {
            extensions,
            kernel_args,
            meta_values,
            overlay: self.request.spec.overlay.clone(),
        }
    }

    /// Register this request's schematic and return the image reference
    pub async fn generate_schematic_id(&self, options: SchematicOptions) -> Result<String> {
        let schematic = self.schematic(&options);
        self.image_factory.ensure_schematic(&schematic).await
    }
}
