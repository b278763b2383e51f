//! Machine request provisioning controller
//!
//! Drives each machine request owned by this provider through the
//! provisioner's steps, checkpointing after every step so a restarted
//! controller resumes where it stopped. Deletion is handed to the teardown
//! cascade in [`crate::teardown`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use infrakit_common::query::Query;
use infrakit_common::resource::{
    ConfigPatchRequestSpec, ConnectionParamsSpec, DynamicObject, MachineRegistrationSpec,
    MachineRequest, MachineRequestSpec, MachineRequestStatus, MachineRequestStatusSpec,
    ProviderHealthStatusSpec, ProviderResource, ProviderStatusSpec, ResourceRef, ResourceSpec,
    Stage, StateFactory, CONNECTION_PARAMS_ID,
};
use infrakit_common::store::{self, ResourceStore};
use infrakit_common::{Error, Result, LABEL_INFRA_PROVIDER_ID, LABEL_MACHINE_REQUEST};

use crate::config::ProvisionConfig;
use crate::pipeline::{ImageFactory, NoImageFactory, ProvisionContext, Provisioner, Step};
use crate::runtime::Action;
use crate::teardown;

/// Status message once every step has completed
pub const PROVISIONED_MESSAGE: &str = "Provisioned";

/// Shared context for the provisioning controller
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(store, provisioner, state_factory::<KvmMachine>())
///     .config(ProvisionConfig::for_provider("kvm"))
///     .image_factory(factory)
///     .build();
/// ```
pub struct Context {
    /// Resource store
    pub store: Arc<dyn ResourceStore>,
    /// Provider-specific logic
    pub provisioner: Arc<dyn Provisioner>,
    /// Creates empty provider state instances
    pub state_factory: StateFactory,
    /// Image-building service used by schematic generation
    pub image_factory: Arc<dyn ImageFactory>,
    /// Controller settings
    pub config: ProvisionConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        store: Arc<dyn ResourceStore>,
        provisioner: Arc<dyn Provisioner>,
        state_factory: StateFactory,
    ) -> ContextBuilder {
        ContextBuilder::new(store, provisioner, state_factory)
    }

    /// Provider id this controller serves
    pub fn provider_id(&self) -> &str {
        &self.config.provider_id
    }

    /// Controller name, also used as the finalizer on machine requests
    pub fn controller_name(&self) -> String {
        format!("provision.infrakit.dev/{}", self.config.provider_id)
    }

    /// Reference to the provider resource for `request_id`
    pub fn provider_resource_ref(&self, request_id: &str) -> ResourceRef {
        ProviderResource::resource_ref(&self.state_factory, request_id)
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    store: Arc<dyn ResourceStore>,
    provisioner: Arc<dyn Provisioner>,
    state_factory: StateFactory,
    image_factory: Option<Arc<dyn ImageFactory>>,
    config: Option<ProvisionConfig>,
}

impl ContextBuilder {
    fn new(
        store: Arc<dyn ResourceStore>,
        provisioner: Arc<dyn Provisioner>,
        state_factory: StateFactory,
    ) -> Self {
        Self {
            store,
            provisioner,
            state_factory,
            image_factory: None,
            config: None,
        }
    }

    /// Set the image factory
    pub fn image_factory(mut self, factory: Arc<dyn ImageFactory>) -> Self {
        self.image_factory = Some(factory);
        self
    }

    /// Set the controller configuration
    pub fn config(mut self, config: ProvisionConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            store: self.store,
            provisioner: self.provisioner,
            state_factory: self.state_factory,
            image_factory: self
                .image_factory
                .unwrap_or_else(|| Arc::new(NoImageFactory)),
            config: self.config.unwrap_or_default(),
        }
    }
}

// =============================================================================
// Controller declaration
// =============================================================================

/// How changes of an input resource reach the reconcile queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputMode {
    /// The changed resource id is the request id
    Direct,
    /// Resolved through [`map_input`]; destroy events are ignored
    Mapped,
    /// Resolved through [`map_input`] on every event, destroy included, so
    /// teardown blocked on this input resumes once it drains
    MappedDestroyReady,
}

/// Whether other controllers may write an output type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// Only this controller writes it
    Exclusive,
    /// Other controllers write it too; always filter by labels
    Shared,
}

/// A watched resource type
#[derive(Clone, Debug)]
pub struct Input {
    /// Namespace of the resource type
    pub namespace: String,
    /// Resource type
    pub kind: String,
    /// How events map to requests
    pub mode: InputMode,
    /// Events whose labels do not match are dropped
    pub selector: Query,
}

impl Input {
    fn of<S: ResourceSpec>(mode: InputMode, selector: Query) -> Self {
        Self {
            namespace: S::NAMESPACE.to_string(),
            kind: S::KIND.to_string(),
            mode,
            selector,
        }
    }

    /// True if this input watches `object`'s type
    pub fn watches(&self, object: &DynamicObject) -> bool {
        self.namespace == object.metadata.namespace && self.kind == object.metadata.kind
    }
}

/// A written resource type
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Output {
    /// Namespace of the resource type
    pub namespace: String,
    /// Resource type
    pub kind: String,
    /// Sharing mode
    pub mode: OutputMode,
}

impl Output {
    fn new(namespace: &str, kind: &str, mode: OutputMode) -> Self {
        Self {
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            mode,
        }
    }
}

/// Inputs and outputs of one provider's controller
#[derive(Clone, Debug)]
pub struct ControllerSpec {
    /// Controller name
    pub name: String,
    /// Machine requests of this provider
    pub primary: Input,
    /// Secondary inputs
    pub inputs: Vec<Input>,
    /// Written resource types
    pub outputs: Vec<Output>,
}

impl ControllerSpec {
    /// Declaration for the controller described by `ctx`
    pub fn for_context(ctx: &Context) -> Self {
        let provider = Query::new().equal(LABEL_INFRA_PROVIDER_ID, ctx.provider_id());
        let resource = ctx.provider_resource_ref("");

        Self {
            name: ctx.controller_name(),
            primary: Input::of::<MachineRequestSpec>(InputMode::Direct, provider.clone()),
            inputs: vec![
                Input::of::<MachineRequestStatusSpec>(InputMode::MappedDestroyReady, Query::new()),
                Input {
                    namespace: resource.namespace.clone(),
                    kind: resource.kind.clone(),
                    mode: InputMode::Direct,
                    selector: Query::new(),
                },
                Input::of::<ConfigPatchRequestSpec>(InputMode::MappedDestroyReady, provider),
                Input::of::<MachineRegistrationSpec>(
                    InputMode::Mapped,
                    Query::new().exists(LABEL_MACHINE_REQUEST),
                ),
                Input::of::<ConnectionParamsSpec>(InputMode::Mapped, Query::new()),
            ],
            outputs: vec![
                Output::new(&resource.namespace, &resource.kind, OutputMode::Exclusive),
                Output::new(
                    MachineRequestStatusSpec::NAMESPACE,
                    MachineRequestStatusSpec::KIND,
                    OutputMode::Exclusive,
                ),
                Output::new(
                    ConfigPatchRequestSpec::NAMESPACE,
                    ConfigPatchRequestSpec::KIND,
                    OutputMode::Shared,
                ),
                Output::new(
                    ProviderStatusSpec::NAMESPACE,
                    ProviderStatusSpec::KIND,
                    OutputMode::Exclusive,
                ),
                Output::new(
                    ProviderHealthStatusSpec::NAMESPACE,
                    ProviderHealthStatusSpec::KIND,
                    OutputMode::Exclusive,
                ),
            ],
        }
    }

    /// Primary input followed by the secondary inputs
    pub fn all_inputs(&self) -> impl Iterator<Item = &Input> {
        std::iter::once(&self.primary).chain(&self.inputs)
    }
}

/// Resolve which requests a changed input resource affects
///
/// Requests, statuses and provider resources share the request id. Config
/// patches and machine registrations carry it as a label and fail to map
/// without one. Connection parameters are global and map to nothing.
pub fn map_input(ctx: &Context, object: &DynamicObject) -> Result<Vec<String>> {
    let md = &object.metadata;
    let resource = ctx.provider_resource_ref(&md.id);

    if md.kind == MachineRequestSpec::KIND
        || md.kind == MachineRequestStatusSpec::KIND
        || (md.kind == resource.kind && md.namespace == resource.namespace)
    {
        return Ok(vec![md.id.clone()]);
    }

    if md.kind == ConfigPatchRequestSpec::KIND || md.kind == MachineRegistrationSpec::KIND {
        return match md.labels.get(LABEL_MACHINE_REQUEST) {
            Some(request_id) => Ok(vec![request_id.to_string()]),
            None => Err(Error::mapping(
                &md.kind,
                &md.id,
                format!("missing label {LABEL_MACHINE_REQUEST}"),
            )),
        };
    }

    if md.kind == ConnectionParamsSpec::KIND {
        return Ok(Vec::new());
    }

    Err(Error::mapping(&md.kind, &md.id, "not an input of this controller"))
}

/// Publish this provider's registration
pub async fn register_provider(ctx: &Context) -> Result<()> {
    let config = &ctx.config;
    store::modify::<ProviderStatusSpec, _>(ctx.store.as_ref(), ctx.provider_id(), |status| {
        status.spec.name = config.name.clone();
        status.spec.description = config.description.clone();
        Ok(())
    })
    .await?;
    info!(provider = %ctx.provider_id(), "provider registered");
    Ok(())
}

// =============================================================================
// Reconcile
// =============================================================================

/// Reconcile one machine request
///
/// Safe to call repeatedly. Returns the next action, or an error for
/// [`error_policy`] to turn into one. Steps race `cancel`; a cancelled step
/// leaves the checkpoint untouched.
#[instrument(skip_all, fields(request = %request_id))]
pub async fn reconcile(
    request_id: &str,
    ctx: Arc<Context>,
    cancel: CancellationToken,
) -> Result<Action> {
    let store = ctx.store.as_ref();

    let Some(request) = store::get::<MachineRequestSpec>(store, request_id).await? else {
        debug!("request not found, nothing to do");
        return Ok(Action::await_change());
    };

    if request.provider_id() != Some(ctx.provider_id()) {
        debug!(owner = ?request.provider_id(), "request belongs to another provider");
        return Ok(Action::await_change());
    }

    if request.metadata.is_tearing_down() {
        let destroyed = teardown::teardown(&ctx, &request).await?;
        if destroyed {
            info!("teardown complete");
        } else {
            debug!("teardown waiting on dependents");
        }
        return Ok(Action::await_change());
    }

    let finalizer = ctx.controller_name();
    if !request.metadata.has_finalizer(&finalizer) {
        store
            .add_finalizer(&request.metadata.resource_ref(), &finalizer)
            .await?;
        debug!(%finalizer, "finalizer added");
    }

    let owner = ctx.controller_name();
    let mut status = store::modify::<MachineRequestStatusSpec, _>(store, request_id, |status| {
        if status.spec.stage == Stage::Unknown {
            status.spec.stage = Stage::Provisioning;
        }
        if status.metadata.owner.is_none() {
            status.metadata.owner = Some(owner.clone());
        }
        Ok(())
    })
    .await?;

    if status.spec.stage == Stage::Provisioned {
        debug!("request already provisioned");
        return Ok(Action::await_change());
    }

    let Some(params) = store::get::<ConnectionParamsSpec>(store, CONNECTION_PARAMS_ID).await? else {
        return Err(Error::requeue(
            ctx.config.connection_params_retry(),
            "waiting for connection parameters",
        ));
    };

    let resource = load_or_create_resource(&ctx, &request).await?;

    if status.spec.id.is_empty() {
        if let Some(uuid) = resolve_machine_uuid(store, request_id).await? {
            info!(machine = %uuid, "machine identity resolved");
            status.spec.id = uuid;
            save_status(store, &mut status).await?;
        }
    }

    let steps = ctx.provisioner.steps();
    let start = resume_index(&steps, resource.checkpoint.as_deref());

    let mut pctx = ProvisionContext::new(
        ctx.provider_id(),
        request.clone(),
        status,
        resource,
        params.spec,
        ctx.store.clone(),
        ctx.image_factory.clone(),
    );

    for (index, step) in steps.iter().enumerate().skip(start) {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        pctx.status.spec.status = format!(
            "Running Step: \"{}\" ({}/{})",
            step.name(),
            index + 1,
            steps.len()
        );
        pctx.status.spec.error.clear();
        pctx.status.spec.stage = Stage::Provisioning;
        save_status(store, &mut pctx.status).await?;

        let before = pctx.status.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = step.run(&mut pctx) => result,
        };

        if let Err(e) = result {
            return Err(record_step_failure(store, before, step, e).await);
        }

        pctx.resource.checkpoint = Some(step.name().to_string());
        let stored = store.update(pctx.resource.to_dynamic()?).await?;
        pctx.resource.metadata = stored.metadata;
        save_status(store, &mut pctx.status).await?;

        debug!(step = %step.name(), "step completed");
    }

    let mut status = pctx.status;
    status.spec.stage = Stage::Provisioned;
    status.spec.status = PROVISIONED_MESSAGE.to_string();
    status.spec.error.clear();
    for (key, value) in request.metadata.labels.iter() {
        status.metadata.labels.set(key, value);
    }
    save_status(store, &mut status).await?;

    info!("request provisioned");
    Ok(Action::await_change())
}

/// Map a reconcile error to the next action
pub fn error_policy(request_id: &str, error: &Error, ctx: &Context) -> Action {
    match error {
        Error::Requeue { after, message } => {
            debug!(request = %request_id, ?after, %message, "requeue requested");
            Action::requeue(*after)
        }
        Error::Cancelled => {
            debug!(request = %request_id, "reconcile cancelled");
            Action::await_change()
        }
        _ => {
            error!(
                error = %error,
                request = %request_id,
                "reconciliation failed"
            );
            Action::requeue(ctx.config.error_backoff())
        }
    }
}

/// Index of the first step still to run after `checkpoint`
fn resume_index(steps: &[Step], checkpoint: Option<&str>) -> usize {
    let Some(checkpoint) = checkpoint else {
        return 0;
    };
    match steps.iter().position(|s| s.name() == checkpoint) {
        Some(done) => done + 1,
        None => {
            warn!(%checkpoint, "checkpoint names an unknown step, restarting from the first step");
            0
        }
    }
}

async fn load_or_create_resource(ctx: &Context, request: &MachineRequest) -> Result<ProviderResource> {
    let store = ctx.store.as_ref();
    let resource_ref = ctx.provider_resource_ref(request.id());

    if let Some(existing) = store.get(&resource_ref).await? {
        return ProviderResource::from_dynamic(existing, &ctx.state_factory);
    }

    let mut resource = ProviderResource::new(request.id(), (ctx.state_factory)());
    resource
        .metadata
        .labels
        .set(LABEL_INFRA_PROVIDER_ID, ctx.provider_id());
    resource.metadata.labels.set(LABEL_MACHINE_REQUEST, request.id());
    resource.metadata.owner = Some(ctx.controller_name());

    let created = store.create(resource.to_dynamic()?).await?;
    debug!(resource = %resource_ref, "provider resource created");
    ProviderResource::from_dynamic(created, &ctx.state_factory)
}

/// Machine identity from the single registration labeled with the request
async fn resolve_machine_uuid(store: &dyn ResourceStore, request_id: &str) -> Result<Option<String>> {
    let query = Query::new().equal(LABEL_MACHINE_REQUEST, request_id);
    let registrations = store::list::<MachineRegistrationSpec>(store, &query).await?;
    match registrations.as_slice() {
        [only] => Ok(Some(only.id().to_string())),
        [] => Ok(None),
        many => {
            warn!(count = many.len(), "several machines registered for one request");
            Ok(None)
        }
    }
}

async fn save_status(store: &dyn ResourceStore, status: &mut MachineRequestStatus) -> Result<()> {
    let stored = store.update(status.to_dynamic()?).await?;
    status.metadata = stored.metadata;
    Ok(())
}

/// Persist a failed step on the status and classify the error
async fn record_step_failure(
    store: &dyn ResourceStore,
    mut status: MachineRequestStatus,
    step: &Step,
    err: Error,
) -> Error {
    if matches!(err, Error::Cancelled) {
        debug!(step = %step.name(), "step cancelled");
        return err;
    }

    status.spec.stage = Stage::Failed;
    status.spec.error = err.status_message();
    if let Err(e) = save_status(store, &mut status).await {
        warn!(step = %step.name(), error = %e, "failed to record step failure");
    }

    match err {
        Error::Requeue { .. } => {
            info!(step = %step.name(), error = %err, "step requested requeue");
            err
        }
        Error::StepFailed { .. } => err,
        other => {
            warn!(step = %step.name(), error = %other, "step failed");
            Error::step_failed(step.name(), other.status_message())
        }
    }
}
