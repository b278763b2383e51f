//! Test fixtures: a scriptable provisioner and a controller harness over the
//! in-memory store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use infrakit_common::resource::{
    state_factory, ConnectionParamsSpec, MachineRequest, MachineRequestSpec, MachineRequestStatus,
    MachineRequestStatusSpec, ProviderResource, ProviderState, ResourceSpec, CONNECTION_PARAMS_ID,
};
use infrakit_common::store::{self, MemoryStore, ResourceStore};
use infrakit_common::{Error, Result, LABEL_INFRA_PROVIDER_ID};

use crate::config::ProvisionConfig;
use crate::controller::{reconcile, Context};
use crate::pipeline::{ProvisionContext, Provisioner, Step, StepAction};
use crate::runtime::Action;

/// Provider state of the test provisioner: names of the steps it ran
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct TestMachine {
    pub completed: Vec<String>,
}

impl ResourceSpec for TestMachine {
    const KIND: &'static str = "TestMachines";
    const NAMESPACE: &'static str = "infra-provider:kvm";
}

#[derive(Default)]
struct Script {
    runs: Vec<String>,
    blocked: HashSet<String>,
    failing: HashMap<String, String>,
    hanging: HashSet<String>,
    deprovisioned: Vec<String>,
    deprovision_states: Vec<TestMachine>,
    deprovision_error: Option<String>,
    health_error: Option<String>,
}

/// Provisioner whose steps record their runs and can be told to block,
/// fail or hang
pub struct TestProvisioner {
    names: Vec<String>,
    script: Arc<Mutex<Script>>,
}

impl TestProvisioner {
    pub fn new(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            script: Arc::default(),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Script) -> T) -> T {
        f(&mut self.script.lock().expect("mutex should not be poisoned"))
    }

    pub fn block_step(&self, name: &str) {
        self.with(|s| s.blocked.insert(name.to_string()));
    }

    pub fn unblock_step(&self, name: &str) {
        self.with(|s| s.blocked.remove(name));
    }

    pub fn fail_step(&self, name: &str, message: &str) {
        self.with(|s| s.failing.insert(name.to_string(), message.to_string()));
    }

    pub fn hang_step(&self, name: &str) {
        self.with(|s| s.hanging.insert(name.to_string()));
    }

    pub fn fail_deprovision(&self, message: Option<&str>) {
        self.with(|s| s.deprovision_error = message.map(String::from));
    }

    pub fn fail_health_check(&self, message: Option<&str>) {
        self.with(|s| s.health_error = message.map(String::from));
    }

    pub fn runs(&self) -> Vec<String> {
        self.with(|s| s.runs.clone())
    }

    pub fn deprovisioned(&self) -> Vec<String> {
        self.with(|s| s.deprovisioned.clone())
    }

    pub fn deprovision_states(&self) -> Vec<TestMachine> {
        self.with(|s| s.deprovision_states.clone())
    }
}

struct ScriptedStep {
    name: String,
    script: Arc<Mutex<Script>>,
}

enum Outcome {
    Run,
    Block,
    Fail(String),
    Hang,
}

#[async_trait]
impl StepAction for ScriptedStep {
    async fn run(&self, ctx: &mut ProvisionContext) -> Result<()> {
        let outcome = {
            let script = self.script.lock().expect("mutex should not be poisoned");
            if script.hanging.contains(&self.name) {
                Outcome::Hang
            } else if script.blocked.contains(&self.name) {
                Outcome::Block
            } else if let Some(message) = script.failing.get(&self.name) {
                Outcome::Fail(message.clone())
            } else {
                Outcome::Run
            }
        };

        match outcome {
            Outcome::Hang => std::future::pending().await,
            Outcome::Block => Err(Error::requeue(
                Duration::from_secs(5),
                format!("{} not ready", self.name),
            )),
            Outcome::Fail(message) => Err(Error::step_failed(&self.name, message)),
            Outcome::Run => {
                self.script
                    .lock()
                    .expect("mutex should not be poisoned")
                    .runs
                    .push(self.name.clone());
                ctx.state_mut::<TestMachine>()?.completed.push(self.name.clone());
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Provisioner for TestProvisioner {
    fn steps(&self) -> Vec<Step> {
        self.names
            .iter()
            .map(|name| {
                Step::new(
                    name.clone(),
                    ScriptedStep {
                        name: name.clone(),
                        script: self.script.clone(),
                    },
                )
            })
            .collect()
    }

    async fn deprovision(
        &self,
        request_id: &str,
        state: &dyn ProviderState,
        _request: Option<&MachineRequest>,
    ) -> Result<()> {
        self.with(|s| {
            if let Some(message) = &s.deprovision_error {
                return Err(Error::provider("kvm", message.clone()));
            }
            s.deprovisioned.push(request_id.to_string());
            if let Some(machine) = state.downcast_ref::<TestMachine>() {
                s.deprovision_states.push(machine.clone());
            }
            Ok(())
        })
    }

    async fn health_check(&self) -> Result<()> {
        match self.with(|s| s.health_error.clone()) {
            Some(message) => Err(Error::provider("kvm", message)),
            None => Ok(()),
        }
    }
}

/// Controller context over a fresh in-memory store
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub provisioner: Arc<TestProvisioner>,
    pub ctx: Arc<Context>,
    connection_params: bool,
}

impl Harness {
    pub fn new(steps: Vec<&str>) -> Self {
        Self::build(steps, true)
    }

    pub fn without_connection_params(steps: Vec<&str>) -> Self {
        Self::build(steps, false)
    }

    fn build(steps: Vec<&str>, connection_params: bool) -> Self {
        let store = Arc::new(MemoryStore::new());
        let provisioner = Arc::new(TestProvisioner::new(&steps));
        let mut config = ProvisionConfig::for_provider("kvm");
        config.name = "KVM".into();
        let ctx = Context::builder(store.clone(), provisioner.clone(), state_factory::<TestMachine>())
            .config(config)
            .build();
        Self {
            store,
            provisioner,
            ctx: Arc::new(ctx),
            connection_params,
        }
    }

    /// Create a request for provider `kvm`, labeled `team=infra`
    pub async fn create_request(&self, id: &str) {
        if self.connection_params {
            store::modify::<ConnectionParamsSpec, _>(self.store.as_ref(), CONNECTION_PARAMS_ID, |p| {
                p.spec.kernel_args = vec!["siderolink.api=grpc://fleet:8090".into()];
                p.spec.join_config = "apiVersion: v1alpha1\n".into();
                Ok(())
            })
            .await
            .expect("connection params should be written");
        }

        let request = MachineRequest::new(id)
            .with_label(LABEL_INFRA_PROVIDER_ID, "kvm")
            .with_label("team", "infra")
            .with_spec(MachineRequestSpec {
                talos_version: "v1.9.0".into(),
                ..Default::default()
            });
        store::create(self.store.as_ref(), &request)
            .await
            .expect("request should be created");
    }

    pub async fn reconcile(&self, id: &str) -> Result<Action> {
        reconcile(id, self.ctx.clone(), CancellationToken::new()).await
    }

    pub async fn request(&self, id: &str) -> Option<MachineRequest> {
        store::get::<MachineRequestSpec>(self.store.as_ref(), id)
            .await
            .expect("get should succeed")
    }

    pub async fn status(&self, id: &str) -> Option<MachineRequestStatus> {
        store::get::<MachineRequestStatusSpec>(self.store.as_ref(), id)
            .await
            .expect("get should succeed")
    }

    pub async fn resource(&self, id: &str) -> Option<ProviderResource> {
        let object = self
            .store
            .get(&self.ctx.provider_resource_ref(id))
            .await
            .expect("get should succeed")?;
        Some(ProviderResource::from_dynamic(object, &self.ctx.state_factory).expect("decode should succeed"))
    }

    /// Write `checkpoint` on the provider resource, creating it if needed;
    /// an empty name clears the checkpoint
    pub async fn seed_checkpoint(&self, id: &str, checkpoint: &str) {
        let checkpoint = Some(checkpoint.to_string()).filter(|c| !c.is_empty());
        match self.resource(id).await {
            Some(mut resource) => {
                resource.checkpoint = checkpoint;
                self.store
                    .update(resource.to_dynamic().expect("encode should succeed"))
                    .await
                    .expect("update should succeed");
            }
            None => {
                let mut resource = ProviderResource::new(id, (self.ctx.state_factory)());
                resource.checkpoint = checkpoint;
                self.store
                    .create(resource.to_dynamic().expect("encode should succeed"))
                    .await
                    .expect("create should succeed");
            }
        }
    }
}
