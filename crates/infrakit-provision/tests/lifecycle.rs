//! End-to-end lifecycle of a machine request through the controller runtime
//!
//! Runs [`Runtime`] against the in-memory store with a small provisioner and
//! drives requests the way a user would: create, wait, delete.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use infrakit_common::resource::{
    state_factory, ConfigPatchRequestSpec, ConnectionParamsSpec, MachineRequest,
    MachineRequestSpec, MachineRequestStatusSpec, ProviderState, ProviderStatusSpec, ResourceRef,
    ResourceSpec, Stage, CONNECTION_PARAMS_ID,
};
use infrakit_common::store::{self, MemoryStore, ResourceStore};
use infrakit_common::{Error, Result, LABEL_INFRA_PROVIDER_ID, LABEL_MACHINE_INFRA_ID};
use infrakit_provision::{
    Context, ProvisionConfig, ProvisionContext, Provisioner, Runtime, Step, StepAction,
};

const PATCH_FINALIZER: &str = "config.infrakit.dev/merge";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct KvmMachine {
    vm_name: String,
    address: String,
}

impl ResourceSpec for KvmMachine {
    const KIND: &'static str = "KvmMachines";
    const NAMESPACE: &'static str = "infra-provider:kvm";
}

struct CreateVm;

#[async_trait]
impl StepAction for CreateVm {
    async fn run(&self, ctx: &mut ProvisionContext) -> Result<()> {
        let vm_name = format!("vm-{}", ctx.request_id());
        ctx.state_mut::<KvmMachine>()?.vm_name = vm_name.clone();
        ctx.set_machine_infra_id(vm_name);
        Ok(())
    }
}

struct AttachNetwork;

#[async_trait]
impl StepAction for AttachNetwork {
    async fn run(&self, ctx: &mut ProvisionContext) -> Result<()> {
        ctx.create_config_patch("network", "machine:\n  network: {}\n")
            .await
    }
}

struct WaitForIp {
    ready: Arc<AtomicBool>,
}

#[async_trait]
impl StepAction for WaitForIp {
    async fn run(&self, ctx: &mut ProvisionContext) -> Result<()> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(Error::requeue(Duration::from_millis(20), "address not assigned"));
        }
        ctx.state_mut::<KvmMachine>()?.address = "10.5.0.2".into();
        Ok(())
    }
}

#[derive(Default)]
struct KvmProvisioner {
    ip_ready: Arc<AtomicBool>,
    deprovisioned: Mutex<Vec<(String, KvmMachine)>>,
}

impl KvmProvisioner {
    fn deprovisioned(&self) -> Vec<(String, KvmMachine)> {
        self.deprovisioned.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provisioner for KvmProvisioner {
    fn steps(&self) -> Vec<Step> {
        vec![
            Step::new("createVM", CreateVm),
            Step::new("attachNetwork", AttachNetwork),
            Step::new(
                "waitForIP",
                WaitForIp {
                    ready: self.ip_ready.clone(),
                },
            ),
        ]
    }

    async fn deprovision(
        &self,
        request_id: &str,
        state: &dyn ProviderState,
        _request: Option<&MachineRequest>,
    ) -> Result<()> {
        let machine = state.downcast_ref::<KvmMachine>().cloned().unwrap_or_default();
        self.deprovisioned
            .lock()
            .unwrap()
            .push((request_id.to_string(), machine));
        Ok(())
    }
}

struct Cluster {
    store: Arc<MemoryStore>,
    provisioner: Arc<KvmProvisioner>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl Cluster {
    async fn start() -> Self {
        let store = Arc::new(MemoryStore::new());
        store::modify::<ConnectionParamsSpec, _>(store.as_ref(), CONNECTION_PARAMS_ID, |params| {
            params.spec.kernel_args = vec!["siderolink.api=grpc://fleet:8090".into()];
            Ok(())
        })
        .await
        .unwrap();

        let provisioner = Arc::new(KvmProvisioner::default());
        let mut config = ProvisionConfig::for_provider("kvm");
        config.name = "KVM".into();
        config.description = "Local KVM hypervisor".into();
        config.error_backoff_secs = 1;
        let ctx = Context::builder(store.clone(), provisioner.clone(), state_factory::<KvmMachine>())
            .config(config)
            .build();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Runtime::new(Arc::new(ctx)).run(cancel.clone()));

        Self {
            store,
            provisioner,
            cancel,
            handle,
        }
    }

    async fn create_request(&self, id: &str) {
        let request = MachineRequest::new(id)
            .with_label(LABEL_INFRA_PROVIDER_ID, "kvm")
            .with_spec(MachineRequestSpec {
                talos_version: "v1.9.0".into(),
                ..Default::default()
            });
        store::create(self.store.as_ref(), &request).await.unwrap();
    }

    async fn stage(&self, id: &str) -> Option<Stage> {
        store::get::<MachineRequestStatusSpec>(self.store.as_ref(), id)
            .await
            .unwrap()
            .map(|status| status.spec.stage)
    }

    /// Mark the request for deletion and destroy it once released
    async fn delete_request(&self, id: &str) {
        let resource = ResourceRef::of::<MachineRequestSpec>(id);
        self.store.teardown(&resource).await.unwrap();
        let store = self.store.clone();
        let released = resource.clone();
        eventually("request finalizer released", move || {
            let store = store.clone();
            let resource = released.clone();
            async move {
                store
                    .get(&resource)
                    .await
                    .unwrap()
                    .is_some_and(|r| r.metadata.finalizers.is_empty())
            }
        })
        .await;
        self.store.destroy(&resource).await.unwrap();
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("runtime should stop")
            .expect("runtime task should not panic")
            .expect("runtime should exit cleanly");
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for_stage(cluster: &Cluster, id: &str, stage: Stage) {
    for _ in 0..300 {
        if cluster.stage(id).await == Some(stage) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("request {id} never reached {stage:?}");
}

// =============================================================================
// Lifecycle Stories
// =============================================================================

/// Story: a request is provisioned once its address arrives, then deleted.
/// Deletion removes the config patch, the provider resource and the status,
/// and hands the provisioned state to deprovision.
#[tokio::test]
async fn story_request_provisioned_and_deleted() {
    let cluster = Cluster::start().await;
    cluster.create_request("req-1").await;

    // Blocked on the address; retried without any store change
    wait_for_stage(&cluster, "req-1", Stage::Failed).await;
    let status = store::get::<MachineRequestStatusSpec>(cluster.store.as_ref(), "req-1")
        .await
        .unwrap()
        .unwrap();
    assert!(status.spec.error.contains("address not assigned"));

    cluster.provisioner.ip_ready.store(true, Ordering::SeqCst);
    wait_for_stage(&cluster, "req-1", Stage::Provisioned).await;

    let status = store::get::<MachineRequestStatusSpec>(cluster.store.as_ref(), "req-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.spec.status, "Provisioned");
    assert!(status.spec.error.is_empty());
    assert_eq!(status.metadata.labels.get(LABEL_MACHINE_INFRA_ID), Some("vm-req-1"));

    let patch = store::get::<ConfigPatchRequestSpec>(cluster.store.as_ref(), "req-1-network")
        .await
        .unwrap();
    assert!(patch.is_some());

    let provider = store::get::<ProviderStatusSpec>(cluster.store.as_ref(), "kvm")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(provider.spec.name, "KVM");

    cluster.delete_request("req-1").await;

    assert!(cluster.stage("req-1").await.is_none());
    assert!(store::get::<ConfigPatchRequestSpec>(cluster.store.as_ref(), "req-1-network")
        .await
        .unwrap()
        .is_none());
    let deprovisioned = cluster.provisioner.deprovisioned();
    assert_eq!(deprovisioned.len(), 1);
    assert_eq!(deprovisioned[0].0, "req-1");
    assert_eq!(deprovisioned[0].1.vm_name, "vm-req-1");
    assert_eq!(deprovisioned[0].1.address, "10.5.0.2");

    cluster.shutdown().await;
}

/// Story: another controller holds the config patch. Deletion waits for it
/// and resumes on its own once the patch is released.
#[tokio::test]
async fn story_deletion_waits_for_held_config_patch() {
    let cluster = Cluster::start().await;
    cluster.provisioner.ip_ready.store(true, Ordering::SeqCst);
    cluster.create_request("req-2").await;
    wait_for_stage(&cluster, "req-2", Stage::Provisioned).await;

    let patch = ResourceRef::of::<ConfigPatchRequestSpec>("req-2-network");
    cluster
        .store
        .add_finalizer(&patch, PATCH_FINALIZER)
        .await
        .unwrap();

    let request = ResourceRef::of::<MachineRequestSpec>("req-2");
    cluster.store.teardown(&request).await.unwrap();

    // Give the controller time to run into the held patch
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cluster.provisioner.deprovisioned().is_empty());
    assert!(cluster.stage("req-2").await.is_some());
    let held = cluster.store.get(&request).await.unwrap().unwrap();
    assert!(!held.metadata.finalizers.is_empty());

    cluster
        .store
        .remove_finalizer(&patch, PATCH_FINALIZER)
        .await
        .unwrap();
    cluster.delete_request("req-2").await;

    assert_eq!(cluster.provisioner.deprovisioned().len(), 1);
    assert!(cluster.store.get(&patch).await.unwrap().is_none());

    cluster.shutdown().await;
}

/// Story: requests labeled for another provider are never touched.
#[tokio::test]
async fn story_foreign_requests_are_ignored() {
    let cluster = Cluster::start().await;
    cluster.provisioner.ip_ready.store(true, Ordering::SeqCst);

    let foreign = MachineRequest::new("req-aws").with_label(LABEL_INFRA_PROVIDER_ID, "aws");
    store::create(cluster.store.as_ref(), &foreign).await.unwrap();
    cluster.create_request("req-3").await;
    wait_for_stage(&cluster, "req-3", Stage::Provisioned).await;

    assert!(cluster.stage("req-aws").await.is_none());
    let foreign = cluster
        .store
        .get(&ResourceRef::of::<MachineRequestSpec>("req-aws"))
        .await
        .unwrap()
        .unwrap();
    assert!(foreign.metadata.finalizers.is_empty());

    cluster.shutdown().await;
}
