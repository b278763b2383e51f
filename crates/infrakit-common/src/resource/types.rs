//! Concrete resource types of the provisioning protocol

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Object, ResourceSpec};
use crate::{INFRA_PROVIDER_NAMESPACE, LABEL_INFRA_PROVIDER_ID};

/// Id of the singleton connection parameters resource
pub const CONNECTION_PARAMS_ID: &str = "current";

/// Whether the machine should reach the fleet over a gRPC tunnel
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GrpcTunnelMode {
    /// Use the fleet-wide default
    #[default]
    Unset,
    /// Force the tunnel on
    Enabled,
    /// Force the tunnel off
    Disabled,
}

/// Value written to the machine's META partition
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct MetaValue {
    /// META key
    pub key: u32,
    /// Value stored under the key
    pub value: String,
}

/// Board or platform overlay applied to the image
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Overlay {
    /// Overlay name
    pub name: String,
    /// Overlay image reference
    pub image: String,
}

/// Desired machine, created externally
///
/// Carries the owning provider id as the [`LABEL_INFRA_PROVIDER_ID`] label.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineRequestSpec {
    /// Talos version the machine should boot
    pub talos_version: String,
    /// Extra kernel arguments
    #[serde(default)]
    pub kernel_args: Vec<String>,
    /// System extensions to bake into the image
    #[serde(default)]
    pub extensions: Vec<String>,
    /// META values to bake into the image
    #[serde(default)]
    pub meta_values: Vec<MetaValue>,
    /// Optional overlay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<Overlay>,
    /// gRPC tunnel preference
    #[serde(default)]
    pub grpc_tunnel: GrpcTunnelMode,
    /// Provider-specific data, opaque to the controller (YAML)
    #[serde(default)]
    pub provider_data: String,
}

impl ResourceSpec for MachineRequestSpec {
    const KIND: &'static str = "MachineRequests";
}

/// A machine request
pub type MachineRequest = Object<MachineRequestSpec>;

impl MachineRequest {
    /// Provider that should fulfil this request
    pub fn provider_id(&self) -> Option<&str> {
        self.metadata.labels.get(LABEL_INFRA_PROVIDER_ID)
    }
}

/// Provisioning progress stage
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    /// Not yet observed by the controller
    #[default]
    Unknown,
    /// Steps are running
    Provisioning,
    /// All steps completed; terminal
    Provisioned,
    /// The last step attempt failed
    Failed,
}

/// Progress of one machine request, keyed by the request id
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineRequestStatusSpec {
    /// Resolved machine identity, empty until known
    #[serde(default)]
    pub id: String,
    /// Human-readable progress
    #[serde(default)]
    pub status: String,
    /// Last error, empty when healthy
    #[serde(default)]
    pub error: String,
    /// Progress stage
    #[serde(default)]
    pub stage: Stage,
}

impl ResourceSpec for MachineRequestStatusSpec {
    const KIND: &'static str = "MachineRequestStatuses";
}

/// Status of a machine request
pub type MachineRequestStatus = Object<MachineRequestStatusSpec>;

/// Configuration attached to the eventual machine
///
/// Labeled with the provider id and the originating request id.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatchRequestSpec {
    /// Config patch document
    pub data: String,
}

impl ResourceSpec for ConfigPatchRequestSpec {
    const KIND: &'static str = "ConfigPatchRequests";
}

/// A config patch request
pub type ConfigPatchRequest = Object<ConfigPatchRequestSpec>;

/// A machine that joined the fleet
///
/// The resource id is the machine's unique identity; the originating request
/// is recorded in the machine-request label.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineRegistrationSpec {
    /// Whether the machine currently holds a connection
    #[serde(default)]
    pub connected: bool,
}

impl ResourceSpec for MachineRegistrationSpec {
    const KIND: &'static str = "MachineRegistrations";
}

/// A machine registration
pub type MachineRegistration = Object<MachineRegistrationSpec>;

/// How new machines join the fleet
///
/// Produced by another controller as the singleton [`CONNECTION_PARAMS_ID`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParamsSpec {
    /// Kernel arguments that point the machine at the fleet
    #[serde(default)]
    pub kernel_args: Vec<String>,
    /// Rendered join configuration document
    #[serde(default)]
    pub join_config: String,
    /// Whether the request id is embedded in the join token
    #[serde(default)]
    pub use_request_id_in_join_token: bool,
}

impl ResourceSpec for ConnectionParamsSpec {
    const KIND: &'static str = "ConnectionParams";
}

/// Connection parameters
pub type ConnectionParams = Object<ConnectionParamsSpec>;

/// Provider registration, keyed by provider id
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatusSpec {
    /// Display name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
}

impl ResourceSpec for ProviderStatusSpec {
    const KIND: &'static str = "InfraProviderStatuses";
    const NAMESPACE: &'static str = INFRA_PROVIDER_NAMESPACE;
}

/// Provider registration
pub type ProviderStatus = Object<ProviderStatusSpec>;

/// Provider liveness, keyed by provider id
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealthStatusSpec {
    /// Time of the last heartbeat
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Health check error, empty when healthy
    #[serde(default)]
    pub error: String,
}

impl ResourceSpec for ProviderHealthStatusSpec {
    const KIND: &'static str = "InfraProviderHealthStatuses";
    const NAMESPACE: &'static str = INFRA_PROVIDER_NAMESPACE;
}

/// Provider liveness
pub type ProviderHealthStatus = Object<ProviderHealthStatusSpec>;
