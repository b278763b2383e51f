//! Common types for infrakit: resource model, label queries, store contract

#![deny(missing_docs)]

pub mod error;
pub mod query;
pub mod resource;
pub mod retry;
pub mod store;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for fleet-level resources (requests, statuses, patches)
pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespace for provider registration and health resources
pub const INFRA_PROVIDER_NAMESPACE: &str = "infra-provider";

/// Label key carrying the id of the provider that owns a resource
pub const LABEL_INFRA_PROVIDER_ID: &str = "infrakit.dev/infra-provider-id";

/// Label key carrying the originating machine request id
pub const LABEL_MACHINE_REQUEST: &str = "infrakit.dev/machine-request";

/// Label key carrying the provider-side machine identifier
pub const LABEL_MACHINE_INFRA_ID: &str = "infrakit.dev/machine-infra-id";
