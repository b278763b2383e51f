//! Machine request provisioning for infrakit infrastructure providers
//!
//! A provider implements [`Provisioner`]: an ordered list of [`Step`]s plus a
//! deprovision hook. [`Runtime`] watches the store and drives each machine
//! request labeled with the provider's id through those steps, recording a
//! checkpoint after every step, and tears everything down again when the
//! request is deleted.

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod health;
pub mod pipeline;
pub mod runtime;
pub mod teardown;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ProvisionConfig;
pub use controller::{error_policy, map_input, reconcile, Context, ContextBuilder, ControllerSpec};
pub use health::HealthReporter;
pub use pipeline::{
    ImageFactory, ProvisionContext, Provisioner, Schematic, SchematicOptions, Step, StepAction,
};
pub use runtime::{Action, Runtime};
