//! Provider-owned resource
//!
//! Each provider keeps its own state type. The controller never sees the
//! concrete type: it works through the [`ProviderState`] capability set and
//! creates empty instances through a [`StateFactory`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DynamicObject, Metadata, ResourceRef, ResourceSpec};
use crate::{Error, Result};

/// Capabilities the controller needs from a provider's state type
pub trait ProviderState: Any + Send + Sync + fmt::Debug {
    /// Resource type the state is stored under
    fn kind(&self) -> &'static str;
    /// Namespace the state is stored in
    fn namespace(&self) -> &'static str;
    /// Encode for the store
    fn marshal(&self) -> Result<Value>;
    /// Replace the contents from a stored value
    fn unmarshal(&mut self, value: Value) -> Result<()>;
    /// Downcast support
    fn as_any(&self) -> &dyn Any;
    /// Downcast support
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T> ProviderState for T
where
    T: ResourceSpec + fmt::Debug,
{
    fn kind(&self) -> &'static str {
        T::KIND
    }

    fn namespace(&self) -> &'static str {
        T::NAMESPACE
    }

    fn marshal(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| Error::serialization_for_kind(T::KIND, e.to_string()))
    }

    fn unmarshal(&mut self, value: Value) -> Result<()> {
        if value.is_null() {
            *self = T::default();
            return Ok(());
        }
        *self = serde_json::from_value(value)
            .map_err(|e| Error::serialization_for_kind(T::KIND, e.to_string()))?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl dyn ProviderState {
    /// Borrow as the concrete state type
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }

    /// Mutably borrow as the concrete state type
    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut()
    }
}

/// Creates an empty instance of a provider's state type
pub type StateFactory = Arc<dyn Fn() -> Box<dyn ProviderState> + Send + Sync>;

/// Factory producing `T::default()`
pub fn state_factory<T>() -> StateFactory
where
    T: ResourceSpec + fmt::Debug,
{
    Arc::new(|| Box::new(T::default()))
}

/// Stored form of a provider resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRecord {
    /// Name of the last completed provisioning step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    /// Provider state payload
    #[serde(default)]
    pub state: Value,
}

/// A provider resource: keyed by the machine request id
///
/// The checkpoint and the state travel in one store object, so a single
/// update records a step's mutations together with its completion.
#[derive(Debug)]
pub struct ProviderResource {
    /// Store metadata
    pub metadata: Metadata,
    /// Last completed step
    pub checkpoint: Option<String>,
    /// Provider state
    pub state: Box<dyn ProviderState>,
}

impl ProviderResource {
    /// Fresh resource for a request, not yet stored
    pub fn new(id: impl Into<String>, state: Box<dyn ProviderState>) -> Self {
        Self {
            metadata: Metadata::new(state.namespace(), state.kind(), id),
            checkpoint: None,
            state,
        }
    }

    /// Reference to the resource `factory` would create for `id`
    pub fn resource_ref(factory: &StateFactory, id: impl Into<String>) -> ResourceRef {
        let empty = factory();
        ResourceRef::new(empty.namespace(), empty.kind(), id)
    }

    /// Decode a stored object
    pub fn from_dynamic(object: DynamicObject, factory: &StateFactory) -> Result<Self> {
        let mut state = factory();
        if object.metadata.kind != state.kind() {
            return Err(Error::serialization_for_kind(
                state.kind(),
                format!("object {} has type {}", object.metadata.id, object.metadata.kind),
            ));
        }
        let record: ProviderRecord = serde_json::from_value(object.spec)
            .map_err(|e| Error::serialization_for_kind(state.kind(), e.to_string()))?;
        state.unmarshal(record.state)?;
        Ok(Self {
            metadata: object.metadata,
            checkpoint: record.checkpoint,
            state,
        })
    }

    /// Encode for the store
    pub fn to_dynamic(&self) -> Result<DynamicObject> {
        let record = ProviderRecord {
            checkpoint: self.checkpoint.clone(),
            state: self.state.marshal()?,
        };
        Ok(DynamicObject {
            metadata: self.metadata.clone(),
            spec: serde_json::to_value(record)?,
        })
    }
}
