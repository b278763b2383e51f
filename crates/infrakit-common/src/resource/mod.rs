//! Resource model shared by the store and controllers
//!
//! Every stored resource is an [`Object`]: store-managed [`Metadata`] plus a
//! spec. Typed specs implement [`ResourceSpec`]; the store itself only deals
//! in [`DynamicObject`]s whose spec is raw JSON.

mod provider;
mod types;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::query::Query;
use crate::{Error, Result, DEFAULT_NAMESPACE};

pub use provider::{state_factory, ProviderRecord, ProviderResource, ProviderState, StateFactory};
pub use types::*;

/// Lifecycle phase of a stored resource
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    /// Normal operation
    #[default]
    Running,
    /// Deletion requested; destroy once finalizers are released
    TearingDown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::TearingDown => write!(f, "tearingDown"),
        }
    }
}

/// Sorted label set
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    /// Value of `key`, if set
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Set `key` to `value`, replacing any previous value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Remove `key`, returning its previous value
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// True if `key` is set
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterate over labels in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of labels
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no labels are set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if the labels satisfy every term of `query`
    pub fn matches(&self, query: &Query) -> bool {
        query.matches(self)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Labels {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Identity of a stored resource
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    /// Namespace
    pub namespace: String,
    /// Resource type
    pub kind: String,
    /// Resource id
    pub id: String,
}

impl ResourceRef {
    /// Build a reference from its parts
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Reference to the resource of spec type `S` with the given id
    pub fn of<S: ResourceSpec>(id: impl Into<String>) -> Self {
        Self::new(S::NAMESPACE, S::KIND, id)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.id)
    }
}

/// Store-managed metadata
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Namespace
    pub namespace: String,
    /// Resource type
    pub kind: String,
    /// Resource id
    pub id: String,
    /// Monotonic version, bumped by the store on every write
    #[serde(default)]
    pub version: u64,
    /// Lifecycle phase
    #[serde(default)]
    pub phase: Phase,
    /// Labels used for queries
    #[serde(default)]
    pub labels: Labels,
    /// Free-form annotations
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Finalizers blocking destruction
    #[serde(default)]
    pub finalizers: Vec<String>,
    /// Controller that owns this resource, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Creation time, set by the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    /// Last write time, set by the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
}

impl Metadata {
    /// Fresh metadata for a resource that has not been stored yet
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            id: id.into(),
            version: 0,
            phase: Phase::Running,
            labels: Labels::default(),
            annotations: BTreeMap::new(),
            finalizers: Vec::new(),
            owner: None,
            created: None,
            updated: None,
        }
    }

    /// Reference to this resource
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef::new(&self.namespace, &self.kind, &self.id)
    }

    /// True if `finalizer` is present
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Add `finalizer`; returns false if it was already present
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Remove `finalizer`; returns false if it was not present
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }

    /// True once deletion has been requested
    pub fn is_tearing_down(&self) -> bool {
        self.phase == Phase::TearingDown
    }
}

/// Typed resource spec
pub trait ResourceSpec:
    Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static
{
    /// Resource type name
    const KIND: &'static str;
    /// Namespace resources of this type live in
    const NAMESPACE: &'static str = DEFAULT_NAMESPACE;
}

/// A stored resource: metadata plus spec
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Object<S> {
    /// Store-managed metadata
    pub metadata: Metadata,
    /// Resource payload
    pub spec: S,
}

/// Untyped resource as exchanged with the store
pub type DynamicObject = Object<serde_json::Value>;

impl<S: ResourceSpec> Object<S> {
    /// New resource of this type with a default spec
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            metadata: Metadata::new(S::NAMESPACE, S::KIND, id),
            spec: S::default(),
        }
    }

    /// Replace the spec
    pub fn with_spec(mut self, spec: S) -> Self {
        self.spec = spec;
        self
    }

    /// Set a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.set(key, value);
        self
    }

    /// Resource id
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    /// Erase the spec type for the store
    pub fn to_dynamic(&self) -> Result<DynamicObject> {
        let spec = serde_json::to_value(&self.spec)
            .map_err(|e| Error::serialization_for_kind(S::KIND, e.to_string()))?;
        Ok(DynamicObject {
            metadata: self.metadata.clone(),
            spec,
        })
    }

    /// Decode a store object into this spec type
    pub fn from_dynamic(object: DynamicObject) -> Result<Self> {
        if object.metadata.kind != S::KIND {
            return Err(Error::serialization_for_kind(
                S::KIND,
                format!("object {} has type {}", object.metadata.id, object.metadata.kind),
            ));
        }
        let spec = serde_json::from_value(object.spec)
            .map_err(|e| Error::serialization_for_kind(S::KIND, e.to_string()))?;
        Ok(Self {
            metadata: object.metadata,
            spec,
        })
    }
}
