//! Object metadata shared by every stored resource.
use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Metadata carried by every persisted object.
///
/// `resource_version` is an opaque concurrency token owned by the store:
/// every write bumps it, and compare-and-swap updates fail with a conflict
/// when the caller's copy is stale.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Metadata {
    /// Metadata for a namespaced object with no labels.
    pub fn named(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Self::default()
        }
    }
}

/// A type stored and watched through the store.
pub trait Resource {
    /// Kind discriminator, e.g. `"Exporter"`.
    const KIND: &'static str;

    fn meta(&self) -> &Metadata;
    fn meta_mut(&mut self) -> &mut Metadata;

    /// `namespace/name` key used for maps and log fields.
    fn namespaced_name(&self) -> String {
        let meta = self.meta();
        format!("{}/{}", meta.namespace, meta.name)
    }

    /// Reference to this object.
    fn object_ref(&self) -> ObjectRef {
        let meta = self.meta();
        ObjectRef {
            kind: Self::KIND.to_string(),
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
        }
    }
}

/// A typed, namespaced reference to an object.
///
/// Renders as `kind:namespace:name`, the same shape used as the subject of
/// controller-audience tokens.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.namespace, self.name)
    }
}

impl FromStr for ObjectRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split(':').collect::<Vec<_>>()[..] {
            [kind, namespace, name] if !name.is_empty() => Ok(Self {
                kind: kind.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            _ => Err(Error::InvalidObjectRef(s.to_string())),
        }
    }
}
