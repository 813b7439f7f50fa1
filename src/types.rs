//! Rows of the local relational store.
//!
//! These types are serialised using [`serde`](https://serde.rs/).  The
//! container row doubles as the record written into the replicated store, so
//! every field that is only meaningful on the local node (row id, status, pod
//! name) is skipped during serialisation.  What remains is the replicated
//! identity of the container.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a row inside one table of the local store.
pub type RowId = u64;

/// A value bound to an environment variable or a file path.
///
/// Only `Plain` and `Secret` reach the reconciler in practice.  `Runtime`
/// values name a property that is resolved by the desired-state layer before
/// containers are handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerValue {
    Plain(String),
    Secret(String),
    Runtime(String),
}

impl ContainerValue {
    pub fn plain(value: impl Into<String>) -> Self {
        Self::Plain(value.into())
    }

    pub fn secret(name: impl Into<String>) -> Self {
        Self::Secret(name.into())
    }

    pub fn runtime(key: impl Into<String>) -> Self {
        Self::Runtime(key.into())
    }
}

/// Plain strings and secret references of a value map, split apart.
///
/// Both halves keep the key order of the source map.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SortedValues<'a> {
    pub plain: BTreeMap<&'a str, &'a str>,
    pub secrets: BTreeMap<&'a str, &'a str>,
}

pub fn sort_container_values(values: &BTreeMap<String, ContainerValue>) -> SortedValues<'_> {
    let mut sorted = SortedValues::default();
    for (key, value) in values {
        match value {
            ContainerValue::Plain(s) => {
                sorted.plain.insert(key, s);
            }
            ContainerValue::Secret(name) => {
                sorted.secrets.insert(key, name);
            }
            ContainerValue::Runtime(runtime_key) => {
                log::debug!("Skipping unresolved runtime value {} for {}", runtime_key, key);
            }
        }
    }
    sorted
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    #[serde(skip)]
    pub id: RowId,

    pub hostname: String,
    #[serde(rename = "blueprintID")]
    pub blueprint_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub minion: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dockerfile: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, ContainerValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filepath_to_content: BTreeMap<String, ContainerValue>,

    #[serde(skip)]
    pub status: String,
    #[serde(skip)]
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

impl Container {
    /// Names of every secret referenced from `env` or `filepath_to_content`,
    /// sorted and deduplicated.
    pub fn referenced_secrets(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for value in self.env.values().chain(self.filepath_to_content.values()) {
            match value {
                ContainerValue::Secret(name) => {
                    names.insert(name.clone());
                }
                ContainerValue::Plain(_) | ContainerValue::Runtime(_) => {}
            }
        }
        names.into_iter().collect()
    }

    /// Canonical encoding of the replicated fields.  Two rows with equal keys
    /// describe the same desired container.
    pub fn replicated_key(&self) -> String {
        // Every map in the row is a BTreeMap, so the encoding is stable.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[default]
    Worker,
    Master,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Minion {
    pub id: RowId,
    pub is_self: bool,
    pub role: Role,
    pub private_ip: String,
    pub provider: String,
    pub region: String,
    pub size: String,
    pub floating_ip: String,
}

/// Membership metadata of the replicated store as seen by this process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EtcdRecord {
    pub id: RowId,
    pub leader: bool,
    pub etcd_ips: Vec<String>,
}

/// A scheduling rule for `target_container`.
///
/// With `other_container` set the rule is about colocation; the host
/// attributes restrict which nodes the target may land on.  `exclusive`
/// inverts either kind of rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    pub id: RowId,
    pub target_container: String,
    pub other_container: Option<String>,
    pub exclusive: bool,
    pub provider: Option<String>,
    pub region: Option<String>,
    pub size: Option<String>,
    pub floating_ip: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImageStatus {
    #[default]
    Building,
    Built,
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageStatus::Building => write!(f, "building"),
            ImageStatus::Built => write!(f, "built"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    pub id: RowId,
    pub name: String,
    pub dockerfile: String,
    pub status: ImageStatus,
    pub repo_digest: String,
}

impl Image {
    /// Images are identified by the pair of name and Dockerfile contents.
    pub fn key(&self) -> (String, String) {
        (self.name.clone(), self.dockerfile.clone())
    }
}
