//! Named secrets stored in the substrate.
//!
//! Every logical secret maps to one substrate secret whose name is derived
//! from a hash of the logical name, because logical names are free-form and
//! substrate names are not.  The value always lives under [`SECRET_KEY`].

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use log::warn;

use crate::hash::short_hash;
use crate::substrate::{Result, Substrate};

pub const SECRET_KEY: &str = "value";

/// The substrate secret name and key holding the logical secret `name`.
pub fn secret_ref(name: &str) -> (String, &'static str) {
    (format!("secret-{}", short_hash(name.as_bytes())), SECRET_KEY)
}

/// Read access to raw secret values during a single pass.
pub trait SecretAccessor {
    fn get(&self, name: &str) -> Option<&[u8]>;
}

/// Secret values captured at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretSnapshot {
    values: BTreeMap<String, Vec<u8>>,
}

impl SecretAccessor for SecretSnapshot {
    fn get(&self, name: &str) -> Option<&[u8]> {
        self.values.get(name).map(Vec::as_slice)
    }
}

impl<K: Into<String>, V: Into<Vec<u8>>> FromIterator<(K, V)> for SecretSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// The subset of `names` that `secrets` has no value for, in input order.
pub fn missing_secrets(secrets: &dyn SecretAccessor, names: &[String]) -> Vec<String> {
    names
        .iter()
        .filter(|name| secrets.get(name).is_none())
        .cloned()
        .collect()
}

pub struct SecretClient<'a> {
    substrate: &'a dyn Substrate,
}

impl<'a> SecretClient<'a> {
    pub fn new(substrate: &'a dyn Substrate) -> Self {
        Self { substrate }
    }

    /// The raw bytes stored for `name`, or `None` if it has not been set.
    pub async fn get_bytes(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let (kube_name, key) = secret_ref(name);
        let Some(mut secret) = self.substrate.get_secret(&kube_name).await? else {
            return Ok(None);
        };
        let value = secret
            .data
            .as_mut()
            .and_then(|data| data.remove(key))
            .map(|bytes| bytes.0);
        if value.is_none() {
            warn!("Secret {} is malformed: no {} key", kube_name, key);
        }
        Ok(value)
    }

    /// The current value of `name` as text, or `None` if it has not been set.
    pub async fn get(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .get_bytes(name)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub async fn set(&self, name: &str, value: &str) -> Result<()> {
        let (kube_name, key) = secret_ref(name);
        let existing = self.substrate.get_secret(&kube_name).await?;
        let desired = Secret {
            metadata: ObjectMeta {
                name: Some(kube_name),
                resource_version: existing
                    .as_ref()
                    .and_then(|secret| secret.metadata.resource_version.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                key.to_string(),
                ByteString(value.as_bytes().to_vec()),
            )])),
            ..Default::default()
        };

        match existing {
            Some(_) => self.substrate.replace_secret(&desired).await,
            None => self.substrate.create_secret(&desired).await,
        }
    }

    /// Fetch every secret in `names`.  Missing secrets are simply absent
    /// from the snapshot; transport failures abort the whole fetch.
    pub async fn snapshot<I, S>(&self, names: I) -> Result<SecretSnapshot>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut values = BTreeMap::new();
        for name in names {
            let name = name.as_ref();
            if values.contains_key(name) {
                continue;
            }
            if let Some(value) = self.get_bytes(name).await? {
                values.insert(name.to_string(), value);
            }
        }
        Ok(SecretSnapshot { values })
    }
}
