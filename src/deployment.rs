//! Deployment synthesis and reconciliation.
//!
//! [`PodBuilder`] turns container rows into pod specs.  The output must be
//! byte-for-byte stable for unchanged input: the substrate restarts a pod
//! whenever its spec changes, including when only the order of a list
//! changes.  [`update_deployments`] diffs the synthesized deployments against
//! the substrate and applies the difference.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, ConfigMapVolumeSource, Container as PodContainer, EnvVar, EnvVarSource,
    PodSpec, PodTemplateSpec, SecretKeySelector, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::affinity::to_affinities;
use crate::db::Conn;
use crate::hash::{sha256_hex, short_hash};
use crate::reconcile::{plan, Plan};
use crate::secret::{secret_ref, SecretAccessor, SecretClient};
use crate::substrate::{retry_on_conflict, Backoff, Substrate};
use crate::types::{
    sort_container_values, Container, ContainerValue, Image, ImageStatus, Placement,
};

pub const HOSTNAME_KEY: &str = "steward.io/hostname";
pub const IP_KEY: &str = "steward.io/ip";
pub const SPEC_HASH_KEY: &str = "steward.io/spec-hash";
/// Marks config maps generated from `filepath_to_content`.
pub const FILES_KEY: &str = "steward.io/files";

const FILES_VOLUME: &str = "filepath-to-content";
const SECRET_HASH_PREFIX: &str = "SECRET_HASH_";
const FILE_MODE: i32 = 0o444;

/// Why a container cannot be turned into a pod yet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotReady {
    #[error("image {0} is not built yet")]
    ImageNotBuilt(String),
    #[error("waiting for secrets {0:?}")]
    MissingSecrets(Vec<String>),
}

pub struct PodBuilder<'a> {
    images: HashMap<(String, String), Image>,
    affinities: BTreeMap<String, Affinity>,
    secrets: &'a dyn SecretAccessor,
}

impl<'a> PodBuilder<'a> {
    pub fn new(
        images: &[Image],
        placements: &[Placement],
        secrets: &'a dyn SecretAccessor,
    ) -> Self {
        Self {
            images: images.iter().map(|img| (img.key(), img.clone())).collect(),
            affinities: to_affinities(placements),
            secrets,
        }
    }

    pub fn make_pod(&self, dbc: &Container) -> Result<PodSpec, NotReady> {
        // Images built from a Dockerfile are pulled from the registry the
        // build pushed them to.
        let image = if dbc.dockerfile.is_empty() {
            dbc.image.clone()
        } else {
            match self.images.get(&(dbc.image.clone(), dbc.dockerfile.clone())) {
                Some(img) if img.status == ImageStatus::Built => img.repo_digest.clone(),
                _ => return Err(NotReady::ImageNotBuilt(dbc.image.clone())),
            }
        };

        let (mut env, missing) = secret_hash_env_vars(self.secrets, &dbc.referenced_secrets());
        if !missing.is_empty() {
            return Err(NotReady::MissingSecrets(missing));
        }
        env.extend(to_pod_env_vars(&dbc.env));
        let (mut volumes, mut volume_mounts) = to_pod_volumes(&dbc.filepath_to_content);

        env.sort_by(|a, b| a.name.cmp(&b.name));
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        volume_mounts.sort_by(|a, b| a.mount_path.cmp(&b.mount_path));

        Ok(PodSpec {
            hostname: Some(dbc.hostname.clone()),
            containers: vec![PodContainer {
                name: dbc.hostname.clone(),
                image: Some(image),
                args: non_empty(dbc.command.clone()),
                env: non_empty(env),
                volume_mounts: non_empty(volume_mounts),
                ..Default::default()
            }],
            affinity: self.affinities.get(&dbc.hostname).cloned(),
            dns_policy: Some("Default".to_string()),
            volumes: non_empty(volumes),
            ..Default::default()
        })
    }

    pub fn make_deployment(&self, dbc: &Container) -> Result<Deployment, NotReady> {
        let pod = self.make_pod(dbc)?;

        let selector = BTreeMap::from([(HOSTNAME_KEY.to_string(), dbc.hostname.clone())]);
        let mut pod_labels = selector.clone();
        pod_labels.insert(IP_KEY.to_string(), dbc.ip.clone());

        let spec = DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(dbc.hostname.clone()),
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        };

        Ok(Deployment {
            metadata: ObjectMeta {
                name: Some(dbc.hostname.clone()),
                labels: Some(selector),
                annotations: Some(BTreeMap::from([(
                    SPEC_HASH_KEY.to_string(),
                    spec_hash(&spec),
                )])),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        })
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

fn spec_hash(spec: &DeploymentSpec) -> String {
    match serde_json::to_vec(spec) {
        Ok(bytes) => sha256_hex(&bytes),
        Err(e) => {
            warn!("Failed to encode deployment spec: {}", e);
            String::new()
        }
    }
}

/// One `SECRET_HASH_<name>` variable per secret.  A secret referenced by name
/// looks the same to the substrate after its value changes, the hash makes
/// the pod spec change with it.
///
/// Also returns the names that have no value yet.
pub fn secret_hash_env_vars(
    secrets: &dyn SecretAccessor,
    names: &[String],
) -> (Vec<EnvVar>, Vec<String>) {
    let mut env = Vec::new();
    let mut missing = Vec::new();
    for name in names {
        match secrets.get(name) {
            Some(value) => env.push(EnvVar {
                name: format!("{}{}", SECRET_HASH_PREFIX, name),
                value: Some(sha256_hex(value)),
                ..Default::default()
            }),
            None => missing.push(name.clone()),
        }
    }
    (env, missing)
}

fn to_pod_env_vars(env: &BTreeMap<String, ContainerValue>) -> Vec<EnvVar> {
    let sorted = sort_container_values(env);
    let mut vars: Vec<EnvVar> = sorted
        .plain
        .into_iter()
        .map(|(key, value)| EnvVar {
            name: key.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        })
        .collect();

    for (key, secret) in sorted.secrets {
        let (kube_name, secret_key) = secret_ref(secret);
        vars.push(EnvVar {
            name: key.to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: Some(kube_name),
                    key: secret_key.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    vars
}

fn to_pod_volumes(files: &BTreeMap<String, ContainerValue>) -> (Vec<Volume>, Vec<VolumeMount>) {
    let sorted = sort_container_values(files);
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();

    // Several paths may reference one secret; its volume is mounted once.
    let mut secret_volumes = BTreeSet::new();
    for (path, secret) in sorted.secrets {
        let (kube_name, key) = secret_ref(secret);
        if secret_volumes.insert(kube_name.clone()) {
            volumes.push(Volume {
                name: kube_name.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(kube_name.clone()),
                    default_mode: Some(FILE_MODE),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        mounts.push(VolumeMount {
            name: kube_name,
            mount_path: path.to_string(),
            read_only: Some(true),
            sub_path: Some(key.to_string()),
            ..Default::default()
        });
    }

    if !sorted.plain.is_empty() {
        volumes.push(Volume {
            name: FILES_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(config_map_name(&sorted.plain)),
                default_mode: Some(FILE_MODE),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    for path in sorted.plain.keys() {
        mounts.push(VolumeMount {
            name: FILES_VOLUME.to_string(),
            mount_path: path.to_string(),
            read_only: Some(true),
            sub_path: Some(config_map_key(path)),
            ..Default::default()
        });
    }
    (volumes, mounts)
}

/// Name of the config map holding `files`.  Content addressed, so equal
/// file sets share one config map and a changed file set gets a new one.
pub fn config_map_name(files: &BTreeMap<&str, &str>) -> String {
    let mut encoded = String::new();
    for (path, content) in files {
        encoded.push_str(&format!("{}:{}{}:{}", path.len(), path, content.len(), content));
    }
    format!("files-{}", short_hash(encoded.as_bytes()))
}

/// Config map keys are restricted to `[-._a-zA-Z0-9]`, so paths are hashed.
pub fn config_map_key(path: &str) -> String {
    short_hash(path.as_bytes())
}

pub fn make_config_map(files: &BTreeMap<&str, &str>) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(files)),
            labels: Some(BTreeMap::from([(FILES_KEY.to_string(), "true".to_string())])),
            ..Default::default()
        },
        data: Some(
            files
                .iter()
                .map(|(path, content)| (config_map_key(path), content.to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Everything the substrate should be running.
#[derive(Debug, Default)]
pub struct Desired {
    pub deployments: Vec<Deployment>,
    pub config_maps: Vec<ConfigMap>,
}

pub fn make_desired(
    containers: &[Container],
    images: &[Image],
    placements: &[Placement],
    secrets: &dyn SecretAccessor,
) -> Desired {
    let builder = PodBuilder::new(images, placements, secrets);
    let mut deployments = Vec::new();
    let mut config_maps = BTreeMap::new();
    for dbc in containers.iter().filter(|dbc| !dbc.ip.is_empty()) {
        let deployment = match builder.make_deployment(dbc) {
            Ok(deployment) => deployment,
            Err(reason) => {
                debug!("Container {} is not ready: {}", dbc.hostname, reason);
                continue;
            }
        };
        deployments.push(deployment);

        let files = sort_container_values(&dbc.filepath_to_content).plain;
        if !files.is_empty() {
            let config_map = make_config_map(&files);
            config_maps.insert(config_map.name_any(), config_map);
        }
    }
    Desired {
        deployments,
        config_maps: config_maps.into_values().collect(),
    }
}

fn has_label(labels: &BTreeMap<String, String>, key: &str) -> bool {
    labels.contains_key(key)
}

fn deployment_spec_hash(deployment: &Deployment) -> Option<&String> {
    deployment.annotations().get(SPEC_HASH_KEY)
}

/// Diff desired deployments against the ones this engine manages.
///
/// Matched deployments are compared by their [`SPEC_HASH_KEY`] annotation
/// only.  A hand edit to a managed deployment that leaves the annotation in
/// place is not reverted.
pub fn plan_deployments(desired: Vec<Deployment>, actual: Vec<Deployment>) -> Plan<Deployment> {
    let managed = actual
        .into_iter()
        .filter(|d| has_label(d.labels(), HOSTNAME_KEY))
        .collect();
    plan(
        desired,
        managed,
        |d: &Deployment| d.name_any(),
        |want, have| deployment_spec_hash(want) != deployment_spec_hash(have),
    )
}

/// Reconcile the substrate's deployments and config maps with the
/// containers in `conn`.  Every action is attempted independently; failures
/// are logged and retried on the next pass.
pub async fn update_deployments(conn: &Conn, substrate: &dyn Substrate) {
    let (containers, images, placements) = conn.read(|view| {
        (
            view.select(|dbc: &Container| !dbc.ip.is_empty()),
            view.select(|_: &Image| true),
            view.select(|_: &Placement| true),
        )
    });

    let names: BTreeSet<String> = containers
        .iter()
        .flat_map(Container::referenced_secrets)
        .collect();
    let secrets = match SecretClient::new(substrate).snapshot(&names).await {
        Ok(secrets) => secrets,
        Err(e) => {
            error!("Failed to read secrets: {}", e);
            return;
        }
    };
    let desired = make_desired(&containers, &images, &placements, &secrets);

    let current_deployments = match substrate.list_deployments().await {
        Ok(deployments) => deployments,
        Err(e) => {
            error!("Failed to list current deployments: {}", e);
            return;
        }
    };
    let current_config_maps = match substrate.list_config_maps().await {
        Ok(config_maps) => config_maps,
        Err(e) => {
            error!("Failed to list current config maps: {}", e);
            return;
        }
    };

    let managed_config_maps = current_config_maps
        .into_iter()
        .filter(|cm| has_label(cm.labels(), FILES_KEY))
        .collect();
    // Names are content addressed, so a config map never needs an update.
    let config_map_plan = plan(
        desired.config_maps,
        managed_config_maps,
        |cm: &ConfigMap| cm.name_any(),
        |_, _| false,
    );

    // Pods may only reference config maps that exist, and config maps are
    // only removed once no deployment needs them.
    let mut failed = 0;
    for config_map in &config_map_plan.create {
        let name = config_map.name_any();
        info!("Creating config map {}", name);
        if let Err(e) = substrate.create_config_map(config_map).await {
            error!("Failed to create config map {}: {}", name, e);
            failed += 1;
        }
    }

    failed +=
        apply_deployments(substrate, plan_deployments(desired.deployments, current_deployments))
            .await;

    // Pods of a deployment that failed to move may still mount a stale
    // config map.
    if failed > 0 && !config_map_plan.delete.is_empty() {
        warn!(
            "Keeping {} unused config maps until {} failed changes succeed",
            config_map_plan.delete.len(),
            failed
        );
        return;
    }
    for config_map in &config_map_plan.delete {
        let name = config_map.name_any();
        info!("Deleting config map {}", name);
        if let Err(e) = substrate.delete_config_map(&name).await {
            error!("Failed to delete config map {}: {}", name, e);
        }
    }
}

/// Apply `plan`, returning how many creates and updates failed.
async fn apply_deployments(substrate: &dyn Substrate, plan: Plan<Deployment>) -> usize {
    let mut failed = 0;
    for (desired, _) in &plan.update {
        let name = desired.name_any();
        info!("Updating deployment {}", name);
        let name_ref = name.as_str();
        // Conflicts are benign, the substrate writes to deployments itself
        // to record rollout status.
        let result = retry_on_conflict(Backoff::default(), move || async move {
            let current = substrate.get_deployment(name_ref).await?;
            let mut next = desired.clone();
            next.metadata.resource_version = current.metadata.resource_version;
            substrate.replace_deployment(&next).await
        })
        .await;
        if let Err(e) = result {
            error!("Failed to update deployment {}: {}", name, e);
            failed += 1;
        }
    }

    for deployment in &plan.create {
        let name = deployment.name_any();
        info!("Creating deployment {}", name);
        if let Err(e) = substrate.create_deployment(deployment).await {
            error!("Failed to create deployment {}: {}", name, e);
            failed += 1;
        }
    }

    for deployment in &plan.delete {
        let name = deployment.name_any();
        info!("Deleting deployment {}", name);
        if let Err(e) = substrate.delete_deployment(&name).await {
            error!("Failed to delete deployment {}: {}", name, e);
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::SecretSnapshot;
    use crate::substrate::mock::MockSubstrate;
    use std::convert::Infallible;

    fn container(hostname: &str) -> Container {
        Container {
            hostname: hostname.to_string(),
            ip: "10.0.0.2".to_string(),
            image: "image".to_string(),
            ..Default::default()
        }
    }

    fn env_names(pod: &PodSpec) -> Vec<String> {
        pod.containers[0]
            .env
            .iter()
            .flatten()
            .map(|var| var.name.clone())
            .collect()
    }

    fn env_value(pod: &PodSpec, name: &str) -> Option<String> {
        pod.containers[0]
            .env
            .iter()
            .flatten()
            .find(|var| var.name == name)
            .and_then(|var| var.value.clone())
    }

    #[test]
    fn test_simple_pod() {
        let secrets = SecretSnapshot::default();
        let builder = PodBuilder::new(&[], &[], &secrets);
        let mut dbc = container("host");
        dbc.command = vec!["run".into(), "--fast".into()];

        let pod = builder.make_pod(&dbc).unwrap();
        assert_eq!(pod.hostname.as_deref(), Some("host"));
        assert_eq!(pod.dns_policy.as_deref(), Some("Default"));
        assert_eq!(pod.containers.len(), 1);
        let c = &pod.containers[0];
        assert_eq!(c.name, "host");
        assert_eq!(c.image.as_deref(), Some("image"));
        assert_eq!(c.args, Some(vec!["run".to_string(), "--fast".to_string()]));
        assert!(c.env.is_none());
        assert!(pod.volumes.is_none());
        assert!(pod.affinity.is_none());
    }

    #[test]
    fn test_custom_image() {
        let mut dbc = container("host");
        dbc.dockerfile = "FROM alpine".into();
        let secrets = SecretSnapshot::default();

        let builder = PodBuilder::new(&[], &[], &secrets);
        assert_eq!(
            builder.make_pod(&dbc),
            Err(NotReady::ImageNotBuilt("image".into()))
        );

        let mut image = Image {
            name: "image".into(),
            dockerfile: "FROM alpine".into(),
            status: ImageStatus::Building,
            ..Default::default()
        };
        let builder = PodBuilder::new(std::slice::from_ref(&image), &[], &secrets);
        assert!(builder.make_pod(&dbc).is_err());

        image.status = ImageStatus::Built;
        image.repo_digest = "registry:5000/image@sha256:abc".into();
        let builder = PodBuilder::new(&[image], &[], &secrets);
        let pod = builder.make_pod(&dbc).unwrap();
        assert_eq!(
            pod.containers[0].image.as_deref(),
            Some("registry:5000/image@sha256:abc")
        );
    }

    #[test]
    fn test_secret_gated_readiness() {
        let mut from_env = container("env");
        from_env.env = BTreeMap::from([("PASSWORD".into(), ContainerValue::secret("db"))]);
        let mut from_file = container("file");
        from_file.filepath_to_content =
            BTreeMap::from([("/etc/db".into(), ContainerValue::secret("db"))]);

        let empty = SecretSnapshot::default();
        let builder = PodBuilder::new(&[], &[], &empty);
        for dbc in [&from_env, &from_file] {
            assert_eq!(
                builder.make_pod(dbc),
                Err(NotReady::MissingSecrets(vec!["db".into()]))
            );
        }

        let secrets = SecretSnapshot::from_iter([("db", "hunter2")]);
        let builder = PodBuilder::new(&[], &[], &secrets);
        for dbc in [&from_env, &from_file] {
            let pod = builder.make_pod(dbc).unwrap();
            assert_eq!(
                env_value(&pod, "SECRET_HASH_db"),
                Some(sha256_hex(b"hunter2"))
            );
        }
    }

    #[test]
    fn test_secret_env_and_files() {
        let mut dbc = container("host");
        dbc.env = BTreeMap::from([
            ("PLAIN".into(), ContainerValue::plain("value")),
            ("PASSWORD".into(), ContainerValue::secret("db")),
            ("IGNORED".into(), ContainerValue::runtime("host.ip")),
        ]);
        dbc.filepath_to_content = BTreeMap::from([
            ("/b/secret".into(), ContainerValue::secret("db")),
            ("/a/secret".into(), ContainerValue::secret("db")),
            ("/c/tls".into(), ContainerValue::secret("tls")),
            ("/d/config".into(), ContainerValue::plain("hello")),
        ]);
        let secrets = SecretSnapshot::from_iter([("db", "pw"), ("tls", "cert")]);
        let builder = PodBuilder::new(&[], &[], &secrets);
        let pod = builder.make_pod(&dbc).unwrap();

        assert_eq!(
            env_names(&pod),
            vec!["PASSWORD", "PLAIN", "SECRET_HASH_db", "SECRET_HASH_tls"]
        );
        let password = pod.containers[0]
            .env
            .iter()
            .flatten()
            .find(|var| var.name == "PASSWORD")
            .unwrap();
        assert!(password.value.is_none());
        let selector = password
            .value_from
            .as_ref()
            .unwrap()
            .secret_key_ref
            .as_ref()
            .unwrap();
        assert_eq!(selector.name, Some(secret_ref("db").0));
        assert_eq!(selector.key, "value");

        let volumes = pod.volumes.clone().unwrap();
        let mut expected_volume_names = vec![
            secret_ref("db").0,
            secret_ref("tls").0,
            FILES_VOLUME.to_string(),
        ];
        expected_volume_names.sort();
        assert_eq!(
            volumes.iter().map(|v| v.name.clone()).collect::<Vec<_>>(),
            expected_volume_names
        );
        let files_volume = volumes.iter().find(|v| v.name == FILES_VOLUME).unwrap();
        let files = BTreeMap::from([("/d/config", "hello")]);
        assert_eq!(
            files_volume.config_map.as_ref().unwrap().name,
            Some(config_map_name(&files))
        );

        let mounts = pod.containers[0].volume_mounts.clone().unwrap();
        assert_eq!(
            mounts.iter().map(|m| m.mount_path.as_str()).collect::<Vec<_>>(),
            vec!["/a/secret", "/b/secret", "/c/tls", "/d/config"]
        );
        assert!(mounts.iter().all(|m| m.read_only == Some(true)));
        assert_eq!(mounts[0].name, secret_ref("db").0);
        assert_eq!(mounts[1].name, secret_ref("db").0);
        assert_eq!(mounts[0].sub_path.as_deref(), Some("value"));
        assert_eq!(mounts[3].sub_path, Some(config_map_key("/d/config")));

        // No secret value leaks into the pod spec.
        let encoded = serde_json::to_string(&pod).unwrap();
        assert!(!encoded.contains("\"pw\""));
        assert!(!encoded.contains("cert"));
    }

    #[test]
    fn test_pod_spec_determinism() {
        let mut dbc = container("host");
        for i in (0..20).rev() {
            dbc.env.insert(format!("VAR{}", i), ContainerValue::plain(i.to_string()));
            dbc.env
                .insert(format!("SECRET{}", i), ContainerValue::secret(format!("s{}", i % 3)));
            dbc.filepath_to_content
                .insert(format!("/files/{}", i), ContainerValue::plain("x"));
            dbc.filepath_to_content
                .insert(format!("/secrets/{}", i), ContainerValue::secret(format!("s{}", i % 3)));
        }
        let secrets = SecretSnapshot::from_iter([("s0", "a"), ("s1", "b"), ("s2", "c")]);
        let placements = [Placement {
            target_container: "host".into(),
            provider: Some("Amazon".into()),
            ..Default::default()
        }];

        let outputs: Vec<String> = (0..10)
            .map(|_| {
                let builder = PodBuilder::new(&[], &placements, &secrets);
                serde_json::to_string(&builder.make_deployment(&dbc).unwrap()).unwrap()
            })
            .collect();
        assert!(outputs.windows(2).all(|w| w[0] == w[1]));

        // Insertion order of the source maps is irrelevant.
        let mut reordered = container("host");
        for (k, v) in dbc.env.iter() {
            reordered.env.insert(k.clone(), v.clone());
        }
        for (k, v) in dbc.filepath_to_content.iter().rev() {
            reordered.filepath_to_content.insert(k.clone(), v.clone());
        }
        let builder = PodBuilder::new(&[], &placements, &secrets);
        assert_eq!(
            serde_json::to_string(&builder.make_deployment(&reordered).unwrap()).unwrap(),
            outputs[0]
        );
    }

    #[test]
    fn test_secret_hash_change_detection() {
        let mut dbc = container("host");
        dbc.env = BTreeMap::from([("PASSWORD".into(), ContainerValue::secret("db"))]);

        let old = SecretSnapshot::from_iter([("db", "old")]);
        let new = SecretSnapshot::from_iter([("db", "new")]);
        let old_pod = PodBuilder::new(&[], &[], &old).make_pod(&dbc).unwrap();
        let new_pod = PodBuilder::new(&[], &[], &new).make_pod(&dbc).unwrap();
        assert_ne!(old_pod, new_pod);

        let mut patched = old_pod.clone();
        for var in patched.containers[0].env.iter_mut().flatten() {
            if var.name == "SECRET_HASH_db" {
                var.value = Some(sha256_hex(b"new"));
            }
        }
        assert_eq!(patched, new_pod);
    }

    #[test]
    fn test_secret_hash_uses_raw_bytes() {
        let mut dbc = container("host");
        dbc.env = BTreeMap::from([("KEY".into(), ContainerValue::secret("key"))]);

        let first = SecretSnapshot::from_iter([("key", vec![0xff_u8])]);
        let second = SecretSnapshot::from_iter([("key", vec![0xfe_u8])]);
        let first_pod = PodBuilder::new(&[], &[], &first).make_pod(&dbc).unwrap();
        let second_pod = PodBuilder::new(&[], &[], &second).make_pod(&dbc).unwrap();
        assert_eq!(
            env_value(&first_pod, "SECRET_HASH_key"),
            Some(sha256_hex(&[0xff]))
        );
        assert_ne!(
            env_value(&first_pod, "SECRET_HASH_key"),
            env_value(&second_pod, "SECRET_HASH_key")
        );
    }

    #[test]
    fn test_affinity_is_attached() {
        let secrets = SecretSnapshot::default();
        let placements = [Placement {
            target_container: "host".into(),
            other_container: Some("other".into()),
            exclusive: true,
            ..Default::default()
        }];
        let builder = PodBuilder::new(&[], &placements, &secrets);
        assert!(builder
            .make_pod(&container("host"))
            .unwrap()
            .affinity
            .is_some());
        assert!(builder
            .make_pod(&container("other"))
            .unwrap()
            .affinity
            .is_none());
    }

    #[test]
    fn test_deployment_labels_and_hash() {
        let secrets = SecretSnapshot::default();
        let builder = PodBuilder::new(&[], &[], &secrets);
        let deployment = builder.make_deployment(&container("host")).unwrap();

        assert_eq!(deployment.name_any(), "host");
        assert_eq!(deployment.labels()[HOSTNAME_KEY], "host");
        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(
            spec.selector.match_labels,
            Some(BTreeMap::from([(HOSTNAME_KEY.to_string(), "host".to_string())]))
        );
        let template_labels = spec.template.metadata.as_ref().unwrap().labels.clone().unwrap();
        assert_eq!(template_labels[IP_KEY], "10.0.0.2");
        assert_eq!(
            deployment.annotations()[SPEC_HASH_KEY],
            sha256_hex(&serde_json::to_vec(spec).unwrap())
        );
    }

    #[test]
    fn test_make_desired_skips_unready_and_unaddressed() {
        let mut no_ip = container("no-ip");
        no_ip.ip.clear();
        let mut waiting = container("waiting");
        waiting.env = BTreeMap::from([("X".into(), ContainerValue::secret("missing"))]);
        let mut a = container("a");
        a.filepath_to_content = BTreeMap::from([("/f".into(), ContainerValue::plain("same"))]);
        let mut b = container("b");
        b.filepath_to_content = a.filepath_to_content.clone();

        let secrets = SecretSnapshot::default();
        let desired = make_desired(&[no_ip, waiting, a, b], &[], &[], &secrets);
        assert_eq!(
            desired
                .deployments
                .iter()
                .map(|d| d.name_any())
                .collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(desired.config_maps.len(), 1);
        let data = desired.config_maps[0].data.clone().unwrap();
        assert_eq!(data[&config_map_key("/f")], "same");
    }

    fn deployment(name: &str, hash: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(HOSTNAME_KEY.to_string(), name.to_string())])),
                annotations: Some(BTreeMap::from([(
                    SPEC_HASH_KEY.to_string(),
                    hash.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_deployments() {
        let unmanaged = Deployment {
            metadata: ObjectMeta {
                name: Some("kube-dns".into()),
                ..Default::default()
            },
            ..Default::default()
        };

        let plan = plan_deployments(
            vec![deployment("a", "1"), deployment("b", "1")],
            vec![deployment("b", "1"), deployment("c", "1"), unmanaged.clone()],
        );
        assert_eq!(plan.create, vec![deployment("a", "1")]);
        assert!(plan.update.is_empty());
        assert_eq!(plan.delete, vec![deployment("c", "1")]);

        let plan = plan_deployments(
            vec![deployment("a", "1"), deployment("b", "2")],
            vec![deployment("b", "1"), deployment("c", "1"), unmanaged],
        );
        assert_eq!(plan.update, vec![(deployment("b", "2"), deployment("b", "1"))]);

        // Only the annotation is compared.
        let mut edited = deployment("a", "1");
        edited.spec = Some(DeploymentSpec {
            replicas: Some(3),
            ..Default::default()
        });
        let plan = plan_deployments(vec![deployment("a", "1")], vec![edited]);
        assert!(plan.is_empty());
    }

    fn add_container(conn: &Conn, dbc: Container) {
        conn.txn(|view| {
            let row = view.insert::<Container>();
            view.commit(Container { id: row.id, ..dbc });
            Ok::<_, Infallible>(())
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_update_deployments() {
        let conn = Conn::new();
        let substrate = MockSubstrate::new();

        // Listing failures leave everything untouched.
        add_container(&conn, container("a"));
        substrate.state().fail_lists = true;
        update_deployments(&conn, &substrate).await;
        assert!(substrate.take_actions().is_empty());
        substrate.state().fail_lists = false;

        update_deployments(&conn, &substrate).await;
        assert_eq!(substrate.take_actions(), vec!["create deployment a"]);

        // Nothing changed, nothing to do.
        update_deployments(&conn, &substrate).await;
        assert!(substrate.take_actions().is_empty());

        // A changed container is updated through a conflict.
        conn.txn(|view| {
            let mut dbc = view.select(|_: &Container| true).remove(0);
            dbc.env = BTreeMap::from([("KEY".into(), ContainerValue::plain("value"))]);
            view.commit(dbc);
            Ok::<_, Infallible>(())
        })
        .unwrap();
        substrate.state().conflicts.insert("a".into(), 2);
        update_deployments(&conn, &substrate).await;
        assert_eq!(
            substrate.take_actions(),
            vec![
                "conflict deployment a",
                "conflict deployment a",
                "replace deployment a",
            ]
        );
        update_deployments(&conn, &substrate).await;
        assert!(substrate.take_actions().is_empty());
    }

    #[tokio::test]
    async fn test_update_deployments_is_best_effort() {
        let conn = Conn::new();
        let substrate = MockSubstrate::new();
        substrate.state().deployments.insert("c".into(), deployment("c", "1"));
        substrate.state().broken.insert("a".into());

        let mut b = container("b");
        b.filepath_to_content = BTreeMap::from([("/f".into(), ContainerValue::plain("x"))]);
        add_container(&conn, container("a"));
        add_container(&conn, b);

        update_deployments(&conn, &substrate).await;
        let files = BTreeMap::from([("/f", "x")]);
        assert_eq!(
            substrate.take_actions(),
            vec![
                format!("create configmap {}", config_map_name(&files)),
                "create deployment b".to_string(),
                "delete deployment c".to_string(),
            ]
        );

        // The config map goes away once nothing needs it.
        conn.txn(|view| {
            for dbc in view.select(|dbc: &Container| dbc.hostname == "b") {
                view.remove(&dbc);
            }
            Ok::<_, Infallible>(())
        })
        .unwrap();
        update_deployments(&conn, &substrate).await;
        assert_eq!(substrate.take_actions(), vec!["delete deployment b"]);

        // Deployment a still fails to create, so the config map stays too.
        substrate.state().broken.clear();
        update_deployments(&conn, &substrate).await;
        assert_eq!(
            substrate.take_actions(),
            vec![
                "create deployment a".to_string(),
                format!("delete configmap {}", config_map_name(&files)),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_update_keeps_old_config_map() {
        let conn = Conn::new();
        let substrate = MockSubstrate::new();
        let mut dbc = container("a");
        dbc.filepath_to_content = BTreeMap::from([("/f".into(), ContainerValue::plain("old"))]);
        add_container(&conn, dbc);
        update_deployments(&conn, &substrate).await;
        substrate.take_actions();

        conn.txn(|view| {
            let mut dbc = view.select(|_: &Container| true).remove(0);
            dbc.filepath_to_content =
                BTreeMap::from([("/f".into(), ContainerValue::plain("new"))]);
            view.commit(dbc);
            Ok::<_, Infallible>(())
        })
        .unwrap();
        let old = config_map_name(&BTreeMap::from([("/f", "old")]));
        let new = config_map_name(&BTreeMap::from([("/f", "new")]));

        substrate.state().broken.insert("a".into());
        update_deployments(&conn, &substrate).await;
        assert_eq!(substrate.take_actions(), vec![format!("create configmap {}", new)]);
        assert!(substrate.state().config_maps.contains_key(&old));

        substrate.state().broken.clear();
        update_deployments(&conn, &substrate).await;
        assert_eq!(
            substrate.take_actions(),
            vec![
                "replace deployment a".to_string(),
                format!("delete configmap {}", old),
            ]
        );
    }

    #[tokio::test]
    async fn test_secret_becomes_ready() {
        let conn = Conn::new();
        let substrate = MockSubstrate::new();
        let mut dbc = container("a");
        dbc.env = BTreeMap::from([("PW".into(), ContainerValue::secret("db"))]);
        add_container(&conn, dbc);

        update_deployments(&conn, &substrate).await;
        assert!(substrate.take_actions().is_empty());

        SecretClient::new(&substrate).set("db", "pw").await.unwrap();
        substrate.take_actions();
        update_deployments(&conn, &substrate).await;
        assert_eq!(substrate.take_actions(), vec!["create deployment a"]);

        // A new value rolls the deployment.
        SecretClient::new(&substrate).set("db", "pw2").await.unwrap();
        substrate.take_actions();
        update_deployments(&conn, &substrate).await;
        assert_eq!(substrate.take_actions(), vec!["replace deployment a"]);
    }
}
