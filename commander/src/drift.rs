//! Structural comparison of stored rendered manifests against live cluster
//! resources under a masking policy that hides server-managed noise.

use crate::{
    constants::{DRIFT_FETCH_CONCURRENCY, INSTANCE_LABEL_KEY},
    error::{ManifestParseSnafu, Result},
    kube::ClientSet,
    release::HelmRelease,
};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ResultExt;
use std::collections::{BTreeSet, HashSet};

/// Kinds that never live in a namespace; their identity key carries an empty
/// namespace component.
pub const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "StorageClass",
    "PriorityClass",
];

/// Metadata fields the API server manages; stripped before comparison.
const MASKED_METADATA_FIELDS: &[&str] = &[
    "resourceVersion",
    "uid",
    "generation",
    "creationTimestamp",
    "managedFields",
    "selfLink",
];

/// Annotations written by tooling rather than the chart; stripped likewise.
const MASKED_ANNOTATIONS: &[&str] = &[
    "kubectl.kubernetes.io/last-applied-configuration",
    "deployment.kubernetes.io/revision",
];

/// Identity of one manifest resource, stored or live.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ResourceKey {
    /// Empty for cluster-scoped kinds.
    pub namespace: String,
    pub kind: String,
    pub name: String,
    pub api_version: String,
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{} {}", self.api_version, self.kind, self.name)
        } else {
            write!(
                f,
                "{}/{} {}/{}",
                self.api_version, self.kind, self.namespace, self.name
            )
        }
    }
}

/// Comparison outcome for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftVerdict {
    Unchanged,
    Modified,
    MissingLive,
    ExtraLive,
}

/// One differing path with the stored and live values at it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub path: String,
    pub old: Value,
    pub new: Value,
}

/// Drift report entry for one resource of a release.
#[derive(Debug, Clone, Serialize)]
pub struct DiffEntry {
    pub key: ResourceKey,
    pub verdict: DriftVerdict,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<FieldChange>,
    /// Distinguishes degraded lookups (e.g. access denied) from plain absence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Split concatenated rendered YAML into its documents, discarding empty ones
/// and those without a top-level kind.
pub fn split_manifest(manifest_text: &str, release: &str) -> Result<Vec<Value>> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest_text) {
        let value = Value::deserialize(document).context(ManifestParseSnafu {
            release: release.to_string(),
        })?;
        if value.get("kind").and_then(Value::as_str).is_some() {
            documents.push(value);
        }
    }
    Ok(documents)
}

/// Identity key of a stored manifest document. `None` for documents that lack
/// the kind or name to be addressable.
pub fn resource_key(document: &Value, release_namespace: &str) -> Option<ResourceKey> {
    let api_version = document.get("apiVersion")?.as_str()?.to_string();
    let kind = document.get("kind")?.as_str()?.to_string();
    let metadata = document.get("metadata")?;
    let name = metadata.get("name")?.as_str()?.to_string();
    let namespace = if CLUSTER_SCOPED_KINDS.contains(&kind.as_str()) {
        String::new()
    } else {
        metadata
            .get("namespace")
            .and_then(Value::as_str)
            .unwrap_or(release_namespace)
            .to_string()
    };
    Some(ResourceKey {
        namespace,
        kind,
        name,
        api_version,
    })
}

/// Strip server-managed noise from a resource tree. Applied to both sides so
/// the comparison stays symmetric.
pub fn mask(document: &Value) -> Value {
    let mut masked = document.clone();
    if let Some(root) = masked.as_object_mut() {
        root.remove("status");
        if let Some(Value::Object(metadata)) = root.get_mut("metadata") {
            for field in MASKED_METADATA_FIELDS {
                metadata.remove(*field);
            }
            if let Some(Value::Object(annotations)) = metadata.get_mut("annotations") {
                for key in MASKED_ANNOTATIONS {
                    annotations.remove(*key);
                }
            }
        }
    }
    masked
}

/// Recursive structural diff: mappings key-wise, sequences position-wise,
/// scalars by equality with numeric coercion. An empty mapping or sequence is
/// equal to an absent key at the same path.
pub fn structural_diff(stored: &Value, live: &Value) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    walk("", stored, live, &mut changes);
    changes
}

fn walk(path: &str, stored: &Value, live: &Value, changes: &mut Vec<FieldChange>) {
    if values_equal(stored, live) {
        return;
    }
    match (stored, live) {
        (Value::Object(stored), Value::Object(live)) => {
            let keys: BTreeSet<&String> = stored.keys().chain(live.keys()).collect();
            for key in keys {
                let sub_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                walk(
                    &sub_path,
                    stored.get(key).unwrap_or(&Value::Null),
                    live.get(key).unwrap_or(&Value::Null),
                    changes,
                );
            }
        }
        (Value::Array(stored), Value::Array(live)) => {
            for index in 0..stored.len().max(live.len()) {
                walk(
                    &format!("{path}[{index}]"),
                    stored.get(index).unwrap_or(&Value::Null),
                    live.get(index).unwrap_or(&Value::Null),
                    changes,
                );
            }
        }
        _ => changes.push(FieldChange {
            path: path.to_string(),
            old: stored.clone(),
            new: live.clone(),
        }),
    }
}

fn values_equal(stored: &Value, live: &Value) -> bool {
    if stored == live {
        return true;
    }
    if is_absent(stored) && is_absent(live) {
        return true;
    }
    match (coerced_number(stored), coerced_number(live)) {
        (Some(stored), Some(live)) => stored == live,
        _ => false,
    }
}

fn is_absent(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(mapping) => mapping.is_empty(),
        Value::Array(sequence) => sequence.is_empty(),
        _ => false,
    }
}

/// `"3"` and `3` compare equal; nothing else is coerced.
fn coerced_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Compares a release's stored manifest against the live cluster.
pub struct DriftEngine {
    clients: ClientSet,
}

impl DriftEngine {
    pub fn new(clients: ClientSet) -> Self {
        Self { clients }
    }

    /// Diff every stored resource against its live counterpart, optionally
    /// hunting for live resources the release should own but does not store.
    /// Entries are ordered by `(namespace, kind, name)`.
    pub async fn diff(&self, release: &HelmRelease, detect_extra: bool) -> Result<Vec<DiffEntry>> {
        let documents = split_manifest(&release.manifest_text, &release.handle())?;
        let targets: Vec<(ResourceKey, Value)> = documents
            .into_iter()
            .filter_map(|document| {
                resource_key(&document, &release.namespace).map(|key| (key, document))
            })
            .collect();

        let stored_keys: BTreeSet<ResourceKey> =
            targets.iter().map(|(key, _)| key.clone()).collect();
        let kinds: Vec<(String, String)> = targets
            .iter()
            .map(|(key, _)| (key.api_version.clone(), key.kind.clone()))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let results: Vec<Result<DiffEntry>> = stream::iter(targets)
            .map(|(key, stored)| self.diff_one(key, stored))
            .buffer_unordered(DRIFT_FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut entries = Vec::with_capacity(results.len());
        for result in results {
            entries.push(result?);
        }

        if detect_extra {
            entries.extend(self.extra_live(release, &stored_keys, &kinds).await?);
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn diff_one(&self, key: ResourceKey, stored: Value) -> Result<DiffEntry> {
        let namespace = (!key.namespace.is_empty()).then_some(key.namespace.as_str());
        match self
            .clients
            .get_resource(&key.api_version, &key.kind, namespace, &key.name)
            .await
        {
            Ok(live) => {
                let changes = structural_diff(&mask(&stored), &mask(&live));
                let verdict = if changes.is_empty() {
                    DriftVerdict::Unchanged
                } else {
                    DriftVerdict::Modified
                };
                Ok(DiffEntry {
                    key,
                    verdict,
                    changes,
                    note: None,
                })
            }
            Err(error) if error.is_not_found() => Ok(DiffEntry {
                key,
                verdict: DriftVerdict::MissingLive,
                changes: Vec::new(),
                note: None,
            }),
            Err(error) if error.is_fatal() => Err(error),
            Err(error) => Ok(DiffEntry {
                key,
                verdict: DriftVerdict::MissingLive,
                changes: Vec::new(),
                note: Some(format!("live lookup degraded: {error}")),
            }),
        }
    }

    /// Best-effort hunt for live resources labelled as belonging to the
    /// release but absent from its stored manifest. Kinds we cannot list are
    /// skipped.
    async fn extra_live(
        &self,
        release: &HelmRelease,
        stored_keys: &BTreeSet<ResourceKey>,
        kinds: &[(String, String)],
    ) -> Result<Vec<DiffEntry>> {
        let selector = format!("{INSTANCE_LABEL_KEY}={}", release.name);
        let mut extras = Vec::new();

        for (api_version, kind) in kinds {
            let namespace = (!CLUSTER_SCOPED_KINDS.contains(&kind.as_str()))
                .then_some(release.namespace.as_str());
            let objects = match self
                .clients
                .list_labeled(api_version, kind, namespace, &selector)
                .await
            {
                Ok(objects) => objects,
                Err(error) if error.is_fatal() => return Err(error),
                Err(_) => continue,
            };
            for object in objects {
                let name = object
                    .get("metadata")
                    .and_then(|metadata| metadata.get("name"))
                    .and_then(Value::as_str);
                let Some(name) = name else { continue };
                let key = ResourceKey {
                    namespace: namespace.unwrap_or_default().to_string(),
                    kind: kind.clone(),
                    name: name.to_string(),
                    api_version: api_version.clone(),
                };
                if !stored_keys.contains(&key) {
                    extras.push(DiffEntry {
                        key,
                        verdict: DriftVerdict::ExtraLive,
                        changes: Vec::new(),
                        note: None,
                    });
                }
            }
        }
        Ok(extras)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service_document() -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "nginx", "namespace": "web"},
            "spec": {"ports": [{"port": 80}], "selector": {"app": "nginx"}}
        })
    }

    #[test]
    fn manifest_split_discards_empty_and_kindless_documents() {
        let manifest = "---\n\n---\nkind: Service\napiVersion: v1\nmetadata:\n  name: svc\n---\n# only a comment\n---\nfoo: bar\n";
        let documents = split_manifest(manifest, "web/nginx").unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0]["kind"], "Service");
    }

    #[test]
    fn namespace_inherits_from_the_release() {
        let document = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web"}
        });
        let key = resource_key(&document, "default").unwrap();
        assert_eq!(key.namespace, "default");

        let scoped = json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": {"name": "admin", "namespace": "ignored"}
        });
        let key = resource_key(&scoped, "default").unwrap();
        assert_eq!(key.namespace, "");
    }

    #[test]
    fn masking_is_symmetric() {
        let document = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": "nginx",
                "resourceVersion": "12345",
                "uid": "abc",
                "annotations": {
                    "kubectl.kubernetes.io/last-applied-configuration": "{}",
                    "helm.sh/hook": "pre-install"
                }
            },
            "status": {"loadBalancer": {}}
        });
        let masked = mask(&document);
        assert!(structural_diff(&masked, &masked).is_empty());
        assert!(masked.get("status").is_none());
        assert!(masked["metadata"].get("resourceVersion").is_none());
        assert_eq!(masked["metadata"]["annotations"]["helm.sh/hook"], "pre-install");
    }

    #[test]
    fn live_noise_diffs_as_unchanged() {
        let stored = service_document();
        let mut live = service_document();
        live["metadata"]["resourceVersion"] = json!("98765");
        live["metadata"]["uid"] = json!("f00");
        live["metadata"]["managedFields"] = json!([{"manager": "kubectl"}]);
        live["status"] = json!({"loadBalancer": {"ingress": []}});

        assert!(structural_diff(&mask(&stored), &mask(&live)).is_empty());
    }

    #[test]
    fn replica_drift_is_reported_with_old_and_new() {
        let stored = json!({"spec": {"replicas": 3}});
        let live = json!({"spec": {"replicas": 5}});
        let changes = structural_diff(&stored, &live);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "spec.replicas");
        assert_eq!(changes[0].old, json!(3));
        assert_eq!(changes[0].new, json!(5));
    }

    #[test]
    fn numeric_strings_coerce() {
        assert!(structural_diff(&json!({"port": "3"}), &json!({"port": 3})).is_empty());
        assert_eq!(
            structural_diff(&json!({"port": "3"}), &json!({"port": 4})).len(),
            1
        );
    }

    #[test]
    fn empty_collections_equal_absent_keys() {
        let stored = json!({"spec": {"tolerations": [], "selector": {}}});
        let live = json!({"spec": {}});
        assert!(structural_diff(&stored, &live).is_empty());
    }

    #[test]
    fn sequences_diff_position_wise() {
        let stored = json!({"ports": [{"port": 80}, {"port": 443}]});
        let live = json!({"ports": [{"port": 80}]});
        let changes = structural_diff(&stored, &live);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "ports[1]");
        assert_eq!(changes[0].new, Value::Null);
    }

    #[test]
    fn keys_order_by_namespace_kind_name() {
        let mut keys = [
            ResourceKey {
                namespace: "web".into(),
                kind: "Service".into(),
                name: "b".into(),
                api_version: "v1".into(),
            },
            ResourceKey {
                namespace: "".into(),
                kind: "ClusterRole".into(),
                name: "a".into(),
                api_version: "rbac.authorization.k8s.io/v1".into(),
            },
            ResourceKey {
                namespace: "web".into(),
                kind: "Deployment".into(),
                name: "a".into(),
                api_version: "apps/v1".into(),
            },
        ];
        keys.sort();
        assert_eq!(keys[0].kind, "ClusterRole");
        assert_eq!(keys[1].kind, "Deployment");
        assert_eq!(keys[2].kind, "Service");
    }
}
