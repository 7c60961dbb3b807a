//! Reconstructing [`HelmRelease`]s from their storage objects.
//!
//! Two decode strategies, dispatched on storage kind, share the final
//! JSON-to-record step: Secrets carry `base64(gzip(json))` in the `release`
//! data field, legacy ConfigMaps wrap that in one more base64 layer.

use crate::{
    constants::{
        HELM_OWNER_LABEL_KEY, HELM_OWNER_LABEL_VALUE, HELM_SECRET_TYPE, RELEASE_DATA_KEY,
        RELEASE_NAME_LABEL, RELEASE_STATUS_LABEL, RELEASE_VERSION_LABEL,
    },
    error::{CorruptPayloadSnafu, Result, UnknownStorageSnafu, UnsupportedSchemaSnafu},
    release::{HelmRelease, ReleaseStatus, StorageKind},
};
use base64::engine::{general_purpose::STANDARD, Engine as base64_engine};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::ResourceExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use snafu::ensure;
use std::{collections::BTreeMap, io::Read};

/// Decode a full release from a `helm.sh/release.v1` Secret.
pub fn decode_secret(secret: &Secret) -> Result<HelmRelease> {
    let object = object_handle("Secret", secret.namespace().as_deref(), &secret.name_any());

    ensure!(
        secret.type_.as_deref() == Some(HELM_SECRET_TYPE) && has_helm_owner(secret.labels()),
        UnknownStorageSnafu {
            object: object.clone()
        }
    );

    let payload = secret
        .data
        .as_ref()
        .and_then(|data| data.get(RELEASE_DATA_KEY))
        .ok_or_else(|| {
            UnknownStorageSnafu {
                object: object.clone(),
            }
            .build()
        })?;

    let json = decode_decompress_data(&payload.0, &object)?;
    release_from_json(
        &json,
        StorageKind::Secret,
        &secret.name_any(),
        secret.namespace().as_deref(),
        &object,
    )
}

/// Decode a full release from a legacy Helm ConfigMap.
pub fn decode_configmap(configmap: &ConfigMap) -> Result<HelmRelease> {
    let object = object_handle(
        "ConfigMap",
        configmap.namespace().as_deref(),
        &configmap.name_any(),
    );

    ensure!(
        has_helm_owner(configmap.labels()),
        UnknownStorageSnafu {
            object: object.clone()
        }
    );

    let payload = configmap
        .data
        .as_ref()
        .and_then(|data| data.get(RELEASE_DATA_KEY))
        .ok_or_else(|| {
            UnknownStorageSnafu {
                object: object.clone(),
            }
            .build()
        })?;

    // ConfigMap data is a string; Helm's own base64 layer sits under one more
    // transport base64 layer here.
    let inner = STANDARD
        .decode(payload.as_bytes())
        .map_err(|error| corrupt(&object, format!("outer base64 decode failed: {error}")))?;
    let json = decode_decompress_data(&inner, &object)?;
    release_from_json(
        &json,
        StorageKind::ConfigMap,
        &configmap.name_any(),
        configmap.namespace().as_deref(),
        &object,
    )
}

/// The listing fast path: synthesize a release summary from storage labels
/// alone, leaving the payload untouched. Payload-backed fields stay empty.
pub fn summarize_labels(
    storage_kind: StorageKind,
    object_name: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    created_at: Option<DateTime<Utc>>,
) -> Result<HelmRelease> {
    let object = format!("{storage_kind} '{namespace}/{object_name}'");

    ensure!(
        labels.get(HELM_OWNER_LABEL_KEY).map(String::as_str) == Some(HELM_OWNER_LABEL_VALUE),
        UnknownStorageSnafu {
            object: object.clone()
        }
    );
    let name = labels.get(RELEASE_NAME_LABEL).ok_or_else(|| {
        UnknownStorageSnafu {
            object: object.clone(),
        }
        .build()
    })?;

    let revision = labels
        .get(RELEASE_VERSION_LABEL)
        .and_then(|version| version.parse::<u64>().ok())
        .ok_or_else(|| corrupt(&object, "version label is absent or non-numeric".to_string()))?;

    let status = labels
        .get(RELEASE_STATUS_LABEL)
        .map(|status| ReleaseStatus::parse(status))
        .unwrap_or(ReleaseStatus::Unknown);

    Ok(HelmRelease {
        name: name.clone(),
        namespace: namespace.to_string(),
        revision,
        status,
        chart_name: String::new(),
        chart_version: String::new(),
        app_version: String::new(),
        updated_at: created_at,
        description: String::new(),
        values_user: Map::new(),
        values_computed: Map::new(),
        manifest_text: String::new(),
        hooks: Vec::new(),
        storage_kind,
        storage_object_name: object_name.to_string(),
    })
}

/// Decode from base64 and decompress from gzip a buffer of helm release data.
fn decode_decompress_data(data: &[u8], object: &str) -> Result<Vec<u8>> {
    let compressed = STANDARD
        .decode(data)
        .map_err(|error| corrupt(object, format!("base64 decode failed: {error}")))?;

    let mut decoder = GzDecoder::new(&compressed[..]);
    let mut decompressed: Vec<u8> = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|error| corrupt(object, format!("gzip decompression failed: {error}")))?;

    Ok(decompressed)
}

/// Deserialization targets for the helm release JSON schema. Open-shaped
/// sections (values, manifests, hooks) stay as plain JSON trees.
#[derive(Debug, Deserialize)]
struct RawRelease {
    name: Option<String>,
    namespace: Option<String>,
    version: Option<u64>,
    info: Option<RawInfo>,
    chart: Option<RawChart>,
    config: Option<Value>,
    manifest: Option<String>,
    hooks: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    status: Option<String>,
    last_deployed: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawChart {
    metadata: Option<RawChartMetadata>,
    values: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawChartMetadata {
    name: Option<String>,
    version: Option<String>,
    #[serde(rename = "appVersion")]
    app_version: Option<String>,
}

/// The shared JSON-to-record step of both decode pipelines.
fn release_from_json(
    json: &[u8],
    storage_kind: StorageKind,
    object_name: &str,
    object_namespace: Option<&str>,
    object: &str,
) -> Result<HelmRelease> {
    let raw: RawRelease = serde_json::from_slice(json)
        .map_err(|error| corrupt(object, format!("JSON parse failed: {error}")))?;

    let required = |field: &str| UnsupportedSchemaSnafu {
        object: object.to_string(),
        field: field.to_string(),
    };

    let name = raw.name.ok_or_else(|| required("name").build())?;
    let namespace = raw
        .namespace
        .or_else(|| object_namespace.map(str::to_string))
        .ok_or_else(|| required("namespace").build())?;
    let revision = raw.version.ok_or_else(|| required("version").build())?;
    let info = raw.info.ok_or_else(|| required("info").build())?;
    let status = info.status.ok_or_else(|| required("info.status").build())?;
    let last_deployed = info
        .last_deployed
        .ok_or_else(|| required("info.last_deployed").build())?;
    let chart = raw.chart.ok_or_else(|| required("chart").build())?;
    let metadata = chart
        .metadata
        .ok_or_else(|| required("chart.metadata").build())?;
    let chart_name = metadata
        .name
        .ok_or_else(|| required("chart.metadata.name").build())?;
    let chart_version = metadata
        .version
        .ok_or_else(|| required("chart.metadata.version").build())?;
    let app_version = metadata
        .app_version
        .ok_or_else(|| required("chart.metadata.appVersion").build())?;
    let manifest_text = raw.manifest.ok_or_else(|| required("manifest").build())?;

    let values_user = match raw.config {
        Some(Value::Object(config)) => config,
        _ => Map::new(),
    };
    let defaults = chart.values.unwrap_or(Value::Object(Map::new()));
    let values_computed =
        match merge_values(&defaults, &Value::Object(values_user.clone())) {
            Value::Object(merged) => merged,
            _ => Map::new(),
        };

    Ok(HelmRelease {
        name,
        namespace,
        revision,
        status: ReleaseStatus::parse(&status),
        chart_name,
        chart_version,
        app_version,
        updated_at: DateTime::parse_from_rfc3339(&last_deployed)
            .ok()
            .map(|at| at.with_timezone(&Utc)),
        description: info.description.unwrap_or_default(),
        values_user,
        values_computed,
        manifest_text,
        hooks: raw.hooks.unwrap_or_default(),
        storage_kind,
        storage_object_name: object_name.to_string(),
    })
}

/// Merge user-supplied values over chart defaults, Helm coalesce order:
/// mappings merge key-wise, an explicit null removes the key, anything else
/// from the override wins.
pub(crate) fn merge_values(defaults: &Value, overrides: &Value) -> Value {
    match (defaults, overrides) {
        (Value::Object(defaults), Value::Object(overrides)) => {
            let mut merged = defaults.clone();
            for (key, value) in overrides {
                if value.is_null() {
                    merged.remove(key);
                    continue;
                }
                let combined = match merged.get(key) {
                    Some(existing) => merge_values(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), combined);
            }
            Value::Object(merged)
        }
        (_, overrides) => overrides.clone(),
    }
}

fn has_helm_owner(labels: &BTreeMap<String, String>) -> bool {
    labels.get(HELM_OWNER_LABEL_KEY).map(String::as_str) == Some(HELM_OWNER_LABEL_VALUE)
}

fn object_handle(kind: &str, namespace: Option<&str>, name: &str) -> String {
    format!(
        "{kind} '{namespace}/{name}'",
        namespace = namespace.unwrap_or_default()
    )
}

fn corrupt(object: &str, reason: String) -> crate::error::Error {
    CorruptPayloadSnafu {
        object: object.to_string(),
        reason,
    }
    .build()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use k8s_openapi::{apimachinery::pkg::apis::meta::v1::ObjectMeta, ByteString};
    use serde_json::json;
    use std::io::Write;

    pub(crate) fn encode_payload(release_json: &Value) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(release_json.to_string().as_bytes())
            .unwrap();
        let compressed = encoder.finish().unwrap();
        STANDARD.encode(compressed).into_bytes()
    }

    pub(crate) fn release_json(name: &str, namespace: &str, revision: u64, status: &str) -> Value {
        json!({
            "name": name,
            "namespace": namespace,
            "version": revision,
            "info": {
                "status": status,
                "last_deployed": "2024-01-01T00:00:00Z",
                "description": "Install complete"
            },
            "chart": {
                "metadata": {"name": name, "version": "13.2.0", "appVersion": "1.25.0"},
                "values": {"replicaCount": 1, "image": {"tag": "1.25.0"}}
            },
            "config": {"replicaCount": 3},
            "manifest": "---\nkind: Service\napiVersion: v1\nmetadata:\n  name: nginx\n"
        })
    }

    pub(crate) fn helm_secret(name: &str, namespace: &str, revision: u64, status: &str) -> Secret {
        helm_secret_with_payload(
            name,
            namespace,
            revision,
            status,
            encode_payload(&release_json(name, namespace, revision, status)),
        )
    }

    pub(crate) fn helm_secret_with_payload(
        name: &str,
        namespace: &str,
        revision: u64,
        status: &str,
        payload: Vec<u8>,
    ) -> Secret {
        let labels = BTreeMap::from([
            ("owner".to_string(), "helm".to_string()),
            ("name".to_string(), name.to_string()),
            ("status".to_string(), status.to_string()),
            ("version".to_string(), revision.to_string()),
        ]);
        Secret {
            metadata: ObjectMeta {
                name: Some(format!("sh.helm.release.v1.{name}.v{revision}")),
                namespace: Some(namespace.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            type_: Some(HELM_SECRET_TYPE.to_string()),
            data: Some(BTreeMap::from([(
                RELEASE_DATA_KEY.to_string(),
                ByteString(payload),
            )])),
            ..Default::default()
        }
    }

    fn helm_configmap(name: &str, namespace: &str, revision: u64, status: &str) -> ConfigMap {
        let inner = encode_payload(&release_json(name, namespace, revision, status));
        let labels = BTreeMap::from([
            ("owner".to_string(), "helm".to_string()),
            ("name".to_string(), name.to_string()),
            ("status".to_string(), status.to_string()),
            ("version".to_string(), revision.to_string()),
        ]);
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(format!("{name}.v{revision}")),
                namespace: Some(namespace.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                RELEASE_DATA_KEY.to_string(),
                STANDARD.encode(inner),
            )])),
            ..Default::default()
        }
    }

    #[test]
    fn secret_pipeline_reconstructs_the_release() {
        let secret = helm_secret("nginx", "web", 3, "deployed");
        let release = decode_secret(&secret).unwrap();

        assert_eq!(release.name, "nginx");
        assert_eq!(release.namespace, "web");
        assert_eq!(release.revision, 3);
        assert_eq!(release.status, ReleaseStatus::Deployed);
        assert_eq!(release.chart_name, "nginx");
        assert_eq!(release.chart_version, "13.2.0");
        assert_eq!(release.app_version, "1.25.0");
        assert_eq!(release.storage_kind, StorageKind::Secret);
        assert!(release.manifest_text.contains("kind: Service"));
        assert_eq!(release.values_user["replicaCount"], json!(3));
        // User config wins over the chart default, untouched defaults survive.
        assert_eq!(release.values_computed["replicaCount"], json!(3));
        assert_eq!(release.values_computed["image"]["tag"], json!("1.25.0"));
    }

    #[test]
    fn configmap_pipeline_peels_both_base64_layers() {
        let configmap = helm_configmap("legacy", "ops", 1, "superseded");
        let release = decode_configmap(&configmap).unwrap();

        assert_eq!(release.name, "legacy");
        assert_eq!(release.revision, 1);
        assert_eq!(release.status, ReleaseStatus::Superseded);
        assert_eq!(release.storage_kind, StorageKind::ConfigMap);
    }

    #[test]
    fn decoding_twice_yields_equal_releases() {
        let secret = helm_secret("nginx", "web", 3, "deployed");
        let first = decode_secret(&secret).unwrap();
        let second = decode_secret(&secret).unwrap();
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    #[test]
    fn garbage_payload_is_corrupt() {
        let secret =
            helm_secret_with_payload("bad", "web", 1, "deployed", b"not-base64!!!".to_vec());
        let error = decode_secret(&secret).unwrap_err();
        assert_eq!(error.kind(), "corrupt-payload");

        // Valid base64 of something that is not gzip.
        let secret = helm_secret_with_payload(
            "bad",
            "web",
            1,
            "deployed",
            STANDARD.encode(b"plain text").into_bytes(),
        );
        let error = decode_secret(&secret).unwrap_err();
        assert_eq!(error.kind(), "corrupt-payload");
    }

    #[test]
    fn missing_required_field_is_unsupported_schema() {
        let mut body = release_json("nginx", "web", 1, "deployed");
        body.as_object_mut().unwrap().remove("manifest");
        let secret = helm_secret_with_payload("nginx", "web", 1, "deployed", encode_payload(&body));
        let error = decode_secret(&secret).unwrap_err();
        assert_eq!(error.kind(), "unsupported-schema");
        assert!(error.to_string().contains("manifest"));
    }

    #[test]
    fn non_helm_secret_is_unknown_storage() {
        let mut secret = helm_secret("nginx", "web", 1, "deployed");
        secret.type_ = Some("Opaque".to_string());
        assert_eq!(decode_secret(&secret).unwrap_err().kind(), "unknown-storage");
    }

    #[test]
    fn label_summary_skips_the_payload() {
        let secret = helm_secret("nginx", "web", 3, "pending-upgrade");
        let summary = summarize_labels(
            StorageKind::Secret,
            &kube::ResourceExt::name_any(&secret),
            "web",
            kube::ResourceExt::labels(&secret),
            None,
        )
        .unwrap();

        assert_eq!(summary.name, "nginx");
        assert_eq!(summary.revision, 3);
        assert_eq!(summary.status, ReleaseStatus::PendingUpgrade);
        assert!(summary.manifest_text.is_empty());
        assert!(summary.values_computed.is_empty());
        assert!(summary.chart_name.is_empty());
    }

    #[test]
    fn merge_values_is_a_deep_coalesce() {
        let defaults = json!({"a": 1, "nested": {"x": 1, "y": 2}, "gone": true});
        let overrides = json!({"a": 2, "nested": {"y": 3}, "gone": null, "added": "v"});
        let merged = merge_values(&defaults, &overrides);
        assert_eq!(
            merged,
            json!({"a": 2, "nested": {"x": 1, "y": 3}, "added": "v"})
        );
    }
}
