//! Classifying which higher-level system manages a release.
//!
//! Rules run in a fixed priority order and stop at the first match: Argo CD,
//! Flux CD, k3s HelmChart add-ons, a foreign managed-by marker, then plain
//! Helm as the fallback.

use crate::{
    drift::split_manifest,
    kube::{ClientSet, CrdSummary},
    release::HelmRelease,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Argo CD tracking label on rendered resources.
const ARGOCD_INSTANCE_LABEL: &str = "argocd.argoproj.io/instance";
/// Argo CD tracking annotation on rendered resources.
const ARGOCD_TRACKING_ANNOTATION: &str = "argocd.argoproj.io/tracking-id";
/// Flux helm-controller label on rendered resources.
const FLUX_NAME_LABEL: &str = "helm.toolkit.fluxcd.io/name";
/// The conventional managed-by marker.
const MANAGED_BY_KEY: &str = "app.kubernetes.io/managed-by";

const FLUX_HELMRELEASE_CRD: &str = "helmreleases.helm.toolkit.fluxcd.io";
const K3S_HELMCHART_CRD: &str = "helmcharts.helm.cattle.io";

/// The system found to be managing a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    ArgoCd,
    Flux,
    K3sHelmChart,
    /// A foreign `app.kubernetes.io/managed-by` value, normalized lowercase.
    ManagedBy(String),
    NativeHelm,
}

impl Owner {
    pub fn as_str(&self) -> &str {
        match self {
            Owner::ArgoCd => "argocd",
            Owner::Flux => "flux",
            Owner::K3sHelmChart => "k3s-helmchart",
            Owner::ManagedBy(value) => value.as_str(),
            Owner::NativeHelm => "native-helm",
        }
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Owner {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// How firm the classification is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        })
    }
}

/// Classification result with the trail that led to it.
#[derive(Debug, Clone, Serialize)]
pub struct OwnerVerdict {
    pub owner: Owner,
    pub confidence: Confidence,
    pub evidence: Vec<String>,
}

/// Per-invocation owner classifier. CRD lookups are cached so classifying a
/// whole listing pays each CRD check once.
pub struct OwnerDetector {
    clients: ClientSet,
    crd_cache: Arc<Mutex<HashMap<String, CrdProbe>>>,
}

#[derive(Clone)]
enum CrdProbe {
    Present(CrdSummary),
    Absent,
    /// Access denied is demoted to "not present", remembered for the evidence trail.
    Denied,
}

impl OwnerDetector {
    pub fn new(clients: ClientSet) -> Self {
        Self {
            clients,
            crd_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Classify one release. The rendered documents are parsed from the
    /// release manifest; an unparsable manifest just skips the label rules.
    pub async fn detect(&self, release: &HelmRelease) -> OwnerVerdict {
        let documents = split_manifest(&release.manifest_text, &release.handle()).unwrap_or_else(
            |error| {
                debug!(release = %release.handle(), %error, "skipping manifest label rules");
                Vec::new()
            },
        );
        let mut trail: Vec<String> = Vec::new();

        if let Some(evidence) = argocd_evidence(&documents) {
            return OwnerVerdict {
                owner: Owner::ArgoCd,
                confidence: Confidence::High,
                evidence: vec![evidence],
            };
        }

        if let Some(evidence) = flux_label_evidence(&documents) {
            return OwnerVerdict {
                owner: Owner::Flux,
                confidence: Confidence::High,
                evidence: vec![evidence],
            };
        }
        if let Some(evidence) = self.flux_helmrelease_evidence(release, &mut trail).await {
            trail.push(evidence);
            return OwnerVerdict {
                owner: Owner::Flux,
                confidence: Confidence::High,
                evidence: trail,
            };
        }

        if let Some(evidence) = self.k3s_helmchart_evidence(release, &mut trail).await {
            trail.push(evidence);
            return OwnerVerdict {
                owner: Owner::K3sHelmChart,
                confidence: Confidence::High,
                evidence: trail,
            };
        }

        if let Some((value, evidence)) = managed_by_evidence(&documents) {
            trail.push(evidence);
            return OwnerVerdict {
                owner: Owner::ManagedBy(value),
                confidence: Confidence::Medium,
                evidence: trail,
            };
        }

        trail.push("no GitOps or add-on markers found".to_string());
        OwnerVerdict {
            owner: Owner::NativeHelm,
            confidence: Confidence::Low,
            evidence: trail,
        }
    }

    /// Rule: a Flux HelmRelease CR whose `status.helmChart` names this release.
    async fn flux_helmrelease_evidence(
        &self,
        release: &HelmRelease,
        trail: &mut Vec<String>,
    ) -> Option<String> {
        let crd = self.probe_crd(FLUX_HELMRELEASE_CRD, trail).await?;
        let version = crd.served_version?;
        let instances = match self
            .clients
            .list_custom_resources("helm.toolkit.fluxcd.io", &version, "helmreleases", None)
            .await
        {
            Ok(instances) => instances,
            Err(error) => {
                trail.push(format!("could not list Flux HelmReleases: {error}"));
                return None;
            }
        };

        instances.iter().find_map(|instance| {
            let helm_chart = instance.get("status")?.get("helmChart")?.as_str()?;
            let tracked = helm_chart.rsplit('/').next()?;
            (tracked == release.name).then(|| {
                format!(
                    "Flux HelmRelease {}/{} tracks this release via status.helmChart",
                    object_namespace(instance),
                    object_name(instance),
                )
            })
        })
    }

    /// Rule: a k3s HelmChart CR in kube-system named like this release.
    async fn k3s_helmchart_evidence(
        &self,
        release: &HelmRelease,
        trail: &mut Vec<String>,
    ) -> Option<String> {
        let crd = self.probe_crd(K3S_HELMCHART_CRD, trail).await?;
        let version = crd.served_version?;
        let instances = match self
            .clients
            .list_custom_resources("helm.cattle.io", &version, "helmcharts", Some("kube-system"))
            .await
        {
            Ok(instances) => instances,
            Err(error) => {
                trail.push(format!("could not list k3s HelmCharts: {error}"));
                return None;
            }
        };

        instances
            .iter()
            .any(|instance| object_name(instance) == release.name)
            .then(|| {
                format!(
                    "HelmChart 'kube-system/{}' matches this release",
                    release.name
                )
            })
    }

    /// Look a CRD up once per invocation. Access denied demotes to "not
    /// present" and leaves a note on the evidence trail.
    async fn probe_crd(&self, crd_name: &str, trail: &mut Vec<String>) -> Option<CrdSummary> {
        let mut cache = self.crd_cache.lock().await;
        let probe = match cache.get(crd_name) {
            Some(probe) => probe.clone(),
            None => {
                let probe = match self.clients.get_crd(crd_name).await {
                    Ok(Some(summary)) => CrdProbe::Present(summary),
                    Ok(None) => CrdProbe::Absent,
                    Err(error) if error.is_access_denied() => CrdProbe::Denied,
                    Err(error) => {
                        debug!(crd = crd_name, %error, "CRD probe failed");
                        CrdProbe::Absent
                    }
                };
                cache.insert(crd_name.to_string(), probe.clone());
                probe
            }
        };

        match probe {
            CrdProbe::Present(summary) => Some(summary),
            CrdProbe::Absent => None,
            CrdProbe::Denied => {
                trail.push(format!(
                    "access denied probing CRD '{crd_name}', treated as not present"
                ));
                None
            }
        }
    }
}

/// Rule: any rendered resource carrying the Argo CD instance label or
/// tracking annotation.
pub(crate) fn argocd_evidence(documents: &[Value]) -> Option<String> {
    documents.iter().find_map(|document| {
        marker_on(document, ARGOCD_INSTANCE_LABEL)
            .or_else(|| marker_on(document, ARGOCD_TRACKING_ANNOTATION))
    })
}

/// Rule: any rendered resource carrying the Flux helm-controller name label.
pub(crate) fn flux_label_evidence(documents: &[Value]) -> Option<String> {
    documents
        .iter()
        .find_map(|document| marker_on(document, FLUX_NAME_LABEL))
}

/// Rule: a foreign `app.kubernetes.io/managed-by` value on any rendered resource.
pub(crate) fn managed_by_evidence(documents: &[Value]) -> Option<(String, String)> {
    documents.iter().find_map(|document| {
        let value = lookup_marker(document, MANAGED_BY_KEY)?;
        if value.is_empty() || value.eq_ignore_ascii_case("helm") {
            return None;
        }
        Some((
            value.to_ascii_lowercase(),
            format!(
                "{key}={value} on {handle}",
                key = MANAGED_BY_KEY,
                handle = document_handle(document),
            ),
        ))
    })
}

/// The value of a label or annotation on a document, labels first.
fn lookup_marker(document: &Value, key: &str) -> Option<String> {
    let metadata = document.get("metadata")?;
    for section in ["labels", "annotations"] {
        if let Some(value) = metadata.get(section).and_then(|map| map.get(key)) {
            if let Some(value) = value.as_str() {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn marker_on(document: &Value, key: &str) -> Option<String> {
    lookup_marker(document, key)
        .map(|_| format!("{key} on {handle}", handle = document_handle(document)))
}

fn document_handle(document: &Value) -> String {
    let kind = document
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or("resource");
    format!("{kind} '{}'", object_name(document))
}

fn object_name(document: &Value) -> &str {
    document
        .get("metadata")
        .and_then(|metadata| metadata.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("")
}

fn object_namespace(document: &Value) -> &str {
    document
        .get("metadata")
        .and_then(|metadata| metadata.get("namespace"))
        .and_then(Value::as_str)
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn labelled(labels: Value, annotations: Value) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "app1", "labels": labels, "annotations": annotations}
        })
    }

    #[test]
    fn argocd_beats_every_other_marker() {
        let documents = vec![labelled(
            json!({
                "argocd.argoproj.io/instance": "app1",
                "helm.toolkit.fluxcd.io/name": "app1",
                "app.kubernetes.io/managed-by": "Helm"
            }),
            json!({}),
        )];

        assert!(argocd_evidence(&documents).is_some());
        // Detection order guarantees argocd wins even with flux evidence present.
        assert!(flux_label_evidence(&documents).is_some());
    }

    #[test]
    fn argocd_tracking_annotation_counts() {
        let documents = vec![labelled(
            json!({}),
            json!({"argocd.argoproj.io/tracking-id": "app1:apps/Deployment:web/app1"}),
        )];
        let evidence = argocd_evidence(&documents).unwrap();
        assert!(evidence.contains("argocd.argoproj.io/tracking-id"));
        assert!(evidence.contains("Deployment 'app1'"));
    }

    #[test]
    fn helm_managed_by_is_not_foreign() {
        let documents = vec![labelled(
            json!({"app.kubernetes.io/managed-by": "Helm"}),
            json!({}),
        )];
        assert!(managed_by_evidence(&documents).is_none());
    }

    #[test]
    fn foreign_managed_by_is_normalized() {
        let documents = vec![labelled(
            json!({"app.kubernetes.io/managed-by": "Rancher"}),
            json!({}),
        )];
        let (owner, evidence) = managed_by_evidence(&documents).unwrap();
        assert_eq!(owner, "rancher");
        assert!(evidence.contains("app.kubernetes.io/managed-by=Rancher"));
    }

    #[test]
    fn no_markers_means_no_evidence() {
        let documents = vec![labelled(json!({"app": "plain"}), json!({}))];
        assert!(argocd_evidence(&documents).is_none());
        assert!(flux_label_evidence(&documents).is_none());
        assert!(managed_by_evidence(&documents).is_none());
    }
}
