use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod decode;
pub mod store;

/// Lifecycle status of a release revision, as recorded by Helm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    Unknown,
    Deployed,
    Uninstalled,
    Superseded,
    Failed,
    Uninstalling,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
}

impl ReleaseStatus {
    /// Parse a status string the way Helm labels it; anything unrecognized is `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "deployed" => ReleaseStatus::Deployed,
            "uninstalled" => ReleaseStatus::Uninstalled,
            "superseded" => ReleaseStatus::Superseded,
            "failed" => ReleaseStatus::Failed,
            "uninstalling" => ReleaseStatus::Uninstalling,
            "pending-install" => ReleaseStatus::PendingInstall,
            "pending-upgrade" => ReleaseStatus::PendingUpgrade,
            "pending-rollback" => ReleaseStatus::PendingRollback,
            _ => ReleaseStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Unknown => "unknown",
            ReleaseStatus::Deployed => "deployed",
            ReleaseStatus::Uninstalled => "uninstalled",
            ReleaseStatus::Superseded => "superseded",
            ReleaseStatus::Failed => "failed",
            ReleaseStatus::Uninstalling => "uninstalling",
            ReleaseStatus::PendingInstall => "pending-install",
            ReleaseStatus::PendingUpgrade => "pending-upgrade",
            ReleaseStatus::PendingRollback => "pending-rollback",
        }
    }

    /// True for the `pending-*` family.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ReleaseStatus::PendingInstall
                | ReleaseStatus::PendingUpgrade
                | ReleaseStatus::PendingRollback
        )
    }
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The storage medium a release revision was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Secret,
    #[serde(rename = "configmap")]
    ConfigMap,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Secret => "secret",
            StorageKind::ConfigMap => "configmap",
        }
    }
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chart coordinates of a release revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChartRef {
    pub name: String,
    pub version: String,
    pub app_version: String,
    pub digest: Option<String>,
}

/// One revision of a Helm release, reconstructed from its storage object.
///
/// A summary decoded from labels alone (the listing fast path) carries empty
/// `manifest_text`, `values_*` and `hooks`; callers needing those must request
/// a full payload decode.
#[derive(Debug, Clone, Serialize)]
pub struct HelmRelease {
    pub name: String,
    pub namespace: String,
    pub revision: u64,
    pub status: ReleaseStatus,
    pub chart_name: String,
    pub chart_version: String,
    pub app_version: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub description: String,
    pub values_user: Map<String, Value>,
    pub values_computed: Map<String, Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub manifest_text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<Value>,
    pub storage_kind: StorageKind,
    pub storage_object_name: String,
}

impl HelmRelease {
    /// The chart coordinates this revision was rendered from.
    pub fn chart_ref(&self) -> ChartRef {
        ChartRef {
            name: self.chart_name.clone(),
            version: self.chart_version.clone(),
            app_version: self.app_version.clone(),
            digest: None,
        }
    }

    /// `namespace/name`, the human handle used in findings and errors.
    pub fn handle(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// A per-item failure carried alongside normal results instead of aborting them.
#[derive(Debug, Clone, Serialize)]
pub struct ItemError {
    pub item: String,
    pub kind: String,
    pub message: String,
}

impl ItemError {
    pub fn new(item: impl Into<String>, error: &Error) -> Self {
        Self {
            item: item.into(),
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}
