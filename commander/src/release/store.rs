//! The label-indexed query layer over Helm release storage objects.
//!
//! Listing never decodes more than it has to: every storage object is
//! summarized from its labels, and only the selected latest revision per
//! `(name, namespace)` pays for a full payload decode.

use crate::{
    constants::{HELM_OWNER_SELECTOR, HELM_SECRET_TYPE_SELECTOR},
    error::{ResourceNotFoundSnafu, Result},
    kube::ClientSet,
    release::{
        decode::{decode_configmap, decode_secret, summarize_labels},
        HelmRelease, ItemError, ReleaseStatus, StorageKind,
    },
};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::ResourceExt;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;

/// Filters applied to a release listing.
#[derive(Debug, Default)]
pub struct Filters {
    /// Union regex match against release name and chart name.
    pub filter: Option<Regex>,
    /// Retain only releases in trouble: failed, pending, or never deployed.
    pub only_problematic: bool,
    /// Case-insensitive exact status match.
    pub status: Option<String>,
}

impl Filters {
    /// Whether a release (with its full revision history) passes the filters.
    pub fn matches(&self, release: &HelmRelease, history: &[HelmRelease]) -> bool {
        if let Some(regex) = &self.filter {
            if !regex.is_match(&release.name) && !regex.is_match(&release.chart_name) {
                return false;
            }
        }
        if let Some(status) = &self.status {
            if !release.status.as_str().eq_ignore_ascii_case(status) {
                return false;
            }
        }
        if self.only_problematic {
            let never_deployed = !history
                .iter()
                .any(|revision| revision.status == ReleaseStatus::Deployed);
            let problematic = release.status == ReleaseStatus::Failed
                || release.status.is_pending()
                || never_deployed;
            if !problematic {
                return false;
            }
        }
        true
    }
}

/// A filtered view of the current releases.
#[derive(Debug, Serialize)]
pub struct Listing {
    pub releases: Vec<HelmRelease>,
    pub errors: Vec<ItemError>,
}

/// One release fetched in full, plus the per-object failures recorded against
/// its storage objects (e.g. a corrupt latest revision degraded to `unknown`).
#[derive(Debug, Serialize)]
pub struct Lookup {
    pub release: HelmRelease,
    pub errors: Vec<ItemError>,
}

/// Everything the cluster knows about Helm releases, gathered in one sweep:
/// the fully-decoded latest revision per release plus the label summaries of
/// every stored revision.
#[derive(Debug)]
pub struct Survey {
    /// Latest revision per release, fully decoded, ordered by `(namespace, name)`.
    pub current: Vec<HelmRelease>,
    /// All stored revisions per `(namespace, name)`, summaries, descending by revision.
    pub history: BTreeMap<(String, String), Vec<HelmRelease>>,
    /// Per-object failures that degraded instead of aborting the sweep.
    pub errors: Vec<ItemError>,
}

/// Query layer over the release storage objects of one cluster.
pub struct ReleaseStore {
    clients: ClientSet,
}

impl ReleaseStore {
    pub fn new(clients: ClientSet) -> Self {
        Self { clients }
    }

    /// Enumerate every Helm storage object in scope and assemble the survey.
    pub async fn survey(&self, namespace: Option<&str>) -> Result<Survey> {
        let (secrets, configmaps) = tokio::try_join!(
            self.clients.list_secrets(
                namespace,
                Some(HELM_OWNER_SELECTOR),
                Some(HELM_SECRET_TYPE_SELECTOR),
            ),
            self.clients
                .list_configmaps(namespace, Some(HELM_OWNER_SELECTOR), None),
        )?;

        let objects = secrets
            .into_iter()
            .map(RawObject::Secret)
            .chain(configmaps.into_iter().map(RawObject::ConfigMap))
            .collect();
        Ok(build_survey(objects))
    }

    /// Current releases in scope, filtered, ordered by `(namespace, name)`.
    pub async fn list(&self, namespace: Option<&str>, filters: &Filters) -> Result<Listing> {
        let survey = self.survey(namespace).await?;
        let releases = survey
            .current
            .into_iter()
            .filter(|release| {
                let history = survey
                    .history
                    .get(&(release.namespace.clone(), release.name.clone()))
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                filters.matches(release, history)
            })
            .collect();
        Ok(Listing {
            releases,
            errors: survey.errors,
        })
    }

    /// The highest-revision release matching `name` (and namespace, if given).
    pub async fn get(&self, name: &str, namespace: Option<&str>) -> Result<Lookup> {
        let survey = self.survey(namespace).await?;
        select_release(survey, name, namespace)
    }

    /// All stored revisions of a release, descending by revision.
    ///
    /// Entries are label summaries; use [`ReleaseStore::get`] for the decoded
    /// current revision.
    pub async fn history(&self, name: &str, namespace: Option<&str>) -> Result<Vec<HelmRelease>> {
        let survey = self.survey(namespace).await?;
        survey
            .history
            .into_iter()
            .filter(|((_, release_name), _)| release_name == name)
            .map(|(_, revisions)| revisions)
            .max_by_key(|revisions| revisions.first().map(|latest| latest.revision).unwrap_or(0))
            .ok_or_else(|| {
                ResourceNotFoundSnafu {
                    resource: release_handle(name, namespace),
                }
                .build()
            })
    }
}

fn release_handle(name: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(namespace) => format!("release '{namespace}/{name}'"),
        None => format!("release '{name}'"),
    }
}

/// Pick the highest-revision match out of a survey, paired with the failures
/// recorded against that release's own storage objects.
fn select_release(survey: Survey, name: &str, namespace: Option<&str>) -> Result<Lookup> {
    let Survey {
        current,
        history,
        errors,
    } = survey;

    let release = current
        .into_iter()
        .filter(|release| release.name == name)
        .max_by(|a, b| {
            (a.revision, a.updated_at, &a.storage_object_name).cmp(&(
                b.revision,
                b.updated_at,
                &b.storage_object_name,
            ))
        })
        .ok_or_else(|| {
            ResourceNotFoundSnafu {
                resource: release_handle(name, namespace),
            }
            .build()
        })?;

    let objects: Vec<&str> = history
        .get(&(release.namespace.clone(), release.name.clone()))
        .map(|revisions| {
            revisions
                .iter()
                .map(|revision| revision.storage_object_name.as_str())
                .collect()
        })
        .unwrap_or_default();
    let errors = errors
        .into_iter()
        .filter(|error| objects.iter().any(|object| error.item.contains(object)))
        .collect();

    Ok(Lookup { release, errors })
}

/// One listed storage object, still undecoded.
enum RawObject {
    Secret(Secret),
    ConfigMap(ConfigMap),
}

impl RawObject {
    fn handle(&self) -> String {
        match self {
            RawObject::Secret(secret) => format!(
                "Secret '{}/{}'",
                secret.namespace().unwrap_or_default(),
                secret.name_any()
            ),
            RawObject::ConfigMap(configmap) => format!(
                "ConfigMap '{}/{}'",
                configmap.namespace().unwrap_or_default(),
                configmap.name_any()
            ),
        }
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        let meta = match self {
            RawObject::Secret(secret) => &secret.metadata,
            RawObject::ConfigMap(configmap) => &configmap.metadata,
        };
        meta.creation_timestamp.as_ref().map(|time| time.0)
    }

    /// Label fast path.
    fn summarize(&self) -> Result<HelmRelease> {
        match self {
            RawObject::Secret(secret) => summarize_labels(
                StorageKind::Secret,
                &secret.name_any(),
                &secret.namespace().unwrap_or_default(),
                secret.labels(),
                self.created_at(),
            ),
            RawObject::ConfigMap(configmap) => summarize_labels(
                StorageKind::ConfigMap,
                &configmap.name_any(),
                &configmap.namespace().unwrap_or_default(),
                configmap.labels(),
                self.created_at(),
            ),
        }
    }

    /// Full payload decode.
    fn decode(&self) -> Result<HelmRelease> {
        match self {
            RawObject::Secret(secret) => decode_secret(secret),
            RawObject::ConfigMap(configmap) => decode_configmap(configmap),
        }
    }
}

/// Group storage objects by release, select and decode the latest revision of
/// each, and summarize the rest. Pure so the selection algorithm is testable
/// without a cluster.
fn build_survey(objects: Vec<RawObject>) -> Survey {
    let mut errors: Vec<ItemError> = Vec::new();
    let mut groups: BTreeMap<(String, String), Vec<(HelmRelease, RawObject)>> = BTreeMap::new();

    for object in objects {
        match object.summarize() {
            Ok(summary) => {
                let key = (summary.namespace.clone(), summary.name.clone());
                groups.entry(key).or_default().push((summary, object));
            }
            Err(error) => errors.push(ItemError::new(object.handle(), &error)),
        }
    }

    let mut current = Vec::with_capacity(groups.len());
    let mut history = BTreeMap::new();

    for (key, mut group) in groups {
        // Highest revision wins; ties go to the newer object, then to the
        // lexicographically first object name.
        group.sort_by(|(a, _), (b, _)| {
            b.revision
                .cmp(&a.revision)
                .then(b.updated_at.cmp(&a.updated_at))
                .then(a.storage_object_name.cmp(&b.storage_object_name))
        });

        let (latest_summary, latest_object) = &group[0];
        let latest = match latest_object.decode() {
            Ok(release) => release,
            Err(error) => {
                // A corrupt payload must not mask the release: degrade to the
                // label summary with status unknown and report the failure.
                errors.push(ItemError::new(latest_object.handle(), &error));
                let mut degraded = latest_summary.clone();
                degraded.status = ReleaseStatus::Unknown;
                degraded
            }
        };
        current.push(latest);
        history.insert(key, group.into_iter().map(|(summary, _)| summary).collect());
    }

    Survey {
        current,
        history,
        errors,
    }
}
