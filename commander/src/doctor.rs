//! Cross-release diagnostics: each check runs independently over one cluster
//! survey and contributes findings without aborting the others.

use crate::release::{store::Survey, ReleaseStatus, StorageKind};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// How serious a finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        })
    }
}

/// The fixed diagnostic kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    StorageMixed,
    Failed,
    PendingStuck,
    NoDeployedRevision,
    DuplicateChart,
    OrphanedSecret,
    RevisionBloat,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::StorageMixed => "storage-mixed",
            Category::Failed => "failed",
            Category::PendingStuck => "pending-stuck",
            Category::NoDeployedRevision => "no-deployed-revision",
            Category::DuplicateChart => "duplicate-chart",
            Category::OrphanedSecret => "orphaned-secret",
            Category::RevisionBloat => "revision-bloat",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One diagnostic finding.
#[derive(Debug, Clone, Serialize)]
pub struct DoctorFinding {
    pub severity: Severity,
    pub category: Category,
    pub subject: String,
    pub message: String,
}

/// Tunable thresholds; the defaults are heuristics.
#[derive(Debug, Clone)]
pub struct DoctorConfig {
    /// How long a `pending-*` status may persist before it counts as stuck.
    pub pending_stuck_after: TimeDelta,
    /// Stored revisions per release beyond which history is considered bloated.
    pub revision_bloat_limit: usize,
    /// Age past which a lone uninstalled Secret counts as orphaned.
    pub orphan_retention: TimeDelta,
}

impl Default for DoctorConfig {
    fn default() -> Self {
        Self {
            pending_stuck_after: TimeDelta::minutes(15),
            revision_bloat_limit: 10,
            orphan_retention: TimeDelta::hours(24),
        }
    }
}

/// Run every check over the survey. Finding order follows the check order,
/// then `(namespace, name)` within a check.
pub fn diagnose(survey: &Survey, config: &DoctorConfig, now: DateTime<Utc>) -> Vec<DoctorFinding> {
    let mut findings = Vec::new();
    findings.extend(storage_mixed(survey));
    findings.extend(failed_releases(survey));
    findings.extend(pending_stuck(survey, config, now));
    findings.extend(no_deployed_revision(survey));
    findings.extend(duplicate_charts(survey));
    findings.extend(orphaned_secrets(survey, config, now));
    findings.extend(revision_bloat(survey, config));
    findings
}

/// Releases stored under both drivers point at a migration gone half-way.
fn storage_mixed(survey: &Survey) -> Vec<DoctorFinding> {
    let mut secrets = 0usize;
    let mut configmaps = 0usize;
    for revisions in survey.history.values() {
        for revision in revisions {
            match revision.storage_kind {
                StorageKind::Secret => secrets += 1,
                StorageKind::ConfigMap => configmaps += 1,
            }
        }
    }
    if secrets > 0 && configmaps > 0 {
        return vec![DoctorFinding {
            severity: Severity::Warn,
            category: Category::StorageMixed,
            subject: "cluster".to_string(),
            message: format!(
                "releases exist under both storage drivers ({secrets} secret revisions, {configmaps} configmap revisions)"
            ),
        }];
    }
    Vec::new()
}

fn failed_releases(survey: &Survey) -> Vec<DoctorFinding> {
    survey
        .current
        .iter()
        .filter(|release| release.status == ReleaseStatus::Failed)
        .map(|release| DoctorFinding {
            severity: Severity::Error,
            category: Category::Failed,
            subject: release.handle(),
            message: if release.description.is_empty() {
                "last release action failed".to_string()
            } else {
                format!("last release action failed: {}", release.description)
            },
        })
        .collect()
}

fn pending_stuck(
    survey: &Survey,
    config: &DoctorConfig,
    now: DateTime<Utc>,
) -> Vec<DoctorFinding> {
    survey
        .current
        .iter()
        .filter(|release| release.status.is_pending())
        .filter_map(|release| {
            let updated_at = release.updated_at?;
            let age = now - updated_at;
            (age > config.pending_stuck_after).then(|| DoctorFinding {
                severity: Severity::Error,
                category: Category::PendingStuck,
                subject: release.handle(),
                message: format!(
                    "status '{status}' has not progressed for {minutes} minutes; a helm operation likely died mid-flight",
                    status = release.status,
                    minutes = age.num_minutes(),
                ),
            })
        })
        .collect()
}

fn no_deployed_revision(survey: &Survey) -> Vec<DoctorFinding> {
    survey
        .history
        .iter()
        .filter(|(_, revisions)| {
            !revisions
                .iter()
                .any(|revision| revision.status == ReleaseStatus::Deployed)
        })
        .map(|((namespace, name), revisions)| DoctorFinding {
            severity: Severity::Warn,
            category: Category::NoDeployedRevision,
            subject: format!("{namespace}/{name}"),
            message: format!(
                "none of the {count} stored revisions ever reached 'deployed'",
                count = revisions.len()
            ),
        })
        .collect()
}

fn duplicate_charts(survey: &Survey) -> Vec<DoctorFinding> {
    let mut by_chart: BTreeMap<(&str, &str), Vec<&str>> = BTreeMap::new();
    for release in &survey.current {
        if release.chart_name.is_empty() {
            continue;
        }
        by_chart
            .entry((release.namespace.as_str(), release.chart_name.as_str()))
            .or_default()
            .push(release.name.as_str());
    }
    by_chart
        .into_iter()
        .filter(|(_, names)| names.len() >= 2)
        .map(|((namespace, chart), names)| DoctorFinding {
            severity: Severity::Warn,
            category: Category::DuplicateChart,
            subject: format!("{namespace}/{chart}"),
            message: format!(
                "chart '{chart}' is installed {count} times in namespace '{namespace}': {names}",
                count = names.len(),
                names = names.join(", "),
            ),
        })
        .collect()
}

/// A lone uninstalled Secret revision past the retention window: Helm keeps
/// it for `helm status`, but with no sibling revisions it is just debris.
fn orphaned_secrets(
    survey: &Survey,
    config: &DoctorConfig,
    now: DateTime<Utc>,
) -> Vec<DoctorFinding> {
    survey
        .history
        .values()
        .filter(|revisions| revisions.len() == 1)
        .filter_map(|revisions| {
            let only = &revisions[0];
            if only.storage_kind != StorageKind::Secret
                || only.status != ReleaseStatus::Uninstalled
            {
                return None;
            }
            let age = now - only.updated_at?;
            (age > config.orphan_retention).then(|| DoctorFinding {
                severity: Severity::Warn,
                category: Category::OrphanedSecret,
                subject: only.handle(),
                message: format!(
                    "secret '{object}' is the only trace of an uninstalled release, {hours}h past retention",
                    object = only.storage_object_name,
                    hours = age.num_hours(),
                ),
            })
        })
        .collect()
}

fn revision_bloat(survey: &Survey, config: &DoctorConfig) -> Vec<DoctorFinding> {
    survey
        .history
        .iter()
        .filter(|(_, revisions)| revisions.len() > config.revision_bloat_limit)
        .map(|((namespace, name), revisions)| DoctorFinding {
            severity: Severity::Info,
            category: Category::RevisionBloat,
            subject: format!("{namespace}/{name}"),
            message: format!(
                "{count} stored revisions; consider a lower --history-max on upgrades",
                count = revisions.len()
            ),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::HelmRelease;
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn release(
        name: &str,
        namespace: &str,
        revision: u64,
        status: ReleaseStatus,
        storage_kind: StorageKind,
        age: Option<Duration>,
        now: DateTime<Utc>,
    ) -> HelmRelease {
        HelmRelease {
            name: name.to_string(),
            namespace: namespace.to_string(),
            revision,
            status,
            chart_name: name.to_string(),
            chart_version: "1.0.0".to_string(),
            app_version: "1.0.0".to_string(),
            updated_at: age.map(|age| now - age),
            description: String::new(),
            values_user: Default::default(),
            values_computed: Default::default(),
            manifest_text: String::new(),
            hooks: Vec::new(),
            storage_kind,
            storage_object_name: format!("sh.helm.release.v1.{name}.v{revision}"),
        }
    }

    fn survey_of(current: Vec<HelmRelease>, history: Vec<HelmRelease>) -> Survey {
        let mut grouped: BTreeMap<(String, String), Vec<HelmRelease>> = BTreeMap::new();
        for revision in history {
            grouped
                .entry((revision.namespace.clone(), revision.name.clone()))
                .or_default()
                .push(revision);
        }
        for revisions in grouped.values_mut() {
            revisions.sort_by(|a, b| b.revision.cmp(&a.revision));
        }
        Survey {
            current,
            history: grouped,
            errors: Vec::new(),
        }
    }

    fn findings_of(survey: &Survey, category: Category) -> Vec<DoctorFinding> {
        diagnose(survey, &DoctorConfig::default(), Utc::now())
            .into_iter()
            .filter(|finding| finding.category == category)
            .collect()
    }

    #[test]
    fn two_hour_pending_upgrade_is_stuck() {
        let now = Utc::now();
        let stuck = release(
            "app",
            "default",
            2,
            ReleaseStatus::PendingUpgrade,
            StorageKind::Secret,
            Some(Duration::hours(2)),
            now,
        );
        let survey = survey_of(vec![stuck.clone()], vec![stuck]);
        let findings = diagnose(&survey, &DoctorConfig::default(), now);

        let stuck: Vec<_> = findings
            .iter()
            .filter(|finding| finding.category == Category::PendingStuck)
            .collect();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].severity, Severity::Error);
        assert_eq!(stuck[0].subject, "default/app");
    }

    #[test]
    fn fresh_pending_is_not_stuck() {
        let now = Utc::now();
        let pending = release(
            "app",
            "default",
            1,
            ReleaseStatus::PendingInstall,
            StorageKind::Secret,
            Some(Duration::minutes(5)),
            now,
        );
        let survey = survey_of(vec![pending.clone()], vec![pending]);
        assert!(findings_of(&survey, Category::PendingStuck).is_empty());
    }

    #[test]
    fn mixed_storage_drivers_warn_once() {
        let now = Utc::now();
        let secret = release(
            "a",
            "default",
            1,
            ReleaseStatus::Deployed,
            StorageKind::Secret,
            None,
            now,
        );
        let configmap = release(
            "b",
            "default",
            1,
            ReleaseStatus::Deployed,
            StorageKind::ConfigMap,
            None,
            now,
        );
        let survey = survey_of(
            vec![secret.clone(), configmap.clone()],
            vec![secret, configmap],
        );
        let findings = findings_of(&survey, Category::StorageMixed);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Warn);
    }

    #[test]
    fn failed_release_is_an_error() {
        let now = Utc::now();
        let failed = release(
            "app",
            "default",
            3,
            ReleaseStatus::Failed,
            StorageKind::Secret,
            None,
            now,
        );
        let survey = survey_of(vec![failed.clone()], vec![failed]);
        let findings = findings_of(&survey, Category::Failed);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Error);
    }

    #[test]
    fn never_deployed_history_warns() {
        let now = Utc::now();
        let r1 = release(
            "app",
            "default",
            1,
            ReleaseStatus::Superseded,
            StorageKind::Secret,
            None,
            now,
        );
        let r2 = release(
            "app",
            "default",
            2,
            ReleaseStatus::Superseded,
            StorageKind::Secret,
            None,
            now,
        );
        let survey = survey_of(vec![r2.clone()], vec![r1, r2]);
        assert_eq!(findings_of(&survey, Category::NoDeployedRevision).len(), 1);
    }

    #[test]
    fn duplicate_chart_in_one_namespace_warns() {
        let now = Utc::now();
        let mut first = release(
            "db-primary",
            "data",
            1,
            ReleaseStatus::Deployed,
            StorageKind::Secret,
            None,
            now,
        );
        first.chart_name = "postgresql".to_string();
        let mut second = release(
            "db-replica",
            "data",
            1,
            ReleaseStatus::Deployed,
            StorageKind::Secret,
            None,
            now,
        );
        second.chart_name = "postgresql".to_string();
        let mut elsewhere = release(
            "db-other",
            "staging",
            1,
            ReleaseStatus::Deployed,
            StorageKind::Secret,
            None,
            now,
        );
        elsewhere.chart_name = "postgresql".to_string();

        let survey = survey_of(
            vec![first.clone(), second.clone(), elsewhere.clone()],
            vec![first, second, elsewhere],
        );
        let findings = findings_of(&survey, Category::DuplicateChart);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].subject, "data/postgresql");
    }

    #[test]
    fn lone_old_uninstalled_secret_is_orphaned() {
        let now = Utc::now();
        let orphan = release(
            "gone",
            "default",
            4,
            ReleaseStatus::Uninstalled,
            StorageKind::Secret,
            Some(Duration::days(3)),
            now,
        );
        let survey = survey_of(vec![orphan.clone()], vec![orphan]);
        assert_eq!(findings_of(&survey, Category::OrphanedSecret).len(), 1);

        // A second revision means it is not an orphan.
        let kept = release(
            "kept",
            "default",
            2,
            ReleaseStatus::Uninstalled,
            StorageKind::Secret,
            Some(Duration::days(3)),
            now,
        );
        let older = release(
            "kept",
            "default",
            1,
            ReleaseStatus::Superseded,
            StorageKind::Secret,
            Some(Duration::days(4)),
            now,
        );
        let survey = survey_of(vec![kept.clone()], vec![kept, older]);
        assert!(findings_of(&survey, Category::OrphanedSecret).is_empty());
    }

    #[test]
    fn eleven_revisions_is_bloat() {
        let now = Utc::now();
        let revisions: Vec<HelmRelease> = (1..=11)
            .map(|revision| {
                release(
                    "app",
                    "default",
                    revision,
                    if revision == 11 {
                        ReleaseStatus::Deployed
                    } else {
                        ReleaseStatus::Superseded
                    },
                    StorageKind::Secret,
                    None,
                    now,
                )
            })
            .collect();
        let survey = survey_of(vec![revisions.last().unwrap().clone()], revisions);
        let findings = findings_of(&survey, Category::RevisionBloat);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Info);
    }
}
