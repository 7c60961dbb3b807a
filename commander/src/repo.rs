//! Matching deployed charts against locally cached Helm repository indexes.
//!
//! Only files already on disk are read; there is no network I/O here.

use crate::{
    constants::{HELM_CACHE_HOME_ENV, HELM_CONFIG_HOME_ENV},
    error::{CacheFileParseSnafu, CacheFileReadSnafu, Result},
    release::{ChartRef, HelmRelease, ItemError},
};
use semver::Version;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

/// A parsed `*-index.yaml` cache file: chart name to available versions.
#[derive(Debug, Default, Deserialize)]
pub struct RepoIndex {
    #[serde(default)]
    pub entries: HashMap<String, Vec<ChartEntry>>,
}

/// One chart version available from a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartEntry {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub app_version: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub urls: Vec<String>,
}

/// A repository entry that matches a deployed chart.
#[derive(Debug, Clone, Serialize)]
pub struct RepoMatch {
    pub repo: String,
    /// Repository URL from repositories.yaml, when the repo is still configured.
    pub url: Option<String>,
    pub entry: ChartEntry,
}

/// Upgrade availability for one release.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateStatus {
    pub name: String,
    pub namespace: String,
    pub chart_name: String,
    pub current: String,
    pub latest: Option<String>,
    pub repo: Option<String>,
    pub upgrade_available: bool,
}

#[derive(Debug, Deserialize)]
struct RepositoriesFile {
    #[serde(default)]
    repositories: Vec<KnownRepo>,
}

#[derive(Debug, Deserialize)]
struct KnownRepo {
    name: String,
    url: String,
}

/// The `repository/` directory of the local Helm cache.
pub fn cache_repository_dir() -> Option<PathBuf> {
    if let Ok(home) = std::env::var(HELM_CACHE_HOME_ENV) {
        return Some(PathBuf::from(home).join("repository"));
    }
    if cfg!(windows) {
        dirs::config_dir().map(|dir| dir.join("helm").join("repository"))
    } else {
        dirs::home_dir().map(|dir| dir.join(".cache").join("helm").join("repository"))
    }
}

/// The repositories.yaml file of the local Helm configuration.
pub fn repositories_file() -> Option<PathBuf> {
    if let Ok(home) = std::env::var(HELM_CONFIG_HOME_ENV) {
        return Some(PathBuf::from(home).join("repositories.yaml"));
    }
    if cfg!(windows) {
        dirs::config_dir().map(|dir| dir.join("helm").join("repositories.yaml"))
    } else {
        dirs::home_dir().map(|dir| dir.join(".config").join("helm").join("repositories.yaml"))
    }
}

/// Index cache loaded for one invocation.
#[derive(Debug, Default)]
pub struct RepoResolver {
    indexes: Vec<(String, RepoIndex)>,
    repo_urls: HashMap<String, String>,
    /// Cache files that could not be read or parsed; the rest still resolve.
    pub errors: Vec<ItemError>,
}

impl RepoResolver {
    /// Load every `*-index.yaml` under the platform cache location, plus the
    /// configured repository URLs. Missing directories mean no repos, not an
    /// error; unreadable files degrade per file.
    pub fn load() -> Self {
        let repo_urls = repositories_file()
            .filter(|path| path.exists())
            .and_then(|path| load_repo_urls(&path).ok())
            .unwrap_or_default();
        match cache_repository_dir() {
            Some(dir) if dir.is_dir() => Self::from_dir(&dir, repo_urls),
            _ => Self {
                repo_urls,
                ..Default::default()
            },
        }
    }

    /// Load indexes from an explicit directory.
    pub fn from_dir(dir: &Path, repo_urls: HashMap<String, String>) -> Self {
        let mut resolver = Self {
            repo_urls,
            ..Default::default()
        };

        let listing = match std::fs::read_dir(dir).context(CacheFileReadSnafu {
            path: dir.to_path_buf(),
        }) {
            Ok(listing) => listing,
            Err(error) => {
                resolver
                    .errors
                    .push(ItemError::new(dir.display().to_string(), &error));
                return resolver;
            }
        };

        for file in listing.flatten() {
            let path = file.path();
            let Some(repo) = index_repo_name(&path) else {
                continue;
            };
            match load_index(&path) {
                Ok(index) => resolver.indexes.push((repo, index)),
                Err(error) => resolver
                    .errors
                    .push(ItemError::new(path.display().to_string(), &error)),
            }
        }
        resolver.indexes.sort_by(|(a, _), (b, _)| a.cmp(b));
        resolver
    }

    /// Every repository entry matching the deployed chart, by digest or by
    /// `(version, app_version)`, in load order.
    pub fn resolve(&self, chart: &ChartRef) -> Vec<RepoMatch> {
        let mut matches = Vec::new();
        for (repo, index) in &self.indexes {
            let Some(entries) = index.entries.get(&chart.name) else {
                continue;
            };
            for entry in entries {
                if entry.name == chart.name && entry_matches(entry, chart) {
                    matches.push(RepoMatch {
                        repo: repo.clone(),
                        url: self.repo_urls.get(repo).cloned(),
                        entry: entry.clone(),
                    });
                }
            }
        }
        matches
    }

    /// Upgrade availability for a release: within the repos its deployed chart
    /// resolves to, the highest version by semver precedence.
    pub fn check_update(&self, release: &HelmRelease) -> UpdateStatus {
        let chart = release.chart_ref();
        let current = parse_version(&chart.version);

        let mut latest: Option<(Version, String, String)> = None;
        for matched in self.resolve(&chart) {
            let Some((_, index)) = self
                .indexes
                .iter()
                .find(|(repo, _)| *repo == matched.repo)
            else {
                continue;
            };
            let Some(entries) = index.entries.get(&chart.name) else {
                continue;
            };
            for entry in entries {
                let Some(version) = parse_version(&entry.version) else {
                    continue;
                };
                let newer = match &latest {
                    Some((best, _, _)) => version.cmp(best).is_gt(),
                    None => true,
                };
                if newer {
                    latest = Some((version, entry.version.clone(), matched.repo.clone()));
                }
            }
        }

        let upgrade_available = match (&current, &latest) {
            (Some(current), Some((latest, _, _))) => latest.cmp(current).is_gt(),
            _ => false,
        };
        UpdateStatus {
            name: release.name.clone(),
            namespace: release.namespace.clone(),
            chart_name: chart.name,
            current: chart.version,
            latest: latest.as_ref().map(|(_, raw, _)| raw.clone()),
            repo: latest.map(|(_, _, repo)| repo),
            upgrade_available,
        }
    }
}

fn entry_matches(entry: &ChartEntry, chart: &ChartRef) -> bool {
    if let (Some(entry_digest), Some(chart_digest)) = (&entry.digest, &chart.digest) {
        if entry_digest == chart_digest {
            return true;
        }
    }
    entry.version == chart.version
        && entry
            .app_version
            .as_ref()
            .map(|app_version| app_version == &chart.app_version)
            .unwrap_or(true)
}

fn index_repo_name(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    file_name
        .strip_suffix("-index.yaml")
        .filter(|repo| !repo.is_empty())
        .map(str::to_string)
}

fn load_index(path: &Path) -> Result<RepoIndex> {
    let text = std::fs::read_to_string(path).context(CacheFileReadSnafu {
        path: path.to_path_buf(),
    })?;
    serde_yaml::from_str(&text).context(CacheFileParseSnafu {
        path: path.to_path_buf(),
    })
}

fn load_repo_urls(path: &Path) -> Result<HashMap<String, String>> {
    let text = std::fs::read_to_string(path).context(CacheFileReadSnafu {
        path: path.to_path_buf(),
    })?;
    let file: RepositoriesFile = serde_yaml::from_str(&text).context(CacheFileParseSnafu {
        path: path.to_path_buf(),
    })?;
    Ok(file
        .repositories
        .into_iter()
        .map(|repo| (repo.name, repo.url))
        .collect())
}

/// Lenient chart version parse, tolerating a leading `v`.
pub(crate) fn parse_version(text: &str) -> Option<Version> {
    Version::parse(text.trim().trim_start_matches('v')).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::{ReleaseStatus, StorageKind};
    use std::io::Write;

    const NGINX_INDEX: &str = r#"
apiVersion: v1
entries:
  nginx:
    - name: nginx
      version: 13.2.0
      appVersion: 1.25.0
      digest: sha256:aaa
      urls: ["https://charts.example.com/nginx-13.2.0.tgz"]
    - name: nginx
      version: 13.2.10
      appVersion: 1.25.3
      digest: sha256:bbb
      urls: ["https://charts.example.com/nginx-13.2.10.tgz"]
    - name: nginx
      version: 13.2.9
      appVersion: 1.25.2
      digest: sha256:ccc
      urls: ["https://charts.example.com/nginx-13.2.9.tgz"]
    - name: nginx
      version: 14.0.0-rc.1
      appVersion: 1.26.0
      digest: sha256:ddd
      urls: ["https://charts.example.com/nginx-14.0.0-rc.1.tgz"]
"#;

    fn fixture_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut index = std::fs::File::create(dir.path().join("stable-index.yaml")).unwrap();
        index.write_all(NGINX_INDEX.as_bytes()).unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), "ignored").unwrap();
        std::fs::write(dir.path().join("broken-index.yaml"), ": not yaml [").unwrap();
        dir
    }

    fn nginx_release(chart_version: &str) -> HelmRelease {
        HelmRelease {
            name: "nginx".to_string(),
            namespace: "web".to_string(),
            revision: 3,
            status: ReleaseStatus::Deployed,
            chart_name: "nginx".to_string(),
            chart_version: chart_version.to_string(),
            app_version: "1.25.0".to_string(),
            updated_at: None,
            description: String::new(),
            values_user: Default::default(),
            values_computed: Default::default(),
            manifest_text: String::new(),
            hooks: Vec::new(),
            storage_kind: StorageKind::Secret,
            storage_object_name: "sh.helm.release.v1.nginx.v3".to_string(),
        }
    }

    #[test]
    fn scans_index_files_and_degrades_on_broken_ones() {
        let dir = fixture_dir();
        let resolver = RepoResolver::from_dir(dir.path(), HashMap::new());
        assert_eq!(resolver.indexes.len(), 1);
        assert_eq!(resolver.errors.len(), 1);
        assert_eq!(resolver.errors[0].kind, "parse-error");
    }

    #[test]
    fn resolves_by_version_and_app_version() {
        let dir = fixture_dir();
        let resolver = RepoResolver::from_dir(
            dir.path(),
            HashMap::from([(
                "stable".to_string(),
                "https://charts.example.com".to_string(),
            )]),
        );
        let matches = resolver.resolve(&nginx_release("13.2.0").chart_ref());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].repo, "stable");
        assert_eq!(matches[0].entry.digest.as_deref(), Some("sha256:aaa"));
        assert_eq!(
            matches[0].url.as_deref(),
            Some("https://charts.example.com")
        );

        assert!(resolver
            .resolve(&nginx_release("99.0.0").chart_ref())
            .is_empty());
    }

    #[test]
    fn update_check_prefers_highest_release_version() {
        let dir = fixture_dir();
        let resolver = RepoResolver::from_dir(dir.path(), HashMap::new());
        let status = resolver.check_update(&nginx_release("13.2.0"));

        // 13.2.10 beats 13.2.9 numerically, and the 14.0.0-rc.1 pre-release
        // still counts as the highest available by precedence.
        assert_eq!(status.latest.as_deref(), Some("14.0.0-rc.1"));
        assert!(status.upgrade_available);
        assert_eq!(status.repo.as_deref(), Some("stable"));
    }

    #[test]
    fn unmatched_chart_reports_no_upgrade() {
        let dir = fixture_dir();
        let resolver = RepoResolver::from_dir(dir.path(), HashMap::new());
        let status = resolver.check_update(&nginx_release("99.0.0"));
        assert_eq!(status.latest, None);
        assert!(!status.upgrade_available);
    }

    #[test]
    fn semver_precedence_rules() {
        let numeric = parse_version("1.2.10").unwrap();
        assert!(numeric.cmp(&parse_version("1.2.9").unwrap()).is_gt());

        let pre_release = parse_version("1.0.0-rc.1").unwrap();
        assert!(pre_release.cmp(&parse_version("1.0.0").unwrap()).is_lt());

        // Build metadata never orders a version below its plain form.
        let with_build = parse_version("1.0.0+build").unwrap();
        assert!(!with_build.cmp(&parse_version("1.0.0").unwrap()).is_lt());

        assert_eq!(parse_version("v1.2.3"), parse_version("1.2.3"));
    }
}
