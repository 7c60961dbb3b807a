use crate::cli_utils::output::OutputFormat;
use anyhow::{anyhow, Context};
use chrono::{TimeDelta, Utc};
use clap::{Parser, ValueEnum};
use helm_commander::{
    doctor::{diagnose, DoctorConfig},
    drift::{DriftEngine, DriftVerdict},
    kube::ClientSet,
    owner::OwnerDetector,
    release::store::{Filters, ReleaseStore},
    repo::RepoResolver,
};
use regex::Regex;
use serde_json::json;
use std::path::PathBuf;

pub mod output;

/// Arguments selecting the cluster to inspect.
#[derive(Default, Debug, Parser, Clone)]
pub struct K8sCtxArgs {
    /// Namespace to inspect.
    /// If unset, releases are inspected cluster-wide.
    #[clap(global = true, long, short = 'n')]
    pub namespace: Option<String>,

    /// Path to kubeconfig file.
    #[clap(global = true, long, short = 'k')]
    pub kubeconfig: Option<PathBuf>,

    /// Kubernetes context to use.
    /// If unset, defaults to the current context.
    #[clap(global = true, long)]
    pub context: Option<String>,
}

impl K8sCtxArgs {
    /// Build the shared [`ClientSet`] based on the specified args.
    pub async fn clients(&self) -> Result<ClientSet, helm_commander::error::Error> {
        ClientSet::new(self.kubeconfig.clone(), self.context.clone(), None).await
    }
}

/// Filters shared by the listing-shaped commands.
#[derive(Debug, Default, Parser)]
pub struct FilterArgs {
    /// Regex matched against release name and chart name.
    #[clap(long)]
    pub filter: Option<String>,

    /// Keep only releases needing attention.
    #[clap(long, value_enum)]
    pub only: Option<OnlySelector>,

    /// Case-insensitive exact status match, e.g. deployed, failed.
    #[clap(long)]
    pub status: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum OnlySelector {
    Problematic,
}

impl FilterArgs {
    fn to_filters(&self) -> anyhow::Result<Filters> {
        let filter = match &self.filter {
            Some(pattern) => {
                Some(Regex::new(pattern).map_err(|error| anyhow!("invalid --filter: {error}"))?)
            }
            None => None,
        };
        Ok(Filters {
            filter,
            only_problematic: matches!(self.only, Some(OnlySelector::Problematic)),
            status: self.status.clone(),
        })
    }
}

/// Args for commands addressing one release.
#[derive(Debug, Parser)]
pub struct ReleaseArgs {
    /// Release name.
    pub name: String,
}

#[derive(Debug, Parser)]
pub struct ListArgs {
    #[clap(flatten)]
    pub filters: FilterArgs,
}

#[derive(Debug, Parser)]
pub struct DriftArgs {
    /// Release name.
    pub name: String,

    /// Skip the hunt for live resources the release no longer stores.
    #[clap(long)]
    pub skip_extra: bool,
}

#[derive(Debug, Parser)]
pub struct DoctorArgs {
    /// How long a pending status may persist before it counts as stuck.
    #[clap(long, default_value = "15m")]
    pub stuck_after: humantime::Duration,

    /// Stored revisions per release beyond which history counts as bloated.
    #[clap(long, default_value = "10")]
    pub revision_limit: usize,

    /// Age past which a lone uninstalled secret counts as orphaned.
    #[clap(long, default_value = "24h")]
    pub orphan_retention: humantime::Duration,
}

impl DoctorArgs {
    fn config(&self) -> DoctorConfig {
        DoctorConfig {
            pending_stuck_after: delta(*self.stuck_after),
            revision_bloat_limit: self.revision_limit,
            orphan_retention: delta(*self.orphan_retention),
        }
    }
}

fn delta(duration: std::time::Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// The command surface.
#[derive(Parser, Debug)]
pub enum Operations {
    /// List installed releases, latest revision each.
    List(ListArgs),
    /// Show one release in detail, including who manages it.
    Info(ReleaseArgs),
    /// Show the stored revision history of a release.
    History(ReleaseArgs),
    /// Compare a release's stored manifests against the live cluster.
    Drift(DriftArgs),
    /// Show which local chart repositories a release's chart matches.
    Source(ReleaseArgs),
    /// Check deployed chart versions against local repo index caches.
    Updates(ListArgs),
    /// Run cross-release health checks.
    Doctor(DoctorArgs),
}

impl Operations {
    /// Run the command; the returned value is the process exit code.
    pub async fn execute(&self, ctx: &K8sCtxArgs, format: OutputFormat) -> anyhow::Result<i32> {
        let namespace = ctx.namespace.as_deref();
        match self {
            Operations::List(args) => {
                let store = ReleaseStore::new(ctx.clients().await?);
                let listing = store.list(namespace, &args.filters.to_filters()?).await?;
                if format == OutputFormat::Table {
                    output::release_table(&listing.releases);
                    output::errors_footer(&listing.errors);
                } else {
                    output::emit(
                        format,
                        &json!({"releases": listing.releases, "errors": listing.errors}),
                    )?;
                }
                Ok(0)
            }
            Operations::Info(args) => {
                let clients = ctx.clients().await?;
                let store = ReleaseStore::new(clients.clone());
                let lookup = store.get(&args.name, namespace).await?;
                let verdict = OwnerDetector::new(clients).detect(&lookup.release).await;
                if format == OutputFormat::Table {
                    output::release_info(&lookup.release, &verdict);
                    output::errors_footer(&lookup.errors);
                } else {
                    output::emit(
                        format,
                        &json!({
                            "release": lookup.release,
                            "owner": verdict,
                            "errors": lookup.errors,
                        }),
                    )?;
                }
                Ok(0)
            }
            Operations::History(args) => {
                let store = ReleaseStore::new(ctx.clients().await?);
                let revisions = store.history(&args.name, namespace).await?;
                if format == OutputFormat::Table {
                    output::history_table(&revisions);
                } else {
                    output::emit(format, &json!({"revisions": revisions}))?;
                }
                Ok(0)
            }
            Operations::Drift(args) => {
                let clients = ctx.clients().await?;
                let store = ReleaseStore::new(clients.clone());
                let lookup = store.get(&args.name, namespace).await?;
                let entries = DriftEngine::new(clients)
                    .diff(&lookup.release, !args.skip_extra)
                    .await?;
                let drifted = entries
                    .iter()
                    .any(|entry| entry.verdict != DriftVerdict::Unchanged);
                if format == OutputFormat::Table {
                    output::drift_table(&entries);
                    output::errors_footer(&lookup.errors);
                } else {
                    output::emit(
                        format,
                        &json!({
                            "release": lookup.release.handle(),
                            "entries": entries,
                            "errors": lookup.errors,
                        }),
                    )?;
                }
                Ok(i32::from(drifted))
            }
            Operations::Source(args) => {
                let store = ReleaseStore::new(ctx.clients().await?);
                let lookup = store.get(&args.name, namespace).await?;
                let resolver = RepoResolver::load();
                let matches = resolver.resolve(&lookup.release.chart_ref());
                let mut errors = lookup.errors;
                errors.extend(resolver.errors.iter().cloned());
                if format == OutputFormat::Table {
                    if matches.is_empty() {
                        crate::console_logger::info(
                            "No local repo index entry matches this chart",
                            Some(&format!(
                                "{}-{}",
                                lookup.release.chart_name, lookup.release.chart_version
                            )),
                        );
                    } else {
                        output::source_table(&matches);
                    }
                    output::errors_footer(&errors);
                } else {
                    output::emit(
                        format,
                        &json!({
                            "release": lookup.release.handle(),
                            "chart": lookup.release.chart_ref(),
                            "matches": matches,
                            "errors": errors,
                        }),
                    )?;
                }
                Ok(0)
            }
            Operations::Updates(args) => {
                let store = ReleaseStore::new(ctx.clients().await?);
                let listing = store.list(namespace, &args.filters.to_filters()?).await?;
                let resolver = RepoResolver::load();
                let statuses: Vec<_> = listing
                    .releases
                    .iter()
                    .map(|release| resolver.check_update(release))
                    .collect();
                let mut errors = listing.errors;
                errors.extend(resolver.errors.iter().cloned());
                if format == OutputFormat::Table {
                    output::updates_table(&statuses);
                    output::errors_footer(&errors);
                } else {
                    output::emit(format, &json!({"updates": statuses, "errors": errors}))?;
                }
                Ok(0)
            }
            Operations::Doctor(args) => {
                let store = ReleaseStore::new(ctx.clients().await?);
                let survey = store
                    .survey(namespace)
                    .await
                    .context("surveying release storage")?;
                let findings = diagnose(&survey, &args.config(), Utc::now());
                if format == OutputFormat::Table {
                    output::findings_table(&findings);
                    output::errors_footer(&survey.errors);
                } else {
                    output::emit(
                        format,
                        &json!({"findings": findings, "errors": survey.errors}),
                    )?;
                }
                Ok(i32::from(!findings.is_empty()))
            }
        }
    }
}
