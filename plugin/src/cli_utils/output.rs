//! Rendering of result objects: plain tables for humans, JSON/YAML envelopes
//! (results plus an `errors` array) for machines.

use crate::console_logger;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use helm_commander::{
    doctor::DoctorFinding,
    drift::{DiffEntry, DriftVerdict},
    owner::OwnerVerdict,
    release::{HelmRelease, ItemError, ReleaseStatus},
    repo::{RepoMatch, UpdateStatus},
};
use prettytable::{format, row, Table};

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

/// Serialize a machine-readable envelope.
pub fn emit(output: OutputFormat, body: &serde_json::Value) -> anyhow::Result<()> {
    match output {
        OutputFormat::Table | OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(body)?)
        }
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(body)?),
    }
    Ok(())
}

fn clean_table() -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_CLEAN);
    table
}

fn time_cell(at: &Option<DateTime<Utc>>) -> String {
    at.map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn status_cell(status: ReleaseStatus) -> String {
    match status {
        ReleaseStatus::Unknown => "unknown (!)".to_string(),
        status if status.is_pending() || status == ReleaseStatus::Failed => {
            format!("{status} (!)")
        }
        status => status.to_string(),
    }
}

fn dash_if_empty(text: &str) -> &str {
    if text.is_empty() {
        "-"
    } else {
        text
    }
}

pub fn release_table(releases: &[HelmRelease]) {
    let mut table = clean_table();
    table.set_titles(row![
        "NAME",
        "NAMESPACE",
        "REVISION",
        "STATUS",
        "CHART",
        "APP VERSION",
        "UPDATED"
    ]);
    for release in releases {
        let chart = if release.chart_name.is_empty() {
            "-".to_string()
        } else {
            format!("{}-{}", release.chart_name, release.chart_version)
        };
        table.add_row(row![
            release.name,
            release.namespace,
            release.revision,
            status_cell(release.status),
            chart,
            dash_if_empty(&release.app_version),
            time_cell(&release.updated_at),
        ]);
    }
    table.printstd();
}

pub fn history_table(revisions: &[HelmRelease]) {
    let mut table = clean_table();
    table.set_titles(row!["REVISION", "STATUS", "UPDATED", "STORAGE", "OBJECT"]);
    for revision in revisions {
        table.add_row(row![
            revision.revision,
            status_cell(revision.status),
            time_cell(&revision.updated_at),
            revision.storage_kind,
            revision.storage_object_name,
        ]);
    }
    table.printstd();
}

pub fn release_info(release: &HelmRelease, verdict: &OwnerVerdict) {
    println!("Name:        {}", release.name);
    println!("Namespace:   {}", release.namespace);
    println!("Revision:    {}", release.revision);
    println!("Status:      {}", status_cell(release.status));
    println!("Chart:       {}-{}", release.chart_name, release.chart_version);
    println!("App Version: {}", dash_if_empty(&release.app_version));
    println!("Updated:     {}", time_cell(&release.updated_at));
    println!("Description: {}", dash_if_empty(&release.description));
    println!(
        "Storage:     {} ({})",
        release.storage_kind, release.storage_object_name
    );
    println!(
        "Owner:       {} ({} confidence)",
        verdict.owner, verdict.confidence
    );
    for evidence in &verdict.evidence {
        println!("  - {evidence}");
    }
    if !release.values_user.is_empty() {
        println!("User-supplied values:");
        match serde_yaml::to_string(&release.values_user) {
            Ok(values) => print!("{values}"),
            Err(_) => println!("  (unrenderable)"),
        }
    }
    if !release.hooks.is_empty() {
        println!("Hooks:       {}", release.hooks.len());
    }
}

pub fn drift_table(entries: &[DiffEntry]) {
    let mut table = clean_table();
    table.set_titles(row!["RESOURCE", "VERDICT", "DETAIL"]);
    for entry in entries {
        let detail = match entry.verdict {
            DriftVerdict::Modified => format!("{} changed path(s)", entry.changes.len()),
            _ => entry.note.clone().unwrap_or_default(),
        };
        table.add_row(row![entry.key, verdict_cell(entry.verdict), detail]);
    }
    table.printstd();

    for entry in entries {
        if entry.verdict != DriftVerdict::Modified {
            continue;
        }
        println!("{}:", entry.key);
        for change in &entry.changes {
            println!("  {}: {} -> {}", change.path, change.old, change.new);
        }
    }
}

fn verdict_cell(verdict: DriftVerdict) -> &'static str {
    match verdict {
        DriftVerdict::Unchanged => "unchanged",
        DriftVerdict::Modified => "modified (!)",
        DriftVerdict::MissingLive => "missing live (!)",
        DriftVerdict::ExtraLive => "extra live (!)",
    }
}

pub fn source_table(matches: &[RepoMatch]) {
    let mut table = clean_table();
    table.set_titles(row!["REPO", "VERSION", "APP VERSION", "DIGEST", "URL"]);
    for matched in matches {
        table.add_row(row![
            matched.repo,
            matched.entry.version,
            matched
                .entry
                .app_version
                .as_deref()
                .unwrap_or("-"),
            matched.entry.digest.as_deref().unwrap_or("-"),
            matched
                .entry
                .urls
                .first()
                .map(String::as_str)
                .or(matched.url.as_deref())
                .unwrap_or("-"),
        ]);
    }
    table.printstd();
}

pub fn updates_table(statuses: &[UpdateStatus]) {
    let mut table = clean_table();
    table.set_titles(row![
        "NAME",
        "NAMESPACE",
        "CHART",
        "CURRENT",
        "LATEST",
        "REPO",
        "UPGRADE"
    ]);
    for status in statuses {
        table.add_row(row![
            status.name,
            status.namespace,
            status.chart_name,
            status.current,
            status.latest.as_deref().unwrap_or("-"),
            status.repo.as_deref().unwrap_or("-"),
            if status.upgrade_available { "yes" } else { "no" },
        ]);
    }
    table.printstd();
}

pub fn findings_table(findings: &[DoctorFinding]) {
    if findings.is_empty() {
        console_logger::info("No findings, the cluster's releases look healthy", None);
        return;
    }
    let mut table = clean_table();
    table.set_titles(row!["SEVERITY", "CATEGORY", "SUBJECT", "MESSAGE"]);
    for finding in findings {
        table.add_row(row![
            finding.severity,
            finding.category,
            finding.subject,
            finding.message,
        ]);
    }
    table.printstd();
}

/// Per-item failures go to stderr under table output; machine output carries
/// them in the envelope instead.
pub fn errors_footer(errors: &[ItemError]) {
    for error in errors {
        console_logger::warn(&format!("{} ({})", error.item, error.kind), &error.message);
    }
}
