//! Reports of the `update` and `sync` commands.

use chrono::{DateTime, TimeZone, Utc};
use colored::*;
use serde::Serialize;
use std::path::PathBuf;

use crate::classify::ChangeSet;
use crate::diagnostic::Diagnostic;
use crate::scan::PackageRecord;
use crate::ui;
use crate::workspace::PassOutcome;

#[derive(Debug, Clone, Serialize)]
pub struct PackageSummary {
    pub name: String,
    pub version: String,
    pub archive: PathBuf,
    pub modified: DateTime<Utc>,
    pub files: usize,
}

impl From<&PackageRecord> for PackageSummary {
    fn from(record: &PackageRecord) -> Self {
        let nanos = i64::try_from(record.archive.mtime).unwrap_or(i64::MAX);
        PackageSummary {
            name: record.archive.name.clone(),
            version: record.archive.version.clone(),
            archive: record.archive.path.clone(),
            modified: Utc.timestamp_nanos(nanos),
            files: record.members.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub dry_run: bool,
    /// A pending merge of a previous pass was synced and finalized.
    pub resumed: bool,
    pub packages: Vec<PackageSummary>,
    pub changes: ChangeSet,
    pub outcome: PassOutcome,
    pub synced: Vec<PathBuf>,
    pub diagnostics: Vec<Diagnostic>,
}

impl UpdateReport {
    pub fn new(dry_run: bool) -> Self {
        UpdateReport {
            dry_run,
            resumed: false,
            packages: Vec::new(),
            changes: ChangeSet::default(),
            outcome: PassOutcome::Finalized,
            synced: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn print(&self) {
        if self.resumed {
            ui::info("Completed the pending merge of the previous update");
            print_paths("Synced to /etc", &self.synced);
        }

        if !self.packages.is_empty() {
            ui::section("Packages");
            for package in &self.packages {
                println!(
                    "  {} {} {}",
                    package.name.bold(),
                    package.version,
                    format!("({})", package.modified.format("%Y-%m-%d %H:%M:%S")).dimmed()
                );
            }
        }

        if !self.resumed {
            if self.changes.is_empty() {
                ui::info("No changes");
            }
            for (name, paths) in self.changes.categories() {
                let paths: Vec<PathBuf> = paths.iter().cloned().collect();
                print_paths(&category_title(name), &paths);
            }
        }

        print_diagnostics(&self.diagnostics);

        match &self.outcome {
            PassOutcome::Finalized if self.dry_run => ui::info("Dry run, nothing committed"),
            PassOutcome::Finalized => ui::success("Update done"),
            PassOutcome::PendingSync { .. } => {
                ui::info("Package upgrades were merged with the user changes");
                if self.dry_run {
                    ui::info("Dry run, nothing committed");
                } else {
                    ui::hint("Run 'etcdrift sync' to copy the merged files to /etc");
                }
            }
            PassOutcome::Conflicted { paths, remedy, .. } => {
                ui::warn("The merge of the package upgrades has conflicts:");
                for path in paths {
                    println!("  {}", path.display());
                }
                if !self.dry_run {
                    ui::hint(
                        "Resolve the conflicts and commit the result without changing the commit message, then run 'etcdrift sync'",
                    );
                    ui::hint(&format!("Or give up the merge with '{}'", remedy));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub dry_run: bool,
    /// The merge-origin commit, `None` when there was nothing to sync.
    pub commit: Option<String>,
    pub synced: Vec<PathBuf>,
    pub diagnostics: Vec<Diagnostic>,
}

impl SyncReport {
    pub fn new(dry_run: bool) -> Self {
        SyncReport {
            dry_run,
            commit: None,
            synced: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn print(&self) {
        if self.commit.is_none() {
            ui::info("Nothing to sync");
            return;
        }
        let title = if self.dry_run {
            "Files that would be copied to /etc"
        } else {
            "Copied to /etc"
        };
        print_paths(title, &self.synced);
        print_diagnostics(&self.diagnostics);
        if !self.dry_run {
            ui::success("Sync done");
        }
    }
}

fn category_title(name: &str) -> String {
    match name {
        "vendor_remove" => "Removed from the vendor lineage".to_string(),
        "vendor_add" => "Added or upgraded in the vendor lineage".to_string(),
        "needs_merge" => "To merge with user changes".to_string(),
        "user_remove" => "Removed from the user lineage".to_string(),
        "user_add" => "Added to the user lineage".to_string(),
        "user_update" => "Updated in the user lineage".to_string(),
        other => other.to_string(),
    }
}

pub fn print_paths(title: &str, paths: &[PathBuf]) {
    if paths.is_empty() {
        return;
    }
    ui::section(title);
    for path in paths {
        println!("  {}", path.display());
    }
}

pub fn print_diagnostics(diagnostics: &[Diagnostic]) {
    if diagnostics.is_empty() {
        return;
    }
    ui::section("Warnings");
    for diagnostic in diagnostics {
        ui::warn(&diagnostic.to_string());
    }
}
