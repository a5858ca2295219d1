//! The staging workspace.
//!
//! A pass forks the three permanent lineages into staging branches, commits
//! the classified changes there and then either finalizes them (fast-forward
//! of the permanent branches) or leaves the workspace holding a pending
//! merge. A pending merge is completed by [`Workspace::sync`], which copies
//! the merged files to the live tree before finalizing.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::cfg::Config;
use crate::classify::{classify, ExtractedEntry, Extracted};
use crate::diagnostic::Diagnostic;
use crate::error::{Error, Result};
use crate::hash::{self, FingerprintCache};
use crate::live::{self, LiveTree};
use crate::report::{PackageSummary, SyncReport, UpdateReport};
use crate::scan;
use crate::vcs::{CherryPick, GitRepo};

pub const MSG_REMOVE: &str = "Remove files missing in /etc";
pub const MSG_VENDOR_ADD: &str = "Add or upgrade files extracted from a package";
pub const MSG_MERGE: &str = "Merge with upgraded package files not copied to /etc";
pub const MSG_USER_ADD: &str = "Add files with user changes";
pub const MSG_USER_UPDATE: &str = "Update files with user changes";
pub const MSG_CURSORS: &str = "Update the package cursors";

/// Scratch branch of the trial cherry-pick.
pub const SCRATCH_BRANCH: &str = "cherry-pick";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lineage {
    User,
    Vendor,
    Cursor,
}

impl Lineage {
    /// Finalization order.
    pub const ALL: [Lineage; 3] = [Lineage::User, Lineage::Vendor, Lineage::Cursor];

    pub fn branch(self) -> &'static str {
        match self {
            Lineage::User => "user",
            Lineage::Vendor => "vendor",
            Lineage::Cursor => "cursor",
        }
    }

    pub fn staging(self) -> &'static str {
        match self {
            Lineage::User => "user-staging",
            Lineage::Vendor => "vendor-staging",
            Lineage::Cursor => "cursor-staging",
        }
    }

    /// Tag left on the previous head of the permanent branch.
    pub fn prev_tag(self) -> Option<&'static str> {
        match self {
            Lineage::User => Some("user-prev"),
            Lineage::Vendor => Some("vendor-prev"),
            Lineage::Cursor => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkspaceState {
    Idle,
    /// Staging branches without a merge-origin commit.
    Staged,
    /// `commit` on `user-staging` carries the cherry-pick trailer.
    PendingMerge { commit: String },
    /// A cherry-pick is in progress, `paths` are still unmerged.
    Conflicted { paths: Vec<PathBuf> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PassOutcome {
    Finalized,
    /// The vendor changes were merged into `user-staging`, the live tree
    /// is updated by a sync.
    PendingSync { commit: String },
    /// The cherry-pick of `commit` stopped on conflicts in `paths`.
    Conflicted {
        commit: String,
        paths: Vec<PathBuf>,
        remedy: String,
    },
}

pub struct Workspace<'a> {
    config: &'a Config,
    repo: GitRepo,
}

impl<'a> Workspace<'a> {
    /// Create the repository and its permanent branches.
    pub fn create(config: &'a Config) -> Result<Self> {
        let mut repo = GitRepo::create(&config.general.repo_dir, Lineage::User.branch())?;
        for lineage in [Lineage::Vendor, Lineage::Cursor] {
            repo.create_branch(lineage.branch(), Lineage::User.branch())?;
        }
        repo.checkout(Lineage::User.branch())?;
        info!("created repository {}", config.general.repo_dir.display());
        Ok(Workspace { config, repo })
    }

    pub fn open(config: &'a Config) -> Result<Self> {
        let repo = GitRepo::open(&config.general.repo_dir, Lineage::User.branch())?;
        Ok(Workspace { config, repo })
    }

    /// The workspace state, read without requiring a clean working tree.
    pub fn status(config: &Config) -> Result<WorkspaceState> {
        let repo = GitRepo::open_unchecked(&config.general.repo_dir, Lineage::User.branch())?;
        detect_state(&repo)
    }

    pub fn state(&self) -> Result<WorkspaceState> {
        detect_state(&self.repo)
    }

    /// Return to the branch checked out before the workspace was opened.
    pub fn close(mut self) -> Result<()> {
        self.repo.close(Lineage::User.branch())
    }

    fn root_dir(&self) -> &Path {
        &self.config.general.root_dir
    }

    fn repo_dir(&self) -> PathBuf {
        self.repo.repo_dir().to_path_buf()
    }

    /// Run one reconciliation pass.
    ///
    /// A workspace left pending by a previous pass is synced and finalized
    /// instead, a staged one without a pending merge is discarded first.
    pub fn update(&mut self, dry_run: bool) -> Result<UpdateReport> {
        let mut report = UpdateReport::new(dry_run);

        match self.state()? {
            WorkspaceState::PendingMerge { commit } => {
                report.resumed = true;
                if dry_run {
                    report.outcome = PassOutcome::PendingSync { commit };
                    return Ok(report);
                }
                let sync = self.sync(false)?;
                report.synced = sync.synced;
                report.diagnostics.extend(sync.diagnostics);
                return Ok(report);
            }
            WorkspaceState::Conflicted { paths } => {
                return Err(Error::NotClean {
                    path: self.repo_dir(),
                    dirty: paths.iter().map(|p| p.display().to_string()).collect(),
                });
            }
            WorkspaceState::Staged => {
                report.diagnostics.push(Diagnostic::new(
                    "discarding the staging branches of an incomplete pass",
                ));
                self.discard_staging()?;
            }
            WorkspaceState::Idle => {}
        }

        for lineage in Lineage::ALL {
            self.repo.create_branch(lineage.staging(), lineage.branch())?;
        }

        let outcome = self.stage(&mut report, dry_run);
        match outcome {
            Ok(outcome) => report.outcome = outcome,
            Err(e) => {
                // Leave nothing half committed behind.
                if !self.repo.cherry_pick_in_progress() {
                    if let Err(cleanup) = self.repo.discard_changes() {
                        warn!("cannot discard the changes of the failed pass: {}", cleanup);
                    }
                }
                return Err(e);
            }
        }

        if dry_run {
            self.discard_staging()?;
        }
        Ok(report)
    }

    fn stage(&mut self, report: &mut UpdateReport, dry_run: bool) -> Result<PassOutcome> {
        let root_dir = self.root_dir().to_path_buf();
        let repo_dir = self.repo_dir();
        let config = self.config;

        self.repo.checkout(Lineage::User.staging())?;
        let user_files = self.repo.tracked_files(Lineage::User.staging())?;
        let (user_snapshot, diagnostics) = hash::snapshot(&repo_dir, &root_dir, &user_files);
        report.diagnostics.extend(diagnostics);

        self.repo.checkout(Lineage::Cursor.staging())?;
        let (cursors, diagnostics) = scan::read_cursors(&repo_dir);
        report.diagnostics.extend(diagnostics);
        let (archives, diagnostics) = scan::discover(
            &config.cache_dirs(),
            config.packages.aur_dir.as_deref(),
            &config.packages.exclude_pkgs,
            &cursors,
        );
        report.diagnostics.extend(diagnostics);

        self.repo.checkout(Lineage::Vendor.staging())?;
        let vendor_files = self.repo.tracked_files(Lineage::Vendor.staging())?;
        let (vendor_snapshot, diagnostics) = hash::snapshot(&repo_dir, &root_dir, &vendor_files);
        report.diagnostics.extend(diagnostics);

        debug!("extracting {} package archives", archives.len());
        let records = scan::extract(&archives, &repo_dir, &config.files.exclude_files)?;

        let mut extracted = Extracted::new();
        let mut vendor_cache = FingerprintCache::new(&repo_dir, &root_dir);
        for record in &records {
            for member in &record.members {
                let previous = vendor_snapshot.get(member).cloned();
                if previous.is_none() {
                    widen_permissions(&repo_dir.join(member))?;
                }
                extracted.insert(
                    member.clone(),
                    ExtractedEntry {
                        previous,
                        current: vendor_cache.get(member),
                    },
                );
            }
        }
        report.diagnostics.extend(vendor_cache.take_diagnostics());
        report.packages = records.iter().map(PackageSummary::from).collect();

        let mut live = LiveTree::new(&root_dir);
        let live_files: BTreeSet<PathBuf> = live
            .list(&[])?
            .into_iter()
            .filter(|path| !config.is_excluded(path))
            .collect();
        let classification = classify(
            &extracted,
            &mut live,
            &live_files,
            &vendor_snapshot,
            &user_snapshot,
        );
        report.diagnostics.extend(classification.diagnostics);
        let changes = classification.changes;

        // Vendor lineage, the working tree holds the extracted files.
        if !changes.vendor_remove.is_empty() {
            self.repo.remove(&to_vec(&changes.vendor_remove), MSG_REMOVE)?;
        }
        if !changes.vendor_add.is_empty() {
            self.repo.commit(&to_vec(&changes.vendor_add), MSG_VENDOR_ADD)?;
        }
        let merge_origin = if changes.needs_merge.is_empty() {
            None
        } else {
            self.repo.commit(&to_vec(&changes.needs_merge), MSG_MERGE)?;
            Some(self.repo.rev_parse("HEAD")?)
        };
        self.repo.discard_changes()?;

        self.repo.checkout(Lineage::User.staging())?;
        if !changes.user_remove.is_empty() {
            self.repo.remove(&to_vec(&changes.user_remove), MSG_REMOVE)?;
        }
        for (paths, msg) in [
            (&changes.user_add, MSG_USER_ADD),
            (&changes.user_update, MSG_USER_UPDATE),
        ] {
            if paths.is_empty() {
                continue;
            }
            for path in paths {
                live::copy_file(path, &root_dir, &repo_dir)?;
            }
            self.repo.commit(&to_vec(paths), msg)?;
        }

        if !records.is_empty() {
            self.repo.checkout(Lineage::Cursor.staging())?;
            self.repo.add_files(&scan::cursor_files(&records), MSG_CURSORS)?;
        }

        report.changes = changes;

        match merge_origin {
            Some(commit) => self.replay(&commit, dry_run),
            None => {
                if !dry_run {
                    self.finalize()?;
                }
                Ok(PassOutcome::Finalized)
            }
        }
    }

    /// Replay the merge-origin `commit` onto `user-staging`.
    ///
    /// The cherry-pick is tried first on a scratch branch. On conflict the
    /// trial is aborted and the cherry-pick is done again on `user-staging`,
    /// where it is left for the user to resolve.
    fn replay(&mut self, commit: &str, dry_run: bool) -> Result<PassOutcome> {
        self.repo.checkout(Lineage::User.staging())?;
        self.repo.create_branch(SCRATCH_BRANCH, Lineage::User.staging())?;

        match self.repo.cherry_pick(commit)? {
            CherryPick::Applied => {
                if dry_run {
                    self.repo.checkout(Lineage::User.staging())?;
                } else {
                    self.repo.fast_forward(Lineage::User.staging(), SCRATCH_BRANCH)?;
                }
                self.repo.delete_branch(SCRATCH_BRANCH)?;
                Ok(PassOutcome::PendingSync {
                    commit: commit.to_string(),
                })
            }
            CherryPick::Conflict { paths, output } => {
                debug!("trial cherry-pick failed:\n{}", output);
                self.repo.abort_cherry_pick()?;
                self.repo.checkout(Lineage::User.staging())?;
                self.repo.delete_branch(SCRATCH_BRANCH)?;

                if !dry_run {
                    if let CherryPick::Applied = self.repo.cherry_pick(commit)? {
                        return Ok(PassOutcome::PendingSync {
                            commit: commit.to_string(),
                        });
                    }
                }
                Ok(PassOutcome::Conflicted {
                    commit: commit.to_string(),
                    paths,
                    remedy: self.repo.command_line("cherry-pick --abort"),
                })
            }
        }
    }

    /// Copy the files merged by the pending cherry-pick to the live tree,
    /// keeping the mode of the live files, then finalize.
    pub fn sync(&mut self, dry_run: bool) -> Result<SyncReport> {
        let mut report = SyncReport::new(dry_run);
        let staging = Lineage::User.staging();
        if !self.repo.branch_exists(staging)? {
            return Ok(report);
        }

        let commits = self
            .repo
            .cherry_picked_commits(Lineage::User.branch(), staging)?;
        let commit = match commits.as_slice() {
            [] => {
                return Err(Error::NoPendingMerge {
                    branch: staging.to_string(),
                })
            }
            [commit] => commit.clone(),
            _ => {
                return Err(Error::AmbiguousMerge {
                    branch: staging.to_string(),
                    count: commits.len(),
                })
            }
        };

        self.repo.checkout(staging)?;
        let repo_dir = self.repo_dir();
        let root_dir = self.root_dir().to_path_buf();
        let live = LiveTree::new(&root_dir);

        for path in self.repo.commit_paths(&commit)? {
            if self.config.is_excluded(&path) {
                continue;
            }
            if !live.exists(&path) {
                report
                    .diagnostics
                    .push(Diagnostic::for_path(&path, "not in /etc, not synced"));
                continue;
            }
            if fs::symlink_metadata(repo_dir.join(&path)).is_err() {
                report
                    .diagnostics
                    .push(Diagnostic::for_path(&path, "removed by the merge, not synced"));
                continue;
            }
            if !dry_run {
                live::copy_preserving_mode(&path, &repo_dir, &root_dir)?;
                debug!("synced {}", path.display());
            }
            report.synced.push(path);
        }
        report.commit = Some(commit);

        if !dry_run {
            self.finalize()?;
        }
        Ok(report)
    }

    /// Fast-forward the permanent branches to their staging branches and
    /// delete the staging branches.
    pub fn finalize(&mut self) -> Result<()> {
        let dirty = self.repo.status()?;
        if !dirty.is_empty() {
            return Err(Error::NotClean {
                path: self.repo_dir(),
                dirty,
            });
        }

        for lineage in Lineage::ALL {
            let staging = lineage.staging();
            if !self.repo.branch_exists(staging)? {
                continue;
            }
            if let Some(tag) = lineage.prev_tag() {
                if self.repo.range_has_commits(lineage.branch(), staging)? {
                    self.repo.tag(tag, lineage.branch())?;
                }
            }
            self.repo.fast_forward(lineage.branch(), staging)?;
            self.repo.delete_branch(staging)?;
        }
        self.repo.checkout(Lineage::User.branch())
    }

    /// Live files not tracked in the vendor lineage.
    pub fn diff(&self, use_staging: bool) -> Result<Vec<PathBuf>> {
        let staging = Lineage::Vendor.staging();
        let branch = if use_staging && self.repo.branch_exists(staging)? {
            staging
        } else {
            Lineage::Vendor.branch()
        };
        let tracked = self.repo.tracked_files(branch)?;

        let live = LiveTree::new(self.root_dir());
        Ok(live
            .list(&self.config.files.exclude_prefixes)?
            .into_iter()
            .filter(|path| !tracked.contains(path) && !self.config.is_excluded(path))
            .collect())
    }

    fn discard_staging(&mut self) -> Result<()> {
        if self.repo.cherry_pick_in_progress() {
            self.repo.abort_cherry_pick()?;
        }
        self.repo.discard_changes()?;
        self.repo.checkout(Lineage::User.branch())?;
        let branches = self.repo.branches()?;
        for lineage in Lineage::ALL {
            if branches.iter().any(|b| b == lineage.staging()) {
                self.repo.delete_branch(lineage.staging())?;
            }
        }
        if branches.iter().any(|b| b == SCRATCH_BRANCH) {
            self.repo.delete_branch(SCRATCH_BRANCH)?;
        }
        Ok(())
    }
}

fn detect_state(repo: &GitRepo) -> Result<WorkspaceState> {
    let branches = repo.branches()?;
    let staged = branches
        .iter()
        .any(|b| b == SCRATCH_BRANCH || Lineage::ALL.iter().any(|l| b == l.staging()));
    if !staged {
        return Ok(WorkspaceState::Idle);
    }

    if repo.cherry_pick_in_progress() {
        return Ok(WorkspaceState::Conflicted {
            paths: repo.unmerged_paths()?,
        });
    }

    let staging = Lineage::User.staging();
    if !branches.iter().any(|b| b == staging) {
        return Ok(WorkspaceState::Staged);
    }
    let mut commits = repo.cherry_picked_commits(Lineage::User.branch(), staging)?;
    match commits.len() {
        0 => Ok(WorkspaceState::Staged),
        1 => Ok(WorkspaceState::PendingMerge {
            commit: commits.remove(0),
        }),
        count => Err(Error::AmbiguousMerge {
            branch: staging.to_string(),
            count,
        }),
    }
}

fn to_vec<'p>(paths: impl IntoIterator<Item = &'p PathBuf>) -> Vec<PathBuf> {
    paths.into_iter().cloned().collect()
}

/// Give the owner read and write access to a newly extracted file.
fn widen_permissions(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path).map_err(|e| Error::io(path, e))?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }
    let mode = metadata.permissions().mode();
    if mode & 0o600 != 0o600 {
        fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o600))
            .map_err(|e| Error::io(path, e))?;
    }
    Ok(())
}
