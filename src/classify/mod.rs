//! Classification of the drift between the live tree and the two lineages.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::diagnostic::Diagnostic;
use crate::hash::{Fingerprint, Snapshot};
use crate::live::LiveTree;

/// A path extracted from a package archive in this pass.
#[derive(Debug, Clone)]
pub struct ExtractedEntry {
    /// Vendor fingerprint before extraction, `None` when not tracked.
    pub previous: Option<Fingerprint>,
    pub current: Fingerprint,
}

pub type Extracted = BTreeMap<PathBuf, ExtractedEntry>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub vendor_add: BTreeSet<PathBuf>,
    pub vendor_remove: BTreeSet<PathBuf>,
    pub user_add: BTreeSet<PathBuf>,
    pub user_update: BTreeSet<PathBuf>,
    pub user_remove: BTreeSet<PathBuf>,
    pub needs_merge: BTreeSet<PathBuf>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.vendor_add.is_empty()
            && self.vendor_remove.is_empty()
            && self.user_add.is_empty()
            && self.user_update.is_empty()
            && self.user_remove.is_empty()
            && self.needs_merge.is_empty()
    }

    /// Each category with its name, in reporting order.
    pub fn categories(&self) -> [(&'static str, &BTreeSet<PathBuf>); 6] {
        [
            ("vendor_remove", &self.vendor_remove),
            ("vendor_add", &self.vendor_add),
            ("needs_merge", &self.needs_merge),
            ("user_remove", &self.user_remove),
            ("user_add", &self.user_add),
            ("user_update", &self.user_update),
        ]
    }
}

#[derive(Debug, Default)]
pub struct Classification {
    pub changes: ChangeSet,
    pub diagnostics: Vec<Diagnostic>,
}

/// Classify one pass.
///
/// `vendor` and `user` are the lineage snapshots taken before extraction.
/// `live_files` is the listing of the live tree. Live fingerprints are read
/// through `live`, at most once per path.
pub fn classify(
    extracted: &Extracted,
    live: &mut LiveTree,
    live_files: &BTreeSet<PathBuf>,
    vendor: &Snapshot,
    user: &Snapshot,
) -> Classification {
    let mut changes = ChangeSet::default();
    let mut diagnostics = Vec::new();

    for (path, entry) in extracted {
        let live_fp = live.fingerprint(path);
        if live_fp.is_unreadable() {
            let message = if live.exists(path) {
                "cannot read the file in /etc, package file ignored"
            } else {
                "not in /etc, package file ignored"
            };
            diagnostics.push(Diagnostic::for_path(path, message));
            continue;
        }

        match &entry.previous {
            None => {
                changes.vendor_add.insert(path.clone());
                if live_fp != entry.current {
                    changes.user_add.insert(path.clone());
                }
            }
            Some(previous) if live_fp == entry.current => {
                if *previous != entry.current {
                    changes.vendor_add.insert(path.clone());
                }
                if user.contains_key(path) {
                    diagnostics.push(Diagnostic::for_path(
                        path,
                        "user file identical to the upgraded package file",
                    ));
                }
            }
            Some(previous) => {
                if *previous != entry.current {
                    changes.needs_merge.insert(path.clone());
                }
                if !user.contains_key(path) {
                    diagnostics.push(Diagnostic::for_path(
                        path,
                        "differs from the package file but is not tracked as a user file",
                    ));
                }
            }
        }
    }

    // The lineages as they will be once the package changes are committed.
    let mut vendor_after: BTreeMap<&Path, Fingerprint> = vendor
        .iter()
        .map(|(path, fp)| (path.as_path(), fp.clone()))
        .collect();
    for path in changes.vendor_add.iter().chain(changes.needs_merge.iter()) {
        if let Some(entry) = extracted.get(path) {
            vendor_after.insert(path.as_path(), entry.current.clone());
        }
    }
    let mut user_after: BTreeMap<&Path, Fingerprint> = user
        .iter()
        .map(|(path, fp)| (path.as_path(), fp.clone()))
        .collect();
    let package_user_add = changes.user_add.clone();
    for path in &package_user_add {
        user_after.insert(path.as_path(), live.fingerprint(path));
    }

    for path in vendor_after.keys() {
        if !live.exists(path) {
            changes.vendor_remove.insert(path.to_path_buf());
            if user_after.contains_key(path) {
                changes.user_remove.insert(path.to_path_buf());
            }
        }
    }
    for path in user_after.keys() {
        if !live.exists(path) {
            changes.user_remove.insert(path.to_path_buf());
        }
    }

    for path in live_files {
        let Some(vendor_fp) = vendor_after.get(path.as_path()) else {
            continue;
        };
        if user_after.contains_key(path.as_path()) || changes.vendor_remove.contains(path) {
            continue;
        }
        let live_fp = live.fingerprint(path);
        if live_fp.is_unreadable() {
            diagnostics.push(Diagnostic::for_path(path, "cannot read the file in /etc"));
            continue;
        }
        if live_fp != *vendor_fp {
            changes.user_add.insert(path.clone());
        }
    }

    for (path, user_fp) in &user_after {
        if package_user_add.contains(*path) || changes.user_remove.contains(*path) {
            continue;
        }
        let live_fp = live.fingerprint(path);
        if live_fp.is_unreadable() {
            diagnostics.push(Diagnostic::for_path(path, "cannot read the file in /etc"));
            continue;
        }
        if live_fp != *user_fp {
            changes.user_update.insert(path.to_path_buf());
        }
    }

    diagnostics.extend(live.take_diagnostics());
    Classification {
        changes,
        diagnostics,
    }
}
