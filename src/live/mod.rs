//! Access to the live configuration tree, `<root_dir>/etc`.

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::diagnostic::Diagnostic;
use crate::error::{Error, Result};
use crate::hash::{Fingerprint, FingerprintCache};

/// The subdirectory of the root directory holding the configuration files.
pub const ROOT_SUBDIR: &str = "etc";

/// Files left behind by pacman next to a configuration file.
pub const BACKUP_SUFFIXES: [&str; 3] = [".pacnew", ".pacsave", ".pacorig"];

/// The live tree as seen by one pass. Fingerprints are memoized.
#[derive(Debug)]
pub struct LiveTree {
    root_dir: PathBuf,
    cache: FingerprintCache,
}

impl LiveTree {
    pub fn new(root_dir: &Path) -> Self {
        LiveTree {
            root_dir: root_dir.to_path_buf(),
            cache: FingerprintCache::new(root_dir, root_dir),
        }
    }

    pub fn path(&self, rel_path: &Path) -> PathBuf {
        self.root_dir.join(rel_path)
    }

    /// True when the path exists, a dangling symlink included.
    pub fn exists(&self, rel_path: &Path) -> bool {
        fs::symlink_metadata(self.path(rel_path)).is_ok()
    }

    pub fn fingerprint(&mut self, rel_path: &Path) -> Fingerprint {
        self.cache.get(rel_path)
    }

    /// Relative paths of the live configuration files, pacman backup files
    /// excluded.
    pub fn list(&self, prefixes: &[String]) -> Result<BTreeSet<PathBuf>> {
        list_files(&self.root_dir, &BACKUP_SUFFIXES, prefixes)
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        self.cache.take_diagnostics()
    }
}

/// List the files and symlinks under `<base>/etc`, as paths relative to
/// `base`.
///
/// Names ending with one of `suffixes`, or whose path relative to `etc/`
/// starts with one of `prefixes`, are left out.
pub fn list_files(base: &Path, suffixes: &[&str], prefixes: &[String]) -> Result<BTreeSet<PathBuf>> {
    let top = base.join(ROOT_SUBDIR);
    let mut files = BTreeSet::new();
    if !top.is_dir() {
        return Ok(files);
    }

    for entry in WalkDir::new(&top)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_dir() {
            continue;
        }
        let Ok(in_subdir) = entry.path().strip_prefix(&top) else {
            continue;
        };
        let name = in_subdir.to_string_lossy();
        if suffixes.iter().any(|s| !s.is_empty() && name.ends_with(s)) {
            continue;
        }
        if prefixes.iter().any(|p| !p.is_empty() && name.starts_with(p.as_str())) {
            continue;
        }
        files.insert(Path::new(ROOT_SUBDIR).join(in_subdir));
    }

    Ok(files)
}

/// Copy `rel_path` from the `src` tree to the `dest` tree.
///
/// Symlinks are recreated, never followed. Regular files keep the
/// permissions of the source.
pub fn copy_file(rel_path: &Path, src: &Path, dest: &Path) -> Result<()> {
    let src_path = src.join(rel_path);
    let dest_path = dest.join(rel_path);

    if let Some(parent) = dest_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    let src_is_link = is_symlink(&src_path);
    if fs::symlink_metadata(&dest_path).is_ok() && (src_is_link || is_symlink(&dest_path)) {
        fs::remove_file(&dest_path).map_err(|e| Error::io(&dest_path, e))?;
    }

    if src_is_link {
        let target = fs::read_link(&src_path).map_err(|e| Error::io(&src_path, e))?;
        symlink(&target, &dest_path).map_err(|e| Error::io(&dest_path, e))?;
    } else {
        fs::copy(&src_path, &dest_path).map_err(|e| Error::io(&dest_path, e))?;
    }

    Ok(())
}

/// Copy `rel_path` from the `src` tree over the existing file of the
/// `dest` tree, keeping the mode bits of the file being replaced.
pub fn copy_preserving_mode(rel_path: &Path, src: &Path, dest: &Path) -> Result<()> {
    let dest_path = dest.join(rel_path);
    let previous_mode = match fs::symlink_metadata(&dest_path) {
        Ok(metadata) if !metadata.file_type().is_symlink() => Some(metadata.permissions().mode()),
        _ => None,
    };

    copy_file(rel_path, src, dest)?;

    if let Some(mode) = previous_mode {
        if !is_symlink(&dest_path) {
            fs::set_permissions(&dest_path, fs::Permissions::from_mode(mode))
                .map_err(|e| Error::io(&dest_path, e))?;
        }
    }

    Ok(())
}

pub fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}
