//! Content fingerprints of files and symlinks.
//!
//! A fingerprint is what two copies of a configuration file are compared
//! by: the blake3 digest of a regular file, or the normalized target of a
//! symlink. A file that cannot be read gets [`Fingerprint::Unreadable`],
//! which compares unequal to everything, itself included.

use blake3::Hasher;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use crate::diagnostic::Diagnostic;

/// Fingerprints keyed by path relative to the tree base.
pub type Snapshot = BTreeMap<PathBuf, Fingerprint>;

#[derive(Debug, Clone)]
pub enum Fingerprint {
    Hash(blake3::Hash),
    SymlinkTarget(PathBuf),
    Unreadable,
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Fingerprint::Hash(a), Fingerprint::Hash(b)) => a == b,
            (Fingerprint::SymlinkTarget(a), Fingerprint::SymlinkTarget(b)) => a == b,
            _ => false,
        }
    }
}

impl Fingerprint {
    pub fn is_unreadable(&self) -> bool {
        matches!(self, Fingerprint::Unreadable)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fingerprint::Hash(hash) => write!(f, "{}", hash.to_hex()),
            Fingerprint::SymlinkTarget(target) => write!(f, "-> {}", target.display()),
            Fingerprint::Unreadable => f.write_str("unreadable"),
        }
    }
}

/// Fingerprint `rel_path` inside `tree`.
///
/// `tree` is the directory holding the `etc` subtree, either the live root
/// or a repository working tree. Absolute symlink targets are interpreted
/// relative to `root_dir`, the live root.
pub fn fingerprint(tree: &Path, root_dir: &Path, rel_path: &Path) -> (Fingerprint, Option<Diagnostic>) {
    let path = tree.join(rel_path);
    let metadata = match fs::symlink_metadata(&path) {
        Ok(metadata) => metadata,
        Err(_) => return (Fingerprint::Unreadable, None),
    };

    if metadata.file_type().is_symlink() {
        return symlink_fingerprint(tree, root_dir, rel_path);
    }

    match hash_file(&path) {
        Ok(hash) => (Fingerprint::Hash(hash), None),
        Err(_) => (Fingerprint::Unreadable, None),
    }
}

pub fn hash_file(path: &Path) -> io::Result<blake3::Hash> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Hasher::new();
    let mut buffer = [0; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

fn symlink_fingerprint(
    tree: &Path,
    root_dir: &Path,
    rel_path: &Path,
) -> (Fingerprint, Option<Diagnostic>) {
    let target = match fs::read_link(tree.join(rel_path)) {
        Ok(target) => target,
        Err(_) => return (Fingerprint::Unreadable, None),
    };

    let normalized = if target.is_absolute() {
        target
            .strip_prefix(root_dir)
            .ok()
            .and_then(normalize)
    } else {
        let base = rel_path.parent().unwrap_or_else(|| Path::new(""));
        normalize(&base.join(&target))
    };

    match normalized {
        Some(relative) => (Fingerprint::SymlinkTarget(relative), None),
        None => {
            // Out of the tree: fall back to the absolute path, resolved from
            // the live root whichever tree holds the link.
            let absolute = if target.is_absolute() {
                target.clone()
            } else {
                let base = rel_path.parent().unwrap_or_else(|| Path::new(""));
                lexical_absolute(&root_dir.join(base).join(&target))
            };
            let diagnostic = Diagnostic::for_path(
                rel_path,
                format!(
                    "links to {} not prefixed with {}",
                    absolute.display(),
                    root_dir.display()
                ),
            );
            (Fingerprint::SymlinkTarget(absolute), Some(diagnostic))
        }
    }
}

/// Lexically normalize a relative path, `None` when it climbs above its base.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::Normal(part) => parts.push(part),
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Some(parts.iter().collect())
}

fn lexical_absolute(path: &Path) -> PathBuf {
    let mut result = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::ParentDir => {
                result.pop();
            }
            Component::Normal(part) => result.push(part),
            _ => {}
        }
    }
    result
}

/// Per-pass memo of the fingerprints of one tree.
///
/// A path is read at most once for the lifetime of the cache.
#[derive(Debug)]
pub struct FingerprintCache {
    tree: PathBuf,
    root_dir: PathBuf,
    entries: HashMap<PathBuf, Fingerprint>,
    diagnostics: Vec<Diagnostic>,
}

impl FingerprintCache {
    pub fn new(tree: &Path, root_dir: &Path) -> Self {
        FingerprintCache {
            tree: tree.to_path_buf(),
            root_dir: root_dir.to_path_buf(),
            entries: HashMap::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn get(&mut self, rel_path: &Path) -> Fingerprint {
        if let Some(fingerprint) = self.entries.get(rel_path) {
            return fingerprint.clone();
        }
        let (fingerprint, diagnostic) = fingerprint(&self.tree, &self.root_dir, rel_path);
        self.diagnostics.extend(diagnostic);
        self.entries.insert(rel_path.to_path_buf(), fingerprint.clone());
        fingerprint
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }
}

/// Fingerprint every path of `paths` in `tree`.
pub fn snapshot<'a, I>(tree: &Path, root_dir: &Path, paths: I) -> (Snapshot, Vec<Diagnostic>)
where
    I: IntoIterator<Item = &'a PathBuf>,
{
    let mut cache = FingerprintCache::new(tree, root_dir);
    let snapshot = paths
        .into_iter()
        .map(|path| (path.clone(), cache.get(path)))
        .collect();
    (snapshot, cache.take_diagnostics())
}
