//! Incremental scan of the package caches.
//!
//! Each package name has a cursor, the modification time of the last
//! archive whose `etc/` files were extracted into the vendor lineage. A scan
//! only considers archives newer than their cursor.

use flate2::read::GzDecoder;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;
use tar::{Archive, EntryType};
use tracing::debug;
use walkdir::WalkDir;
use xz2::read::XzDecoder;

use crate::diagnostic::Diagnostic;
use crate::error::{Error, Result};
use crate::live::ROOT_SUBDIR;

/// Directory of the cursor lineage holding one file per package name.
pub const CURSORS_DIR: &str = "cursors";

pub const ARCHIVE_EXTENSIONS: [&str; 4] = [".pkg.tar", ".pkg.tar.xz", ".pkg.tar.zst", ".pkg.tar.gz"];

/// Package name to archive modification time, in nanoseconds since the
/// Unix epoch.
pub type Cursors = BTreeMap<String, u64>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFile {
    pub path: PathBuf,
    pub name: String,
    /// `version-release`
    pub version: String,
    pub mtime: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRecord {
    pub archive: ArchiveFile,
    /// Extracted paths, relative to the tree base.
    pub members: Vec<PathBuf>,
}

impl PackageRecord {
    pub fn name(&self) -> &str {
        &self.archive.name
    }
}

enum Compression {
    None,
    Zstd,
    Xz,
    Gzip,
}

fn detect_compression(file_name: &str) -> Option<Compression> {
    if file_name.ends_with(".pkg.tar.zst") {
        Some(Compression::Zstd)
    } else if file_name.ends_with(".pkg.tar.xz") {
        Some(Compression::Xz)
    } else if file_name.ends_with(".pkg.tar.gz") {
        Some(Compression::Gzip)
    } else if file_name.ends_with(".pkg.tar") {
        Some(Compression::None)
    } else {
        None
    }
}

/// Split an archive file name into the package name and its
/// `version-release`.
///
/// `None` when the name has no known archive extension or is not of the
/// form `name-version-release-arch`.
pub fn parse_archive_name(file_name: &str) -> Option<(String, String)> {
    let stem = ARCHIVE_EXTENSIONS
        .iter()
        .filter_map(|ext| file_name.strip_suffix(ext))
        .min_by_key(|stem| stem.len())?;

    let parts: Vec<&str> = stem.rsplitn(4, '-').collect();
    if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    let (release, version, name) = (parts[1], parts[2], parts[3]);
    Some((name.to_string(), format!("{}-{}", version, release)))
}

fn mtime_nanos(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    u64::try_from(since_epoch.as_nanos()).ok()
}

fn is_archive(path: &Path) -> bool {
    path.file_name()
        .map(|name| detect_compression(&name.to_string_lossy()).is_some())
        .unwrap_or(false)
}

/// Archives of the cache directories (top level only) and of the AUR
/// directory (recursively).
fn archive_paths(cache_dirs: &[PathBuf], aur_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut roots: Vec<(&Path, usize)> = cache_dirs.iter().map(|d| (d.as_path(), 1)).collect();
    if let Some(aur_dir) = aur_dir {
        roots.push((aur_dir, usize::MAX));
    }

    let mut paths = Vec::new();
    for (root, max_depth) in roots {
        if !root.is_dir() {
            debug!("skipping missing package directory {}", root.display());
            continue;
        }
        for entry in WalkDir::new(root)
            .max_depth(max_depth)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_dir() && is_archive(entry.path()) {
                paths.push(entry.into_path());
            }
        }
    }
    paths.sort();
    paths
}

/// Select the archives to extract, at most one per package name.
///
/// An archive is selected when its modification time is newer than the
/// package cursor and than the other archives of the same package. On
/// equal modification times the highest `version-release` wins.
pub fn discover(
    cache_dirs: &[PathBuf],
    aur_dir: Option<&Path>,
    exclude_pkgs: &[String],
    cursors: &Cursors,
) -> (Vec<ArchiveFile>, Vec<Diagnostic>) {
    let mut diagnostics = Vec::new();
    let mut selected: BTreeMap<String, ArchiveFile> = BTreeMap::new();

    for path in archive_paths(cache_dirs, aur_dir) {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some((name, version)) = parse_archive_name(&file_name) else {
            diagnostics.push(Diagnostic::for_path(&path, "not a valid package archive name"));
            continue;
        };
        if exclude_pkgs.iter().any(|p| !p.is_empty() && name.starts_with(p.as_str())) {
            continue;
        }
        let Some(mtime) = mtime_nanos(&path) else {
            diagnostics.push(Diagnostic::for_path(&path, "cannot read the modification time"));
            continue;
        };
        if cursors.get(&name).is_some_and(|cursor| mtime <= *cursor) {
            continue;
        }

        let archive = ArchiveFile {
            path,
            name: name.clone(),
            version,
            mtime,
        };
        let newer = match selected.get(&name) {
            Some(current) => {
                archive.mtime > current.mtime
                    || (archive.mtime == current.mtime && archive.version > current.version)
            }
            None => true,
        };
        if newer {
            selected.insert(name, archive);
        }
    }

    (selected.into_values().collect(), diagnostics)
}

/// Read the cursors from the checked out cursor lineage.
///
/// A cursor that cannot be parsed is reported and ignored, so that its
/// package is scanned again.
pub fn read_cursors(repo_dir: &Path) -> (Cursors, Vec<Diagnostic>) {
    let mut cursors = Cursors::new();
    let mut diagnostics = Vec::new();
    let dir = repo_dir.join(CURSORS_DIR);

    let Ok(entries) = fs::read_dir(&dir) else {
        return (cursors, diagnostics);
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel_path = Path::new(CURSORS_DIR).join(&name);
        match fs::read_to_string(entry.path()).map(|s| s.trim().parse::<u64>()) {
            Ok(Ok(cursor)) => {
                cursors.insert(name, cursor);
            }
            _ => diagnostics.push(Diagnostic::for_path(&rel_path, "invalid package cursor, ignored")),
        }
    }
    (cursors, diagnostics)
}

/// The cursor files for `records`, as file name to content.
pub fn cursor_files(records: &[PackageRecord]) -> BTreeMap<String, String> {
    records
        .iter()
        .map(|record| {
            (
                format!("{}/{}", CURSORS_DIR, record.name()),
                format!("{}\n", record.archive.mtime),
            )
        })
        .collect()
}

fn open_archive(path: &Path) -> Result<Archive<Box<dyn Read>>> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let compression = detect_compression(&file_name).ok_or_else(|| Error::Archive {
        path: path.to_path_buf(),
        message: "unknown compression".to_string(),
    })?;
    let file = File::open(path).map_err(|e| Error::io(path, e))?;

    let reader: Box<dyn Read> = match compression {
        Compression::None => Box::new(file),
        Compression::Zstd => {
            let decoder = zstd::Decoder::new(file).map_err(|e| Error::Archive {
                path: path.to_path_buf(),
                message: format!("failed to create zstd decoder: {}", e),
            })?;
            Box::new(decoder)
        }
        Compression::Xz => Box::new(XzDecoder::new(file)),
        Compression::Gzip => Box::new(GzDecoder::new(file)),
    };

    Ok(Archive::new(reader))
}

/// Path of a tar member relative to the archive root.
fn member_path(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// True when `rel_path` is a file of the `etc/` subtree not excluded.
fn is_extracted(rel_path: &Path, exclude_files: &[String]) -> bool {
    if rel_path.components().any(|c| matches!(c, Component::ParentDir)) {
        return false;
    }
    match rel_path.strip_prefix(ROOT_SUBDIR) {
        Ok(in_subdir) if !in_subdir.as_os_str().is_empty() => {
            let name = in_subdir.to_string_lossy();
            !exclude_files.iter().any(|f| *f == name)
        }
        _ => false,
    }
}

/// Path `archive` writes `target` to before renaming it in place.
///
/// Two archives shipping the same file never write the same partial file,
/// the rename replaces the target atomically.
fn partial_path(target: &Path, archive: &ArchiveFile) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(target.file_name().unwrap_or_default());
    name.push(format!(".{}.part", archive.name));
    target.with_file_name(name)
}

/// Create the parent of `partial` and remove a partial file left behind.
fn prepare_partial(partial: &Path, dir_lock: &Mutex<()>) -> Result<()> {
    if let Some(parent) = partial.parent() {
        let _guard = dir_lock
            .lock()
            .map_err(|e| Error::WorkerPool(e.to_string()))?;
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    match fs::remove_file(partial) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(Error::io(partial, e)),
        _ => Ok(()),
    }
}

fn rename_partial(partial: &Path, target: &Path) -> Result<()> {
    fs::rename(partial, target).map_err(|e| Error::io(target, e))
}

/// Extract the `etc/` members of `archive` into `dest`.
///
/// Hard links are written as copies of their target. A target that is not
/// extracted itself is read in a second pass over the archive.
fn extract_archive(
    archive: &ArchiveFile,
    dest: &Path,
    exclude_files: &[String],
    dir_lock: &Mutex<()>,
) -> Result<Vec<PathBuf>> {
    let archive_error = |message: String| Error::Archive {
        path: archive.path.clone(),
        message,
    };
    debug!("extracting {}", archive.path.display());

    let mut tar = open_archive(&archive.path)?;
    let mut members = BTreeSet::new();
    // Hard link member to its target member.
    let mut pending_links: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();

    for entry in tar.entries().map_err(|e| archive_error(e.to_string()))? {
        let mut entry = entry.map_err(|e| archive_error(e.to_string()))?;
        let entry_type = entry.header().entry_type();
        if !matches!(
            entry_type,
            EntryType::Regular | EntryType::Symlink | EntryType::Link
        ) {
            continue;
        }

        let rel_path = member_path(&entry.path().map_err(|e| archive_error(e.to_string()))?);
        if !is_extracted(&rel_path, exclude_files) {
            continue;
        }

        let target = dest.join(&rel_path);
        let partial = partial_path(&target, archive);
        prepare_partial(&partial, dir_lock)?;

        if entry_type == EntryType::Link {
            let link_name = entry
                .link_name()
                .map_err(|e| archive_error(e.to_string()))?
                .map(|name| member_path(&name))
                .ok_or_else(|| {
                    archive_error(format!("{}: hard link without target", rel_path.display()))
                })?;
            if members.contains(&link_name) {
                let source = dest.join(&link_name);
                fs::copy(&source, &partial).map_err(|e| Error::io(&partial, e))?;
                rename_partial(&partial, &target)?;
            } else {
                pending_links.insert(rel_path.clone(), link_name);
            }
        } else {
            entry
                .unpack(&partial)
                .map_err(|e| archive_error(format!("{}: {}", rel_path.display(), e)))?;
            rename_partial(&partial, &target)?;
        }
        members.insert(rel_path);
    }

    if !pending_links.is_empty() {
        copy_link_targets(archive, dest, &pending_links)?;
    }

    Ok(members.into_iter().collect())
}

/// Write the content of the targets of `links` (link to target) read from
/// `archive`.
fn copy_link_targets(archive: &ArchiveFile, dest: &Path, links: &BTreeMap<PathBuf, PathBuf>) -> Result<()> {
    let archive_error = |message: String| Error::Archive {
        path: archive.path.clone(),
        message,
    };

    let mut by_target: BTreeMap<&Path, Vec<&Path>> = BTreeMap::new();
    for (link, target) in links {
        by_target.entry(target.as_path()).or_default().push(link.as_path());
    }

    let mut tar = open_archive(&archive.path)?;
    for entry in tar.entries().map_err(|e| archive_error(e.to_string()))? {
        let mut entry = entry.map_err(|e| archive_error(e.to_string()))?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let rel_path = member_path(&entry.path().map_err(|e| archive_error(e.to_string()))?);
        let Some(targets) = by_target.remove(rel_path.as_path()) else {
            continue;
        };

        let mode = entry.header().mode().map_err(|e| archive_error(e.to_string()))?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| archive_error(format!("{}: {}", rel_path.display(), e)))?;
        for link in targets {
            let target = dest.join(link);
            let partial = partial_path(&target, archive);
            fs::write(&partial, &data).map_err(|e| Error::io(&partial, e))?;
            fs::set_permissions(&partial, fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| Error::io(&partial, e))?;
            rename_partial(&partial, &target)?;
        }
        if by_target.is_empty() {
            break;
        }
    }

    match by_target.into_iter().next() {
        Some((target, links)) => Err(archive_error(format!(
            "{}: hard link to missing member {}",
            links[0].display(),
            target.display()
        ))),
        None => Ok(()),
    }
}

/// Extract the `etc/` files of `archives` into `dest` with a pool of
/// worker threads.
///
/// Any failure fails the whole extraction. The error reported is the one
/// of the first failed archive in the order of `archives`.
pub fn extract(archives: &[ArchiveFile], dest: &Path, exclude_files: &[String]) -> Result<Vec<PackageRecord>> {
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| Error::WorkerPool(e.to_string()))?;

    let dir_lock = Mutex::new(());
    let results: Vec<Result<Vec<PathBuf>>> = pool.install(|| {
        archives
            .par_iter()
            .map(|archive| extract_archive(archive, dest, exclude_files, &dir_lock))
            .collect()
    });

    archives
        .iter()
        .zip(results)
        .map(|(archive, members)| {
            Ok(PackageRecord {
                archive: archive.clone(),
                members: members?,
            })
        })
        .collect()
}
