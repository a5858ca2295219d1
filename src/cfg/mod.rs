use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::sys;

/// Package cache used when neither the configuration nor pacman.conf name one.
pub const DEFAULT_CACHE_DIR: &str = "/var/cache/pacman/pkg";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub packages: PackagesConfig,

    #[serde(default)]
    pub files: FilesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Directory holding the `etc` tree.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    #[serde(default = "default_repo_dir")]
    pub repo_dir: PathBuf,

    /// Defaults to `<root_dir>/etc/pacman.conf`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pacman_conf: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackagesConfig {
    /// Defaults to the `CacheDir` entries of pacman.conf.
    #[serde(default)]
    pub cache_dirs: Vec<PathBuf>,

    /// Scanned recursively, for packages built locally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aur_dir: Option<PathBuf>,

    /// Package name prefixes that are never scanned.
    #[serde(default)]
    pub exclude_pkgs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Paths relative to `etc/` that are never tracked.
    #[serde(default = "default_exclude_files")]
    pub exclude_files: Vec<String>,

    /// Path prefixes relative to `etc/` ignored by `diff`.
    #[serde(default = "default_exclude_prefixes")]
    pub exclude_prefixes: Vec<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            root_dir: default_root_dir(),
            repo_dir: default_repo_dir(),
            pacman_conf: None,
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        FilesConfig {
            exclude_files: default_exclude_files(),
            exclude_prefixes: default_exclude_prefixes(),
        }
    }
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("/")
}

fn default_repo_dir() -> PathBuf {
    let sudo_home = sys::detect_sudo_context().and_then(|ctx| ctx.home);
    repo_dir_for(std::env::var_os("XDG_DATA_HOME").is_some(), sudo_home.as_deref())
}

/// Under sudo the repository of the invoking user is used, unless
/// `XDG_DATA_HOME` names one explicitly.
fn repo_dir_for(xdg_data_home_set: bool, sudo_home: Option<&Path>) -> PathBuf {
    match sudo_home {
        Some(home) if !xdg_data_home_set => home.join(".local/share/etcdrift"),
        _ => dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("etcdrift"),
    }
}

fn default_exclude_files() -> Vec<String> {
    vec![
        "passwd".to_string(),
        "group".to_string(),
        "mtab".to_string(),
        "udev/hwdb.bin".to_string(),
    ]
}

fn default_exclude_prefixes() -> Vec<String> {
    vec!["ca-certificates".to_string(), "ssl/certs".to_string()]
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("etcdrift")
        .join("config.toml")
}

/// Load the configuration, a missing file meaning the defaults.
pub fn load(config_path: &Path) -> Result<Config> {
    if !config_path.exists() {
        return Ok(Config::default());
    }

    let contents = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
    let mut config: Config = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", config_path.display()))?;
    config.expand_paths();
    Ok(config)
}

fn expand(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&text).into_owned())
}

impl Config {
    fn expand_paths(&mut self) {
        self.general.root_dir = expand(&self.general.root_dir);
        self.general.repo_dir = expand(&self.general.repo_dir);
        self.general.pacman_conf = self.general.pacman_conf.as_deref().map(expand);
        self.packages.cache_dirs = self.packages.cache_dirs.iter().map(|d| expand(d)).collect();
        self.packages.aur_dir = self.packages.aur_dir.as_deref().map(expand);
    }

    pub fn pacman_conf(&self) -> PathBuf {
        self.general
            .pacman_conf
            .clone()
            .unwrap_or_else(|| self.general.root_dir.join("etc").join("pacman.conf"))
    }

    /// The package cache directories to scan.
    pub fn cache_dirs(&self) -> Vec<PathBuf> {
        if !self.packages.cache_dirs.is_empty() {
            return self.packages.cache_dirs.clone();
        }
        let from_pacman = fs::read_to_string(self.pacman_conf())
            .map(|contents| parse_cache_dirs(&contents))
            .unwrap_or_default();
        if from_pacman.is_empty() {
            vec![PathBuf::from(DEFAULT_CACHE_DIR)]
        } else {
            from_pacman
        }
    }

    /// True when `rel_path` (a path starting with `etc/`) is excluded.
    pub fn is_excluded(&self, rel_path: &Path) -> bool {
        let Ok(in_subdir) = rel_path.strip_prefix("etc") else {
            return false;
        };
        let name = in_subdir.to_string_lossy();
        self.files.exclude_files.iter().any(|f| *f == name)
    }
}

/// The `CacheDir` values of the `[options]` section of a pacman.conf.
///
/// A `CacheDir` line may hold several space separated directories.
pub fn parse_cache_dirs(contents: &str) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut in_options = false;

    for line in contents.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            in_options = line == "[options]";
            continue;
        }
        if !in_options {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "CacheDir" {
                dirs.extend(value.split_whitespace().map(PathBuf::from));
            }
        }
    }

    dirs
}
