//! Error types for the reconciliation engine.
//!
//! Conflicts are not errors: a pass that stops on a cherry-pick conflict
//! returns a [`PassOutcome`](crate::workspace::PassOutcome). The variants
//! below are the conditions that abort a pass.

use std::path::PathBuf;

/// Result type for etcdrift library operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run git: {0}")]
    GitSpawn(#[source] std::io::Error),

    #[error("'git {command}' failed:\n{output}")]
    Git { command: String, output: String },

    #[error("no git repository at {}", path.display())]
    NoRepository { path: PathBuf },

    #[error("{} is not empty", path.display())]
    RepositoryExists { path: PathBuf },

    #[error(
        "this is not an etcdrift repository\nfound as the first commit message:\n'{found}'\ninstead of the expected '{expected}' message"
    )]
    NotOurRepository { found: String, expected: String },

    #[error("the {} repository is not clean:\n{}", path.display(), dirty.join("\n"))]
    NotClean { path: PathBuf, dirty: Vec<String> },

    #[error("the previous cherry-pick is empty, please use '{remedy}'")]
    EmptyCherryPick { remedy: String },

    #[error("cannot find a pending merge in the '{branch}' branch")]
    NoPendingMerge { branch: String },

    #[error("found {count} merge commits in the '{branch}' branch, expected exactly one")]
    AmbiguousMerge { branch: String, count: usize },

    #[error("cherry-pick of {commit} failed without any conflict:\n{output}")]
    CherryPickFailed { commit: String, output: String },

    #[error("cannot read archive {}: {message}", path.display())]
    Archive { path: PathBuf, message: String },

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("extraction worker pool failed: {0}")]
    WorkerPool(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
