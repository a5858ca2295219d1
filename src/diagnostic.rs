use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// A soft warning raised during a pass. Processing continues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        let diagnostic = Diagnostic {
            path: None,
            message: message.into(),
        };
        tracing::warn!("{}", diagnostic.message);
        diagnostic
    }

    pub fn for_path(path: &Path, message: impl Into<String>) -> Self {
        let diagnostic = Diagnostic {
            path: Some(path.to_path_buf()),
            message: message.into(),
        };
        tracing::warn!(path = %path.display(), "{}", diagnostic.message);
        diagnostic
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}: {}", path.display(), self.message),
            None => f.write_str(&self.message),
        }
    }
}
