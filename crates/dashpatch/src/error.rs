use std::path::{Path, PathBuf};

use crate::dashboard::PanelId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed dashboard {}: {reason}", .path.display())]
    MalformedDocument { path: PathBuf, reason: String },

    #[error("panel {id} not found")]
    PanelNotFound { id: PanelId },

    #[error("invalid key path '{path}'{}: {reason}", panel_suffix(.panel))]
    InvalidKeyPath {
        panel: Option<PanelId>,
        path: String,
        reason: String,
    },

    #[error("failed to write {}: {reason}", .path.display())]
    WriteFailure { path: PathBuf, reason: String },

    #[error("malformed patch {source_name}: {reason}")]
    MalformedPatch { source_name: String, reason: String },

    #[error(
        "rewrite of '{path}'{} with pattern '{pattern}' is not idempotent",
        panel_suffix(.panel)
    )]
    NonIdempotentRewrite {
        panel: Option<PanelId>,
        path: String,
        pattern: String,
    },

    #[error("patch '{patch}' is not idempotent: a second application changes '{path}'")]
    NonIdempotentPatch { patch: String, path: String },

    #[error("config error in {}: {reason}", .path.display())]
    Config { path: PathBuf, reason: String },

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

fn panel_suffix(panel: &Option<PanelId>) -> String {
    match panel {
        Some(id) => format!(" in panel {id}"),
        None => " in dashboard".to_string(),
    }
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Other(msg.into())
    }

    pub fn malformed_document(path: &Path, reason: impl Into<String>) -> Self {
        Self::MalformedDocument {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn malformed_patch(source_name: &str, reason: impl Into<String>) -> Self {
        Self::MalformedPatch {
            source_name: source_name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_path(path: &str, reason: impl Into<String>) -> Self {
        Self::InvalidKeyPath {
            panel: None,
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    pub fn write_failure(path: &Path, reason: impl Into<String>) -> Self {
        Self::WriteFailure {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Attach a panel id to path-level errors raised below the panel lookup.
    pub fn in_panel(self, id: PanelId) -> Self {
        match self {
            Self::InvalidKeyPath {
                panel: None,
                path,
                reason,
            } => Self::InvalidKeyPath {
                panel: Some(id),
                path,
                reason,
            },
            Self::NonIdempotentRewrite {
                panel: None,
                path,
                pattern,
            } => Self::NonIdempotentRewrite {
                panel: Some(id),
                path,
                pattern,
            },
            other => other,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedDocument { .. } => "MalformedDocument",
            Self::PanelNotFound { .. } => "PanelNotFound",
            Self::InvalidKeyPath { .. } => "InvalidKeyPath",
            Self::WriteFailure { .. } => "WriteFailure",
            Self::MalformedPatch { .. } => "MalformedPatch",
            Self::NonIdempotentRewrite { .. } => "NonIdempotentRewrite",
            Self::NonIdempotentPatch { .. } => "NonIdempotentPatch",
            Self::Config { .. } => "Config",
            Self::Io { .. } => "Io",
            Self::Other(_) => "Other",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Self::MalformedDocument { .. } => 2,
            Self::PanelNotFound { .. } => 3,
            Self::InvalidKeyPath { .. } => 4,
            Self::WriteFailure { .. } => 5,
            Self::MalformedPatch { .. } => 6,
            Self::NonIdempotentRewrite { .. } | Self::NonIdempotentPatch { .. } => 7,
            Self::Config { .. } | Self::Io { .. } | Self::Other(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
