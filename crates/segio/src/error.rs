use reqwest::StatusCode;

use crate::types::{DownloadError, DownloadErrorCode};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Internal failure type of the engine.
///
/// `Cancelled` is a control signal, not a failure: it is raised when a task
/// unwinds because pause/cancel/close requested it, and it never reaches the
/// public error contract. The call that initiated the cancellation owns the
/// resulting status transition.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("download cancelled")]
    Cancelled,

    #[error("no usable media playlist: {reason}")]
    NoMediaList { reason: String },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("invalid header `{name}`")]
    InvalidHeader { name: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl EngineError {
    pub fn no_media_list(reason: impl Into<String>) -> Self {
        Self::NoMediaList {
            reason: reason.into(),
        }
    }

    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Maps onto the public error contract carried by `Failed` states.
    pub fn to_download_error(&self) -> DownloadError {
        let code = match self {
            Self::NoMediaList { .. } => DownloadErrorCode::NoMediaList,
            _ => DownloadErrorCode::UnexpectedError,
        };
        DownloadError {
            code,
            technical_message: Some(self.to_string()),
        }
    }
}
