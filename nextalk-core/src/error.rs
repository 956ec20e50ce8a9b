//! The closed error taxonomy shared by every component.
//!
//! `ErrorKind` is the exact closed set named by the data model: every
//! fallible operation in this crate ultimately reports one of these, never a
//! bespoke string. `NextalkError` is the `std::error::Error` wrapper that
//! carries an `ErrorKind` plus enough context to log or surface to the user.
//!
//! This supersedes an older, coarser `audioDeviceError`/`modelError`/
//! `socketDisconnected` set; only the refined kinds below are implemented.

use std::path::PathBuf;

use thiserror::Error;

/// Sub-kind carried by `ErrorKind::Socket`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SocketErrorKind {
    SocketNotFound,
    ConnectionFailed,
    ConnectionTimeout,
    SendFailed,
    MessageTooLarge,
    ReconnectFailed,
    SocketPermissionInsecure,
}

/// The closed error-kind set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    AudioNoDevice,
    AudioDeviceBusy,
    AudioPermissionDenied,
    AudioDeviceLost,
    AudioInitFailed,
    ModelNotFound,
    ModelIncomplete,
    ModelCorrupted,
    ModelLoadFailed,
    Socket(SocketErrorKind),
    Unknown,
}

#[derive(Debug, Error)]
pub enum NextalkError {
    #[error("no matching input device")]
    AudioNoDevice,
    #[error("input device busy: {0}")]
    AudioDeviceBusy(String),
    #[error("permission denied opening input device")]
    AudioPermissionDenied,
    #[error("input device lost mid-stream: {0}")]
    AudioDeviceLost(String),
    #[error("audio init failed: {0}")]
    AudioInitFailed(String),

    #[error("model asset not found: {0}")]
    ModelNotFound(String),
    #[error("model asset incomplete: missing {missing:?}")]
    ModelIncomplete { missing: Vec<String> },
    #[error("model asset corrupted: checksum mismatch for {0}")]
    ModelCorrupted(String),
    #[error("model failed to load: {0}")]
    ModelLoadFailed(String),

    #[error("socket error ({kind:?}): {message}")]
    Socket {
        kind: SocketErrorKind,
        message: String,
    },

    #[error("{0}")]
    Unknown(String),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl NextalkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NextalkError::AudioNoDevice => ErrorKind::AudioNoDevice,
            NextalkError::AudioDeviceBusy(_) => ErrorKind::AudioDeviceBusy,
            NextalkError::AudioPermissionDenied => ErrorKind::AudioPermissionDenied,
            NextalkError::AudioDeviceLost(_) => ErrorKind::AudioDeviceLost,
            NextalkError::AudioInitFailed(_) => ErrorKind::AudioInitFailed,
            NextalkError::ModelNotFound(_) => ErrorKind::ModelNotFound,
            NextalkError::ModelIncomplete { .. } => ErrorKind::ModelIncomplete,
            NextalkError::ModelCorrupted(_) => ErrorKind::ModelCorrupted,
            NextalkError::ModelLoadFailed(_) => ErrorKind::ModelLoadFailed,
            NextalkError::Socket { kind, .. } => ErrorKind::Socket(*kind),
            NextalkError::Unknown(_) | NextalkError::Io(_) | NextalkError::Other(_) => {
                ErrorKind::Unknown
            }
        }
    }

    pub fn model_not_found(path: impl Into<PathBuf>) -> Self {
        NextalkError::ModelNotFound(path.into().display().to_string())
    }
}

pub type Result<T> = std::result::Result<T, NextalkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_socket_subkind_through() {
        let err = NextalkError::Socket {
            kind: SocketErrorKind::MessageTooLarge,
            message: "too big".into(),
        };
        assert_eq!(
            err.kind(),
            ErrorKind::Socket(SocketErrorKind::MessageTooLarge)
        );
    }

    #[test]
    fn error_kind_serializes_camel_case() {
        let json = serde_json::to_value(ErrorKind::AudioDeviceLost).unwrap();
        assert_eq!(json, "audioDeviceLost");
        let json =
            serde_json::to_value(ErrorKind::Socket(SocketErrorKind::SocketNotFound)).unwrap();
        assert_eq!(json["socket"], "socketNotFound");
    }
}
