//! Shared data model types, serialised across the command channel and the
//! fcitx5 bridge socket.
//!
//! TypeScript/other-language mirrors, if any exist outside this crate, are
//! kept in sync by hand; there is no codegen step here.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// A recognized span of speech.
///
/// Equality intentionally ignores `tokens`/`timestamps` — two transcripts are
/// "the same" for dedup/UI purposes when their visible text, language, and
/// emotion tag match, regardless of token-level detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub text: String,
    pub language: Option<String>,
    pub emotion: Option<String>,
    pub tokens: Option<Vec<String>>,
    pub timestamps: Option<Vec<f32>>,
}

impl Transcript {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language: None,
            emotion: None,
            tokens: None,
            timestamps: None,
        }
    }
}

impl PartialEq for Transcript {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text && self.language == other.language && self.emotion == other.emotion
    }
}

/// Which ASR engine variant is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineKind {
    Streaming,
    Segmented,
}

/// Capsule session state, mirrored to any UI surface that cares to observe it.
///
/// Tagged so each variant's payload is self-describing on the wire:
/// `{"state": "listening", "data": {"partial": "..."}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", content = "data", rename_all = "camelCase")]
pub enum CapsuleState {
    Idle,
    Listening {
        partial: Option<String>,
    },
    Processing {
        partial: Option<String>,
    },
    CopiedToClipboard,
    Error {
        kind: ErrorKind,
        message: Option<String>,
        #[serde(rename = "preservedText")]
        preserved_text: Option<String>,
        #[serde(rename = "fcitxSubkind")]
        fcitx_subkind: Option<String>,
    },
    Initializing,
    Downloading {
        progress: f32,
        bytes: u64,
        total: u64,
    },
    Extracting {
        progress: f32,
    },
}

/// Readiness of an on-disk model asset, per the Model Store's `status` rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModelStatus {
    NotFound,
    Incomplete,
    Corrupted,
    Downloading,
    Extracting,
    Ready,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_equality_ignores_tokens_and_timestamps() {
        let mut a = Transcript::new("hello world");
        a.language = Some("en".into());
        let mut b = a.clone();
        b.tokens = Some(vec!["hello".into(), "world".into()]);
        b.timestamps = Some(vec![0.0, 0.4]);
        assert_eq!(a, b);
    }

    #[test]
    fn capsule_state_serializes_tagged() {
        let state = CapsuleState::Listening {
            partial: Some("hel".into()),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "listening");
        assert_eq!(json["data"]["partial"], "hel");
    }

    #[test]
    fn capsule_state_error_round_trips() {
        let state = CapsuleState::Error {
            kind: ErrorKind::ModelNotFound,
            message: Some("missing tokens.txt".into()),
            preserved_text: Some("draft text".into()),
            fcitx_subkind: None,
        };
        let json = serde_json::to_value(&state).unwrap();
        let back: CapsuleState = serde_json::from_value(json).unwrap();
        match back {
            CapsuleState::Error { kind, preserved_text, .. } => {
                assert_eq!(kind, ErrorKind::ModelNotFound);
                assert_eq!(preserved_text.as_deref(), Some("draft text"));
            }
            _ => panic!("expected Error variant"),
        }
    }
}
