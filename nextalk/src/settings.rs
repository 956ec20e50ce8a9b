//! Persistent application settings: a JSON file under `<data>/nextalk/
//! settings.json`, read by the core at startup ("Settings
//! file (owned by a separate config component; the core only reads: engine
//! preference, audio device name, custom model URL override, hotkey
//! string)".
//!
//! Only the fields the core actually reads are kept here; profile
//! metadata, cloud opt-in, and history retention belong to a separate
//! config surface and have no counterpart in this crate.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use nextalk_core::ipc::EngineKind;
use nextalk_core::model;

/// Default hotkey string.
pub const DEFAULT_HOTKEY: &str = "Ctrl+Alt+V";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_engine: EngineKind,
    pub preferred_input_device: Option<String>,
    pub model_url_overrides: ModelUrlOverrides,
    pub hotkey: String,
}

/// Per-engine custom download URL overrides, consulted by the Model Store
/// instead of its built-in default when present.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ModelUrlOverrides {
    pub streaming: Option<String>,
    pub segmented: Option<String>,
    pub vad: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            preferred_engine: EngineKind::Streaming,
            preferred_input_device: None,
            model_url_overrides: ModelUrlOverrides::default(),
            hotkey: DEFAULT_HOTKEY.to_string(),
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.preferred_input_device = self
            .preferred_input_device
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        if self.hotkey.trim().is_empty() || !is_plausible_hotkey(&self.hotkey) {
            self.hotkey = DEFAULT_HOTKEY.to_string();
        }
    }
}

/// Loose sanity check against the hotkey grammar: at least
/// one `+`-separated key token, no empty segments. Full grammar validation
/// belongs to whatever binds the key with the desktop environment.
fn is_plausible_hotkey(raw: &str) -> bool {
    let raw = raw.trim();
    !raw.is_empty() && raw.split('+').all(|segment| !segment.trim().is_empty())
}

pub fn default_settings_path() -> PathBuf {
    model::data_dir().join("settings.json")
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("nextalk-settings-test-{}-{name}", std::process::id()))
    }

    #[test]
    fn defaults_use_streaming_engine_and_default_hotkey() {
        let settings = AppSettings::default();
        assert_eq!(settings.preferred_engine, EngineKind::Streaming);
        assert_eq!(settings.hotkey, DEFAULT_HOTKEY);
    }

    #[test]
    fn normalize_trims_device_name_and_drops_if_empty() {
        let mut settings = AppSettings {
            preferred_input_device: Some("  USB Microphone  ".into()),
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.preferred_input_device.as_deref(), Some("USB Microphone"));

        let mut blank = AppSettings {
            preferred_input_device: Some("   ".into()),
            ..AppSettings::default()
        };
        blank.normalize();
        assert!(blank.preferred_input_device.is_none());
    }

    #[test]
    fn normalize_falls_back_to_default_hotkey_when_malformed() {
        let mut settings = AppSettings {
            hotkey: "Ctrl++V".into(),
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.hotkey, DEFAULT_HOTKEY);
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = temp_path("roundtrip.json");
        let _ = fs::remove_file(&path);

        let mut settings = AppSettings::default();
        settings.preferred_engine = EngineKind::Segmented;
        settings.preferred_input_device = Some("Built-in Microphone".into());
        settings.model_url_overrides.vad = Some("https://example.invalid/vad.tar.gz".into());
        save_settings(&path, &settings).unwrap();

        let loaded = load_settings(&path);
        assert_eq!(loaded.preferred_engine, EngineKind::Segmented);
        assert_eq!(loaded.preferred_input_device.as_deref(), Some("Built-in Microphone"));
        assert_eq!(
            loaded.model_url_overrides.vad.as_deref(),
            Some("https://example.invalid/vad.tar.gz")
        );

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn load_falls_back_to_defaults_when_file_missing() {
        let path = temp_path("missing.json");
        let _ = fs::remove_file(&path);
        let settings = load_settings(&path);
        assert_eq!(settings.preferred_engine, EngineKind::Streaming);
    }
}
