//! Model Store: resolves, verifies, downloads, and extracts the on-disk ASR
//! and VAD model assets shared by every engine instance.
//!
//! Layout under `<data>/models/`:
//! - `zipformer/` — streaming engine: `encoder*`, `decoder*`, `joiner*`
//!   prefixes plus `tokens.txt`. Quantized (`.int8.onnx`) and full (`.onnx`)
//!   variants may coexist; either satisfies the prefix requirement.
//! - `sensevoice/` — segmented engine: `model.onnx` or `model.int8.onnx` plus
//!   `tokens.txt`.
//! - `vad/silero_vad.onnx` — shared by both engine variants.
//!
//! Writes (download/extract/delete) are serialized per asset; `status` reads
//! are always safe to run concurrently with anything.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{NextalkError, Result};
use crate::ipc::ModelStatus;

/// Which on-disk asset a Model Store operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelAsset {
    Streaming,
    Segmented,
    Vad,
}

impl ModelAsset {
    fn slot(self) -> usize {
        match self {
            ModelAsset::Streaming => 0,
            ModelAsset::Segmented => 1,
            ModelAsset::Vad => 2,
        }
    }
}

/// Resolves `$XDG_DATA_HOME/nextalk`, falling back to
/// `$HOME/.local/share/nextalk`.
pub fn data_dir() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("nextalk")
}

/// Static description of an asset's expected directory contents.
struct Manifest {
    dir: PathBuf,
    /// Required filename prefixes — at least one file starting with each
    /// prefix must exist. Empty for single-file assets (use `single_file`).
    required_prefixes: &'static [&'static str],
    /// For single-file assets (VAD), the exact expected filename.
    single_file: Option<&'static str>,
    /// Whether `tokens.txt` is also required in `dir`.
    requires_tokens: bool,
}

fn manifest(asset: ModelAsset) -> Manifest {
    let models_dir = data_dir().join("models");
    match asset {
        ModelAsset::Streaming => Manifest {
            dir: models_dir.join("zipformer"),
            required_prefixes: &["encoder", "decoder", "joiner"],
            single_file: None,
            requires_tokens: true,
        },
        ModelAsset::Segmented => Manifest {
            dir: models_dir.join("sensevoice"),
            required_prefixes: &["model"],
            single_file: None,
            requires_tokens: true,
        },
        ModelAsset::Vad => Manifest {
            dir: models_dir.join("vad"),
            required_prefixes: &[],
            single_file: Some("silero_vad.onnx"),
            requires_tokens: false,
        },
    }
}

/// Per-asset write locks. `status()`/`verify()` never take these.
static WRITE_LOCKS: [Mutex<()>; 3] = [Mutex::new(()), Mutex::new(()), Mutex::new(())];

fn prefix_present(dir: &Path, prefix: &str) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    entries.filter_map(|e| e.ok()).any(|e| {
        e.file_name()
            .to_str()
            .map(|n| n.starts_with(prefix) && n.ends_with(".onnx"))
            .unwrap_or(false)
    })
}

/// Readiness of an on-disk asset, per the manifest's required-file rule.
pub fn status(asset: ModelAsset) -> ModelStatus {
    let m = manifest(asset);
    if !m.dir.is_dir() {
        return ModelStatus::NotFound;
    }

    if let Some(file) = m.single_file {
        if !m.dir.join(file).is_file() {
            return ModelStatus::NotFound;
        }
    } else {
        let all_present = m.required_prefixes.iter().all(|p| prefix_present(&m.dir, p));
        if !all_present {
            // Any file at all present, but not the full set, counts as incomplete.
            let any_present = m.required_prefixes.iter().any(|p| prefix_present(&m.dir, p));
            return if any_present {
                ModelStatus::Incomplete
            } else {
                ModelStatus::NotFound
            };
        }
    }

    if m.requires_tokens && !m.dir.join("tokens.txt").is_file() {
        return ModelStatus::Incomplete;
    }

    ModelStatus::Ready
}

/// Recompute and compare a SHA-256 checksum against a recorded expectation.
///
/// Only meaningful for single-file assets (VAD). Multi-file assets have no
/// single recorded checksum and always report `Ready`/`Incomplete` from
/// `status()` alone.
pub fn verify(asset: ModelAsset, expected_sha256: Option<&str>) -> Result<ModelStatus> {
    let st = status(asset);
    if st != ModelStatus::Ready {
        return Ok(st);
    }
    let Some(expected) = expected_sha256 else {
        return Ok(ModelStatus::Ready);
    };
    let m = manifest(asset);
    let Some(file) = m.single_file else {
        return Ok(ModelStatus::Ready);
    };
    let path = m.dir.join(file);
    let digest = sha256_file(&path)?;
    if digest.eq_ignore_ascii_case(expected) {
        Ok(ModelStatus::Ready)
    } else {
        warn!(asset = ?asset, path = ?path, "checksum mismatch");
        Ok(ModelStatus::Corrupted)
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Progress reported every 256 KB during `download`.
#[derive(Debug, Clone, Copy)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: u64,
}

const PROGRESS_INTERVAL: u64 = 256 * 1024;

/// Download a single file into an asset's directory, resuming from a `.part`
/// sibling when the server advertises range support.
///
/// `on_progress` is invoked roughly every 256 KB of transferred bytes.
pub fn download(
    asset: ModelAsset,
    url: &str,
    filename: &str,
    mut on_progress: impl FnMut(DownloadProgress),
) -> Result<()> {
    let _guard = WRITE_LOCKS[asset.slot()]
        .lock()
        .map_err(|_| NextalkError::Unknown("model store write lock poisoned".into()))?;

    let m = manifest(asset);
    fs::create_dir_all(&m.dir)?;
    let final_path = m.dir.join(filename);
    let part_path = m.dir.join(format!("{filename}.part"));

    let existing = part_path.metadata().map(|meta| meta.len()).unwrap_or(0);

    let client = reqwest::blocking::Client::new();
    let mut request = client.get(url);
    if existing > 0 {
        request = request.header(reqwest::header::RANGE, format!("bytes={existing}-"));
    }

    let mut response = request
        .send()
        .map_err(|e| NextalkError::Unknown(format!("download request failed: {e}")))?;

    let resumed = existing > 0 && response.status() == reqwest::StatusCode::PARTIAL_CONTENT;
    let content_length = response.content_length().unwrap_or(0);
    let total = if resumed {
        existing + content_length
    } else {
        content_length
    };

    let mut file = if resumed {
        fs::OpenOptions::new().append(true).open(&part_path)?
    } else {
        fs::File::create(&part_path)?
    };

    let mut downloaded = if resumed { existing } else { 0 };
    let mut since_last_progress = 0u64;
    let mut buf = [0u8; 64 * 1024];

    info!(asset = ?asset, url, resumed, total, "model download starting");

    loop {
        let n = response
            .read(&mut buf)
            .map_err(|e| NextalkError::Unknown(format!("download read failed: {e}")))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        downloaded += n as u64;
        since_last_progress += n as u64;
        if since_last_progress >= PROGRESS_INTERVAL {
            since_last_progress = 0;
            on_progress(DownloadProgress { downloaded, total });
        }
    }
    on_progress(DownloadProgress { downloaded, total });

    file.flush()?;
    drop(file);
    fs::rename(&part_path, &final_path)?;
    info!(asset = ?asset, path = ?final_path, "model download complete");
    Ok(())
}

/// Streaming extraction of a `.tar.gz` or `.tar.bz2` archive into an asset's
/// directory. On failure, the partial output directory is removed.
pub fn extract(asset: ModelAsset, archive_path: &Path) -> Result<()> {
    let _guard = WRITE_LOCKS[asset.slot()]
        .lock()
        .map_err(|_| NextalkError::Unknown("model store write lock poisoned".into()))?;

    let m = manifest(asset);
    fs::create_dir_all(&m.dir)?;

    let result = (|| -> Result<()> {
        let file = fs::File::open(archive_path)?;
        let is_bzip2 = archive_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("bz2"))
            .unwrap_or(false);

        if is_bzip2 {
            let decoder = bzip2::read::BzDecoder::new(file);
            let mut archive = tar::Archive::new(decoder);
            archive.unpack(&m.dir)?;
        } else {
            let decoder = flate2::read::GzDecoder::new(file);
            let mut archive = tar::Archive::new(decoder);
            archive.unpack(&m.dir)?;
        }
        Ok(())
    })();

    if let Err(ref e) = result {
        warn!(asset = ?asset, error = %e, "extraction failed, removing partial output");
        let _ = fs::remove_dir_all(&m.dir);
    } else {
        info!(asset = ?asset, dir = ?m.dir, "extraction complete");
    }

    if matches!(status(asset), ModelStatus::NotFound | ModelStatus::Incomplete) && result.is_ok()
    {
        return Err(NextalkError::ModelIncomplete {
            missing: m.required_prefixes.iter().map(|s| s.to_string()).collect(),
        });
    }

    result
}

/// Delete an asset's entire on-disk directory.
pub fn delete(asset: ModelAsset) -> Result<()> {
    let _guard = WRITE_LOCKS[asset.slot()]
        .lock()
        .map_err(|_| NextalkError::Unknown("model store write lock poisoned".into()))?;
    let m = manifest(asset);
    if m.dir.is_dir() {
        fs::remove_dir_all(&m.dir)?;
    }
    Ok(())
}

/// Directory an asset lives in, for surfacing an "open folder" desktop hook.
pub fn open_directory(asset: ModelAsset) -> PathBuf {
    manifest(asset).dir
}
