//! Evidence pack directory persistence.
//!
//! # Directory layout
//!
//! ```text
//! <dir>/
//!   manifest.json
//!   signature.json          (signed packs only)
//!   input_bundle.json
//!   result_bundle.json
//!   snapshot.json
//!   reports/...             (provider artifacts, any depth)
//! ```
//!
//! # Write-once, all-or-nothing
//!
//! [`write_pack_dir`] writes every file into a hidden staging directory next
//! to the target, then renames the staging directory onto the target path.
//! Readers see either no directory or the complete pack. An existing target
//! is never overwritten. On any failure the staging directory is removed.
//!
//! # Fail-closed reads
//!
//! - Missing `manifest.json` → error
//! - Declared file missing → error
//! - Undeclared file present → error
//! - Content hash mismatch → error
//! - Non-canonical manifest → error

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::SigningKey;
use crate::error::PackError;
use crate::evidence::{
    validate_artifact_path, verify_pack, EvidencePack, PackManifest, MANIFEST_PATH, SIGNATURE_PATH,
};

const STAGING_PREFIX: &str = ".staging_";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PackDirError {
    #[error("I/O error: {detail}")]
    Io { detail: String },
    /// Evidence packs are write-once.
    #[error("pack directory {path} already exists")]
    AlreadyExists { path: String },
    #[error("missing manifest.json")]
    MissingManifest,
    #[error("unsupported entry {path}")]
    UnsupportedEntry { path: String },
    #[error(transparent)]
    Pack(#[from] PackError),
}

fn io(context: &str, path: &Path, e: &std::io::Error) -> PackDirError {
    PackDirError::Io {
        detail: format!("{context} {}: {e}", path.display()),
    }
}

/// Persist `pack` at `dir` in one rename.
///
/// # Errors
///
/// [`PackDirError::AlreadyExists`] if `dir` exists, [`PackDirError::Pack`]
/// if an artifact path is unsafe, [`PackDirError::Io`] otherwise.
pub fn write_pack_dir(pack: &EvidencePack, dir: &Path) -> Result<(), PackDirError> {
    for path in pack.files.keys() {
        validate_artifact_path(path)?;
    }
    if dir.exists() {
        return Err(PackDirError::AlreadyExists {
            path: dir.display().to_string(),
        });
    }
    let parent = match dir.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = dir
        .file_name()
        .ok_or_else(|| PackDirError::Io {
            detail: format!("no file name in {}", dir.display()),
        })?
        .to_string_lossy();
    std::fs::create_dir_all(&parent).map_err(|e| io("create_dir_all", &parent, &e))?;

    let staging = parent.join(format!("{STAGING_PREFIX}{name}_{}", uuid::Uuid::new_v4()));
    let result = stage(pack, &staging).and_then(|()| {
        std::fs::rename(&staging, dir).map_err(|e| PackDirError::Io {
            detail: format!("rename {} → {}: {e}", staging.display(), dir.display()),
        })
    });
    if result.is_err() {
        let _ = std::fs::remove_dir_all(&staging);
    }
    result
}

fn stage(pack: &EvidencePack, staging: &Path) -> Result<(), PackDirError> {
    std::fs::create_dir(staging).map_err(|e| io("create_dir", staging, &e))?;
    for (relative, bytes) in pack.all_files() {
        let path = relative
            .split('/')
            .fold(staging.to_path_buf(), |acc, part| acc.join(part));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io("create_dir_all", parent, &e))?;
        }
        std::fs::write(&path, bytes).map_err(|e| io("write", &path, &e))?;
    }
    Ok(())
}

/// Load the pack stored at `dir` and check it against its manifest.
///
/// # Errors
///
/// Any [`PackDirError`]; see the module docs for the fail-closed rules.
pub fn read_pack_dir(dir: &Path) -> Result<EvidencePack, PackDirError> {
    let mut manifest_bytes = None;
    let mut signature_bytes = None;
    let mut files = BTreeMap::new();
    for relative in list_files(dir)? {
        let path = dir.join(&relative);
        let bytes = std::fs::read(&path).map_err(|e| io("read", &path, &e))?;
        match relative.as_str() {
            MANIFEST_PATH => manifest_bytes = Some(bytes),
            SIGNATURE_PATH => signature_bytes = Some(bytes),
            _ => {
                files.insert(relative, bytes);
            }
        }
    }
    let pack = EvidencePack {
        manifest_bytes: manifest_bytes.ok_or(PackDirError::MissingManifest)?,
        signature_bytes,
        files,
    };
    verify_pack(&pack, None)?;
    Ok(pack)
}

/// [`read_pack_dir`] plus signature verification with `key`.
///
/// # Errors
///
/// Any [`PackDirError`].
pub fn verify_pack_dir(dir: &Path, key: Option<&SigningKey>) -> Result<PackManifest, PackDirError> {
    let pack = read_pack_dir(dir)?;
    Ok(verify_pack(&pack, key)?)
}

/// Every regular file under `dir`, as `/`-separated relative paths.
fn list_files(dir: &Path) -> Result<Vec<String>, PackDirError> {
    let mut files = Vec::new();
    let mut pending = vec![(dir.to_path_buf(), String::new())];
    while let Some((path, prefix)) = pending.pop() {
        let entries = std::fs::read_dir(&path).map_err(|e| io("read_dir", &path, &e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io("dir entry in", &path, &e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| io("file_type", &entry.path(), &e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                return Err(PackDirError::UnsupportedEntry {
                    path: entry.path().display().to_string(),
                });
            };
            let relative = if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}/{name}")
            };
            if file_type.is_dir() {
                pending.push((entry.path(), relative));
            } else if file_type.is_file() {
                files.push(relative);
            } else {
                return Err(PackDirError::UnsupportedEntry { path: relative });
            }
        }
    }
    files.sort();
    Ok(files)
}
