// SPDX-License-Identifier: MIT OR Apache-2.0
//! SHA-256 manifest generation and verification for script directories (§4.3).
//!
//! The manifest (`workflows.sha256`) is a newline-delimited list of
//! `<hex-sha256>  <relative-path>` lines, sorted by path, gating script
//! loading when integrity verification is enabled.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name of the manifest inside the script directory.
pub const MANIFEST_FILE: &str = "workflows.sha256";

/// Default extension used to discover script files.
pub const DEFAULT_SCRIPT_EXTENSION: &str = "lua";

/// Errors from manifest generation/verification.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// The manifest file is missing but verification was required.
    #[error("manifest not found at {path}")]
    Missing {
        /// Path the manifest was expected at.
        path: PathBuf,
    },
    /// A listed file is missing from disk, or an on-disk file is missing
    /// from the manifest.
    #[error("script set mismatch: {detail}")]
    SetMismatch {
        /// Human-readable description of the extra/missing paths.
        detail: String,
    },
    /// A listed file's hash does not match what's on disk.
    #[error("hash mismatch for {path}")]
    HashMismatch {
        /// Relative path of the offending file.
        path: String,
    },
    /// The manifest file itself could not be parsed.
    #[error("malformed manifest line: {line}")]
    Malformed {
        /// The offending line.
        line: String,
    },
    /// An I/O error occurred reading the directory or a file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Compute the SHA-256 hex digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// List script files one level deep under `dir` with extension `ext`,
/// sorted by file name.
async fn discover_scripts(dir: &Path, ext: &str) -> Result<Vec<PathBuf>, ManifestError> {
    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) == Some(ext) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

fn relative_name(dir: &Path, path: &Path) -> String {
    path.strip_prefix(dir)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// List script files one level deep under `dir` with extension `ext`,
/// sorted by file name — the load order the loader iterates in (§4.7).
///
/// # Errors
///
/// Returns [`ManifestError::Io`] if the directory cannot be read.
pub async fn list_scripts(dir: &Path, ext: &str) -> Result<Vec<PathBuf>, ManifestError> {
    discover_scripts(dir, ext).await
}

/// Generate the canonical manifest text for the script files directly
/// inside `dir` (one level deep) with extension `ext`.
///
/// # Errors
///
/// Returns [`ManifestError::Io`] if the directory or a file cannot be read.
pub async fn generate(dir: &Path, ext: &str) -> Result<String, ManifestError> {
    let files = discover_scripts(dir, ext).await?;
    let mut lines = Vec::with_capacity(files.len());
    for path in &files {
        let bytes = tokio::fs::read(path).await?;
        let hash = sha256_hex(&bytes);
        lines.push(format!("{hash}  {}", relative_name(dir, path)));
    }
    lines.sort();
    let mut text = lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    Ok(text)
}

/// Write the manifest for `dir` via an atomic temp-file-then-rename
/// replace, so a reader never observes a partially written manifest.
///
/// # Errors
///
/// Returns [`ManifestError::Io`] on any filesystem failure.
pub async fn write(dir: &Path, ext: &str) -> Result<(), ManifestError> {
    let text = generate(dir, ext).await?;
    let final_path = dir.join(MANIFEST_FILE);
    let tmp_path = dir.join(format!("{MANIFEST_FILE}.tmp"));
    tokio::fs::write(&tmp_path, text.as_bytes()).await?;
    tokio::fs::rename(&tmp_path, &final_path).await?;
    Ok(())
}

fn parse_manifest(text: &str) -> Result<BTreeMap<String, String>, ManifestError> {
    let mut out = BTreeMap::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let (hash, path) = line.split_once("  ").ok_or_else(|| ManifestError::Malformed {
            line: line.to_string(),
        })?;
        out.insert(path.to_string(), hash.to_string());
    }
    Ok(out)
}

/// Verify that the script files in `dir` exactly match the manifest: same
/// set of relative paths, and each hash matches the file's current bytes.
///
/// # Errors
///
/// - [`ManifestError::Missing`] if `workflows.sha256` does not exist.
/// - [`ManifestError::SetMismatch`] if files are missing or extra.
/// - [`ManifestError::HashMismatch`] if a listed file's hash has changed.
/// - [`ManifestError::Malformed`] if the manifest itself can't be parsed.
pub async fn verify(dir: &Path, ext: &str) -> Result<(), ManifestError> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let manifest_text = tokio::fs::read_to_string(&manifest_path)
        .await
        .map_err(|_| ManifestError::Missing {
            path: manifest_path.clone(),
        })?;
    let expected = parse_manifest(&manifest_text)?;

    let files = discover_scripts(dir, ext).await?;
    let on_disk: BTreeMap<String, PathBuf> = files
        .into_iter()
        .map(|p| (relative_name(dir, &p), p))
        .collect();

    let expected_names: Vec<&String> = expected.keys().collect();
    let disk_names: Vec<&String> = on_disk.keys().collect();

    let extra: Vec<&str> = disk_names
        .iter()
        .filter(|n| !expected.contains_key(n.as_str()))
        .map(|n| n.as_str())
        .collect();
    let missing: Vec<&str> = expected_names
        .iter()
        .filter(|n| !on_disk.contains_key(n.as_str()))
        .map(|n| n.as_str())
        .collect();

    if !extra.is_empty() || !missing.is_empty() {
        return Err(ManifestError::SetMismatch {
            detail: format!("extra={extra:?} missing={missing:?}"),
        });
    }

    for (name, path) in &on_disk {
        let bytes = tokio::fs::read(path).await?;
        let actual = sha256_hex(&bytes);
        let declared = &expected[name];
        if &actual != declared {
            return Err(ManifestError::HashMismatch { path: name.clone() });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn generate_then_verify_round_trips() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.lua"), b"return 1").await.unwrap();
        tokio::fs::write(dir.path().join("b.lua"), b"return 2").await.unwrap();
        write(dir.path(), "lua").await.unwrap();
        assert!(verify(dir.path(), "lua").await.is_ok());
    }

    #[tokio::test]
    async fn tampering_a_byte_flips_verify_to_hash_mismatch() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.lua"), b"return 1").await.unwrap();
        write(dir.path(), "lua").await.unwrap();
        tokio::fs::write(dir.path().join("a.lua"), b"return 2").await.unwrap();
        let err = verify(dir.path(), "lua").await.unwrap_err();
        assert!(matches!(err, ManifestError::HashMismatch { .. }));
    }

    #[tokio::test]
    async fn extra_file_not_in_manifest_fails() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.lua"), b"return 1").await.unwrap();
        write(dir.path(), "lua").await.unwrap();
        tokio::fs::write(dir.path().join("b.lua"), b"return 2").await.unwrap();
        let err = verify(dir.path(), "lua").await.unwrap_err();
        assert!(matches!(err, ManifestError::SetMismatch { .. }));
    }

    #[tokio::test]
    async fn missing_file_listed_in_manifest_fails() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.lua"), b"return 1").await.unwrap();
        write(dir.path(), "lua").await.unwrap();
        tokio::fs::remove_file(dir.path().join("a.lua")).await.unwrap();
        let err = verify(dir.path(), "lua").await.unwrap_err();
        assert!(matches!(err, ManifestError::SetMismatch { .. }));
    }

    #[tokio::test]
    async fn missing_manifest_file_is_reported() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.lua"), b"return 1").await.unwrap();
        let err = verify(dir.path(), "lua").await.unwrap_err();
        assert!(matches!(err, ManifestError::Missing { .. }));
    }

    #[tokio::test]
    async fn manifest_lines_are_sorted_by_path() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("z.lua"), b"z").await.unwrap();
        tokio::fs::write(dir.path().join("a.lua"), b"a").await.unwrap();
        let text = generate(dir.path(), "lua").await.unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].ends_with("a.lua"));
        assert!(lines[1].ends_with("z.lua"));
    }
}
