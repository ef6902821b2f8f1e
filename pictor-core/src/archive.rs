//! Installable bundle handling.
//!
//! Extensions ship as zip or gzip-tar archives discriminated by magic bytes.
//! The manifest may sit at any depth; the portion of its entry path before
//! the file name becomes the directory prefix every member is rebased past,
//! so the manifest always lands at the extension root. Reading the manifest
//! and materialising the full tree are separate steps: installation only
//! unpacks once validation has passed.

use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use serde_json::Value;
use tracing::warn;

use pictor_model::manifest::{ExtensionManifest, MANIFEST_FILE_NAME};

use crate::error::{HostError, Result};

/// Compressed forms the host accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
}

const ZIP_LOCAL: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY: &[u8] = b"PK\x05\x06";
const ZIP_SPANNED: &[u8] = b"PK\x07\x08";
const GZIP: &[u8] = b"\x1F\x8B\x08";

/// Identify the archive form from its leading magic bytes.
pub fn sniff(bytes: &[u8]) -> Option<ArchiveKind> {
    if bytes.starts_with(ZIP_LOCAL)
        || bytes.starts_with(ZIP_EMPTY)
        || bytes.starts_with(ZIP_SPANNED)
    {
        Some(ArchiveKind::Zip)
    } else if bytes.starts_with(GZIP) {
        Some(ArchiveKind::TarGz)
    } else {
        None
    }
}

/// An archive whose manifest has been located and parsed; the full tree is
/// extracted later with [`ManifestArchive::extract_all`].
pub struct ManifestArchive {
    pub manifest: ExtensionManifest,
    /// Entry-path prefix stripped from every member during extraction.
    pub directory_prefix: String,
    kind: ArchiveKind,
    bytes: Vec<u8>,
}

impl std::fmt::Debug for ManifestArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestArchive")
            .field("id", &self.manifest.id)
            .field("directory_prefix", &self.directory_prefix)
            .field("kind", &self.kind)
            .field("byte_len", &self.bytes.len())
            .finish()
    }
}

/// Locate and parse the manifest without unpacking anything else.
pub fn extract_manifest(bytes: Vec<u8>) -> Result<ManifestArchive> {
    let kind = sniff(&bytes).ok_or_else(|| {
        HostError::BadArchive("unrecognised archive signature".into())
    })?;

    let (raw, entry_path) = match kind {
        ArchiveKind::Zip => find_manifest_zip(&bytes)?,
        ArchiveKind::TarGz => find_manifest_tar(&bytes)?,
    };

    let manifest = parse_manifest(&raw)?;
    let directory_prefix = entry_path
        .strip_suffix(MANIFEST_FILE_NAME)
        .unwrap_or_default()
        .to_string();

    Ok(ManifestArchive {
        manifest,
        directory_prefix,
        kind,
        bytes,
    })
}

impl ManifestArchive {
    /// Write every member under the manifest's directory prefix into
    /// `dest`, rebased so the manifest sits at `dest` root.
    pub fn extract_all(&self, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        match self.kind {
            ArchiveKind::Zip => self.extract_zip(dest),
            ArchiveKind::TarGz => self.extract_tar(dest),
        }
    }

    fn extract_zip(&self, dest: &Path) -> Result<()> {
        let mut archive = zip::ZipArchive::new(Cursor::new(&self.bytes))
            .map_err(|err| HostError::BadArchive(err.to_string()))?;
        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|err| HostError::BadArchive(err.to_string()))?;
            if entry.is_dir() {
                continue;
            }
            let Some(rel) =
                rebase(entry.name(), &self.directory_prefix)
            else {
                continue;
            };
            let target = dest.join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::File::create(&target)?;
            std::io::copy(&mut entry, &mut file)?;
        }
        Ok(())
    }

    fn extract_tar(&self, dest: &Path) -> Result<()> {
        let decoder = GzDecoder::new(Cursor::new(&self.bytes));
        let mut archive = tar::Archive::new(decoder);
        for entry in archive
            .entries()
            .map_err(|err| HostError::BadArchive(err.to_string()))?
        {
            let mut entry = entry
                .map_err(|err| HostError::BadArchive(err.to_string()))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry
                .path()
                .map_err(|err| HostError::BadArchive(err.to_string()))?
                .to_string_lossy()
                .into_owned();
            let Some(rel) = rebase(&path, &self.directory_prefix) else {
                continue;
            };
            let target = dest.join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::File::create(&target)?;
            std::io::copy(&mut entry, &mut file)?;
        }
        Ok(())
    }
}

fn parse_manifest(raw: &[u8]) -> Result<ExtensionManifest> {
    // Two-stage parse so a syntactically broken file and a structurally
    // wrong one report the same error class with a useful message.
    let value: Value = serde_json::from_slice(raw)
        .map_err(|err| HostError::MalformedManifest(err.to_string()))?;
    serde_json::from_value(value)
        .map_err(|err| HostError::MalformedManifest(err.to_string()))
}

fn find_manifest_zip(bytes: &[u8]) -> Result<(Vec<u8>, String)> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| HostError::BadArchive(err.to_string()))?;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| HostError::BadArchive(err.to_string()))?;
        let name = entry.name().to_string();
        if entry.is_file() && is_manifest_entry(&name) {
            let mut raw = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut raw)?;
            return Ok((raw, name));
        }
    }
    Err(HostError::BadArchive(format!(
        "no {MANIFEST_FILE_NAME} entry in archive"
    )))
}

fn find_manifest_tar(bytes: &[u8]) -> Result<(Vec<u8>, String)> {
    let decoder = GzDecoder::new(Cursor::new(bytes));
    let mut archive = tar::Archive::new(decoder);
    for entry in archive
        .entries()
        .map_err(|err| HostError::BadArchive(err.to_string()))?
    {
        let mut entry =
            entry.map_err(|err| HostError::BadArchive(err.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|err| HostError::BadArchive(err.to_string()))?
            .to_string_lossy()
            .into_owned();
        if is_manifest_entry(&path) {
            let mut raw = Vec::new();
            entry.read_to_end(&mut raw)?;
            return Ok((raw, path));
        }
    }
    Err(HostError::BadArchive(format!(
        "no {MANIFEST_FILE_NAME} entry in archive"
    )))
}

fn is_manifest_entry(name: &str) -> bool {
    name == MANIFEST_FILE_NAME
        || name.ends_with(&format!("/{MANIFEST_FILE_NAME}"))
}

/// Strip the directory prefix and reject members that would escape the
/// destination. Members outside the prefix are skipped entirely.
fn rebase(entry_name: &str, prefix: &str) -> Option<PathBuf> {
    let rel = entry_name.strip_prefix(prefix)?;
    if rel.is_empty() {
        return None;
    }
    let mut clean = PathBuf::new();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(seg) => clean.push(seg),
            Component::CurDir => {}
            _ => {
                warn!(entry = entry_name, "skipping unsafe archive member");
                return None;
            }
        }
    }
    Some(clean)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use zip::write::SimpleFileOptions;

    use super::*;

    fn manifest_json(id: &str) -> String {
        serde_json::json!({
            "id": id,
            "version": "0.1.0",
            "name": "Test",
            "description": "test fixture",
            "runtimes": [{ "environment": "python" }],
            "instructions": [{ "events": ["ProcessStarted"] }],
            "settings": { "type": "object" }
        })
        .to_string()
    }

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = zip::ZipWriter::new(&mut cursor);
        for (name, contents) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        cursor.into_inner()
    }

    fn targz_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let encoder =
            GzEncoder::new(Cursor::new(Vec::new()), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in entries {
            let data = contents.as_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        }
        builder
            .into_inner()
            .unwrap()
            .finish()
            .unwrap()
            .into_inner()
    }

    #[test]
    fn sniffs_zip_tar_and_garbage() {
        assert_eq!(
            sniff(&zip_with(&[("a.txt", "x")])),
            Some(ArchiveKind::Zip)
        );
        assert_eq!(
            sniff(&targz_with(&[("a.txt", "x")])),
            Some(ArchiveKind::TarGz)
        );
        // Empty central-directory-only zips carry their own signature.
        assert_eq!(sniff(b"PK\x05\x06rest"), Some(ArchiveKind::Zip));
        assert_eq!(sniff(b"plain text"), None);
    }

    #[test]
    fn finds_manifest_at_root() {
        let bytes = zip_with(&[
            (MANIFEST_FILE_NAME, &manifest_json("depth0")),
            ("README.md", "hi"),
        ]);
        let archive = extract_manifest(bytes).unwrap();
        assert_eq!(archive.manifest.id.as_str(), "depth0");
        assert_eq!(archive.directory_prefix, "");
    }

    #[test]
    fn finds_manifest_three_levels_deep_and_rebases_extraction() {
        let prefix = "bundle/dist/depth3/";
        let bytes = targz_with(&[
            ("bundle/notes.txt", "ignored"),
            (
                &format!("{prefix}{MANIFEST_FILE_NAME}"),
                &manifest_json("depth3"),
            ),
            (&format!("{prefix}lib/main.py"), "print('hi')"),
        ]);
        let archive = extract_manifest(bytes).unwrap();
        assert_eq!(archive.directory_prefix, prefix);

        let dest = tempfile::tempdir().unwrap();
        archive.extract_all(dest.path()).unwrap();
        assert!(dest.path().join(MANIFEST_FILE_NAME).is_file());
        assert!(dest.path().join("lib/main.py").is_file());
        // members outside the prefix never land in the tree
        assert!(!dest.path().join("notes.txt").exists());
        assert!(!dest.path().join("bundle").exists());
    }

    #[test]
    fn missing_manifest_is_a_bad_archive() {
        let bytes = zip_with(&[("src/main.py", "pass")]);
        assert!(matches!(
            extract_manifest(bytes),
            Err(HostError::BadArchive(_))
        ));
    }

    #[test]
    fn invalid_manifest_json_is_malformed() {
        let bytes = zip_with(&[(MANIFEST_FILE_NAME, "{ not json")]);
        assert!(matches!(
            extract_manifest(bytes),
            Err(HostError::MalformedManifest(_))
        ));
    }

    #[test]
    fn unsafe_members_are_skipped() {
        let bytes = zip_with(&[
            (MANIFEST_FILE_NAME, &manifest_json("escape")),
            ("../outside.txt", "nope"),
        ]);
        let archive = extract_manifest(bytes).unwrap();
        let dest = tempfile::tempdir().unwrap();
        archive.extract_all(dest.path()).unwrap();
        assert!(!dest.path().parent().unwrap().join("outside.txt").exists());
    }
}
