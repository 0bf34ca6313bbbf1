use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;
use walkdir::WalkDir;

use crate::model::{
    BackupItem, CompressionKind, DataType, LocationDescriptor, OpKind, SlotSelection, TargetKind,
};
use crate::store::Store;
use crate::{Error, Result};

pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

/// Config record written beside each successful backup item; a restore task
/// reads these to rebuild its item list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreManifest {
    pub version: u32,
    pub name: String,
    pub label: String,
    pub target_kind: TargetKind,
    pub compression: CompressionKind,
    pub selection: SlotSelection,
    /// Source byte size per archived slot.
    pub slot_bytes: BTreeMap<DataType, u64>,
    /// blake3 of each produced archive, for verification on restore.
    pub archive_checksums: BTreeMap<DataType, String>,
    pub location: LocationDescriptor,
    /// Original source directory; restore destination for media entries.
    pub source_path: Option<PathBuf>,
    pub created_ms: i64,
}

/// `<root>/apps/<name>/manifest.json` or `<root>/media/<name>/manifest.json`.
pub fn manifest_path(root: &Path, target_kind: TargetKind, name: &str) -> PathBuf {
    match target_kind {
        TargetKind::Packages => root.join("apps").join(name).join(MANIFEST_FILE_NAME),
        TargetKind::Media => root.join("media").join(name).join(MANIFEST_FILE_NAME),
    }
}

/// Relative remote directory holding an item's manifest.
pub fn manifest_rel_dir(target_kind: TargetKind, name: &str) -> String {
    match target_kind {
        TargetKind::Packages => format!("apps/{name}"),
        TargetKind::Media => format!("media/{name}"),
    }
}

pub fn write_manifest_atomic(path: &Path, manifest: &RestoreManifest) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension(format!("json.tmp.{}", std::process::id()));
    let data = serde_json::to_vec_pretty(manifest).map_err(|e| Error::InvalidConfig {
        message: format!("serialize restore manifest failed: {e}"),
    })?;

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_manifest(path: &Path) -> Result<RestoreManifest> {
    let mut buf = Vec::new();
    File::open(path)?.read_to_end(&mut buf)?;
    let manifest: RestoreManifest =
        serde_json::from_slice(&buf).map_err(|e| Error::InvalidConfig {
            message: format!("invalid restore manifest json: {e}"),
        })?;
    if manifest.version != MANIFEST_VERSION {
        return Err(Error::InvalidConfig {
            message: format!("unsupported restore manifest version: {}", manifest.version),
        });
    }
    Ok(manifest)
}

/// All readable manifests of one target kind under a backup root, in path
/// order. Unreadable ones are logged and skipped so a single damaged record
/// cannot hide the rest.
pub fn scan_manifests(root: &Path, target_kind: TargetKind) -> Result<Vec<RestoreManifest>> {
    let base = match target_kind {
        TargetKind::Packages => root.join("apps"),
        TargetKind::Media => root.join("media"),
    };
    if !base.is_dir() {
        return Ok(Vec::new());
    }

    let mut manifests = Vec::new();
    for entry in WalkDir::new(&base)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| Error::InvalidConfig {
            message: format!("walkdir error: {e}"),
        })?;
        if entry.file_name() != MANIFEST_FILE_NAME {
            continue;
        }
        match read_manifest(entry.path()) {
            Ok(manifest) if manifest.target_kind == target_kind => manifests.push(manifest),
            Ok(_) => {}
            Err(e) => {
                warn!(
                    event = "manifest.read_failed",
                    path = %entry.path().display(),
                    error = %e,
                    "manifest.read_failed"
                );
            }
        }
    }
    Ok(manifests)
}

/// Rebuild a restore selection list from the manifests under `root`; returns
/// the number of imported (and activated) items.
pub async fn import_restore_items(
    store: &Store,
    root: &Path,
    target_kind: TargetKind,
) -> Result<u32> {
    let manifests = scan_manifests(root, target_kind)?;
    let mut imported = 0u32;
    for manifest in manifests {
        let mut item = BackupItem {
            id: 0,
            op_kind: OpKind::Restore,
            target_kind,
            name: manifest.name.clone(),
            label: manifest.label.clone(),
            path: manifest.source_path.clone().unwrap_or_default(),
            activated: true,
            compression: manifest.compression,
            selection: manifest.selection,
        };
        store.upsert_item(&mut item).await?;
        imported += 1;
    }
    Ok(imported)
}

/// Streaming blake3 of a file.
pub fn file_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::now_unix_ms;

    fn sample(name: &str, root: &Path) -> RestoreManifest {
        RestoreManifest {
            version: MANIFEST_VERSION,
            name: name.to_string(),
            label: name.to_uppercase(),
            target_kind: TargetKind::Media,
            compression: CompressionKind::Zstd,
            selection: SlotSelection::media_only(),
            slot_bytes: BTreeMap::from([(DataType::Media, 123u64)]),
            archive_checksums: BTreeMap::new(),
            location: LocationDescriptor::Local {
                root: root.to_path_buf(),
            },
            source_path: Some(PathBuf::from("/sdcard/Pictures")),
            created_ms: now_unix_ms(),
        }
    }

    #[test]
    fn manifest_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = manifest_path(dir.path(), TargetKind::Media, "Pictures");
        let manifest = sample("Pictures", dir.path());

        write_manifest_atomic(&path, &manifest).unwrap();
        let got = read_manifest(&path).unwrap();
        assert_eq!(got.name, "Pictures");
        assert_eq!(got.slot_bytes[&DataType::Media], 123);
        assert_eq!(got.source_path, Some(PathBuf::from("/sdcard/Pictures")));

        // No temp file left behind.
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from(MANIFEST_FILE_NAME)]);
    }

    #[test]
    fn scan_skips_damaged_manifests() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b_ok", "a_ok"] {
            let path = manifest_path(dir.path(), TargetKind::Media, name);
            write_manifest_atomic(&path, &sample(name, dir.path())).unwrap();
        }
        let broken = manifest_path(dir.path(), TargetKind::Media, "broken");
        std::fs::create_dir_all(broken.parent().unwrap()).unwrap();
        std::fs::write(&broken, b"{not json").unwrap();

        let manifests = scan_manifests(dir.path(), TargetKind::Media).unwrap();
        let names: Vec<_> = manifests.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["a_ok", "b_ok"]);
    }

    #[test]
    fn checksum_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"stream me").unwrap();
        let a = file_checksum(&path).unwrap();
        let b = file_checksum(&path).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, blake3::hash(b"stream me").to_hex().to_string());
    }
}
