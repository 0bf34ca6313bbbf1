use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::DeviceLayout;
use crate::manifest::{self, MANIFEST_VERSION, RestoreManifest};
use crate::model::{
    BackupItem, DataType, ItemOperation, OpKind, OperationState, StreamStatus, TargetKind, Task,
    archive_file_name, archive_rel_dir, item_archive_dir, now_unix_ms,
};
use crate::store::Store;
use crate::strategy::StorageBackend;
use crate::tar_stream::{self, ArchiveInput, PrivilegedRunner};
use crate::{Error, Result};

/// Everything one item execution needs; owned by the orchestrator for the
/// duration of a processing phase.
pub struct ExecContext<'a> {
    pub store: &'a Store,
    pub backend: &'a dyn StorageBackend,
    pub runner: &'a PrivilegedRunner,
    pub layout: &'a DeviceLayout,
    pub task: &'a Task,
}

/// Run the ordered set of data-type operations for one package or media item.
/// A slot failure never blocks the remaining slots; the caller reads the
/// aggregate through [`ItemOperation::is_success`].
pub async fn execute_item(ctx: &ExecContext<'_>, item: &BackupItem) -> Result<ItemOperation> {
    let selected = item.selection.selected_types(item.target_kind);
    let mut op = ItemOperation::new(ctx.task.id, &item.name, &item.label, &selected);
    ctx.store.upsert_item_op(&mut op).await?;

    debug!(
        event = "item.start",
        task_id = ctx.task.id,
        item = %item.name,
        op_kind = ctx.task.op_kind.as_str(),
        slots = selected.len(),
        "item.start"
    );

    for data_type in selected {
        match ctx.task.op_kind {
            OpKind::Backup => backup_slot(ctx, item, &mut op, data_type).await?,
            OpKind::Restore => restore_slot(ctx, item, &mut op, data_type).await?,
        }
    }

    if ctx.task.op_kind == OpKind::Backup && op.is_success() && op.has_done_slot() {
        if let Err(e) = write_item_manifest(ctx, item, &op).await {
            warn!(
                event = "manifest.write_failed",
                item = %item.name,
                error = %e,
                "manifest.write_failed"
            );
        }
    }

    info!(
        event = "item.finish",
        task_id = ctx.task.id,
        item = %item.name,
        success = op.is_success(),
        "item.finish"
    );
    Ok(op)
}

async fn backup_slot(
    ctx: &ExecContext<'_>,
    item: &BackupItem,
    op: &mut ItemOperation,
    data_type: DataType,
) -> Result<()> {
    let input = slot_source(ctx.layout, item, data_type)?;
    let src = input.base.join(&input.name);

    let bytes = dir_size(&src).await;
    {
        let slot = op.slot_mut(data_type);
        slot.state = OperationState::Processing;
        slot.bytes = bytes;
    }
    ctx.store.upsert_item_op(op).await?;

    let out_dir = item_archive_dir(
        ctx.backend.target_root_dir(),
        item.target_kind,
        &item.name,
        data_type,
    );
    tokio::fs::create_dir_all(&out_dir).await?;
    let out_path = out_dir.join(archive_file_name(data_type, item.compression));

    let result =
        tar_stream::package_and_compress(ctx.runner, item.compression, &out_path, &[input]).await?;

    match result.status {
        StreamStatus::SourceMissing => {
            info!(
                event = "slot.skip",
                item = %item.name,
                data_type = data_type.type_name(),
                "slot.skip"
            );
            let slot = op.slot_mut(data_type);
            slot.state = OperationState::Skip;
            slot.log = result.info;
        }
        StreamStatus::Succeeded => {
            if ctx.backend.is_remote() {
                op.slot_mut(data_type).state = OperationState::Uploading;
                ctx.store.upsert_item_op(op).await?;

                let rel = archive_rel_dir(item.target_kind, &item.name, data_type);
                match ctx.backend.upload(&out_path, &rel).await {
                    Ok(()) => {
                        let slot = op.slot_mut(data_type);
                        slot.state = OperationState::Done;
                        slot.log = result.info;
                    }
                    Err(e) => {
                        let slot = op.slot_mut(data_type);
                        slot.state = OperationState::Error;
                        slot.log = concat_log(&result.info, &format!("upload failed: {e}"));
                    }
                }
            } else {
                let slot = op.slot_mut(data_type);
                slot.state = OperationState::Done;
                slot.log = result.info;
            }
        }
        StreamStatus::NoSpaceLeft => {
            warn!(
                event = "slot.no_space",
                item = %item.name,
                data_type = data_type.type_name(),
                "slot.no_space"
            );
            let slot = op.slot_mut(data_type);
            slot.state = OperationState::Error;
            slot.log = concat_log("no space left on device", &result.info);
        }
        StreamStatus::Failed(code) => {
            let slot = op.slot_mut(data_type);
            slot.state = OperationState::Error;
            slot.log = concat_log(&format!("archiver failed with status {code}"), &result.info);
        }
    }

    ctx.store.upsert_item_op(op).await?;
    Ok(())
}

async fn restore_slot(
    ctx: &ExecContext<'_>,
    item: &BackupItem,
    op: &mut ItemOperation,
    data_type: DataType,
) -> Result<()> {
    op.slot_mut(data_type).state = OperationState::Processing;
    ctx.store.upsert_item_op(op).await?;

    let file_name = archive_file_name(data_type, item.compression);
    let local_dir = item_archive_dir(
        ctx.backend.target_root_dir(),
        item.target_kind,
        &item.name,
        data_type,
    );
    let archive = local_dir.join(&file_name);

    if ctx.backend.is_remote() && !archive.is_file() {
        let rel = format!(
            "{}/{file_name}",
            archive_rel_dir(item.target_kind, &item.name, data_type)
        );
        if let Err(e) = ctx.backend.download(&rel, &local_dir).await {
            let slot = op.slot_mut(data_type);
            slot.state = OperationState::Error;
            slot.log = format!("download failed: {e}");
            ctx.store.upsert_item_op(op).await?;
            return Ok(());
        }
    }

    if !archive.is_file() {
        info!(
            event = "slot.skip",
            item = %item.name,
            data_type = data_type.type_name(),
            "slot.skip"
        );
        let slot = op.slot_mut(data_type);
        slot.state = OperationState::Skip;
        slot.log = format!("archive not found: {}", archive.display());
        ctx.store.upsert_item_op(op).await?;
        return Ok(());
    }

    op.slot_mut(data_type).bytes = tokio::fs::metadata(&archive)
        .await
        .map(|m| m.len())
        .unwrap_or(0);

    if let Some(expected) = recorded_checksum(ctx, item, data_type) {
        let actual = checksum(&archive).await?;
        if actual != expected {
            let slot = op.slot_mut(data_type);
            slot.state = OperationState::Error;
            slot.log = format!("archive checksum mismatch: {}", archive.display());
            ctx.store.upsert_item_op(op).await?;
            return Ok(());
        }
    }

    let dest = match restore_dest(ctx.layout, item, data_type) {
        Ok(dest) => dest,
        Err(e) => {
            let slot = op.slot_mut(data_type);
            slot.state = OperationState::Error;
            slot.log = format!("no restore destination: {e}");
            ctx.store.upsert_item_op(op).await?;
            return Ok(());
        }
    };

    let result =
        tar_stream::extract_and_decompress(ctx.runner, item.compression, &archive, &dest).await?;

    match result.status {
        StreamStatus::Succeeded => {
            let slot = op.slot_mut(data_type);
            slot.state = OperationState::Done;
            slot.log = result.info;
        }
        StreamStatus::SourceMissing => {
            let slot = op.slot_mut(data_type);
            slot.state = OperationState::Skip;
            slot.log = result.info;
        }
        StreamStatus::NoSpaceLeft => {
            let slot = op.slot_mut(data_type);
            slot.state = OperationState::Error;
            slot.log = concat_log("no space left on device", &result.info);
        }
        StreamStatus::Failed(code) => {
            let slot = op.slot_mut(data_type);
            slot.state = OperationState::Error;
            slot.log = concat_log(&format!("extractor failed with status {code}"), &result.info);
        }
    }

    ctx.store.upsert_item_op(op).await?;
    Ok(())
}

/// `-C <base> <name>` group for a slot's source directory.
fn slot_source(
    layout: &DeviceLayout,
    item: &BackupItem,
    data_type: DataType,
) -> Result<ArchiveInput> {
    match item.target_kind {
        TargetKind::Packages => Ok(ArchiveInput::new(
            layout.source_dir(data_type),
            item.name.clone(),
        )),
        TargetKind::Media => {
            let base = item.path.parent().ok_or_else(|| Error::InvalidConfig {
                message: format!("media path has no parent: {}", item.path.display()),
            })?;
            let name = item
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::NonUtf8Path {
                    path: item.path.clone(),
                })?;
            Ok(ArchiveInput::new(base, name))
        }
    }
}

fn restore_dest(layout: &DeviceLayout, item: &BackupItem, data_type: DataType) -> Result<PathBuf> {
    match item.target_kind {
        TargetKind::Packages => Ok(layout.source_dir(data_type).to_path_buf()),
        TargetKind::Media => {
            if item.path.as_os_str().is_empty() {
                return Err(Error::InvalidConfig {
                    message: format!("media item {} has no recorded path", item.name),
                });
            }
            item.path
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| Error::InvalidConfig {
                    message: format!("media path has no parent: {}", item.path.display()),
                })
        }
    }
}

fn recorded_checksum(
    ctx: &ExecContext<'_>,
    item: &BackupItem,
    data_type: DataType,
) -> Option<String> {
    let path = manifest::manifest_path(
        ctx.backend.target_root_dir(),
        item.target_kind,
        &item.name,
    );
    let manifest = manifest::read_manifest(&path).ok()?;
    manifest.archive_checksums.get(&data_type).cloned()
}

async fn write_item_manifest(
    ctx: &ExecContext<'_>,
    item: &BackupItem,
    op: &ItemOperation,
) -> Result<()> {
    let root = ctx.backend.target_root_dir();
    let mut slot_bytes = BTreeMap::new();
    let mut archive_checksums = BTreeMap::new();

    for (data_type, slot) in &op.slots {
        if slot.state != OperationState::Done {
            continue;
        }
        slot_bytes.insert(*data_type, slot.bytes);
        let archive = item_archive_dir(root, item.target_kind, &item.name, *data_type)
            .join(archive_file_name(*data_type, item.compression));
        if archive.is_file() {
            archive_checksums.insert(*data_type, checksum(&archive).await?);
        }
    }

    let manifest = RestoreManifest {
        version: MANIFEST_VERSION,
        name: item.name.clone(),
        label: item.label.clone(),
        target_kind: item.target_kind,
        compression: item.compression,
        selection: item.selection,
        slot_bytes,
        archive_checksums,
        location: ctx.backend.location(),
        source_path: match item.target_kind {
            TargetKind::Media => Some(item.path.clone()),
            TargetKind::Packages => None,
        },
        created_ms: now_unix_ms(),
    };

    let path = manifest::manifest_path(root, item.target_kind, &item.name);
    manifest::write_manifest_atomic(&path, &manifest)?;

    if ctx.backend.is_remote()
        && let Err(e) = ctx
            .backend
            .upload(&path, &manifest::manifest_rel_dir(item.target_kind, &item.name))
            .await
    {
        warn!(
            event = "manifest.upload_failed",
            item = %item.name,
            error = %e,
            "manifest.upload_failed"
        );
    }
    Ok(())
}

async fn checksum(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || manifest::file_checksum(&path))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

/// Total size of regular files under `path`; 0 when it does not exist.
pub async fn dir_size(path: &Path) -> u64 {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || dir_size_sync(&path))
        .await
        .unwrap_or(0)
}

fn dir_size_sync(path: &Path) -> u64 {
    if !path.exists() {
        return 0;
    }
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
        .sum()
}

fn concat_log(head: &str, tail: &str) -> String {
    if tail.is_empty() {
        head.to_string()
    } else if head.is_empty() {
        tail.to_string()
    } else {
        format!("{head}\n{tail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_size_counts_regular_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/one"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("a/b/two"), vec![0u8; 28]).unwrap();

        assert_eq!(dir_size_sync(dir.path()), 128);
        assert_eq!(dir_size_sync(&dir.path().join("missing")), 0);
    }

    #[test]
    fn media_slot_source_splits_path() {
        let layout = DeviceLayout::default();
        let item = BackupItem {
            id: 0,
            op_kind: OpKind::Backup,
            target_kind: TargetKind::Media,
            name: "Pictures".to_string(),
            label: "Pictures".to_string(),
            path: PathBuf::from("/sdcard/DCIM/Pictures"),
            activated: true,
            compression: crate::model::CompressionKind::Zstd,
            selection: crate::model::SlotSelection::media_only(),
        };
        let input = slot_source(&layout, &item, DataType::Media).unwrap();
        assert_eq!(input.base, PathBuf::from("/sdcard/DCIM"));
        assert_eq!(input.name, "Pictures");

        let package = BackupItem {
            target_kind: TargetKind::Packages,
            name: "com.example.app".to_string(),
            ..item
        };
        let input = slot_source(&layout, &package, DataType::User).unwrap();
        assert_eq!(input.base, PathBuf::from("/data/user/0"));
        assert_eq!(input.name, "com.example.app");
    }
}
