use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Monotonic wall-clock milliseconds; never goes backwards and never repeats
/// within a process, so it can order "most recently touched" rows.
pub fn now_unix_ms() -> i64 {
    static LAST_UNIX_MS: AtomicI64 = AtomicI64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;

    let mut prev = LAST_UNIX_MS.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_UNIX_MS.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => prev = current,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Backup,
    Restore,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "backup" => Ok(Self::Backup),
            "restore" => Ok(Self::Restore),
            other => Err(Error::InvalidConfig {
                message: format!("unknown op kind: {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Packages,
    Media,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Packages => "packages",
            Self::Media => "media",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "packages" => Ok(Self::Packages),
            "media" => Ok(Self::Media),
            other => Err(Error::InvalidConfig {
                message: format!("unknown target kind: {other}"),
            }),
        }
    }
}

/// One data-type slot of an item. Packages use all six, media entries only
/// [`DataType::Media`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Apk,
    User,
    UserDe,
    Data,
    Obb,
    Media,
}

impl DataType {
    /// Fixed processing order for package items.
    pub const PACKAGE_ORDER: [DataType; 6] = [
        Self::Apk,
        Self::User,
        Self::UserDe,
        Self::Data,
        Self::Obb,
        Self::Media,
    ];

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Apk => "apk",
            Self::User => "user",
            Self::UserDe => "user_de",
            Self::Data => "data",
            Self::Obb => "obb",
            Self::Media => "media",
        }
    }

    /// Archive subdirectory under `<root>/apps/<package>/`. The names are part
    /// of the on-disk format and must not change.
    pub fn archive_subdir(&self) -> &'static str {
        match self {
            Self::Apk => "apk",
            Self::User | Self::UserDe => "int_data",
            Self::Data => "ext_data",
            Self::Obb | Self::Media => "addl_data",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationState {
    Idle,
    Processing,
    Uploading,
    Done,
    Error,
    Skip,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Processing => "PROCESSING",
            Self::Uploading => "UPLOADING",
            Self::Done => "DONE",
            Self::Error => "ERROR",
            Self::Skip => "SKIP",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "IDLE" => Ok(Self::Idle),
            "PROCESSING" => Ok(Self::Processing),
            "UPLOADING" => Ok(Self::Uploading),
            "DONE" => Ok(Self::Done),
            "ERROR" => Ok(Self::Error),
            "SKIP" => Ok(Self::Skip),
            other => Err(Error::InvalidConfig {
                message: format!("unknown operation state: {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionKind {
    Tar,
    Zstd,
    Lz4,
}

impl CompressionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tar => "tar",
            Self::Zstd => "zstd",
            Self::Lz4 => "lz4",
        }
    }

    /// Archive file suffix. Part of the on-disk format.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Tar => "tar",
            Self::Zstd => "tar.zst",
            Self::Lz4 => "tar.lz4",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "tar" => Ok(Self::Tar),
            "zstd" => Ok(Self::Zstd),
            "lz4" => Ok(Self::Lz4),
            other => Err(Error::InvalidConfig {
                message: format!("unknown compression kind: {other}"),
            }),
        }
    }
}

/// Outcome of one stream-multiplexer operation. `SourceMissing` replaces the
/// historical `-2` exit-code sentinel with a named variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Succeeded,
    SourceMissing,
    NoSpaceLeft,
    Failed(i32),
}

#[derive(Debug, Clone)]
pub struct StreamResult {
    pub status: StreamStatus,
    pub info: String,
}

impl StreamResult {
    pub fn is_success(&self) -> bool {
        self.status == StreamStatus::Succeeded
    }
}

/// Where archived bytes live for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocationDescriptor {
    Local { root: PathBuf },
    Cloud { endpoint: String, remote_dir: String },
}

/// One backup or restore run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub op_kind: OpKind,
    pub target_kind: TargetKind,
    pub start_ms: i64,
    pub end_ms: i64,
    pub location: LocationDescriptor,
    pub raw_bytes: u64,
    pub available_bytes: u64,
    pub total_bytes: u64,
    pub total_count: u32,
    pub success_count: u32,
    pub failure_count: u32,
    pub processing_index: u32,
    pub is_processing: bool,
}

impl Task {
    pub fn new(op_kind: OpKind, target_kind: TargetKind, location: LocationDescriptor) -> Self {
        Self {
            id: 0,
            op_kind,
            target_kind,
            start_ms: 0,
            end_ms: 0,
            location,
            raw_bytes: 0,
            available_bytes: 0,
            total_bytes: 0,
            total_count: 0,
            success_count: 0,
            failure_count: 0,
            processing_index: 0,
            is_processing: true,
        }
    }
}

/// Per-slot selection flags of a selection-list row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotSelection {
    pub apk: bool,
    pub user: bool,
    pub user_de: bool,
    pub data: bool,
    pub obb: bool,
    pub media: bool,
}

impl Default for SlotSelection {
    fn default() -> Self {
        Self {
            apk: true,
            user: true,
            user_de: true,
            data: true,
            obb: true,
            media: true,
        }
    }
}

impl SlotSelection {
    pub fn media_only() -> Self {
        Self {
            apk: false,
            user: false,
            user_de: false,
            data: false,
            obb: false,
            media: true,
        }
    }

    pub fn is_selected(&self, data_type: DataType) -> bool {
        match data_type {
            DataType::Apk => self.apk,
            DataType::User => self.user,
            DataType::UserDe => self.user_de,
            DataType::Data => self.data,
            DataType::Obb => self.obb,
            DataType::Media => self.media,
        }
    }

    /// Selected slots in fixed processing order. Media entries always collapse
    /// to the single media slot.
    pub fn selected_types(&self, target_kind: TargetKind) -> Vec<DataType> {
        match target_kind {
            TargetKind::Packages => DataType::PACKAGE_ORDER
                .into_iter()
                .filter(|dt| self.is_selected(*dt))
                .collect(),
            TargetKind::Media => vec![DataType::Media],
        }
    }
}

/// Selection-list row: one selectable package or media entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupItem {
    pub id: i64,
    pub op_kind: OpKind,
    pub target_kind: TargetKind,
    pub name: String,
    pub label: String,
    /// Media entries carry their own source/destination directory.
    pub path: PathBuf,
    pub activated: bool,
    pub compression: CompressionKind,
    pub selection: SlotSelection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotInfo {
    pub state: OperationState,
    pub bytes: u64,
    pub log: String,
}

impl Default for SlotInfo {
    fn default() -> Self {
        Self {
            state: OperationState::Idle,
            bytes: 0,
            log: String::new(),
        }
    }
}

/// Per-item record of per-data-type outcomes. The slot map holds exactly the
/// slots selected for processing; rows are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemOperation {
    pub id: i64,
    pub task_id: i64,
    pub item_name: String,
    pub label: String,
    pub updated_ms: i64,
    pub slots: BTreeMap<DataType, SlotInfo>,
}

impl ItemOperation {
    pub fn new(task_id: i64, item_name: &str, label: &str, selected: &[DataType]) -> Self {
        let mut slots = BTreeMap::new();
        for dt in selected {
            slots.insert(*dt, SlotInfo::default());
        }
        Self {
            id: 0,
            task_id,
            item_name: item_name.to_string(),
            label: label.to_string(),
            updated_ms: now_unix_ms(),
            slots,
        }
    }

    pub fn slot(&self, data_type: DataType) -> Option<&SlotInfo> {
        self.slots.get(&data_type)
    }

    pub fn slot_mut(&mut self, data_type: DataType) -> &mut SlotInfo {
        self.slots.entry(data_type).or_default()
    }

    /// An item succeeded iff every selected slot ended in DONE or SKIP.
    pub fn is_success(&self) -> bool {
        self.slots.values().all(|slot| {
            matches!(
                slot.state,
                OperationState::Done | OperationState::Skip
            )
        })
    }

    /// True if any slot actually produced an archive.
    pub fn has_done_slot(&self) -> bool {
        self.slots
            .values()
            .any(|slot| slot.state == OperationState::Done)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingPhase {
    Preprocessing,
    PostProcessing,
}

impl ProcessingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preprocessing => "preprocessing",
            Self::PostProcessing => "post_processing",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "preprocessing" => Ok(Self::Preprocessing),
            "post_processing" => Ok(Self::PostProcessing),
            other => Err(Error::InvalidConfig {
                message: format!("unknown processing phase: {other}"),
            }),
        }
    }
}

/// One named sub-step of a task's preprocessing or post-processing phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingInfo {
    pub id: i64,
    pub task_id: i64,
    pub phase: ProcessingPhase,
    pub step: String,
    pub state: OperationState,
    pub progress: f64,
    pub log: String,
}

impl ProcessingInfo {
    pub fn new(task_id: i64, phase: ProcessingPhase, step: &str) -> Self {
        Self {
            id: 0,
            task_id,
            phase,
            step: step.to_string(),
            state: OperationState::Idle,
            progress: 0.0,
            log: String::new(),
        }
    }
}

/// `<data_type_name>.tar[.zst|.lz4]`; part of the on-disk format.
pub fn archive_file_name(data_type: DataType, compression: CompressionKind) -> String {
    format!("{}.{}", data_type.type_name(), compression.suffix())
}

/// Directory holding one item's archives for a given slot, relative to the
/// target root: `apps/<package>/<subdir>` for packages, `media/<name>` for
/// media entries.
pub fn archive_rel_dir(target_kind: TargetKind, item_name: &str, data_type: DataType) -> String {
    match target_kind {
        TargetKind::Packages => {
            format!("apps/{}/{}", item_name, data_type.archive_subdir())
        }
        TargetKind::Media => format!("media/{item_name}"),
    }
}

pub fn item_archive_dir(
    root: &Path,
    target_kind: TargetKind,
    item_name: &str,
    data_type: DataType,
) -> PathBuf {
    root.join(archive_rel_dir(target_kind, item_name, data_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_names_are_bit_exact() {
        assert_eq!(
            archive_file_name(DataType::Apk, CompressionKind::Tar),
            "apk.tar"
        );
        assert_eq!(
            archive_file_name(DataType::UserDe, CompressionKind::Zstd),
            "user_de.tar.zst"
        );
        assert_eq!(
            archive_file_name(DataType::Media, CompressionKind::Lz4),
            "media.tar.lz4"
        );
    }

    #[test]
    fn archive_subdirs_match_layout() {
        assert_eq!(
            archive_rel_dir(TargetKind::Packages, "com.example.app", DataType::Apk),
            "apps/com.example.app/apk"
        );
        assert_eq!(
            archive_rel_dir(TargetKind::Packages, "com.example.app", DataType::User),
            "apps/com.example.app/int_data"
        );
        assert_eq!(
            archive_rel_dir(TargetKind::Packages, "com.example.app", DataType::UserDe),
            "apps/com.example.app/int_data"
        );
        assert_eq!(
            archive_rel_dir(TargetKind::Packages, "com.example.app", DataType::Data),
            "apps/com.example.app/ext_data"
        );
        assert_eq!(
            archive_rel_dir(TargetKind::Packages, "com.example.app", DataType::Obb),
            "apps/com.example.app/addl_data"
        );
        assert_eq!(
            archive_rel_dir(TargetKind::Packages, "com.example.app", DataType::Media),
            "apps/com.example.app/addl_data"
        );
        assert_eq!(
            archive_rel_dir(TargetKind::Media, "Pictures", DataType::Media),
            "media/Pictures"
        );
    }

    #[test]
    fn item_success_requires_done_or_skip_everywhere() {
        let mut op = ItemOperation::new(1, "com.example.app", "Example", &DataType::PACKAGE_ORDER);
        for dt in DataType::PACKAGE_ORDER {
            op.slot_mut(dt).state = OperationState::Done;
        }
        assert!(op.is_success());

        op.slot_mut(DataType::Obb).state = OperationState::Skip;
        assert!(op.is_success());

        op.slot_mut(DataType::Data).state = OperationState::Error;
        assert!(!op.is_success());
    }

    #[test]
    fn media_selection_collapses_to_media_slot() {
        let selection = SlotSelection::default();
        assert_eq!(
            selection.selected_types(TargetKind::Media),
            vec![DataType::Media]
        );

        let mut partial = SlotSelection::default();
        partial.user_de = false;
        partial.obb = false;
        assert_eq!(
            partial.selected_types(TargetKind::Packages),
            vec![
                DataType::Apk,
                DataType::User,
                DataType::Data,
                DataType::Media
            ]
        );
    }

    #[test]
    fn slot_map_serializes_with_snake_case_keys() {
        let op = ItemOperation::new(7, "m", "M", &[DataType::UserDe]);
        let json = serde_json::to_string(&op.slots).unwrap();
        assert!(json.contains("\"user_de\""));
        let back: BTreeMap<DataType, SlotInfo> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[&DataType::UserDe].state, OperationState::Idle);
    }
}
