mod config;
mod device;
mod error;
mod executor;
mod manifest;
mod model;
mod orchestrator;
mod run_log;
mod store;
mod strategy;
mod tar_stream;

pub const APP_NAME: &str = "AppVault";

pub use config::{
    CloudSettings, DeviceLayout, SETTINGS_SCHEMA_VERSION, Settings, load_settings, save_settings,
};
pub use device::{DeviceCommands, DeviceEnv, EnvSnapshot, ScriptedDeviceEnv, ShellDeviceEnv};
pub use error::{Error, Result};
pub use executor::{ExecContext, dir_size, execute_item};
pub use manifest::{
    MANIFEST_FILE_NAME, MANIFEST_VERSION, RestoreManifest, file_checksum, import_restore_items,
    manifest_path, read_manifest, scan_manifests, write_manifest_atomic,
};
pub use model::{
    BackupItem, CompressionKind, DataType, ItemOperation, LocationDescriptor, OpKind,
    OperationState, ProcessingInfo, ProcessingPhase, SlotInfo, SlotSelection, StreamResult,
    StreamStatus, TargetKind, Task, archive_file_name, archive_rel_dir, item_archive_dir,
    now_unix_ms,
};
pub use orchestrator::{OrchestratorConfig, TaskEvent, TaskOrchestrator};
pub use run_log::{TaskLogGuard, init_run_logging, start_task_log};
pub use store::Store;
pub use strategy::{
    CloudBackend, HttpRemoteClient, InMemoryRemote, LocalBackend, RemoteClient, StorageBackend,
    StorageCapacity,
};
pub use tar_stream::{
    ArchiveInput, PrivilegedRunner, extract_and_decompress, package_and_compress,
};
