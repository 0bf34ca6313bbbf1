use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use appvault_core::{
    BackupItem, CloudBackend, CompressionKind, HttpRemoteClient, LocalBackend, OpKind,
    OrchestratorConfig, PrivilegedRunner, Settings, ShellDeviceEnv, SlotSelection, Store,
    StorageBackend, TargetKind, TaskEvent, TaskOrchestrator, import_restore_items, load_settings,
    save_settings, start_task_log,
};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "appvault")]
#[command(about = "AppVault CLI (app & media backup/restore)", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    Items {
        #[command(subcommand)]
        cmd: ItemsCmd,
    },
    Tasks {
        #[command(subcommand)]
        cmd: TasksCmd,
    },
    Backup {
        #[command(subcommand)]
        cmd: BackupCmd,
    },
    Restore {
        #[command(subcommand)]
        cmd: RestoreCmd,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    Set,
}

#[derive(Subcommand)]
enum ItemsCmd {
    Add {
        #[arg(long, default_value = "backup")]
        op: String,
        #[arg(long, default_value = "packages")]
        target: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        label: Option<String>,
        /// Source directory; required for media entries.
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        compression: Option<String>,
        /// Data types to leave out, e.g. `--skip obb --skip media`.
        #[arg(long)]
        skip: Vec<String>,
    },
    List {
        #[arg(long, default_value = "backup")]
        op: String,
        #[arg(long, default_value = "packages")]
        target: String,
    },
    /// Rebuild the restore selection list from the manifests under a backup
    /// root.
    Import {
        #[arg(long, default_value = "packages")]
        target: String,
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum TasksCmd {
    List {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    Items {
        #[arg(long)]
        task_id: i64,
    },
}

#[derive(Subcommand)]
enum BackupCmd {
    Run {
        #[arg(long, default_value = "packages")]
        target: String,
    },
}

#[derive(Subcommand)]
enum RestoreCmd {
    Run {
        #[arg(long, default_value = "packages")]
        target: String,
    },
}

#[derive(Debug, serde::Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| std::env::var("APPVAULT_CONFIG_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var("APPVAULT_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_data_dir);

    match cli.cmd {
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&config_dir, cli.json),
            SettingsCmd::Set => settings_set(&config_dir, cli.json),
        },
        Command::Items { cmd } => match cmd {
            ItemsCmd::Add {
                op,
                target,
                name,
                label,
                path,
                compression,
                skip,
            } => {
                items_add(
                    &config_dir,
                    &data_dir,
                    op,
                    target,
                    name,
                    label,
                    path,
                    compression,
                    skip,
                    cli.json,
                )
                .await
            }
            ItemsCmd::List { op, target } => items_list(&data_dir, op, target, cli.json).await,
            ItemsCmd::Import { target, root } => {
                items_import(&config_dir, &data_dir, target, root, cli.json).await
            }
        },
        Command::Tasks { cmd } => match cmd {
            TasksCmd::List { limit } => tasks_list(&data_dir, limit, cli.json).await,
            TasksCmd::Items { task_id } => tasks_items(&data_dir, task_id, cli.json).await,
        },
        Command::Backup { cmd } => match cmd {
            BackupCmd::Run { target } => {
                task_run(
                    &config_dir,
                    &data_dir,
                    OpKind::Backup,
                    target,
                    cli.json,
                    cli.events,
                )
                .await
            }
        },
        Command::Restore { cmd } => match cmd {
            RestoreCmd::Run { target } => {
                task_run(
                    &config_dir,
                    &data_dir,
                    OpKind::Restore,
                    target,
                    cli.json,
                    cli.events,
                )
                .await
            }
        },
    }
}

fn settings_get(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = read_settings(config_dir)?;
    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    } else {
        let text = toml::to_string_pretty(&settings)
            .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn settings_set(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let settings = Settings::from_toml_str(&input).map_err(map_core_err)?;
    validate_settings(&settings)?;
    save_settings(&config_path(config_dir), &settings).map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn items_add(
    config_dir: &Path,
    data_dir: &Path,
    op: String,
    target: String,
    name: String,
    label: Option<String>,
    path: Option<PathBuf>,
    compression: Option<String>,
    skip: Vec<String>,
    json: bool,
) -> Result<(), CliError> {
    let settings = read_settings(config_dir)?;
    let op_kind = OpKind::parse(&op).map_err(map_core_err)?;
    let target_kind = TargetKind::parse(&target).map_err(map_core_err)?;
    let compression = match compression {
        Some(s) => CompressionKind::parse(&s).map_err(map_core_err)?,
        None => settings.compression,
    };

    let mut selection = match target_kind {
        TargetKind::Packages => SlotSelection::default(),
        TargetKind::Media => SlotSelection::media_only(),
    };
    for s in &skip {
        match s.as_str() {
            "apk" => selection.apk = false,
            "user" => selection.user = false,
            "user_de" => selection.user_de = false,
            "data" => selection.data = false,
            "obb" => selection.obb = false,
            "media" => selection.media = false,
            other => {
                return Err(CliError::new(
                    "config.invalid",
                    format!("unknown data type: {other}"),
                ));
            }
        }
    }

    let path = match (target_kind, path) {
        (TargetKind::Media, None) => {
            return Err(CliError::new(
                "config.invalid",
                "--path is required for media entries",
            ));
        }
        (_, path) => path.unwrap_or_default(),
    };

    let store = open_store(data_dir).await?;
    let mut item = BackupItem {
        id: 0,
        op_kind,
        target_kind,
        label: label.unwrap_or_else(|| name.clone()),
        name,
        path,
        activated: true,
        compression,
        selection,
    };
    let id = store.upsert_item(&mut item).await.map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "itemId": id }));
    } else {
        println!("itemId={id}");
    }
    Ok(())
}

async fn items_list(
    data_dir: &Path,
    op: String,
    target: String,
    json: bool,
) -> Result<(), CliError> {
    let op_kind = OpKind::parse(&op).map_err(map_core_err)?;
    let target_kind = TargetKind::parse(&target).map_err(map_core_err)?;

    let store = open_store(data_dir).await?;
    let items = store
        .activated_items(op_kind, target_kind)
        .await
        .map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "items": items }));
    } else {
        for item in items {
            println!(
                "{}\t{}\t{}",
                item.name,
                item.label,
                item.compression.as_str()
            );
        }
    }
    Ok(())
}

async fn items_import(
    config_dir: &Path,
    data_dir: &Path,
    target: String,
    root: Option<PathBuf>,
    json: bool,
) -> Result<(), CliError> {
    let settings = read_settings(config_dir)?;
    let target_kind = TargetKind::parse(&target).map_err(map_core_err)?;
    let root = root.unwrap_or(settings.backup_root);

    let store = open_store(data_dir).await?;
    let imported = import_restore_items(&store, &root, target_kind)
        .await
        .map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "imported": imported }));
    } else {
        println!("imported={imported}");
    }
    Ok(())
}

async fn tasks_list(data_dir: &Path, limit: u32, json: bool) -> Result<(), CliError> {
    let store = open_store(data_dir).await?;
    let tasks = store.tasks(limit).await.map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "tasks": tasks }));
    } else {
        for task in tasks {
            println!(
                "{}\t{}\t{}\tsuccess={} failure={} total={}{}",
                task.id,
                task.op_kind.as_str(),
                task.target_kind.as_str(),
                task.success_count,
                task.failure_count,
                task.total_count,
                if task.is_processing {
                    " (processing)"
                } else {
                    ""
                }
            );
        }
    }
    Ok(())
}

async fn tasks_items(data_dir: &Path, task_id: i64, json: bool) -> Result<(), CliError> {
    let store = open_store(data_dir).await?;
    let ops = store.items_for_task(task_id).await.map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "items": ops }));
    } else {
        for op in ops {
            let slots: Vec<String> = op
                .slots
                .iter()
                .map(|(dt, slot)| format!("{}={}", dt.type_name(), slot.state.as_str()))
                .collect();
            println!(
                "{}\t{}\t{}",
                op.item_name,
                if op.is_success() { "ok" } else { "failed" },
                slots.join(" ")
            );
        }
    }
    Ok(())
}

async fn task_run(
    config_dir: &Path,
    data_dir: &Path,
    op_kind: OpKind,
    target: String,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let settings = read_settings(config_dir)?;
    validate_settings(&settings)?;
    let target_kind = TargetKind::parse(&target).map_err(map_core_err)?;

    let store = open_store(data_dir).await?;
    let backend: Arc<dyn StorageBackend> = match &settings.cloud {
        Some(cloud) => Arc::new(CloudBackend::new(
            Arc::new(HttpRemoteClient::new(cloud.endpoint.clone())),
            cloud.remote_dir.clone(),
            cloud.staging_dir.clone(),
        )),
        None => Arc::new(LocalBackend::new(settings.backup_root.clone())),
    };
    let env = Arc::new(ShellDeviceEnv::new(settings.device_commands.clone()));
    let runner = PrivilegedRunner::new(settings.runner_prefix.clone());

    let orchestrator = TaskOrchestrator::new(
        store,
        backend,
        env,
        runner,
        OrchestratorConfig {
            op_kind,
            target_kind,
            layout: settings.layout.clone(),
            reset_selection: settings.reset_selection_on_finish,
        },
    );

    let task_id = orchestrator.initialize().await.map_err(map_core_err)?;
    let _log_guard = start_task_log(op_kind, task_id, data_dir)
        .map_err(|e| CliError::new("log.open_failed", e.to_string()))?;

    if events {
        println!(
            "{}",
            serde_json::json!({
                "type": "task.state",
                "taskId": task_id,
                "kind": op_kind.as_str(),
                "state": "running"
            })
        );
    }

    let printer = if events || !json {
        let mut rx = orchestrator
            .subscribe()
            .ok_or_else(|| CliError::new("task.failed", "event channel already taken"))?;
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    TaskEvent::Progress {
                        phase,
                        current_index,
                        total,
                        item_label,
                    } => {
                        if events {
                            println!(
                                "{}",
                                serde_json::json!({
                                    "type": "task.progress",
                                    "taskId": task_id,
                                    "phase": phase,
                                    "currentIndex": current_index,
                                    "total": total,
                                    "itemLabel": item_label,
                                })
                            );
                        } else {
                            println!("[{}/{}] {}", current_index + 1, total, item_label);
                        }
                    }
                    TaskEvent::Finished { .. } => {}
                }
            }
        }))
    } else {
        None
    };

    orchestrator.preprocessing().await.map_err(map_core_err)?;
    orchestrator.processing().await.map_err(map_core_err)?;
    orchestrator.post_processing().await.map_err(map_core_err)?;

    let task = orchestrator.task_snapshot().await;
    // The event sender lives in the orchestrator; dropping it closes the
    // channel so the printer drains and exits.
    drop(orchestrator);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    if events {
        println!(
            "{}",
            serde_json::json!({
                "type": "task.state",
                "taskId": task_id,
                "kind": op_kind.as_str(),
                "state": "succeeded",
                "successCount": task.success_count,
                "failureCount": task.failure_count,
            })
        );
        return Ok(());
    }

    if json {
        println!(
            "{}",
            serde_json::json!({
                "taskId": task_id,
                "elapsedMs": task.end_ms.saturating_sub(task.start_ms),
                "successCount": task.success_count,
                "failureCount": task.failure_count,
                "totalCount": task.total_count,
            })
        );
    } else {
        println!("taskId={task_id}");
        println!(
            "elapsedMs={} success={} failure={} total={}",
            task.end_ms.saturating_sub(task.start_ms),
            task.success_count,
            task.failure_count,
            task.total_count
        );
    }
    Ok(())
}

fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join("appvault")
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".local")
        .join("share")
        .join("appvault")
}

fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

fn read_settings(config_dir: &Path) -> Result<Settings, CliError> {
    load_settings(&config_path(config_dir)).map_err(map_core_err)
}

async fn open_store(data_dir: &Path) -> Result<Store, CliError> {
    let db_path = data_dir.join("index").join("ops.sqlite");
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CliError::new("config.write_failed", e.to_string()))?;
    }
    Store::open(&db_path).await.map_err(map_core_err)
}

fn validate_settings(settings: &Settings) -> Result<(), CliError> {
    if settings.compression == CompressionKind::Lz4 {
        return Err(CliError::new(
            "config.invalid",
            "lz4 archives can be restored by name only; pick tar or zstd for new backups",
        ));
    }
    if let Some(cloud) = &settings.cloud {
        if cloud.endpoint.is_empty() {
            return Err(CliError::new("config.invalid", "cloud.endpoint is empty"));
        }
        if cloud.staging_dir.as_os_str().is_empty() {
            return Err(CliError::new(
                "config.invalid",
                "cloud.staging_dir is empty",
            ));
        }
    }
    Ok(())
}

fn map_core_err(e: appvault_core::Error) -> CliError {
    match e {
        appvault_core::Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        appvault_core::Error::Remote { message } => {
            CliError::retryable("remote.unavailable", message)
        }
        appvault_core::Error::NoSpaceLeft => {
            CliError::new("storage.no_space", "no space left on device")
        }
        appvault_core::Error::HelperUnavailable { message } => {
            CliError::retryable("helper.unavailable", message)
        }
        appvault_core::Error::Sqlite(e) => CliError::new("db.failed", e.to_string()),
        appvault_core::Error::SqliteMigrate(e) => CliError::new("db.failed", e.to_string()),
        appvault_core::Error::Integrity { message } => CliError::new("integrity", message),
        other => CliError::new("unknown", other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| {
        "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}"
            .to_string()
    });
    let _ = writeln!(std::io::stderr(), "{json}");
}
