use std::path::Path;

use sqlx::SqlitePool;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::Row;
use tracing::{debug, error};

use crate::model::{
    BackupItem, CompressionKind, ItemOperation, LocationDescriptor, OpKind, OperationState,
    ProcessingInfo, ProcessingPhase, SlotSelection, TargetKind, Task, now_unix_ms,
};
use crate::{Error, Result};

/// Operation record store: tasks, the selection list, per-item operations and
/// processing-phase sub-steps. Pure upsert/query contract; all mutations are
/// driven by the orchestrator and the executor.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self> {
        debug!(
            event = "sqlite.open",
            db_path = %path.display(),
            create_if_missing = true,
            "sqlite.open"
        );
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| {
                error!(
                    event = "io.sqlite.connect_failed",
                    db_path = %path.display(),
                    error = %e,
                    "io.sqlite.connect_failed"
                );
                e
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await?;

        sqlx::migrate!().run(&pool).await.map_err(|e| {
            error!(
                event = "io.sqlite.migrate_failed",
                db_path = %path.display(),
                error = %e,
                "io.sqlite.migrate_failed"
            );
            e
        })?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn upsert_task(&self, task: &mut Task) -> Result<i64> {
        let location = serde_json::to_string(&task.location).map_err(|e| Error::InvalidConfig {
            message: format!("serialize task location failed: {e}"),
        })?;

        if task.id == 0 {
            let result = sqlx::query(
                r#"
                INSERT INTO tasks (op_kind, target_kind, start_ms, end_ms, location,
                                   raw_bytes, available_bytes, total_bytes,
                                   total_count, success_count, failure_count,
                                   processing_index, is_processing)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(task.op_kind.as_str())
            .bind(task.target_kind.as_str())
            .bind(task.start_ms)
            .bind(task.end_ms)
            .bind(&location)
            .bind(task.raw_bytes as i64)
            .bind(task.available_bytes as i64)
            .bind(task.total_bytes as i64)
            .bind(task.total_count as i64)
            .bind(task.success_count as i64)
            .bind(task.failure_count as i64)
            .bind(task.processing_index as i64)
            .bind(task.is_processing)
            .execute(&self.pool)
            .await?;
            task.id = result.last_insert_rowid();
        } else {
            sqlx::query(
                r#"
                UPDATE tasks
                SET start_ms = ?, end_ms = ?, location = ?,
                    raw_bytes = ?, available_bytes = ?, total_bytes = ?,
                    total_count = ?, success_count = ?, failure_count = ?,
                    processing_index = ?, is_processing = ?
                WHERE id = ?
                "#,
            )
            .bind(task.start_ms)
            .bind(task.end_ms)
            .bind(&location)
            .bind(task.raw_bytes as i64)
            .bind(task.available_bytes as i64)
            .bind(task.total_bytes as i64)
            .bind(task.total_count as i64)
            .bind(task.success_count as i64)
            .bind(task.failure_count as i64)
            .bind(task.processing_index as i64)
            .bind(task.is_processing)
            .bind(task.id)
            .execute(&self.pool)
            .await?;
        }

        Ok(task.id)
    }

    pub async fn task(&self, id: i64) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ? LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(task_from_row).transpose()
    }

    pub async fn tasks(&self, limit: u32) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(task_from_row).collect()
    }

    pub async fn upsert_item(&self, item: &mut BackupItem) -> Result<i64> {
        let selection =
            serde_json::to_string(&item.selection).map_err(|e| Error::InvalidConfig {
                message: format!("serialize item selection failed: {e}"),
            })?;
        let path = path_to_utf8(&item.path)?;

        if item.id == 0 {
            let result = sqlx::query(
                r#"
                INSERT INTO items (op_kind, target_kind, name, label, path,
                                   activated, compression, selection)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (op_kind, target_kind, name) DO UPDATE
                SET label = excluded.label, path = excluded.path,
                    activated = excluded.activated, compression = excluded.compression,
                    selection = excluded.selection
                "#,
            )
            .bind(item.op_kind.as_str())
            .bind(item.target_kind.as_str())
            .bind(&item.name)
            .bind(&item.label)
            .bind(&path)
            .bind(item.activated)
            .bind(item.compression.as_str())
            .bind(&selection)
            .execute(&self.pool)
            .await?;
            item.id = result.last_insert_rowid();
        } else {
            sqlx::query(
                r#"
                UPDATE items
                SET label = ?, path = ?, activated = ?, compression = ?, selection = ?
                WHERE id = ?
                "#,
            )
            .bind(&item.label)
            .bind(&path)
            .bind(item.activated)
            .bind(item.compression.as_str())
            .bind(&selection)
            .bind(item.id)
            .execute(&self.pool)
            .await?;
        }

        Ok(item.id)
    }

    /// Activated selection rows, in insertion order.
    pub async fn activated_items(
        &self,
        op_kind: OpKind,
        target_kind: TargetKind,
    ) -> Result<Vec<BackupItem>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM items
            WHERE op_kind = ? AND target_kind = ? AND activated = 1
            ORDER BY id
            "#,
        )
        .bind(op_kind.as_str())
        .bind(target_kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(item_from_row).collect()
    }

    pub async fn clear_activated(&self, op_kind: OpKind, target_kind: TargetKind) -> Result<()> {
        sqlx::query("UPDATE items SET activated = 0 WHERE op_kind = ? AND target_kind = ?")
            .bind(op_kind.as_str())
            .bind(target_kind.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_item_op(&self, op: &mut ItemOperation) -> Result<i64> {
        op.updated_ms = now_unix_ms();
        let slots = serde_json::to_string(&op.slots).map_err(|e| Error::InvalidConfig {
            message: format!("serialize item op slots failed: {e}"),
        })?;

        if op.id == 0 {
            let result = sqlx::query(
                r#"
                INSERT INTO item_operations (task_id, item_name, label, updated_ms, slots)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(op.task_id)
            .bind(&op.item_name)
            .bind(&op.label)
            .bind(op.updated_ms)
            .bind(&slots)
            .execute(&self.pool)
            .await?;
            op.id = result.last_insert_rowid();
        } else {
            sqlx::query(
                r#"
                UPDATE item_operations
                SET item_name = ?, label = ?, updated_ms = ?, slots = ?
                WHERE id = ?
                "#,
            )
            .bind(&op.item_name)
            .bind(&op.label)
            .bind(op.updated_ms)
            .bind(&slots)
            .bind(op.id)
            .execute(&self.pool)
            .await?;
        }

        Ok(op.id)
    }

    pub async fn items_for_task(&self, task_id: i64) -> Result<Vec<ItemOperation>> {
        let rows = sqlx::query("SELECT * FROM item_operations WHERE task_id = ? ORDER BY id")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(item_op_from_row).collect()
    }

    pub async fn count_item_ops(&self, task_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as n FROM item_operations WHERE task_id = ?")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// Most recently touched item operation; drives "currently active item"
    /// display.
    pub async fn last_touched_item_op(&self, task_id: i64) -> Result<Option<ItemOperation>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM item_operations
            WHERE task_id = ?
            ORDER BY updated_ms DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(item_op_from_row).transpose()
    }

    pub async fn upsert_processing_info(&self, info: &mut ProcessingInfo) -> Result<i64> {
        if info.id == 0 {
            let result = sqlx::query(
                r#"
                INSERT INTO processing_infos (task_id, phase, step, state, progress, log)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(info.task_id)
            .bind(info.phase.as_str())
            .bind(&info.step)
            .bind(info.state.as_str())
            .bind(info.progress)
            .bind(&info.log)
            .execute(&self.pool)
            .await?;
            info.id = result.last_insert_rowid();
        } else {
            sqlx::query(
                r#"
                UPDATE processing_infos
                SET step = ?, state = ?, progress = ?, log = ?
                WHERE id = ?
                "#,
            )
            .bind(&info.step)
            .bind(info.state.as_str())
            .bind(info.progress)
            .bind(&info.log)
            .bind(info.id)
            .execute(&self.pool)
            .await?;
        }

        Ok(info.id)
    }

    pub async fn processing_info_for_task(
        &self,
        task_id: i64,
        phase: ProcessingPhase,
    ) -> Result<Vec<ProcessingInfo>> {
        let rows =
            sqlx::query("SELECT * FROM processing_infos WHERE task_id = ? AND phase = ? ORDER BY id")
                .bind(task_id)
                .bind(phase.as_str())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(processing_info_from_row).collect()
    }
}

fn task_from_row(row: SqliteRow) -> Result<Task> {
    let op_kind: String = row.get("op_kind");
    let target_kind: String = row.get("target_kind");
    let location: String = row.get("location");
    let location: LocationDescriptor =
        serde_json::from_str(&location).map_err(|e| Error::InvalidConfig {
            message: format!("invalid task location json: {e}"),
        })?;

    Ok(Task {
        id: row.get("id"),
        op_kind: OpKind::parse(&op_kind)?,
        target_kind: TargetKind::parse(&target_kind)?,
        start_ms: row.get("start_ms"),
        end_ms: row.get("end_ms"),
        location,
        raw_bytes: row.get::<i64, _>("raw_bytes") as u64,
        available_bytes: row.get::<i64, _>("available_bytes") as u64,
        total_bytes: row.get::<i64, _>("total_bytes") as u64,
        total_count: row.get::<i64, _>("total_count") as u32,
        success_count: row.get::<i64, _>("success_count") as u32,
        failure_count: row.get::<i64, _>("failure_count") as u32,
        processing_index: row.get::<i64, _>("processing_index") as u32,
        is_processing: row.get("is_processing"),
    })
}

fn item_from_row(row: SqliteRow) -> Result<BackupItem> {
    let op_kind: String = row.get("op_kind");
    let target_kind: String = row.get("target_kind");
    let compression: String = row.get("compression");
    let selection: String = row.get("selection");
    let selection: SlotSelection =
        serde_json::from_str(&selection).map_err(|e| Error::InvalidConfig {
            message: format!("invalid item selection json: {e}"),
        })?;
    let path: String = row.get("path");

    Ok(BackupItem {
        id: row.get("id"),
        op_kind: OpKind::parse(&op_kind)?,
        target_kind: TargetKind::parse(&target_kind)?,
        name: row.get("name"),
        label: row.get("label"),
        path: path.into(),
        activated: row.get("activated"),
        compression: CompressionKind::parse(&compression)?,
        selection,
    })
}

fn item_op_from_row(row: SqliteRow) -> Result<ItemOperation> {
    let slots: String = row.get("slots");
    let slots = serde_json::from_str(&slots).map_err(|e| Error::InvalidConfig {
        message: format!("invalid item op slots json: {e}"),
    })?;

    Ok(ItemOperation {
        id: row.get("id"),
        task_id: row.get("task_id"),
        item_name: row.get("item_name"),
        label: row.get("label"),
        updated_ms: row.get("updated_ms"),
        slots,
    })
}

fn processing_info_from_row(row: SqliteRow) -> Result<ProcessingInfo> {
    let phase: String = row.get("phase");
    let state: String = row.get("state");

    Ok(ProcessingInfo {
        id: row.get("id"),
        task_id: row.get("task_id"),
        phase: ProcessingPhase::parse(&phase)?,
        step: row.get("step"),
        state: OperationState::parse(&state)?,
        progress: row.get("progress"),
        log: row.get("log"),
    })
}

fn path_to_utf8(path: &Path) -> Result<String> {
    path.to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| Error::NonUtf8Path {
            path: path.to_path_buf(),
        })
}
