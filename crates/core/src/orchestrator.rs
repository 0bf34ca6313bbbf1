use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::DeviceLayout;
use crate::device::DeviceEnv;
use crate::device::EnvSnapshot;
use crate::executor::{ExecContext, dir_size, execute_item};
use crate::model::{
    OpKind, OperationState, ProcessingInfo, ProcessingPhase, TargetKind, Task, now_unix_ms,
};
use crate::store::Store;
use crate::strategy::StorageBackend;
use crate::tar_stream::PrivilegedRunner;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub op_kind: OpKind,
    pub target_kind: TargetKind,
    pub layout: DeviceLayout,
    /// Clear the activated flags of consumed selection rows when the task
    /// finishes.
    pub reset_selection: bool,
}

/// Ordered task event stream; consumed by exactly one observer per task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Progress {
        phase: String,
        current_index: u32,
        total: u32,
        item_label: String,
    },
    Finished {
        elapsed_ms: u64,
        success_count: u32,
        failure_count: u32,
    },
}

/// Owns one task's lifecycle: IDLE → PREPROCESSING → PROCESSING →
/// POST_PROCESSING → DONE, strictly forward. One mutual-exclusion lock guards
/// every phase body; each phase is additionally launch-guarded so repeated
/// invocations (UI recompositions, double taps) are no-ops.
pub struct TaskOrchestrator {
    store: Store,
    backend: Arc<dyn StorageBackend>,
    env: Arc<dyn DeviceEnv>,
    runner: PrivilegedRunner,
    config: OrchestratorConfig,

    phase_lock: Mutex<()>,
    task: Mutex<Task>,
    snapshot: Mutex<Option<EnvSnapshot>>,

    initialized: AtomicBool,
    pre_launched: AtomicBool,
    processing_launched: AtomicBool,
    post_launched: AtomicBool,

    events_tx: mpsc::UnboundedSender<TaskEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<TaskEvent>>>,
}

impl TaskOrchestrator {
    pub fn new(
        store: Store,
        backend: Arc<dyn StorageBackend>,
        env: Arc<dyn DeviceEnv>,
        runner: PrivilegedRunner,
        config: OrchestratorConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = Task::new(config.op_kind, config.target_kind, backend.location());
        Self {
            store,
            backend,
            env,
            runner,
            config,
            phase_lock: Mutex::new(()),
            task: Mutex::new(task),
            snapshot: Mutex::new(None),
            initialized: AtomicBool::new(false),
            pre_launched: AtomicBool::new(false),
            processing_launched: AtomicBool::new(false),
            post_launched: AtomicBool::new(false),
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
        }
    }

    /// The event receiver; `None` after the first call.
    pub fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<TaskEvent>> {
        self.events_rx
            .lock()
            .expect("event receiver mutex poisoned")
            .take()
    }

    /// Create the task row; safe to call more than once, returns the task id.
    pub async fn initialize(&self) -> Result<i64> {
        let _guard = self.phase_lock.lock().await;
        self.init_task_row().await
    }

    pub async fn task_snapshot(&self) -> Task {
        self.task.lock().await.clone()
    }

    pub async fn preprocessing(&self) -> Result<()> {
        if self.pre_launched.swap(true, Ordering::SeqCst) {
            debug!(event = "phase.duplicate", phase = "preprocessing", "phase.duplicate");
            return Ok(());
        }
        let _guard = self.phase_lock.lock().await;
        let task_id = self.init_task_row().await?;
        debug!(event = "phase.start", phase = "preprocessing", "phase.start");

        {
            let mut task = self.task.lock().await;
            task.start_ms = now_unix_ms();
            self.store.upsert_task(&mut task).await?;
        }

        match self.config.op_kind {
            OpKind::Backup => {
                self.run_substep(
                    task_id,
                    ProcessingPhase::Preprocessing,
                    "snapshot device environment",
                    || async {
                        let snapshot = self.env.snapshot().await?;
                        let log = format!(
                            "input method: {}; accessibility services: {}",
                            snapshot.input_method, snapshot.accessibility_services
                        );
                        *self.snapshot.lock().await = Some(snapshot);
                        Ok(log)
                    },
                )
                .await?;

                self.run_substep(
                    task_id,
                    ProcessingPhase::Preprocessing,
                    "create target directories",
                    || async {
                        let dir = match self.config.target_kind {
                            TargetKind::Packages => self.backend.target_root_dir().join("apps"),
                            TargetKind::Media => self.backend.target_root_dir().join("media"),
                        };
                        tokio::fs::create_dir_all(&dir).await?;
                        Ok(format!("created {}", dir.display()))
                    },
                )
                .await?;
            }
            OpKind::Restore => {
                self.run_substep(
                    task_id,
                    ProcessingPhase::Preprocessing,
                    "grant install permission",
                    || async {
                        self.env.grant_install_permission().await?;
                        Ok("granted".to_string())
                    },
                )
                .await?;
            }
        }

        debug!(event = "phase.finish", phase = "preprocessing", "phase.finish");
        Ok(())
    }

    pub async fn processing(&self) -> Result<()> {
        if self.processing_launched.swap(true, Ordering::SeqCst) {
            debug!(event = "phase.duplicate", phase = "processing", "phase.duplicate");
            return Ok(());
        }
        let _guard = self.phase_lock.lock().await;
        self.init_task_row().await?;
        debug!(event = "phase.start", phase = "processing", "phase.start");

        let capacity = self.backend.accessible_capacity().unwrap_or_else(|e| {
            warn!(
                event = "capacity.read_failed",
                error = %e,
                "capacity.read_failed"
            );
            Default::default()
        });
        let raw_bytes = dir_size(self.backend.target_root_dir()).await;

        let items = self
            .store
            .activated_items(self.config.op_kind, self.config.target_kind)
            .await?;
        let total = items.len() as u32;
        info!(
            event = "processing.items",
            total,
            op_kind = self.config.op_kind.as_str(),
            target_kind = self.config.target_kind.as_str(),
            "processing.items"
        );

        {
            let mut task = self.task.lock().await;
            task.raw_bytes = raw_bytes;
            task.available_bytes = capacity.available_bytes;
            task.total_bytes = capacity.total_bytes;
            task.total_count = total;
            self.store.upsert_task(&mut task).await?;
        }

        let phase_label = self.config.op_kind.as_str().to_string();
        for (index, item) in items.iter().enumerate() {
            self.emit(TaskEvent::Progress {
                phase: phase_label.clone(),
                current_index: index as u32,
                total,
                item_label: item.label.clone(),
            });

            let task_view = self.task.lock().await.clone();
            let ctx = ExecContext {
                store: &self.store,
                backend: self.backend.as_ref(),
                runner: &self.runner,
                layout: &self.config.layout,
                task: &task_view,
            };
            let op = execute_item(&ctx, item).await?;

            let mut task = self.task.lock().await;
            if op.is_success() {
                task.success_count += 1;
            } else {
                task.failure_count += 1;
            }
            task.processing_index += 1;
            self.store.upsert_task(&mut task).await?;
        }

        debug!(event = "phase.finish", phase = "processing", "phase.finish");
        Ok(())
    }

    pub async fn post_processing(&self) -> Result<()> {
        if self.post_launched.swap(true, Ordering::SeqCst) {
            debug!(event = "phase.duplicate", phase = "post_processing", "phase.duplicate");
            return Ok(());
        }
        let _guard = self.phase_lock.lock().await;
        let task_id = self.init_task_row().await?;
        debug!(event = "phase.start", phase = "post_processing", "phase.start");

        match self.config.op_kind {
            OpKind::Backup => {
                self.run_substep(
                    task_id,
                    ProcessingPhase::PostProcessing,
                    "restore device environment",
                    || async {
                        match self.snapshot.lock().await.take() {
                            Some(snapshot) => {
                                self.env.restore(&snapshot).await?;
                                Ok(format!(
                                    "restored input method: {}; accessibility services: {}",
                                    snapshot.input_method, snapshot.accessibility_services
                                ))
                            }
                            None => Ok("no environment snapshot captured".to_string()),
                        }
                    },
                )
                .await?;
            }
            OpKind::Restore => {
                self.run_substep(
                    task_id,
                    ProcessingPhase::PostProcessing,
                    "clear staging files",
                    || async {
                        if !self.backend.is_remote() {
                            return Ok("nothing to clear".to_string());
                        }
                        let staging = self.backend.target_root_dir().to_path_buf();
                        tokio::fs::remove_dir_all(&staging).await?;
                        tokio::fs::create_dir_all(&staging).await?;
                        Ok(format!("cleared {}", staging.display()))
                    },
                )
                .await?;
            }
        }

        if self.config.reset_selection {
            self.store
                .clear_activated(self.config.op_kind, self.config.target_kind)
                .await?;
        }

        let (elapsed_ms, success_count, failure_count) = {
            let mut task = self.task.lock().await;
            task.end_ms = now_unix_ms();
            task.is_processing = false;
            self.store.upsert_task(&mut task).await?;
            (
                task.end_ms.saturating_sub(task.start_ms).max(0) as u64,
                task.success_count,
                task.failure_count,
            )
        };

        self.emit(TaskEvent::Finished {
            elapsed_ms,
            success_count,
            failure_count,
        });
        info!(
            event = "task.finish",
            task_id,
            elapsed_ms,
            success_count,
            failure_count,
            "task.finish"
        );
        debug!(event = "phase.finish", phase = "post_processing", "phase.finish");
        Ok(())
    }

    /// Callers must hold the phase lock.
    async fn init_task_row(&self) -> Result<i64> {
        let mut task = self.task.lock().await;
        if !self.initialized.load(Ordering::SeqCst) {
            self.store.upsert_task(&mut task).await?;
            self.initialized.store(true, Ordering::SeqCst);
            info!(
                event = "task.create",
                task_id = task.id,
                op_kind = task.op_kind.as_str(),
                target_kind = task.target_kind.as_str(),
                "task.create"
            );
        }
        Ok(task.id)
    }

    /// Run one named sub-step; a failure is recorded on its row and the phase
    /// continues with the remaining sub-steps.
    async fn run_substep<F, Fut>(
        &self,
        task_id: i64,
        phase: ProcessingPhase,
        step: &str,
        run: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let mut record = ProcessingInfo::new(task_id, phase, step);
        record.state = OperationState::Processing;
        self.store.upsert_processing_info(&mut record).await?;

        match run().await {
            Ok(log) => {
                record.state = OperationState::Done;
                record.progress = 1.0;
                record.log = log;
            }
            Err(e) => {
                warn!(
                    event = "substep.failed",
                    phase = phase.as_str(),
                    step,
                    error = %e,
                    "substep.failed"
                );
                record.state = OperationState::Error;
                record.progress = 1.0;
                record.log = e.to_string();
            }
        }
        self.store.upsert_processing_info(&mut record).await?;
        Ok(())
    }

    fn emit(&self, event: TaskEvent) {
        let _ = self.events_tx.send(event);
    }
}
