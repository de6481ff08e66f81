use std::sync::Arc;

use common::{FileData, Result, TaskPayload, TaskStatus, TaskStatusInfo};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::algorithm::{algorithm_for, WorkerAlgorithm};
use crate::config::Config;

/// Runs one task at a time through fetch, handle and persist, reporting every
/// state transition on a channel.
pub struct Worker {
    config: Arc<Config>,
}

impl Worker {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Drives `task` to a terminal state. Status updates go to `updates`; a
    /// receiver that went away does not stop the task.
    pub async fn compute(&self, task: TaskPayload, updates: mpsc::Sender<TaskStatusInfo>) -> TaskStatus {
        report(&updates, TaskStatusInfo::new(TaskStatus::Idle)).await;

        let mut algorithm = algorithm_for(task.task_type, self.config.clone());
        info!("tarea {} ({}) aceptada", task.id, task.task_type);
        report(&updates, TaskStatusInfo::new(TaskStatus::InProgress)).await;

        match run(algorithm.as_mut(), &task).await {
            Ok(files) => {
                info!("terminé tarea {} con {} archivos", task.id, files.len());
                report(&updates, TaskStatusInfo::completed(files)).await;
                TaskStatus::Completed
            }
            Err(e) => {
                error!("error procesando tarea {}: {}", task.id, e);
                report(&updates, TaskStatusInfo::failed(e.to_string())).await;
                TaskStatus::Failed
            }
        }
    }
}

async fn run(algorithm: &mut dyn WorkerAlgorithm, task: &TaskPayload) -> Result<Vec<FileData>> {
    // 1) traer entrada
    let inputs = algorithm.fetch_input_data(task).await?;
    // 2) procesar
    algorithm.handle_task(task, inputs).await?;
    // 3) persistir salida
    algorithm.persist_output_data(task).await
}

async fn report(updates: &mpsc::Sender<TaskStatusInfo>, status: TaskStatusInfo) {
    if updates.send(status).await.is_err() {
        warn!("receptor de estados cerrado, descarto la actualización");
    }
}
