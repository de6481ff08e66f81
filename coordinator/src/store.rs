//! In-memory metadata store for jobs, tasks and artifacts.
//!
//! Each map sits behind its own mutex so every status transition is one
//! serialized write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use common::{Artifact, Error, Job, JobId, Result, Task, TaskId, TaskStatus};

#[derive(Clone, Default)]
pub struct Store {
    jobs: Arc<Mutex<HashMap<JobId, Job>>>,
    tasks: Arc<Mutex<TaskTable>>,
    artifacts: Arc<Mutex<HashMap<String, Artifact>>>,
}

#[derive(Default)]
struct TaskTable {
    by_id: HashMap<TaskId, Task>,
    // orden de creación por job
    by_job: HashMap<JobId, Vec<TaskId>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /* ---------------- jobs ---------------- */

    pub fn insert_job(&self, job: Job) {
        lock(&self.jobs).insert(job.id.clone(), job);
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        lock(&self.jobs).get(id).cloned()
    }

    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = lock(&self.jobs).values().cloned().collect();
        jobs.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub fn set_job_end_time(&self, id: &str) -> Result<()> {
        let mut jobs = lock(&self.jobs);
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("job {id}")))?;
        job.end_time = Some(Utc::now());
        Ok(())
    }

    /* ---------------- tasks ---------------- */

    pub fn create_tasks(&self, tasks: &[Task]) {
        let mut table = lock(&self.tasks);
        for t in tasks {
            table.by_job.entry(t.job_id.clone()).or_default().push(t.id.clone());
            table.by_id.insert(t.id.clone(), t.clone());
        }
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        lock(&self.tasks).by_id.get(id).cloned()
    }

    pub fn tasks_by_job(&self, job_id: &str) -> Vec<Task> {
        let table = lock(&self.tasks);
        table
            .by_job
            .get(job_id)
            .map(|ids| ids.iter().filter_map(|id| table.by_id.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let mut table = lock(&self.tasks);
        let task = table
            .by_id
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("task {id}")))?;
        task.status = status;
        Ok(())
    }

    pub fn set_task_end_time(&self, id: &str) -> Result<()> {
        let mut table = lock(&self.tasks);
        let task = table
            .by_id
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("task {id}")))?;
        task.end_time = Some(Utc::now());
        Ok(())
    }

    /* ---------------- artifacts ---------------- */

    pub fn upsert_artifact(&self, artifact: Artifact) {
        lock(&self.artifacts).insert(artifact.name.clone(), artifact);
    }

    pub fn artifact(&self, name: &str) -> Option<Artifact> {
        lock(&self.artifacts).get(name).cloned()
    }

    pub fn artifacts(&self) -> Vec<Artifact> {
        let mut all: Vec<Artifact> = lock(&self.artifacts).values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn remove_artifact(&self, name: &str) -> Option<Artifact> {
        lock(&self.artifacts).remove(name)
    }
}
