use common::{Artifact, Credentials, Error, InputData, Job, JobRequest, OutputLocation, Result, Task};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::scheduler::JobScheduler;
use crate::store::Store;

/// A submitted job and the background run scheduling it.
pub struct JobHandle {
    pub job: Job,
    pub handle: JoinHandle<Result<Vec<Task>>>,
}

/// Job metadata plus submission. Scheduling runs in the background; callers
/// poll the store for progress.
#[derive(Clone)]
pub struct JobManager {
    store: Store,
    scheduler: JobScheduler,
}

impl JobManager {
    pub fn new(store: Store, scheduler: JobScheduler) -> Self {
        Self { store, scheduler }
    }

    pub fn persist_job(&self, req: &JobRequest) -> Job {
        let job = Job::new(
            req.n_reducers,
            InputData::whole(req.input_path.clone(), req.input_type.clone()),
            OutputLocation {
                location: req.output_path.clone(),
                use_ssl: req.use_ssl,
            },
        );
        self.store.insert_job(job.clone());
        info!("job {} persisted ({} reducers, input {})", job.id, job.n_reducers, req.input_path);
        job
    }

    pub fn submit(
        &self,
        job: Job,
        programs: [Artifact; 2],
        creds: [Credentials; 2],
        split_size: Option<u64>,
    ) -> JobHandle {
        let scheduler = self.scheduler.clone();
        let store = self.store.clone();
        let scheduled = job.clone();
        let handle = tokio::spawn(async move {
            match scheduler.schedule_job(&scheduled, &programs, &creds, split_size).await {
                Ok(tasks) => {
                    store.set_job_end_time(&scheduled.id)?;
                    info!("job {} finished ({} tasks)", scheduled.id, tasks.len());
                    Ok(tasks)
                }
                Err(e) => {
                    error!("job {} failed: {}", scheduled.id, e);
                    Err(e)
                }
            }
        });
        JobHandle { job, handle }
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.store.jobs()
    }

    pub fn job(&self, id: &str) -> Result<Job> {
        self.store
            .job(id)
            .ok_or_else(|| Error::not_found(format!("job {id}")))
    }

    pub fn tasks(&self, job_id: &str) -> Result<Vec<Task>> {
        self.job(job_id)?;
        Ok(self.store.tasks_by_job(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{ArtifactManager, DEFAULT_ARTIFACT_TYPE};
    use crate::config::Config;
    use crate::testing::{Behaviour, CountingPods, FakeWorkers, FixedSize};
    use std::collections::HashMap;
    use std::sync::Arc;

    async fn manager(workers: FakeWorkers) -> (JobManager, [Artifact; 2]) {
        let dir = std::env::temp_dir().join(format!("jobs_test_{}", uuid::Uuid::new_v4()));
        let store = Store::new();
        let artifacts = ArtifactManager::new(store.clone(), dir);
        let map = artifacts.create_artifact("m", DEFAULT_ARTIFACT_TYPE, b"m").await.unwrap();
        let reduce = artifacts.create_artifact("r", DEFAULT_ARTIFACT_TYPE, b"r").await.unwrap();
        let scheduler = JobScheduler::new(
            Arc::new(Config::from_lookup(false, |_| None)),
            store.clone(),
            artifacts,
            Arc::new(CountingPods::default()),
            Arc::new(workers),
            Arc::new(FixedSize(100)),
        );
        (JobManager::new(store, scheduler), [map, reduce])
    }

    fn request() -> JobRequest {
        let creds = Credentials {
            username: "u".into(),
            password: "p".into(),
        };
        JobRequest {
            n_reducers: 1,
            input_path: "http://minio:9000/in/a.txt".into(),
            input_type: "file/txt".into(),
            output_path: "http://minio:9000/out".into(),
            use_ssl: false,
            mapper_name: "m".into(),
            reducer_name: "r".into(),
            input_storage_credentials: creds.clone(),
            output_storage_credentials: creds,
            split_size: Some(40),
        }
    }

    #[tokio::test]
    async fn successful_run_sets_end_time() {
        let (mgr, programs) = manager(FakeWorkers::default()).await;
        let req = request();
        let job = mgr.persist_job(&req);
        assert!(!mgr.job(&job.id).unwrap().is_finished());

        let creds = [req.input_storage_credentials.clone(), req.output_storage_credentials.clone()];
        let submitted = mgr.submit(job, programs, creds, req.split_size);
        let tasks = submitted.handle.await.unwrap().unwrap();
        // 100 bytes en splits de 40: 3 mappers y 1 reducer
        assert_eq!(tasks.len(), 4);
        assert!(mgr.job(&submitted.job.id).unwrap().is_finished());
        assert_eq!(mgr.tasks(&submitted.job.id).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn failed_run_leaves_job_open() {
        let req = request();
        let job = Job::new(
            1,
            InputData::whole(req.input_path.clone(), req.input_type.clone()),
            OutputLocation {
                location: req.output_path.clone(),
                use_ssl: false,
            },
        );
        let workers = FakeWorkers {
            behaviour: HashMap::from([(format!("{}-r-0", job.id), Behaviour::Fail)]),
            ..Default::default()
        };
        let (mgr, programs) = manager(workers).await;
        mgr.store.insert_job(job.clone());

        let creds = [req.input_storage_credentials.clone(), req.output_storage_credentials.clone()];
        let submitted = mgr.submit(job, programs, creds, req.split_size);
        assert!(submitted.handle.await.unwrap().is_err());
        assert!(!mgr.job(&submitted.job.id).unwrap().is_finished());
    }

    #[tokio::test]
    async fn tasks_of_unknown_job_is_not_found() {
        let (mgr, _) = manager(FakeWorkers::default()).await;
        assert_eq!(mgr.tasks("j-missing").unwrap_err().code(), common::Code::NotFound);
    }
}
