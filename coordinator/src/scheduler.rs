//! Job Scheduler: splits the input, runs the map phase, then the reduce
//! phase, persisting every task status transition on the way.

use std::sync::Arc;

use chrono::Utc;
use common::registrar::endpoint_url;
use common::retry::{retry, Backoff};
use common::task::{partition_path, task_id};
use common::{
    Artifact, Credentials, Error, FileData, InputData, Job, ObjectLocation, ObjectRegistrar,
    OutputStorageInfo, Program, Result, S3Registrar, Task, TaskPayload, TaskStatus, TaskType,
};
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::artifacts::ArtifactManager;
use crate::config::Config;
use crate::dispatch::{StatusStream, WorkerClient};
use crate::pods::{worker_address, PodProvisioner, PodSpec};
use crate::store::Store;

/// Input type recorded for the partition files a reducer reads.
pub const PARTITION_INPUT_TYPE: &str = "file/json";

/// Builds the registrar used to size a job's input object.
pub trait RegistrarFactory: Send + Sync {
    fn registrar(&self, location: &ObjectLocation, creds: &Credentials) -> Result<Arc<dyn ObjectRegistrar>>;
}

/// S3 registrars for the endpoint named in the input path. In dev mode the
/// endpoint host is replaced by `localhost` (port-forwarded object store).
#[derive(Debug, Clone, Copy)]
pub struct S3Registrars {
    pub dev_mode: bool,
}

impl RegistrarFactory for S3Registrars {
    fn registrar(&self, location: &ObjectLocation, creds: &Credentials) -> Result<Arc<dyn ObjectRegistrar>> {
        let endpoint = if self.dev_mode {
            dev_endpoint(&location.endpoint)
        } else {
            location.endpoint.clone()
        };
        Ok(Arc::new(S3Registrar::new(&endpoint_url(&endpoint, location.use_ssl), creds)))
    }
}

fn dev_endpoint(endpoint: &str) -> String {
    let (host, rest) = match endpoint.find('/') {
        Some(i) => endpoint.split_at(i),
        None => (endpoint, ""),
    };
    match host.rsplit_once(':') {
        Some((_, port)) => format!("localhost:{port}{rest}"),
        None => endpoint.to_string(),
    }
}

/// Contiguous half-open ranges of at most `split_size` bytes covering
/// `[0, size)`.
pub fn compute_splits(path: &str, input_type: &str, size: u64, split_size: u64) -> Result<Vec<InputData>> {
    if split_size == 0 {
        return Err(Error::invalid_argument("split size must be greater than 0"));
    }
    if size == 0 {
        return Err(Error::invalid_argument(format!("input {path} is empty")));
    }
    let mut splits = Vec::with_capacity(size.div_ceil(split_size) as usize);
    let mut start = 0;
    while start < size {
        let end = (start + split_size).min(size);
        splits.push(InputData::split(path, input_type, start, end));
        start = end;
    }
    Ok(splits)
}

#[derive(Clone)]
pub struct JobScheduler {
    config: Arc<Config>,
    store: Store,
    artifacts: ArtifactManager,
    pods: Arc<dyn PodProvisioner>,
    workers: Arc<dyn WorkerClient>,
    registrars: Arc<dyn RegistrarFactory>,
}

impl JobScheduler {
    pub fn new(
        config: Arc<Config>,
        store: Store,
        artifacts: ArtifactManager,
        pods: Arc<dyn PodProvisioner>,
        workers: Arc<dyn WorkerClient>,
        registrars: Arc<dyn RegistrarFactory>,
    ) -> Self {
        Self {
            config,
            store,
            artifacts,
            pods,
            workers,
            registrars,
        }
    }

    /// Runs `job` to completion: `programs` and `creds` are `[map, reduce]`.
    /// Returns every mapper and reducer task, or the first error.
    pub async fn schedule_job(
        &self,
        job: &Job,
        programs: &[Artifact; 2],
        creds: &[Credentials; 2],
        split_size: Option<u64>,
    ) -> Result<Vec<Task>> {
        if job.n_reducers == 0 {
            return Err(Error::invalid_argument("the number of reducers must be greater than 0"));
        }

        // 1) splits
        let splits = self.generate_map_input_splits(job, &creds[0], split_size).await?;
        let n_mappers = splits.len();

        // 2) fase map
        let inputs = splits.into_iter().map(|s| vec![s]).collect();
        let map_tasks = self.create_worker_tasks(job, TaskType::Mapper, &programs[0], inputs).await?;
        self.coordinate_map_tasks(job, &map_tasks, &programs[0], &creds[0]).await?;

        // 3) fase reduce, solo cuando todos los mappers terminaron
        let dir = &self.config.intermediate_files_loc;
        let inputs = (0..job.n_reducers as usize)
            .map(|r| {
                (0..n_mappers)
                    .map(|m| InputData::whole(partition_path(dir, &job.id, m, r), PARTITION_INPUT_TYPE))
                    .collect()
            })
            .collect();
        let reduce_tasks = self.create_worker_tasks(job, TaskType::Reducer, &programs[1], inputs).await?;
        self.coordinate_reduce_tasks(job, &reduce_tasks, &programs[1], &creds[1]).await?;

        Ok(self.store.tasks_by_job(&job.id))
    }

    async fn generate_map_input_splits(
        &self,
        job: &Job,
        creds: &Credentials,
        split_size: Option<u64>,
    ) -> Result<Vec<InputData>> {
        let path = &job.input_data.path;
        let location = ObjectLocation::parse(path).inspect_err(|e| {
            error!("wrong input data location for job {}: {}", job.id, e);
        })?;
        let registrar = self.registrars.registrar(&location, creds)?;
        let size = registrar.get_file_size(&location.bucket, &location.key).await?;

        let split_size = split_size.unwrap_or(self.config.split_size);
        let splits = compute_splits(path, &job.input_data.input_type, size, split_size)?;
        info!(
            "input file {} of size {} B generated {} splits of maximum size {}",
            path,
            size,
            splits.len(),
            split_size
        );
        Ok(splits)
    }

    /// One pod and one `scheduled` task per entry of `inputs`.
    async fn create_worker_tasks(
        &self,
        job: &Job,
        task_type: TaskType,
        program: &Artifact,
        inputs: Vec<Vec<InputData>>,
    ) -> Result<Vec<Task>> {
        let ids: Vec<String> = (0..inputs.len()).map(|i| task_id(&job.id, task_type, i)).collect();
        let specs: Vec<PodSpec> = ids
            .iter()
            .map(|id| PodSpec::for_task(&self.config, &job.id, id, task_type, &program.name))
            .collect();
        let pod_names = self.pods.create_pods(&specs).await?;
        if pod_names.len() != ids.len() {
            return Err(Error::internal(format!(
                "asked for {} {} pods, got {}",
                ids.len(),
                task_type,
                pod_names.len()
            )));
        }

        let now = Utc::now();
        let tasks: Vec<Task> = ids
            .into_iter()
            .zip(pod_names)
            .zip(inputs)
            .map(|((id, pod_name), input_data)| Task {
                id,
                job_id: job.id.clone(),
                task_type,
                status: TaskStatus::Scheduled,
                program: program.name.clone(),
                input_data,
                pod_name,
                start_time: now,
                end_time: None,
            })
            .collect();
        self.store.create_tasks(&tasks);
        info!("{} {} tasks scheduled for job {}", tasks.len(), task_type, job.id);
        Ok(tasks)
    }

    async fn load_program(&self, program: &Artifact) -> Result<Program> {
        let content = self.artifacts.content(&program.name).await?;
        Ok(Program {
            name: program.name.clone(),
            content,
        })
    }

    async fn coordinate_map_tasks(
        &self,
        job: &Job,
        tasks: &[Task],
        program: &Artifact,
        creds: &Credentials,
    ) -> Result<()> {
        let program = self.load_program(program).await?;
        let dispatches = tasks
            .iter()
            .enumerate()
            .map(|(i, task)| {
                // el shard siguiente deja al mapper terminar una línea cortada al final
                let mut input_data: Vec<FileData> = task.input_data.iter().map(FileData::from).collect();
                if let Some(next) = tasks.get(i + 1) {
                    input_data.extend(next.input_data.iter().map(FileData::from));
                }
                let payload = TaskPayload {
                    id: task.id.clone(),
                    task_type: TaskType::Mapper,
                    n_reducers: Some(job.n_reducers),
                    program: Some(program.clone()),
                    input_data,
                    object_storage_creds: Some(creds.clone()),
                    output_storage_info: None,
                };
                (task.pod_name.clone(), payload)
            })
            .collect();
        self.run_phase(dispatches).await
    }

    async fn coordinate_reduce_tasks(
        &self,
        job: &Job,
        tasks: &[Task],
        program: &Artifact,
        creds: &Credentials,
    ) -> Result<()> {
        let program = self.load_program(program).await?;
        let output = OutputStorageInfo {
            location: job.output_location.location.clone(),
            use_ssl: Some(job.output_location.use_ssl),
        };
        let dispatches = tasks
            .iter()
            .map(|task| {
                let payload = TaskPayload {
                    id: task.id.clone(),
                    task_type: TaskType::Reducer,
                    n_reducers: None,
                    program: Some(program.clone()),
                    input_data: task.input_data.iter().map(FileData::from).collect(),
                    object_storage_creds: Some(creds.clone()),
                    output_storage_info: Some(output.clone()),
                };
                (task.pod_name.clone(), payload)
            })
            .collect();
        self.run_phase(dispatches).await
    }

    /// Dispatches every task concurrently (bounded) and fails fast: the first
    /// error drops the remaining dispatches.
    async fn run_phase(&self, dispatches: Vec<(String, TaskPayload)>) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.config.max_dispatches));
        let mut set = JoinSet::new();
        for (pod_name, payload) in dispatches {
            let this = self.clone();
            let permits = permits.clone();
            set.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::internal(format!("dispatch pool closed: {e}")))?;
                this.start_task(&pod_name, payload).await
            });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined? {
                error!("{}", e);
                set.abort_all();
                return Err(e);
            }
        }
        Ok(())
    }

    async fn start_task(&self, pod_name: &str, payload: TaskPayload) -> Result<()> {
        let id = payload.id.clone();
        let res = self.drive_task(pod_name, &payload).await;
        if res.is_err() {
            let terminal = self.store.task(&id).is_some_and(|t| t.status.is_terminal());
            if !terminal {
                self.store.update_task_status(&id, TaskStatus::Failed)?;
            }
        }
        res
    }

    async fn drive_task(&self, pod_name: &str, payload: &TaskPayload) -> Result<()> {
        let target = worker_address(&self.config, pod_name, &payload.id);
        let workers = &self.workers;
        let stream = retry(Backoff::dial(), &target, |_| workers.start_task(&target, payload)).await?;
        info!("starting task {} in {}", payload.id, target);

        let consume = self.consume_statuses(&payload.id, stream);
        match self.config.task_deadline {
            Some(deadline) => tokio::time::timeout(deadline, consume).await.map_err(|_| {
                Error::internal(format!("task {} exceeded its {:?} deadline", payload.id, deadline))
            })?,
            None => consume.await,
        }
    }

    async fn consume_statuses(&self, id: &str, mut stream: StatusStream) -> Result<()> {
        let mut last = None;
        while let Some(info) = stream.next().await {
            let info = info?;
            self.store.update_task_status(id, info.task_status)?;
            debug!("task {} is {}", id, info.task_status);
            if info.task_status == TaskStatus::Failed {
                let cause = info.error.unwrap_or_else(|| "no details".to_string());
                return Err(Error::internal(format!("task {id} has failed: {cause}")));
            }
            last = Some(info.task_status);
        }
        if last != Some(TaskStatus::Completed) {
            warn!("status stream of task {} closed while {:?}", id, last);
            return Err(Error::internal(format!("task {id} ended without completing")));
        }
        self.store.set_task_end_time(id)?;
        info!("task {} has completed its workload", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::DEFAULT_ARTIFACT_TYPE;
    use crate::testing::{Behaviour, CountingPods, FakeWorkers, FixedSize};
    use common::{Code, OutputLocation};
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn temp_dir(sub: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("scheduler_test_{}_{}", sub, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    struct Fixture {
        scheduler: JobScheduler,
        store: Store,
        workers: Arc<FakeWorkers>,
        pods: Arc<CountingPods>,
        programs: [Artifact; 2],
    }

    async fn fixture(size: u64, workers: FakeWorkers, deadline: Option<u64>) -> Fixture {
        let dir = temp_dir("artifacts");
        let dir_str = dir.to_string_lossy().to_string();
        let deadline = deadline.map(|d| d.to_string());
        let config = Config::from_lookup(false, |k| match k {
            "ARTIFACTS_PATH" => Some(dir_str.clone()),
            "INT_FILES_LOC" => Some("/shared".to_string()),
            "WORKER_NS" => Some("mr".to_string()),
            "TASK_DEADLINE_SECS" => deadline.clone(),
            _ => None,
        });
        let store = Store::new();
        let artifacts = ArtifactManager::new(store.clone(), &dir);
        let map = artifacts.create_artifact("map.sh", DEFAULT_ARTIFACT_TYPE, b"#!/bin/sh\n").await.unwrap();
        let reduce = artifacts.create_artifact("reduce.sh", DEFAULT_ARTIFACT_TYPE, b"#!/bin/sh\n").await.unwrap();

        let workers = Arc::new(workers);
        let pods = Arc::new(CountingPods::default());
        let scheduler = JobScheduler::new(
            Arc::new(config),
            store.clone(),
            artifacts,
            pods.clone(),
            workers.clone(),
            Arc::new(FixedSize(size)),
        );
        Fixture {
            scheduler,
            store,
            workers,
            pods,
            programs: [map, reduce],
        }
    }

    fn job(path: &str, n_reducers: u32) -> Job {
        Job::new(
            n_reducers,
            InputData::whole(path, "file/txt"),
            OutputLocation {
                location: "http://minio:9000/results".into(),
                use_ssl: false,
            },
        )
    }

    fn creds() -> [Credentials; 2] {
        let c = Credentials {
            username: "minio".into(),
            password: "minio123".into(),
        };
        [c.clone(), c]
    }

    #[test]
    fn splits_cover_the_input_contiguously() {
        let splits = compute_splits("p", "file/txt", 150, 64).unwrap();
        let ranges: Vec<(u64, u64)> = splits
            .iter()
            .map(|s| (s.split_start.unwrap(), s.split_end.unwrap()))
            .collect();
        assert_eq!(ranges, vec![(0, 64), (64, 128), (128, 150)]);

        for (size, k) in [(1u64, 64u64), (64, 64), (65, 64), (1000, 7), (10, 100)] {
            let splits = compute_splits("p", "file/txt", size, k).unwrap();
            assert_eq!(splits.len() as u64, size.div_ceil(k));
            let mut expected_start = 0;
            for s in &splits {
                assert_eq!(s.split_start, Some(expected_start));
                assert!(s.split_end.unwrap() - expected_start <= k);
                expected_start = s.split_end.unwrap();
            }
            assert_eq!(expected_start, size);
        }
    }

    #[test]
    fn zero_sizes_are_invalid() {
        assert_eq!(compute_splits("p", "t", 10, 0).unwrap_err().code(), Code::InvalidArgument);
        assert_eq!(compute_splits("p", "t", 0, 64).unwrap_err().code(), Code::InvalidArgument);
    }

    #[test]
    fn dev_endpoint_points_at_localhost() {
        assert_eq!(dev_endpoint("minio.storage.svc:9000"), "localhost:9000");
        assert_eq!(dev_endpoint("minio:9000/prefix"), "localhost:9000/prefix");
        assert_eq!(dev_endpoint("minio"), "minio");
    }

    #[tokio::test]
    async fn runs_map_then_reduce_with_expected_inputs() {
        let f = fixture(150, FakeWorkers::default(), None).await;
        let j = job("http://minio:9000/input/words.txt", 2);
        f.store.insert_job(j.clone());

        let tasks = f
            .scheduler
            .schedule_job(&j, &f.programs, &creds(), Some(64))
            .await
            .unwrap();

        assert_eq!(tasks.len(), 5);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed && t.end_time.is_some()));
        assert_eq!(f.pods.0.load(Ordering::SeqCst), 5);

        let received = f.workers.received.lock().unwrap().clone();
        let by_id: HashMap<String, TaskPayload> = received.iter().map(|(_, p)| (p.id.clone(), p.clone())).collect();

        let m0 = &by_id[&format!("{}-m-0", j.id)];
        assert_eq!(m0.n_reducers, Some(2));
        assert_eq!(m0.input_data.len(), 2);
        assert_eq!((m0.input_data[0].split_start, m0.input_data[0].split_end), (Some(0), Some(64)));
        assert_eq!((m0.input_data[1].split_start, m0.input_data[1].split_end), (Some(64), Some(128)));
        let m2 = &by_id[&format!("{}-m-2", j.id)];
        assert_eq!(m2.input_data.len(), 1);
        assert_eq!(m2.program.as_ref().unwrap().content, b"#!/bin/sh\n");

        let r1 = &by_id[&format!("{}-r-1", j.id)];
        let paths: Vec<&str> = r1.input_data.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                format!("/shared/{}-m-0_1.json", j.id),
                format!("/shared/{}-m-1_1.json", j.id),
                format!("/shared/{}-m-2_1.json", j.id),
            ]
        );
        assert_eq!(r1.output_storage_info.as_ref().unwrap().location, "http://minio:9000/results");

        // todos los mappers se despacharon antes que cualquier reducer
        let first_reducer = received.iter().position(|(_, p)| p.task_type == TaskType::Reducer).unwrap();
        assert!(received[..first_reducer].iter().all(|(_, p)| p.task_type == TaskType::Mapper));
        assert_eq!(first_reducer, 3);
        assert!(received[0].0.ends_with(".workers.mr.svc.cluster.local:8090"));
    }

    #[tokio::test]
    async fn failed_mapper_aborts_before_reduce() {
        let j = job("http://minio:9000/input/words.txt", 2);
        let workers = FakeWorkers {
            behaviour: HashMap::from([(format!("{}-m-1", j.id), Behaviour::Fail)]),
            ..Default::default()
        };
        let f = fixture(150, workers, None).await;
        f.store.insert_job(j.clone());

        let err = f
            .scheduler
            .schedule_job(&j, &f.programs, &creds(), Some(64))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(err.to_string().contains("exit status 1"));

        let tasks = f.store.tasks_by_job(&j.id);
        assert!(tasks.iter().all(|t| t.task_type == TaskType::Mapper));
        let failed = tasks.iter().find(|t| t.id.ends_with("-m-1")).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn empty_input_creates_no_pods() {
        let f = fixture(0, FakeWorkers::default(), None).await;
        let j = job("http://minio:9000/input/empty.txt", 1);
        let err = f.scheduler.schedule_job(&j, &f.programs, &creds(), None).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(f.pods.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_http_input_is_invalid_argument() {
        let f = fixture(10, FakeWorkers::default(), None).await;
        let j = job("ftp://minio/input/words.txt", 1);
        let err = f.scheduler.schedule_job(&j, &f.programs, &creds(), None).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test(start_paused = true)]
    async fn dial_retries_until_the_worker_listens() {
        let workers = FakeWorkers {
            refuse_first: 2,
            ..Default::default()
        };
        let f = fixture(10, workers, None).await;
        let j = job("http://minio:9000/input/words.txt", 1);
        let started = tokio::time::Instant::now();
        f.scheduler.schedule_job(&j, &f.programs, &creds(), None).await.unwrap();
        // 1s + 2s por fase; las fases map y reduce corren una tras otra
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_worker_surfaces_the_last_dial_error() {
        let workers = FakeWorkers {
            refuse_first: u32::MAX,
            ..Default::default()
        };
        let f = fixture(10, workers, None).await;
        let j = job("http://minio:9000/input/words.txt", 1);
        f.store.insert_job(j.clone());
        let started = tokio::time::Instant::now();
        let err = f.scheduler.schedule_job(&j, &f.programs, &creds(), None).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(started.elapsed(), Duration::from_secs(31));
        let refusals = f.workers.refusals.lock().unwrap();
        assert_eq!(refusals[&format!("{}-m-0", j.id)], 6);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_task_hits_the_deadline() {
        let j = job("http://minio:9000/input/words.txt", 1);
        let workers = FakeWorkers {
            behaviour: HashMap::from([(format!("{}-m-0", j.id), Behaviour::Hang)]),
            ..Default::default()
        };
        let f = fixture(10, workers, Some(30)).await;
        f.store.insert_job(j.clone());
        let err = f.scheduler.schedule_job(&j, &f.programs, &creds(), None).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(err.to_string().contains("deadline"));
        assert_eq!(f.store.task(&format!("{}-m-0", j.id)).unwrap().status, TaskStatus::Failed);
    }
}
