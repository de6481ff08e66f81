//! Fakes for the coordinator's collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::{
    Credentials, Error, FileData, LineReader, ObjectLocation, ObjectRegistrar, Result, TaskPayload, TaskStatus,
    TaskStatusInfo,
};
use futures::{stream, StreamExt};

use crate::dispatch::{StatusStream, WorkerClient};
use crate::pods::{PodProvisioner, PodSpec, PreProvisioned};
use crate::scheduler::RegistrarFactory;

/// Registrar that only knows the size of every object.
pub struct FixedSize(pub u64);

#[async_trait]
impl ObjectRegistrar for FixedSize {
    async fn get_file(&self, _file: &FileData) -> Result<LineReader> {
        Err(Error::internal("not readable"))
    }
    async fn write_file(&self, _path: &str, _content: Vec<u8>) -> Result<()> {
        Err(Error::internal("not writable"))
    }
    async fn get_file_size(&self, _bucket: &str, _key: &str) -> Result<u64> {
        Ok(self.0)
    }
}

impl RegistrarFactory for FixedSize {
    fn registrar(&self, _l: &ObjectLocation, _c: &Credentials) -> Result<Arc<dyn ObjectRegistrar>> {
        Ok(Arc::new(FixedSize(self.0)))
    }
}

#[derive(Default)]
pub struct CountingPods(pub AtomicUsize);

#[async_trait]
impl PodProvisioner for CountingPods {
    async fn create_pods(&self, specs: &[PodSpec]) -> Result<Vec<String>> {
        self.0.fetch_add(specs.len(), Ordering::SeqCst);
        PreProvisioned.create_pods(specs).await
    }
}

#[derive(Clone, Copy)]
pub enum Behaviour {
    Complete,
    Fail,
    Hang,
}

#[derive(Default)]
pub struct FakeWorkers {
    pub received: Mutex<Vec<(String, TaskPayload)>>,
    pub refusals: Mutex<HashMap<String, u32>>,
    pub refuse_first: u32,
    pub behaviour: HashMap<String, Behaviour>,
}

#[async_trait]
impl WorkerClient for FakeWorkers {
    async fn start_task(&self, target: &str, payload: &TaskPayload) -> Result<StatusStream> {
        {
            let mut refusals = self.refusals.lock().unwrap();
            let n = refusals.entry(payload.id.clone()).or_default();
            if *n < self.refuse_first {
                *n += 1;
                return Err(Error::internal(format!("{target}: connection refused")));
            }
        }
        self.received.lock().unwrap().push((target.to_string(), payload.clone()));

        let head = vec![
            Ok(TaskStatusInfo::new(TaskStatus::Idle)),
            Ok(TaskStatusInfo::new(TaskStatus::InProgress)),
        ];
        let behaviour = self.behaviour.get(&payload.id).copied().unwrap_or(Behaviour::Complete);
        Ok(match behaviour {
            Behaviour::Complete => {
                let done = TaskStatusInfo::completed(vec![FileData::whole(format!("/shared/{}_0.json", payload.id))]);
                stream::iter(head.into_iter().chain([Ok(done)])).boxed()
            }
            Behaviour::Fail => {
                stream::iter(head.into_iter().chain([Ok(TaskStatusInfo::failed("exit status 1"))])).boxed()
            }
            Behaviour::Hang => stream::iter(head).chain(stream::pending()).boxed(),
        })
    }
}
