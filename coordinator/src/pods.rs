//! Worker pod policy: how many pods a phase needs, how they are named,
//! labelled, mounted and addressed. Talking to the cluster API is left to a
//! [`PodProvisioner`].

use std::collections::BTreeMap;
use std::hash::Hasher;

use async_trait::async_trait;
use common::{Result, TaskType};
use fnv::FnvHasher;
use tracing::info;

use crate::config::Config;

pub const WORKER_PORT: u16 = 8090;
pub const WORKER_SUBDOMAIN: &str = "workers";
pub const INTERMEDIATE_CLAIM: &str = "mapreduce-intermediate-files-pvc";
/// Where a mapper pod sees the shared claim.
pub const MAPPER_MOUNT: &str = "/mappers";

const DEV_PORT_BASE: u16 = 30000;
const DEV_PORT_RANGE: u64 = 2768;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSpec {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub mount_path: String,
    pub claim_name: String,
    pub port: u16,
}

impl PodSpec {
    /// Pod running task `task_id`; the pod is named after the task.
    pub fn for_task(config: &Config, job_id: &str, task_id: &str, task_type: TaskType, program: &str) -> Self {
        let mount_path = match task_type {
            TaskType::Mapper => MAPPER_MOUNT.to_string(),
            TaskType::Reducer => config.intermediate_files_loc.clone(),
        };
        let labels = BTreeMap::from([
            ("app".to_string(), "worker".to_string()),
            ("type".to_string(), task_type.as_str().to_string()),
            ("job".to_string(), job_id.to_string()),
            ("id".to_string(), task_id.to_string()),
            ("program".to_string(), program.to_string()),
        ]);
        Self {
            name: task_id.to_string(),
            namespace: config.worker_ns.clone(),
            image: config.worker_img.clone(),
            labels,
            mount_path,
            claim_name: INTERMEDIATE_CLAIM.to_string(),
            port: WORKER_PORT,
        }
    }
}

/// NodePort exposing task `task_id` in dev mode, in `30000..32768`.
pub fn dev_mode_port(task_id: &str) -> u16 {
    let mut h = FnvHasher::default();
    h.write(task_id.as_bytes());
    DEV_PORT_BASE + (h.finish() % DEV_PORT_RANGE) as u16
}

/// `host:port` the coordinator dials for the pod running `task_id`.
pub fn worker_address(config: &Config, pod_name: &str, task_id: &str) -> String {
    if config.dev_mode {
        format!("localhost:{}", dev_mode_port(task_id))
    } else {
        format!(
            "{}.{}.{}.svc.cluster.local:{}",
            pod_name, WORKER_SUBDOMAIN, config.worker_ns, WORKER_PORT
        )
    }
}

#[async_trait]
pub trait PodProvisioner: Send + Sync {
    /// Creates the pods and returns their names in input order.
    async fn create_pods(&self, specs: &[PodSpec]) -> Result<Vec<String>>;
}

/// Provisioner for clusters whose worker pods are created by an operator
/// (or by hand in dev mode): it only records what it would have created.
#[derive(Debug, Default)]
pub struct PreProvisioned;

#[async_trait]
impl PodProvisioner for PreProvisioned {
    async fn create_pods(&self, specs: &[PodSpec]) -> Result<Vec<String>> {
        for spec in specs {
            info!(
                "worker pod {} expected in namespace {} (image {}, claim {} at {}, port {}, labels {:?})",
                spec.name, spec.namespace, spec.image, spec.claim_name, spec.mount_path, spec.port, spec.labels
            );
        }
        Ok(specs.iter().map(|s| s.name.clone()).collect())
    }
}
