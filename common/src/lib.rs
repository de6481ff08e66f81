//! Types and plumbing shared by the coordinator, the workers and the CLI.

pub mod artifact;
pub mod error;
pub mod ipc;
pub mod job;
pub mod kv;
pub mod lines;
pub mod protocol;
pub mod registrar;
pub mod retry;
pub mod task;

pub use artifact::Artifact;
pub use error::{Code, Error, Result};
pub use job::{InputData, Job, JobId, JobRequest, OutputLocation, ScheduleResponse};
pub use kv::{KVPair, KVPairArray, OrderedKVPair, OrderedKey};
pub use lines::{Line, LineReader};
pub use protocol::{Credentials, FileData, OutputStorageInfo, Program, TaskPayload, TaskStatusInfo};
pub use registrar::{LocalFsRegistrar, ObjectLocation, ObjectRegistrar, S3Registrar};
pub use retry::Backoff;
pub use task::{Task, TaskId, TaskStatus, TaskType};
