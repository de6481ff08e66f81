//! Task dispatch protocol between coordinator and worker.
//!
//! The coordinator POSTs one [`TaskPayload`] to `/api/v1/tasks` on the worker
//! and reads back newline-delimited [`TaskStatusInfo`] records: one `idle`,
//! one `in-progress`, then exactly one terminal status.

use serde::{Deserialize, Serialize};

use crate::job::InputData;
use crate::task::{TaskStatus, TaskType};

pub const TASKS_ROUTE: &str = "/api/v1/tasks";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    /// Local path the worker writes the executable to.
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_end: Option<u64>,
}

impl FileData {
    pub fn whole(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            split_start: None,
            split_end: None,
        }
    }

    pub fn range(path: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            path: path.into(),
            split_start: Some(start),
            split_end: Some(end),
        }
    }
}

impl From<&InputData> for FileData {
    fn from(input: &InputData) -> Self {
        Self {
            path: input.path.clone(),
            split_start: input.split_start,
            split_end: input.split_end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputStorageInfo {
    pub location: String,
    #[serde(rename = "useSSL", default, skip_serializing_if = "Option::is_none")]
    pub use_ssl: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_reducers: Option<u32>,
    pub program: Option<Program>,
    pub input_data: Vec<FileData>,
    pub object_storage_creds: Option<Credentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_storage_info: Option<OutputStorageInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusInfo {
    pub task_status: TaskStatus,
    #[serde(default)]
    pub resulting_files: Vec<FileData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskStatusInfo {
    pub fn new(task_status: TaskStatus) -> Self {
        Self {
            task_status,
            resulting_files: Vec::new(),
            error: None,
        }
    }

    pub fn completed(resulting_files: Vec<FileData>) -> Self {
        Self {
            task_status: TaskStatus::Completed,
            resulting_files,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            task_status: TaskStatus::Failed,
            resulting_files: Vec::new(),
            error: Some(error.into()),
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
