use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::protocol::Credentials;

pub type JobId = String;

/// Input types accepted by the scheduler.
pub const ALLOWED_INPUT_TYPES: &[&str] = &["file/txt"];

/// Byte-range reference into a source object.
///
/// `split_start`/`split_end` describe the half-open range `[start, end)` of a
/// map shard; both are absent for whole-object reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputData {
    pub path: String,
    #[serde(rename = "type")]
    pub input_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_end: Option<u64>,
}

impl InputData {
    pub fn whole(path: impl Into<String>, input_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            input_type: input_type.into(),
            split_start: None,
            split_end: None,
        }
    }

    pub fn split(path: impl Into<String>, input_type: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            path: path.into(),
            input_type: input_type.into(),
            split_start: Some(start),
            split_end: Some(end),
        }
    }
}

/// Destination object store for the reduce output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputLocation {
    pub location: String,
    #[serde(rename = "useSSL")]
    pub use_ssl: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub n_reducers: u32,
    pub input_data: InputData,
    pub output_location: OutputLocation,
    pub start_time: DateTime<Utc>,
    /// Only set once every map and reduce task completed.
    pub end_time: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(n_reducers: u32, input_data: InputData, output_location: OutputLocation) -> Self {
        Self {
            id: format!("j-{}", uuid::Uuid::new_v4()),
            n_reducers,
            input_data,
            output_location,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}

/* --------- management API bodies --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JobRequest {
    pub n_reducers: u32,
    pub input_path: String,
    pub input_type: String,
    pub output_path: String,
    #[serde(rename = "useSSL", default)]
    pub use_ssl: bool,
    pub mapper_name: String,
    pub reducer_name: String,
    pub input_storage_credentials: Credentials,
    pub output_storage_credentials: Credentials,
    /// Overrides the coordinator's configured split size, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub job: Job,
    #[serde(rename = "mProgram")]
    pub map_program: Artifact,
    #[serde(rename = "rProgram")]
    pub reduce_program: Artifact,
}
