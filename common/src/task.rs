use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::job::{InputData, JobId};

pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Mapper,
    Reducer,
}

impl TaskType {
    /// One-letter tag used in task ids and pod names.
    pub fn tag(self) -> char {
        match self {
            TaskType::Mapper => 'm',
            TaskType::Reducer => 'r',
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Mapper => "mapper",
            TaskType::Reducer => "reducer",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Scheduled,
    Idle,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Idle => "idle",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(TaskStatus::Scheduled),
            "idle" => Ok(TaskStatus::Idle),
            "in-progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(Error::invalid_argument(format!("unknown task status {other}"))),
        }
    }
}

/// Coordinator-side record of one unit of work, bound to one pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Artifact name of the program this task runs.
    pub program: String,
    pub input_data: Vec<InputData>,
    pub pod_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// `<jobId>-<m|r>-<index>`
pub fn task_id(job_id: &str, task_type: TaskType, index: usize) -> TaskId {
    format!("{}-{}-{}", job_id, task_type.tag(), index)
}

/// File name of mapper `task_id`'s partition `partition`.
pub fn partition_file_name(task_id: &str, partition: u32) -> String {
    format!("{}_{}.json", task_id, partition)
}

/// Path of the partition that mapper `mapper_index` of `job_id` wrote for
/// `reducer_index`. Reducers locate their input with this, no listing needed.
pub fn partition_path(dir: &str, job_id: &str, mapper_index: usize, reducer_index: usize) -> String {
    let mapper_id = task_id(job_id, TaskType::Mapper, mapper_index);
    format!(
        "{}/{}",
        dir.trim_end_matches('/'),
        partition_file_name(&mapper_id, reducer_index as u32)
    )
}

fn reducer_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<job>j-[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})-r-(?P<reducer>\d+)$")
            .expect("static regex")
    })
}

/// Splits a reducer task id into `(jobId, reducerIndex)`.
pub fn parse_reducer_task_id(id: &str) -> Result<(String, u32)> {
    let caps = reducer_id_regex()
        .captures(id)
        .ok_or_else(|| Error::invalid_argument(format!("task id format is wrong: {id}")))?;
    let reducer = caps["reducer"]
        .parse::<u32>()
        .map_err(|_| Error::invalid_argument(format!("task id format is wrong: {id}")))?;
    Ok((caps["job"].to_string(), reducer))
}
