use std::sync::Arc;

use async_trait::async_trait;
use common::{
    Credentials, Error, FileData, LineReader, LocalFsRegistrar, ObjectRegistrar, Result, S3Registrar,
    TaskPayload, TaskType,
};

use crate::config::Config;
use crate::mapper::Mapper;
use crate::reducer::Reducer;

/// One task type's three stages, driven in order by the engine.
#[async_trait]
pub trait WorkerAlgorithm: Send {
    async fn fetch_input_data(&mut self, task: &TaskPayload) -> Result<Vec<LineReader>>;

    async fn handle_task(&mut self, task: &TaskPayload, inputs: Vec<LineReader>) -> Result<()>;

    async fn persist_output_data(&mut self, task: &TaskPayload) -> Result<Vec<FileData>>;
}

pub fn algorithm_for(task_type: TaskType, config: Arc<Config>) -> Box<dyn WorkerAlgorithm> {
    match task_type {
        TaskType::Mapper => Box::new(Mapper::new(config)),
        TaskType::Reducer => Box::new(Reducer::new(config)),
    }
}

/// Picks the registrar serving `path`: object storage for `http(s)://` URLs,
/// the local filesystem for absolute paths.
pub fn registrar_for(path: &str, creds: Option<&Credentials>) -> Result<Arc<dyn ObjectRegistrar>> {
    if path.starts_with("http://") || path.starts_with("https://") {
        let creds = creds.ok_or_else(|| Error::invalid_argument("missing object storage credentials"))?;
        Ok(Arc::new(S3Registrar::for_path(path, creds)?))
    } else if path.starts_with('/') {
        Ok(Arc::new(LocalFsRegistrar))
    } else {
        Err(Error::invalid_argument(format!(
            "{path}: expected an http(s) URL or an absolute path"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Code;

    #[test]
    fn resolves_registrars_by_path() {
        assert!(registrar_for("/mappers/a_0.json", None).is_ok());
        let err = registrar_for("http://minio:9000/in/a.txt", None).err().unwrap();
        assert_eq!(err.code(), Code::InvalidArgument);
        let err = registrar_for("relative/a.txt", None).err().unwrap();
        assert_eq!(err.code(), Code::InvalidArgument);
    }
}
