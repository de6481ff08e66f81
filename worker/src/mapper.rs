use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::ipc::{read_payload, IpcEndpoint, RESULT_SOCKET_ENV};
use common::kv::partition_for;
use common::task::partition_file_name;
use common::{
    Error, FileData, KVPair, KVPairArray, Line, LineReader, LocalFsRegistrar, ObjectRegistrar,
    Result, TaskPayload,
};
use futures::future::try_join_all;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument};

use crate::algorithm::{registrar_for, WorkerAlgorithm};
use crate::config::Config;
use crate::program;

pub const MAP_SOCKET: &str = "map.sock";

pub struct Mapper {
    config: Arc<Config>,
    partitions: Vec<Vec<KVPair>>,
}

impl Mapper {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            partitions: Vec::new(),
        }
    }
}

#[async_trait]
impl WorkerAlgorithm for Mapper {
    #[instrument(skip_all, fields(task = %task.id))]
    async fn fetch_input_data(&mut self, task: &TaskPayload) -> Result<Vec<LineReader>> {
        if task.input_data.is_empty() {
            return Err(Error::invalid_argument("the map task has no input data"));
        }
        let creds = task
            .object_storage_creds
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("the map task has no object storage credentials"))?;

        let mut streams = Vec::with_capacity(task.input_data.len());
        for (i, input) in task.input_data.iter().enumerate() {
            let registrar = registrar_for(&input.path, Some(creds))?;
            let mut file = input.clone();
            // Leer un byte antes para que la primera línea (descartada)
            // termine siempre en el inicio real del shard.
            if i == 0 {
                if let Some(start) = file.split_start.filter(|s| *s > 0) {
                    file.split_start = Some(start - 1);
                }
            }
            debug!(
                "fetching {} [{:?}, {:?})",
                file.path, file.split_start, file.split_end
            );
            streams.push(registrar.get_file(&file).await?);
        }
        Ok(streams)
    }

    #[instrument(skip_all, fields(task = %task.id))]
    async fn handle_task(&mut self, task: &TaskPayload, inputs: Vec<LineReader>) -> Result<()> {
        let n_reducers = task
            .n_reducers
            .filter(|n| *n > 0)
            .ok_or_else(|| Error::invalid_argument("nReducers must be greater than 0"))?;
        let program = program::validate(task.program.as_ref())?;
        let path = program::install(&self.config.program_dir, program).await?;

        let endpoint = IpcEndpoint::bind(self.config.socket_dir.join(MAP_SOCKET))?;
        let socket = endpoint.path().display().to_string();

        let (expected_tx, expected_rx) = oneshot::channel();
        let grace = self.config.result_grace;
        let consumer = tokio::spawn(collect(endpoint, n_reducers, expected_rx, grace));

        let skip_first = task
            .input_data
            .first()
            .and_then(|f| f.split_start)
            .is_some_and(|s| s > 0);
        let produced = produce(
            inputs,
            skip_first,
            path,
            socket,
            self.config.max_subprocesses,
        )
        .await;

        let invocations = match produced {
            Ok(n) => n,
            Err(e) => {
                consumer.abort();
                return Err(e);
            }
        };
        let _ = expected_tx.send(invocations);
        self.partitions = consumer.await??;

        let pairs: usize = self.partitions.iter().map(Vec::len).sum();
        info!("{} lines mapped into {} pairs", invocations, pairs);
        Ok(())
    }

    #[instrument(skip_all, fields(task = %task.id))]
    async fn persist_output_data(&mut self, task: &TaskPayload) -> Result<Vec<FileData>> {
        let registrar = LocalFsRegistrar;
        let writes = std::mem::take(&mut self.partitions)
            .into_iter()
            .enumerate()
            .filter(|(_, pairs)| !pairs.is_empty())
            .map(|(p, pairs)| {
                let path = format!(
                    "{}/{}",
                    self.config.mappers_dir,
                    partition_file_name(&task.id, p as u32)
                );
                async move {
                    let content = serde_json::to_vec(&KVPairArray { pairs })?;
                    registrar.write_file(&path, content).await?;
                    Ok::<_, Error>(FileData::whole(path))
                }
            });
        let files = try_join_all(writes).await?;
        info!("persisted {} partitions", files.len());
        Ok(files)
    }
}

/* ---------------- production ---------------- */

/// Runs the program once per line of the primary stream and returns how many
/// invocations were made. Stops at the first failed invocation.
async fn produce(
    inputs: Vec<LineReader>,
    skip_first: bool,
    program: PathBuf,
    socket: String,
    max_subprocesses: usize,
) -> Result<usize> {
    let mut inputs = inputs.into_iter();
    let mut primary = inputs
        .next()
        .ok_or_else(|| Error::invalid_argument("no input streams"))?;
    let mut secondary = inputs.next();

    let sem = Arc::new(Semaphore::new(max_subprocesses));
    let mut running: JoinSet<Result<()>> = JoinSet::new();
    let mut line_number: u64 = 0;
    let mut first = true;

    while let Some(mut line) = primary.next_line().await? {
        if std::mem::take(&mut first) && skip_first {
            continue;
        }
        stitch(&mut line, secondary.as_mut()).await?;

        while let Some(done) = running.try_join_next() {
            done??;
        }
        let permit = sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::internal(e.to_string()))?;

        let program = program.clone();
        let args = vec![line_number.to_string(), line.text()];
        let envs = vec![(RESULT_SOCKET_ENV.to_string(), socket.clone())];
        running.spawn(async move {
            let _permit = permit;
            program::run(&program, &args, envs).await
        });
        line_number += 1;
    }

    while let Some(done) = running.join_next().await {
        done??;
    }
    Ok(line_number as usize)
}

/// Una línea cortada al final del shard continúa en el siguiente.
async fn stitch(line: &mut Line, secondary: Option<&mut LineReader>) -> Result<()> {
    if line.terminated {
        return Ok(());
    }
    let Some(next) = secondary else {
        return Ok(());
    };
    if let Some(rest) = next.next_line().await? {
        // `\r\n` partido entre los dos shards
        if rest.bytes.is_empty() && rest.terminated && line.bytes.last() == Some(&b'\r') {
            line.bytes.pop();
        }
        line.bytes.extend_from_slice(&rest.bytes);
        line.terminated = rest.terminated;
    }
    Ok(())
}

/* ---------------- collection ---------------- */

/// Accepts one result per invocation and routes every pair to its partition.
/// The invocation count arrives on `expected` once production is over; after
/// that the remaining results must show up within `grace`.
async fn collect(
    endpoint: IpcEndpoint,
    n_reducers: u32,
    mut expected: oneshot::Receiver<usize>,
    grace: Duration,
) -> Result<Vec<Vec<KVPair>>> {
    let mut partitions = vec![Vec::new(); n_reducers as usize];
    let mut received = 0usize;
    let mut target: Option<usize> = None;

    loop {
        let stream = match target {
            Some(t) if received >= t => break,
            Some(t) => tokio::time::timeout(grace, endpoint.accept())
                .await
                .map_err(|_| {
                    Error::internal(format!(
                        "expected {t} map results, only {received} arrived"
                    ))
                })??,
            None => tokio::select! {
                accepted = endpoint.accept() => accepted?,
                count = &mut expected => {
                    let count = count.map_err(|_| Error::internal("map production was dropped"))?;
                    target = Some(count);
                    continue;
                }
            },
        };

        let batch: KVPairArray = read_payload(stream).await?;
        for pair in batch.pairs {
            let p = partition_for(&pair.key, n_reducers) as usize;
            partitions[p].push(pair);
        }
        received += 1;
    }
    Ok(partitions)
}
