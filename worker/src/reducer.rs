use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::ipc::{read_payload, send_payload_with_retry, IpcEndpoint, INPUT_SOCKET_ENV, RESULT_SOCKET_ENV};
use common::kv::CanonicalKey;
use common::retry::Backoff;
use common::task::parse_reducer_task_id;
use common::registrar::endpoint_url;
use common::{
    Code, Error, FileData, KVPair, KVPairArray, LineReader, LocalFsRegistrar, ObjectRegistrar,
    OrderedKVPair, OrderedKey, Result, S3Registrar, TaskPayload,
};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument};

use crate::algorithm::{registrar_for, WorkerAlgorithm};
use crate::config::Config;
use crate::program;

pub const REDUCE_SOCKET: &str = "reduce.sock";

pub fn input_socket_name(order: usize) -> String {
    format!("reduce-input-{order}.sock")
}

pub struct Reducer {
    config: Arc<Config>,
    output: Vec<KVPair>,
}

impl Reducer {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            output: Vec::new(),
        }
    }
}

/* ---------------- fuse + shuffle ---------------- */

/// Reads every partition stream to the end and concatenates their pairs.
pub async fn fuse(inputs: Vec<LineReader>) -> Result<Vec<KVPair>> {
    let mut pairs = Vec::new();
    for mut input in inputs {
        let bytes = input.read_to_end().await?;
        let batch: KVPairArray = serde_json::from_slice(&bytes)
            .map_err(|e| Error::internal(format!("can't decode partition: {e}")))?;
        pairs.extend(batch.pairs);
    }
    Ok(pairs)
}

/// Groups values by structurally equal key, then orders the groups by key
/// hash. Groups with colliding hashes keep their first-appearance order.
pub fn shuffle(pairs: Vec<KVPair>) -> Vec<(Value, Vec<Value>)> {
    let mut index: HashMap<CanonicalKey, usize> = HashMap::new();
    let mut groups: Vec<(CanonicalKey, Value, Vec<Value>)> = Vec::new();
    for pair in pairs {
        let canonical = CanonicalKey::new(&pair.key);
        match index.get(&canonical) {
            Some(&i) => groups[i].2.push(pair.value),
            None => {
                index.insert(canonical.clone(), groups.len());
                groups.push((canonical, pair.key, vec![pair.value]));
            }
        }
    }
    groups.sort_by_key(|(canonical, _, _)| canonical.hash64());
    groups.into_iter().map(|(_, key, values)| (key, values)).collect()
}

#[async_trait]
impl WorkerAlgorithm for Reducer {
    #[instrument(skip_all, fields(task = %task.id))]
    async fn fetch_input_data(&mut self, task: &TaskPayload) -> Result<Vec<LineReader>> {
        if task.input_data.is_empty() {
            return Err(Error::invalid_argument("the reduce task has no input data"));
        }
        let creds = task.object_storage_creds.as_ref();

        let mut streams = Vec::with_capacity(task.input_data.len());
        for input in &task.input_data {
            if input.path.is_empty() {
                return Err(Error::invalid_argument("empty partition path"));
            }
            let registrar = registrar_for(&input.path, creds)?;
            match registrar.get_file(input).await {
                Ok(stream) => streams.push(stream),
                // Los mappers no escriben archivo para una partición vacía.
                Err(e) if e.code() == Code::NotFound => debug!("skipping {}: {}", input.path, e),
                Err(e) => return Err(e),
            }
        }
        Ok(streams)
    }

    #[instrument(skip_all, fields(task = %task.id))]
    async fn handle_task(&mut self, task: &TaskPayload, inputs: Vec<LineReader>) -> Result<()> {
        // 1) fusionar + barajar
        let groups = shuffle(fuse(inputs).await?);
        info!("{} key groups to reduce", groups.len());
        if groups.is_empty() {
            self.output.clear();
            return Ok(());
        }

        let program = program::validate(task.program.as_ref())?;
        let path = program::install(&self.config.program_dir, program).await?;
        let endpoint = Arc::new(IpcEndpoint::bind(self.config.socket_dir.join(REDUCE_SOCKET))?);
        let socket = endpoint.path().display().to_string();
        let total = groups.len();

        // 2) consumidores
        let slots: Arc<Mutex<Vec<Option<KVPair>>>> = Arc::new(Mutex::new(vec![None; total]));
        let claimed = Arc::new(AtomicUsize::new(0));
        let mut consumers: JoinSet<Result<()>> = JoinSet::new();
        for _ in 0..self.config.max_subprocesses.min(total) {
            let endpoint = endpoint.clone();
            let slots = slots.clone();
            let claimed = claimed.clone();
            consumers.spawn(async move {
                while claimed.fetch_add(1, Ordering::SeqCst) < total {
                    let stream = endpoint.accept().await?;
                    let result: OrderedKVPair = read_payload(stream).await?;
                    store_result(&slots, result)?;
                }
                Ok(())
            });
        }

        let config = self.config.clone();
        // 3) productores: un programa por grupo
        let sem = Arc::new(Semaphore::new(config.max_subprocesses));
        let backoff = Backoff::Linear {
            base: config.ipc_retry_base,
            retries: 3,
        };
        let producing = async {
            let mut producers: JoinSet<Result<()>> = JoinSet::new();
            for (order, (key, values)) in groups.into_iter().enumerate() {
                while let Some(done) = producers.try_join_next() {
                    done??;
                }
                let permit = sem
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::internal(e.to_string()))?;
                let path = path.clone();
                let input_socket = config.socket_dir.join(input_socket_name(order));
                let envs = vec![
                    (RESULT_SOCKET_ENV.to_string(), socket.clone()),
                    (INPUT_SOCKET_ENV.to_string(), input_socket.display().to_string()),
                ];
                let group = OrderedKVPair {
                    key: OrderedKey { key, value: order },
                    value: Value::Array(values),
                };
                producers.spawn(async move {
                    let _permit = permit;
                    let args = [order.to_string()];
                    let run = program::run(&path, &args, envs);
                    let send = send_payload_with_retry(&input_socket, &group, backoff);
                    tokio::try_join!(run, send)?;
                    Ok(())
                });
            }
            while let Some(done) = producers.join_next().await {
                done??;
            }
            Ok::<_, Error>(())
        };
        let consuming = async move {
            while let Some(done) = consumers.join_next().await {
                done??;
            }
            Ok::<_, Error>(())
        };
        tokio::pin!(producing);
        tokio::pin!(consuming);

        // 4) el primer fallo de cualquiera de los dos lados aborta la tarea
        let mut consumed = false;
        loop {
            tokio::select! {
                res = &mut producing => {
                    res?;
                    break;
                }
                res = &mut consuming, if !consumed => {
                    res?;
                    consumed = true;
                }
            }
        }

        // 5) resultados pendientes
        if !consumed {
            let grace = config.result_grace;
            tokio::time::timeout(grace, &mut consuming)
                .await
                .map_err(|_| Error::internal(format!("reduce results still missing after {:?}", grace)))??;
        }

        let slots = std::mem::take(&mut *lock(&slots));
        let output = assemble_output(slots)?;
        self.output = output;
        Ok(())
    }

    #[instrument(skip_all, fields(task = %task.id))]
    async fn persist_output_data(&mut self, task: &TaskPayload) -> Result<Vec<FileData>> {
        let (job_id, reducer) = parse_reducer_task_id(&task.id)?;
        let info = task
            .output_storage_info
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("the reduce task has no output storage info"))?;
        let target = output_target(&info.location, info.use_ssl, &self.config.output_bucket, &job_id, reducer)?;

        let content = serde_json::to_vec(&KVPairArray {
            pairs: std::mem::take(&mut self.output),
        })?;
        match &target {
            OutputTarget::Local { path } => LocalFsRegistrar.write_file(path, content).await?,
            OutputTarget::ObjectStore { endpoint_url, object } => {
                let creds = task
                    .object_storage_creds
                    .as_ref()
                    .ok_or_else(|| Error::invalid_argument("missing object storage credentials"))?;
                S3Registrar::new(endpoint_url, creds).write_file(object, content).await?
            }
        }
        let location = target.location();
        info!("reduce output written to {}", location);
        Ok(vec![FileData::whole(location)])
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn store_result(slots: &Mutex<Vec<Option<KVPair>>>, result: OrderedKVPair) -> Result<()> {
    let order = result.key.value;
    let mut slots = lock(slots);
    let slot = slots
        .get_mut(order)
        .ok_or_else(|| Error::internal(format!("reduce result order {order} is out of range")))?;
    if slot.is_some() {
        return Err(Error::internal(format!("duplicate reduce result for order {order}")));
    }
    *slot = Some(KVPair {
        key: result.key.key,
        value: result.value,
    });
    Ok(())
}

/// Output in group order; every slot must have been filled.
pub fn assemble_output(slots: Vec<Option<KVPair>>) -> Result<Vec<KVPair>> {
    slots
        .into_iter()
        .enumerate()
        .map(|(order, slot)| slot.ok_or_else(|| Error::internal(format!("no result for group {order}"))))
        .collect()
}

/* ---------------- output location ---------------- */

#[derive(Debug, PartialEq, Eq)]
pub enum OutputTarget {
    Local { path: String },
    ObjectStore { endpoint_url: String, object: String },
}

impl OutputTarget {
    pub fn location(&self) -> String {
        match self {
            OutputTarget::Local { path } => path.clone(),
            OutputTarget::ObjectStore { endpoint_url, object } => format!("{endpoint_url}/{object}"),
        }
    }
}

/// Resolves `location` into the output object of reducer `reducer`.
///
/// An absolute path writes `<location>/<jobId>/<n>.json` on the local
/// filesystem. Otherwise `location` is `[http(s)://]<endpoint>[/<bucket>]` and
/// the object is `<bucket>/<jobId>/<n>.json`, with `default_bucket` when no
/// bucket is given.
pub fn output_target(
    location: &str,
    use_ssl: Option<bool>,
    default_bucket: &str,
    job_id: &str,
    reducer: u32,
) -> Result<OutputTarget> {
    let location = location.trim().trim_end_matches('/');
    if location.is_empty() {
        return Err(Error::invalid_argument("empty output location"));
    }
    let file = format!("{job_id}/{reducer}.json");
    if location.starts_with('/') {
        return Ok(OutputTarget::Local {
            path: format!("{location}/{file}"),
        });
    }

    let (rest, ssl) = if let Some(rest) = location.strip_prefix("https://") {
        (rest, true)
    } else if let Some(rest) = location.strip_prefix("http://") {
        (rest, false)
    } else {
        (location, use_ssl.unwrap_or(false))
    };
    let (endpoint, bucket) = match rest.split_once('/') {
        Some((endpoint, bucket)) if !bucket.is_empty() => (endpoint, bucket),
        Some((endpoint, _)) => (endpoint, default_bucket),
        None => (rest, default_bucket),
    };
    if endpoint.is_empty() {
        return Err(Error::invalid_argument(format!("{location}: missing endpoint")));
    }
    Ok(OutputTarget::ObjectStore {
        endpoint_url: endpoint_url(endpoint, ssl),
        object: format!("{bucket}/{file}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const JOB: &str = "j-0190a1b2-c3d4-7e5f-8a9b-0c1d2e3f4a5b";

    #[test]
    fn shuffle_groups_structurally_equal_keys() {
        let pairs = vec![
            KVPair::new(json!({"a": 1, "b": 2}), 1),
            KVPair::new("x", 10),
            KVPair::new(json!({"b": 2, "a": 1}), 2),
            KVPair::new("x", 20),
        ];
        let groups = shuffle(pairs);
        assert_eq!(groups.len(), 2);
        for (key, values) in &groups {
            if key == &json!("x") {
                assert_eq!(values, &vec![json!(10), json!(20)]);
            } else {
                assert_eq!(values, &vec![json!(1), json!(2)]);
            }
        }
    }

    #[test]
    fn shuffle_orders_groups_by_key_hash() {
        let keys: Vec<Value> = (0..20).map(|i| json!(format!("k{i}"))).collect();
        let pairs = keys.iter().map(|k| KVPair::new(k.clone(), 1)).collect();
        let groups = shuffle(pairs);
        let hashes: Vec<u64> = groups.iter().map(|(k, _)| common::kv::key_hash(k)).collect();
        let mut sorted = hashes.clone();
        sorted.sort();
        assert_eq!(hashes, sorted);
    }

    #[tokio::test]
    async fn fuse_concatenates_partitions() {
        let a = LineReader::from_bytes(br#"{"pairs":[{"key":"a","value":1}]}"#.to_vec());
        let b = LineReader::from_bytes(br#"{"pairs":[{"key":"b","value":2},{"key":"a","value":3}]}"#.to_vec());
        let pairs = fuse(vec![a, b]).await.unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[2], KVPair::new("a", 3));
    }

    #[tokio::test]
    async fn fuse_rejects_garbage() {
        let bad = LineReader::from_bytes(b"[1,2".to_vec());
        assert_eq!(fuse(vec![bad]).await.unwrap_err().code(), Code::Internal);
    }

    #[test]
    fn results_land_in_their_slot_once() {
        let slots = Mutex::new(vec![None, None]);
        let result = |order| OrderedKVPair {
            key: OrderedKey { key: json!("k"), value: order },
            value: json!(3),
        };
        store_result(&slots, result(1)).unwrap();
        assert_eq!(store_result(&slots, result(1)).unwrap_err().code(), Code::Internal);
        assert_eq!(store_result(&slots, result(2)).unwrap_err().code(), Code::Internal);
        assert_eq!(lock(&slots)[1], Some(KVPair::new("k", 3)));
    }

    #[test]
    fn results_arriving_in_reverse_keep_group_order() {
        let slots = Mutex::new(vec![None; 5]);
        for order in (0..5).rev() {
            let result = OrderedKVPair {
                key: OrderedKey { key: json!(format!("k{order}")), value: order },
                value: json!(order * 10),
            };
            store_result(&slots, result).unwrap();
        }
        let output = assemble_output(std::mem::take(&mut *lock(&slots))).unwrap();
        let expected: Vec<KVPair> = (0..5).map(|i| KVPair::new(format!("k{i}"), i * 10)).collect();
        assert_eq!(output, expected);
    }

    #[test]
    fn missing_result_is_internal() {
        let slots = vec![Some(KVPair::new("a", 1)), None];
        let err = assemble_output(slots).unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(err.to_string().contains("group 1"));
    }

    #[tokio::test]
    async fn bad_result_fails_the_task_while_programs_still_run() {
        use std::time::{Duration, Instant};
        use tokio::io::AsyncWriteExt;
        use tokio::net::UnixStream;

        let root = std::env::temp_dir().join(format!("reducer_test_bad_{}", uuid::Uuid::new_v4()));
        let config = Arc::new(crate::config::Config {
            listen_addr: "127.0.0.1:0".to_string(),
            socket_dir: root.join("sock"),
            program_dir: root.join("bin"),
            mappers_dir: root.join("mappers").display().to_string(),
            max_subprocesses: 2,
            ipc_retry_base: Duration::from_millis(50),
            result_grace: Duration::from_secs(5),
            output_bucket: "reducers".to_string(),
        });

        // sockets de entrada falsos: los programas solo duermen
        let _inputs: Vec<IpcEndpoint> = (0..4)
            .map(|i| IpcEndpoint::bind(config.socket_dir.join(input_socket_name(i))).unwrap())
            .collect();

        let result_socket = config.socket_dir.join(REDUCE_SOCKET);
        let writer = tokio::spawn(async move {
            for _ in 0..500 {
                if let Ok(mut s) = UnixStream::connect(&result_socket).await {
                    s.write_all(b"{garbage").await.unwrap();
                    s.shutdown().await.unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let partition = KVPairArray {
            pairs: (0..4).map(|i| KVPair::new(format!("k{i}"), 1)).collect(),
        };
        let input = LineReader::from_bytes(serde_json::to_vec(&partition).unwrap());
        let task = TaskPayload {
            id: format!("{JOB}-r-0"),
            task_type: common::TaskType::Reducer,
            n_reducers: None,
            program: Some(common::Program {
                name: "sleepy".to_string(),
                content: b"#!/bin/sh\nexec sleep 10\n".to_vec(),
            }),
            input_data: vec![],
            object_storage_creds: None,
            output_storage_info: None,
        };

        let mut reducer = Reducer::new(config);
        let started = Instant::now();
        let err = reducer.handle_task(&task, vec![input]).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
        writer.await.unwrap();
    }

    #[test]
    fn output_targets() {
        let t = output_target("http://minio:9000/results", None, "reducers", JOB, 2).unwrap();
        assert_eq!(
            t,
            OutputTarget::ObjectStore {
                endpoint_url: "http://minio:9000".to_string(),
                object: format!("results/{JOB}/2.json"),
            }
        );
        assert_eq!(t.location(), format!("http://minio:9000/results/{JOB}/2.json"));

        let t = output_target("minio:9000", Some(true), "reducers", JOB, 0).unwrap();
        assert_eq!(t.location(), format!("https://minio:9000/reducers/{JOB}/0.json"));

        let t = output_target("/data/out/", None, "reducers", JOB, 1).unwrap();
        assert_eq!(
            t,
            OutputTarget::Local {
                path: format!("/data/out/{JOB}/1.json")
            }
        );

        assert_eq!(
            output_target("  ", None, "reducers", JOB, 0).unwrap_err().code(),
            Code::InvalidArgument
        );
    }

    #[tokio::test]
    async fn malformed_task_id_is_invalid() {
        let mut reducer = Reducer::new(Arc::new(crate::config::Config::from_lookup(|_| None)));
        let task = TaskPayload {
            id: "not-a-reducer".to_string(),
            task_type: common::TaskType::Reducer,
            n_reducers: None,
            program: None,
            input_data: vec![],
            object_storage_creds: None,
            output_storage_info: None,
        };
        let err = reducer.persist_output_data(&task).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }
}
