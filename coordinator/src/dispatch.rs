//! Coordinator side of the task dispatch protocol.

use async_trait::async_trait;
use common::protocol::TASKS_ROUTE;
use common::{Error, Result, TaskPayload, TaskStatusInfo};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::StatusCode;
use tracing::debug;

pub type StatusStream = BoxStream<'static, Result<TaskStatusInfo>>;

#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Hands `payload` to the worker at `target` (`host:port`) and returns
    /// its status updates as they arrive.
    async fn start_task(&self, target: &str, payload: &TaskPayload) -> Result<StatusStream>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpWorkerClient {
    http: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

fn http_error(target: &str, e: reqwest::Error) -> Error {
    Error::internal(format!("{target}: {e}"))
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn start_task(&self, target: &str, payload: &TaskPayload) -> Result<StatusStream> {
        let url = format!("http://{}{}", target, TASKS_ROUTE);
        let resp = self
            .http
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| http_error(target, e))?;

        match resp.status() {
            s if s.is_success() => {}
            StatusCode::CONFLICT => {
                return Err(Error::internal(format!("{target} is busy with another task")));
            }
            s => {
                let body = resp.text().await.unwrap_or_default();
                return Err(Error::internal(format!("{target} answered {s}: {body}")));
            }
        }
        debug!("task {} accepted by {}", payload.id, target);

        let target = target.to_string();
        let body = resp.bytes_stream().map(move |chunk| chunk.map_err(|e| http_error(&target, e)));
        Ok(ndjson_statuses(body))
    }
}

fn decode_line(line: &[u8]) -> Option<Result<TaskStatusInfo>> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(serde_json::from_slice(line).map_err(Error::from))
}

/// Splits a chunked body into newline-delimited status records.
pub fn ndjson_statuses<S, B>(body: S) -> StatusStream
where
    S: futures::Stream<Item = Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = (body.boxed(), Vec::<u8>::new(), false);
    stream::unfold(state, |(mut body, mut buf, mut done)| async move {
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                match decode_line(&line[..pos]) {
                    Some(item) => return Some((item, (body, buf, done))),
                    None => continue,
                }
            }
            if done {
                let rest = std::mem::take(&mut buf);
                return decode_line(&rest).map(|item| (item, (body, buf, true)));
            }
            match body.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    buf.clear();
                    return Some((Err(e), (body, buf, true)));
                }
                None => done = true,
            }
        }
    })
    .boxed()
}
