//! Reduce program: answers with the number of values in one key group.
//!
//! Usage: `count-reduce <order>`. The group arrives on `MR_INPUT_SOCKET`, the
//! count is written to `MR_RESULT_SOCKET`. `MR_DEMO_JITTER_MS` delays the
//! answer, longest for the first groups, so results arrive out of order.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use common::ipc::{send_payload, IpcEndpoint, INPUT_SOCKET_ENV, RESULT_SOCKET_ENV};
use common::{OrderedKVPair, OrderedKey};
use serde_json::Value;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let order: usize = env::args()
        .nth(1)
        .context("usage: count-reduce <order>")?
        .parse()
        .context("order must be a number")?;
    let input = PathBuf::from(env::var(INPUT_SOCKET_ENV).context(INPUT_SOCKET_ENV)?);
    let output = PathBuf::from(env::var(RESULT_SOCKET_ENV).context(RESULT_SOCKET_ENV)?);

    let endpoint = IpcEndpoint::bind(input)?;
    let group: OrderedKVPair = endpoint.accept_payload().await?;
    drop(endpoint);
    if group.key.value != order {
        bail!("received group {} while running as {}", group.key.value, order);
    }

    let count = match group.value {
        Value::Array(values) => values.len(),
        _ => 1,
    };

    if let Some(max) = env::var("MR_DEMO_JITTER_MS").ok().and_then(|v| v.parse::<u64>().ok()) {
        tokio::time::sleep(Duration::from_millis(max / (order as u64 + 1))).await;
    }

    let result = OrderedKVPair {
        key: OrderedKey {
            key: group.key.key,
            value: order,
        },
        value: Value::from(count),
    };
    send_payload(&output, &result).await?;
    Ok(())
}
