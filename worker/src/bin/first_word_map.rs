//! Map program: emits `(first word, line)` for the line it is given.
//!
//! Usage: `first-word-map <lineNumber> <lineText>`, results go to the socket
//! named by `MR_RESULT_SOCKET`.

use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use common::ipc::{send_payload, RESULT_SOCKET_ENV};
use common::{KVPair, KVPairArray};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() != 2 {
        bail!("usage: first-word-map <lineNumber> <lineText>");
    }
    let socket = PathBuf::from(env::var(RESULT_SOCKET_ENV).context(RESULT_SOCKET_ENV)?);

    let pairs = match args[1].split_whitespace().next() {
        Some(word) => vec![KVPair::new(word, args[1].as_str())],
        None => Vec::new(),
    };
    send_payload(&socket, &KVPairArray { pairs }).await?;
    Ok(())
}
