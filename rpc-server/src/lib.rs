//! JSON-RPC 2.0 line server over stdin/stdout.
#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::io::Result as IoResult;
use std::sync::Arc;

use drydock_core::AppContext;
use drydock_core::session::Store;
use drydock_core::util::notify_on_sigint;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::{self};
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;

mod message_processor;
mod rpc;

use crate::message_processor::MessageProcessor;

/// Size of the bounded response channel. Interactive callers issue a
/// handful of requests at a time; 128 leaves plenty of slack for bursts
/// of polls.
const CHANNEL_CAPACITY: usize = 128;

/// Serve JSON-RPC over stdio until stdin hits EOF. Stdout carries only
/// protocol lines; logging goes to stderr via tracing.
pub async fn run_main(ctx: AppContext) -> IoResult<()> {
    let ctx = Arc::new(ctx);
    let store = Arc::new(Store::from_ctx(&ctx));
    let interrupt = notify_on_sigint();
    info!(
        "drydock {} serving on stdio, sessions in {:?}",
        ctx.version, ctx.session_root
    );

    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let processor = Arc::new(MessageProcessor::new(
        ctx,
        store,
        outgoing_tx,
        interrupt,
    ));

    // Task: read one request per line from stdin. Handlers are spawned by
    // the processor, so a slow submit never stalls this loop.
    let stdin_reader_handle = tokio::spawn(async move {
        let stdin = io::stdin();
        let reader = BufReader::new(stdin);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            Arc::clone(&processor).process_line(line);
        }
        debug!("stdin reader finished (EOF)");
        // Dropping the processor here releases the last response sender
        // once in-flight handlers complete, which ends the writer task.
    });

    // Task: write responses to stdout, one per line.
    let stdout_writer_handle = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(line) = outgoing_rx.recv().await {
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                error!("failed to write to stdout: {e}");
                break;
            }
            if let Err(e) = stdout.write_all(b"\n").await {
                error!("failed to write newline to stdout: {e}");
                break;
            }
            if let Err(e) = stdout.flush().await {
                error!("failed to flush stdout: {e}");
                break;
            }
        }
        info!("stdout writer exited (channel closed)");
    });

    let _ = tokio::join!(stdin_reader_handle, stdout_writer_handle);
    Ok(())
}
