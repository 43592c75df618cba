use askbridge_core::mcp::{McpService, Reply};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound messages queued per writer; a slow reader pauses live streams here.
const OUTBOX: usize = 64;

pub async fn run(service: McpService) -> anyhow::Result<()> {
    info!("serving JSON-RPC on stdio");
    serve_lines(service, tokio::io::stdin(), tokio::io::stdout()).await
}

/// One task per inbound line; a single writer task owns `output` so frames
/// from concurrent requests never interleave mid-line.
pub async fn serve_lines<R, W>(service: McpService, input: R, output: W) -> anyhow::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Value>(OUTBOX);
    let writer = tokio::spawn(write_messages(rx, output));

    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let svc = service.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = svc.handle_text(&line, true).await;
            relay(reply, &tx).await;
        });
    }
    debug!("stdin closed, waiting for in-flight requests");
    // writer finishes once every request task has dropped its sender
    drop(tx);
    writer.await?
}

async fn relay(reply: Reply, tx: &mpsc::Sender<Value>) {
    match reply {
        Reply::None => {}
        Reply::Single(msg) => {
            if tx.send(msg).await.is_err() {
                warn!("output closed before reply was written");
            }
        }
        Reply::Live {
            rpc_id,
            progress_token,
            mut events,
        } => {
            while let Some(ev) = events.next().await {
                // Done is implicit on stdio
                let Some(msg) = ev.envelope(&rpc_id, &progress_token) else {
                    break;
                };
                if tx.send(msg).await.is_err() {
                    warn!("output closed mid-stream");
                    break;
                }
            }
        }
    }
}

async fn write_messages<W>(mut rx: mpsc::Receiver<Value>, mut output: W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let mut line = serde_json::to_vec(&msg)?;
        line.push(b'\n');
        output.write_all(&line).await?;
        output.flush().await?;
    }
    Ok(())
}
