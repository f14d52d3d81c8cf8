use std::error::Error;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{
    local::LocalChannel,
    protocol::{Reply, Request, RequestEnvelope, ResponseEnvelope},
};

/// Answers requests read line by line from `reader` until end of input or a
/// [`Request::Shutdown`].
pub async fn serve<R, W>(reader: R, mut writer: W, channel: &LocalChannel) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.context("Failed to read request")? {
        if line.trim().is_empty() {
            continue;
        }
        let envelope: RequestEnvelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(line, error = &e as &dyn Error, "Dropping malformed request");
                continue;
            }
        };

        let id = envelope.id;
        let shutdown = matches!(envelope.request, Request::Shutdown);
        debug!(id, op = envelope.request.name(), "Handling request");
        let result = if shutdown {
            Ok(Reply::Unit)
        } else {
            channel.handle(envelope.request).await.map_err(|e| format!("{e:#}"))
        };

        let mut out = serde_json::to_string(&ResponseEnvelope { id, result })?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await.context("Failed to write response")?;
        writer.flush().await?;

        if shutdown {
            info!("Shutdown requested");
            break;
        }
    }
    Ok(())
}
