//! `pitaya serve` — Dispatch JSON-line requests from stdin.
//!
//! Each input line is one request:
//!
//! ```text
//! {"id": 1, "type": "user", "route": "room.room.join", "args": "hello"}
//! {"type": "sys", "route": "room.join", "session": {"id": 42}}
//! ```
//!
//! Requests are dispatched concurrently, so replies are written in
//! completion order, one JSON line each. Every reply carries the 1-based
//! `line` it answers; replies to lines that set an `id` echo it back as-is.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pitaya_core::{
    ChannelDelivery, Metrics, PitayaConfig, RequestHandle, ResponseDelivery, Response,
    CODE_INTERNAL,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::{init_dispatcher, response_json, CallLine};

/// What is left once the input is exhausted.
pub struct Served<W> {
    pub writer: W,
    pub metrics: Option<Arc<Metrics>>,
}

pub async fn run(config: &PitayaConfig, print_metrics: bool) -> Result<(), String> {
    tracing::info!(
        "[Serve] Server {} ({}) reading requests from stdin",
        config.server.id,
        config.server.kind
    );
    let reader = BufReader::new(tokio::io::stdin());
    let served = serve_lines(config, reader, tokio::io::stdout()).await?;
    tracing::info!("[Serve] Input closed, all requests answered");

    if print_metrics {
        if let Some(metrics) = served.metrics {
            eprint!("{}", metrics.export_prometheus().await);
        }
    }
    Ok(())
}

/// Dispatch every line of `reader` and write the replies to `writer`.
///
/// Returns once the input is exhausted and every request has been
/// answered.
pub async fn serve_lines<R, W>(
    config: &PitayaConfig,
    reader: R,
    writer: W,
) -> Result<Served<W>, String>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (delivery, mut rx) = ChannelDelivery::channel();
    let dispatcher = init_dispatcher(Arc::new(delivery.clone()))?;
    let metrics = dispatcher.metrics().cloned();

    // Handles are line numbers; client ids live beside them so two lines can
    // never share a handle.
    let client_ids: Arc<Mutex<HashMap<u64, Option<u64>>>> = Arc::default();

    let output = {
        let client_ids = Arc::clone(&client_ids);
        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(delivered) = rx.recv().await {
                let response = match delivered.decode() {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::error!(
                            "[Serve] Undecodable response for {}: {}",
                            delivered.handle,
                            e
                        );
                        continue;
                    }
                };
                let line_no = delivered.handle.id();
                let id = client_ids
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&line_no)
                    .flatten();
                let mut value = response_json(id, &response);
                value["line"] = serde_json::json!(line_no);

                let mut line = value.to_string();
                line.push('\n');
                writer
                    .write_all(line.as_bytes())
                    .await
                    .map_err(|e| format!("Failed to write reply: {}", e))?;
                writer
                    .flush()
                    .await
                    .map_err(|e| format!("Failed to flush reply: {}", e))?;
            }
            Ok::<W, String>(writer)
        })
    };

    let mut lines = reader.lines();
    let mut line_no: u64 = 0;
    while let Some(raw) = lines
        .next_line()
        .await
        .map_err(|e| format!("Failed to read input: {}", e))?
    {
        line_no += 1;
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        let handle = RequestHandle::new(line_no);
        let call = serde_json::from_str::<CallLine>(raw)
            .map_err(|e| format!("invalid request line: {}", e));
        let client_id = call.as_ref().ok().and_then(|line| line.id);
        client_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(line_no, client_id);

        match call.and_then(|line| line.into_request(&config.server.id)) {
            Ok(request) => {
                tracing::debug!("[Serve] {} -> {}", handle, request.route);
                // Not awaited: the next line is read while this one runs.
                dispatcher.spawn(handle, request);
            }
            Err(msg) => {
                tracing::warn!("[Serve] Rejected {}: {}", handle, msg);
                let reply = Response::error(CODE_INTERNAL, msg)
                    .encode()
                    .map_err(|e| e.to_string())?;
                delivery
                    .deliver(handle, reply)
                    .map_err(|e| format!("Failed to queue reply: {}", e))?;
            }
        }
    }

    // The channel closes once the last in-flight dispatch has delivered.
    drop(dispatcher);
    drop(delivery);
    let writer = output
        .await
        .map_err(|e| format!("Reply writer failed: {}", e))??;
    Ok(Served { writer, metrics })
}
