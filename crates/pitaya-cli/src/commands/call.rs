//! `pitaya call` — Dispatch a single request and print the reply.

use std::sync::Arc;

use pitaya_core::{ChannelDelivery, PitayaConfig, RequestHandle, RpcType};

use super::{init_dispatcher, print_json, response_json, CallLine};

pub async fn run(
    config: &PitayaConfig,
    rpc_type: RpcType,
    route: &str,
    args: Option<&str>,
    session: Option<&str>,
) -> Result<(), String> {
    let args = args
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .map_err(|e| format!("Invalid JSON args: {}", e))?;
    let session = session
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .map_err(|e| format!("Invalid JSON session: {}", e))?;
    let line = CallLine {
        id: None,
        rpc_type,
        route: route.to_string(),
        args,
        session,
        frontend_id: None,
    };

    let value = call(config, line).await?;
    print_json(&value);
    Ok(())
}

/// Dispatch `line` and wait for its delivered response.
pub async fn call(config: &PitayaConfig, line: CallLine) -> Result<serde_json::Value, String> {
    let (delivery, mut rx) = ChannelDelivery::channel();
    let dispatcher = init_dispatcher(Arc::new(delivery))?;

    let id = line.id;
    let request = line.into_request(&config.server.id)?;
    dispatcher.spawn(RequestHandle::new(id.unwrap_or(0)), request);

    let delivered = rx
        .recv()
        .await
        .ok_or_else(|| "Dispatcher finished without a response".to_string())?;
    let response = delivered
        .decode()
        .map_err(|e| format!("Invalid response envelope: {}", e))?;
    Ok(response_json(id, &response))
}
