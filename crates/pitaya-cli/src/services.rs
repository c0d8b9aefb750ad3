//! Demo services served by the CLI host.
//!
//! A small `room` service with a system handler and a remote on the same
//! name, plus the `connector.remoteFunc` remote peers call for smoke tests.

use std::sync::Arc;

use pitaya_core::{
    CustomMetrics, HandlerError, HandlerRegistryBuilder, JsonCodec, MetricSpec, Metrics,
    RegistryError, Session,
};
use serde::{Deserialize, Serialize};

/// Counter of remote joins, labelled by room.
pub const ROOM_JOINS: &str = "joins";

/// Argument of the `room.push` system handler.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushArgs {
    /// Bind the session to this uid first when it is not bound yet.
    #[serde(default)]
    pub uid: Option<String>,
    pub route: String,
    #[serde(default)]
    pub msg: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteReply {
    pub msg: String,
}

/// Metrics the demo services record into.
pub fn custom_metrics() -> CustomMetrics {
    let mut custom = CustomMetrics::new();
    custom.add_counter(MetricSpec::new(
        "pitaya",
        "room",
        ROOM_JOINS,
        "Remote joins by room",
        &["room"],
    ));
    custom
}

pub fn register(
    builder: &mut HandlerRegistryBuilder<JsonCodec>,
    metrics: Arc<Metrics>,
) -> Result<(), RegistryError> {
    builder
        .remote_with_arg("room.join", move |name: String| {
            let metrics = metrics.clone();
            async move {
                if let Err(e) = metrics.inc_counter(ROOM_JOINS, &[name.as_str()]).await {
                    tracing::warn!("[Room] Failed to count join: {}", e);
                }
                Ok(format!("joined:{}", name))
            }
        })?
        .handler("room.join", |session: Session| async move {
            tracing::info!(
                "[Room] Session {} joined from {}",
                session.id(),
                session.frontend_id()
            );
            Ok(())
        })?
        .handler_with_arg("room.push", push)?
        .remote_with_arg("connector.remoteFunc", |message: Vec<u8>| async move {
            let msg = String::from_utf8_lossy(&message).into_owned();
            tracing::info!("[Connector] Received remote call: {}", msg);
            Ok(RemoteReply { msg })
        })?;
    Ok(())
}

async fn push(mut session: Session, args: PushArgs) -> Result<(), HandlerError> {
    if session.uid().is_empty() {
        let uid = args
            .uid
            .ok_or_else(|| HandlerError::new("session is not bound and no uid was given"))?;
        session
            .bind(uid)
            .await
            .map_err(|e| HandlerError::from(e).context("bind failed"))?;
    }
    let data = serde_json::to_vec(&args.msg)?;
    session
        .push(args.route, data)
        .await
        .map_err(|e| HandlerError::from(e).context("push failed"))?;
    Ok(())
}
