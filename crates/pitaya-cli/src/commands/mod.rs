//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command. All of them go
//! through a [`Dispatcher`] built by [`init_dispatcher`], so the CLI
//! exercises exactly the code path a real transport would.

pub mod call;
pub mod routes;
pub mod serve;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pitaya_core::protos::SessionData;
use pitaya_core::{
    Dispatcher, HandlerRegistryBuilder, JsonCodec, LoggingRpcClient, Metrics, PitayaConfig,
    Request, Response, ResponseDelivery, RpcType,
};
use serde::Deserialize;

use crate::services;

/// The config file to load: `explicit` if given, else `<PREFIX>_CONFIG`.
pub fn config_path<F>(explicit: Option<PathBuf>, env_prefix: &str, var: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<OsString>,
{
    explicit.or_else(|| {
        var(&format!("{}_CONFIG", env_prefix.to_ascii_uppercase())).map(PathBuf::from)
    })
}

/// Load configuration, exiting the process when it cannot be read.
pub fn load_config(path: Option<&Path>, env_prefix: &str) -> PitayaConfig {
    PitayaConfig::load(path, env_prefix).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::process::exit(1);
    })
}

/// Build a dispatcher over the demo services that delivers through
/// `delivery` and records into a fresh [`Metrics`].
pub fn init_dispatcher(delivery: Arc<dyn ResponseDelivery>) -> Result<Dispatcher, String> {
    let metrics = Metrics::with_custom(services::custom_metrics())
        .map_err(|e| format!("Failed to declare metrics: {}", e))?;
    let metrics = Arc::new(metrics);

    let mut builder = HandlerRegistryBuilder::new();
    services::register(&mut builder, metrics.clone())
        .map_err(|e| format!("Failed to register services: {}", e))?;
    Ok(Dispatcher::new(
        builder.build(),
        JsonCodec,
        Arc::new(LoggingRpcClient),
        delivery,
    )
    .with_metrics(metrics))
}

/// One request as written on the command line or a `serve` input line.
///
/// `args` and `session` are plain JSON; they are encoded into the request
/// envelope the same way a frontend would.
#[derive(Debug, Clone, Deserialize)]
pub struct CallLine {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(rename = "type")]
    pub rpc_type: RpcType,
    pub route: String,
    #[serde(default)]
    pub args: Option<serde_json::Value>,
    #[serde(default)]
    pub session: Option<serde_json::Value>,
    #[serde(default, rename = "frontendID")]
    pub frontend_id: Option<String>,
}

impl CallLine {
    pub fn into_request(self, server_id: &str) -> Result<Request, String> {
        let data = match self.args {
            Some(args) => {
                serde_json::to_vec(&args).map_err(|e| format!("Invalid args: {}", e))?
            }
            None => Vec::new(),
        };
        let session = match self.session {
            Some(value) => {
                let session: SessionData = serde_json::from_value(value)
                    .map_err(|e| format!("Invalid session: {}", e))?;
                session
                    .encode()
                    .map_err(|e| format!("Invalid session: {}", e))?
            }
            None => Vec::new(),
        };
        Ok(Request {
            rpc_type: self.rpc_type,
            route: self.route,
            data,
            session,
            frontend_id: self.frontend_id.unwrap_or_else(|| server_id.to_string()),
        })
    }
}

/// Render a response for humans and scripts: the payload is decoded back
/// into JSON when it is JSON, and shown as raw bytes otherwise.
pub fn response_json(id: Option<u64>, response: &Response) -> serde_json::Value {
    let mut value = serde_json::json!({});
    if let Some(id) = id {
        value["id"] = serde_json::json!(id);
    }
    match &response.error {
        Some(error) => {
            value["error"] = serde_json::json!({ "code": error.code, "msg": error.msg });
        }
        None if response.data.is_empty() => {
            value["data"] = serde_json::Value::Null;
        }
        None => {
            value["data"] = serde_json::from_slice(&response.data)
                .unwrap_or_else(|_| serde_json::json!(response.data));
        }
    }
    value
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}
