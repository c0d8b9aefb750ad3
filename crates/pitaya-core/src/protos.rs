//! Wire envelope types.
//!
//! These mirror the framework's request/response messages. They are plain
//! serde types so the transport can carry them in any envelope; this crate
//! encodes them with `serde_json`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Whether a request came through a frontend session or from a peer server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcType {
    /// Session-bound request forwarded by a frontend.
    Sys,
    /// Server-to-server remote call.
    User,
}

impl std::fmt::Display for RpcType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcType::Sys => write!(f, "sys"),
            RpcType::User => write!(f, "user"),
        }
    }
}

/// Inbound request, already decoded from the transport envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub rpc_type: RpcType,
    /// `svc.method` or `type.svc.method`.
    pub route: String,
    /// Encoded handler argument.
    #[serde(default)]
    pub data: Vec<u8>,
    /// Encoded [`SessionData`]; only meaningful for [`RpcType::Sys`].
    #[serde(default)]
    pub session: Vec<u8>,
    #[serde(default, rename = "frontendID")]
    pub frontend_id: String,
}

/// Outbound response. Exactly one of `data`/`error` is meaningful.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Error {
    pub code: String,
    pub msg: String,
}

impl Response {
    pub fn ok(data: Vec<u8>) -> Self {
        Self { data, error: None }
    }

    pub fn error(code: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            data: Vec::new(),
            error: Some(Error {
                code: code.into(),
                msg: msg.into(),
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Serialize into envelope bytes.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl Request {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Session state as carried between frontend and backend servers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub id: i64,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl SessionData {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A message pushed to a connected user through its frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Push {
    pub route: String,
    pub uid: String,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KickMsg {
    #[serde(rename = "userId")]
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KickAnswer {
    pub kicked: bool,
}
