//! Error types for the dispatch layer.
//!
//! `DispatchError` covers everything that can go wrong between receiving a
//! request and producing its response; it maps onto the two wire codes the
//! protocol exposes. `HandlerError` is what handler code returns.

use std::fmt;

use crate::codec::CodecError;
use crate::protos::{self, RpcType};
use crate::route::RouteError;

/// Handler or remote not found for the resolved route.
pub const CODE_NOT_FOUND: &str = "PIT-404";
/// Malformed route, undecodable argument or session, handler failure, or
/// unencodable result.
pub const CODE_INTERNAL: &str = "PIT-500";

// ---------------------------------------------------------------------------
// HandlerError
// ---------------------------------------------------------------------------

/// Failure returned by a handler, with an explicit cause chain.
///
/// `chain[0]` is the outermost context, the last element is the root cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    chain: Vec<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            chain: vec![message.into()],
        }
    }

    /// Capture an error together with its `source()` chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = vec![err.to_string()];
        let mut current = err.source();
        while let Some(cause) = current {
            chain.push(cause.to_string());
            current = cause.source();
        }
        Self { chain }
    }

    /// Wrap this error in an outer layer of context.
    pub fn context(mut self, message: impl Into<String>) -> Self {
        self.chain.insert(0, message.into());
        self
    }

    pub fn message(&self) -> &str {
        self.chain.first().map(String::as_str).unwrap_or_default()
    }

    pub fn root_cause(&self) -> &str {
        self.chain.last().map(String::as_str).unwrap_or_default()
    }

    pub fn chain(&self) -> &[String] {
        &self.chain
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.chain.join(": "))
    }
}

impl std::error::Error for HandlerError {}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::from_error(&err)
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self::from_error(&err)
    }
}

impl From<RpcClientError> for HandlerError {
    fn from(err: RpcClientError) -> Self {
        Self::from_error(&err)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

// ---------------------------------------------------------------------------
// DispatchError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    MalformedRoute(#[from] RouteError),

    #[error("{} not found! {} name: {name}", kind_noun(.kind), kind_noun(.kind))]
    HandlerNotFound { kind: RpcType, name: String },

    #[error("handler {handler} requires a session but the request carried none")]
    MissingSession { handler: String },

    #[error("failed to decode session for {handler}: {source}")]
    Session {
        handler: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode argument for {handler}: {source}")]
    Decode {
        handler: String,
        #[source]
        source: CodecError,
    },

    #[error("handler {handler} failed: {source}")]
    Invocation {
        handler: String,
        source: HandlerError,
    },

    #[error("failed to encode result of {handler}: {source}")]
    Encode {
        handler: String,
        #[source]
        source: CodecError,
    },
}

fn kind_noun(kind: &RpcType) -> &'static str {
    match kind {
        RpcType::Sys => "handler",
        RpcType::User => "remote",
    }
}

impl DispatchError {
    /// The wire error code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::HandlerNotFound { .. } => CODE_NOT_FOUND,
            _ => CODE_INTERNAL,
        }
    }

    /// Message sent back to the caller: the root cause only.
    pub fn client_message(&self) -> String {
        match self {
            DispatchError::HandlerNotFound { .. } => self.to_string(),
            DispatchError::Invocation { source, .. } => source.root_cause().to_string(),
            _ => root_cause(self).to_string(),
        }
    }

    /// Every layer of the failure, outermost first. Server-side logging only.
    pub fn cause_chain(&self) -> Vec<String> {
        match self {
            DispatchError::Invocation { handler, source } => {
                let mut chain = vec![format!("handler {} failed", handler)];
                chain.extend(source.chain().iter().cloned());
                chain
            }
            _ => {
                let mut chain = Vec::new();
                let mut current: Option<&(dyn std::error::Error + 'static)> = Some(self);
                while let Some(err) = current {
                    chain.push(err.to_string());
                    current = err.source();
                }
                chain
            }
        }
    }

    pub fn to_response(&self) -> protos::Response {
        protos::Response::error(self.code(), self.client_message())
    }
}

fn root_cause<'a>(err: &'a (dyn std::error::Error + 'static)) -> &'a (dyn std::error::Error + 'static) {
    let mut current = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current
}

// ---------------------------------------------------------------------------
// Registration, delivery and collaborator errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate {kind} handler: {name}")]
    DuplicateHandler { kind: RpcType, name: String },

    #[error("invalid handler name '{0}': expected service.method")]
    InvalidName(String),

    #[error("calling convention of {name} does not belong to {kind} namespace")]
    ConventionMismatch { kind: RpcType, name: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("response channel closed")]
    ChannelClosed,

    #[error("failed to encode response envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("transport rejected response: {0}")]
    Transport(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RpcClientError {
    #[error("session is already bound to uid {0}")]
    AlreadyBound(String),

    #[error("session is not bound to a user")]
    NotBound,

    #[error("failed to encode session: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("rpc to {target} failed: {message}")]
    Remote { target: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Route;

    #[derive(Debug, thiserror::Error)]
    #[error("database unavailable")]
    struct DbDown;

    #[derive(Debug, thiserror::Error)]
    #[error("loading player")]
    struct LoadPlayer(#[source] DbDown);

    #[test]
    fn test_handler_error_chain_from_source() {
        let err = HandlerError::from_error(&LoadPlayer(DbDown)).context("join room");
        assert_eq!(err.message(), "join room");
        assert_eq!(err.root_cause(), "database unavailable");
        assert_eq!(err.to_string(), "join room: loading player: database unavailable");
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let err = DispatchError::HandlerNotFound {
            kind: RpcType::User,
            name: "room.join".to_string(),
        };
        assert_eq!(err.code(), CODE_NOT_FOUND);
        let resp = err.to_response();
        let wire = resp.error.unwrap();
        assert_eq!(wire.code, "PIT-404");
        assert_eq!(wire.msg, "remote not found! remote name: room.join");
    }

    #[test]
    fn test_invocation_reports_root_cause_only() {
        let err = DispatchError::Invocation {
            handler: "room.join".to_string(),
            source: HandlerError::new("room is full").context("join failed"),
        };
        assert_eq!(err.code(), CODE_INTERNAL);
        assert_eq!(err.client_message(), "room is full");
        assert_eq!(
            err.cause_chain(),
            vec!["handler room.join failed", "join failed", "room is full"]
        );
    }

    #[test]
    fn test_malformed_route_is_internal() {
        let err: DispatchError = Route::parse("nope").unwrap_err().into();
        assert_eq!(err.code(), CODE_INTERNAL);
        assert!(err.client_message().contains("malformed route"));
    }
}
