//! Pitaya Core — in-process RPC dispatch for a clustered game server.
//!
//! Once a request has reached this node and been decoded from its envelope,
//! this crate routes it to a locally registered handler and produces the
//! response. It has **no transport dependency**: the runtime that receives
//! bytes off the wire hands requests to a [`Dispatcher`] and gets responses
//! back through a [`ResponseDelivery`] implementation.
//!
//! - [`route`] — `[serverType.]service.method` parsing
//! - [`registry`] — system handlers and remotes, frozen at startup
//! - [`codec`] — argument/result serialization strategy
//! - [`session`] — per-request session and the cluster RPC client
//! - [`dispatcher`] — lookup, decode, invoke, encode, error translation
//! - [`delivery`] — exactly-once response hand-off
//! - [`metrics`] — request counters, latency histograms, custom metrics

pub mod codec;
pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod protos;
pub mod registry;
pub mod route;
pub mod session;

// Convenience re-exports
pub use codec::{Codec, CodecError, JsonCodec};
pub use config::{ConfigError, LogFormat, PitayaConfig, ServerInfo};
pub use delivery::{ChannelDelivery, Delivered, RequestHandle, ResponseDelivery};
pub use dispatcher::Dispatcher;
pub use error::{
    DeliveryError, DispatchError, HandlerError, RegistryError, RpcClientError, CODE_INTERNAL,
    CODE_NOT_FOUND,
};
pub use metrics::{CustomMetrics, MetricSpec, Metrics, MetricsError};
pub use protos::{Request, Response, RpcType};
pub use registry::{HandlerDescriptor, HandlerRegistry, HandlerRegistryBuilder, ReturnType};
pub use route::{Route, RouteError};
pub use session::{LoggingRpcClient, RpcClient, Session};
